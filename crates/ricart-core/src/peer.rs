//! A process taking part in a peer group.
//!
//! A [`Peer`] owns the skeleton that serves its RPC surface and its identity
//! with the name service. Start-up happens in two steps so the owner can be
//! built with the id the name service hands out:
//!
//! 1. [`Peer::bind`] resolves the external address and binds the listener.
//!    Connections arriving now wait in the listen backlog.
//! 2. [`Peer::register`] obtains the id, then [`Peer::serve`] starts
//!    dispatching onto the owner. [`Peer::start`] does both.

use crate::name_service::{Identity, NameServiceClient};
use crate::skeleton::{Dispatch, Skeleton, SkeletonHandle};
use crate::{OrbError, PeerId, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Address book entry for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHandle {
    pub id: PeerId,
    pub address: SocketAddr,
    #[serde(rename = "type")]
    pub ptype: String,
}

impl PeerHandle {
    pub fn new(id: PeerId, address: SocketAddr, ptype: impl Into<String>) -> Self {
        Self {
            id,
            address,
            ptype: ptype.into(),
        }
    }
}

enum Listener {
    Bound(Skeleton),
    Running(SkeletonHandle),
    Stopped,
}

struct PeerState {
    identity: Option<Identity>,
    listener: Listener,
}

/// Skeleton plus name-service identity of one peer.
pub struct Peer {
    ptype: String,
    address: SocketAddr,
    name_service: NameServiceClient,
    state: Mutex<PeerState>,
}

impl Peer {
    /// Resolve the external address for `local` (`host:port`) and bind to it.
    ///
    /// An empty host means the host name of this machine. Port 0 picks a free
    /// port; the advertised address carries the bound port.
    pub async fn bind(ptype: &str, local: &str, name_service: SocketAddr) -> Result<Self> {
        let (host, port) = split_host_port(local)?;
        let external = resolve_external(host, port).await?;
        let skeleton = Skeleton::bind(external).await?;
        let address = skeleton.local_addr();
        info!("Peer of type {} bound to {}", ptype, address);

        Ok(Self {
            ptype: ptype.to_string(),
            address,
            name_service: NameServiceClient::new(name_service),
            state: Mutex::new(PeerState {
                identity: None,
                listener: Listener::Bound(skeleton),
            }),
        })
    }

    pub fn ptype(&self) -> &str {
        &self.ptype
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn name_service(&self) -> NameServiceClient {
        self.name_service
    }

    /// Register with the name service. Idempotent once it has succeeded.
    pub async fn register(&self) -> Result<PeerId> {
        let mut state = self.state.lock().await;
        if let Some(identity) = &state.identity {
            return Ok(identity.id);
        }
        let identity = self.name_service.register(&self.ptype, self.address).await?;
        info!("Registered as {} peer {}", self.ptype, identity.id);
        let id = identity.id;
        state.identity = Some(identity);
        Ok(id)
    }

    /// Start dispatching incoming requests onto `owner`.
    pub async fn serve<D: Dispatch>(&self, owner: Arc<D>) -> Result<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut state.listener, Listener::Stopped) {
            Listener::Bound(skeleton) => {
                state.listener = Listener::Running(skeleton.start(owner));
                Ok(())
            }
            Listener::Running(handle) => {
                state.listener = Listener::Running(handle);
                Err(OrbError::Config {
                    message: format!("peer at {} is already serving", self.address),
                })
            }
            Listener::Stopped => Err(OrbError::Config {
                message: format!("peer at {} has been destroyed", self.address),
            }),
        }
    }

    /// Serve `owner` and register with the name service.
    pub async fn start<D: Dispatch>(&self, owner: Arc<D>) -> Result<PeerId> {
        self.serve(owner).await?;
        self.register().await
    }

    /// Unregister from the name service and stop serving.
    pub async fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let unregistered = match state.identity.take() {
            Some(identity) => {
                self.name_service
                    .unregister(identity.id, &self.ptype, &identity.hash)
                    .await
            }
            None => Ok(()),
        };
        if let Listener::Running(mut handle) = std::mem::replace(&mut state.listener, Listener::Stopped) {
            handle.shutdown();
        }
        if let Err(e) = &unregistered {
            warn!("Unregistering peer at {} failed: {}", self.address, e);
        }
        info!("Peer at {} destroyed", self.address);
        unregistered
    }

    pub async fn id(&self) -> Option<PeerId> {
        self.state.lock().await.identity.as_ref().map(|i| i.id)
    }

    /// `(id, type)` of this peer.
    pub async fn check(&self) -> Result<(PeerId, String)> {
        let id = self.id().await.ok_or(OrbError::NotRegistered)?;
        Ok((id, self.ptype.clone()))
    }

    pub async fn handle(&self) -> Result<PeerHandle> {
        let id = self.id().await.ok_or(OrbError::NotRegistered)?;
        Ok(PeerHandle::new(id, self.address, self.ptype.clone()))
    }
}

fn split_host_port(local: &str) -> Result<(&str, u16)> {
    let (host, port) = local.rsplit_once(':').ok_or_else(|| OrbError::Config {
        message: format!("expected host:port, got {:?}", local),
    })?;
    let port = port.parse::<u16>().map_err(|e| OrbError::Config {
        message: format!("invalid port in {:?}: {}", local, e),
    })?;
    Ok((host, port))
}

/// Resolve the address other peers should use to reach `host`.
pub async fn resolve_external(host: &str, port: u16) -> Result<SocketAddr> {
    let host = if host.is_empty() {
        hostname::get()
            .map_err(|e| OrbError::AddressResolution {
                host: String::new(),
                message: e.to_string(),
            })?
            .to_string_lossy()
            .into_owned()
    } else {
        host.to_string()
    };

    let candidates: Vec<IpAddr> = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| OrbError::AddressResolution {
            host: host.clone(),
            message: e.to_string(),
        })?
        .map(|addr| addr.ip())
        .collect();

    let ip = select_external(&host, &candidates)?;
    Ok(SocketAddr::new(ip, port))
}

/// Pick the external address among resolved candidates.
///
/// A single candidate is used as is. With several, the first non-loopback
/// one wins.
pub fn select_external(host: &str, candidates: &[IpAddr]) -> Result<IpAddr> {
    match candidates {
        [] => Err(OrbError::AddressResolution {
            host: host.to_string(),
            message: "no addresses".to_string(),
        }),
        [only] => Ok(*only),
        many => many
            .iter()
            .copied()
            .find(|ip| !ip.is_loopback())
            .ok_or_else(|| OrbError::AddressResolution {
                host: host.to_string(),
                message: "only loopback addresses".to_string(),
            }),
    }
}

/// Resolve a `host:port` string to one socket address.
pub async fn resolve_address(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| OrbError::AddressResolution {
            host: addr.to_string(),
            message: e.to_string(),
        })?
        .next()
        .ok_or_else(|| OrbError::AddressResolution {
            host: addr.to_string(),
            message: "no addresses".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name_service::NameServer;
    use crate::wire::RemoteFault;
    use serde_json::Value;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    struct Nothing;

    #[async_trait::async_trait]
    impl Dispatch for Nothing {
        async fn dispatch(&self, method: &str, _: Vec<Value>) -> std::result::Result<Value, RemoteFault> {
            Err(RemoteFault::attribute_error(method))
        }
    }

    #[test]
    fn test_select_single_candidate_even_loopback() {
        assert_eq!(select_external("h", &[ip("127.0.0.1")]).unwrap(), ip("127.0.0.1"));
    }

    #[test]
    fn test_select_first_non_loopback() {
        let candidates = [ip("127.0.0.1"), ip("10.0.0.5"), ip("10.0.0.6")];
        assert_eq!(select_external("h", &candidates).unwrap(), ip("10.0.0.5"));
    }

    #[test]
    fn test_select_fails_on_no_or_only_loopback() {
        assert!(matches!(
            select_external("h", &[]),
            Err(OrbError::AddressResolution { .. })
        ));
        assert!(matches!(
            select_external("h", &[ip("127.0.0.1"), ip("::1")]),
            Err(OrbError::AddressResolution { .. })
        ));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("127.0.0.1:80").unwrap(), ("127.0.0.1", 80));
        assert_eq!(split_host_port(":0").unwrap(), ("", 0));
        assert!(split_host_port("nope").is_err());
        assert!(split_host_port("h:x").is_err());
    }

    #[tokio::test]
    async fn test_peer_lifecycle() {
        let mut ns = NameServer::serve("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let peer = Peer::bind("fortune", "127.0.0.1:0", ns.addr()).await.unwrap();
        assert_ne!(peer.address().port(), 0);
        assert!(matches!(peer.check().await, Err(OrbError::NotRegistered)));

        let id = peer.start(Arc::new(Nothing)).await.unwrap();
        assert_eq!(peer.check().await.unwrap(), (id, "fortune".to_string()));
        assert_eq!(peer.register().await.unwrap(), id);
        assert!(peer.serve(Arc::new(Nothing)).await.is_err());

        let listed = peer.name_service().require_all("fortune").await.unwrap();
        assert_eq!(listed, vec![peer.handle().await.unwrap()]);

        peer.destroy().await.unwrap();
        assert!(peer.name_service().require_all("fortune").await.unwrap().is_empty());
        assert!(peer.serve(Arc::new(Nothing)).await.is_err());

        ns.shutdown();
    }
}
