//! Name service: peer identities and the directory of peer addresses.
//!
//! [`NameServiceClient`] is what a peer uses to join and leave. [`NameServer`]
//! is a small in-memory implementation that can be served by a skeleton.

use crate::methods::{arg, expect_arity, reply, MethodTable};
use crate::peer::PeerHandle;
use crate::remote::method;
use crate::skeleton::{Dispatch, Skeleton, SkeletonHandle};
use crate::stub::Stub;
use crate::wire::RemoteFault;
use crate::{OrbError, PeerId, Result};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Identity issued by the name service on registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: PeerId,
    pub hash: String,
}

/// Typed stub for the name service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameServiceClient {
    stub: Stub,
}

impl NameServiceClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            stub: Stub::new(addr),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.stub.addr()
    }

    pub async fn register(&self, ptype: &str, address: SocketAddr) -> Result<Identity> {
        let (id, hash): (PeerId, String) = self
            .stub
            .call_as(method::REGISTER, vec![json!(ptype), json!(address)])
            .await?;
        Ok(Identity { id, hash })
    }

    pub async fn unregister(&self, id: PeerId, ptype: &str, hash: &str) -> Result<()> {
        self.stub
            .call(method::UNREGISTER, vec![json!(id), json!(ptype), json!(hash)])
            .await
            .map(drop)
    }

    /// Every registered peer of type `ptype`.
    pub async fn require_all(&self, ptype: &str) -> Result<Vec<PeerHandle>> {
        let listed: Vec<(PeerId, SocketAddr)> = self
            .stub
            .call_as(method::REQUIRE_ALL, vec![json!(ptype)])
            .await?;
        Ok(listed
            .into_iter()
            .map(|(id, address)| PeerHandle::new(id, address, ptype))
            .collect())
    }
}

#[derive(Debug, Clone)]
struct Registration {
    ptype: String,
    address: SocketAddr,
    hash: String,
}

#[derive(Debug, Default)]
struct Directory {
    last_id: PeerId,
    entries: BTreeMap<PeerId, Registration>,
}

/// In-memory name service.
pub struct NameServer {
    directory: Mutex<Directory>,
    methods: MethodTable<NameServer>,
}

impl Default for NameServer {
    fn default() -> Self {
        Self::new()
    }
}

impl NameServer {
    pub fn new() -> Self {
        Self {
            directory: Mutex::new(Directory::default()),
            methods: MethodTable::new()
                .with(method::REGISTER, register_handler)
                .with(method::UNREGISTER, unregister_handler)
                .with(method::REQUIRE_ALL, require_all_handler),
        }
    }

    /// Bind `addr` and serve a fresh name server on it.
    pub async fn serve(addr: SocketAddr) -> Result<SkeletonHandle> {
        let skeleton = Skeleton::bind(addr).await?;
        info!("Name service on {}", skeleton.local_addr());
        Ok(skeleton.start(Arc::new(Self::new())))
    }

    /// Issue a new id and hash for a peer of type `ptype`.
    pub async fn register(&self, ptype: &str, address: SocketAddr) -> Identity {
        let mut directory = self.directory.lock().await;
        directory.last_id += 1;
        let id = directory.last_id;
        let hash = uuid::Uuid::new_v4().simple().to_string();
        directory.entries.insert(
            id,
            Registration {
                ptype: ptype.to_string(),
                address,
                hash: hash.clone(),
            },
        );
        info!("Registered {} peer {} at {}", ptype, id, address);
        Identity { id, hash }
    }

    /// Remove a peer. Only the holder of the issued hash may do so.
    pub async fn unregister(&self, id: PeerId, ptype: &str, hash: &str) -> Result<()> {
        let mut directory = self.directory.lock().await;
        let entry = directory.entries.get(&id).ok_or(OrbError::UnknownPeer(id))?;
        if entry.ptype != ptype || entry.hash != hash {
            return Err(OrbError::InvalidIdentity {
                id,
                ptype: ptype.to_string(),
            });
        }
        directory.entries.remove(&id);
        info!("Unregistered {} peer {}", ptype, id);
        Ok(())
    }

    pub async fn require_all(&self, ptype: &str) -> Vec<(PeerId, SocketAddr)> {
        let directory = self.directory.lock().await;
        directory
            .entries
            .iter()
            .filter(|(_, entry)| entry.ptype == ptype)
            .map(|(id, entry)| (*id, entry.address))
            .collect()
    }
}

fn register_handler(ns: &NameServer, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(async move {
        expect_arity(method::REGISTER, &args, 2)?;
        let ptype: String = arg(method::REGISTER, &args, 0)?;
        let address: SocketAddr = arg(method::REGISTER, &args, 1)?;
        let identity = ns.register(&ptype, address).await;
        reply((identity.id, identity.hash))
    })
}

fn unregister_handler(ns: &NameServer, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(async move {
        expect_arity(method::UNREGISTER, &args, 3)?;
        let id: PeerId = arg(method::UNREGISTER, &args, 0)?;
        let ptype: String = arg(method::UNREGISTER, &args, 1)?;
        let hash: String = arg(method::UNREGISTER, &args, 2)?;
        ns.unregister(id, &ptype, &hash).await?;
        Ok(Value::Null)
    })
}

fn require_all_handler(ns: &NameServer, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(async move {
        expect_arity(method::REQUIRE_ALL, &args, 1)?;
        let ptype: String = arg(method::REQUIRE_ALL, &args, 0)?;
        reply(ns.require_all(&ptype).await)
    })
}

#[async_trait::async_trait]
impl Dispatch for NameServer {
    async fn dispatch(&self, method: &str, args: Vec<Value>) -> std::result::Result<Value, RemoteFault> {
        self.methods.invoke(self, method, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_register_issues_increasing_ids() {
        let ns = NameServer::new();
        let first = ns.register("fortune", addr(9001)).await;
        let second = ns.register("fortune", addr(9002)).await;
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_ne!(first.hash, second.hash);
    }

    #[tokio::test]
    async fn test_require_all_filters_by_type() {
        let ns = NameServer::new();
        ns.register("fortune", addr(9001)).await;
        ns.register("other", addr(9002)).await;
        ns.register("fortune", addr(9003)).await;

        let listed = ns.require_all("fortune").await;
        assert_eq!(listed, vec![(1, addr(9001)), (3, addr(9003))]);
    }

    #[tokio::test]
    async fn test_unregister_requires_matching_hash() {
        let ns = NameServer::new();
        let identity = ns.register("fortune", addr(9001)).await;

        let err = ns.unregister(identity.id, "fortune", "wrong").await.unwrap_err();
        assert!(matches!(err, OrbError::InvalidIdentity { .. }));

        ns.unregister(identity.id, "fortune", &identity.hash).await.unwrap();
        assert!(ns.require_all("fortune").await.is_empty());

        let err = ns.unregister(identity.id, "fortune", &identity.hash).await.unwrap_err();
        assert!(matches!(err, OrbError::UnknownPeer(1)));
    }

    #[tokio::test]
    async fn test_client_over_the_wire() {
        let mut handle = NameServer::serve(addr(0)).await.unwrap();
        let client = NameServiceClient::new(handle.addr());

        let identity = client.register("fortune", addr(9100)).await.unwrap();
        let listed = client.require_all("fortune").await.unwrap();
        assert_eq!(listed, vec![PeerHandle::new(identity.id, addr(9100), "fortune")]);

        match client.unregister(identity.id, "fortune", "bogus").await.unwrap_err() {
            OrbError::Remote { name, .. } => assert_eq!(name, "InvalidIdentity"),
            other => panic!("Expected Remote, got: {:?}", other),
        }
        client.unregister(identity.id, "fortune", &identity.hash).await.unwrap();

        handle.shutdown();
    }
}
