//! Fortune node: one peer of a group sharing a fortune database.
//!
//! The node is the owner its skeleton dispatches onto. It exposes the
//! application surface (`read`, `write`), the lock surface (`request_token`,
//! `obtain_token`) and the membership surface (`register_peer`,
//! `unregister_peer`, `check`, `display_status`). Writes go through the
//! distributed lock so appends from different nodes never interleave.

use crate::config::NodeConfig;
use crate::database::Database;
use crate::lock::{DistributedLock, LockStatus, Token};
use crate::methods::{arg, expect_arity, reply, MethodTable};
use crate::peer::{resolve_address, Peer, PeerHandle};
use crate::peer_list::PeerList;
use crate::remote::method;
use crate::skeleton::Dispatch;
use crate::wire::RemoteFault;
use crate::{PeerId, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// A running member of a fortune group.
pub struct FortuneNode {
    id: PeerId,
    peer: Peer,
    peers: Arc<PeerList>,
    lock: DistributedLock,
    database: Database,
    methods: MethodTable<FortuneNode>,
}

impl FortuneNode {
    /// Join the group described by `config`.
    ///
    /// Registers with the name service, starts serving, learns the other
    /// peers, sets up the lock and finally announces itself.
    pub async fn start(config: &NodeConfig) -> Result<Arc<Self>> {
        let name_service = resolve_address(&config.name_service).await?;
        let peer = Peer::bind(&config.peer_type, &config.bind_address(), name_service).await?;
        let id = peer.register().await?;
        let me = peer.handle().await?;

        let peers = Arc::new(PeerList::new(me, peer.name_service()));
        let node = Arc::new(Self {
            id,
            lock: DistributedLock::new(peers.clone()),
            peers,
            peer,
            database: Database::open(&config.database),
            methods: Self::method_table(),
        });

        if let Err(e) = node.join().await {
            warn!("Peer {} failed to join: {}", id, e);
            if let Err(cleanup) = node.peer.destroy().await {
                warn!("Cleanup of peer {} failed: {}", id, cleanup);
            }
            return Err(e);
        }
        info!("Fortune node {} up at {}", id, node.address());
        Ok(node)
    }

    async fn join(self: &Arc<Self>) -> Result<()> {
        self.peer.serve(self.clone()).await?;
        self.peers.populate().await?;
        self.lock.initialize().await;
        self.peers.announce().await;
        Ok(())
    }

    fn method_table() -> MethodTable<Self> {
        MethodTable::new()
            .with(method::READ, read_handler)
            .with(method::WRITE, write_handler)
            .with(method::REQUEST_TOKEN, request_token_handler)
            .with(method::OBTAIN_TOKEN, obtain_token_handler)
            .with(method::REGISTER_PEER, register_peer_handler)
            .with(method::UNREGISTER_PEER, unregister_peer_handler)
            .with(method::CHECK, check_handler)
            .with(method::DISPLAY_STATUS, display_status_handler)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.peer.address()
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn peers(&self) -> &PeerList {
        &self.peers
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// A random fortune.
    pub async fn read(&self) -> Result<Option<String>> {
        self.database.read().await
    }

    /// Append a fortune while holding the distributed lock.
    pub async fn write(&self, fortune: &str) -> Result<()> {
        self.lock.acquire().await?;
        let written = self.database.write(fortune).await;
        self.lock.release().await?;
        written
    }

    /// Leave the group: pass the token on, tell the others, unregister.
    pub async fn destroy(&self) -> Result<()> {
        self.lock.destroy().await;
        self.peers.announce_departure().await;
        self.peer.destroy().await
    }
}

fn read_handler(node: &FortuneNode, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(async move {
        expect_arity(method::READ, &args, 0)?;
        reply(node.read().await?)
    })
}

fn write_handler(node: &FortuneNode, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(async move {
        expect_arity(method::WRITE, &args, 1)?;
        let fortune: String = arg(method::WRITE, &args, 0)?;
        node.write(&fortune).await?;
        Ok(Value::Null)
    })
}

fn request_token_handler(node: &FortuneNode, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(async move {
        expect_arity(method::REQUEST_TOKEN, &args, 2)?;
        let time: u64 = arg(method::REQUEST_TOKEN, &args, 0)?;
        let pid: PeerId = arg(method::REQUEST_TOKEN, &args, 1)?;
        node.lock.request_token(time, pid).await;
        Ok(Value::Null)
    })
}

fn obtain_token_handler(node: &FortuneNode, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(async move {
        expect_arity(method::OBTAIN_TOKEN, &args, 1)?;
        let token: Token = arg(method::OBTAIN_TOKEN, &args, 0)?;
        node.lock.obtain_token(token).await;
        Ok(Value::Null)
    })
}

fn register_peer_handler(node: &FortuneNode, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(async move {
        expect_arity(method::REGISTER_PEER, &args, 2)?;
        let pid: PeerId = arg(method::REGISTER_PEER, &args, 0)?;
        let address: SocketAddr = arg(method::REGISTER_PEER, &args, 1)?;
        node.lock
            .register_peer(PeerHandle::new(pid, address, node.peer.ptype()))
            .await;
        Ok(Value::Null)
    })
}

fn unregister_peer_handler(node: &FortuneNode, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(async move {
        expect_arity(method::UNREGISTER_PEER, &args, 1)?;
        let pid: PeerId = arg(method::UNREGISTER_PEER, &args, 0)?;
        node.lock.unregister_peer(pid).await;
        Ok(Value::Null)
    })
}

fn check_handler(node: &FortuneNode, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(async move {
        expect_arity(method::CHECK, &args, 0)?;
        reply(node.peer.check().await?)
    })
}

fn display_status_handler(node: &FortuneNode, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
    Box::pin(async move {
        expect_arity(method::DISPLAY_STATUS, &args, 0)?;
        let status: LockStatus = node.lock.status().await;
        reply(status)
    })
}

#[async_trait::async_trait]
impl Dispatch for FortuneNode {
    async fn dispatch(&self, method: &str, args: Vec<Value>) -> std::result::Result<Value, RemoteFault> {
        self.methods.invoke(self, method, args).await
    }
}
