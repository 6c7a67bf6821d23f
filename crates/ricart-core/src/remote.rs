//! Typed stubs for the RPC surfaces a peer exposes.
//!
//! [`Stub`] forwards any method name. The wrappers here list the exact
//! methods one side may ask of the other, with typed arguments and results.

use crate::lock::{LockStatus, Token};
use crate::stub::Stub;
use crate::{PeerId, Result};
use serde_json::{json, Value};
use std::net::SocketAddr;

/// Wire method names.
pub mod method {
    pub const REQUEST_TOKEN: &str = "request_token";
    pub const OBTAIN_TOKEN: &str = "obtain_token";
    pub const REGISTER_PEER: &str = "register_peer";
    pub const UNREGISTER_PEER: &str = "unregister_peer";
    pub const CHECK: &str = "check";
    pub const DISPLAY_STATUS: &str = "display_status";
    pub const READ: &str = "read";
    pub const WRITE: &str = "write";
    pub const REGISTER: &str = "register";
    pub const UNREGISTER: &str = "unregister";
    pub const REQUIRE_ALL: &str = "require_all";
}

/// Lock and membership surface of another peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStub {
    stub: Stub,
}

impl PeerStub {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            stub: Stub::new(addr),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.stub.addr()
    }

    /// Ask for the token on behalf of `pid`, at logical time `time`.
    pub async fn request_token(&self, time: u64, pid: PeerId) -> Result<()> {
        self.stub
            .call(method::REQUEST_TOKEN, vec![json!(time), json!(pid)])
            .await
            .map(drop)
    }

    /// Hand the token over.
    pub async fn obtain_token(&self, token: &Token) -> Result<()> {
        self.stub
            .call(method::OBTAIN_TOKEN, vec![serde_json::to_value(token)?])
            .await
            .map(drop)
    }

    /// Announce a peer joining the group.
    pub async fn register_peer(&self, pid: PeerId, address: SocketAddr) -> Result<()> {
        self.stub
            .call(method::REGISTER_PEER, vec![json!(pid), json!(address)])
            .await
            .map(drop)
    }

    /// Announce a peer leaving the group.
    pub async fn unregister_peer(&self, pid: PeerId) -> Result<()> {
        self.stub
            .call(method::UNREGISTER_PEER, vec![json!(pid)])
            .await
            .map(drop)
    }

    /// Liveness check: the remote's `(id, type)`.
    pub async fn check(&self) -> Result<(PeerId, String)> {
        self.stub.call_as(method::CHECK, vec![]).await
    }

    pub async fn display_status(&self) -> Result<LockStatus> {
        self.stub.call_as(method::DISPLAY_STATUS, vec![]).await
    }
}

/// Application surface of a fortune node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FortuneStub {
    stub: Stub,
}

impl FortuneStub {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            stub: Stub::new(addr),
        }
    }

    /// A random fortune, or `None` when the database is empty.
    pub async fn read(&self) -> Result<Option<String>> {
        self.stub.call_as(method::READ, vec![]).await
    }

    pub async fn write(&self, fortune: &str) -> Result<()> {
        self.stub
            .call(method::WRITE, vec![Value::String(fortune.to_string())])
            .await
            .map(drop)
    }
}
