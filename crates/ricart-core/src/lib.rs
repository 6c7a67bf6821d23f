//! Ricart Core - object request broker and token-passing distributed lock.
//!
//! The broker moves positional method calls between processes as
//! newline-delimited JSON records, one request per TCP connection. A
//! [`Stub`] forwards calls; a [`Skeleton`] serves an owner implementing
//! [`Dispatch`]. On top of it, [`DistributedLock`] provides mutual
//! exclusion across a peer group with a single circulating token.
//!
//! # Example
//!
//! ```rust,ignore
//! use ricart_core::{FortuneNode, NameServer, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> ricart_core::Result<()> {
//!     let mut ns = NameServer::serve("127.0.0.1:8000".parse().unwrap()).await?;
//!
//!     let config = NodeConfig {
//!         host: "127.0.0.1".into(),
//!         name_service: ns.addr().to_string(),
//!         ..NodeConfig::default()
//!     };
//!     let node = FortuneNode::start(&config).await?;
//!     node.write("A journey of a thousand miles begins with a single step.").await?;
//!     println!("{:?}", node.read().await?);
//!
//!     node.destroy().await?;
//!     ns.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod lock;
pub mod methods;
pub mod name_service;
pub mod node;
pub mod peer;
pub mod peer_list;
pub mod remote;
pub mod skeleton;
pub mod stub;
pub mod wire;

/// Peer identifier issued by the name service.
pub type PeerId = u64;

// Re-export commonly used types
pub use config::{NodeConfig, OrbConfig, PeerTypes};
pub use database::Database;
pub use error::{OrbError, Result};
pub use lock::{DistributedLock, LockState, LockStatus, Token};
pub use methods::MethodTable;
pub use name_service::{Identity, NameServer, NameServiceClient};
pub use node::FortuneNode;
pub use peer::{Peer, PeerHandle};
pub use peer_list::PeerList;
pub use remote::{FortuneStub, PeerStub};
pub use skeleton::{Dispatch, Skeleton, SkeletonHandle};
pub use stub::Stub;
pub use wire::{RemoteFault, Request, Response};
