//! Token-passing Ricart-Agrawala lock.
//!
//! [`LockBook`] holds the state machine. [`DistributedLock`] drives it: every
//! book mutation happens under the peer-list mutex, and every outbound RPC
//! (request broadcast, token delivery) happens after that mutex is released.
//!
//! # Waiting
//!
//! Local callers queue on a single-permit semaphore, so at most one of them
//! is inside `acquire`/critical section at a time. The one at the front parks
//! on a [`Notify`] until the token arrives. It registers interest before
//! checking the book so a token delivered between the check and the await is
//! not missed.
//!
//! # Delivery
//!
//! A token is put back into the book only when its delivery certainly did
//! not happen: the recipient was unreachable before the request went out,
//! is not a member, or answered with an error. When the request went out but
//! no answer came back the recipient may hold the token, so it counts as
//! delivered.

mod book;
mod token;

pub use book::{Acquire, Handoff, LockBook, LockState, LockStatus};
pub use token::{LogicalClock, RequestTable, Token};

use crate::peer::PeerHandle;
use crate::peer_list::PeerList;
use crate::{OrbError, PeerId, Result};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

/// How to pick the next holder when a delivery fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Serve the earliest outstanding request.
    Serve,
    /// Give the token away unconditionally; this peer is leaving.
    Surrender,
}

/// Distributed mutual exclusion for one peer of a group.
pub struct DistributedLock {
    owner: PeerId,
    peers: Arc<PeerList>,
    token_arrived: Notify,
    /// One permit, held from a successful `acquire` until `release`.
    entry: Semaphore,
}

impl DistributedLock {
    pub fn new(peers: Arc<PeerList>) -> Self {
        Self {
            owner: peers.me().id,
            peers,
            token_arrived: Notify::new(),
            entry: Semaphore::new(1),
        }
    }

    pub fn owner(&self) -> PeerId {
        self.owner
    }

    /// Set up the book for the current membership.
    ///
    /// The first peer of a group creates the token.
    pub async fn initialize(&self) {
        let mut membership = self.peers.lock().await;
        let peers = membership.get_peers();
        membership.book_mut().initialize(&peers);
        info!(
            "Lock of peer {} initialized: {} ({} other peers)",
            self.owner,
            membership.book().state(),
            peers.len()
        );
    }

    /// Enter the critical section.
    ///
    /// Waits behind other local callers, then for the token if it is
    /// elsewhere. Fails with `LockClosed` once the lock is destroyed.
    pub async fn acquire(&self) -> Result<()> {
        let permit = self.entry.acquire().await.map_err(|_| OrbError::LockClosed)?;
        self.enter().await?;
        permit.forget();
        Ok(())
    }

    async fn enter(&self) -> Result<()> {
        let (time, targets) = {
            let mut membership = self.peers.lock().await;
            match membership.book_mut().begin_acquire()? {
                Acquire::Entered => {
                    debug!("Peer {} entered with local token", self.owner);
                    return Ok(());
                }
                Acquire::Broadcast(time) => (time, membership.stubs()),
            }
        };

        debug!("Peer {} requesting token at {} from {} peers", self.owner, time, targets.len());
        for (pid, stub) in targets {
            if let Err(e) = stub.request_token(time, self.owner).await {
                if e.is_unreachable() {
                    warn!("Dropping unreachable peer {}: {}", pid, e);
                    self.peers.lock().await.remove(pid);
                } else {
                    warn!("Token request to peer {} failed: {}", pid, e);
                }
            }
        }

        self.wait_for_token().await?;
        debug!("Peer {} entered the critical section", self.owner);
        Ok(())
    }

    /// Leave the critical section.
    pub async fn release(&self) -> Result<()> {
        let handoff = {
            let mut membership = self.peers.lock().await;
            let peers = membership.get_peers();
            membership.book_mut().release(&peers)?
        };
        self.entry.add_permits(1);
        debug!("Peer {} released the lock", self.owner);

        if let Some(handoff) = handoff {
            self.deliver(handoff, Delivery::Serve).await;
        }
        Ok(())
    }

    /// Inbound: `pid` wants the token, asked at logical time `time`.
    ///
    /// Requests from peers outside the membership are ignored.
    pub async fn request_token(&self, time: u64, pid: PeerId) {
        let handoff = {
            let mut membership = self.peers.lock().await;
            if membership.peer(pid).is_none() {
                warn!("Peer {} ignored request from unknown peer {}", self.owner, pid);
                return;
            }
            membership.book_mut().on_request(time, pid)
        };
        debug!("Peer {} got request from {} at {}", self.owner, pid, time);

        if let Some(handoff) = handoff {
            self.deliver(handoff, Delivery::Serve).await;
        }
    }

    /// Inbound: the token was handed to this peer.
    pub async fn obtain_token(&self, token: Token) {
        let (handoff, mode) = {
            let mut membership = self.peers.lock().await;
            let peers = membership.get_peers();
            let book = membership.book_mut();
            let handoff = book.on_token(token, &peers);
            info!("Peer {} obtained the token at {}", self.owner, book.time());
            (handoff, Delivery::for_book(book))
        };
        self.token_arrived.notify_waiters();

        if let Some(handoff) = handoff {
            self.deliver(handoff, mode).await;
        }
    }

    /// Add a peer to the membership and to the lock bookkeeping.
    pub async fn register_peer(&self, handle: PeerHandle) {
        let pid = handle.id;
        self.peers.lock().await.insert(handle);
        info!("Peer {} registered peer {}", self.owner, pid);
    }

    /// Remove a peer from the membership and from the lock bookkeeping.
    pub async fn unregister_peer(&self, pid: PeerId) {
        if self.peers.lock().await.remove(pid).is_some() {
            info!("Peer {} unregistered peer {}", self.owner, pid);
        }
    }

    /// Close the lock and hand the token to the first remaining peer if it
    /// is here.
    ///
    /// Pending and later `acquire` calls fail with `LockClosed`.
    pub async fn destroy(&self) {
        let handoff = {
            let mut membership = self.peers.lock().await;
            let peers = membership.get_peers();
            let book = membership.book_mut();
            book.close();
            book.surrender(&peers)
        };
        self.entry.close();
        self.token_arrived.notify_waiters();

        match handoff {
            Some(handoff) => self.deliver(handoff, Delivery::Surrender).await,
            None => debug!("Peer {} leaves without the token", self.owner),
        }
    }

    pub async fn state(&self) -> LockState {
        self.peers.lock().await.book().state()
    }

    /// Snapshot of the lock bookkeeping.
    pub async fn status(&self) -> LockStatus {
        let status = self.peers.lock().await.book().status();
        info!(
            "Peer {} lock status: state={} time={} token={:?} request={:?}",
            status.owner, status.state, status.time, status.token, status.request
        );
        status
    }

    async fn wait_for_token(&self) -> Result<()> {
        loop {
            let notified = self.token_arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut membership = self.peers.lock().await;
                let book = membership.book_mut();
                if book.try_enter() {
                    return Ok(());
                }
                if book.is_closed() {
                    return Err(OrbError::LockClosed);
                }
            }
            notified.await;
        }
    }

    /// Send the token to its new holder.
    async fn deliver(&self, first: Handoff, mode: Delivery) {
        let mut next = Some(first);
        while let Some(handoff) = next.take() {
            let pid = handoff.to;
            let target = self.peers.lock().await.peer(pid);
            let outcome = match target {
                Some(stub) => stub.obtain_token(&handoff.token).await,
                None => Err(OrbError::UnknownPeer(pid)),
            };

            let err = match outcome {
                Ok(()) => {
                    info!("Peer {} handed the token to peer {}", self.owner, pid);
                    continue;
                }
                Err(e) => e,
            };

            let never_arrived = err.is_unreachable() || matches!(err, OrbError::UnknownPeer(_));
            let refused = matches!(err, OrbError::Remote { .. });
            if !never_arrived && !refused {
                warn!(
                    "No answer from peer {} after sending the token, treating it as delivered: {}",
                    pid, err
                );
                continue;
            }

            let mut membership = self.peers.lock().await;
            membership.book_mut().restore(handoff);
            let mode = mode.or_closing(membership.book());
            if never_arrived || mode == Delivery::Surrender {
                warn!("Token delivery to peer {} failed, dropping it: {}", pid, err);
                membership.remove(pid);
                let peers = membership.get_peers();
                next = match mode {
                    Delivery::Serve => membership.book_mut().serve_outstanding(&peers),
                    Delivery::Surrender => membership.book_mut().surrender(&peers),
                };
            } else {
                warn!("Peer {} refused the token, keeping it: {}", pid, err);
            }
        }
        // A local acquire may be waiting on a token that came back.
        self.token_arrived.notify_waiters();
    }
}

impl Delivery {
    fn for_book(book: &LockBook) -> Self {
        Delivery::Serve.or_closing(book)
    }

    /// A closed book only ever gives the token away.
    fn or_closing(self, book: &LockBook) -> Self {
        if book.is_closed() {
            Delivery::Surrender
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name_service::NameServiceClient;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn refused() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 1))
    }

    async fn holder(owner: PeerId) -> DistributedLock {
        // The name service is never contacted by these tests.
        let me = PeerHandle::new(owner, refused(), "fortune");
        let lock = DistributedLock::new(Arc::new(PeerList::new(me, NameServiceClient::new(refused()))));
        lock.initialize().await;
        lock
    }

    #[tokio::test]
    async fn test_token_counts_as_delivered_once_sent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recipient = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut line = String::new();
            BufReader::new(stream).read_line(&mut line).await.unwrap();
            line
        });

        let lock = holder(1).await;
        lock.register_peer(PeerHandle::new(2, addr, "fortune")).await;
        assert_eq!(lock.state().await, LockState::TokenPresent);

        lock.request_token(1, 2).await;

        let received = recipient.await.unwrap();
        assert!(received.contains("obtain_token"));
        assert_eq!(lock.state().await, LockState::NoToken);
    }

    #[tokio::test]
    async fn test_token_kept_when_recipient_unreachable() {
        let lock = holder(1).await;
        lock.register_peer(PeerHandle::new(2, refused(), "fortune")).await;

        lock.request_token(1, 2).await;

        assert_eq!(lock.state().await, LockState::TokenPresent);
        assert!(lock.peers.get_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_request_from_non_member_is_ignored() {
        let lock = holder(1).await;

        lock.request_token(1, 42).await;

        let status = lock.status().await;
        assert_eq!(status.state, LockState::TokenPresent);
        assert!(!status.request.contains(42));
    }

    #[tokio::test]
    async fn test_local_acquires_queue() {
        let lock = Arc::new(holder(1).await);
        lock.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let lock = lock.clone();
            async move {
                lock.acquire().await?;
                lock.release().await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        lock.release().await.unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(lock.state().await, LockState::TokenPresent);
    }

    #[tokio::test]
    async fn test_destroy_fails_queued_and_later_acquires() {
        let lock = Arc::new(holder(1).await);
        lock.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let lock = lock.clone();
            async move { lock.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        lock.destroy().await;

        assert!(matches!(waiter.await.unwrap(), Err(OrbError::LockClosed)));
        assert!(matches!(lock.acquire().await, Err(OrbError::LockClosed)));
    }
}
