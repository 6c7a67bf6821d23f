//! Membership of the peer group.
//!
//! [`PeerList`] owns the map of known peers and the lock bookkeeping behind a
//! single async mutex. Membership changes and lock transitions therefore see
//! one consistent view: a peer is in the token and request table exactly
//! when it is in the map.

use crate::lock::LockBook;
use crate::name_service::NameServiceClient;
use crate::peer::PeerHandle;
use crate::remote::PeerStub;
use crate::PeerId;
use crate::Result;
use std::collections::BTreeMap;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// State guarded by the peer-list mutex.
#[derive(Debug)]
pub struct Membership {
    peers: BTreeMap<PeerId, PeerHandle>,
    book: LockBook,
}

impl Membership {
    fn new(owner: PeerId) -> Self {
        Self {
            peers: BTreeMap::new(),
            book: LockBook::new(owner),
        }
    }

    /// Ids of the other peers, ascending.
    pub fn get_peers(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn peer(&self, pid: PeerId) -> Option<PeerStub> {
        self.peers.get(&pid).map(|h| PeerStub::new(h.address))
    }

    /// Stubs for every other peer, in iteration order.
    pub fn stubs(&self) -> Vec<(PeerId, PeerStub)> {
        self.peers
            .iter()
            .map(|(pid, h)| (*pid, PeerStub::new(h.address)))
            .collect()
    }

    /// Add or replace a peer. The owner itself is never a member.
    pub fn insert(&mut self, handle: PeerHandle) {
        if handle.id == self.book.owner() {
            return;
        }
        self.book.register_peer(handle.id);
        self.peers.insert(handle.id, handle);
    }

    /// Drop a peer. Its lock entries go even if it was not a member.
    pub fn remove(&mut self, pid: PeerId) -> Option<PeerHandle> {
        self.book.unregister_peer(pid);
        self.peers.remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn book(&self) -> &LockBook {
        &self.book
    }

    pub fn book_mut(&mut self) -> &mut LockBook {
        &mut self.book
    }
}

/// The other peers of one group, as seen from one peer.
pub struct PeerList {
    me: PeerHandle,
    name_service: NameServiceClient,
    inner: Mutex<Membership>,
}

impl PeerList {
    pub fn new(me: PeerHandle, name_service: NameServiceClient) -> Self {
        let inner = Mutex::new(Membership::new(me.id));
        Self {
            me,
            name_service,
            inner,
        }
    }

    pub fn me(&self) -> &PeerHandle {
        &self.me
    }

    /// Take the peer-list mutex.
    pub async fn lock(&self) -> MutexGuard<'_, Membership> {
        self.inner.lock().await
    }

    pub async fn get_peers(&self) -> Vec<PeerId> {
        self.inner.lock().await.get_peers()
    }

    pub async fn peer(&self, pid: PeerId) -> Option<PeerStub> {
        self.inner.lock().await.peer(pid)
    }

    /// Fill the membership with every peer of our type known to the name
    /// service.
    pub async fn populate(&self) -> Result<()> {
        let listed = self.name_service.require_all(&self.me.ptype).await?;
        let mut membership = self.inner.lock().await;
        for handle in listed {
            membership.insert(handle);
        }
        info!("Peer {} found {} other peers", self.me.id, membership.len());
        Ok(())
    }

    /// Tell every known peer that this peer has joined.
    ///
    /// Peers that cannot be reached are dropped.
    pub async fn announce(&self) {
        let targets = self.inner.lock().await.stubs();
        for (pid, stub) in targets {
            match stub.register_peer(self.me.id, self.me.address).await {
                Ok(()) => debug!("Announced peer {} to peer {}", self.me.id, pid),
                Err(e) if e.is_unreachable() => {
                    warn!("Dropping unreachable peer {}: {}", pid, e);
                    self.inner.lock().await.remove(pid);
                }
                Err(e) => warn!("Announcing to peer {} failed: {}", pid, e),
            }
        }
    }

    /// Tell every known peer that this peer is leaving. Failures are logged.
    pub async fn announce_departure(&self) {
        let targets = self.inner.lock().await.stubs();
        for (pid, stub) in targets {
            if let Err(e) = stub.unregister_peer(self.me.id).await {
                warn!("Telling peer {} about departure failed: {}", pid, e);
            }
        }
    }

    /// Check every peer and drop those that do not answer.
    ///
    /// Returns the ids of the peers that answered.
    pub async fn check_peers(&self) -> Vec<PeerId> {
        let targets = self.inner.lock().await.stubs();
        let mut alive = Vec::with_capacity(targets.len());
        for (pid, stub) in targets {
            match stub.check().await {
                Ok((id, _)) if id == pid => alive.push(pid),
                Ok((id, _)) => {
                    warn!("Peer {} answered as {}, dropping it", pid, id);
                    self.inner.lock().await.remove(pid);
                }
                Err(e) => {
                    warn!("Peer {} failed its check, dropping it: {}", pid, e);
                    self.inner.lock().await.remove(pid);
                }
            }
        }
        alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockState;
    use std::net::SocketAddr;

    fn handle(id: PeerId) -> PeerHandle {
        PeerHandle::new(id, SocketAddr::from(([127, 0, 0, 1], 9000 + id as u16)), "fortune")
    }

    fn list(owner: PeerId) -> PeerList {
        // The name service is never contacted by these tests.
        PeerList::new(handle(owner), NameServiceClient::new(SocketAddr::from(([127, 0, 0, 1], 1))))
    }

    #[tokio::test]
    async fn test_iteration_order_is_ascending() {
        let peers = list(1);
        {
            let mut membership = peers.lock().await;
            membership.insert(handle(7));
            membership.insert(handle(2));
            membership.insert(handle(4));
        }
        assert_eq!(peers.get_peers().await, vec![2, 4, 7]);
    }

    #[tokio::test]
    async fn test_owner_is_never_a_member() {
        let peers = list(3);
        peers.lock().await.insert(handle(3));
        assert!(peers.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_membership_tracks_lock_tables() {
        let peers = list(1);
        let mut membership = peers.lock().await;
        membership.book_mut().initialize(&[]);
        assert_eq!(membership.book().state(), LockState::TokenPresent);

        membership.insert(handle(5));
        assert!(membership.book().request().contains(5));
        assert!(membership.book().token().unwrap().contains(5));

        assert!(membership.remove(5).is_some());
        assert!(!membership.book().request().contains(5));
        assert!(!membership.book().token().unwrap().contains(5));
        assert!(membership.remove(5).is_none());
    }

    #[tokio::test]
    async fn test_remove_clears_entries_of_non_member() {
        let peers = list(1);
        let mut membership = peers.lock().await;
        membership.book_mut().initialize(&[]);
        membership.book_mut().begin_acquire().unwrap();
        assert!(membership.book_mut().on_request(4, 8).is_none());
        assert!(membership.book().request().contains(8));

        assert!(membership.remove(8).is_none());
        assert!(!membership.book().request().contains(8));
    }

    #[tokio::test]
    async fn test_check_peers_drops_dead_peer() {
        let peers = list(1);
        peers
            .lock()
            .await
            .insert(PeerHandle::new(2, SocketAddr::from(([127, 0, 0, 1], 1)), "fortune"));

        assert!(peers.check_peers().await.is_empty());
        assert!(peers.get_peers().await.is_empty());
    }
}
