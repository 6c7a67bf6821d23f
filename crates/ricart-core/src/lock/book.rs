//! Lock bookkeeping: state, token, request table and clock.
//!
//! [`LockBook`] is pure state. Every operation returns the token handoff it
//! decided on (if any) instead of sending it, so the caller can perform the
//! network call after releasing the mutex that guards the book.

use super::token::{LogicalClock, RequestTable, Token};
use crate::{OrbError, PeerId, Result};
use serde::{Deserialize, Serialize};

/// Lock state of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    NoToken,
    TokenPresent,
    TokenHeld,
}

impl LockState {
    pub fn has_token(&self) -> bool {
        !matches!(self, LockState::NoToken)
    }
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LockState::NoToken => "NO_TOKEN",
            LockState::TokenPresent => "TOKEN_PRESENT",
            LockState::TokenHeld => "TOKEN_HELD",
        };
        f.write_str(name)
    }
}

/// A decision to send the token to another peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    pub to: PeerId,
    pub token: Token,
}

/// What `acquire` has to do after updating the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The token was here; the caller is now inside the critical section.
    Entered,
    /// Ask every peer for the token with this request timestamp.
    Broadcast(u64),
}

/// Snapshot of a peer's lock bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
    pub owner: PeerId,
    pub state: LockState,
    pub time: u64,
    pub token: Option<Token>,
    pub request: RequestTable,
}

/// State machine of the token-passing lock for one peer.
#[derive(Debug, Clone)]
pub struct LockBook {
    owner: PeerId,
    state: LockState,
    clock: LogicalClock,
    token: Option<Token>,
    request: RequestTable,
    acquiring: bool,
    closed: bool,
}

impl LockBook {
    pub fn new(owner: PeerId) -> Self {
        Self {
            owner,
            state: LockState::NoToken,
            clock: LogicalClock::default(),
            token: None,
            request: RequestTable::default(),
            acquiring: false,
            closed: false,
        }
    }

    pub fn owner(&self) -> PeerId {
        self.owner
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn time(&self) -> u64 {
        self.clock.now()
    }

    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    pub fn request(&self) -> &RequestTable {
        &self.request
    }

    /// Whether a local `acquire` is waiting for the token.
    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    /// Whether this peer has left the group.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Refuse further acquisitions. A pending one is abandoned.
    pub fn close(&mut self) {
        self.closed = true;
        self.acquiring = false;
    }

    pub fn status(&self) -> LockStatus {
        LockStatus {
            owner: self.owner,
            state: self.state,
            time: self.clock.now(),
            token: self.token.clone(),
            request: self.request.clone(),
        }
    }

    /// Set up the book for the current peer set (`peers` excludes the owner).
    ///
    /// The first peer of a group creates the token.
    pub fn initialize(&mut self, peers: &[PeerId]) {
        if peers.is_empty() {
            self.token = Some(Token::genesis(self.owner));
            self.state = LockState::TokenPresent;
        } else {
            for &pid in peers {
                self.request.insert_peer(pid);
            }
        }
    }

    /// Start an acquisition.
    ///
    /// One acquisition at a time: callers queue locally before getting here.
    pub fn begin_acquire(&mut self) -> Result<Acquire> {
        if self.closed {
            return Err(OrbError::LockClosed);
        }
        if self.acquiring {
            return Err(OrbError::LockBusy);
        }
        match self.state {
            LockState::TokenHeld => Err(OrbError::LockBusy),
            LockState::TokenPresent => {
                let now = self.clock.now();
                let owner = self.owner;
                if let Some(token) = self.token.as_mut() {
                    token.stamp(owner, now);
                }
                self.state = LockState::TokenHeld;
                Ok(Acquire::Entered)
            }
            LockState::NoToken => {
                self.acquiring = true;
                Ok(Acquire::Broadcast(self.clock.tick()))
            }
        }
    }

    /// Enter the critical section if the token has arrived.
    pub fn try_enter(&mut self) -> bool {
        if !self.acquiring || self.state == LockState::NoToken {
            return false;
        }
        self.acquiring = false;
        self.state = LockState::TokenHeld;
        true
    }

    /// Leave the critical section and pass the token on if someone waits.
    pub fn release(&mut self, peers: &[PeerId]) -> Result<Option<Handoff>> {
        if self.state != LockState::TokenHeld {
            return Err(OrbError::LockNotHeld);
        }
        self.state = LockState::TokenPresent;
        Ok(self.serve_outstanding(peers))
    }

    /// Record a request from `pid` and hand the token over if idle here.
    ///
    /// While the token is held, or claimed by a pending local acquire, the
    /// request is only recorded; `release` serves it later.
    pub fn on_request(&mut self, time: u64, pid: PeerId) -> Option<Handoff> {
        let requested = self.request.observe(pid, time);
        if self.state != LockState::TokenPresent || self.acquiring {
            return None;
        }
        let held_at = self.token.as_ref().map(|t| t.get(pid)).unwrap_or(0);
        if requested > held_at {
            self.hand_to(pid)
        } else {
            None
        }
    }

    /// Take possession of a token sent by another peer.
    ///
    /// A closed book passes it straight on.
    pub fn on_token(&mut self, mut token: Token, peers: &[PeerId]) -> Option<Handoff> {
        for &pid in peers {
            token.insert_peer(pid);
        }
        let now = self.clock.tick();
        token.stamp(self.owner, now);
        self.token = Some(token);
        self.state = LockState::TokenPresent;

        if self.closed {
            self.surrender(peers)
        } else if self.acquiring {
            None
        } else {
            self.serve_outstanding(peers)
        }
    }

    /// Hand the token to the earliest outstanding requester, if any.
    ///
    /// A request is outstanding when its timestamp is newer than the time the
    /// requester last held the token. Among several, the lowest request
    /// timestamp wins; ties go to the first peer in `peers` order.
    pub fn serve_outstanding(&mut self, peers: &[PeerId]) -> Option<Handoff> {
        if self.state != LockState::TokenPresent || self.acquiring {
            return None;
        }
        let token = self.token.as_ref()?;
        let next = peers
            .iter()
            .copied()
            .filter(|&pid| pid != self.owner && self.request.get(pid) > token.get(pid))
            .min_by_key(|&pid| self.request.get(pid))?;
        self.hand_to(next)
    }

    /// Give the token to the first remaining peer regardless of requests.
    ///
    /// Used when this peer leaves the group.
    pub fn surrender(&mut self, peers: &[PeerId]) -> Option<Handoff> {
        self.acquiring = false;
        if !self.state.has_token() {
            return None;
        }
        let next = peers.iter().copied().find(|&pid| pid != self.owner)?;
        self.hand_to(next)
    }

    /// Put back a token whose delivery failed.
    pub fn restore(&mut self, handoff: Handoff) {
        self.token = Some(handoff.token);
        self.state = LockState::TokenPresent;
    }

    pub fn register_peer(&mut self, pid: PeerId) {
        self.request.insert_peer(pid);
        if let Some(token) = self.token.as_mut() {
            token.insert_peer(pid);
        }
    }

    pub fn unregister_peer(&mut self, pid: PeerId) {
        if pid == self.owner {
            return;
        }
        self.request.remove_peer(pid);
        if let Some(token) = self.token.as_mut() {
            token.remove_peer(pid);
        }
    }

    fn hand_to(&mut self, pid: PeerId) -> Option<Handoff> {
        let token = self.token.take()?;
        self.state = LockState::NoToken;
        Some(Handoff { to: pid, token })
    }
}
