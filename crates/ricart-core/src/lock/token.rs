//! Token, request table and logical clock.
//!
//! Both maps are keyed by integer peer ids. JSON object keys are strings, so
//! on the wire they travel as `[[peer-id, timestamp], ...]` pairs.

use crate::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The mutual-exclusion permit: last time each peer held it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(PeerId, u64)>", into = "Vec<(PeerId, u64)>")]
pub struct Token {
    stamps: BTreeMap<PeerId, u64>,
}

impl Token {
    /// The token created on the first peer of a group.
    pub fn genesis(owner: PeerId) -> Self {
        let mut token = Self::default();
        token.stamp(owner, 0);
        token
    }

    /// Timestamp recorded for `pid`; peers never seen count as 0.
    pub fn get(&self, pid: PeerId) -> u64 {
        self.stamps.get(&pid).copied().unwrap_or(0)
    }

    pub fn stamp(&mut self, pid: PeerId, time: u64) {
        self.stamps.insert(pid, time);
    }

    pub fn contains(&self, pid: PeerId) -> bool {
        self.stamps.contains_key(&pid)
    }

    /// Add a zero entry for `pid` unless one exists.
    pub fn insert_peer(&mut self, pid: PeerId) {
        self.stamps.entry(pid).or_insert(0);
    }

    pub fn remove_peer(&mut self, pid: PeerId) {
        self.stamps.remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    pub fn to_pairs(&self) -> Vec<(PeerId, u64)> {
        self.stamps.iter().map(|(pid, time)| (*pid, *time)).collect()
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (PeerId, u64)>) -> Self {
        Self {
            stamps: pairs.into_iter().collect(),
        }
    }
}

impl From<Vec<(PeerId, u64)>> for Token {
    fn from(pairs: Vec<(PeerId, u64)>) -> Self {
        Self::from_pairs(pairs)
    }
}

impl From<Token> for Vec<(PeerId, u64)> {
    fn from(token: Token) -> Self {
        token.to_pairs()
    }
}

/// Highest request timestamp observed from each peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(PeerId, u64)>", into = "Vec<(PeerId, u64)>")]
pub struct RequestTable {
    requests: BTreeMap<PeerId, u64>,
}

impl RequestTable {
    pub fn get(&self, pid: PeerId) -> u64 {
        self.requests.get(&pid).copied().unwrap_or(0)
    }

    /// Record a request, keeping the highest timestamp seen.
    pub fn observe(&mut self, pid: PeerId, time: u64) -> u64 {
        let entry = self.requests.entry(pid).or_insert(0);
        *entry = (*entry).max(time);
        *entry
    }

    pub fn contains(&self, pid: PeerId) -> bool {
        self.requests.contains_key(&pid)
    }

    pub fn insert_peer(&mut self, pid: PeerId) {
        self.requests.entry(pid).or_insert(0);
    }

    pub fn remove_peer(&mut self, pid: PeerId) {
        self.requests.remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

impl From<Vec<(PeerId, u64)>> for RequestTable {
    fn from(pairs: Vec<(PeerId, u64)>) -> Self {
        Self {
            requests: pairs.into_iter().collect(),
        }
    }
}

impl From<RequestTable> for Vec<(PeerId, u64)> {
    fn from(table: RequestTable) -> Self {
        table.requests.into_iter().collect()
    }
}

/// Per-peer logical clock used to order token requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogicalClock(u64);

impl LogicalClock {
    pub fn now(&self) -> u64 {
        self.0
    }

    /// Advance and return the new time.
    pub fn tick(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_pair_roundtrip() {
        let token = Token::from_pairs([(1, 0), (2, 3), (7, 9)]);
        let wire = serde_json::to_value(&token).unwrap();
        assert_eq!(wire, json!([[1, 0], [2, 3], [7, 9]]));

        let back: Token = serde_json::from_value(wire).unwrap();
        assert_eq!(back, token);
        assert_eq!(back.get(2), 3);
        assert_eq!(back.get(7), 9);
    }

    #[test]
    fn test_genesis_token() {
        let token = Token::genesis(4);
        assert_eq!(token.to_pairs(), vec![(4, 0)]);
    }

    #[test]
    fn test_request_table_is_monotonic() {
        let mut table = RequestTable::default();
        assert_eq!(table.observe(3, 5), 5);
        assert_eq!(table.observe(3, 2), 5);
        assert_eq!(table.observe(3, 8), 8);
        assert_eq!(table.get(9), 0);
    }

    #[test]
    fn test_insert_peer_keeps_existing_entry() {
        let mut token = Token::from_pairs([(1, 6)]);
        token.insert_peer(1);
        token.insert_peer(2);
        assert_eq!(token.to_pairs(), vec![(1, 6), (2, 0)]);
    }

    #[test]
    fn test_clock_tick() {
        let mut clock = LogicalClock::default();
        assert_eq!(clock.now(), 0);
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
    }
}
