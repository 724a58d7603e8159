//! Identifiers
//!
//! Session-scoped numeric ids. Players are identified only by the id the
//! server hands out when their connection is accepted.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};

/// Sequential player identifier, assigned per accepted connection.
///
/// Implements Ord so registries keyed by it iterate in join order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub u64);

impl PlayerId {
    /// Create from a raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player#{}", self.0)
    }
}

/// Identifier of a live fight encounter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FightId(pub u64);

impl fmt::Display for FightId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fight#{}", self.0)
    }
}

/// Monotonic id source. Values start at 1 and are never handed out twice.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    /// Allocator whose first id is 1.
    pub const fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    /// Take the next raw id.
    pub fn next_raw(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Take the next player id.
    pub fn next_player(&self) -> PlayerId {
        PlayerId(self.next_raw())
    }

    /// Take the next fight id.
    pub fn next_fight(&self) -> FightId {
        FightId(self.next_raw())
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    #[test]
    fn test_sequential_from_one() {
        let ids = IdAllocator::new();
        assert_eq!(ids.next_player(), PlayerId(1));
        assert_eq!(ids.next_player(), PlayerId(2));
        assert_eq!(ids.next_fight(), FightId(3));
    }

    #[test]
    fn test_unique_across_threads() {
        let ids = Arc::new(IdAllocator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..250).map(|_| ids.next_raw()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = BTreeSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {} handed out twice", id);
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn test_player_id_is_plain_number_on_wire() {
        assert_eq!(serde_json::to_string(&PlayerId(7)).unwrap(), "7");
        let parsed: PlayerId = serde_json::from_str("12").unwrap();
        assert_eq!(parsed, PlayerId(12));
    }
}
