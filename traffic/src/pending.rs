//! Correlate transmitted packets with their send time.
//!
//! Entries are recorded once per transmitted packet and resolved once when the
//! matching reply arrives. Packets lost by the network are never resolved: without a
//! retention limit, their entries accumulate for the lifetime of the table.

use crate::PacketId;
use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, SystemTime},
};
use thiserror::Error;

/// Errors that can occur when interacting with a [Table].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("duplicate packet: {0}")]
    DuplicateKey(PacketId),
    #[error("unknown packet: {0}")]
    UnknownKey(PacketId),
}

/// Mapping from in-flight packet to the time it was sent.
pub struct Table {
    ttl: Option<Duration>,
    entries: HashMap<PacketId, SystemTime>,

    // Insertion order, only tracked when a ttl is configured
    order: VecDeque<(SystemTime, PacketId)>,
}

impl Table {
    /// Create an empty table.
    ///
    /// If `ttl` is set, [Table::expire] drops entries older than `ttl`.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record that `id` was sent at `at`.
    pub fn record(&mut self, id: PacketId, at: SystemTime) -> Result<(), Error> {
        if self.entries.contains_key(&id) {
            return Err(Error::DuplicateKey(id));
        }
        self.entries.insert(id, at);
        if self.ttl.is_some() {
            self.order.push_back((at, id));
        }
        Ok(())
    }

    /// Remove `id` and return the time it was sent.
    pub fn resolve(&mut self, id: PacketId) -> Result<SystemTime, Error> {
        self.entries.remove(&id).ok_or(Error::UnknownKey(id))
    }

    /// Drop all entries sent more than `ttl` before `now`, returning how many were dropped.
    ///
    /// Does nothing if the table was created without a ttl.
    pub fn expire(&mut self, now: SystemTime) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let Some(cutoff) = now.checked_sub(ttl) else {
            return 0;
        };
        let mut expired = 0;
        while let Some(&(at, id)) = self.order.front() {
            if at >= cutoff {
                break;
            }
            self.order.pop_front();

            // Skip entries that were already resolved (or resolved and re-recorded later)
            if self.entries.get(&id) == Some(&at) {
                self.entries.remove(&id);
                expired += 1;
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn at(millis: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(millis)
    }

    #[test]
    fn test_record_resolve() {
        let mut table = Table::new(None);
        table.record(PacketId(1), at(10)).unwrap();
        table.record(PacketId(2), at(20)).unwrap();
        assert_eq!(table.len(), 2);

        assert_eq!(table.resolve(PacketId(2)).unwrap(), at(20));
        assert_eq!(table.resolve(PacketId(1)).unwrap(), at(10));
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_key() {
        let mut table = Table::new(None);
        table.record(PacketId(7), at(0)).unwrap();
        assert_eq!(
            table.record(PacketId(7), at(5)),
            Err(Error::DuplicateKey(PacketId(7)))
        );

        // Original entry is untouched
        assert_eq!(table.resolve(PacketId(7)).unwrap(), at(0));
    }

    #[test]
    fn test_unknown_key() {
        let mut table = Table::new(None);
        assert_eq!(
            table.resolve(PacketId(3)),
            Err(Error::UnknownKey(PacketId(3)))
        );

        // Resolving twice fails the second time
        table.record(PacketId(3), at(0)).unwrap();
        table.resolve(PacketId(3)).unwrap();
        assert_eq!(
            table.resolve(PacketId(3)),
            Err(Error::UnknownKey(PacketId(3)))
        );
    }

    #[test]
    fn test_expire_without_ttl() {
        let mut table = Table::new(None);
        table.record(PacketId(1), at(0)).unwrap();
        assert_eq!(table.expire(at(1_000_000)), 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_expire() {
        let mut table = Table::new(Some(Duration::from_millis(100)));
        table.record(PacketId(1), at(0)).unwrap();
        table.record(PacketId(2), at(50)).unwrap();
        table.record(PacketId(3), at(120)).unwrap();

        // Resolved entries are not counted again
        table.resolve(PacketId(2)).unwrap();
        assert_eq!(table.expire(at(90)), 0);
        assert_eq!(table.expire(at(200)), 1);
        assert_eq!(table.len(), 1);
        assert!(table.resolve(PacketId(1)).is_err());
        assert_eq!(table.resolve(PacketId(3)).unwrap(), at(120));
    }
}
