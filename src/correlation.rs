//! Request/response correlation.
//!
//! Every in-flight client request is identified by a [`CorrelationKey`] and tracked
//! in the [`CorrelationIndex`] with its expiry instant. The issuing path inserts,
//! the receive loop takes entries out when an echo arrives.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

/// Identifies one client request: `<identity-hash> <counter>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub identity: u32,
    pub counter: u64,
}

impl CorrelationKey {
    pub fn new(identity: u32, counter: u64) -> Self {
        Self { identity, counter }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.identity, self.counter)
    }
}

/// Concurrent map from key to expiry instant.
#[derive(Debug, Default)]
pub struct CorrelationIndex {
    entries: Mutex<HashMap<String, Instant>>,
}

impl CorrelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite.
    pub fn put(&self, key: impl Into<String>, expiry: Instant) {
        self.entries().insert(key.into(), expiry);
    }

    /// Non-destructive lookup.
    pub fn get(&self, key: &str) -> Option<Instant> {
        self.entries().get(key).copied()
    }

    /// Delete if present; returns whether an entry existed.
    pub fn remove(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    /// Atomic get-and-remove. A duplicated echo finds nothing the second time.
    pub fn take(&self, key: &str) -> Option<Instant> {
        self.entries().remove(key)
    }

    /// Drop entries that expired before `cutoff`; returns how many were dropped.
    pub fn purge_expired_before(&self, cutoff: Instant) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, expiry| *expiry >= cutoff);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn key_format() {
        assert_eq!(CorrelationKey::new(12345, 0).to_string(), "12345 0");
        assert_eq!(CorrelationKey::new(7, u64::MAX).to_string(), "7 18446744073709551615");
    }

    #[test]
    fn put_get_remove() {
        let index = CorrelationIndex::new();
        let expiry = Instant::now() + Duration::from_millis(100);

        index.put("1 0", expiry);
        assert_eq!(index.get("1 0"), Some(expiry));
        assert_eq!(index.get("1 0"), Some(expiry), "get must not consume");

        assert!(index.remove("1 0"));
        assert_eq!(index.get("1 0"), None);
        assert!(!index.remove("1 0"));
    }

    #[test]
    fn take_is_single_shot() {
        let index = CorrelationIndex::new();
        let expiry = Instant::now();
        index.put("1 7", expiry);

        assert_eq!(index.take("1 7"), Some(expiry));
        assert_eq!(index.take("1 7"), None);
        assert!(index.is_empty());
    }

    #[test]
    fn put_overwrites() {
        let index = CorrelationIndex::new();
        let first = Instant::now();
        let second = first + Duration::from_secs(1);
        index.put("k", first);
        index.put("k", second);
        assert_eq!(index.get("k"), Some(second));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn purge_drops_only_stale_entries() {
        let index = CorrelationIndex::new();
        let now = Instant::now();
        index.put("old", now);
        index.put("fresh", now + Duration::from_secs(10));

        assert_eq!(index.purge_expired_before(now + Duration::from_secs(1)), 1);
        assert_eq!(index.get("old"), None);
        assert!(index.get("fresh").is_some());
    }
}
