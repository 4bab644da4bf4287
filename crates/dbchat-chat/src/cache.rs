//! Per-session cache of the last successful query.
//!
//! Bridges a query answer that offered a chart to the later turn that
//! confirms it. Each session holds at most one entry; writing replaces the
//! previous entry whole.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use dbchat_core::config::CacheConfig;
use dbchat_core::types::{ChartType, QueryResult, SessionKey};

/// The last successful query of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    pub query_text: String,
    pub result: QueryResult,
    pub suggested_chart_type: Option<ChartType>,
    pub created_at: DateTime<Utc>,
}

impl SessionEntry {
    pub fn new(
        query_text: impl Into<String>,
        result: QueryResult,
        suggested_chart_type: Option<ChartType>,
    ) -> Self {
        Self {
            query_text: query_text.into(),
            result,
            suggested_chart_type,
            created_at: Utc::now(),
        }
    }
}

struct Slot {
    entry: Arc<SessionEntry>,
    written_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<SessionKey, Slot>,
    /// Write sequence number -> key, oldest first.
    order: BTreeMap<u64, SessionKey>,
    next_seq: u64,
}

impl Inner {
    fn remove(&mut self, key: &SessionKey) {
        if let Some(slot) = self.slots.remove(key) {
            self.order.remove(&slot.seq);
        }
    }
}

/// Keyed, bounded, last-write-wins session store.
///
/// Holds at most `capacity` sessions, evicting the least recently written
/// one. Entries older than the TTL read as absent.
pub struct SessionCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Option<Duration>,
}

impl SessionCache {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let ttl = (config.ttl_secs > 0).then(|| Duration::from_secs(config.ttl_secs));
        Self::new(config.capacity, ttl)
    }

    // Entries are only ever swapped whole, so a poisoned lock still guards
    // consistent data.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Session cache lock was poisoned; recovering");
            poisoned.into_inner()
        })
    }

    /// Replace the entry for `key`.
    pub fn set(&self, key: SessionKey, entry: SessionEntry) {
        let mut inner = self.lock();
        inner.remove(&key);

        while inner.slots.len() >= self.capacity {
            let Some((_, oldest)) = inner.order.pop_first() else {
                break;
            };
            inner.slots.remove(&oldest);
            tracing::debug!(session = %oldest, "Evicted session cache entry");
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, key.clone());
        inner.slots.insert(
            key,
            Slot {
                entry: Arc::new(entry),
                written_at: Instant::now(),
                seq,
            },
        );
    }

    /// The current entry for `key`, if present and not expired.
    pub fn get(&self, key: &SessionKey) -> Option<Arc<SessionEntry>> {
        let mut inner = self.lock();
        let expired = match inner.slots.get(key) {
            None => return None,
            Some(slot) => self
                .ttl
                .is_some_and(|ttl| slot.written_at.elapsed() >= ttl),
        };
        if expired {
            inner.remove(key);
            tracing::debug!(session = %key, "Session cache entry expired");
            return None;
        }
        inner.slots.get(key).map(|slot| Arc::clone(&slot.entry))
    }

    /// Drop the entry for `key`.
    pub fn remove(&self, key: &SessionKey) {
        self.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(query: &str) -> SessionEntry {
        SessionEntry::new(
            query,
            QueryResult::Rows(vec![json!({"n": 1})]),
            Some(ChartType::Bar),
        )
    }

    fn key(k: &str) -> SessionKey {
        SessionKey::new(k)
    }

    // ---- Last-write-wins ----

    #[test]
    fn test_set_then_get() {
        let cache = SessionCache::new(8, None);
        let e1 = entry("db.a.find()");
        cache.set(key("A"), e1.clone());
        assert_eq!(*cache.get(&key("A")).unwrap(), e1);
    }

    #[test]
    fn test_second_set_replaces_first() {
        let cache = SessionCache::new(8, None);
        cache.set(key("A"), entry("db.a.find()"));
        let e2 = SessionEntry::new("db.b.find()", QueryResult::Scalar(3), None);
        cache.set(key("A"), e2.clone());
        assert_eq!(*cache.get(&key("A")).unwrap(), e2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_sessions_are_isolated() {
        let cache = SessionCache::new(8, None);
        cache.set(key("A"), entry("db.a.find()"));
        assert!(cache.get(&key("B")).is_none());
    }

    #[test]
    fn test_get_does_not_consume() {
        let cache = SessionCache::new(8, None);
        cache.set(key("A"), entry("db.a.find()"));
        assert!(cache.get(&key("A")).is_some());
        assert!(cache.get(&key("A")).is_some());
    }

    #[test]
    fn test_remove() {
        let cache = SessionCache::new(8, None);
        cache.set(key("A"), entry("db.a.find()"));
        cache.remove(&key("A"));
        assert!(cache.is_empty());
    }

    // ---- Bounds ----

    #[test]
    fn test_capacity_evicts_least_recently_written() {
        let cache = SessionCache::new(2, None);
        cache.set(key("A"), entry("a"));
        cache.set(key("B"), entry("b"));
        // Rewriting A makes B the oldest.
        cache.set(key("A"), entry("a2"));
        cache.set(key("C"), entry("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("B")).is_none());
        assert_eq!(cache.get(&key("A")).unwrap().query_text, "a2");
        assert!(cache.get(&key("C")).is_some());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = SessionCache::new(0, None);
        cache.set(key("A"), entry("a"));
        assert!(cache.get(&key("A")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = SessionCache::new(8, Some(Duration::from_secs(60)));
        cache.set(key("A"), entry("a"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get(&key("A")).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&key("A")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_from_config_zero_ttl_disables_expiry() {
        let cache = SessionCache::from_config(&CacheConfig {
            capacity: 4,
            ttl_secs: 0,
        });
        assert!(cache.ttl.is_none());
        assert_eq!(cache.capacity, 4);
    }

    // ---- Concurrency ----

    #[test]
    fn test_concurrent_writers_leave_one_whole_entry() {
        let cache = Arc::new(SessionCache::new(8, None));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for j in 0..100 {
                        cache.set(key("shared"), entry(&format!("{}-{}", i, j)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let last = cache.get(&key("shared")).unwrap();
        assert!(last.query_text.ends_with("-99"));
        assert_eq!(cache.len(), 1);
    }
}
