//! In-process store backend.
//!
//! Suitable for a single worker process and for tests. Expiry is lazy: a
//! key is dropped the first time it is touched after its deadline, and scans
//! skip (and evict) anything already past it.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::value::Entry;
use super::{Clock, KeyspaceBackend, StoreError, StoreResult, SystemClock};

#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn poisoned() -> StoreError {
        StoreError::Backend("memory store lock poisoned".into())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self.entries.lock().map(|guard| guard.len()).unwrap_or(0);
        f.debug_struct("MemoryStore").field("keys", &keys).finish()
    }
}

impl KeyspaceBackend for MemoryStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn with_entry<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Option<Entry>) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let mut guard = self.entries.lock().map_err(|_| Self::poisoned())?;
        let mut slot = guard.remove(key);
        let result = f(&mut slot);
        if let Some(entry) = slot {
            guard.insert(key.to_string(), entry);
        }
        result
    }

    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = self.clock.now();
        let mut guard = self.entries.lock().map_err(|_| Self::poisoned())?;
        guard.retain(|_, entry| !entry.is_expired(now));
        Ok(guard
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn sweep_expired(&self, prefix: &str) -> StoreResult<usize> {
        let now = self.clock.now();
        let mut guard = self.entries.lock().map_err(|_| Self::poisoned())?;
        let before = guard.len();
        guard.retain(|key, entry| !(key.starts_with(prefix) && entry.is_expired(now)));
        Ok(before - guard.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ManualClock, SharedStore};
    use std::time::Duration;

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::default();
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn ttl_keys_lapse_with_the_clock() {
        let (store, clock) = store();
        store.set_ex("ban:1.2.3.4", "1", Duration::from_secs(600)).await.unwrap();
        assert!(store.exists("ban:1.2.3.4").await.unwrap());
        assert_eq!(
            store.ttl("ban:1.2.3.4").await.unwrap(),
            Some(Duration::from_secs(600))
        );

        clock.advance(Duration::from_secs(601));
        assert!(!store.exists("ban:1.2.3.4").await.unwrap());
        assert!(store.scan_prefix("ban:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_deletes_only_expired_keys_under_prefix() {
        let (store, clock) = store();
        for i in 0..500 {
            let key = format!("gw:rate_limit:10.0.{}.{}", i / 256, i % 256);
            store.set_ex(&key, "9", Duration::from_secs(60)).await.unwrap();
        }
        store.set_ex("gw:bans:10.9.9.9", "1", Duration::from_secs(60)).await.unwrap();
        store.hset("gw:identities", "a", "{}").await.unwrap();

        clock.advance(Duration::from_secs(3600));
        assert_eq!(store.purge_expired("gw:rate_limit:").await.unwrap(), 500);
        assert_eq!(store.entries.lock().unwrap().len(), 2);
        assert_eq!(store.purge_expired("gw:").await.unwrap(), 1);
        assert_eq!(store.scan_prefix("gw:").await.unwrap(), vec!["gw:identities".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_not_lost() {
        let (store, _) = store();
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..64 {
            let store = store.clone();
            tasks.spawn(async move { store.hincr_by("fails", "a", 1).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }
        assert_eq!(store.hget("fails", "a").await.unwrap().as_deref(), Some("64"));
    }

    #[tokio::test]
    async fn set_nx_only_creates_once() {
        let (store, _) = store();
        assert!(store.set_nx_ex("w", "9", Duration::from_secs(60)).await.unwrap());
        assert!(!store.set_nx_ex("w", "9", Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.decr_existing("w").await.unwrap(), Some(8));
        assert_eq!(store.decr_existing("missing").await.unwrap(), None);
        assert!(!store.exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn hashes_support_counters_and_replacement() {
        let (store, _) = store();
        store.hset("pool", "a", "{}").await.unwrap();
        store.hset("pool", "b", "{}").await.unwrap();
        assert_eq!(store.hlen("pool").await.unwrap(), 2);
        assert_eq!(store.hincr_by("fails", "a", 1).await.unwrap(), 1);
        assert_eq!(store.hincr_by("fails", "a", 1).await.unwrap(), 2);

        let mut fresh = HashMap::new();
        fresh.insert("c".to_string(), "{}".to_string());
        store.hreplace("pool", fresh).await.unwrap();
        let all = store.hgetall("pool").await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("c"));

        assert!(store.hdel("pool", "c").await.unwrap());
        assert!(store.scan_prefix("pool").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lists_push_left_and_trim() {
        let (store, _) = store();
        for i in 0..5 {
            store.lpush("patterns:x", &i.to_string()).await.unwrap();
        }
        store.ltrim("patterns:x", 0, 2).await.unwrap();
        assert_eq!(store.lrange_all("patterns:x").await.unwrap(), vec!["4", "3", "2"]);
        assert_eq!(store.lrem("patterns:x", "3").await.unwrap(), 1);
        assert_eq!(store.lrange_all("patterns:x").await.unwrap(), vec!["4", "2"]);
    }
}
