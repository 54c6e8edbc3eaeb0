//! TTL result cache over the shared store.
//!
//! Values are JSON-encoded under `{prefix}:cache:{key}` with a `SETEX`, so
//! every worker sharing the keyspace sees the same cached results and the
//! store drops them on its own once they lapse.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CacheConfig;
use crate::modules::records::{Namespace, PoolError, PoolResult, decode, encode};
use crate::store::SharedStore;

pub struct ResultCache {
    store: Arc<dyn SharedStore>,
    config: CacheConfig,
    keys: Namespace,
}

impl ResultCache {
    pub fn new(store: Arc<dyn SharedStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            keys: Namespace::new("crawlgate", "cache"),
        }
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.keys = Namespace::new(prefix, "cache");
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    /// Cached value for `key`. Entries that no longer decode as `T` are
    /// dropped and reported as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> PoolResult<Option<T>> {
        let store_key = self.keys.key(key);
        let Some(raw) = self.store.get(&store_key).await? else {
            return Ok(None);
        };
        match decode(key, &raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                log::warn!("dropping unreadable cache entry: {err}");
                self.store.del(&store_key).await?;
                Ok(None)
            }
        }
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> PoolResult<()> {
        let raw = encode(key, value)?;
        self.store.set_ex(&self.keys.key(key), &raw, ttl).await?;
        Ok(())
    }

    pub async fn invalidate(&self, key: &str) -> PoolResult<bool> {
        Ok(self.store.del(&self.keys.key(key)).await?)
    }

    /// Return the cached value, or run `compute` and cache what it returns
    /// for `ttl`. Failures are never cached.
    pub async fn get_or_try_insert<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<PoolError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get(key).await? {
            log::debug!("cache hit for {key}");
            return Ok(hit);
        }
        let value = compute().await?;
        self.put(key, &value, ttl).await?;
        Ok(value)
    }
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("keys", &self.keys)
            .field("default_ttl", &self.config.default_ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ManualClock, MemoryStore};
    use std::sync::Mutex;

    fn cache() -> (ResultCache, ManualClock) {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        (ResultCache::new(store, CacheConfig::default()), clock)
    }

    #[tokio::test]
    async fn computes_once_until_the_entry_lapses() {
        let (cache, clock) = cache();
        let counter = Mutex::new(0);
        let calls = &counter;
        let lookup = move || async move {
            *calls.lock().unwrap() += 1;
            Ok::<_, PoolError>(vec!["paper-1".to_string(), "paper-2".to_string()])
        };

        let ttl = Duration::from_secs(3600);
        let first = cache.get_or_try_insert("search:rust", ttl, lookup).await.unwrap();
        let second = cache.get_or_try_insert("search:rust", ttl, lookup).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(*calls.lock().unwrap(), 1);

        clock.advance(Duration::from_secs(3601));
        cache.get_or_try_insert("search:rust", ttl, lookup).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let (cache, _) = cache();
        let ttl = cache.default_ttl();
        let err = cache
            .get_or_try_insert::<String, _, _, _>("k", ttl, || async {
                Err(PoolError::Store(crate::store::StoreError::Backend("down".into())))
            })
            .await;
        assert!(err.is_err());
        assert_eq!(cache.get::<String>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreadable_entries_count_as_misses() {
        let (cache, _) = cache();
        cache.put("k", &"text", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get::<u32>("k").await.unwrap(), None);
        assert!(!cache.invalidate("k").await.unwrap());
    }
}
