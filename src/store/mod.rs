//! Shared key-value store contract.
//!
//! Pools and the governor keep all of their state behind [`SharedStore`] so
//! several workers (or processes, given a networked backend) can run the core
//! against the same keyspace. Every mutating operation is atomic per key; no
//! multi-key transactions are assumed anywhere in the crate.

pub mod clock;
pub mod memory;
pub mod redb_store;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use value::{Entry, Slot};

/// Failures surfaced by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("key '{0}' holds a value of the wrong type")]
    WrongType(String),
    #[error("key '{0}' does not hold an integer")]
    NotInteger(String),
    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Store primitives consumed by the pools and the traffic governor.
///
/// Semantics follow the usual Redis vocabulary: string keys with TTL,
/// per-key hashes, left-pushed lists and prefix scans.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// `SETEX`: overwrite `key` with a string value that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;
    /// `SET NX EX`: create `key` only when absent. Returns whether it was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn exists(&self, key: &str) -> StoreResult<bool>;
    async fn del(&self, key: &str) -> StoreResult<bool>;
    /// Remaining time to live, `None` for missing keys or keys without expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;
    /// Atomically decrement an existing integer key, preserving its TTL.
    /// Returns `None` (and creates nothing) when the key is absent.
    async fn decr_existing(&self, key: &str) -> StoreResult<Option<i64>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;
    async fn hlen(&self, key: &str) -> StoreResult<usize>;
    /// `HINCRBY`: returns the value after the increment.
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;
    /// Replace the whole hash at `key` with `fields` in one step.
    async fn hreplace(&self, key: &str, fields: HashMap<String, String>) -> StoreResult<()>;

    /// `LPUSH`: returns the list length after the push.
    async fn lpush(&self, key: &str, value: &str) -> StoreResult<usize>;
    /// `LTRIM` with inclusive bounds.
    async fn ltrim(&self, key: &str, start: usize, stop: usize) -> StoreResult<()>;
    /// Whole list, head first.
    async fn lrange_all(&self, key: &str) -> StoreResult<Vec<String>>;
    /// `LREM key 0 value`: removes every occurrence, returns how many.
    async fn lrem(&self, key: &str, value: &str) -> StoreResult<usize>;

    /// Live keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
    /// Delete every expired key starting with `prefix`; returns how many.
    async fn purge_expired(&self, prefix: &str) -> StoreResult<usize>;
}

/// Low-level hook for local backends: exclusive access to one key's entry
/// at a time. Implementors get [`SharedStore`] for free.
pub trait KeyspaceBackend: Clone + Send + Sync + 'static {
    /// Backends whose calls do file I/O run them on tokio's blocking pool.
    const BLOCKING: bool = false;

    fn now(&self) -> DateTime<Utc>;

    fn with_entry<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Option<Entry>) -> StoreResult<R>,
    ) -> StoreResult<R>;

    /// Live keys under `prefix`. Expired entries met on the way are deleted.
    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Delete expired entries under `prefix`; returns how many.
    fn sweep_expired(&self, prefix: &str) -> StoreResult<usize>;
}

fn with_slot<B, R>(
    backend: &B,
    key: &str,
    f: impl FnOnce(&mut Slot<'_>) -> StoreResult<R>,
) -> StoreResult<R>
where
    B: KeyspaceBackend,
{
    let now = backend.now();
    backend.with_entry(key, |entry| {
        let mut slot = Slot::new(key, now, entry);
        let result = f(&mut slot)?;
        slot.compact();
        Ok(result)
    })
}

async fn offload<B, R, F>(backend: &B, f: F) -> StoreResult<R>
where
    B: KeyspaceBackend,
    R: Send + 'static,
    F: FnOnce(&B) -> StoreResult<R> + Send + 'static,
{
    if !B::BLOCKING {
        return f(backend);
    }
    let backend = backend.clone();
    tokio::task::spawn_blocking(move || f(&backend))
        .await
        .map_err(|err| StoreError::Backend(format!("store task failed: {err}")))?
}

#[async_trait]
impl<B> SharedStore for B
where
    B: KeyspaceBackend,
{
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let (key, value) = (key.to_string(), value.to_string());
        offload(self, move |b| {
            with_slot(b, &key, |slot| {
                slot.set_str(&value, Some(ttl));
                Ok(())
            })
        })
        .await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let (key, value) = (key.to_string(), value.to_string());
        offload(self, move |b| {
            with_slot(b, &key, |slot| {
                if slot.exists() {
                    return Ok(false);
                }
                slot.set_str(&value, Some(ttl));
                Ok(true)
            })
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        offload(self, move |b| with_slot(b, &key, |slot| slot.get_str())).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        offload(self, move |b| with_slot(b, &key, |slot| Ok(slot.exists()))).await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        offload(self, move |b| with_slot(b, &key, |slot| Ok(slot.remove()))).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let key = key.to_string();
        offload(self, move |b| with_slot(b, &key, |slot| Ok(slot.remaining_ttl()))).await
    }

    async fn decr_existing(&self, key: &str) -> StoreResult<Option<i64>> {
        let key = key.to_string();
        offload(self, move |b| with_slot(b, &key, |slot| slot.decr_existing())).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let (key, field, value) = (key.to_string(), field.to_string(), value.to_string());
        offload(self, move |b| {
            with_slot(b, &key, |slot| {
                slot.hash_mut()?.insert(field, value);
                Ok(())
            })
        })
        .await
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let (key, field) = (key.to_string(), field.to_string());
        offload(self, move |b| {
            with_slot(b, &key, |slot| {
                Ok(slot.hash()?.and_then(|map| map.get(&field).cloned()))
            })
        })
        .await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let key = key.to_string();
        offload(self, move |b| {
            with_slot(b, &key, |slot| Ok(slot.hash()?.cloned().unwrap_or_default()))
        })
        .await
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let (key, field) = (key.to_string(), field.to_string());
        offload(self, move |b| {
            with_slot(b, &key, |slot| {
                if slot.hash()?.is_none() {
                    return Ok(false);
                }
                Ok(slot.hash_mut()?.remove(&field).is_some())
            })
        })
        .await
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        let key = key.to_string();
        offload(self, move |b| {
            with_slot(b, &key, |slot| Ok(slot.hash()?.map_or(0, |map| map.len())))
        })
        .await
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let (key, field) = (key.to_string(), field.to_string());
        offload(self, move |b| {
            with_slot(b, &key, |slot| {
                let map = slot.hash_mut()?;
                let current = match map.get(&field) {
                    Some(raw) => raw
                        .trim()
                        .parse::<i64>()
                        .map_err(|_| StoreError::NotInteger(format!("{key}.{field}")))?,
                    None => 0,
                };
                let next = current.saturating_add(delta);
                map.insert(field.clone(), next.to_string());
                Ok(next)
            })
        })
        .await
    }

    async fn hreplace(&self, key: &str, fields: HashMap<String, String>) -> StoreResult<()> {
        let key = key.to_string();
        offload(self, move |b| {
            with_slot(b, &key, |slot| {
                slot.remove();
                if !fields.is_empty() {
                    *slot.hash_mut()? = fields;
                }
                Ok(())
            })
        })
        .await
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<usize> {
        let (key, value) = (key.to_string(), value.to_string());
        offload(self, move |b| {
            with_slot(b, &key, |slot| {
                let list = slot.list_mut()?;
                list.push_front(value);
                Ok(list.len())
            })
        })
        .await
    }

    async fn ltrim(&self, key: &str, start: usize, stop: usize) -> StoreResult<()> {
        let key = key.to_string();
        offload(self, move |b| {
            with_slot(b, &key, |slot| {
                if slot.list()?.is_none() {
                    return Ok(());
                }
                let list = slot.list_mut()?;
                if start > stop || start >= list.len() {
                    list.clear();
                    return Ok(());
                }
                list.truncate(stop.saturating_add(1));
                list.drain(..start);
                Ok(())
            })
        })
        .await
    }

    async fn lrange_all(&self, key: &str) -> StoreResult<Vec<String>> {
        let key = key.to_string();
        offload(self, move |b| {
            with_slot(b, &key, |slot| {
                Ok(slot
                    .list()?
                    .map(|list| list.iter().cloned().collect())
                    .unwrap_or_default())
            })
        })
        .await
    }

    async fn lrem(&self, key: &str, value: &str) -> StoreResult<usize> {
        let (key, value) = (key.to_string(), value.to_string());
        offload(self, move |b| {
            with_slot(b, &key, |slot| {
                if slot.list()?.is_none() {
                    return Ok(0);
                }
                let list = slot.list_mut()?;
                let before = list.len();
                list.retain(|item| *item != value);
                Ok(before - list.len())
            })
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let prefix = prefix.to_string();
        offload(self, move |b| b.keys_with_prefix(&prefix)).await
    }

    async fn purge_expired(&self, prefix: &str) -> StoreResult<usize> {
        let prefix = prefix.to_string();
        offload(self, move |b| b.sweep_expired(&prefix)).await
    }
}
