//! Single-host persistent store backend on top of `redb`.
//!
//! Each store operation runs inside one redb write transaction on tokio's
//! blocking pool, which makes it atomic for the touched key. redb holds an exclusive file lock, so all
//! workers sharing a `RedbStore` must live in the same process; fleets of
//! processes need a networked backend implementing [`SharedStore`].
//!
//! [`SharedStore`]: super::SharedStore

use chrono::{DateTime, Utc};
use redb::{Database, Durability, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

use super::value::Entry;
use super::{Clock, KeyspaceBackend, StoreError, StoreResult, SystemClock};

const KEYSPACE: TableDefinition<&str, &[u8]> = TableDefinition::new("crawlgate_keyspace");

fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl RedbStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let db = Database::create(path.as_ref()).map_err(backend)?;
        let txn = db.begin_write().map_err(backend)?;
        {
            txn.open_table(KEYSPACE).map_err(backend)?;
        }
        txn.commit().map_err(backend)?;
        log::info!("opened redb keyspace at {}", path.as_ref().display());
        Ok(Self {
            db: Arc::new(db),
            clock,
        })
    }

    fn decode(raw: &[u8]) -> StoreResult<Entry> {
        Ok(serde_json::from_slice(raw)?)
    }

    fn begin_write(&self) -> StoreResult<redb::WriteTransaction> {
        let mut txn = self.db.begin_write().map_err(backend)?;
        // State is ephemeral by contract; skip the fsync on every operation.
        txn.set_durability(Durability::Eventual);
        Ok(txn)
    }

    /// Walk the keys under `prefix`, deleting the expired ones. Returns the
    /// live keys and the number of deleted rows.
    fn sweep(&self, prefix: &str) -> StoreResult<(Vec<String>, usize)> {
        let now = self.clock.now();
        let txn = self.begin_write()?;
        let (live, expired) = {
            let mut table = txn.open_table(KEYSPACE).map_err(backend)?;
            let mut live = Vec::new();
            let mut expired = Vec::new();
            for item in table.range(prefix..).map_err(backend)? {
                let (key, raw) = item.map_err(backend)?;
                let key = key.value();
                if !key.starts_with(prefix) {
                    break;
                }
                if Self::decode(raw.value())?.is_expired(now) {
                    expired.push(key.to_string());
                } else {
                    live.push(key.to_string());
                }
            }
            for key in &expired {
                table.remove(key.as_str()).map_err(backend)?;
            }
            (live, expired.len())
        };
        txn.commit().map_err(backend)?;
        Ok((live, expired))
    }
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl KeyspaceBackend for RedbStore {
    const BLOCKING: bool = true;

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn with_entry<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Option<Entry>) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let txn = self.begin_write()?;
        let result = {
            let mut table = txn.open_table(KEYSPACE).map_err(backend)?;
            let mut slot = match table.get(key).map_err(backend)? {
                Some(raw) => Some(Self::decode(raw.value())?),
                None => None,
            };
            let result = f(&mut slot)?;
            match slot {
                Some(entry) => {
                    let encoded = serde_json::to_vec(&entry)?;
                    table.insert(key, encoded.as_slice()).map_err(backend)?;
                }
                None => {
                    table.remove(key).map_err(backend)?;
                }
            }
            result
        };
        txn.commit().map_err(backend)?;
        Ok(result)
    }

    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self.sweep(prefix)?.0)
    }

    fn sweep_expired(&self, prefix: &str) -> StoreResult<usize> {
        Ok(self.sweep(prefix)?.1)
    }
}
