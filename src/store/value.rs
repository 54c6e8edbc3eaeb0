//! Value model shared by the in-process store backends.
//!
//! Every key holds one [`Entry`]: a typed value plus an optional absolute
//! expiry. Backends only need to hand out exclusive access to a single slot;
//! the operations below implement the per-key semantics on top of that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use super::{StoreError, StoreResult};

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| {
        let millis = duration.as_millis().min(i64::MAX as u128);
        chrono::Duration::milliseconds(millis as i64)
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub value: Value,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Exclusive view over one key. Expired entries are dropped on construction,
/// so callers only ever observe live values.
pub struct Slot<'a> {
    key: &'a str,
    now: DateTime<Utc>,
    entry: &'a mut Option<Entry>,
}

impl<'a> Slot<'a> {
    pub fn new(key: &'a str, now: DateTime<Utc>, entry: &'a mut Option<Entry>) -> Self {
        if entry.as_ref().is_some_and(|e| e.is_expired(now)) {
            *entry = None;
        }
        Self { key, now, entry }
    }

    fn wrong_type(&self) -> StoreError {
        StoreError::WrongType(self.key.to_string())
    }

    pub fn exists(&self) -> bool {
        self.entry.is_some()
    }

    pub fn remove(&mut self) -> bool {
        self.entry.take().is_some()
    }

    pub fn remaining_ttl(&self) -> Option<Duration> {
        let expires_at = self.entry.as_ref()?.expires_at?;
        (expires_at - self.now).to_std().ok()
    }

    pub fn get_str(&self) -> StoreResult<Option<String>> {
        match self.entry.as_ref().map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(self.wrong_type()),
        }
    }

    pub fn set_str(&mut self, value: &str, ttl: Option<Duration>) {
        *self.entry = Some(Entry {
            value: Value::Str(value.to_string()),
            expires_at: ttl.map(|ttl| self.now + chrono_duration(ttl)),
        });
    }

    /// Decrements an existing integer, keeping its expiry. Missing keys are
    /// left untouched so a lapsed window is never resurrected without a TTL.
    pub fn decr_existing(&mut self) -> StoreResult<Option<i64>> {
        let key = self.key.to_string();
        let Some(entry) = self.entry.as_mut() else {
            return Ok(None);
        };
        let Value::Str(raw) = &mut entry.value else {
            return Err(StoreError::WrongType(key));
        };
        let current: i64 = raw
            .trim()
            .parse()
            .map_err(|_| StoreError::NotInteger(key))?;
        let next = current - 1;
        *raw = next.to_string();
        Ok(Some(next))
    }

    pub fn hash(&self) -> StoreResult<Option<&HashMap<String, String>>> {
        match self.entry.as_ref().map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(map)) => Ok(Some(map)),
            Some(_) => Err(self.wrong_type()),
        }
    }

    pub fn hash_mut(&mut self) -> StoreResult<&mut HashMap<String, String>> {
        if self.entry.is_none() {
            *self.entry = Some(Entry::new(Value::Hash(HashMap::new())));
        }
        let key = self.key.to_string();
        match self.entry.as_mut().map(|e| &mut e.value) {
            Some(Value::Hash(map)) => Ok(map),
            _ => Err(StoreError::WrongType(key)),
        }
    }

    pub fn list(&self) -> StoreResult<Option<&VecDeque<String>>> {
        match self.entry.as_ref().map(|e| &e.value) {
            None => Ok(None),
            Some(Value::List(list)) => Ok(Some(list)),
            Some(_) => Err(self.wrong_type()),
        }
    }

    pub fn list_mut(&mut self) -> StoreResult<&mut VecDeque<String>> {
        if self.entry.is_none() {
            *self.entry = Some(Entry::new(Value::List(VecDeque::new())));
        }
        let key = self.key.to_string();
        match self.entry.as_mut().map(|e| &mut e.value) {
            Some(Value::List(list)) => Ok(list),
            _ => Err(StoreError::WrongType(key)),
        }
    }

    /// Drops empty collections so they disappear from key scans.
    pub fn compact(&mut self) {
        let empty = match self.entry.as_ref().map(|e| &e.value) {
            Some(Value::Hash(map)) => map.is_empty(),
            Some(Value::List(list)) => list.is_empty(),
            _ => false,
        };
        if empty {
            *self.entry = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_are_invisible() {
        let now = Utc::now();
        let mut entry = Some(Entry {
            value: Value::Str("1".into()),
            expires_at: Some(now - chrono::Duration::seconds(1)),
        });
        let slot = Slot::new("ban", now, &mut entry);
        assert!(!slot.exists());
        assert!(entry.is_none());
    }

    #[test]
    fn decrement_keeps_expiry_and_skips_missing_keys() {
        let now = Utc::now();
        let mut missing = None;
        assert_eq!(Slot::new("k", now, &mut missing).decr_existing().unwrap(), None);
        assert!(missing.is_none());

        let mut entry = None;
        let mut slot = Slot::new("k", now, &mut entry);
        slot.set_str("2", Some(Duration::from_secs(60)));
        assert_eq!(slot.decr_existing().unwrap(), Some(1));
        assert!(slot.remaining_ttl().is_some());
    }

    #[test]
    fn type_mismatch_is_reported() {
        let now = Utc::now();
        let mut entry = None;
        let mut slot = Slot::new("k", now, &mut entry);
        slot.set_str("x", None);
        assert!(matches!(slot.hash_mut(), Err(StoreError::WrongType(_))));
        assert!(matches!(slot.decr_existing(), Err(StoreError::NotInteger(_))));
    }
}
