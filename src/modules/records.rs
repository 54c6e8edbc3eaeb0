//! Store-resident record encoding shared by the pools.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::store::StoreError;

/// Failures raised by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("malformed record '{id}': {source}")]
    Malformed {
        id: String,
        source: serde_json::Error,
    },
    #[error("failed to encode record '{id}': {source}")]
    Encode {
        id: String,
        source: serde_json::Error,
    },
}

pub type PoolResult<T> = Result<T, PoolError>;

pub(crate) fn encode<T: Serialize>(id: &str, record: &T) -> PoolResult<String> {
    serde_json::to_string(record).map_err(|source| PoolError::Encode {
        id: id.to_string(),
        source,
    })
}

pub(crate) fn decode<T: DeserializeOwned>(id: &str, raw: &str) -> PoolResult<T> {
    serde_json::from_str(raw).map_err(|source| PoolError::Malformed {
        id: id.to_string(),
        source,
    })
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

pub(crate) fn parse_count(raw: Option<&String>) -> u64 {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .map(|value| value.max(0) as u64)
        .unwrap_or(0)
}

/// Store key namespace for one pool or governor instance.
#[derive(Debug, Clone)]
pub(crate) struct Namespace(String);

impl Namespace {
    pub(crate) fn new(prefix: &str, component: &str) -> Self {
        Self(format!("{prefix}:{component}"))
    }

    pub(crate) fn key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.0)
    }
}
