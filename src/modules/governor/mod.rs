//! Per-source traffic governance.
//!
//! Tracks request telemetry per source, derives a bot-likelihood score from
//! it, and enforces bans and a fixed-window rate limit. Risk is recomputed
//! on demand from the stored patterns; no state label is persisted.

mod scoring;

pub use scoring::score_patterns;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GovernorConfig;
use crate::modules::maintenance::{LoopSchedule, MaintenanceError, run_forever};
use crate::modules::records::{Namespace, PoolResult, encode};
use crate::store::value::chrono_duration;
use crate::store::{Clock, SharedStore, StoreResult, SystemClock};

/// Request attributes captured for scoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    pub path: String,
    pub method: String,
    pub user_agent: Option<String>,
    pub query_params: BTreeMap<String, String>,
}

impl RequestMeta {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(name.into(), value.into());
        self
    }
}

/// One observed request, stored newest-first per source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub timestamp: DateTime<Utc>,
    pub path: String,
    pub method: String,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
}

/// Where a source currently sits, derived from its patterns and ban key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Unknown,
    Tracked,
    LowRisk,
    MediumRisk,
    HighRisk,
    Banned,
}

#[derive(Debug, Clone)]
struct GovernorKeys {
    patterns: Namespace,
    bans: Namespace,
    rate: Namespace,
}

pub struct TrafficGovernor {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: GovernorConfig,
    keys: GovernorKeys,
}

impl TrafficGovernor {
    pub fn new(store: Arc<dyn SharedStore>, config: GovernorConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config,
            keys: Self::keys_for("crawlgate"),
        }
    }

    fn keys_for(prefix: &str) -> GovernorKeys {
        GovernorKeys {
            patterns: Namespace::new(prefix, "patterns"),
            bans: Namespace::new(prefix, "bans"),
            rate: Namespace::new(prefix, "rate_limit"),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.keys = Self::keys_for(prefix);
        self
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Append a pattern record, keeping only the newest `pattern_limit`.
    pub async fn record_pattern(&self, source: &str, meta: &RequestMeta) -> PoolResult<()> {
        let record = PatternRecord {
            timestamp: self.clock.now(),
            path: meta.path.clone(),
            method: meta.method.clone(),
            user_agent: meta.user_agent.clone(),
            query_params: meta.query_params.clone(),
        };
        let key = self.keys.patterns.key(source);
        self.store.lpush(&key, &encode(source, &record)?).await?;
        let limit = self.config.pattern_limit.max(1);
        self.store.ltrim(&key, 0, limit - 1).await?;
        Ok(())
    }

    /// Stored patterns, newest first. Undecodable entries are skipped.
    pub async fn patterns(&self, source: &str) -> StoreResult<Vec<PatternRecord>> {
        let raw = self.store.lrange_all(&self.keys.patterns.key(source)).await?;
        Ok(raw
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect())
    }

    pub async fn risk_score(&self, source: &str) -> StoreResult<f64> {
        Ok(score_patterns(&self.patterns(source).await?))
    }

    /// Pre-request delay: uniform base, scaled up for risky sources.
    /// Callers await it before issuing the outbound attempt.
    pub async fn compute_delay(&self, source: &str) -> StoreResult<Duration> {
        let score = self.risk_score(source).await?;
        let (low, high) = self.config.base_delay;
        let base = if high > low {
            rand::thread_rng().gen_range(low..high)
        } else {
            low.max(0.0)
        };
        let factor = if score > self.config.high_risk {
            3.0
        } else if score > self.config.medium_risk {
            2.0
        } else {
            1.0
        };
        Ok(Duration::from_secs_f64(base * factor))
    }

    pub async fn is_banned(&self, source: &str) -> StoreResult<bool> {
        self.store.exists(&self.keys.bans.key(source)).await
    }

    /// Ban duration for a given score. Both thresholds are strict.
    pub fn ban_tier(&self, score: f64) -> Duration {
        let tiers = &self.config.ban_tiers;
        if score > self.config.high_risk {
            tiers.high
        } else if score > self.config.medium_risk {
            tiers.medium
        } else {
            tiers.low
        }
    }

    /// Ban `source` for a tier chosen by its current score. A repeat call
    /// starts a fresh TTL. Returns the applied ban duration.
    pub async fn deny_access(&self, source: &str) -> StoreResult<Duration> {
        let score = self.risk_score(source).await?;
        let ttl = self.ban_tier(score);
        self.store
            .set_ex(&self.keys.bans.key(source), &format!("{score:.3}"), ttl)
            .await?;
        log::warn!("source {source} banned for {ttl:?} (risk {score:.2})");
        Ok(ttl)
    }

    /// Fixed-window limiter: the first call opens a window of
    /// `rate_limit_capacity` calls that lasts `rate_window`.
    pub async fn check_rate_limit(&self, source: &str) -> StoreResult<bool> {
        let capacity = i64::from(self.config.rate_limit_capacity);
        if capacity == 0 {
            return Ok(false);
        }
        let key = self.keys.rate.key(source);
        loop {
            if let Some(remaining) = self.store.decr_existing(&key).await? {
                let allowed = remaining >= 0;
                if !allowed {
                    log::debug!("rate limit hit for {source}");
                }
                return Ok(allowed);
            }
            // the first caller of a window consumes one token while creating it
            let opened = self
                .store
                .set_nx_ex(&key, &(capacity - 1).to_string(), self.config.rate_window)
                .await?;
            if opened {
                return Ok(true);
            }
        }
    }

    pub async fn state(&self, source: &str) -> StoreResult<SourceState> {
        if self.is_banned(source).await? {
            return Ok(SourceState::Banned);
        }
        let patterns = self.patterns(source).await?;
        let state = match patterns.len() {
            0 => SourceState::Unknown,
            1 => SourceState::Tracked,
            _ => {
                let score = score_patterns(&patterns);
                if score > self.config.high_risk {
                    SourceState::HighRisk
                } else if score > self.config.medium_risk {
                    SourceState::MediumRisk
                } else {
                    SourceState::LowRisk
                }
            }
        };
        Ok(state)
    }

    /// Drop pattern records older than `pattern_max_age` for every source,
    /// then delete lapsed ban and rate-window keys. Returns the number of
    /// pattern records removed.
    pub async fn purge_old(&self) -> StoreResult<usize> {
        let cutoff = self.clock.now() - chrono_duration(self.config.pattern_max_age);
        let prefix = self.keys.patterns.key("");
        let mut removed = 0;

        for key in self.store.scan_prefix(&prefix).await? {
            for raw in self.store.lrange_all(&key).await? {
                let stale = match serde_json::from_str::<PatternRecord>(&raw) {
                    Ok(record) => record.timestamp < cutoff,
                    Err(_) => true,
                };
                if stale {
                    removed += self.store.lrem(&key, &raw).await?;
                }
            }
        }
        if removed > 0 {
            log::info!("purged {removed} stale pattern records");
        }

        let lapsed = self.store.purge_expired(&self.keys.bans.key("")).await?
            + self.store.purge_expired(&self.keys.rate.key("")).await?;
        if lapsed > 0 {
            log::debug!("dropped {lapsed} lapsed ban and rate-window keys");
        }
        Ok(removed)
    }

    /// Never-ending purge loop.
    pub async fn monitor(self: Arc<Self>) {
        let schedule = LoopSchedule::new(self.config.purge_interval, self.config.error_backoff);
        run_forever("traffic-governor", schedule, move || {
            let governor = Arc::clone(&self);
            async move {
                governor
                    .purge_old()
                    .await
                    .map(|_| ())
                    .map_err(MaintenanceError::from)
            }
        })
        .await
    }
}

impl fmt::Debug for TrafficGovernor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrafficGovernor")
            .field("keys", &self.keys)
            .field("rate_limit_capacity", &self.config.rate_limit_capacity)
            .finish()
    }
}
