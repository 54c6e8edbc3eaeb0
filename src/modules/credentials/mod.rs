//! Renewable pool of authenticated sessions.
//!
//! Identities live in four store hashes keyed by identity id: the immutable
//! login record, the last-lease timestamp, and the success/failure counters.
//! Splitting them keeps every mutation a single-field atomic write, so
//! concurrent leases never clobber failure accounting.

use chrono::{DateTime, Utc};
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CredentialConfig;
use crate::external_deps::login::{Account, LoginProvider};
use crate::external_deps::probe::{ProbeRoute, TargetProbe};
use crate::modules::maintenance::{LoopSchedule, MaintenanceError, run_forever};
use crate::modules::records::{
    Namespace, PoolResult, decode, encode, parse_count, parse_timestamp,
};
use crate::store::{Clock, SharedStore, SystemClock};

/// Opaque session material (cookies, tokens) returned by a login.
pub type CredentialSet = BTreeMap<String, String>;

/// An authenticated session owned by the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: String,
    pub credentials: CredentialSet,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub fail_count: u64,
}

impl Identity {
    /// Build a fresh identity keyed by the session token under `session_key`.
    pub fn from_credentials(
        credentials: CredentialSet,
        session_key: &str,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let id = credentials.get(session_key)?.clone();
        if id.is_empty() {
            return None;
        }
        Some(Self {
            id,
            credentials,
            created_at: now,
            last_used_at: None,
            success_count: 0,
            fail_count: 0,
        })
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }
}

/// Transient copy handed to callers; the pool keeps the canonical record.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityLease {
    pub id: String,
    pub credentials: CredentialSet,
}

/// Why an identity left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    FailureThreshold,
    Expired,
    ProbeFailed,
    Invalidated,
}

impl EvictionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EvictionReason::FailureThreshold => "failure_threshold",
            EvictionReason::Expired => "expired",
            EvictionReason::ProbeFailed => "probe_failed",
            EvictionReason::Invalidated => "invalidated",
        }
    }
}

/// Outcome of one validation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    pub checked: usize,
    pub expired: usize,
    pub dead: usize,
    /// Bookkeeping fields left behind by identities that are gone.
    pub orphans: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityRecord {
    credentials: CredentialSet,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct PoolKeys {
    identities: String,
    last_used: String,
    successes: String,
    failures: String,
}

impl PoolKeys {
    fn new(namespace: &Namespace) -> Self {
        Self {
            identities: namespace.key("identities"),
            last_used: namespace.key("last_used"),
            successes: namespace.key("successes"),
            failures: namespace.key("failures"),
        }
    }
}

pub struct CredentialPool {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: CredentialConfig,
    keys: PoolKeys,
    login: Arc<dyn LoginProvider>,
    probe: Arc<dyn TargetProbe>,
    accounts: Vec<Account>,
}

impl CredentialPool {
    pub fn new(
        store: Arc<dyn SharedStore>,
        config: CredentialConfig,
        login: Arc<dyn LoginProvider>,
        probe: Arc<dyn TargetProbe>,
    ) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config,
            keys: PoolKeys::new(&Namespace::new("crawlgate", "credentials")),
            login,
            probe,
            accounts: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Scope this pool's keys under `prefix`.
    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.keys = PoolKeys::new(&Namespace::new(prefix, "credentials"));
        self
    }

    pub fn with_accounts(mut self, accounts: Vec<Account>) -> Self {
        self.accounts = accounts;
        self
    }

    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    /// Pick a uniformly random live identity and stamp its last use.
    ///
    /// `None` means the pool is empty; callers should treat it as a
    /// retry-later condition.
    pub async fn lease(&self) -> PoolResult<Option<IdentityLease>> {
        let records = self.store.hgetall(&self.keys.identities).await?;
        let picked = {
            let mut rng = rand::thread_rng();
            records.into_iter().choose(&mut rng)
        };
        let Some((id, raw)) = picked else {
            return Ok(None);
        };
        let record: IdentityRecord = decode(&id, &raw)?;
        self.store
            .hset(&self.keys.last_used, &id, &self.clock.now().to_rfc3339())
            .await?;
        log::debug!("leased identity {}", short_id(&id));
        Ok(Some(IdentityLease {
            id,
            credentials: record.credentials,
        }))
    }

    /// Record the result of a call made with identity `id`.
    ///
    /// Reaching the failure threshold evicts the identity immediately.
    /// Reports for identities already gone are ignored.
    pub async fn report_outcome(&self, id: &str, success: bool) -> PoolResult<()> {
        if self.store.hget(&self.keys.identities, id).await?.is_none() {
            log::debug!("outcome for unknown identity {} ignored", short_id(id));
            return Ok(());
        }

        if success {
            self.store.hincr_by(&self.keys.successes, id, 1).await?;
            return Ok(());
        }

        let failures = self.store.hincr_by(&self.keys.failures, id, 1).await?;
        if failures >= i64::from(self.config.max_failures) {
            self.evict(id, EvictionReason::FailureThreshold).await?;
        }
        Ok(())
    }

    /// Insert or overwrite an identity, resetting its bookkeeping.
    pub async fn add(&self, identity: Identity) -> PoolResult<()> {
        let record = IdentityRecord {
            credentials: identity.credentials,
            created_at: identity.created_at,
        };
        let id = identity.id;
        self.store
            .hset(&self.keys.identities, &id, &encode(&id, &record)?)
            .await?;
        self.store
            .hset(&self.keys.successes, &id, &identity.success_count.to_string())
            .await?;
        self.store
            .hset(&self.keys.failures, &id, &identity.fail_count.to_string())
            .await?;
        match identity.last_used_at {
            Some(at) => self.store.hset(&self.keys.last_used, &id, &at.to_rfc3339()).await?,
            None => {
                self.store.hdel(&self.keys.last_used, &id).await?;
            }
        }
        log::info!("identity {} added to pool", short_id(&id));
        Ok(())
    }

    pub async fn size(&self) -> PoolResult<usize> {
        Ok(self.store.hlen(&self.keys.identities).await?)
    }

    pub async fn get(&self, id: &str) -> PoolResult<Option<Identity>> {
        let Some(raw) = self.store.hget(&self.keys.identities, id).await? else {
            return Ok(None);
        };
        let record: IdentityRecord = decode(id, &raw)?;
        let last_used = self.store.hget(&self.keys.last_used, id).await?;
        let successes = self.store.hget(&self.keys.successes, id).await?;
        let failures = self.store.hget(&self.keys.failures, id).await?;
        Ok(Some(Identity {
            id: id.to_string(),
            credentials: record.credentials,
            created_at: record.created_at,
            last_used_at: last_used.as_deref().and_then(parse_timestamp),
            success_count: parse_count(successes.as_ref()),
            fail_count: parse_count(failures.as_ref()),
        }))
    }

    /// Snapshot of every identity currently in the pool.
    pub async fn identities(&self) -> PoolResult<Vec<Identity>> {
        let records = self.store.hgetall(&self.keys.identities).await?;
        let last_used = self.store.hgetall(&self.keys.last_used).await?;
        let successes = self.store.hgetall(&self.keys.successes).await?;
        let failures = self.store.hgetall(&self.keys.failures).await?;

        let mut identities = Vec::with_capacity(records.len());
        for (id, raw) in records {
            let record: IdentityRecord = match decode(&id, &raw) {
                Ok(record) => record,
                Err(err) => {
                    log::warn!("skipping identity record: {err}");
                    continue;
                }
            };
            identities.push(Identity {
                last_used_at: last_used.get(&id).and_then(|raw| parse_timestamp(raw)),
                success_count: parse_count(successes.get(&id)),
                fail_count: parse_count(failures.get(&id)),
                credentials: record.credentials,
                created_at: record.created_at,
                id,
            });
        }
        Ok(identities)
    }

    /// Explicitly drop an identity. Returns whether it was present.
    pub async fn invalidate(&self, id: &str) -> PoolResult<bool> {
        self.evict(id, EvictionReason::Invalidated).await
    }

    async fn evict(&self, id: &str, reason: EvictionReason) -> PoolResult<bool> {
        let removed = self.store.hdel(&self.keys.identities, id).await?;
        self.store.hdel(&self.keys.last_used, id).await?;
        self.store.hdel(&self.keys.successes, id).await?;
        self.store.hdel(&self.keys.failures, id).await?;
        if removed {
            log::warn!("identity {} evicted ({})", short_id(id), reason.as_str());
        }
        Ok(removed)
    }

    /// Log in with roster accounts until the pool reaches its minimum size.
    /// Returns the number of identities added.
    pub async fn refill(&self) -> PoolResult<usize> {
        let mut added = 0;
        for account in &self.accounts {
            if self.size().await? >= self.config.min_identities {
                break;
            }

            let credentials = match self.login.login(account).await {
                Ok(credentials) => credentials,
                Err(err) => {
                    log::error!(
                        "login via {} failed for {}: {err}",
                        self.login.name(),
                        account.username
                    );
                    continue;
                }
            };

            match Identity::from_credentials(credentials, &self.config.session_key, self.clock.now()) {
                Some(identity) => {
                    self.add(identity).await?;
                    added += 1;
                }
                None => log::warn!(
                    "login for {} returned no '{}' session token",
                    account.username,
                    self.config.session_key
                ),
            }
        }
        if added > 0 {
            log::info!("credential pool refilled with {added} identities");
        }
        Ok(added)
    }

    /// Evict identities past their maximum age or failing a liveness probe.
    pub async fn validate(&self) -> PoolResult<ValidationSummary> {
        let now = self.clock.now();
        let mut summary = ValidationSummary::default();

        for identity in self.identities().await? {
            summary.checked += 1;
            if identity.age(now) > self.config.max_age {
                self.evict(&identity.id, EvictionReason::Expired).await?;
                summary.expired += 1;
                continue;
            }

            let route = ProbeRoute::with_credentials(&identity.credentials);
            let alive = match self.probe.probe(route, self.config.probe_timeout).await {
                Ok(status) => (200..300).contains(&status),
                Err(err) => {
                    log::debug!("identity probe error for {}: {err}", short_id(&identity.id));
                    false
                }
            };
            if !alive {
                self.evict(&identity.id, EvictionReason::ProbeFailed).await?;
                summary.dead += 1;
            }
        }

        summary.orphans = self.prune_orphans().await?;
        log::info!(
            "credential validation: checked={} expired={} dead={} orphans={}",
            summary.checked,
            summary.expired,
            summary.dead,
            summary.orphans
        );
        Ok(summary)
    }

    /// Drop side-hash fields whose identity no longer exists. A lease or
    /// outcome report racing an eviction can leave one behind.
    async fn prune_orphans(&self) -> PoolResult<usize> {
        let mut pruned = 0;
        for side in [&self.keys.last_used, &self.keys.successes, &self.keys.failures] {
            // read the side hash first: `add` writes the identity before its fields
            let fields = self.store.hgetall(side).await?;
            let live = self.store.hgetall(&self.keys.identities).await?;
            for id in fields.into_keys() {
                if !live.contains_key(&id) && self.store.hdel(side, &id).await? {
                    pruned += 1;
                }
            }
        }
        if pruned > 0 {
            log::debug!("pruned {pruned} orphaned identity fields");
        }
        Ok(pruned)
    }

    /// One maintenance pass: validate, then refill when under the minimum.
    pub async fn maintain(&self) -> PoolResult<()> {
        self.validate().await?;
        if self.size().await? < self.config.min_identities {
            self.refill().await?;
        }
        Ok(())
    }

    /// Never-ending validation/refill loop.
    pub async fn monitor(self: Arc<Self>) {
        let schedule = LoopSchedule::new(self.config.check_interval, self.config.error_backoff);
        run_forever("credential-pool", schedule, move || {
            let pool = Arc::clone(&self);
            async move { pool.maintain().await.map_err(MaintenanceError::from) }
        })
        .await
    }
}

impl std::fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPool")
            .field("keys", &self.keys)
            .field("accounts", &self.accounts.len())
            .field("login", &self.login.name())
            .finish()
    }
}

fn short_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(8)
        .map(|(idx, _)| idx)
        .unwrap_or(id.len());
    &id[..end]
}
