//! Egress proxy pool with validation and lazy resupply.
//!
//! The working set lives in a store hash keyed by `host:port`. Validation
//! probes every endpoint concurrently and replaces the whole set with the
//! survivors, so a pass during a network blip can legitimately empty it;
//! the next lease refills from the supply collaborator.

use chrono::{DateTime, Utc};
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::config::ProxyPoolConfig;
use crate::external_deps::probe::{ProbeRoute, TargetProbe};
use crate::external_deps::supply::ProxySupplier;
use crate::modules::maintenance::{LoopSchedule, MaintenanceError, run_forever};
use crate::modules::records::{Namespace, PoolResult, decode, encode, parse_count};
use crate::store::{Clock, SharedStore, SystemClock};

/// A network egress path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub last_validated_at: Option<DateTime<Utc>>,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            last_validated_at: None,
        }
    }

    /// Pool key for this endpoint.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Proxy URL used for both http and https traffic.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Informational per-endpoint counters reported by the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyStats {
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHealthReport {
    pub total_proxies: usize,
    pub details: HashMap<String, ProxyStats>,
}

/// Result of a validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyValidation {
    pub probed: usize,
    pub alive: usize,
}

#[derive(Debug, Clone)]
struct ProxyKeys {
    endpoints: String,
    successes: String,
    failures: String,
}

pub struct ProxyPool {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: ProxyPoolConfig,
    keys: ProxyKeys,
    supplier: Arc<dyn ProxySupplier>,
    probe: Arc<dyn TargetProbe>,
}

impl ProxyPool {
    pub fn new(
        store: Arc<dyn SharedStore>,
        config: ProxyPoolConfig,
        supplier: Arc<dyn ProxySupplier>,
        probe: Arc<dyn TargetProbe>,
    ) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config,
            keys: Self::keys_for("crawlgate"),
            supplier,
            probe,
        }
    }

    fn keys_for(prefix: &str) -> ProxyKeys {
        let namespace = Namespace::new(prefix, "proxies");
        ProxyKeys {
            endpoints: namespace.key("endpoints"),
            successes: namespace.key("successes"),
            failures: namespace.key("failures"),
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

    pub fn config(&self) -> &ProxyPoolConfig {
        &self.config
    }

    pub async fn size(&self) -> PoolResult<usize> {
        Ok(self.store.hlen(&self.keys.endpoints).await?)
    }

    /// Current working set.
    pub async fn endpoints(&self) -> PoolResult<Vec<ProxyEndpoint>> {
        let records = self.store.hgetall(&self.keys.endpoints).await?;
        let mut endpoints = Vec::with_capacity(records.len());
        for (key, raw) in records {
            match decode::<ProxyEndpoint>(&key, &raw) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(err) => log::warn!("skipping proxy record: {err}"),
            }
        }
        Ok(endpoints)
    }

    /// Add endpoints to the working set.
    pub async fn add(&self, endpoints: impl IntoIterator<Item = ProxyEndpoint>) -> PoolResult<usize> {
        let mut added = 0;
        for endpoint in endpoints {
            let key = endpoint.key();
            self.store
                .hset(&self.keys.endpoints, &key, &encode(&key, &endpoint)?)
                .await?;
            added += 1;
        }
        Ok(added)
    }

    /// Pull a batch from the supply collaborator into the working set.
    ///
    /// Supply failures are logged and yield zero; they never fail the caller.
    pub async fn fetch_supply(&self) -> PoolResult<usize> {
        match self.supplier.fetch().await {
            Ok(batch) => {
                let added = self.add(batch).await?;
                log::info!("fetched {added} proxies from supply");
                Ok(added)
            }
            Err(err) => {
                log::error!("proxy supply fetch failed: {err}");
                Ok(0)
            }
        }
    }

    /// Uniformly random endpoint, topping up from supply first when the pool
    /// is under its minimum. `None` when nothing is available.
    pub async fn lease(&self) -> PoolResult<Option<ProxyEndpoint>> {
        if self.size().await? < self.config.min_endpoints {
            self.fetch_supply().await?;
        }

        let records = self.store.hgetall(&self.keys.endpoints).await?;
        let picked = {
            let mut rng = rand::thread_rng();
            records.into_iter().choose(&mut rng)
        };
        let Some((key, raw)) = picked else {
            return Ok(None);
        };
        let endpoint: ProxyEndpoint = decode(&key, &raw)?;
        log::debug!("leased proxy {endpoint}");
        Ok(Some(endpoint))
    }

    /// Probe every endpoint concurrently and keep exactly the ones that
    /// answered with a 2xx.
    pub async fn validate_all(&self) -> PoolResult<ProxyValidation> {
        let endpoints = self.endpoints().await?;
        let probed = endpoints.len();
        let timeout = self.config.probe_timeout;

        let mut probes = JoinSet::new();
        for endpoint in endpoints {
            let probe = Arc::clone(&self.probe);
            probes.spawn(async move {
                let result = tokio::time::timeout(
                    timeout,
                    probe.probe(ProbeRoute::through(&endpoint), timeout),
                )
                .await;
                let alive = matches!(result, Ok(Ok(status)) if (200..300).contains(&status));
                (endpoint, alive)
            });
        }

        let now = self.clock.now();
        let mut survivors = HashMap::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((mut endpoint, true)) => {
                    endpoint.last_validated_at = Some(now);
                    let key = endpoint.key();
                    survivors.insert(key.clone(), encode(&key, &endpoint)?);
                }
                Ok((_, false)) => {}
                Err(err) => log::warn!("proxy probe task failed: {err}"),
            }
        }

        let alive = survivors.len();
        let live: HashSet<String> = survivors.keys().cloned().collect();
        self.store.hreplace(&self.keys.endpoints, survivors).await?;
        // counters of anything outside the working set, including reports
        // that raced a previous pass, go with it
        for counters in [&self.keys.successes, &self.keys.failures] {
            for key in self.store.hgetall(counters).await?.into_keys() {
                if !live.contains(&key) {
                    self.store.hdel(counters, &key).await?;
                }
            }
        }
        log::info!("proxy validation: {alive}/{probed} alive");
        Ok(ProxyValidation { probed, alive })
    }

    /// Record the outcome of a call routed through `endpoint`. Counters are
    /// informational; membership is decided by validation only. Reports for
    /// endpoints no longer in the pool are ignored.
    pub async fn report_outcome(&self, endpoint: &ProxyEndpoint, success: bool) -> PoolResult<()> {
        let key = endpoint.key();
        if self.store.hget(&self.keys.endpoints, &key).await?.is_none() {
            log::debug!("ignoring outcome for retired proxy {endpoint}");
            return Ok(());
        }
        let counters = if success {
            &self.keys.successes
        } else {
            &self.keys.failures
        };
        self.store.hincr_by(counters, &key, 1).await?;
        Ok(())
    }

    pub async fn health_report(&self) -> PoolResult<ProxyHealthReport> {
        let endpoints = self.store.hgetall(&self.keys.endpoints).await?;
        let successes = self.store.hgetall(&self.keys.successes).await?;
        let failures = self.store.hgetall(&self.keys.failures).await?;
        let details = endpoints
            .keys()
            .map(|key| {
                (
                    key.clone(),
                    ProxyStats {
                        successes: parse_count(successes.get(key)),
                        failures: parse_count(failures.get(key)),
                    },
                )
            })
            .collect();
        Ok(ProxyHealthReport {
            total_proxies: endpoints.len(),
            details,
        })
    }

    /// Never-ending validation loop. Refill happens lazily in [`lease`](Self::lease).
    pub async fn monitor(self: Arc<Self>) {
        let schedule = LoopSchedule::new(self.config.check_interval, self.config.error_backoff);
        run_forever("proxy-pool", schedule, move || {
            let pool = Arc::clone(&self);
            async move {
                pool.validate_all()
                    .await
                    .map(|_| ())
                    .map_err(MaintenanceError::from)
            }
        })
        .await
    }
}

impl fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyPool")
            .field("keys", &self.keys)
            .field("min_endpoints", &self.config.min_endpoints)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::CollaboratorError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    struct StubSupplier {
        batches: Mutex<Vec<Result<Vec<ProxyEndpoint>, CollaboratorError>>>,
        calls: Mutex<usize>,
    }

    impl StubSupplier {
        fn new(batches: Vec<Result<Vec<ProxyEndpoint>, CollaboratorError>>) -> Self {
            Self {
                batches: Mutex::new(batches.into_iter().rev().collect()),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl ProxySupplier for StubSupplier {
        async fn fetch(&self) -> Result<Vec<ProxyEndpoint>, CollaboratorError> {
            *self.calls.lock().unwrap() += 1;
            self.batches.lock().unwrap().pop().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    struct StubProbe {
        dead_hosts: HashSet<String>,
        hang_hosts: HashSet<String>,
    }

    #[async_trait]
    impl TargetProbe for StubProbe {
        async fn probe(
            &self,
            route: ProbeRoute<'_>,
            _timeout: Duration,
        ) -> Result<u16, CollaboratorError> {
            let host = route.proxy.map(|p| p.host.clone()).unwrap_or_default();
            if self.hang_hosts.contains(&host) {
                std::future::pending::<()>().await;
            }
            if self.dead_hosts.contains(&host) {
                return Err(CollaboratorError::Transport("connection refused".into()));
            }
            Ok(200)
        }
    }

    fn endpoints(n: usize) -> Vec<ProxyEndpoint> {
        (1..=n)
            .map(|i| ProxyEndpoint::new(format!("10.0.0.{i}"), 8080))
            .collect()
    }

    fn pool(
        supplier: Arc<StubSupplier>,
        dead: &[&str],
        hang: &[&str],
        min_endpoints: usize,
    ) -> ProxyPool {
        let probe = Arc::new(StubProbe {
            dead_hosts: dead.iter().map(|s| s.to_string()).collect(),
            hang_hosts: hang.iter().map(|s| s.to_string()).collect(),
        });
        let config = ProxyPoolConfig {
            min_endpoints,
            ..Default::default()
        };
        ProxyPool::new(Arc::new(MemoryStore::new()), config, supplier, probe)
    }

    #[tokio::test(start_paused = true)]
    async fn validation_keeps_only_passing_endpoints() {
        let supplier = Arc::new(StubSupplier::new(vec![]));
        let pool = pool(supplier, &["10.0.0.2"], &["10.0.0.4"], 0);
        pool.add(endpoints(5)).await.unwrap();

        let report = pool.validate_all().await.unwrap();
        assert_eq!(report, ProxyValidation { probed: 5, alive: 3 });

        let survivors: HashSet<String> =
            pool.endpoints().await.unwrap().iter().map(|e| e.host.clone()).collect();
        assert_eq!(
            survivors,
            ["10.0.0.1", "10.0.0.3", "10.0.0.5"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        );
        for _ in 0..30 {
            let leased = pool.lease().await.unwrap().unwrap();
            assert!(leased.host != "10.0.0.2" && leased.host != "10.0.0.4");
            assert!(leased.last_validated_at.is_some());
        }
    }

    #[tokio::test]
    async fn lease_tops_up_below_minimum() {
        let supplier = Arc::new(StubSupplier::new(vec![Ok(endpoints(3))]));
        let pool = pool(supplier.clone(), &[], &[], 10);

        let leased = pool.lease().await.unwrap().unwrap();
        assert_eq!(leased.url(), format!("http://{}:8080", leased.host));
        assert_eq!(pool.size().await.unwrap(), 3);
        // still under the minimum, so every lease asks supply again
        pool.lease().await.unwrap();
        assert_eq!(*supplier.calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_pool_and_failed_supply_leases_nothing() {
        let supplier = Arc::new(StubSupplier::new(vec![Err(CollaboratorError::Status(502))]));
        let pool = pool(supplier, &[], &[], 10);
        assert_eq!(pool.lease().await.unwrap(), None);
    }

    #[tokio::test]
    async fn outcome_counters_reset_when_endpoint_is_dropped() {
        let supplier = Arc::new(StubSupplier::new(vec![]));
        let pool = pool(supplier, &["10.0.0.1"], &[], 0);
        pool.add(endpoints(2)).await.unwrap();
        let first = ProxyEndpoint::new("10.0.0.1", 8080);
        let second = ProxyEndpoint::new("10.0.0.2", 8080);
        pool.report_outcome(&first, false).await.unwrap();
        pool.report_outcome(&second, true).await.unwrap();

        let report = pool.health_report().await.unwrap();
        assert_eq!(report.total_proxies, 2);
        assert_eq!(report.details["10.0.0.1:8080"].failures, 1);

        pool.validate_all().await.unwrap();
        let report = pool.health_report().await.unwrap();
        assert_eq!(report.total_proxies, 1);
        assert_eq!(report.details["10.0.0.2:8080"].successes, 1);
        assert!(!report.details.contains_key("10.0.0.1:8080"));
    }

    #[tokio::test]
    async fn counters_never_outlive_the_working_set() {
        let supplier = Arc::new(StubSupplier::new(vec![]));
        let pool = pool(supplier, &["10.9.9.9"], &[], 0);
        let retired = ProxyEndpoint::new("10.9.9.9", 8080);
        pool.add([retired.clone()]).await.unwrap();
        pool.validate_all().await.unwrap();
        assert_eq!(pool.size().await.unwrap(), 0);

        // an in-flight call finishing after its proxy was dropped
        pool.report_outcome(&retired, false).await.unwrap();
        assert!(pool.store.hgetall(&pool.keys.failures).await.unwrap().is_empty());

        // a report that slipped in between the membership check and the pass
        pool.store.hincr_by(&pool.keys.failures, &retired.key(), 1).await.unwrap();
        pool.validate_all().await.unwrap();
        assert!(pool.store.hgetall(&pool.keys.failures).await.unwrap().is_empty());
        assert!(pool.store.hgetall(&pool.keys.successes).await.unwrap().is_empty());
    }
}
