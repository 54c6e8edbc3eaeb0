//! Resilient execution of one logical outbound operation.
//!
//! `execute` leases an identity and a proxy, waits out the governor's
//! pre-request delay, then runs the caller's operation with bounded retries.
//! Outcomes flow back into both pools and, on an access denial, into the
//! governor's ban tiers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use thiserror::Error;
use tokio::time::{Instant, sleep, timeout};

use crate::config::ExecutorConfig;
use crate::external_deps::CollaboratorError;
use crate::external_deps::transport::build_client;
use crate::modules::credentials::{CredentialPool, IdentityLease};
use crate::modules::events::{
    AttemptEvent, DenialEvent, EventDispatcher, ExhaustionEvent, GatewayEvent, RetryEvent,
};
use crate::modules::governor::TrafficGovernor;
use crate::modules::proxy::{ProxyEndpoint, ProxyPool};
use crate::modules::records::PoolError;
use crate::store::StoreError;

/// How a single attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttemptError {
    /// Timeout or connection-level failure.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The session is no longer authenticated.
    #[error("credential rejected: {0}")]
    CredentialInvalid(String),
    /// The target explicitly refused the request.
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("{0}")]
    Other(String),
}

impl AttemptError {
    pub fn kind(&self) -> &'static str {
        match self {
            AttemptError::Transient(_) => "transient",
            AttemptError::CredentialInvalid(_) => "credential_invalid",
            AttemptError::AccessDenied(_) => "access_denied",
            AttemptError::Other(_) => "other",
        }
    }
}

impl From<CollaboratorError> for AttemptError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Timeout(_) | CollaboratorError::Transport(_) => {
                AttemptError::Transient(err.to_string())
            }
            CollaboratorError::Status(401) => AttemptError::CredentialInvalid(err.to_string()),
            CollaboratorError::Status(403 | 429) => AttemptError::AccessDenied(err.to_string()),
            CollaboratorError::Status(status) if status >= 500 => {
                AttemptError::Transient(err.to_string())
            }
            other => AttemptError::Other(other.to_string()),
        }
    }
}

/// Pool that came up empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Identity,
    Proxy,
}

impl Resource {
    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Identity => "identity",
            Resource::Proxy => "proxy",
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    /// Nothing to lease; retry later.
    #[error("no {} available", .0.as_str())]
    ResourceExhausted(Resource),
    #[error("access denied for {source_id}: {reason}")]
    AccessDenied {
        source_id: String,
        reason: String,
        /// Ban applied to the source, when the governor could record it.
        ban: Option<Duration>,
    },
    #[error("gave up after {attempts} attempts: {last}")]
    AttemptsExhausted { attempts: usize, last: AttemptError },
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything an operation needs for one attempt.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub identity: IdentityLease,
    pub proxy: ProxyEndpoint,
    /// 1-based attempt number.
    pub attempt: usize,
    pub timeout: Duration,
}

impl AttemptContext {
    /// Reqwest client carrying the leased cookies and routed through the
    /// leased proxy.
    pub fn client(&self) -> Result<Client, AttemptError> {
        build_client(Some(&self.identity.credentials), Some(&self.proxy), self.timeout)
            .map_err(AttemptError::from)
    }
}

pub struct RequestExecutor {
    credentials: Arc<CredentialPool>,
    proxies: Arc<ProxyPool>,
    governor: Arc<TrafficGovernor>,
    config: ExecutorConfig,
    events: Arc<EventDispatcher>,
}

impl RequestExecutor {
    pub fn new(
        credentials: Arc<CredentialPool>,
        proxies: Arc<ProxyPool>,
        governor: Arc<TrafficGovernor>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            credentials,
            proxies,
            governor,
            config,
            events: Arc::new(EventDispatcher::new()),
        }
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `op` for `source_id` with the configured attempt budget.
    pub async fn execute<T, F, Fut>(&self, source_id: &str, op: F) -> Result<T, ExecuteError>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        self.execute_with(
            source_id,
            self.config.max_attempts,
            self.config.retry_delay_base,
            op,
        )
        .await
    }

    /// Like [`execute`](Self::execute) with an explicit attempt budget.
    /// Attempt `n` that fails is followed by a `retry_delay_base * n` pause,
    /// except after the last attempt.
    pub async fn execute_with<T, F, Fut>(
        &self,
        source_id: &str,
        max_attempts: usize,
        retry_delay_base: Duration,
        mut op: F,
    ) -> Result<T, ExecuteError>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let Some(identity) = self.credentials.lease().await? else {
            return Err(self.exhausted(source_id, Resource::Identity));
        };
        let Some(proxy) = self.proxies.lease().await? else {
            return Err(self.exhausted(source_id, Resource::Proxy));
        };

        let delay = self.governor.compute_delay(source_id).await?;
        log::debug!("{source_id}: waiting {:.2}s before first attempt", delay.as_secs_f64());
        sleep(delay).await;

        let max_attempts = max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            let context = AttemptContext {
                identity: identity.clone(),
                proxy: proxy.clone(),
                attempt,
                timeout: self.config.attempt_timeout,
            };
            let started = Instant::now();
            let outcome = match timeout(self.config.attempt_timeout, op(context)).await {
                Ok(result) => result,
                Err(_) => Err(AttemptError::Transient(format!(
                    "attempt timed out after {:?}",
                    self.config.attempt_timeout
                ))),
            };
            let latency = started.elapsed();
            self.events.dispatch(GatewayEvent::Attempt(AttemptEvent {
                source: source_id.to_string(),
                attempt,
                identity: identity.id.clone(),
                proxy: proxy.key(),
                success: outcome.is_ok(),
                error: outcome.as_ref().err().map(ToString::to_string),
                latency,
                timestamp: Utc::now(),
            }));

            match outcome {
                Ok(value) => {
                    self.report(&identity, &proxy, true).await;
                    return Ok(value);
                }
                Err(AttemptError::AccessDenied(reason)) => {
                    self.report(&identity, &proxy, false).await;
                    let ban = match self.governor.deny_access(source_id).await {
                        Ok(ttl) => Some(ttl),
                        Err(err) => {
                            log::error!("failed to record ban for {source_id}: {err}");
                            None
                        }
                    };
                    if let Some(ban) = ban {
                        self.events.dispatch(GatewayEvent::Denied(DenialEvent {
                            source: source_id.to_string(),
                            ban,
                            timestamp: Utc::now(),
                        }));
                    }
                    return Err(ExecuteError::AccessDenied {
                        source_id: source_id.to_string(),
                        reason,
                        ban,
                    });
                }
                Err(err) => {
                    if attempt < max_attempts {
                        let wait = retry_delay_base.saturating_mul(attempt as u32);
                        self.events.dispatch(GatewayEvent::Retry(RetryEvent {
                            source: source_id.to_string(),
                            attempt,
                            reason: err.kind().to_string(),
                            scheduled_after: wait,
                            timestamp: Utc::now(),
                        }));
                        sleep(wait).await;
                    }
                    last_error = Some(err);
                }
            }
        }

        self.report(&identity, &proxy, false).await;
        Err(ExecuteError::AttemptsExhausted {
            attempts: max_attempts,
            last: last_error
                .unwrap_or_else(|| AttemptError::Other("no attempt was made".into())),
        })
    }

    fn exhausted(&self, source_id: &str, resource: Resource) -> ExecuteError {
        self.events.dispatch(GatewayEvent::Exhausted(ExhaustionEvent {
            source: source_id.to_string(),
            resource: resource.as_str(),
            timestamp: Utc::now(),
        }));
        ExecuteError::ResourceExhausted(resource)
    }

    // A bookkeeping failure must not mask the operation's own outcome.
    async fn report(&self, identity: &IdentityLease, proxy: &ProxyEndpoint, success: bool) {
        if let Err(err) = self.credentials.report_outcome(&identity.id, success).await {
            log::error!("failed to report identity outcome: {err}");
        }
        if let Err(err) = self.proxies.report_outcome(proxy, success).await {
            log::error!("failed to report proxy outcome: {err}");
        }
    }
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("config", &self.config)
            .field("events", &self.events)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialConfig, GovernorConfig, ProxyPoolConfig};
    use crate::external_deps::login::{Account, LoginProvider};
    use crate::external_deps::probe::{ProbeRoute, TargetProbe};
    use crate::external_deps::supply::ProxySupplier;
    use crate::modules::credentials::{CredentialSet, Identity};
    use crate::modules::governor::RequestMeta;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct NoLogin;

    #[async_trait]
    impl LoginProvider for NoLogin {
        fn name(&self) -> &'static str {
            "none"
        }

        async fn login(&self, _account: &Account) -> Result<CredentialSet, CollaboratorError> {
            Err(CollaboratorError::Rejected("disabled".into()))
        }
    }

    struct AlwaysAlive;

    #[async_trait]
    impl TargetProbe for AlwaysAlive {
        async fn probe(
            &self,
            _route: ProbeRoute<'_>,
            _timeout: Duration,
        ) -> Result<u16, CollaboratorError> {
            Ok(200)
        }
    }

    struct NoSupply;

    #[async_trait]
    impl ProxySupplier for NoSupply {
        async fn fetch(&self) -> Result<Vec<ProxyEndpoint>, CollaboratorError> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        executor: RequestExecutor,
        credentials: Arc<CredentialPool>,
        proxies: Arc<ProxyPool>,
        governor: Arc<TrafficGovernor>,
    }

    async fn fixture(identities: bool, proxies: bool) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let credentials = Arc::new(CredentialPool::new(
            store.clone(),
            CredentialConfig::default(),
            Arc::new(NoLogin),
            Arc::new(AlwaysAlive),
        ));
        let proxy_pool = Arc::new(ProxyPool::new(
            store.clone(),
            ProxyPoolConfig {
                min_endpoints: 0,
                ..Default::default()
            },
            Arc::new(NoSupply),
            Arc::new(AlwaysAlive),
        ));
        let governor = Arc::new(TrafficGovernor::new(store, GovernorConfig::default()));

        if identities {
            let mut set = CredentialSet::new();
            set.insert("JSESSIONID".into(), "session-1".into());
            let identity = Identity::from_credentials(set, "JSESSIONID", Utc::now()).unwrap();
            credentials.add(identity).await.unwrap();
        }
        if proxies {
            proxy_pool
                .add([ProxyEndpoint::new("10.0.0.1", 8080)])
                .await
                .unwrap();
        }

        let executor = RequestExecutor::new(
            credentials.clone(),
            proxy_pool.clone(),
            governor.clone(),
            ExecutorConfig::default(),
        );
        Fixture {
            executor,
            credentials,
            proxies: proxy_pool,
            governor,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_pools_fail_fast() {
        let fx = fixture(false, true).await;
        let err = fx
            .executor
            .execute("src", |_| async { Ok::<_, AttemptError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::ResourceExhausted(Resource::Identity)));

        let fx = fixture(true, false).await;
        let err = fx
            .executor
            .execute("src", |_| async { Ok::<_, AttemptError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::ResourceExhausted(Resource::Proxy)));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_linear_backoff_then_succeeds() {
        let fx = fixture(true, true).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let started = Instant::now();

        let seen_in_op = seen.clone();
        let result = fx
            .executor
            .execute("src", move |ctx| {
                let seen = seen_in_op.clone();
                async move {
                    seen.lock().unwrap().push((ctx.attempt, ctx.proxy.key()));
                    if ctx.attempt < 3 {
                        Err(AttemptError::Transient("connection reset".into()))
                    } else {
                        Ok(ctx.identity.id)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "session-1");
        let elapsed = started.elapsed();
        // 1-3s governor delay, then 5s and 10s retry pauses
        assert!(elapsed >= Duration::from_secs(16) && elapsed < Duration::from_secs(18));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(_, proxy)| proxy == "10.0.0.1:8080"));

        let identity = fx.credentials.get("session-1").await.unwrap().unwrap();
        assert_eq!(identity.success_count, 1);
        assert_eq!(identity.fail_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_report_one_failure() {
        let fx = fixture(true, true).await;
        let err = fx
            .executor
            .execute("src", |_| async {
                Err::<(), _>(AttemptError::CredentialInvalid("login expired".into()))
            })
            .await
            .unwrap_err();

        match err {
            ExecuteError::AttemptsExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last, AttemptError::CredentialInvalid("login expired".into()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let identity = fx.credentials.get("session-1").await.unwrap().unwrap();
        assert_eq!(identity.fail_count, 1);
        let report = fx.proxies.health_report().await.unwrap();
        assert_eq!(report.details["10.0.0.1:8080"].failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out_as_transient() {
        let fx = fixture(true, true).await;
        let err = fx
            .executor
            .execute_with("src", 1, Duration::from_secs(5), |_| async {
                sleep(Duration::from_secs(60)).await;
                Ok::<_, AttemptError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecuteError::AttemptsExhausted {
                attempts: 1,
                last: AttemptError::Transient(_)
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn access_denial_bans_source_without_retrying() {
        let fx = fixture(true, true).await;
        for _ in 0..5 {
            fx.governor
                .record_pattern("bot", &RequestMeta::new("GET", "/x").with_user_agent("curl"))
                .await
                .unwrap();
        }
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let err = fx
            .executor
            .execute("bot", move |_| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Err::<(), _>(AttemptError::AccessDenied("访问受限".into()))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(*calls.lock().unwrap(), 1);
        match err {
            ExecuteError::AccessDenied { ban, .. } => {
                assert_eq!(ban, Some(Duration::from_secs(86_400)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(fx.governor.is_banned("bot").await.unwrap());
    }

    #[test]
    fn collaborator_errors_map_to_attempt_errors() {
        assert!(matches!(
            AttemptError::from(CollaboratorError::Timeout(Duration::from_secs(1))),
            AttemptError::Transient(_)
        ));
        assert!(matches!(
            AttemptError::from(CollaboratorError::Status(429)),
            AttemptError::AccessDenied(_)
        ));
        assert!(matches!(
            AttemptError::from(CollaboratorError::Status(401)),
            AttemptError::CredentialInvalid(_)
        ));
        assert!(matches!(
            AttemptError::from(CollaboratorError::Decode("bad".into())),
            AttemptError::Other(_)
        ));
    }
}
