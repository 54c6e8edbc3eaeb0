use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crawlgate_rs::{
    Account, Admission, AttemptError, CollaboratorError, CredentialSet, FailureClass, Gateway,
    GatewayConfig, GatewayError, Identity, LoginProvider, ManualClock, MemoryStore, ProbeRoute,
    ProxyEndpoint, ProxySupplier, RequestMeta, SharedStore, TargetProbe, VERSION,
};

struct RosterLogin;

#[async_trait]
impl LoginProvider for RosterLogin {
    fn name(&self) -> &'static str {
        "roster"
    }

    async fn login(&self, account: &Account) -> Result<CredentialSet, CollaboratorError> {
        let mut set = CredentialSet::new();
        set.insert("JSESSIONID".into(), format!("sess-{}", account.username));
        Ok(set)
    }
}

struct FixedSupply(Vec<ProxyEndpoint>);

#[async_trait]
impl ProxySupplier for FixedSupply {
    async fn fetch(&self) -> Result<Vec<ProxyEndpoint>, CollaboratorError> {
        Ok(self.0.clone())
    }
}

/// Identities are always alive; proxies listed in `dead` never answer.
struct HostProbe {
    dead: HashSet<String>,
}

#[async_trait]
impl TargetProbe for HostProbe {
    async fn probe(
        &self,
        route: ProbeRoute<'_>,
        _timeout: Duration,
    ) -> Result<u16, CollaboratorError> {
        match route.proxy {
            Some(proxy) if self.dead.contains(&proxy.host) => {
                Err(CollaboratorError::Transport("connection refused".into()))
            }
            _ => Ok(200),
        }
    }
}

fn accounts(n: usize) -> Vec<Account> {
    (0..n)
        .map(|i| Account {
            username: format!("reader{i}"),
            password: "pw".into(),
        })
        .collect()
}

fn endpoints(hosts: &[&str]) -> Vec<ProxyEndpoint> {
    hosts.iter().map(|host| ProxyEndpoint::new(*host, 8080)).collect()
}

fn gateway_on(
    store: Arc<dyn SharedStore>,
    clock: &ManualClock,
    prefix: &str,
    dead: &[&str],
) -> Gateway {
    let config = GatewayConfig {
        key_prefix: prefix.into(),
        ..Default::default()
    };
    Gateway::builder()
        .with_config(config)
        .with_store(store)
        .with_clock(Arc::new(clock.clone()))
        .with_login_provider(Arc::new(RosterLogin))
        .with_proxy_supplier(Arc::new(FixedSupply(endpoints(&["10.0.0.1", "10.0.0.2"]))))
        .with_probe(Arc::new(HostProbe {
            dead: dead.iter().map(|s| s.to_string()).collect(),
        }))
        .with_accounts(accounts(3))
        .build()
        .unwrap()
}

fn gateway(dead: &[&str]) -> (Gateway, ManualClock) {
    let clock = ManualClock::default();
    let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    (gateway_on(store, &clock, "test", dead), clock)
}

#[tokio::test]
async fn admission_applies_rate_window_per_source() {
    let (gateway, clock) = gateway(&[]);
    let meta = RequestMeta::new("GET", "/kns/search").with_user_agent("Mozilla/5.0");

    for _ in 0..10 {
        assert_eq!(gateway.admit("198.51.100.1", &meta).await.unwrap(), Admission::Allowed);
    }
    let refused = gateway.admit("198.51.100.1", &meta).await.unwrap();
    assert_eq!(refused, Admission::RateLimited);
    let err = refused.into_result("198.51.100.1").unwrap_err();
    assert_eq!(err.failure_class(), FailureClass::TemporarilyUnavailable);

    // refused requests are not recorded
    let patterns = gateway.governor().patterns("198.51.100.1").await.unwrap();
    assert_eq!(patterns.len(), 10);

    clock.advance(Duration::from_secs(60));
    assert_eq!(gateway.admit("198.51.100.1", &meta).await.unwrap(), Admission::Allowed);

    let metrics = gateway.metrics().unwrap().source("198.51.100.1").unwrap();
    assert_eq!(metrics.rejections, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_share_one_window() {
    let (gateway, _clock) = gateway(&[]);
    let gateway = Arc::new(gateway);
    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..50 {
        let gateway = Arc::clone(&gateway);
        tasks.spawn(async move {
            let meta = RequestMeta::new("GET", "/kns/search").with_user_agent("Mozilla/5.0");
            gateway.admit("203.0.113.50", &meta).await
        });
    }
    let mut allowed = 0;
    while let Some(joined) = tasks.join_next().await {
        if joined.unwrap().unwrap().is_allowed() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 10);
    let patterns = gateway.governor().patterns("203.0.113.50").await.unwrap();
    assert_eq!(patterns.len(), 10);
    let metrics = gateway.metrics().unwrap().source("203.0.113.50").unwrap();
    assert_eq!(metrics.rejections, 40);
}

#[tokio::test(start_paused = true)]
async fn denied_bot_is_banned_for_a_day() {
    let (gateway, clock) = gateway(&[]);
    gateway.credentials().refill().await.unwrap();
    gateway
        .proxies()
        .add(endpoints(&["10.0.0.9"]))
        .await
        .unwrap();

    let meta = RequestMeta::new("GET", "/x").with_user_agent("python-requests/2.31");
    for _ in 0..5 {
        assert!(gateway.admit("S", &meta).await.unwrap().is_allowed());
        clock.advance(Duration::from_secs(1));
    }

    let err = gateway
        .execute("S", |_| async {
            Err::<(), _>(AttemptError::AccessDenied("访问受限".into()))
        })
        .await
        .unwrap_err();
    assert_eq!(err.failure_class(), FailureClass::TemporarilyUnavailable);
    assert!(matches!(
        err,
        GatewayError::Execute(crawlgate_rs::ExecuteError::AccessDenied {
            ban: Some(ban),
            ..
        }) if ban == Duration::from_secs(86_400)
    ));

    assert_eq!(gateway.admit("S", &meta).await.unwrap(), Admission::Banned);
    clock.advance(Duration::from_secs(86_400));
    assert_eq!(gateway.admit("S", &meta).await.unwrap(), Admission::Allowed);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_as_failures() {
    let (gateway, clock) = gateway(&[]);
    let identity = {
        let mut set = CredentialSet::new();
        set.insert("JSESSIONID".into(), "only".into());
        Identity::from_credentials(set, "JSESSIONID", clock_now(&clock)).unwrap()
    };
    gateway.credentials().add(identity).await.unwrap();

    let attempts = Arc::new(Mutex::new(0));
    for round in 1..=3 {
        let counter = attempts.clone();
        let err = gateway
            .execute("worker", move |_| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Err::<(), _>(AttemptError::Transient("connection reset".into()))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.failure_class(), FailureClass::Failed);
        assert_eq!(*attempts.lock().unwrap(), round * 3);
    }

    // three failed calls evict the only identity
    assert_eq!(gateway.credentials().size().await.unwrap(), 0);
    let err = gateway
        .execute("worker", |_| async { Ok::<_, AttemptError>(()) })
        .await
        .unwrap_err();
    assert_eq!(err.failure_class(), FailureClass::TemporarilyUnavailable);
}

fn clock_now(clock: &ManualClock) -> chrono::DateTime<chrono::Utc> {
    use crawlgate_rs::Clock;
    clock.now()
}

#[tokio::test(start_paused = true)]
async fn maintenance_refills_and_validates() {
    let (gateway, _clock) = gateway(&["10.0.0.2"]);
    gateway
        .proxies()
        .add(endpoints(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]))
        .await
        .unwrap();

    let handles = gateway.spawn_maintenance();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(handles.all_running());

    let health = gateway.health().await.unwrap();
    assert_eq!(health.identities, 3);
    assert_eq!(health.proxies, 2);
    assert_eq!(health.status(), "healthy");
    handles.shutdown();
}

#[tokio::test]
async fn workers_share_state_only_within_a_prefix() {
    let clock = ManualClock::default();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let first = gateway_on(store.clone(), &clock, "shared", &[]);
    let second = gateway_on(store.clone(), &clock, "shared", &[]);
    let isolated = gateway_on(store, &clock, "other", &[]);

    first.credentials().refill().await.unwrap();
    assert_eq!(second.credentials().size().await.unwrap(), 3);
    assert_eq!(isolated.credentials().size().await.unwrap(), 0);

    first.governor().deny_access("203.0.113.5").await.unwrap();
    assert!(second.governor().is_banned("203.0.113.5").await.unwrap());
    assert!(!isolated.governor().is_banned("203.0.113.5").await.unwrap());
    assert!(!VERSION.is_empty());
}
