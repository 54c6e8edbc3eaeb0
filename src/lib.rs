//! # crawlgate-rs
//!
//! Resource and traffic governance for crawlers that talk to a defended
//! site: a renewable pool of authenticated sessions, a validated pool of
//! egress proxies, per-source risk scoring with bans and a fixed-window rate
//! limit, and a retrying executor that ties them together.
//!
//! All state lives behind a [`SharedStore`] so several workers can share
//! one keyspace. An in-memory backend and a `redb` file backend ship with
//! the crate.
//!
//! ## Features
//!
//! - Identity pool with failure-count and age eviction, probe validation and
//!   roster-driven refill
//! - Proxy pool with concurrent validation and lazy resupply
//! - Bot-likelihood scoring, tiered bans and per-source rate windows
//! - Bounded retries with linear backoff and outcome feedback
//! - Supervised maintenance loops that survive failing iterations
//! - A TTL result cache shared through the store
//!
//! ## Example
//!
//! ```no_run
//! use crawlgate_rs::{Admission, Gateway, GatewayConfig, RequestMeta};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Gateway::from_config(GatewayConfig::from_env())?;
//!     let _maintenance = gateway.spawn_maintenance();
//!
//!     let meta = RequestMeta::new("GET", "/search").with_user_agent("Mozilla/5.0");
//!     if gateway.admit("203.0.113.7", &meta).await? == Admission::Allowed {
//!         let page = gateway.fetch("203.0.113.7", "https://www.cnki.net/").await?;
//!         println!("status: {}", page.status);
//!     }
//!     Ok(())
//! }
//! ```

mod gateway;

pub mod config;
pub mod external_deps;
pub mod modules;
pub mod store;

pub use crate::gateway::{
    Admission,
    FailureClass,
    Gateway,
    GatewayBuilder,
    GatewayError,
    GatewayResult,
    HealthReport,
};

pub use crate::config::{
    BanTiers,
    CacheConfig,
    ConfigError,
    CredentialConfig,
    ExecutorConfig,
    GatewayConfig,
    GovernorConfig,
    ProxyPoolConfig,
    TargetConfig,
};

pub use crate::store::{
    Clock,
    KeyspaceBackend,
    ManualClock,
    MemoryStore,
    RedbStore,
    SharedStore,
    StoreError,
    StoreResult,
    SystemClock,
};

pub use crate::external_deps::{
    Account,
    CollaboratorError,
    FormLoginProvider,
    HttpProxySupplier,
    HttpTargetProbe,
    LoginProvider,
    ProbeRoute,
    ProxySupplier,
    TargetProbe,
    TargetResponse,
    load_accounts,
};

pub use crate::modules::{
    AttemptContext,
    AttemptError,
    CredentialPool,
    CredentialSet,
    EventDispatcher,
    EventHandler,
    ExecuteError,
    GatewayEvent,
    Identity,
    IdentityLease,
    LoggingHandler,
    MaintenanceError,
    MaintenanceHandles,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    PatternRecord,
    PoolError,
    ProxyEndpoint,
    ProxyHealthReport,
    ProxyPool,
    RequestExecutor,
    RequestMeta,
    Resource,
    ResultCache,
    SourceState,
    SourceStats,
    TrafficGovernor,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
