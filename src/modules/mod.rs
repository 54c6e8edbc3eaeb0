//! Core services module
//!
//! Resource pools, traffic governance, resilient execution and the
//! supervised maintenance loops that keep them healthy, plus the shared
//! result cache and event and metrics plumbing.

pub mod cache;
pub mod credentials;
pub mod events;
pub mod executor;
pub mod governor;
pub mod maintenance;
pub mod metrics;
pub mod proxy;
pub mod records;

// Re-export commonly used types
pub use cache::ResultCache;
pub use credentials::{
    CredentialPool, CredentialSet, EvictionReason, Identity, IdentityLease, ValidationSummary,
};
pub use events::{
    AdmissionEvent, AttemptEvent, DenialEvent, EventDispatcher, EventHandler, ExhaustionEvent,
    GatewayEvent, LoggingHandler, MetricsHandler, RetryEvent,
};
pub use executor::{AttemptContext, AttemptError, ExecuteError, RequestExecutor, Resource};
pub use governor::{PatternRecord, RequestMeta, SourceState, TrafficGovernor, score_patterns};
pub use maintenance::{LoopSchedule, MaintenanceError, MaintenanceHandles, run_forever};
pub use metrics::{GlobalStats, MetricsCollector, MetricsSnapshot, SourceStats};
pub use proxy::{ProxyEndpoint, ProxyHealthReport, ProxyPool, ProxyStats, ProxyValidation};
pub use records::{PoolError, PoolResult};
