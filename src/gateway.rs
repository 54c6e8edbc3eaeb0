//! High level gateway orchestration.
//!
//! Wires the shared store, both resource pools, the traffic governor and the
//! resilient executor into one handle that a request-handling layer can
//! consult for admission, run outbound operations through, and supervise.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::{ConfigError, GatewayConfig};
use crate::external_deps::login::{Account, FormLoginProvider, LoginProvider, load_accounts};
use crate::external_deps::probe::{HttpTargetProbe, TargetProbe};
use crate::external_deps::supply::{HttpProxySupplier, ProxySupplier};
use crate::external_deps::transport::{self, TargetResponse};
use crate::external_deps::CollaboratorError;
use crate::modules::cache::ResultCache;
use crate::modules::credentials::CredentialPool;
use crate::modules::events::{
	AdmissionEvent, EventDispatcher, EventHandler, GatewayEvent, LoggingHandler, MetricsHandler,
};
use crate::modules::executor::{AttemptContext, AttemptError, ExecuteError, RequestExecutor};
use crate::modules::governor::{RequestMeta, TrafficGovernor};
use crate::modules::maintenance::MaintenanceHandles;
use crate::modules::metrics::MetricsCollector;
use crate::modules::proxy::ProxyPool;
use crate::modules::records::PoolError;
use crate::store::{Clock, MemoryStore, RedbStore, SharedStore, StoreError, SystemClock};

/// Result alias used across the orchestration layer.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// How a request-handling layer should surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
	/// Retry later: nothing to lease, the source is banned or throttled, or
	/// the target refused access.
	TemporarilyUnavailable,
	Failed,
}

#[derive(Debug, Error)]
pub enum GatewayError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("store error: {0}")]
	Store(#[from] StoreError),
	#[error("pool error: {0}")]
	Pool(#[from] PoolError),
	#[error("collaborator setup failed: {0}")]
	Collaborator(#[from] CollaboratorError),
	#[error(transparent)]
	Execute(#[from] ExecuteError),
	#[error("source {0} is banned")]
	Banned(String),
	#[error("source {0} is rate limited")]
	RateLimited(String),
}

impl GatewayError {
	pub fn failure_class(&self) -> FailureClass {
		match self {
			GatewayError::Banned(_) | GatewayError::RateLimited(_) => {
				FailureClass::TemporarilyUnavailable
			}
			GatewayError::Execute(
				ExecuteError::ResourceExhausted(_) | ExecuteError::AccessDenied { .. },
			) => FailureClass::TemporarilyUnavailable,
			_ => FailureClass::Failed,
		}
	}
}

/// Verdict for an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
	Allowed,
	Banned,
	RateLimited,
}

impl Admission {
	pub fn as_str(self) -> &'static str {
		match self {
			Admission::Allowed => "allowed",
			Admission::Banned => "banned",
			Admission::RateLimited => "rate_limited",
		}
	}

	pub fn is_allowed(self) -> bool {
		matches!(self, Admission::Allowed)
	}

	/// Error form of a refusal, for callers that propagate with `?`.
	pub fn into_result(self, source: &str) -> GatewayResult<()> {
		match self {
			Admission::Allowed => Ok(()),
			Admission::Banned => Err(GatewayError::Banned(source.to_string())),
			Admission::RateLimited => Err(GatewayError::RateLimited(source.to_string())),
		}
	}
}

/// Pool sizes at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
	pub identities: usize,
	pub proxies: usize,
	pub timestamp: DateTime<Utc>,
}

impl HealthReport {
	pub fn status(&self) -> &'static str {
		if self.identities > 0 && self.proxies > 0 {
			"healthy"
		} else {
			"degraded"
		}
	}
}

/// Fluent builder for [`Gateway`].
pub struct GatewayBuilder {
	config: GatewayConfig,
	store: Option<Arc<dyn SharedStore>>,
	clock: Option<Arc<dyn Clock>>,
	login: Option<Arc<dyn LoginProvider>>,
	supplier: Option<Arc<dyn ProxySupplier>>,
	probe: Option<Arc<dyn TargetProbe>>,
	accounts: Option<Vec<Account>>,
	handlers: Vec<Arc<dyn EventHandler>>,
	enable_metrics: bool,
}

impl GatewayBuilder {
	pub fn new() -> Self {
		Self {
			config: GatewayConfig::default(),
			store: None,
			clock: None,
			login: None,
			supplier: None,
			probe: None,
			accounts: None,
			handlers: Vec::new(),
			enable_metrics: true,
		}
	}

	pub fn with_config(mut self, config: GatewayConfig) -> Self {
		self.config = config;
		self
	}

	/// Share an existing store instead of opening one from the config.
	pub fn with_store(mut self, store: Arc<dyn SharedStore>) -> Self {
		self.store = Some(store);
		self
	}

	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = Some(clock);
		self
	}

	pub fn with_login_provider(mut self, login: Arc<dyn LoginProvider>) -> Self {
		self.login = Some(login);
		self
	}

	pub fn with_proxy_supplier(mut self, supplier: Arc<dyn ProxySupplier>) -> Self {
		self.supplier = Some(supplier);
		self
	}

	pub fn with_probe(mut self, probe: Arc<dyn TargetProbe>) -> Self {
		self.probe = Some(probe);
		self
	}

	/// Use this roster instead of reading `credentials.accounts_file`.
	pub fn with_accounts(mut self, accounts: Vec<Account>) -> Self {
		self.accounts = Some(accounts);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.enable_metrics = false;
		self
	}

	pub fn build(self) -> GatewayResult<Gateway> {
		let config = self.config;
		config.validate()?;
		let prefix = config.key_prefix.as_str();
		let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

		let store: Arc<dyn SharedStore> = match (self.store, &config.store_path) {
			(Some(store), _) => store,
			(None, Some(path)) => {
				log::info!("opening redb store at {}", path.display());
				Arc::new(RedbStore::open_with_clock(path, clock.clone())?)
			}
			(None, None) => Arc::new(MemoryStore::with_clock(clock.clone())),
		};

		let probe: Arc<dyn TargetProbe> = match self.probe {
			Some(probe) => probe,
			None => Arc::new(HttpTargetProbe::new(config.target.probe_url.clone())),
		};
		let login: Arc<dyn LoginProvider> = match self.login {
			Some(login) => login,
			None => Arc::new(FormLoginProvider::new(
				&config.target.login_url,
				config.executor.attempt_timeout,
			)?),
		};
		let supplier: Arc<dyn ProxySupplier> = match self.supplier {
			Some(supplier) => supplier,
			None => Arc::new(HttpProxySupplier::new(
				config.proxies.supply_url.clone(),
				config.proxies.probe_timeout,
			)?),
		};
		let accounts = self
			.accounts
			.unwrap_or_else(|| load_accounts(&config.credentials.accounts_file));

		let credentials = Arc::new(
			CredentialPool::new(store.clone(), config.credentials.clone(), login, probe.clone())
				.with_clock(clock.clone())
				.with_key_prefix(prefix)
				.with_accounts(accounts),
		);
		let proxies = Arc::new(
			ProxyPool::new(store.clone(), config.proxies.clone(), supplier, probe)
				.with_clock(clock.clone())
				.with_key_prefix(prefix),
		);
		let governor = Arc::new(
			TrafficGovernor::new(store.clone(), config.governor.clone())
				.with_clock(clock.clone())
				.with_key_prefix(prefix),
		);
		let cache = ResultCache::new(store.clone(), config.cache.clone()).with_key_prefix(prefix);

		let mut dispatcher = EventDispatcher::new();
		dispatcher.register_handler(Arc::new(LoggingHandler));
		let metrics = if self.enable_metrics {
			let metrics = MetricsCollector::new();
			dispatcher.register_handler(Arc::new(MetricsHandler::new(metrics.clone())));
			Some(metrics)
		} else {
			None
		};
		for handler in self.handlers {
			dispatcher.register_handler(handler);
		}
		let events = Arc::new(dispatcher);

		let executor = RequestExecutor::new(
			credentials.clone(),
			proxies.clone(),
			governor.clone(),
			config.executor.clone(),
		)
		.with_events(events.clone());

		Ok(Gateway {
			config,
			store,
			clock,
			credentials,
			proxies,
			governor,
			executor,
			cache,
			metrics,
			events,
		})
	}
}

impl Default for GatewayBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Main gateway handle.
pub struct Gateway {
	config: GatewayConfig,
	store: Arc<dyn SharedStore>,
	clock: Arc<dyn Clock>,
	credentials: Arc<CredentialPool>,
	proxies: Arc<ProxyPool>,
	governor: Arc<TrafficGovernor>,
	executor: RequestExecutor,
	cache: ResultCache,
	metrics: Option<MetricsCollector>,
	events: Arc<EventDispatcher>,
}

impl Gateway {
	/// Obtain a builder to customise the gateway instance.
	pub fn builder() -> GatewayBuilder {
		GatewayBuilder::new()
	}

	/// Gateway with default collaborators for `config`.
	pub fn from_config(config: GatewayConfig) -> GatewayResult<Self> {
		GatewayBuilder::new().with_config(config).build()
	}

	pub fn config(&self) -> &GatewayConfig {
		&self.config
	}

	pub fn store(&self) -> &Arc<dyn SharedStore> {
		&self.store
	}

	pub fn credentials(&self) -> &Arc<CredentialPool> {
		&self.credentials
	}

	pub fn proxies(&self) -> &Arc<ProxyPool> {
		&self.proxies
	}

	pub fn governor(&self) -> &Arc<TrafficGovernor> {
		&self.governor
	}

	pub fn executor(&self) -> &RequestExecutor {
		&self.executor
	}

	pub fn cache(&self) -> &ResultCache {
		&self.cache
	}

	pub fn metrics(&self) -> Option<&MetricsCollector> {
		self.metrics.as_ref()
	}

	/// Ban check, then rate window, then pattern capture. Refused requests
	/// leave no pattern behind.
	pub async fn admit(&self, source: &str, meta: &RequestMeta) -> GatewayResult<Admission> {
		let verdict = if self.governor.is_banned(source).await? {
			Admission::Banned
		} else if !self.governor.check_rate_limit(source).await? {
			Admission::RateLimited
		} else {
			self.governor.record_pattern(source, meta).await?;
			Admission::Allowed
		};

		self.events.dispatch(GatewayEvent::Admission(AdmissionEvent {
			source: source.to_string(),
			verdict: verdict.as_str(),
			timestamp: self.clock.now(),
		}));
		Ok(verdict)
	}

	/// Run `op` through the resilient executor on behalf of `source`.
	pub async fn execute<T, F, Fut>(&self, source: &str, op: F) -> GatewayResult<T>
	where
		F: FnMut(AttemptContext) -> Fut,
		Fut: Future<Output = Result<T, AttemptError>>,
	{
		Ok(self.executor.execute(source, op).await?)
	}

	/// GET `url` with a leased identity and proxy.
	pub async fn fetch(&self, source: &str, url: &str) -> GatewayResult<TargetResponse> {
		self.execute(source, |ctx| async move {
			let client = ctx.client()?;
			transport::fetch(&client, url).await
		})
		.await
	}

	/// Like [`fetch`](Self::fetch), but serves a page fetched within the last
	/// `ttl` from the shared cache. Only successful fetches are cached.
	pub async fn fetch_cached(
		&self,
		source: &str,
		url: &str,
		ttl: Duration,
	) -> GatewayResult<TargetResponse> {
		let page: CachedPage = self
			.cache
			.get_or_try_insert(&format!("fetch:{url}"), ttl, || async {
				self.fetch(source, url).await.map(CachedPage::from)
			})
			.await?;
		page.into_response()
	}

	pub async fn health(&self) -> GatewayResult<HealthReport> {
		Ok(HealthReport {
			identities: self.credentials.size().await?,
			proxies: self.proxies.size().await?,
			timestamp: self.clock.now(),
		})
	}

	/// Start the credential, proxy and pattern-purge loops. Must be called
	/// inside a tokio runtime.
	pub fn spawn_maintenance(&self) -> MaintenanceHandles {
		let mut handles = MaintenanceHandles::new();
		handles.push(
			"credential-pool",
			tokio::spawn(Arc::clone(&self.credentials).monitor()),
		);
		handles.push("proxy-pool", tokio::spawn(Arc::clone(&self.proxies).monitor()));
		handles.push(
			"traffic-governor",
			tokio::spawn(Arc::clone(&self.governor).monitor()),
		);
		handles
	}
}

#[derive(Serialize, Deserialize)]
struct CachedPage {
	status: u16,
	url: String,
	body: Vec<u8>,
}

impl From<TargetResponse> for CachedPage {
	fn from(response: TargetResponse) -> Self {
		Self {
			status: response.status,
			url: response.url.to_string(),
			body: response.body.to_vec(),
		}
	}
}

impl CachedPage {
	fn into_response(self) -> GatewayResult<TargetResponse> {
		let url = Url::parse(&self.url).map_err(|err| {
			GatewayError::Collaborator(CollaboratorError::Decode(format!("cached url: {err}")))
		})?;
		Ok(TargetResponse {
			status: self.status,
			url,
			body: Bytes::from(self.body),
		})
	}
}

impl std::fmt::Debug for Gateway {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Gateway")
			.field("key_prefix", &self.config.key_prefix)
			.field("credentials", &self.credentials)
			.field("proxies", &self.proxies)
			.field("governor", &self.governor)
			.finish()
	}
}
