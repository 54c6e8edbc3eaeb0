//! Gateway event hooks.
//!
//! The executor and the admission path publish structured events; handlers
//! turn them into logs and metrics.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::metrics::MetricsCollector;

/// Outcome of an admission check for an inbound request.
#[derive(Debug, Clone)]
pub struct AdmissionEvent {
    pub source: String,
    pub verdict: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// One finished attempt inside `execute`.
#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub source: String,
    pub attempt: usize,
    pub identity: String,
    pub proxy: String,
    pub success: bool,
    pub error: Option<String>,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub source: String,
    pub attempt: usize,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DenialEvent {
    pub source: String,
    pub ban: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExhaustionEvent {
    pub source: String,
    pub resource: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Admission(AdmissionEvent),
    Attempt(AttemptEvent),
    Retry(RetryEvent),
    Denied(DenialEvent),
    Exhausted(ExhaustionEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &GatewayEvent);
}

/// Broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: GatewayEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &GatewayEvent) {
        match event {
            GatewayEvent::Admission(admission) => {
                log::debug!("admission {} -> {}", admission.source, admission.verdict);
            }
            GatewayEvent::Attempt(attempt) if attempt.success => {
                log::debug!(
                    "{} attempt {} ok via {} ({:.2}s)",
                    attempt.source,
                    attempt.attempt,
                    attempt.proxy,
                    attempt.latency.as_secs_f64()
                );
            }
            GatewayEvent::Attempt(attempt) => {
                log::warn!(
                    "{} attempt {} failed via {}: {}",
                    attempt.source,
                    attempt.attempt,
                    attempt.proxy,
                    attempt.error.as_deref().unwrap_or("unknown error")
                );
            }
            GatewayEvent::Retry(retry) => {
                log::info!(
                    "retry {} attempt {} after {:.2}s ({})",
                    retry.source,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            GatewayEvent::Denied(denied) => {
                log::warn!("{} denied by target, banned for {:?}", denied.source, denied.ban);
            }
            GatewayEvent::Exhausted(exhausted) => {
                log::warn!("{} found no {} available", exhausted.source, exhausted.resource);
            }
        }
    }
}

/// Feeds attempt and admission events into a [`MetricsCollector`].
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &GatewayEvent) {
        match event {
            GatewayEvent::Attempt(attempt) => {
                self.metrics
                    .record_attempt(&attempt.source, attempt.success, attempt.latency);
            }
            GatewayEvent::Admission(admission) if admission.verdict != "allowed" => {
                self.metrics.record_rejection(&admission.source);
            }
            GatewayEvent::Denied(denied) => self.metrics.record_denial(&denied.source),
            _ => {}
        }
    }
}
