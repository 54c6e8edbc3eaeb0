//! In-process metrics for the executor and admission path.
//!
//! Aggregated global and per-source counters with latency percentiles over a
//! bounded sample window. Per-source entries are capped; the least recently
//! seen source is forgotten first.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Aggregated metrics across all sources.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub denials: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            attempts: 0,
            successes: 0,
            failures: 0,
            rejections: 0,
            denials: 0,
            average_latency: None,
            p95_latency: None,
        }
    }
}

/// Source-scoped metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub source: String,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Inbound requests refused at admission (banned or rate limited).
    pub rejections: u64,
    /// Access-denied signals from the target.
    pub denials: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub consecutive_failures: u32,
}

impl SourceStats {
    fn from_accumulator(source: &str, acc: &SourceAccumulator) -> Self {
        let (avg, p95) = latency_stats(&acc.latencies);
        Self {
            source: source.to_string(),
            attempts: acc.attempts,
            successes: acc.successes,
            failures: acc.failures,
            rejections: acc.rejections,
            denials: acc.denials,
            average_latency: avg,
            p95_latency: p95,
            consecutive_failures: acc.consecutive_failures,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub sources: Vec<SourceStats>,
}

#[derive(Debug)]
struct SourceAccumulator {
    attempts: u64,
    successes: u64,
    failures: u64,
    rejections: u64,
    denials: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
    consecutive_failures: u32,
    last_seen: u64,
}

impl SourceAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            attempts: 0,
            successes: 0,
            failures: 0,
            rejections: 0,
            denials: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            consecutive_failures: 0,
            last_seen: 0,
        }
    }

    fn record(&mut self, success: bool, latency: Duration) {
        self.attempts += 1;
        if success {
            self.successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.failures += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }

        push_sample(&mut self.latencies, self.max_window, latency);
    }
}

fn push_sample(window: &mut VecDeque<Duration>, max_window: usize, sample: Duration) {
    if window.len() == max_window {
        window.pop_front();
    }
    window.push_back(sample);
}

fn latency_stats<'a>(
    samples: impl IntoIterator<Item = &'a Duration>,
) -> (Option<Duration>, Option<Duration>) {
    let mut samples: Vec<Duration> = samples.into_iter().copied().collect();
    if samples.is_empty() {
        return (None, None);
    }
    samples.sort_unstable();
    let avg = samples.iter().map(Duration::as_secs_f64).sum::<f64>() / samples.len() as f64;
    let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
    (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    global_latencies: VecDeque<Duration>,
    max_window: usize,
    max_sources: usize,
    tick: u64,
    sources: HashMap<String, SourceAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize, max_sources: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            global_latencies: VecDeque::with_capacity(max_window),
            max_window,
            max_sources,
            tick: 0,
            sources: HashMap::new(),
        }
    }

    fn accumulator_mut(&mut self, source: &str) -> &mut SourceAccumulator {
        self.tick += 1;
        if !self.sources.contains_key(source) && self.sources.len() >= self.max_sources {
            let stalest = self
                .sources
                .iter()
                .min_by_key(|(_, acc)| acc.last_seen)
                .map(|(key, _)| key.clone());
            if let Some(stalest) = stalest {
                self.sources.remove(&stalest);
            }
        }
        let max_window = self.max_window;
        let acc = self
            .sources
            .entry(source.to_string())
            .or_insert_with(|| SourceAccumulator::new(max_window));
        acc.last_seen = self.tick;
        acc
    }
}

/// Thread-safe metrics collector shared by event handlers.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_limits(128, 1024)
    }

    /// `window` latency samples per source and globally, at most
    /// `max_sources` tracked sources.
    pub fn with_limits(window: usize, max_sources: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16), max_sources.max(1)))),
        }
    }

    // metrics stay usable after a panicking handler
    fn state(&self) -> MutexGuard<'_, MetricsState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_attempt(&self, source: &str, success: bool, latency: Duration) {
        let mut guard = self.state();
        guard.global.attempts += 1;
        if success {
            guard.global.successes += 1;
        } else {
            guard.global.failures += 1;
        }

        guard.global.average_latency = Some(match guard.global.average_latency {
            Some(avg) => Duration::from_secs_f64(avg.as_secs_f64() * 0.9 + latency.as_secs_f64() * 0.1),
            None => latency,
        });

        guard.accumulator_mut(source).record(success, latency);

        let max_window = guard.max_window;
        push_sample(&mut guard.global_latencies, max_window, latency);
        let (_, p95) = latency_stats(&guard.global_latencies);
        guard.global.p95_latency = p95;
    }

    pub fn record_rejection(&self, source: &str) {
        let mut guard = self.state();
        guard.global.rejections += 1;
        guard.accumulator_mut(source).rejections += 1;
    }

    pub fn record_denial(&self, source: &str) {
        let mut guard = self.state();
        guard.global.denials += 1;
        guard.accumulator_mut(source).denials += 1;
    }

    pub fn source(&self, source: &str) -> Option<SourceStats> {
        let guard = self.state();
        guard
            .sources
            .get(source)
            .map(|acc| SourceStats::from_accumulator(source, acc))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.state();
        let sources = guard
            .sources
            .iter()
            .map(|(source, acc)| SourceStats::from_accumulator(source, acc))
            .collect();
        MetricsSnapshot {
            global: guard.global.clone(),
            sources,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
