//! Bot-likelihood scoring over recorded request patterns.

use std::collections::HashSet;

use super::PatternRecord;

const REGULARITY_WEIGHT: f64 = 0.4;
const PATH_WEIGHT: f64 = 0.3;
const AGENT_WEIGHT: f64 = 0.3;
/// Interval standard deviation (seconds) at which regularity reaches zero.
const REGULARITY_SPAN_SECS: f64 = 10.0;

/// Score in `[0, 1]`; regular timing and low path/user-agent diversity push
/// it up. Fewer than two records score zero.
pub fn score_patterns(records: &[PatternRecord]) -> f64 {
    if records.len() < 2 {
        return 0.0;
    }

    let intervals: Vec<f64> = records
        .windows(2)
        .map(|pair| (pair[0].timestamp - pair[1].timestamp).num_milliseconds() as f64 / 1000.0)
        .collect();
    let regularity = 1.0 - population_stddev(&intervals) / REGULARITY_SPAN_SECS;

    let count = records.len() as f64;
    let paths: HashSet<&str> = records.iter().map(|r| r.path.as_str()).collect();
    let agents: HashSet<&str> = records
        .iter()
        .map(|r| r.user_agent.as_deref().unwrap_or(""))
        .collect();
    let path_diversity = paths.len() as f64 / count;
    let agent_diversity = agents.len() as f64 / count;

    let score = REGULARITY_WEIGHT * regularity
        + PATH_WEIGHT * (1.0 - path_diversity)
        + AGENT_WEIGHT * (1.0 - agent_diversity);
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 1.0)
}

fn population_stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}
