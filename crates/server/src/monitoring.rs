//! Process-wide metrics: request counters, response-time percentiles and a
//! bounded ring of recent errors.
//!
//! All updates are O(1) under a short-held lock; snapshots clone the small
//! interior state and compute percentiles outside the lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use shuttergrid_common::now_unix_secs;

/// Response-time samples kept for percentile computation.
const RESPONSE_SAMPLE_CAP: usize = 1024;
/// Recent errors kept for the diagnostics ring.
const ERROR_RING_CAP: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: u64,
    pub kind: String,
    pub endpoint: String,
    pub details: String,
}

#[derive(Default)]
struct MetricsInner {
    requests_total: u64,
    requests_success: u64,
    requests_failed: u64,
    by_outcome: HashMap<String, u64>,
    by_endpoint: HashMap<String, u64>,
    response_times_ms: VecDeque<f64>,
    recent_errors: VecDeque<ErrorRecord>,
    batch_jobs_created: u64,
    batch_jobs_completed: u64,
    batch_jobs_failed: u64,
    webhooks_delivered: u64,
    webhooks_failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseTimeSnapshot {
    pub samples: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_failed: u64,
    pub by_outcome: HashMap<String, u64>,
    pub by_endpoint: HashMap<String, u64>,
    pub response_times: ResponseTimeSnapshot,
    pub recent_errors: Vec<ErrorRecord>,
    pub batch_jobs_created: u64,
    pub batch_jobs_completed: u64,
    pub batch_jobs_failed: u64,
    pub webhooks_delivered: u64,
    pub webhooks_failed: u64,
}

pub struct MetricsCollector {
    inner: Mutex<MetricsInner>,
    started_at: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner::default()),
            started_at: Instant::now(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        // Metrics must keep working even if a panicking holder poisoned the
        // lock; the interior counters stay usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_success(&self, endpoint: &str, duration_ms: f64) {
        let mut inner = self.lock();
        inner.requests_total += 1;
        inner.requests_success += 1;
        *inner.by_outcome.entry("success".to_string()).or_default() += 1;
        *inner.by_endpoint.entry(endpoint.to_string()).or_default() += 1;
        if inner.response_times_ms.len() == RESPONSE_SAMPLE_CAP {
            inner.response_times_ms.pop_front();
        }
        inner.response_times_ms.push_back(duration_ms);
    }

    pub fn record_failure(&self, endpoint: &str, kind: &str, details: &str, duration_ms: f64) {
        let mut inner = self.lock();
        inner.requests_total += 1;
        inner.requests_failed += 1;
        *inner.by_outcome.entry(kind.to_string()).or_default() += 1;
        *inner.by_endpoint.entry(endpoint.to_string()).or_default() += 1;
        if inner.response_times_ms.len() == RESPONSE_SAMPLE_CAP {
            inner.response_times_ms.pop_front();
        }
        inner.response_times_ms.push_back(duration_ms);
        if inner.recent_errors.len() == ERROR_RING_CAP {
            inner.recent_errors.pop_front();
        }
        inner.recent_errors.push_back(ErrorRecord {
            timestamp: now_unix_secs(),
            kind: kind.to_string(),
            endpoint: endpoint.to_string(),
            details: details.to_string(),
        });
    }

    /// A rejection that never acquired resources (shed, queue-full, circuit).
    pub fn record_rejection(&self, endpoint: &str, kind: &str) {
        self.record_failure(endpoint, kind, "rejected at admission", 0.0);
    }

    pub fn record_job_created(&self) {
        self.lock().batch_jobs_created += 1;
    }

    pub fn record_job_finished(&self, failed: bool) {
        let mut inner = self.lock();
        if failed {
            inner.batch_jobs_failed += 1;
        } else {
            inner.batch_jobs_completed += 1;
        }
    }

    pub fn record_webhook(&self, delivered: bool) {
        let mut inner = self.lock();
        if delivered {
            inner.webhooks_delivered += 1;
        } else {
            inner.webhooks_failed += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (inner_clone, samples) = {
            let inner = self.lock();
            (
                MetricsSnapshot {
                    uptime_secs: self.started_at.elapsed().as_secs(),
                    requests_total: inner.requests_total,
                    requests_success: inner.requests_success,
                    requests_failed: inner.requests_failed,
                    by_outcome: inner.by_outcome.clone(),
                    by_endpoint: inner.by_endpoint.clone(),
                    response_times: ResponseTimeSnapshot {
                        samples: 0,
                        avg_ms: 0.0,
                        min_ms: 0.0,
                        max_ms: 0.0,
                        p50_ms: 0.0,
                        p95_ms: 0.0,
                        p99_ms: 0.0,
                    },
                    recent_errors: inner.recent_errors.iter().cloned().collect(),
                    batch_jobs_created: inner.batch_jobs_created,
                    batch_jobs_completed: inner.batch_jobs_completed,
                    batch_jobs_failed: inner.batch_jobs_failed,
                    webhooks_delivered: inner.webhooks_delivered,
                    webhooks_failed: inner.webhooks_failed,
                },
                inner.response_times_ms.iter().copied().collect::<Vec<_>>(),
            )
        };

        let mut snapshot = inner_clone;
        snapshot.response_times = summarize(&samples);
        snapshot
    }
}

fn summarize(samples: &[f64]) -> ResponseTimeSnapshot {
    if samples.is_empty() {
        return ResponseTimeSnapshot {
            samples: 0,
            avg_ms: 0.0,
            min_ms: 0.0,
            max_ms: 0.0,
            p50_ms: 0.0,
            p95_ms: 0.0,
            p99_ms: 0.0,
        };
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pct = |p: f64| -> f64 {
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    };
    ResponseTimeSnapshot {
        samples: sorted.len(),
        avg_ms: sorted.iter().sum::<f64>() / sorted.len() as f64,
        min_ms: sorted[0],
        max_ms: sorted[sorted.len() - 1],
        p50_ms: pct(0.50),
        p95_ms: pct(0.95),
        p99_ms: pct(0.99),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_successes_and_failures() {
        let m = MetricsCollector::new();
        m.record_success("/screenshot", 120.0);
        m.record_success("/screenshot", 80.0);
        m.record_failure("/screenshot", "navigate_timeout", "all strategies failed", 4000.0);

        let snap = m.snapshot();
        assert_eq!(snap.requests_total, 3);
        assert_eq!(snap.requests_success, 2);
        assert_eq!(snap.requests_failed, 1);
        assert_eq!(snap.by_outcome["success"], 2);
        assert_eq!(snap.by_outcome["navigate_timeout"], 1);
        assert_eq!(snap.recent_errors.len(), 1);
        assert_eq!(snap.recent_errors[0].kind, "navigate_timeout");
    }

    #[test]
    fn error_ring_is_bounded() {
        let m = MetricsCollector::new();
        for i in 0..250 {
            m.record_failure("/screenshot", "internal", &format!("e{i}"), 1.0);
        }
        let snap = m.snapshot();
        assert_eq!(snap.recent_errors.len(), ERROR_RING_CAP);
        assert_eq!(snap.recent_errors.last().unwrap().details, "e249");
        assert_eq!(snap.recent_errors.first().unwrap().details, "e150");
    }

    #[test]
    fn response_ring_is_bounded_and_summarized() {
        let m = MetricsCollector::new();
        for i in 0..2000 {
            m.record_success("/screenshot", i as f64);
        }
        let snap = m.snapshot();
        assert_eq!(snap.response_times.samples, RESPONSE_SAMPLE_CAP);
        // Oldest samples were evicted; the window is [976, 1999].
        assert_eq!(snap.response_times.min_ms, 976.0);
        assert_eq!(snap.response_times.max_ms, 1999.0);
        assert!(snap.response_times.p95_ms >= snap.response_times.p50_ms);
        assert!(snap.response_times.p99_ms >= snap.response_times.p95_ms);
    }

    #[test]
    fn percentiles_of_empty_window_are_zero() {
        let snap = MetricsCollector::new().snapshot();
        assert_eq!(snap.response_times.samples, 0);
        assert_eq!(snap.response_times.p99_ms, 0.0);
    }
}
