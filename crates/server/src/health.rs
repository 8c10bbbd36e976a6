//! Periodic synthetic capture against the pipeline, surfaced in /health.
//!
//! The probe bypasses admission and both caches so it measures the real
//! capture path; it alters nothing beyond its own counters.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use shuttergrid_common::{now_unix_secs, CaptureRequest, HealthConfig, ImageFormat};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture::CapturePipeline;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeSnapshot {
    pub enabled: bool,
    pub runs: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
    pub healthy: bool,
    pub last_ok_at: Option<u64>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct ProbeState {
    runs: u64,
    failures: u64,
    consecutive_failures: u64,
    last_ok_at: Option<u64>,
    last_duration_ms: Option<u64>,
    last_error: Option<String>,
}

pub struct HealthProber {
    pipeline: Arc<CapturePipeline>,
    config: HealthConfig,
    state: Mutex<ProbeState>,
}

impl HealthProber {
    pub fn new(pipeline: Arc<CapturePipeline>, config: HealthConfig) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            config,
            state: Mutex::new(ProbeState::default()),
        })
    }

    pub fn snapshot(&self) -> ProbeSnapshot {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        ProbeSnapshot {
            enabled: self.config.enabled,
            runs: state.runs,
            failures: state.failures,
            consecutive_failures: state.consecutive_failures,
            // Never having failed counts as healthy, including before the
            // first probe completes.
            healthy: state.consecutive_failures == 0,
            last_ok_at: state.last_ok_at,
            last_duration_ms: state.last_duration_ms,
            last_error: state.last_error.clone(),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("health prober disabled");
            return;
        }
        info!(
            "health prober started ({} every {:?})",
            self.config.url, self.config.interval
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
            self.probe_once().await;
        }
        info!("health prober stopped");
    }

    async fn probe_once(&self) {
        let request = CaptureRequest {
            url: self.config.url.clone(),
            width: 800,
            height: 600,
            format: ImageFormat::Png,
        };
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.timeout,
            self.pipeline
                .capture_with_options(&request, "health-probe", false),
        )
        .await;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.runs += 1;
        match outcome {
            Ok(Ok(path)) => {
                state.consecutive_failures = 0;
                state.last_ok_at = Some(now_unix_secs());
                state.last_duration_ms = Some(started.elapsed().as_millis() as u64);
                state.last_error = None;
                // The probe artifact is throwaway.
                let _ = std::fs::remove_file(path);
            }
            Ok(Err(e)) => {
                state.failures += 1;
                state.consecutive_failures += 1;
                state.last_error = Some(format!("{}: {}", e.kind, e.message));
                warn!(
                    "health probe failed ({} consecutive): {}",
                    state.consecutive_failures, e.message
                );
            }
            Err(_) => {
                state.failures += 1;
                state.consecutive_failures += 1;
                state.last_error = Some(format!("probe timed out after {:?}", self.config.timeout));
                warn!(
                    "health probe timed out ({} consecutive)",
                    state.consecutive_failures
                );
            }
        }
    }
}
