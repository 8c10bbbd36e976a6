//! End-to-end screenshot flow shared by the single-shot endpoint and the
//! batch scheduler: admit, consult the result cache, capture, publish,
//! record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use shuttergrid_common::{CaptureError, CaptureRequest, ErrorKind};
use tracing::{debug, info};

use crate::admission::AdmissionController;
use crate::capture::CapturePipeline;
use crate::monitoring::MetricsCollector;
use crate::result_cache::ResultCache;
use crate::storage::{ArtifactStore, LocalArtifactStore};

#[derive(Debug, Clone)]
pub struct ScreenshotOutcome {
    pub url: String,
    pub cached: bool,
    pub duration: Duration,
}

pub struct ScreenshotService {
    admission: Arc<AdmissionController>,
    pipeline: Arc<CapturePipeline>,
    result_cache: Arc<ResultCache>,
    artifacts: Arc<LocalArtifactStore>,
    metrics: Arc<MetricsCollector>,
    request_deadline: Duration,
}

impl ScreenshotService {
    pub fn new(
        admission: Arc<AdmissionController>,
        pipeline: Arc<CapturePipeline>,
        result_cache: Arc<ResultCache>,
        artifacts: Arc<LocalArtifactStore>,
        metrics: Arc<MetricsCollector>,
        request_deadline: Duration,
    ) -> Self {
        Self {
            admission,
            pipeline,
            result_cache,
            artifacts,
            metrics,
            request_deadline,
        }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn result_cache(&self) -> &Arc<ResultCache> {
        &self.result_cache
    }

    pub fn artifacts(&self) -> &Arc<LocalArtifactStore> {
        &self.artifacts
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn pipeline(&self) -> &Arc<CapturePipeline> {
        &self.pipeline
    }

    /// One screenshot, admission to artifact. `use_cache=false` bypasses the
    /// result cache in both directions.
    pub async fn screenshot(
        &self,
        request: &CaptureRequest,
        use_cache: bool,
        request_id: &str,
    ) -> Result<ScreenshotOutcome, CaptureError> {
        let endpoint = "/screenshot";
        let started = Instant::now();
        request.validate().inspect_err(|e| {
            self.metrics
                .record_failure(endpoint, e.kind.as_str(), &e.message, 0.0);
        })?;

        let permit = match self.admission.admit().await {
            Ok(permit) => permit,
            Err(e) => {
                self.metrics.record_rejection(endpoint, e.kind.as_str());
                return Err(e);
            }
        };

        if use_cache {
            if let Some(artifact) = self.result_cache.get(
                &request.url,
                request.width,
                request.height,
                request.format,
            ) {
                debug!(request_id, "serving screenshot from result cache");
                // No capture ran; the permit is dropped without a breaker
                // outcome.
                drop(permit);
                let duration = started.elapsed();
                self.metrics
                    .record_success(endpoint, duration.as_millis() as f64);
                return Ok(ScreenshotOutcome {
                    url: artifact,
                    cached: true,
                    duration,
                });
            }
        }

        let captured = tokio::time::timeout(
            self.request_deadline,
            self.pipeline.capture(request, request_id),
        )
        .await
        .unwrap_or_else(|_| {
            Err(CaptureError::new(
                ErrorKind::DeadlineExceeded,
                format!("capture exceeded the {:?} request deadline", self.request_deadline),
            ))
        });

        match captured {
            Ok(path) => {
                let artifacts = self.artifacts.clone();
                let published = tokio::task::spawn_blocking(move || artifacts.publish(&path))
                    .await
                    .map_err(|e| CaptureError::internal(format!("publish task panicked: {e}")))
                    .and_then(|r| r.map_err(CaptureError::from));

                match published {
                    Ok(url) => {
                        if use_cache {
                            self.result_cache.put(
                                &request.url,
                                request.width,
                                request.height,
                                request.format,
                                url.clone(),
                            );
                        }
                        permit.record_outcome(true);
                        let duration = started.elapsed();
                        self.metrics
                            .record_success(endpoint, duration.as_millis() as f64);
                        info!(request_id, url = %request.url, "screenshot published at {url}");
                        Ok(ScreenshotOutcome {
                            url,
                            cached: false,
                            duration,
                        })
                    }
                    Err(e) => {
                        permit.record_outcome(false);
                        self.metrics.record_failure(
                            endpoint,
                            e.kind.as_str(),
                            &e.message,
                            started.elapsed().as_millis() as f64,
                        );
                        Err(e)
                    }
                }
            }
            Err(e) => {
                permit.record_outcome(false);
                self.metrics.record_failure(
                    endpoint,
                    e.kind.as_str(),
                    &e.message,
                    started.elapsed().as_millis() as f64,
                );
                Err(e)
            }
        }
    }
}
