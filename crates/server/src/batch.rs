//! Batch scheduling: one task per job, bounded per-job parallelism,
//! fail-fast cancellation and webhook delivery.
//!
//! Items start in submission order (the parallelism permit is acquired
//! before each task is spawned); completions are unordered. Every item
//! transition persists the job.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use shuttergrid_common::{CaptureError, CaptureRequest, ErrorKind};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::jobs::{BatchJob, ItemStatus, JobStatus, JobStore};
use crate::monitoring::MetricsCollector;
use crate::service::{ScreenshotOutcome, ScreenshotService};

/// Webhook deliveries per job: one initial send plus three retries.
const WEBHOOK_ATTEMPTS: u32 = 4;
const WEBHOOK_BACKOFF_BASE: Duration = Duration::from_secs(1);
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

type CaptureFuture = Pin<Box<dyn Future<Output = Result<ScreenshotOutcome, CaptureError>> + Send>>;

/// Seam between the scheduler and the capture stack. Production wires this
/// to `ScreenshotService::screenshot`; tests substitute stubs.
type CaptureFn = Arc<dyn Fn(CaptureRequest, bool, String) -> CaptureFuture + Send + Sync>;

pub struct BatchRunner {
    store: Arc<JobStore>,
    capture: CaptureFn,
    metrics: Arc<MetricsCollector>,
    http: reqwest::Client,
    shutdown: CancellationToken,
    webhook_backoff: Duration,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl BatchRunner {
    pub fn new(
        store: Arc<JobStore>,
        service: Arc<ScreenshotService>,
        metrics: Arc<MetricsCollector>,
        http: reqwest::Client,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let capture: CaptureFn = Arc::new(move |request: CaptureRequest, use_cache: bool, request_id: String| {
            let service = service.clone();
            let fut: CaptureFuture = Box::pin(async move {
                service.screenshot(&request, use_cache, &request_id).await
            });
            fut
        });
        Self::with_capture(store, capture, metrics, http, shutdown, WEBHOOK_BACKOFF_BASE)
    }

    fn with_capture(
        store: Arc<JobStore>,
        capture: CaptureFn,
        metrics: Arc<MetricsCollector>,
        http: reqwest::Client,
        shutdown: CancellationToken,
        webhook_backoff: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            capture,
            metrics,
            http,
            shutdown,
            webhook_backoff,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Start scheduling a freshly created job.
    pub async fn start(self: &Arc<Self>, handle: Arc<Mutex<BatchJob>>) {
        let job_id = handle.lock().await.job_id.clone();
        let cancel = self.shutdown.child_token();
        self.active.lock().await.insert(job_id.clone(), cancel.clone());
        self.metrics.record_job_created();

        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner.run_job(handle, cancel, &job_id).await;
            runner.active.lock().await.remove(&job_id);
        });
    }

    /// Cancel a running job; the remaining items are marked failed.
    pub async fn cancel(&self, job_id: &str) -> bool {
        match self.active.lock().await.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self, job_id: &str) -> bool {
        self.active.lock().await.contains_key(job_id)
    }

    async fn run_job(
        self: &Arc<Self>,
        handle: Arc<Mutex<BatchJob>>,
        cancel: CancellationToken,
        job_id: &str,
    ) {
        let (item_ids, config) = {
            let mut job = handle.lock().await;
            job.status = JobStatus::Processing;
            let ids: Vec<String> = job.items.iter().map(|i| i.id.clone()).collect();
            let config = job.config.clone();
            self.store.persist(&job).await;
            (ids, config)
        };

        info!(
            job_id,
            items = item_ids.len(),
            parallel = config.effective_parallel(),
            fail_fast = config.fail_fast,
            "batch job started"
        );

        let semaphore = Arc::new(Semaphore::new(config.effective_parallel()));
        let mut tasks = JoinSet::new();

        for item_id in item_ids {
            if cancel.is_cancelled() {
                break;
            }
            // Acquiring before spawning preserves submission order for
            // starts.
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let runner = Arc::clone(self);
            let handle = handle.clone();
            let cancel = cancel.clone();
            let fail_fast = config.fail_fast;
            let use_cache = config.cache;
            let timeout = Duration::from_secs(config.timeout_secs.clamp(1, 60));
            tasks.spawn(async move {
                let _permit = permit;
                runner
                    .run_item(handle, &item_id, cancel, fail_fast, use_cache, timeout)
                    .await;
            });
        }

        while tasks.join_next().await.is_some() {}

        // Items never picked up (fail-fast or shutdown) are failed here.
        let failed = {
            let mut job = handle.lock().await;
            let mut untouched = 0;
            for item in &mut job.items {
                if matches!(item.status, ItemStatus::Pending | ItemStatus::Running) {
                    item.status = ItemStatus::Failed;
                    item.error = Some("cancelled".to_string());
                    untouched += 1;
                }
            }
            if untouched > 0 {
                debug!(job_id, "{untouched} unstarted items marked cancelled");
            }
            job.recompute_status();
            self.store.persist(&job).await;
            job.status == JobStatus::Failed
        };

        self.metrics.record_job_finished(failed);
        info!(job_id, "batch job finished");

        if config.webhook.is_some() {
            self.deliver_webhook(&handle).await;
        }
    }

    async fn run_item(
        self: &Arc<Self>,
        handle: Arc<Mutex<BatchJob>>,
        item_id: &str,
        cancel: CancellationToken,
        fail_fast: bool,
        use_cache: bool,
        timeout: Duration,
    ) {
        if cancel.is_cancelled() {
            return;
        }

        let request = {
            let mut job = handle.lock().await;
            let Some(item) = job.item_mut(item_id) else { return };
            item.status = ItemStatus::Running;
            item.started_at = Some(shuttergrid_common::now_unix_secs());
            let request = CaptureRequest {
                url: item.url.clone(),
                width: item.width,
                height: item.height,
                format: item.format,
            };
            job.recompute_status();
            self.store.persist(&job).await;
            request
        };

        let request_id = format!("{}:{item_id}", handle.lock().await.job_id);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(CaptureError::new(
                ErrorKind::Internal,
                "cancelled",
            )),
            result = tokio::time::timeout(
                timeout,
                (self.capture)(request, use_cache, request_id),
            ) => result.unwrap_or_else(|_| {
                Err(CaptureError::new(
                    ErrorKind::DeadlineExceeded,
                    format!("item timed out after {timeout:?}"),
                ))
            }),
        };

        let failed = {
            let mut job = handle.lock().await;
            if let Some(item) = job.item_mut(item_id) {
                match &outcome {
                    Ok(result) => {
                        item.status = ItemStatus::Success;
                        item.result = Some(result.url.clone());
                        item.cached = Some(result.cached);
                        item.completed_at = Some(shuttergrid_common::now_unix_secs());
                    }
                    Err(e) => {
                        item.status = ItemStatus::Failed;
                        item.error = Some(if e.message == "cancelled" {
                            "cancelled".to_string()
                        } else {
                            format!("{}: {}", e.kind, e.message)
                        });
                        item.completed_at = Some(shuttergrid_common::now_unix_secs());
                    }
                }
            }
            job.recompute_status();
            self.store.persist(&job).await;
            outcome.is_err()
        };

        if failed && fail_fast {
            debug!(item_id, "fail-fast tripped, cancelling remaining items");
            cancel.cancel();
        }
    }

    /// At-least-once webhook delivery with bounded exponential retries.
    async fn deliver_webhook(&self, handle: &Arc<Mutex<BatchJob>>) {
        let (job_id, url, auth, body) = {
            let job = handle.lock().await;
            let Some(url) = job.config.webhook.clone() else { return };
            (
                job.job_id.clone(),
                url,
                job.config.webhook_auth.clone(),
                job.results_body(),
            )
        };

        for attempt in 0..WEBHOOK_ATTEMPTS {
            let mut request = self
                .http
                .post(&url)
                .timeout(WEBHOOK_TIMEOUT)
                .json(&body);
            if let Some(auth) = &auth {
                request = request.header(reqwest::header::AUTHORIZATION, auth);
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    info!(job_id, "webhook delivered to {url}");
                    self.metrics.record_webhook(true);
                    return;
                }
                Ok(response) => {
                    warn!(
                        job_id,
                        "webhook attempt {} got status {}",
                        attempt + 1,
                        response.status()
                    );
                }
                Err(e) => {
                    warn!(job_id, "webhook attempt {} failed: {e}", attempt + 1);
                }
            }
            if attempt + 1 < WEBHOOK_ATTEMPTS {
                tokio::time::sleep(self.webhook_backoff * 2u32.pow(attempt)).await;
            }
        }
        warn!(job_id, "webhook delivery gave up after {WEBHOOK_ATTEMPTS} attempts");
        self.metrics.record_webhook(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{BatchJobConfig, JobItem};
    use shuttergrid_common::{BatchSettings, ImageFormat};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const OK_RESPONSE: &str =
        "HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    const FAIL_RESPONSE: &str =
        "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

    fn store() -> Arc<JobStore> {
        JobStore::new(BatchSettings {
            persistence_enabled: false,
            persistence_dir: PathBuf::from("jobs"),
            job_ttl: Duration::from_secs(3600),
        })
        .unwrap()
    }

    fn item(id: &str) -> JobItem {
        JobItem::new(
            id.to_string(),
            format!("https://example.com/{id}"),
            1280,
            720,
            ImageFormat::Png,
        )
    }

    fn outcome() -> ScreenshotOutcome {
        ScreenshotOutcome {
            url: "/screenshots/test.png".to_string(),
            cached: false,
            duration: Duration::from_millis(1),
        }
    }

    fn noop_capture() -> CaptureFn {
        Arc::new(|_request: CaptureRequest, _use_cache: bool, _request_id: String| {
            let fut: CaptureFuture = Box::pin(async { Ok(outcome()) });
            fut
        })
    }

    fn runner_with(capture: CaptureFn) -> Arc<BatchRunner> {
        BatchRunner::with_capture(
            store(),
            capture,
            Arc::new(MetricsCollector::new()),
            reqwest::Client::new(),
            CancellationToken::new(),
            Duration::from_millis(1),
        )
    }

    async fn wait_terminal(handle: &Arc<Mutex<BatchJob>>) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if handle.lock().await.status.is_terminal() {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job never reached a terminal status"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Minimal HTTP responder that counts requests and answers every one
    /// with the given status line.
    async fn spawn_http_responder(response: &'static str, hits: Arc<AtomicUsize>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                hits.fetch_add(1, Ordering::SeqCst);
                // Drain up to the header terminator, then answer.
                let mut seen = Vec::new();
                let mut buf = [0u8; 4096];
                while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => seen.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/webhook")
    }

    #[tokio::test]
    async fn fail_fast_cancels_unstarted_items() {
        let capture: CaptureFn = Arc::new(|request: CaptureRequest, _use_cache: bool, _request_id: String| {
            let fut: CaptureFuture = Box::pin(async move {
                if request.url.ends_with("/bad") {
                    Err(CaptureError::new(
                        ErrorKind::NavigateUnreachable,
                        "dns failure",
                    ))
                } else {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(outcome())
                }
            });
            fut
        });
        let runner = runner_with(capture);
        let config = BatchJobConfig {
            parallel: 1,
            fail_fast: true,
            cache: false,
            ..Default::default()
        };
        let handle = runner
            .store
            .create(vec![item("good"), item("bad"), item("tail1"), item("tail2")], config)
            .await;
        runner.start(handle.clone()).await;
        wait_terminal(&handle).await;

        let job = handle.lock().await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.items[0].status, ItemStatus::Success);
        assert_eq!(job.items[1].status, ItemStatus::Failed);
        assert_eq!(
            job.items[1].error.as_deref(),
            Some("navigate_unreachable: dns failure")
        );
        // Items after the failure never ran and carry the cancel reason.
        for tail in &job.items[2..] {
            assert_eq!(tail.status, ItemStatus::Failed);
            assert_eq!(tail.error.as_deref(), Some("cancelled"));
        }
    }

    #[tokio::test]
    async fn parallelism_is_bounded_by_the_config() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current2, peak2) = (current.clone(), peak.clone());
        let capture: CaptureFn = Arc::new(move |_request: CaptureRequest, _use_cache: bool, _request_id: String| {
            let current = current2.clone();
            let peak = peak2.clone();
            let fut: CaptureFuture = Box::pin(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(outcome())
            });
            fut
        });
        let runner = runner_with(capture);
        let config = BatchJobConfig {
            parallel: 2,
            cache: false,
            ..Default::default()
        };
        let items = (0..6).map(|i| item(&format!("i{i}"))).collect();
        let handle = runner.store.create(items, config).await;
        runner.start(handle.clone()).await;
        wait_terminal(&handle).await;

        let job = handle.lock().await;
        assert_eq!(job.status, JobStatus::Completed);
        assert!(
            peak.load(Ordering::SeqCst) <= 2,
            "parallelism exceeded the configured bound: {}",
            peak.load(Ordering::SeqCst)
        );
        assert!(job.items.iter().all(|i| i.status == ItemStatus::Success));
    }

    #[tokio::test]
    async fn webhook_failure_retries_three_times_after_the_first_send() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_http_responder(FAIL_RESPONSE, hits.clone()).await;
        let runner = runner_with(noop_capture());
        let config = BatchJobConfig {
            webhook: Some(url),
            ..Default::default()
        };
        let handle = runner.store.create(vec![item("a")], config).await;
        {
            let mut job = handle.lock().await;
            job.items[0].status = ItemStatus::Success;
            job.recompute_status();
        }

        runner.deliver_webhook(&handle).await;
        assert_eq!(hits.load(Ordering::SeqCst), WEBHOOK_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn webhook_success_sends_exactly_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_http_responder(OK_RESPONSE, hits.clone()).await;
        let runner = runner_with(noop_capture());
        let config = BatchJobConfig {
            webhook: Some(url),
            ..Default::default()
        };
        let handle = runner.store.create(vec![item("a")], config).await;
        {
            let mut job = handle.lock().await;
            job.items[0].status = ItemStatus::Success;
            job.recompute_status();
        }

        runner.deliver_webhook(&handle).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn job_without_webhook_delivers_nothing() {
        let runner = runner_with(noop_capture());
        let handle = runner
            .store
            .create(vec![item("a")], BatchJobConfig::default())
            .await;
        // No webhook configured: returns without any request.
        runner.deliver_webhook(&handle).await;
    }
}
