//! The per-request capture pipeline: acquire a page, install interception,
//! navigate with strategy fallback, settle, screenshot.
//!
//! Browser calls run on the blocking thread pool and are raced against a
//! hard timeout and the shutdown token, so a wedged CDP call can never hold
//! a capture task hostage. Target-closed failures escalate to a
//! fresh-browser retry; timeouts walk down the strategy ladder.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::types::Bounds;
use headless_chrome::Tab;
use shuttergrid_common::{
    classify_driver_error, BlockConfig, CaptureError, CaptureRequest, DriverFailure, ErrorKind,
    ImageFormat, RetryConfig, TimeoutConfig, UrlRewriter,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::interceptor::{install_interceptor, BlockRules, CaptureInterceptor, InterceptStats};
use crate::resource_cache::ResourceCache;
use crate::tab_pool::{PageAcquirer, PageLease};

/// Hard-timeout margin over a strategy's own deadline, to catch CDP calls
/// that stop responding entirely.
const HARD_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Poll cadence for readiness checks inside navigation strategies.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Hosts that historically need the patient navigation budget.
const COMPLEX_SITE_HOSTS: &[&str] = &[
    "linkedin.com",
    "youtube.com",
    "facebook.com",
    "twitter.com",
    "instagram.com",
    "snapchat.com",
    "tiktok.com",
    "viding.co",
    "harisenin.com",
];

/// Navigation strategies in escalation order, each with its share of the
/// base navigation timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavStrategy {
    Commit,
    DomContentLoaded,
    NetworkIdle,
    Load,
}

impl NavStrategy {
    pub const LADDER: [NavStrategy; 4] = [
        NavStrategy::Commit,
        NavStrategy::DomContentLoaded,
        NavStrategy::NetworkIdle,
        NavStrategy::Load,
    ];

    pub fn timeout_factor(self) -> f64 {
        match self {
            NavStrategy::Commit => 0.40,
            NavStrategy::DomContentLoaded => 0.70,
            NavStrategy::NetworkIdle => 0.50,
            NavStrategy::Load => 0.90,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NavStrategy::Commit => "commit",
            NavStrategy::DomContentLoaded => "domcontentloaded",
            NavStrategy::NetworkIdle => "networkidle",
            NavStrategy::Load => "load",
        }
    }
}

/// Timeout multiplier under load: past 70% pool utilization, shrink every
/// deadline so failures are detected faster, floored at half.
pub fn adaptive_scale(utilization: f64) -> f64 {
    if utilization > 0.70 {
        (1.0 - (utilization - 0.70) * 1.67).max(0.5)
    } else {
        1.0
    }
}

fn scaled(d: Duration, factor: f64) -> Duration {
    d.mul_f64(factor)
}

fn is_complex_site(url: &str) -> bool {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
        .map(|host| {
            COMPLEX_SITE_HOSTS
                .iter()
                .any(|c| host == *c || host.ends_with(&format!(".{c}")))
        })
        .unwrap_or(false)
}

enum NavOutcome {
    Loaded,
    /// The browser rendered its own error page (DNS/connect failure).
    ChromeError,
}

enum OpFailure {
    /// The hard timeout fired; the CDP call may still be wedged.
    HardTimeout,
    /// Shutdown token fired.
    Cancelled,
    /// The driver returned an error.
    Driver(String),
}

pub struct CapturePipeline {
    acquirer: PageAcquirer,
    rewriter: Arc<UrlRewriter>,
    resource_cache: Arc<ResourceCache>,
    intercept_stats: Arc<InterceptStats>,
    warmer: mpsc::UnboundedSender<String>,
    blocking: BlockConfig,
    timeouts: TimeoutConfig,
    retry: RetryConfig,
    screenshot_dir: PathBuf,
    cancel: CancellationToken,
}

impl CapturePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        acquirer: PageAcquirer,
        rewriter: Arc<UrlRewriter>,
        resource_cache: Arc<ResourceCache>,
        intercept_stats: Arc<InterceptStats>,
        warmer: mpsc::UnboundedSender<String>,
        blocking: BlockConfig,
        timeouts: TimeoutConfig,
        retry: RetryConfig,
        screenshot_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            acquirer,
            rewriter,
            resource_cache,
            intercept_stats,
            warmer,
            blocking,
            timeouts,
            retry,
            screenshot_dir,
            cancel,
        }
    }

    pub fn acquirer(&self) -> &PageAcquirer {
        &self.acquirer
    }

    /// Capture a screenshot to a file. The artifact path is returned on
    /// success; on failure the partial artifact, if any, is deleted.
    pub async fn capture(
        &self,
        request: &CaptureRequest,
        request_id: &str,
    ) -> Result<PathBuf, CaptureError> {
        self.capture_with_options(request, request_id, true).await
    }

    /// `intercept=false` skips route interception entirely (health probe).
    pub async fn capture_with_options(
        &self,
        request: &CaptureRequest,
        request_id: &str,
        intercept: bool,
    ) -> Result<PathBuf, CaptureError> {
        let started = Instant::now();
        // Navigation uses the rewritten URL; caches key on the original.
        let nav_url = self.rewriter.rewrite(&request.url);
        let scale = adaptive_scale(self.acquirer.pool().utilization().await);
        if scale < 1.0 {
            debug!(request_id, "pool under load, timeouts scaled by {scale:.2}");
        }

        let nav_base = if is_complex_site(&nav_url) {
            self.timeouts.navigation_complex
        } else {
            self.timeouts.navigation_regular
        };

        let path = self
            .screenshot_dir
            .join(format!("{}.{}", Uuid::new_v4(), request.format.extension()));

        let mut last_target_closed =
            CaptureError::new(ErrorKind::TargetClosed, "target closed before first attempt");
        for attempt in 0..=self.retry.max_fresh_retries {
            match self
                .capture_once(request, &nav_url, &path, nav_base, scale, intercept, request_id)
                .await
            {
                Ok(()) => {
                    info!(
                        request_id,
                        url = %request.url,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "capture succeeded"
                    );
                    return Ok(path.clone());
                }
                Err(e) if e.kind == ErrorKind::TargetClosed => {
                    warn!(
                        request_id,
                        "target closed mid-capture (attempt {}/{}), retrying on a fresh browser",
                        attempt + 1,
                        self.retry.max_fresh_retries + 1
                    );
                    last_target_closed = e;
                    let _ = std::fs::remove_file(&path);
                    if attempt < self.retry.max_fresh_retries {
                        tokio::time::sleep(crate::tab_pool::jittered_delay(&self.retry, attempt))
                            .await;
                    }
                    continue;
                }
                Err(e) => {
                    let _ = std::fs::remove_file(&path);
                    return Err(e);
                }
            }
        }
        let _ = std::fs::remove_file(&path);
        Err(last_target_closed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn capture_once(
        &self,
        request: &CaptureRequest,
        nav_url: &str,
        path: &Path,
        nav_base: Duration,
        scale: f64,
        intercept: bool,
        request_id: &str,
    ) -> Result<(), CaptureError> {
        let lease = self.acquirer.acquire_page().await?;
        let browser_index = lease.browser_index();
        let tab = lease.tab();

        // Viewport first: window bounds sized to the requested capture.
        let width = request.width;
        let height = request.height;
        let bounds_tab = tab.clone();
        let set_viewport = self
            .run_tab_op(Duration::from_secs(10), move || {
                bounds_tab
                    .set_bounds(Bounds::Normal {
                        left: None,
                        top: None,
                        width: Some(width as f64),
                        height: Some(height as f64),
                    })
                    .map(|_| ())
                    .map_err(|e| anyhow::anyhow!("set_bounds failed: {e}"))
            })
            .await;
        if let Err(failure) = set_viewport {
            return Err(self.fail_lease(lease, failure, "viewport setup").await);
        }

        // Interception before any navigation. Failure or timeout downgrades
        // to an uninterception capture for this page only.
        if intercept && (self.resource_cache.enabled() || any_blocking(&self.blocking)) {
            let interceptor = Arc::new(CaptureInterceptor::new(
                BlockRules::new(self.blocking, nav_url),
                nav_url.to_string(),
                self.resource_cache.clone(),
                self.intercept_stats.clone(),
                self.warmer.clone(),
            ));
            let installed = install_interceptor(
                &tab,
                interceptor,
                scaled(self.timeouts.route_setup, scale),
            )
            .await;
            if !installed {
                debug!(request_id, "capture continues without interception");
            }
        }

        // Strategy ladder.
        let mut unreachable_seen = false;
        let mut loaded = false;
        for strategy in NavStrategy::LADDER {
            let timeout = scaled(nav_base.mul_f64(strategy.timeout_factor()), scale);
            let nav_tab = tab.clone();
            let url = nav_url.to_string();
            let outcome = self
                .run_tab_op(timeout + HARD_TIMEOUT_MARGIN, move || {
                    navigate_with_strategy(&nav_tab, &url, strategy, timeout)
                })
                .await;

            match outcome {
                Ok(NavOutcome::Loaded) => {
                    debug!(request_id, "navigation settled via {}", strategy.name());
                    loaded = true;
                    break;
                }
                Ok(NavOutcome::ChromeError) => {
                    debug!(request_id, "{} reached a browser error page", strategy.name());
                    unreachable_seen = true;
                }
                Err(OpFailure::Cancelled) => {
                    lease.release(true).await;
                    return Err(CaptureError::internal("service shutting down"));
                }
                Err(OpFailure::HardTimeout) => {
                    debug!(request_id, "{} hit its hard timeout", strategy.name());
                }
                Err(OpFailure::Driver(message)) => match classify_driver_error(&message) {
                    DriverFailure::TargetClosed => {
                        return Err(self
                            .fail_target_closed(lease, browser_index, &message)
                            .await);
                    }
                    DriverFailure::Timeout => {
                        debug!(request_id, "{} timed out: {message}", strategy.name());
                    }
                    DriverFailure::Unreachable => {
                        debug!(request_id, "{} unreachable: {message}", strategy.name());
                        unreachable_seen = true;
                    }
                    DriverFailure::Other => {
                        debug!(request_id, "{} failed: {message}", strategy.name());
                    }
                },
            }
        }

        if !loaded {
            lease.release(true).await;
            return Err(if unreachable_seen {
                CaptureError::new(
                    ErrorKind::NavigateUnreachable,
                    format!("browser could not reach {nav_url}"),
                )
            } else {
                CaptureError::new(
                    ErrorKind::NavigateTimeout,
                    format!("all navigation strategies exhausted for {nav_url}"),
                )
            });
        }

        // Complex sites lazy-load below-the-fold content; nudge it, then
        // return to the top so the clip covers the viewport origin.
        if is_complex_site(nav_url) {
            let scroll_tab = tab.clone();
            let _ = self
                .run_tab_op(Duration::from_secs(5), move || {
                    scroll_tab
                        .evaluate("window.scrollBy(0, 250)", false)
                        .map_err(|e| anyhow::anyhow!("scroll failed: {e}"))?;
                    std::thread::sleep(Duration::from_millis(500));
                    scroll_tab
                        .evaluate("window.scrollTo(0, 0)", false)
                        .map_err(|e| anyhow::anyhow!("scroll reset failed: {e}"))?;
                    Ok(())
                })
                .await;
        }

        // Settle: allow late layout/paint work, then continue regardless.
        tokio::time::sleep(scaled(self.timeouts.settle, scale)).await;

        // Screenshot, with one retry on plain timeout.
        let shot_timeout = scaled(self.timeouts.screenshot, scale);
        let mut shot_result = self
            .screenshot_once(&tab, path, request.format, width, height, shot_timeout)
            .await;
        if matches!(shot_result, Err(OpFailure::HardTimeout)) {
            debug!(request_id, "screenshot timed out, retrying once");
            shot_result = self
                .screenshot_once(&tab, path, request.format, width, height, shot_timeout)
                .await;
        }

        match shot_result {
            Ok(()) => {
                lease.release(true).await;
                Ok(())
            }
            Err(OpFailure::Cancelled) => {
                lease.release(true).await;
                Err(CaptureError::internal("service shutting down"))
            }
            Err(OpFailure::HardTimeout) => {
                lease.release(false).await;
                Err(CaptureError::new(
                    ErrorKind::ScreenshotFailed,
                    format!("screenshot timed out twice after {shot_timeout:?}"),
                ))
            }
            Err(OpFailure::Driver(message)) => match classify_driver_error(&message) {
                DriverFailure::TargetClosed => {
                    Err(self.fail_target_closed(lease, browser_index, &message).await)
                }
                _ => {
                    lease.release(false).await;
                    Err(CaptureError::new(
                        ErrorKind::ScreenshotFailed,
                        format!("screenshot failed: {message}"),
                    ))
                }
            },
        }
    }

    async fn screenshot_once(
        &self,
        tab: &Arc<Tab>,
        path: &Path,
        format: ImageFormat,
        width: u32,
        height: u32,
        timeout: Duration,
    ) -> Result<(), OpFailure> {
        let tab = tab.clone();
        let path = path.to_path_buf();
        self.run_tab_op(timeout, move || {
            let data = shoot(&tab, format, width, height)?;
            std::fs::write(&path, data)
                .map_err(|e| anyhow::anyhow!("artifact write failed: {e}"))?;
            Ok(())
        })
        .await
    }

    /// Target-closed escalation: the browser is marked dead, its tab records
    /// purged, and the lease released unhealthy so the pool recycles it.
    async fn fail_target_closed(
        &self,
        lease: PageLease,
        browser_index: usize,
        message: &str,
    ) -> CaptureError {
        self.acquirer.pool().mark_error(browser_index, true).await;
        self.acquirer.tabs().purge_browser(browser_index).await;
        lease.release(false).await;
        CaptureError::new(
            ErrorKind::TargetClosed,
            format!("browser {browser_index} closed mid-operation: {message}"),
        )
    }

    async fn fail_lease(
        &self,
        lease: PageLease,
        failure: OpFailure,
        stage: &str,
    ) -> CaptureError {
        match failure {
            OpFailure::Cancelled => {
                lease.release(true).await;
                CaptureError::internal("service shutting down")
            }
            OpFailure::HardTimeout => {
                lease.release(false).await;
                CaptureError::internal(format!("{stage} timed out"))
            }
            OpFailure::Driver(message) => match classify_driver_error(&message) {
                DriverFailure::TargetClosed => {
                    let index = lease.browser_index();
                    self.fail_target_closed(lease, index, &message).await
                }
                _ => {
                    lease.release(false).await;
                    CaptureError::internal(format!("{stage} failed: {message}"))
                }
            },
        }
    }

    /// Run a blocking driver call raced against a hard timeout and the
    /// shutdown token.
    async fn run_tab_op<T: Send + 'static>(
        &self,
        hard_timeout: Duration,
        op: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> Result<T, OpFailure> {
        let handle = tokio::task::spawn_blocking(op);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(OpFailure::Cancelled),
            _ = tokio::time::sleep(hard_timeout) => Err(OpFailure::HardTimeout),
            joined = handle => match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(OpFailure::Driver(e.to_string())),
                Err(e) => Err(OpFailure::Driver(format!("driver task panicked: {e}"))),
            },
        }
    }
}

fn any_blocking(config: &BlockConfig) -> bool {
    config.disable_fonts
        || config.disable_images
        || config.disable_media
        || config.disable_analytics
        || config.disable_third_party_scripts
        || config.disable_ads
        || config.disable_social_widgets
}

/// Issue the navigation and wait according to the strategy. Runs on the
/// blocking pool.
fn navigate_with_strategy(
    tab: &Arc<Tab>,
    url: &str,
    strategy: NavStrategy,
    timeout: Duration,
) -> Result<NavOutcome> {
    tab.set_default_timeout(timeout);
    tab.navigate_to(url)
        .map_err(|e| anyhow::anyhow!("navigate failed: {e}"))?;

    let deadline = Instant::now() + timeout;
    match strategy {
        NavStrategy::NetworkIdle => {
            tab.wait_until_navigated()
                .map_err(|e| anyhow::anyhow!("network idle wait failed: {e}"))?;
        }
        NavStrategy::Commit | NavStrategy::DomContentLoaded | NavStrategy::Load => {
            wait_for_ready_state(tab, strategy, deadline)?;
        }
    }

    if on_chrome_error_page(tab) {
        return Ok(NavOutcome::ChromeError);
    }
    Ok(NavOutcome::Loaded)
}

/// Poll `document.readyState` until the strategy's readiness bar is met.
fn wait_for_ready_state(tab: &Arc<Tab>, strategy: NavStrategy, deadline: Instant) -> Result<()> {
    loop {
        match ready_state(tab) {
            Ok(state) => {
                let done = match strategy {
                    // Committed once the new document replaced the blank
                    // page the tab was reset to; readyState may still be
                    // that of the previous document right after navigate.
                    NavStrategy::Commit => current_url(tab)
                        .map(|url| !url.is_empty() && url != "about:blank")
                        .unwrap_or(false),
                    NavStrategy::DomContentLoaded => {
                        state == "interactive" || state == "complete"
                    }
                    NavStrategy::Load => state == "complete",
                    NavStrategy::NetworkIdle => unreachable!("handled by wait_until_navigated"),
                };
                if done {
                    return Ok(());
                }
            }
            Err(e) => {
                // A dead target must surface immediately; transient eval
                // failures during cross-document swaps are retried.
                if classify_driver_error(&e.to_string()) == DriverFailure::TargetClosed {
                    return Err(e);
                }
            }
        }
        if Instant::now() >= deadline {
            anyhow::bail!("navigation wait timed out ({} strategy)", strategy.name());
        }
        std::thread::sleep(READY_POLL_INTERVAL);
    }
}

fn ready_state(tab: &Arc<Tab>) -> Result<String> {
    let result = tab
        .evaluate("document.readyState", false)
        .map_err(|e| anyhow::anyhow!("readyState eval failed: {e}"))?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_default())
}

fn current_url(tab: &Arc<Tab>) -> Option<String> {
    tab.evaluate("document.URL", false)
        .ok()
        .and_then(|r| r.value)
        .and_then(|v| v.as_str().map(|s| s.to_string()))
}

/// DNS/connect failures leave the tab on a chrome-error:// document.
fn on_chrome_error_page(tab: &Arc<Tab>) -> bool {
    current_url(tab)
        .map(|url| url.starts_with("chrome-error://"))
        .unwrap_or(false)
}

/// Capture the viewport as encoded image bytes.
fn shoot(tab: &Arc<Tab>, format: ImageFormat, width: u32, height: u32) -> Result<Vec<u8>> {
    let format_option = match format {
        ImageFormat::Png => Page::CaptureScreenshotFormatOption::Png,
        ImageFormat::Jpeg => Page::CaptureScreenshotFormatOption::Jpeg,
        ImageFormat::Webp => Page::CaptureScreenshotFormatOption::Webp,
    };
    let clip = Page::Viewport {
        x: 0.0,
        y: 0.0,
        width: width as f64,
        height: height as f64,
        scale: 1.0,
    };
    tab.capture_screenshot(format_option, format.quality(), Some(clip), true)
        .map_err(|e| anyhow::anyhow!("capture_screenshot failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_order_and_factors_match_design() {
        let ladder = NavStrategy::LADDER;
        assert_eq!(ladder[0].name(), "commit");
        assert_eq!(ladder[1].name(), "domcontentloaded");
        assert_eq!(ladder[2].name(), "networkidle");
        assert_eq!(ladder[3].name(), "load");
        assert_eq!(ladder[0].timeout_factor(), 0.40);
        assert_eq!(ladder[1].timeout_factor(), 0.70);
        assert_eq!(ladder[2].timeout_factor(), 0.50);
        assert_eq!(ladder[3].timeout_factor(), 0.90);
    }

    #[test]
    fn adaptive_scale_kicks_in_above_seventy_percent() {
        assert_eq!(adaptive_scale(0.0), 1.0);
        assert_eq!(adaptive_scale(0.70), 1.0);
        let at_80 = adaptive_scale(0.80);
        assert!(at_80 < 1.0 && at_80 > 0.8, "got {at_80}");
        // Saturated pool floors at half.
        assert_eq!(adaptive_scale(1.0), 0.5);
        assert_eq!(adaptive_scale(2.0), 0.5);
    }

    #[test]
    fn complex_site_detection_uses_host_suffix() {
        assert!(is_complex_site("https://www.youtube.com/watch?v=x"));
        assert!(is_complex_site("https://viding.co/rsvp/1"));
        assert!(!is_complex_site("https://example.com/youtube.com"));
        assert!(!is_complex_site("not a url"));
    }

    #[test]
    fn scaled_durations_shrink_under_load() {
        let base = Duration::from_millis(20_000);
        assert_eq!(scaled(base, 1.0), base);
        assert_eq!(scaled(base, 0.5), Duration::from_millis(10_000));
    }
}
