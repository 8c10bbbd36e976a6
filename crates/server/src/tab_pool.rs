//! Tab reuse within pooled browsers, plus the scoped page lease handed to
//! the capture pipeline.
//!
//! Two operating modes:
//! - tab-pool mode reuses idle pages within their owning browser, bounded
//!   by `max_tabs_per_browser`, resetting each page between uses;
//! - context mode (fallback, and the only mode when tab reuse is disabled)
//!   opens a fresh CDP browser context with a single page per capture.
//!
//! Tabs are addressed by an id scoped to their owning browser index;
//! destruction of a browser simply invalidates its ids, there are no back
//! pointers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as AnyhowContext, Result};
use headless_chrome::Tab;
use rand::Rng;
use serde::Serialize;
use shuttergrid_common::{CaptureError, RetryConfig, TabConfig, TimeoutConfig};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::browser_pool::{AcquiredBrowser, BrowserPool};

/// Exponential backoff with the configured jitter factor applied.
pub(crate) fn jittered_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let base = retry.delay_for_attempt(attempt);
    let spread = (base.as_millis() as f64 * retry.jitter) as i64;
    if spread <= 0 {
        return base;
    }
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis((base.as_millis() as i64 + offset).max(0) as u64)
}

struct TabRecord {
    tab: Arc<Tab>,
    browser_index: usize,
    created_at: Instant,
    last_used: Instant,
    in_use: bool,
    uses: u64,
}

/// Whether a tab has aged out of the pool.
fn tab_expired(
    created_at: Instant,
    last_used: Instant,
    uses: u64,
    config: &TabConfig,
) -> bool {
    created_at.elapsed() > config.tab_max_age
        || last_used.elapsed() > config.tab_idle_timeout
        || uses >= config.max_tab_uses
}

struct TabInner {
    tabs: HashMap<u64, TabRecord>,
    by_browser: HashMap<usize, Vec<u64>>,
    available: VecDeque<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TabPoolStats {
    pub total_tabs: usize,
    pub available_tabs: usize,
    pub busy_tabs: usize,
    pub browsers_with_tabs: usize,
    pub created_total: u64,
    pub reused_total: u64,
    pub closed_total: u64,
}

pub struct TabPool {
    config: TabConfig,
    inner: Mutex<TabInner>,
    next_id: AtomicU64,
    created_total: AtomicU64,
    reused_total: AtomicU64,
    closed_total: AtomicU64,
}

impl TabPool {
    pub fn new(config: TabConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(TabInner {
                tabs: HashMap::new(),
                by_browser: HashMap::new(),
                available: VecDeque::new(),
            }),
            next_id: AtomicU64::new(0),
            created_total: AtomicU64::new(0),
            reused_total: AtomicU64::new(0),
            closed_total: AtomicU64::new(0),
        })
    }

    /// Reuse an idle tab of this browser, or open a new page under the
    /// per-browser cap. Errors when the browser is at capacity.
    pub async fn acquire_for(
        self: &Arc<Self>,
        browser: &AcquiredBrowser,
        page_creation_timeout: Duration,
    ) -> Result<(Arc<Tab>, u64)> {
        {
            let mut inner = self.inner.lock().await;
            let reusable = inner
                .available
                .iter()
                .copied()
                .find(|id| {
                    inner
                        .tabs
                        .get(id)
                        .map(|t| {
                            t.browser_index == browser.index
                                && !tab_expired(t.created_at, t.last_used, t.uses, &self.config)
                        })
                        .unwrap_or(false)
                });
            if let Some(id) = reusable {
                inner.available.retain(|i| *i != id);
                let record = inner.tabs.get_mut(&id).expect("reusable id just observed");
                record.in_use = true;
                record.last_used = Instant::now();
                record.uses += 1;
                self.reused_total.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "reusing tab {id} of browser {} (uses: {})",
                    browser.index, record.uses
                );
                return Ok((record.tab.clone(), id));
            }

            let open_count = inner
                .by_browser
                .get(&browser.index)
                .map(|v| v.len())
                .unwrap_or(0);
            if open_count >= self.config.max_tabs_per_browser {
                anyhow::bail!(
                    "browser {} is at its tab cap ({})",
                    browser.index,
                    self.config.max_tabs_per_browser
                );
            }
        }

        let handle = browser.browser.clone();
        let tab = tokio::time::timeout(
            page_creation_timeout,
            tokio::task::spawn_blocking(move || handle.new_tab()),
        )
        .await
        .context("page creation timed out")?
        .context("page creation task panicked")?
        .map_err(|e| anyhow::anyhow!("failed to open tab: {e}"))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().await;
        inner.tabs.insert(
            id,
            TabRecord {
                tab: tab.clone(),
                browser_index: browser.index,
                created_at: Instant::now(),
                last_used: Instant::now(),
                in_use: true,
                uses: 1,
            },
        );
        inner.by_browser.entry(browser.index).or_default().push(id);
        self.created_total.fetch_add(1, Ordering::Relaxed);
        debug!("opened tab {id} in browser {}", browser.index);
        Ok((tab, id))
    }

    /// Return a tab to the pool. Healthy tabs are reset for reuse; anything
    /// else is closed.
    pub async fn release(self: &Arc<Self>, id: u64, healthy: bool) {
        let (tab, retire) = {
            let inner = self.inner.lock().await;
            match inner.tabs.get(&id) {
                Some(record) => (
                    record.tab.clone(),
                    !healthy
                        || tab_expired(record.created_at, record.last_used, record.uses, &self.config),
                ),
                None => return,
            }
        };

        if retire {
            self.close_tab(id).await;
            return;
        }

        // Reset outside the lock: blank navigation plus interception
        // teardown. A failed reset retires the tab instead of recycling a
        // wedged page.
        let reset_tab = tab.clone();
        let reset = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::task::spawn_blocking(move || -> Result<()> {
                let _ = reset_tab.disable_fetch();
                reset_tab
                    .navigate_to("about:blank")
                    .map_err(|e| anyhow::anyhow!("blank navigation failed: {e}"))?;
                Ok(())
            }),
        )
        .await;

        match reset {
            Ok(Ok(Ok(()))) => {
                let mut inner = self.inner.lock().await;
                if let Some(record) = inner.tabs.get_mut(&id) {
                    record.in_use = false;
                    record.last_used = Instant::now();
                    if !inner.available.contains(&id) {
                        inner.available.push_back(id);
                    }
                }
            }
            _ => {
                debug!("tab {id} failed reset, closing");
                self.close_tab(id).await;
            }
        }
    }

    async fn close_tab(self: &Arc<Self>, id: u64) {
        let record = {
            let mut inner = self.inner.lock().await;
            let record = inner.tabs.remove(&id);
            if let Some(ref r) = record {
                inner.available.retain(|i| *i != id);
                if let Some(ids) = inner.by_browser.get_mut(&r.browser_index) {
                    ids.retain(|i| *i != id);
                    if ids.is_empty() {
                        inner.by_browser.remove(&r.browser_index);
                    }
                }
            }
            record
        };
        if let Some(record) = record {
            self.closed_total.fetch_add(1, Ordering::Relaxed);
            tokio::task::spawn_blocking(move || {
                let _ = record.tab.close(false);
            });
        }
    }

    /// Drop all tab records owned by a browser (used when the browser is
    /// known dead; the pages died with the process).
    pub async fn purge_browser(self: &Arc<Self>, browser_index: usize) {
        let ids: Vec<u64> = {
            let inner = self.inner.lock().await;
            inner
                .by_browser
                .get(&browser_index)
                .cloned()
                .unwrap_or_default()
        };
        for id in ids {
            self.close_tab(id).await;
        }
    }

    /// Close idle and aged tabs. Returns how many were closed.
    pub async fn sweep(self: &Arc<Self>) -> usize {
        let expired: Vec<u64> = {
            let inner = self.inner.lock().await;
            inner
                .tabs
                .iter()
                .filter(|(_, t)| {
                    !t.in_use && tab_expired(t.created_at, t.last_used, t.uses, &self.config)
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for id in &expired {
            self.close_tab(*id).await;
        }
        if !expired.is_empty() {
            info!("tab sweeper closed {} idle/aged tabs", expired.len());
        }
        expired.len()
    }

    pub async fn stats(&self) -> TabPoolStats {
        let inner = self.inner.lock().await;
        let busy = inner.tabs.values().filter(|t| t.in_use).count();
        TabPoolStats {
            total_tabs: inner.tabs.len(),
            available_tabs: inner.available.len(),
            busy_tabs: busy,
            browsers_with_tabs: inner.by_browser.len(),
            created_total: self.created_total.load(Ordering::Relaxed),
            reused_total: self.reused_total.load(Ordering::Relaxed),
            closed_total: self.closed_total.load(Ordering::Relaxed),
        }
    }

    pub async fn shutdown(self: &Arc<Self>) {
        let ids: Vec<u64> = {
            let inner = self.inner.lock().await;
            inner.tabs.keys().copied().collect()
        };
        for id in ids {
            self.close_tab(id).await;
        }
    }
}

enum LeaseKind {
    /// Pooled tab, returned to the tab pool on release.
    Pooled { tab_id: u64 },
    /// Dedicated CDP context; the page is closed on release and Chrome
    /// reclaims the context.
    Context { context_id: Option<String> },
}

/// Scoped page acquisition: exactly one release on every exit path.
///
/// Explicit release is the normal path; `Drop` covers cancellation and
/// early error returns by finishing the cleanup on a spawned task.
pub struct PageLease {
    tab: Arc<Tab>,
    browser_index: usize,
    kind: Option<LeaseKind>,
    pool: Arc<BrowserPool>,
    tabs: Arc<TabPool>,
}

impl PageLease {
    pub fn tab(&self) -> Arc<Tab> {
        self.tab.clone()
    }

    pub fn browser_index(&self) -> usize {
        self.browser_index
    }

    /// Release the page and its browser. `healthy=false` retires the page
    /// and counts an error against the browser.
    pub async fn release(mut self, healthy: bool) {
        let Some(kind) = self.kind.take() else { return };
        match kind {
            LeaseKind::Pooled { tab_id } => {
                self.tabs.release(tab_id, healthy).await;
            }
            LeaseKind::Context { context_id } => {
                let tab = self.tab.clone();
                tokio::task::spawn_blocking(move || {
                    let _ = tab.close(false);
                });
                if let Some(id) = context_id {
                    debug!("closed context-mode page (context {id})");
                }
            }
        }
        self.pool.release(self.browser_index, healthy).await;
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        let Some(kind) = self.kind.take() else { return };
        // Dropped without an explicit release: a cancellation or an early
        // error unwound the capture. Finish the cleanup off-task; the page
        // state is unknown, so pooled tabs are closed rather than reset.
        let tab = self.tab.clone();
        let pool = self.pool.clone();
        let tabs = self.tabs.clone();
        let browser_index = self.browser_index;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                match kind {
                    LeaseKind::Pooled { tab_id } => tabs.release(tab_id, false).await,
                    LeaseKind::Context { .. } => {
                        tokio::task::spawn_blocking(move || {
                            let _ = tab.close(false);
                        });
                    }
                }
                pool.release(browser_index, true).await;
            });
        } else {
            warn!("page lease dropped outside a runtime; browser {browser_index} left to the watchdog");
        }
    }
}

/// Mode-dispatching page acquisition for the capture pipeline.
pub struct PageAcquirer {
    pool: Arc<BrowserPool>,
    tabs: Arc<TabPool>,
    config: TabConfig,
    timeouts: TimeoutConfig,
    retry: RetryConfig,
}

impl PageAcquirer {
    pub fn new(
        pool: Arc<BrowserPool>,
        tabs: Arc<TabPool>,
        config: TabConfig,
        timeouts: TimeoutConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            pool,
            tabs,
            config,
            timeouts,
            retry,
        }
    }

    pub fn pool(&self) -> &Arc<BrowserPool> {
        &self.pool
    }

    pub fn tabs(&self) -> &Arc<TabPool> {
        &self.tabs
    }

    /// Acquire a usable page bound to a browser. Tab-pool mode is preferred;
    /// on cap/timeout/failure the capture falls back to a dedicated context.
    /// Page-open failures retry on a different browser with jittered
    /// backoff, up to the configured attempt budget.
    pub async fn acquire_page(&self) -> Result<PageLease, CaptureError> {
        let mut last_error = String::new();
        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                tokio::time::sleep(jittered_delay(&self.retry, attempt - 1)).await;
            }
            let browser = self.pool.acquire().await?;

            if self.config.enable_tab_reuse {
                let tried = tokio::time::timeout(
                    self.config.tab_acquire_timeout,
                    self.tabs.acquire_for(&browser, self.timeouts.page_creation),
                )
                .await;
                match tried {
                    Ok(Ok((tab, tab_id))) => {
                        self.pool.note_page_opened(browser.index).await;
                        return Ok(PageLease {
                            tab,
                            browser_index: browser.index,
                            kind: Some(LeaseKind::Pooled { tab_id }),
                            pool: self.pool.clone(),
                            tabs: self.tabs.clone(),
                        });
                    }
                    Ok(Err(e)) => {
                        debug!("tab-pool acquisition failed, falling back to context mode: {e:#}")
                    }
                    Err(_) => debug!(
                        "tab-pool acquisition timed out after {:?}, falling back to context mode",
                        self.config.tab_acquire_timeout
                    ),
                }
            }

            match self.open_context_page(&browser).await {
                Ok((tab, context_id)) => {
                    self.pool.note_page_opened(browser.index).await;
                    return Ok(PageLease {
                        tab,
                        browser_index: browser.index,
                        kind: Some(LeaseKind::Context { context_id }),
                        pool: self.pool.clone(),
                        tabs: self.tabs.clone(),
                    });
                }
                Err(e) => {
                    warn!(
                        "failed to open page in browser {} (attempt {}/{}): {e:#}",
                        browser.index,
                        attempt + 1,
                        self.retry.max_retries + 1
                    );
                    last_error = format!("{e:#}");
                    self.pool.mark_error(browser.index, false).await;
                    self.pool.release(browser.index, false).await;
                }
            }
        }

        Err(CaptureError::acquire_failed(format!(
            "could not open a page after {} attempts: {last_error}",
            self.retry.max_retries + 1
        )))
    }

    /// Fresh isolated context with a single page. The context handle itself
    /// is not retained; Chrome reclaims the context once its tab closes.
    async fn open_context_page(
        &self,
        browser: &AcquiredBrowser,
    ) -> Result<(Arc<Tab>, Option<String>)> {
        let handle = browser.browser.clone();
        tokio::time::timeout(
            self.timeouts.context_creation,
            tokio::task::spawn_blocking(move || -> Result<(Arc<Tab>, Option<String>)> {
                match handle.new_context() {
                    Ok(context) => {
                        let context_id = context.get_id().to_string();
                        let tab = context
                            .new_tab()
                            .map_err(|e| anyhow::anyhow!("failed to open tab in context: {e}"))?;
                        Ok((tab, Some(context_id)))
                    }
                    Err(e) => {
                        // Context creation can fail on older builds; a shared
                        // tab still isolates per-capture state well enough
                        // for a single navigation.
                        warn!("isolated context creation failed ({e}), using shared tab");
                        let tab = handle
                            .new_tab()
                            .map_err(|e| anyhow::anyhow!("failed to open shared tab: {e}"))?;
                        Ok((tab, None))
                    }
                }
            }),
        )
        .await
        .map_err(|_| anyhow::anyhow!("context creation timed out"))?
        .map_err(|e| anyhow::anyhow!("context creation task panicked: {e}"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TabConfig {
        TabConfig {
            enable_tab_reuse: true,
            max_tabs_per_browser: 20,
            tab_idle_timeout: Duration::from_secs(300),
            tab_max_age: Duration::from_secs(1800),
            tab_cleanup_interval: Duration::from_secs(60),
            tab_acquire_timeout: Duration::from_secs(10),
            max_tab_uses: 50,
        }
    }

    #[test]
    fn expiry_covers_age_idle_and_uses() {
        let c = config();
        let now = Instant::now();
        assert!(!tab_expired(now, now, 1, &c));
        assert!(tab_expired(now - Duration::from_secs(1801), now, 1, &c));
        assert!(tab_expired(now, now - Duration::from_secs(301), 1, &c));
        assert!(tab_expired(now, now, 50, &c));
        assert!(!tab_expired(now, now, 49, &c));
    }

    #[tokio::test]
    async fn empty_pool_stats_are_zero() {
        let pool = TabPool::new(config());
        let stats = pool.stats().await;
        assert_eq!(stats.total_tabs, 0);
        assert_eq!(stats.busy_tabs, 0);
        assert_eq!(stats.browsers_with_tabs, 0);
    }

    #[tokio::test]
    async fn release_of_unknown_tab_is_a_no_op() {
        let pool = TabPool::new(config());
        pool.release(42, true).await;
        assert_eq!(pool.stats().await.total_tabs, 0);
    }

    #[tokio::test]
    async fn sweep_of_empty_pool_closes_nothing() {
        let pool = TabPool::new(config());
        assert_eq!(pool.sweep().await, 0);
    }

    #[test]
    fn jittered_delay_stays_near_the_exponential_curve() {
        let retry = RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(10_000),
            jitter: 0.1,
            max_fresh_retries: 3,
        };
        for attempt in 0..6 {
            let base = retry.delay_for_attempt(attempt);
            let spread = Duration::from_millis((base.as_millis() as f64 * 0.1) as u64);
            let d = jittered_delay(&retry, attempt);
            assert!(d >= base.saturating_sub(spread));
            assert!(d <= base + spread);
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let retry = RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(10_000),
            jitter: 0.0,
            max_fresh_retries: 3,
        };
        assert_eq!(jittered_delay(&retry, 1), Duration::from_millis(1000));
    }
}
