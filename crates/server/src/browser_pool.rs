//! Fixed-capacity pool of headless Chrome processes.
//!
//! Records are keyed by a stable monotonically-increasing index; idle
//! browsers wait in a FIFO free list. One mutex guards the bookkeeping and
//! is never held across a sleep or a browser launch: acquisition is a
//! lock / check / unlock / backoff loop, and Chrome is launched on the
//! blocking thread pool with only a `launching` slot reserved under the
//! lock.
//!
//! Releasing a browser always succeeds and never depends on recycling: the
//! record goes back to the free list first, and an unhealthy browser is
//! recycled by a separately spawned task.

use std::collections::{HashMap, VecDeque};
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use headless_chrome::{Browser, LaunchOptions};
use rand::Rng;
use serde::Serialize;
use shuttergrid_common::{CaptureError, PoolConfig};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Launch arguments tuned for throwaway rendering processes.
const CHROME_ARGS: &[&str] = &[
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--disable-setuid-sandbox",
    "--no-sandbox",
    "--no-zygote",
    "--disable-extensions",
    "--disable-features=site-per-process",
    "--disable-notifications",
    "--disable-popup-blocking",
    "--disable-sync",
    "--disable-translate",
    "--disable-background-networking",
    "--disable-default-apps",
    "--disable-prompt-on-repost",
    "--disable-domain-reliability",
    "--metrics-recording-only",
    "--mute-audio",
    "--no-first-run",
];

/// Backoff while waiting for a free browser: base 50 ms, doubling, 2 s cap.
const ACQUIRE_BACKOFF_BASE: Duration = Duration::from_millis(50);
const ACQUIRE_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Prevent the WebSocket from closing under long-lived but quiet browsers.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(3600);

/// Where a freshly launched browser goes: straight to the caller, or onto
/// the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchPurpose {
    Acquire,
    Idle,
}

/// Bookkeeping for one browser process.
struct BrowserMeta {
    created_at: Instant,
    last_used: Instant,
    in_use: bool,
    pages_opened: u64,
    error_count: u32,
    connected: bool,
}

impl BrowserMeta {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            last_used: now,
            in_use: false,
            pages_opened: 0,
            error_count: 0,
            connected: true,
        }
    }
}

struct PoolInner {
    meta: HashMap<usize, BrowserMeta>,
    handles: HashMap<usize, Arc<Browser>>,
    available: VecDeque<usize>,
    /// Launches in flight, reserved against `max_size`.
    launching: usize,
}

/// A checked-out browser. The holder owns exclusive page access until it
/// calls `release` on the pool.
pub struct AcquiredBrowser {
    pub index: usize,
    pub browser: Arc<Browser>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub in_use: usize,
    pub available: usize,
    pub launching: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub utilization: f64,
    pub errors: u64,
    pub created_total: u64,
    pub recycled_total: u64,
    pub reused_total: u64,
    pub force_released_total: u64,
    pub peak_usage: usize,
}

pub struct BrowserPool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    next_index: AtomicUsize,
    created_total: AtomicU64,
    recycled_total: AtomicU64,
    reused_total: AtomicU64,
    error_total: AtomicU64,
    force_released_total: AtomicU64,
    peak_usage: AtomicUsize,
}

impl BrowserPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(PoolInner {
                meta: HashMap::new(),
                handles: HashMap::new(),
                available: VecDeque::new(),
                launching: 0,
            }),
            next_index: AtomicUsize::new(0),
            created_total: AtomicU64::new(0),
            recycled_total: AtomicU64::new(0),
            reused_total: AtomicU64::new(0),
            error_total: AtomicU64::new(0),
            force_released_total: AtomicU64::new(0),
            peak_usage: AtomicUsize::new(0),
        })
    }

    /// Spawn the minimum number of browsers up front.
    pub async fn warm_up(self: &Arc<Self>) {
        for _ in 0..self.config.min_size {
            if let Err(e) = self.launch_one(LaunchPurpose::Idle).await {
                warn!("browser warm-up launch failed: {e:#}");
            }
        }
        let size = self.inner.lock().await.meta.len();
        info!("browser pool warmed up with {size} instances");
    }

    fn backoff_delay(attempt: u32, jitter: f64) -> Duration {
        let exp = ACQUIRE_BACKOFF_BASE
            .as_millis()
            .saturating_mul(1u128 << attempt.min(8)) as u64;
        let capped = exp.min(ACQUIRE_BACKOFF_CAP.as_millis() as u64);
        let spread = (capped as f64 * jitter).round() as i64;
        let offset = if spread > 0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0
        };
        Duration::from_millis((capped as i64 + offset).max(1) as u64)
    }

    /// Launch one Chrome process. The record enters the pool atomically in
    /// its final state: checked out to the caller, or idle on the free
    /// list, never idle-but-unlisted.
    async fn launch_one(self: &Arc<Self>, purpose: LaunchPurpose) -> Result<usize> {
        {
            let mut inner = self.inner.lock().await;
            if inner.meta.len() + inner.launching >= self.config.max_size {
                anyhow::bail!("browser pool at capacity");
            }
            inner.launching += 1;
        }

        let launched = tokio::task::spawn_blocking(|| -> Result<Browser> {
            let args: Vec<&OsStr> = CHROME_ARGS.iter().map(OsStr::new).collect();
            let options = LaunchOptions::default_builder()
                .headless(true)
                .sandbox(false)
                .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
                .args(args)
                .build()
                .map_err(|e| anyhow::anyhow!("failed to build launch options: {e}"))?;
            Browser::new(options).context("failed to launch browser process")
        })
        .await
        .context("browser launch task panicked")?;

        let mut inner = self.inner.lock().await;
        inner.launching -= 1;
        match launched {
            Ok(browser) => {
                let index = self.next_index.fetch_add(1, Ordering::SeqCst);
                let mut meta = BrowserMeta::new();
                match purpose {
                    LaunchPurpose::Acquire => meta.in_use = true,
                    LaunchPurpose::Idle => inner.available.push_back(index),
                }
                inner.meta.insert(index, meta);
                inner.handles.insert(index, Arc::new(browser));
                self.created_total.fetch_add(1, Ordering::Relaxed);
                info!(
                    "launched browser {index} ({}/{} in pool)",
                    inner.meta.len(),
                    self.config.max_size
                );
                Ok(index)
            }
            Err(e) => {
                self.error_total.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Take an idle browser off the free list. Must run under the lock.
    fn checkout_available(&self, inner: &mut PoolInner) -> Option<usize> {
        while let Some(index) = inner.available.pop_front() {
            match inner.meta.get_mut(&index) {
                Some(meta) => {
                    meta.in_use = true;
                    meta.last_used = Instant::now();
                    self.reused_total.fetch_add(1, Ordering::Relaxed);
                    let in_use = inner.meta.values().filter(|m| m.in_use).count();
                    self.peak_usage.fetch_max(in_use, Ordering::Relaxed);
                    return Some(index);
                }
                // Index was recycled while queued; skip the stale entry.
                None => continue,
            }
        }
        None
    }

    /// Acquire an idle browser, scaling up when none is free and the pool is
    /// under capacity. Waits with bounded jittered backoff otherwise.
    pub async fn acquire(self: &Arc<Self>) -> Result<AcquiredBrowser, CaptureError> {
        for attempt in 0..=self.config.max_wait_attempts {
            let (checked_out, can_grow) = {
                let mut inner = self.inner.lock().await;
                let index = self.checkout_available(&mut inner);
                let can_grow = inner.meta.len() + inner.launching < self.config.max_size;
                match index {
                    Some(index) => {
                        let browser = inner
                            .handles
                            .get(&index)
                            .cloned()
                            .ok_or_else(|| {
                                CaptureError::internal(format!(
                                    "browser {index} has no driver handle"
                                ))
                            })?;
                        (Some(AcquiredBrowser { index, browser }), can_grow)
                    }
                    None => (None, can_grow),
                }
            };

            if let Some(acquired) = checked_out {
                debug!("acquired browser {} (reused)", acquired.index);
                self.maybe_scale_up();
                return Ok(acquired);
            }

            if can_grow {
                match self.launch_one(LaunchPurpose::Acquire).await {
                    Ok(index) => {
                        let inner = self.inner.lock().await;
                        let in_use = inner.meta.values().filter(|m| m.in_use).count();
                        self.peak_usage.fetch_max(in_use, Ordering::Relaxed);
                        let browser = inner.handles.get(&index).cloned().ok_or_else(|| {
                            CaptureError::internal(format!("browser {index} has no driver handle"))
                        })?;
                        debug!("acquired browser {index} (fresh launch)");
                        return Ok(AcquiredBrowser { index, browser });
                    }
                    Err(e) => {
                        warn!("browser launch failed during acquire: {e:#}");
                        // Fall through to the backoff sleep and retry.
                    }
                }
            }

            if attempt < self.config.max_wait_attempts {
                let delay = Self::backoff_delay(attempt, 0.2);
                debug!(
                    "browser pool exhausted, waiting {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    self.config.max_wait_attempts
                );
                tokio::time::sleep(delay).await;
            }
        }

        self.error_total.fetch_add(1, Ordering::Relaxed);
        Err(CaptureError::acquire_failed(format!(
            "no browser became available within {} wait attempts",
            self.config.max_wait_attempts
        )))
    }

    /// Launch extra browsers ahead of demand once utilization crosses the
    /// scale threshold.
    fn maybe_scale_up(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let want = {
                let inner = pool.inner.lock().await;
                let in_use = inner.meta.values().filter(|m| m.in_use).count();
                let utilization = in_use as f64 / pool.config.max_size.max(1) as f64;
                if utilization < pool.config.scale_threshold {
                    0
                } else {
                    pool.config
                        .scale_factor
                        .min(pool.config.max_size.saturating_sub(inner.meta.len() + inner.launching))
                }
            };
            for _ in 0..want {
                match pool.launch_one(LaunchPurpose::Idle).await {
                    Ok(index) => debug!("preemptively scaled up with browser {index}"),
                    Err(e) => {
                        warn!("preemptive scale-up launch failed: {e:#}");
                        break;
                    }
                }
            }
        });
    }

    /// Return a browser to the pool. Always succeeds: the record is marked
    /// idle and listed as available before any health considerations; when
    /// the health check fails, recycling is scheduled asynchronously.
    pub async fn release(self: &Arc<Self>, index: usize, healthy: bool) {
        let needs_recycle = {
            let mut inner = self.inner.lock().await;
            let Some(meta) = inner.meta.get_mut(&index) else {
                // Already recycled (watchdog or shutdown); nothing to return.
                return;
            };
            meta.in_use = false;
            meta.last_used = Instant::now();
            if !healthy {
                meta.error_count += 1;
                self.error_total.fetch_add(1, Ordering::Relaxed);
            }
            let unhealthy = !self.meta_is_healthy(meta);
            if !inner.available.contains(&index) {
                inner.available.push_back(index);
            }
            unhealthy
        };

        if needs_recycle {
            debug!("browser {index} released unhealthy, scheduling recycle");
            self.schedule_recycle(index);
        }
    }

    fn meta_is_healthy(&self, meta: &BrowserMeta) -> bool {
        meta.connected
            && meta.error_count < self.config.health_error_threshold
            && meta.pages_opened < self.config.max_pages_per_browser
            && meta.created_at.elapsed() < self.config.max_age
    }

    /// Record a driver failure against a browser. Target-closed failures
    /// also mark the process as disconnected.
    pub async fn mark_error(&self, index: usize, target_closed: bool) {
        let mut inner = self.inner.lock().await;
        if let Some(meta) = inner.meta.get_mut(&index) {
            meta.error_count += 1;
            if target_closed {
                meta.connected = false;
            }
        }
        self.error_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a page open against the browser's age budget.
    pub async fn note_page_opened(&self, index: usize) {
        let mut inner = self.inner.lock().await;
        if let Some(meta) = inner.meta.get_mut(&index) {
            meta.pages_opened += 1;
        }
    }

    pub fn schedule_recycle(self: &Arc<Self>, index: usize) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.recycle(index).await;
        });
    }

    /// Tear down one browser. Skips records that are currently checked out
    /// (they will fail their next call and come back unhealthy).
    pub async fn recycle(self: &Arc<Self>, index: usize) {
        let handle = {
            let mut inner = self.inner.lock().await;
            match inner.meta.get(&index) {
                Some(meta) if meta.in_use => {
                    debug!("recycle of browser {index} skipped, currently in use");
                    return;
                }
                Some(_) => {}
                None => return,
            }
            inner.meta.remove(&index);
            inner.available.retain(|i| *i != index);
            inner.handles.remove(&index)
        };

        self.recycled_total.fetch_add(1, Ordering::Relaxed);
        if let Some(browser) = handle {
            // Dropping the last Arc kills the Chrome process; do it off the
            // async threads.
            tokio::task::spawn_blocking(move || drop(browser));
        }
        info!("recycled browser {index}");
    }

    /// Force-recycle regardless of the in-use flag. Watchdog only.
    async fn recycle_forced(self: &Arc<Self>, index: usize) {
        let handle = {
            let mut inner = self.inner.lock().await;
            inner.meta.remove(&index);
            inner.available.retain(|i| *i != index);
            inner.handles.remove(&index)
        };
        self.recycled_total.fetch_add(1, Ordering::Relaxed);
        if let Some(browser) = handle {
            tokio::task::spawn_blocking(move || drop(browser));
        }
        warn!("force-recycled stuck browser {index}");
    }

    /// Watchdog pass: force-release browsers stuck in-use past
    /// `force_release_after`, force-recycle those past `hard_stuck_after`.
    /// Returns (force_released, force_recycled) counts.
    pub async fn watchdog_pass(
        self: &Arc<Self>,
        force_release_after: Duration,
        hard_stuck_after: Duration,
    ) -> (usize, usize) {
        let (to_release, to_kill) = {
            let mut inner = self.inner.lock().await;
            let mut to_release = Vec::new();
            let mut to_kill = Vec::new();
            for (index, meta) in inner.meta.iter() {
                if !meta.in_use {
                    continue;
                }
                let stuck_for = meta.last_used.elapsed();
                if stuck_for >= hard_stuck_after {
                    to_kill.push(*index);
                } else if stuck_for >= force_release_after {
                    to_release.push(*index);
                }
            }
            for index in &to_release {
                if let Some(meta) = inner.meta.get_mut(index) {
                    meta.in_use = false;
                    meta.connected = false;
                }
                if !inner.available.contains(index) {
                    inner.available.push_back(*index);
                }
                self.force_released_total.fetch_add(1, Ordering::Relaxed);
            }
            (to_release, to_kill)
        };

        for index in &to_release {
            warn!("watchdog force-released stuck browser {index}");
            self.schedule_recycle(*index);
        }
        for index in &to_kill {
            self.recycle_forced(*index).await;
        }
        (to_release.len(), to_kill.len())
    }

    /// Periodic maintenance: recycle idle browsers above the minimum, retire
    /// overage browsers, and top the pool back up to `min_size`.
    pub async fn run_cleanup(self: &Arc<Self>) {
        let candidates = {
            let inner = self.inner.lock().await;
            let size = inner.meta.len();
            let mut victims = Vec::new();
            for (index, meta) in inner.meta.iter() {
                if meta.in_use {
                    continue;
                }
                let idle = meta.last_used.elapsed();
                let age = meta.created_at.elapsed();
                let over_min = size - victims.len() > self.config.min_size;
                if age >= self.config.force_restart_interval
                    || age >= self.config.max_age
                    || (over_min && idle >= self.config.idle_timeout)
                {
                    victims.push(*index);
                }
            }
            victims
        };

        for index in candidates {
            self.recycle(index).await;
        }

        // Top back up to the floor.
        loop {
            {
                let inner = self.inner.lock().await;
                if inner.meta.len() + inner.launching >= self.config.min_size {
                    break;
                }
            }
            if let Err(e) = self.launch_one(LaunchPurpose::Idle).await {
                warn!("pool floor top-up launch failed: {e:#}");
                break;
            }
        }
    }

    /// Current in-use ratio against the configured capacity.
    pub async fn utilization(&self) -> f64 {
        let inner = self.inner.lock().await;
        let in_use = inner.meta.values().filter(|m| m.in_use).count();
        in_use as f64 / self.config.max_size.max(1) as f64
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        let in_use = inner.meta.values().filter(|m| m.in_use).count();
        PoolStats {
            size: inner.meta.len(),
            in_use,
            available: inner.available.len(),
            launching: inner.launching,
            min_size: self.config.min_size,
            max_size: self.config.max_size,
            utilization: in_use as f64 / self.config.max_size.max(1) as f64,
            errors: self.error_total.load(Ordering::Relaxed),
            created_total: self.created_total.load(Ordering::Relaxed),
            recycled_total: self.recycled_total.load(Ordering::Relaxed),
            reused_total: self.reused_total.load(Ordering::Relaxed),
            force_released_total: self.force_released_total.load(Ordering::Relaxed),
            peak_usage: self.peak_usage.load(Ordering::Relaxed),
        }
    }

    /// Drop every browser. Shutdown path.
    pub async fn shutdown(&self) {
        let handles = {
            let mut inner = self.inner.lock().await;
            inner.meta.clear();
            inner.available.clear();
            std::mem::take(&mut inner.handles)
        };
        let count = handles.len();
        tokio::task::spawn_blocking(move || drop(handles));
        info!("browser pool shut down ({count} browsers dropped)");
    }
}

#[cfg(test)]
impl BrowserPool {
    /// Insert a bookkeeping-only record with no driver handle. Lets the
    /// lifecycle logic be exercised without launching Chrome.
    pub(crate) async fn insert_stub(self: &Arc<Self>, in_use: bool, last_used_ago: Duration) -> usize {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().await;
        let mut meta = BrowserMeta::new();
        meta.in_use = in_use;
        meta.last_used = Instant::now() - last_used_ago;
        inner.meta.insert(index, meta);
        if !in_use {
            inner.available.push_back(index);
        }
        index
    }

    /// The pool bookkeeping invariant: idle means listed exactly once, and
    /// the pool never exceeds its cap.
    pub(crate) async fn assert_invariants(&self) {
        let inner = self.inner.lock().await;
        assert!(inner.meta.len() <= self.config.max_size);
        for (index, meta) in inner.meta.iter() {
            let listed = inner.available.iter().filter(|i| *i == index).count();
            if meta.in_use {
                assert_eq!(listed, 0, "in-use browser {index} is on the free list");
            } else {
                assert_eq!(listed, 1, "idle browser {index} listed {listed} times");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PoolConfig {
        PoolConfig {
            min_size: 0,
            max_size: 4,
            idle_timeout: Duration::from_secs(300),
            max_age: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(60),
            scale_threshold: 0.7,
            scale_factor: 2,
            max_wait_attempts: 3,
            max_pages_per_browser: 1000,
            health_error_threshold: 5,
            force_restart_interval: Duration::from_secs(6 * 3600),
        }
    }

    #[tokio::test]
    async fn release_always_returns_to_free_list() {
        let pool = BrowserPool::new(test_config());
        let index = pool.insert_stub(true, Duration::ZERO).await;

        // Unhealthy release still makes the browser available immediately;
        // the recycle (scheduled separately) must not gate it.
        pool.release(index, false).await;
        {
            let inner = pool.inner.lock().await;
            if inner.meta.contains_key(&index) {
                assert!(inner.available.contains(&index));
                assert!(!inner.meta[&index].in_use);
            }
        }
    }

    #[tokio::test]
    async fn release_of_unknown_index_is_a_no_op() {
        let pool = BrowserPool::new(test_config());
        pool.release(999, true).await;
        pool.assert_invariants().await;
    }

    #[tokio::test]
    async fn double_release_does_not_duplicate_free_list_entries() {
        let pool = BrowserPool::new(test_config());
        let index = pool.insert_stub(true, Duration::ZERO).await;
        pool.release(index, true).await;
        pool.release(index, true).await;
        pool.assert_invariants().await;
    }

    #[tokio::test]
    async fn checkout_skips_stale_free_list_entries() {
        let pool = BrowserPool::new(test_config());
        let a = pool.insert_stub(false, Duration::ZERO).await;
        let b = pool.insert_stub(false, Duration::ZERO).await;
        // Simulate a recycle that removed the record but left the index
        // queued (the checkout path must tolerate it).
        {
            let mut inner = pool.inner.lock().await;
            inner.meta.remove(&a);
        }
        let mut inner = pool.inner.lock().await;
        assert_eq!(pool.checkout_available(&mut inner), Some(b));
        assert_eq!(pool.checkout_available(&mut inner), None);
    }

    #[tokio::test]
    async fn watchdog_release_and_kill_honor_thresholds() {
        let pool = BrowserPool::new(test_config());
        let fresh = pool.insert_stub(true, Duration::from_secs(10)).await;
        let stuck = pool.insert_stub(true, Duration::from_secs(150)).await;
        let dead = pool.insert_stub(true, Duration::from_secs(400)).await;

        let (released, killed) = pool
            .watchdog_pass(Duration::from_secs(120), Duration::from_secs(300))
            .await;
        assert_eq!(released, 1);
        assert_eq!(killed, 1);

        let inner = pool.inner.lock().await;
        assert!(inner.meta[&fresh].in_use, "fresh browser must be untouched");
        assert!(!inner.meta.contains_key(&dead), "hard-stuck browser removed");
        // The force-released one is idle and available again (until its
        // scheduled recycle runs).
        if let Some(meta) = inner.meta.get(&stuck) {
            assert!(!meta.in_use);
            assert!(inner.available.contains(&stuck));
        }
    }

    #[tokio::test]
    async fn watchdog_does_not_fire_before_thresholds() {
        let pool = BrowserPool::new(test_config());
        pool.insert_stub(true, Duration::from_secs(119)).await;
        let (released, killed) = pool
            .watchdog_pass(Duration::from_secs(120), Duration::from_secs(300))
            .await;
        assert_eq!((released, killed), (0, 0));
    }

    #[tokio::test]
    async fn utilization_counts_in_use_over_capacity() {
        let pool = BrowserPool::new(test_config());
        pool.insert_stub(true, Duration::ZERO).await;
        pool.insert_stub(true, Duration::ZERO).await;
        pool.insert_stub(false, Duration::ZERO).await;
        assert!((pool.utilization().await - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stats_reflect_bookkeeping() {
        let pool = BrowserPool::new(test_config());
        pool.insert_stub(true, Duration::ZERO).await;
        pool.insert_stub(false, Duration::ZERO).await;
        let stats = pool.stats().await;
        assert_eq!(stats.size, 2);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.max_size, 4);
    }

    #[tokio::test]
    async fn mark_error_disconnects_on_target_closed() {
        let pool = BrowserPool::new(test_config());
        let index = pool.insert_stub(true, Duration::ZERO).await;
        pool.mark_error(index, true).await;
        let inner = pool.inner.lock().await;
        assert!(!inner.meta[&index].connected);
        assert_eq!(inner.meta[&index].error_count, 1);
    }

    #[test]
    fn backoff_is_bounded_and_positive() {
        for attempt in 0..20 {
            let d = BrowserPool::backoff_delay(attempt, 0.2);
            assert!(d >= Duration::from_millis(1));
            assert!(d <= Duration::from_millis(2401));
        }
    }
}
