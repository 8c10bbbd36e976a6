//! Admission control in front of the capture pipeline: circuit breaker,
//! load shedding, optional FIFO queueing, and the two global semaphores.
//!
//! Acquisition order is screenshot-first then context-first, always;
//! permits are owned and drop in the reverse order, including on
//! cancellation, so a request abandoned at any point leaves both counts
//! unchanged.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use shuttergrid_common::{AdmissionConfig, CaptureError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::browser_pool::BrowserPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    probe_in_flight: bool,
    trips: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    pub in_flight_screenshots: usize,
    pub in_flight_contexts: usize,
    pub max_concurrent_screenshots: usize,
    pub max_concurrent_contexts: usize,
    pub queue_length: usize,
    pub queue_enabled: bool,
    pub max_queue_size: usize,
    pub load_shedding_enabled: bool,
    pub load_shedding_threshold: f64,
    pub circuit_state: String,
    pub consecutive_failures: u32,
    pub circuit_trips: u64,
    pub circuit_open_remaining_ms: Option<u64>,
    pub admitted_total: u64,
    pub rejected_total: u64,
}

pub struct AdmissionController {
    config: AdmissionConfig,
    pool: Arc<BrowserPool>,
    screenshot_sem: Arc<Semaphore>,
    context_sem: Arc<Semaphore>,
    queue_len: AtomicUsize,
    breaker: Mutex<BreakerState>,
    admitted_total: AtomicU64,
    rejected_total: AtomicU64,
}

/// Both semaphore slots for one admitted request. Dropping the permit (on
/// any path, including cancellation) releases context before screenshot.
pub struct AdmissionPermit {
    // Field order is drop order: context permit first, the reverse of
    // acquisition.
    _context: OwnedSemaphorePermit,
    _screenshot: OwnedSemaphorePermit,
    is_probe: bool,
    outcome_recorded: bool,
    controller: Arc<AdmissionController>,
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("is_probe", &self.is_probe)
            .field("outcome_recorded", &self.outcome_recorded)
            .finish()
    }
}

impl AdmissionPermit {
    /// Record the capture outcome and release both slots.
    pub fn record_outcome(mut self, success: bool) {
        self.outcome_recorded = true;
        self.controller.record(self.is_probe, success);
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if !self.outcome_recorded && self.is_probe {
            // Cancelled mid-probe: let the next request probe instead.
            self.controller.clear_probe();
        }
    }
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, pool: Arc<BrowserPool>) -> Arc<Self> {
        Arc::new(Self {
            screenshot_sem: Arc::new(Semaphore::new(config.max_concurrent_screenshots)),
            context_sem: Arc::new(Semaphore::new(config.max_concurrent_contexts)),
            queue_len: AtomicUsize::new(0),
            breaker: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                open_until: None,
                probe_in_flight: false,
                trips: 0,
            }),
            admitted_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
            config,
            pool,
        })
    }

    fn breaker_lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.breaker.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn clear_probe(&self) {
        let mut b = self.breaker_lock();
        b.probe_in_flight = false;
    }

    /// Gate one request. Rejections carry their own error kinds; a returned
    /// permit means both semaphores are held.
    pub async fn admit(self: &Arc<Self>) -> Result<AdmissionPermit, CaptureError> {
        // 1. Circuit breaker.
        let is_probe = {
            let mut b = self.breaker_lock();
            match b.state {
                CircuitState::Open => {
                    let until = b.open_until.unwrap_or_else(Instant::now);
                    if Instant::now() >= until {
                        debug!("circuit breaker half-open, admitting a probe");
                        b.state = CircuitState::HalfOpen;
                        b.probe_in_flight = true;
                        true
                    } else {
                        let remaining = until.saturating_duration_since(Instant::now());
                        self.rejected_total.fetch_add(1, Ordering::Relaxed);
                        return Err(CaptureError::circuit_open(
                            "upstream captures are consistently failing",
                        )
                        .with_retry_after(remaining.as_millis() as u64));
                    }
                }
                CircuitState::HalfOpen => {
                    if b.probe_in_flight {
                        self.rejected_total.fetch_add(1, Ordering::Relaxed);
                        return Err(CaptureError::circuit_open(
                            "circuit half-open, probe already in flight",
                        )
                        .with_retry_after(self.config.circuit_breaker_reset_time.as_millis() as u64));
                    }
                    b.probe_in_flight = true;
                    true
                }
                CircuitState::Closed => false,
            }
        };

        // 2. Load shedding: reject outright, never queue.
        if self.config.enable_load_shedding {
            let utilization = self.pool.utilization().await;
            if utilization >= self.config.load_shedding_threshold {
                if is_probe {
                    self.clear_probe();
                }
                self.rejected_total.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "load shedding at {:.0}% pool utilization",
                    utilization * 100.0
                );
                return Err(CaptureError::overloaded(format!(
                    "pool utilization {utilization:.2} at or above shedding threshold {:.2}",
                    self.config.load_shedding_threshold
                )));
            }
        }

        // 3 & 4. Screenshot slot, queueing when contended, then context
        // slot. The tokio semaphore queues waiters fairly, which gives the
        // FIFO dequeue order.
        let screenshot = match self.screenshot_sem.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                if !self.config.enable_request_queue {
                    if is_probe {
                        self.clear_probe();
                    }
                    self.rejected_total.fetch_add(1, Ordering::Relaxed);
                    return Err(CaptureError::overloaded(
                        "at concurrency limit and queueing is disabled",
                    ));
                }
                let queued = self.queue_len.fetch_add(1, Ordering::SeqCst);
                if queued >= self.config.max_queue_size {
                    self.queue_len.fetch_sub(1, Ordering::SeqCst);
                    if is_probe {
                        self.clear_probe();
                    }
                    self.rejected_total.fetch_add(1, Ordering::Relaxed);
                    return Err(CaptureError::overloaded(format!(
                        "admission queue full ({} waiting)",
                        self.config.max_queue_size
                    )));
                }
                let waited = tokio::time::timeout(
                    self.config.queue_timeout,
                    self.screenshot_sem.clone().acquire_owned(),
                )
                .await;
                self.queue_len.fetch_sub(1, Ordering::SeqCst);
                match waited {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        if is_probe {
                            self.clear_probe();
                        }
                        return Err(CaptureError::internal("admission semaphore closed"));
                    }
                    Err(_) => {
                        if is_probe {
                            self.clear_probe();
                        }
                        self.rejected_total.fetch_add(1, Ordering::Relaxed);
                        return Err(CaptureError::queue_timeout(format!(
                            "queued longer than {:?}",
                            self.config.queue_timeout
                        )));
                    }
                }
            }
        };

        let context = match self.context_sem.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                if is_probe {
                    self.clear_probe();
                }
                return Err(CaptureError::internal("context semaphore closed"));
            }
        };

        self.admitted_total.fetch_add(1, Ordering::Relaxed);
        Ok(AdmissionPermit {
            _context: context,
            _screenshot: screenshot,
            is_probe,
            outcome_recorded: false,
            controller: Arc::clone(self),
        })
    }

    fn record(&self, was_probe: bool, success: bool) {
        let mut b = self.breaker_lock();
        if success {
            b.consecutive_failures = 0;
            if was_probe || b.state != CircuitState::Closed {
                if b.state != CircuitState::Closed {
                    info!("circuit breaker closed after successful probe");
                }
                b.state = CircuitState::Closed;
                b.open_until = None;
            }
            b.probe_in_flight = false;
        } else {
            b.consecutive_failures = b.consecutive_failures.saturating_add(1);
            let reopen = was_probe
                || b.state == CircuitState::HalfOpen
                || (b.state == CircuitState::Closed
                    && b.consecutive_failures >= self.config.circuit_breaker_threshold);
            if reopen {
                if b.state == CircuitState::Closed {
                    b.trips += 1;
                    warn!(
                        "circuit breaker opened after {} consecutive failures",
                        b.consecutive_failures
                    );
                } else {
                    warn!("circuit breaker re-opened after failed probe");
                }
                b.state = CircuitState::Open;
                b.open_until = Some(Instant::now() + self.config.circuit_breaker_reset_time);
            }
            b.probe_in_flight = false;
        }
    }

    pub fn stats(&self) -> AdmissionStats {
        let b = self.breaker_lock();
        AdmissionStats {
            in_flight_screenshots: self
                .config
                .max_concurrent_screenshots
                .saturating_sub(self.screenshot_sem.available_permits()),
            in_flight_contexts: self
                .config
                .max_concurrent_contexts
                .saturating_sub(self.context_sem.available_permits()),
            max_concurrent_screenshots: self.config.max_concurrent_screenshots,
            max_concurrent_contexts: self.config.max_concurrent_contexts,
            queue_length: self.queue_len.load(Ordering::SeqCst),
            queue_enabled: self.config.enable_request_queue,
            max_queue_size: self.config.max_queue_size,
            load_shedding_enabled: self.config.enable_load_shedding,
            load_shedding_threshold: self.config.load_shedding_threshold,
            circuit_state: b.state.as_str().to_string(),
            consecutive_failures: b.consecutive_failures,
            circuit_trips: b.trips,
            circuit_open_remaining_ms: b.open_until.and_then(|until| {
                let now = Instant::now();
                (until > now).then(|| until.saturating_duration_since(now).as_millis() as u64)
            }),
            admitted_total: self.admitted_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shuttergrid_common::{ErrorKind, PoolConfig};
    use std::time::Duration;

    fn pool_config(max_size: usize) -> PoolConfig {
        PoolConfig {
            min_size: 0,
            max_size,
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

    fn admission_config() -> AdmissionConfig {
        AdmissionConfig {
            max_concurrent_screenshots: 2,
            max_concurrent_contexts: 4,
            enable_request_queue: true,
            max_queue_size: 2,
            queue_timeout: Duration::from_millis(100),
            enable_load_shedding: true,
            load_shedding_threshold: 0.5,
            circuit_breaker_threshold: 3,
            circuit_breaker_reset_time: Duration::from_secs(60),
        }
    }

    fn controller(config: AdmissionConfig, pool_max: usize) -> Arc<AdmissionController> {
        AdmissionController::new(config, BrowserPool::new(pool_config(pool_max)))
    }

    #[tokio::test]
    async fn sheds_load_at_exactly_the_threshold() {
        let ctl = controller(admission_config(), 4);
        // 2 of 4 browsers in use: utilization exactly 0.5.
        ctl.pool.insert_stub(true, Duration::ZERO).await;
        ctl.pool.insert_stub(true, Duration::ZERO).await;

        let err = ctl.admit().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Overloaded);
    }

    #[tokio::test]
    async fn admits_below_the_threshold() {
        let ctl = controller(admission_config(), 4);
        ctl.pool.insert_stub(true, Duration::ZERO).await;

        let permit = ctl.admit().await.unwrap();
        permit.record_outcome(true);
    }

    #[tokio::test]
    async fn queue_full_rejects_without_waiting() {
        let mut config = admission_config();
        config.max_concurrent_screenshots = 1;
        config.max_queue_size = 0;
        config.enable_load_shedding = false;
        let ctl = controller(config, 4);

        let held = ctl.admit().await.unwrap();
        let started = Instant::now();
        let err = ctl.admit().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Overloaded);
        assert!(started.elapsed() < Duration::from_millis(50));
        held.record_outcome(true);
    }

    #[tokio::test]
    async fn queued_request_times_out_with_its_own_kind() {
        let mut config = admission_config();
        config.max_concurrent_screenshots = 1;
        config.queue_timeout = Duration::from_millis(50);
        config.enable_load_shedding = false;
        let ctl = controller(config, 4);

        let held = ctl.admit().await.unwrap();
        let err = ctl.admit().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::QueueTimeout);
        held.record_outcome(true);
    }

    #[tokio::test]
    async fn queued_request_proceeds_when_a_slot_frees() {
        let mut config = admission_config();
        config.max_concurrent_screenshots = 1;
        config.queue_timeout = Duration::from_secs(5);
        config.enable_load_shedding = false;
        let ctl = controller(config, 4);

        let held = ctl.admit().await.unwrap();
        let ctl2 = ctl.clone();
        let waiter = tokio::spawn(async move { ctl2.admit().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        held.record_outcome(true);
        let permit = waiter.await.unwrap().unwrap();
        permit.record_outcome(true);
    }

    #[tokio::test]
    async fn circuit_opens_at_exactly_the_threshold() {
        let mut config = admission_config();
        config.enable_load_shedding = false;
        let ctl = controller(config, 4);

        for _ in 0..2 {
            ctl.admit().await.unwrap().record_outcome(false);
        }
        // Two consecutive failures: still closed.
        ctl.admit().await.unwrap().record_outcome(false);
        // Third failure crossed the threshold: open.
        let err = ctl.admit().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert!(err.retry_after_ms.is_some());
    }

    #[tokio::test]
    async fn success_resets_the_failure_streak() {
        let mut config = admission_config();
        config.enable_load_shedding = false;
        let ctl = controller(config, 4);

        ctl.admit().await.unwrap().record_outcome(false);
        ctl.admit().await.unwrap().record_outcome(false);
        ctl.admit().await.unwrap().record_outcome(true);
        ctl.admit().await.unwrap().record_outcome(false);
        // Streak restarted; circuit still closed.
        assert!(ctl.admit().await.is_ok());
    }

    #[tokio::test]
    async fn half_open_admits_a_single_probe() {
        let mut config = admission_config();
        config.enable_load_shedding = false;
        config.circuit_breaker_reset_time = Duration::from_millis(0);
        let ctl = controller(config, 4);

        for _ in 0..3 {
            ctl.admit().await.unwrap().record_outcome(false);
        }
        // Reset time elapsed immediately: next admit is the half-open probe.
        let probe = ctl.admit().await.unwrap();
        // A second request while the probe is in flight is rejected.
        let err = ctl.admit().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        // Probe success closes the circuit for everyone.
        probe.record_outcome(true);
        assert!(ctl.admit().await.is_ok());
        assert_eq!(ctl.stats().circuit_state, "closed");
    }

    #[tokio::test]
    async fn failed_probe_reopens_the_circuit() {
        let mut config = admission_config();
        config.enable_load_shedding = false;
        config.circuit_breaker_reset_time = Duration::from_millis(0);
        let ctl = controller(config, 4);

        for _ in 0..3 {
            ctl.admit().await.unwrap().record_outcome(false);
        }
        let probe = ctl.admit().await.unwrap();
        probe.record_outcome(false);
        // Re-opened, but reset time is zero so the next admit probes again.
        let probe = ctl.admit().await.unwrap();
        probe.record_outcome(true);
        assert_eq!(ctl.stats().circuit_state, "closed");
    }

    #[tokio::test]
    async fn abandoned_permit_restores_both_semaphores() {
        let mut config = admission_config();
        config.enable_load_shedding = false;
        let ctl = controller(config.clone(), 4);

        let before = ctl.stats();
        assert_eq!(before.in_flight_screenshots, 0);
        {
            let _permit = ctl.admit().await.unwrap();
            assert_eq!(ctl.stats().in_flight_screenshots, 1);
            assert_eq!(ctl.stats().in_flight_contexts, 1);
            // Dropped without record_outcome: a cancelled request.
        }
        let after = ctl.stats();
        assert_eq!(after.in_flight_screenshots, 0);
        assert_eq!(after.in_flight_contexts, 0);
    }
}
