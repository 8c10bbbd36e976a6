//! Liveness enforcement for the browser and tab pools.
//!
//! Browsers stuck in-use past `force_release_after` are returned to the
//! pool and recycled; past `hard_stuck_after` the process is torn down
//! immediately. Each pass also sweeps idle/aged tabs and, under memory
//! pressure, runs an emergency pool cleanup.

use std::sync::Arc;
use std::time::Instant;

use shuttergrid_common::WatchdogConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::browser_pool::BrowserPool;
use crate::tab_pool::TabPool;

pub struct Watchdog {
    pool: Arc<BrowserPool>,
    tabs: Arc<TabPool>,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(pool: Arc<BrowserPool>, tabs: Arc<TabPool>, config: WatchdogConfig) -> Self {
        Self { pool, tabs, config }
    }

    /// Run until shutdown. One pass every `interval`.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "watchdog started (interval {:?}, force-release {:?}, hard-stuck {:?})",
            self.config.interval, self.config.force_release_after, self.config.hard_stuck_after
        );
        let mut last_emergency = Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            let (force_released, force_recycled) = self
                .pool
                .watchdog_pass(self.config.force_release_after, self.config.hard_stuck_after)
                .await;
            if force_released > 0 || force_recycled > 0 {
                warn!(
                    "watchdog force-released {force_released} and force-recycled {force_recycled} browsers"
                );
            }

            let swept = self.tabs.sweep().await;
            if swept > 0 {
                debug!("watchdog swept {swept} tabs");
            }

            if last_emergency.elapsed() >= self.config.emergency_cleanup_interval {
                last_emergency = Instant::now();
                let utilization = self.pool.utilization().await;
                if utilization >= self.config.memory_cleanup_threshold {
                    warn!(
                        "emergency cleanup at {:.0}% pool utilization",
                        utilization * 100.0
                    );
                    self.pool.run_cleanup().await;
                }
            }
        }
        info!("watchdog stopped");
    }
}
