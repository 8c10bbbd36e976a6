//! # Shuttergrid
//!
//! Shuttergrid captures website screenshots at scale by orchestrating a
//! pool of headless Chrome processes against a high-concurrency request
//! stream: admission control with load shedding and a circuit breaker,
//! browser/tab pooling with watchdog-enforced liveness, resource and
//! result caching, and persistent batch jobs.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use shuttergrid::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // All tuning comes from the environment (BROWSER_POOL_MAX,
//!     // MAX_CONCURRENT_SCREENSHOTS, RESULT_CACHE_TTL, ...).
//!     let settings = Settings::from_env();
//!     run_server(settings).await
//! }
//! ```
//!
//! ## Architecture
//!
//! - **common**: configuration, the capture error taxonomy, the URL
//!   rewriter and shared request types
//! - **server**: the runtime: browser pool, tab pool, capture pipeline,
//!   request interception, admission control, caches, batch jobs,
//!   watchdog, health prober and the HTTP boundary

/// Re-export of shared types and configuration.
pub use shuttergrid_common as common;

/// Re-export of the capture runtime.
pub use shuttergrid_server as server;

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::common::{
        CaptureError, CaptureRequest, ErrorKind, ImageFormat, RewriteRule, Settings, UrlRewriter,
    };
    pub use crate::server::{
        run_server, AdmissionController, BatchJob, BatchJobConfig, BrowserPool, CapturePipeline,
        JobStore, MetricsCollector, PageAcquirer, ResourceCache, ResultCache, ScreenshotService,
        TabPool,
    };
}
