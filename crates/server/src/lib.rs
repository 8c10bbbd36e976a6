pub mod admission;
pub mod api;
pub mod batch;
pub mod browser_pool;
pub mod capture;
pub mod health;
pub mod interceptor;
pub mod jobs;
pub mod monitoring;
pub mod resource_cache;
pub mod result_cache;
pub mod service;
pub mod storage;
pub mod tab_pool;
pub mod watchdog;

pub use admission::{AdmissionController, AdmissionPermit};
pub use browser_pool::{BrowserPool, PoolStats};
pub use capture::CapturePipeline;
pub use jobs::{BatchJob, BatchJobConfig, JobItem, JobStore};
pub use monitoring::MetricsCollector;
pub use resource_cache::ResourceCache;
pub use result_cache::ResultCache;
pub use service::ScreenshotService;
pub use tab_pool::{PageAcquirer, PageLease, TabPool};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use shuttergrid_common::{Settings, UrlRewriter};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::AppState;
use crate::batch::BatchRunner;
use crate::health::HealthProber;
use crate::interceptor::{spawn_cache_warmer, InterceptStats};
use crate::storage::LocalArtifactStore;
use crate::watchdog::Watchdog;

const OUTBOUND_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Build every component, start the background tasks, and serve HTTP until
/// SIGINT/SIGTERM.
pub async fn run_server(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    let cancel = CancellationToken::new();

    let pool = browser_pool::BrowserPool::new(settings.pool.clone());
    pool.warm_up().await;
    let tabs = tab_pool::TabPool::new(settings.tabs.clone());

    let resource_cache = Arc::new(resource_cache::ResourceCache::new(
        settings.resource_cache.clone(),
    )?);
    let rewriter = Arc::new(UrlRewriter::new());
    let intercept_stats = Arc::new(InterceptStats::default());
    let http = reqwest::Client::builder()
        .user_agent(OUTBOUND_USER_AGENT)
        .build()?;
    let warmer = spawn_cache_warmer(resource_cache.clone(), http.clone(), cancel.clone());

    let acquirer = tab_pool::PageAcquirer::new(
        pool.clone(),
        tabs.clone(),
        settings.tabs.clone(),
        settings.timeouts.clone(),
        settings.retry.clone(),
    );
    let pipeline = Arc::new(capture::CapturePipeline::new(
        acquirer,
        rewriter.clone(),
        resource_cache.clone(),
        intercept_stats.clone(),
        warmer,
        settings.blocking,
        settings.timeouts.clone(),
        settings.retry.clone(),
        settings.artifacts.screenshot_dir.clone(),
        cancel.clone(),
    ));

    let admission = admission::AdmissionController::new(settings.admission.clone(), pool.clone());
    let result_cache = Arc::new(result_cache::ResultCache::new(settings.result_cache.clone()));
    let artifacts = Arc::new(LocalArtifactStore::new(settings.artifacts.clone())?);
    let metrics = Arc::new(monitoring::MetricsCollector::new());
    let service = Arc::new(service::ScreenshotService::new(
        admission,
        pipeline.clone(),
        result_cache.clone(),
        artifacts,
        metrics.clone(),
        settings.timeouts.request_deadline,
    ));

    let store = jobs::JobStore::new(settings.batch.clone())?;
    store.recover_from_disk().await;
    let batch = BatchRunner::new(
        store.clone(),
        service.clone(),
        metrics.clone(),
        http,
        cancel.clone(),
    );
    let prober = HealthProber::new(pipeline.clone(), settings.health.clone());

    spawn_background_tasks(
        &settings,
        &pool,
        &tabs,
        &resource_cache,
        &result_cache,
        &store,
        &service,
        &prober,
        &cancel,
    );

    let state = AppState {
        service,
        store,
        batch,
        resource_cache,
        rewriter,
        prober,
        intercept_stats,
        pool: pool.clone(),
        tabs: tabs.clone(),
        settings: settings.clone(),
        shutdown: cancel.clone(),
    };

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {addr}");

    axum::serve(
        listener,
        api::router(state).into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(cancel.clone()))
    .await?;

    info!("http server stopped, draining browsers");
    tabs.shutdown().await;
    pool.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn spawn_background_tasks(
    settings: &Arc<Settings>,
    pool: &Arc<browser_pool::BrowserPool>,
    tabs: &Arc<tab_pool::TabPool>,
    resource_cache: &Arc<resource_cache::ResourceCache>,
    result_cache: &Arc<result_cache::ResultCache>,
    store: &Arc<jobs::JobStore>,
    service: &Arc<service::ScreenshotService>,
    prober: &Arc<HealthProber>,
    cancel: &CancellationToken,
) {
    // Watchdog: stuck-browser enforcement plus tab sweeping.
    tokio::spawn(
        Watchdog::new(pool.clone(), tabs.clone(), settings.watchdog.clone())
            .run(cancel.clone()),
    );

    // Health prober.
    tokio::spawn(prober.clone().run(cancel.clone()));

    // Pool maintenance: idle/age recycling and floor top-up.
    {
        let pool = pool.clone();
        let cancel = cancel.clone();
        let interval = settings.pool.cleanup_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => pool.run_cleanup().await,
                }
            }
        });
    }

    // Tab sweeper, independent of the watchdog cadence.
    {
        let tabs = tabs.clone();
        let cancel = cancel.clone();
        let interval = settings.tabs.tab_cleanup_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        tabs.sweep().await;
                    }
                }
            }
        });
    }

    // Resource cache: TTL purge and size enforcement.
    {
        let cache = resource_cache.clone();
        let cancel = cancel.clone();
        let interval = settings.resource_cache.cleanup_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let cache = cache.clone();
                        let _ = tokio::task::spawn_blocking(move || cache.cleanup()).await;
                    }
                }
            }
        });
    }

    // Result cache TTL purge.
    {
        let cache = result_cache.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(300)) => {
                        cache.purge_expired();
                    }
                }
            }
        });
    }

    // Expired batch jobs.
    {
        let store = store.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(600)) => {
                        store.purge_expired().await;
                    }
                }
            }
        });
    }

    // Stale artifact files.
    {
        let artifacts = service.artifacts().clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {
                        let artifacts = artifacts.clone();
                        let _ = tokio::task::spawn_blocking(move || artifacts.sweep_stale()).await;
                    }
                }
            }
        });
    }
}

/// Resolve on SIGINT/SIGTERM, cancelling in-flight work so the graceful
/// drain can finish.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("received Ctrl+C"),
        _ = terminate => warn!("received SIGTERM"),
    }

    info!("cancelling in-flight operations");
    cancel.cancel();
}
