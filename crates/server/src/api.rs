//! HTTP boundary. Handlers stay thin: parse, delegate, map error kinds to
//! status codes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use shuttergrid_common::{
    CaptureError, CaptureRequest, ImageFormat, RewriteRule, Settings, UrlRewriter,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::batch::BatchRunner;
use crate::browser_pool::BrowserPool;
use crate::health::HealthProber;
use crate::interceptor::InterceptStats;
use crate::jobs::{BatchJobConfig, JobItem, JobStore, MAX_BATCH_PARALLEL};
use crate::resource_cache::ResourceCache;
use crate::service::ScreenshotService;
use crate::tab_pool::TabPool;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ScreenshotService>,
    pub store: Arc<JobStore>,
    pub batch: Arc<BatchRunner>,
    pub resource_cache: Arc<ResourceCache>,
    pub rewriter: Arc<UrlRewriter>,
    pub prober: Arc<HealthProber>,
    pub intercept_stats: Arc<InterceptStats>,
    pub pool: Arc<BrowserPool>,
    pub tabs: Arc<TabPool>,
    pub settings: Arc<Settings>,
    pub shutdown: CancellationToken,
}

/// Error-kind to status mapping at the boundary.
struct ApiError(CaptureError);

impl From<CaptureError> for ApiError {
    fn from(e: CaptureError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "kind": self.0.kind,
            "message": self.0.message,
        });
        if let Some(ms) = self.0.retry_after_ms {
            body["retry_after_ms"] = json!(ms);
        }
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/screenshot", post(take_screenshot))
        .route("/screenshots/{file}", get(serve_artifact))
        .route("/batch/screenshots", post(create_batch))
        .route("/batch/screenshots/{job_id}", get(batch_status))
        .route("/batch/screenshots/{job_id}/results", get(batch_results))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/metrics/ws", get(metrics_ws))
        .route("/cache/stats", get(result_cache_stats))
        .route("/cache", delete(result_cache_clear))
        .route("/cache/url", delete(result_cache_invalidate))
        .route("/browser-cache/stats", get(resource_cache_stats))
        .route("/browser-cache/info", get(resource_cache_info))
        .route("/browser-cache/performance", get(resource_cache_performance))
        .route("/browser-cache/test", get(resource_cache_test))
        .route("/browser-cache/cleanup", post(resource_cache_cleanup))
        .route("/browser-cache/clear", delete(resource_cache_clear))
        .route("/url-transformer/rules", get(rewrite_rules).post(rewrite_add_rule))
        .route("/url-transformer/rules/{host}", delete(rewrite_remove_rule))
        .route("/url-transformer/transform", post(rewrite_transform))
        .route("/url-transformer/check", get(rewrite_check))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            track_request,
        ))
        .with_state(state)
}

/// Access logging with proxy-aware client addresses.
async fn track_request(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client = client_ip(&state.settings.server, request.headers(), peer);
    let response = next.run(request).await;
    debug!(
        client = %client,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "{method} {path}"
    );
    response
}

/// The client address for logs: the peer socket, unless proxy headers are
/// trusted and the peer is one of the configured proxies.
fn client_ip(
    config: &shuttergrid_common::ServerConfig,
    headers: &axum::http::HeaderMap,
    peer: SocketAddr,
) -> String {
    if !config.trust_proxy_headers {
        return peer.ip().to_string();
    }
    let peer_ip = peer.ip().to_string();
    let peer_trusted =
        config.trusted_proxy_ips.is_empty() || config.trusted_proxy_ips.contains(&peer_ip);
    if !peer_trusted {
        return peer_ip;
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .unwrap_or(peer_ip)
}

#[derive(Debug, Deserialize)]
struct ScreenshotQuery {
    cache: Option<bool>,
}

async fn take_screenshot(
    State(state): State<AppState>,
    Query(query): Query<ScreenshotQuery>,
    Json(request): Json<CaptureRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let use_cache = query.cache.unwrap_or(true) && state.service.result_cache().enabled();
    let request_id = uuid::Uuid::new_v4().to_string();
    let outcome = state
        .service
        .screenshot(&request, use_cache, &request_id)
        .await?;
    Ok(Json(json!({ "url": outcome.url, "cached": outcome.cached })))
}

async fn serve_artifact(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Response {
    let Some(path) = state.service.artifacts().resolve(&file) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpeg") | Some("jpg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type)], bytes).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct BatchItemRequest {
    id: String,
    url: String,
    #[serde(default = "default_width")]
    width: u32,
    #[serde(default = "default_height")]
    height: u32,
    #[serde(default)]
    format: Option<ImageFormat>,
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

#[derive(Debug, Default, Deserialize)]
struct BatchConfigRequest {
    parallel: Option<usize>,
    timeout: Option<u64>,
    webhook: Option<String>,
    webhook_auth: Option<String>,
    fail_fast: Option<bool>,
    cache: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    items: Vec<BatchItemRequest>,
    #[serde(default)]
    config: Option<BatchConfigRequest>,
}

const MAX_BATCH_ITEMS: usize = 100;

async fn create_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if body.items.is_empty() {
        return Err(CaptureError::validation("batch has no items").into());
    }
    if body.items.len() > MAX_BATCH_ITEMS {
        return Err(CaptureError::validation(format!(
            "batch exceeds {MAX_BATCH_ITEMS} items"
        ))
        .into());
    }

    let config_req = body.config.unwrap_or_default();
    if let Some(parallel) = config_req.parallel {
        if !(1..=MAX_BATCH_PARALLEL).contains(&parallel) {
            return Err(CaptureError::validation(format!(
                "parallel must be in [1, {MAX_BATCH_PARALLEL}]"
            ))
            .into());
        }
    }
    if let Some(timeout) = config_req.timeout {
        if !(1..=60).contains(&timeout) {
            return Err(CaptureError::validation("timeout must be in [1, 60] seconds").into());
        }
    }

    let defaults = BatchJobConfig::default();
    let config = BatchJobConfig {
        parallel: config_req.parallel.unwrap_or(defaults.parallel),
        timeout_secs: config_req.timeout.unwrap_or(defaults.timeout_secs),
        webhook: config_req.webhook,
        webhook_auth: config_req.webhook_auth,
        fail_fast: config_req.fail_fast.unwrap_or(defaults.fail_fast),
        cache: config_req.cache.unwrap_or(defaults.cache),
    };

    let mut seen = std::collections::HashSet::new();
    let mut items = Vec::with_capacity(body.items.len());
    for item in body.items {
        if item.id.is_empty() {
            return Err(CaptureError::validation("item id must not be empty").into());
        }
        if !seen.insert(item.id.clone()) {
            return Err(CaptureError::validation(format!("duplicate item id {:?}", item.id)).into());
        }
        let format = item.format.unwrap_or(ImageFormat::Png);
        let request = CaptureRequest {
            url: item.url.clone(),
            width: item.width,
            height: item.height,
            format,
        };
        request
            .validate()
            .map_err(|e| CaptureError::validation(format!("item {:?}: {}", item.id, e.message)))?;
        items.push(JobItem::new(item.id, item.url, item.width, item.height, format));
    }

    let handle = state.store.create(items, config).await;
    state.batch.start(handle.clone()).await;
    let body = handle.lock().await.status_body();
    Ok((StatusCode::ACCEPTED, Json(body)))
}

async fn batch_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    match state.store.get(&job_id).await {
        Some(handle) => Json(handle.lock().await.status_body()).into_response(),
        None => not_found("unknown job"),
    }
}

async fn batch_results(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    match state.store.get(&job_id).await {
        Some(handle) => {
            let job = handle.lock().await;
            if job.status.is_terminal() {
                Json(job.results_body()).into_response()
            } else {
                (
                    StatusCode::CONFLICT,
                    Json(json!({
                        "kind": "not_terminal",
                        "message": "job is still processing",
                        "status": job.status,
                    })),
                )
                    .into_response()
            }
        }
        None => not_found("unknown job"),
    }
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "kind": "not_found", "message": message })),
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let probe = state.prober.snapshot();
    let pool = state.pool.stats().await;
    let admission = state.service.admission().stats();
    let status = if probe.healthy && admission.circuit_state == "closed" {
        "ok"
    } else {
        "degraded"
    };
    Json(json!({
        "status": status,
        "workers": state.settings.server.workers,
        "probe": probe,
        "browser_pool": pool,
        "tab_pool": state.tabs.stats().await,
        "admission": admission,
        "result_cache": state.service.result_cache().stats(),
        "resource_cache": state.resource_cache.stats(),
        "batch_jobs": state.store.job_count().await,
    }))
}

async fn metrics_body(state: &AppState) -> serde_json::Value {
    json!({
        "service": state.service.metrics().snapshot(),
        "browser_pool": state.pool.stats().await,
        "tab_pool": state.tabs.stats().await,
        "admission": state.service.admission().stats(),
        "result_cache": state.service.result_cache().stats(),
        "resource_cache": state.resource_cache.stats(),
        "interceptor": state.intercept_stats.snapshot(),
    })
}

async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(metrics_body(&state).await)
}

async fn metrics_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_metrics(socket, state))
}

/// Push metric snapshots at 1 Hz until the client goes away.
async fn stream_metrics(mut socket: WebSocket, state: AppState) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => continue,
                }
            }
            _ = ticker.tick() => {
                let body = metrics_body(&state).await.to_string();
                if socket.send(Message::Text(body.into())).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("metrics websocket closed");
}

async fn result_cache_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.service.result_cache().stats()))
}

async fn result_cache_clear(State(state): State<AppState>) -> Json<serde_json::Value> {
    let removed = state.service.result_cache().clear();
    Json(json!({ "removed": removed }))
}

async fn result_cache_invalidate(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let url = params
        .get("url")
        .ok_or_else(|| CaptureError::validation("missing url parameter"))?;
    let removed = state.service.result_cache().invalidate_by_url(url);
    Ok(Json(json!({ "removed": removed, "url": url })))
}

async fn resource_cache_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.resource_cache.stats()))
}

async fn resource_cache_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = state.resource_cache.config();
    Json(json!({
        "enabled": config.enabled,
        "all_content": config.all_content,
        "dir": config.dir,
        "max_total_bytes": config.max_total_bytes,
        "max_entry_bytes": config.max_entry_bytes,
        "ttl_secs": config.ttl.as_secs(),
        "cleanup_interval_secs": config.cleanup_interval.as_secs(),
    }))
}

async fn resource_cache_performance(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.resource_cache.stats();
    Json(json!({
        "hit_rate": stats.hit_rate,
        "hits": stats.hits,
        "misses": stats.misses,
        "served_from_cache": state.intercept_stats.snapshot().served_from_cache,
        "blocked": state.intercept_stats.snapshot().blocked,
        "total_bytes": stats.total_bytes,
    }))
}

async fn resource_cache_test(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cache = state.resource_cache.clone();
    let ok = tokio::task::spawn_blocking(move || cache.self_test())
        .await
        .unwrap_or(false);
    Json(json!({ "ok": ok }))
}

async fn resource_cache_cleanup(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cache = state.resource_cache.clone();
    let (expired, evicted) = tokio::task::spawn_blocking(move || cache.cleanup())
        .await
        .unwrap_or((0, 0));
    Json(json!({ "expired": expired, "evicted": evicted }))
}

async fn resource_cache_clear(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cache = state.resource_cache.clone();
    let removed = tokio::task::spawn_blocking(move || cache.clear())
        .await
        .unwrap_or(0);
    Json(json!({ "removed": removed }))
}

async fn rewrite_rules(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "rules": state.rewriter.rules() }))
}

#[derive(Debug, Deserialize)]
struct AddRuleRequest {
    source_host: String,
    target_host: String,
    #[serde(default = "default_scheme")]
    scheme: String,
}

fn default_scheme() -> String {
    "http".to_string()
}

async fn rewrite_add_rule(
    State(state): State<AppState>,
    Json(body): Json<AddRuleRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.source_host.is_empty() || body.target_host.is_empty() {
        return Err(CaptureError::validation("source_host and target_host are required").into());
    }
    if !matches!(body.scheme.as_str(), "http" | "https") {
        return Err(CaptureError::validation("scheme must be http or https").into());
    }
    state.rewriter.add_rule(
        &body.source_host,
        RewriteRule {
            target_host: body.target_host.clone(),
            scheme: body.scheme.clone(),
        },
    );
    Ok(Json(json!({
        "source_host": body.source_host.to_lowercase(),
        "target_host": body.target_host,
        "scheme": body.scheme,
    })))
}

async fn rewrite_remove_rule(
    State(state): State<AppState>,
    Path(host): Path<String>,
) -> Response {
    if state.rewriter.remove_rule(&host) {
        Json(json!({ "removed": host })).into_response()
    } else {
        not_found("no rule for that host")
    }
}

#[derive(Debug, Deserialize)]
struct TransformRequest {
    url: String,
}

async fn rewrite_transform(
    State(state): State<AppState>,
    Json(body): Json<TransformRequest>,
) -> Json<serde_json::Value> {
    let transformed = state.rewriter.rewrite(&body.url);
    Json(json!({
        "original": body.url,
        "transformed": transformed,
        "changed": transformed != body.url,
    }))
}

async fn rewrite_check(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let url = params
        .get("url")
        .ok_or_else(|| CaptureError::validation("missing url parameter"))?;
    Ok(Json(json!({
        "url": url,
        "transformable": state.rewriter.matches(url),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shuttergrid_common::ServerConfig;

    fn server_config(trust: bool, proxies: Vec<&str>) -> ServerConfig {
        ServerConfig {
            host: "0.0.0.0".into(),
            port: 8000,
            workers: 4,
            trust_proxy_headers: trust,
            trusted_proxy_ips: proxies.into_iter().map(String::from).collect(),
        }
    }

    fn headers_with_forwarded(value: &str) -> axum::http::HeaderMap {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-forwarded-for", value.parse().unwrap());
        headers
    }

    #[test]
    fn untrusted_peers_report_the_socket_address() {
        let peer: SocketAddr = "10.1.2.3:5000".parse().unwrap();
        let headers = headers_with_forwarded("203.0.113.9");
        assert_eq!(
            client_ip(&server_config(false, vec![]), &headers, peer),
            "10.1.2.3"
        );
    }

    #[test]
    fn trusted_proxy_forwards_the_original_client() {
        let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let headers = headers_with_forwarded("203.0.113.9, 10.0.0.1");
        assert_eq!(
            client_ip(&server_config(true, vec!["10.0.0.1"]), &headers, peer),
            "203.0.113.9"
        );
    }

    #[test]
    fn unknown_peer_is_not_believed_even_when_trusting() {
        let peer: SocketAddr = "192.0.2.7:5000".parse().unwrap();
        let headers = headers_with_forwarded("203.0.113.9");
        assert_eq!(
            client_ip(&server_config(true, vec!["10.0.0.1"]), &headers, peer),
            "192.0.2.7"
        );
    }

    #[test]
    fn missing_header_falls_back_to_the_peer() {
        let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let headers = axum::http::HeaderMap::new();
        assert_eq!(
            client_ip(&server_config(true, vec![]), &headers, peer),
            "10.0.0.1"
        );
    }
}
