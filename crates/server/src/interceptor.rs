//! Per-page request interception: hard blocking, serve-from-cache, and
//! fetch-and-store for cacheable misses.
//!
//! The CDP Fetch domain pauses every sub-resource request and hands it to
//! `CaptureInterceptor::intercept` on the transport thread. The decision
//! order is block → cache hit → continue. Misses cannot await the browser's
//! own response body from that synchronous callback, so cacheable miss URLs
//! are queued to an async cache warmer that fetches each one once with the
//! shared HTTP client and offers the body to the resource cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use headless_chrome::browser::tab::{RequestInterceptor, RequestPausedDecision};
use headless_chrome::browser::transport::{SessionId, Transport};
use headless_chrome::protocol::cdp::Fetch::events::RequestPausedEvent;
use headless_chrome::protocol::cdp::Fetch::{FailRequest, FulfillRequest, HeaderEntry};
use headless_chrome::protocol::cdp::Network::ErrorReason;
use headless_chrome::Tab;
use serde::Serialize;
use shuttergrid_common::BlockConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::resource_cache::ResourceCache;

const ANALYTICS_HOSTS: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "stats.g.doubleclick.net",
    "segment.com",
    "segment.io",
    "mixpanel.com",
    "hotjar.com",
    "amplitude.com",
    "heap.io",
    "plausible.io",
    "matomo.cloud",
    "clarity.ms",
    "newrelic.com",
    "nr-data.net",
];

const AD_HOSTS: &[&str] = &[
    "doubleclick.net",
    "googlesyndication.com",
    "adservice.google.com",
    "adnxs.com",
    "taboola.com",
    "outbrain.com",
    "criteo.com",
    "amazon-adsystem.com",
    "adsafeprotected.com",
    "moatads.com",
];

const SOCIAL_WIDGET_HOSTS: &[&str] = &[
    "connect.facebook.net",
    "platform.twitter.com",
    "platform.linkedin.com",
    "assets.pinterest.com",
    "widgets.wp.com",
    "disqus.com",
    "addthis.com",
    "sharethis.com",
];

const FONT_EXTENSIONS: &[&str] = &[".woff", ".woff2", ".ttf", ".otf", ".eot"];
const MEDIA_EXTENSIONS: &[&str] = &[".mp3", ".mp4", ".ogg", ".webm", ".wav"];
const IMAGE_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".ico",
];

/// Sites whose rendering depends on their visual assets; fonts and images
/// stay loaded for these captures regardless of the block switches.
const VISUAL_SITE_HOSTS: &[&str] = &[
    "viding.co",
    "harisenin.com",
    "instagram.com",
    "snapchat.com",
    "tiktok.com",
];

/// Compiled hard-block rules for one capture.
#[derive(Debug, Clone)]
pub struct BlockRules {
    config: BlockConfig,
    /// Host of the page being captured; its own document is never blocked.
    first_party_host: Option<String>,
    /// Capturing a visual-content site: font and image blocking suspended.
    visual_site: bool,
}

impl BlockRules {
    pub fn new(config: BlockConfig, nav_url: &str) -> Self {
        let first_party_host = url::Url::parse(nav_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()));
        let visual_site = first_party_host
            .as_deref()
            .map(|h| Self::host_matches(h, VISUAL_SITE_HOSTS))
            .unwrap_or(false);
        Self {
            config,
            first_party_host,
            visual_site,
        }
    }

    fn host_matches(host: &str, patterns: &[&str]) -> bool {
        patterns
            .iter()
            .any(|p| host == *p || host.ends_with(&format!(".{p}")))
    }

    /// Whether a sub-resource request should be aborted.
    pub fn should_block(&self, url: &str) -> bool {
        let parsed = match url::Url::parse(url) {
            Ok(u) => u,
            Err(_) => return false,
        };
        let host = parsed.host_str().map(|h| h.to_lowercase()).unwrap_or_default();
        let path = parsed.path().to_lowercase();
        let first_party = self
            .first_party_host
            .as_deref()
            .map(|fp| host == fp || host.ends_with(&format!(".{fp}")))
            .unwrap_or(false);

        if self.config.disable_analytics && Self::host_matches(&host, ANALYTICS_HOSTS) {
            return true;
        }
        if self.config.disable_ads && Self::host_matches(&host, AD_HOSTS) {
            return true;
        }
        if self.config.disable_social_widgets && Self::host_matches(&host, SOCIAL_WIDGET_HOSTS) {
            return true;
        }
        if !self.visual_site {
            if self.config.disable_fonts && FONT_EXTENSIONS.iter().any(|e| path.ends_with(e)) {
                return true;
            }
            if self.config.disable_images
                && IMAGE_EXTENSIONS.iter().any(|e| path.ends_with(e))
            {
                return true;
            }
        }
        if self.config.disable_media && MEDIA_EXTENSIONS.iter().any(|e| path.ends_with(e)) {
            return true;
        }
        if self.config.disable_third_party_scripts && !first_party && path.ends_with(".js") {
            return true;
        }
        false
    }
}

/// Interception counters, shared across all captures.
#[derive(Default)]
pub struct InterceptStats {
    pub blocked: AtomicU64,
    pub served_from_cache: AtomicU64,
    pub passed_through: AtomicU64,
    pub warm_queued: AtomicU64,
    pub installs: AtomicU64,
    pub install_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterceptStatsSnapshot {
    pub blocked: u64,
    pub served_from_cache: u64,
    pub passed_through: u64,
    pub warm_queued: u64,
    pub installs: u64,
    pub install_failures: u64,
}

impl InterceptStats {
    pub fn snapshot(&self) -> InterceptStatsSnapshot {
        InterceptStatsSnapshot {
            blocked: self.blocked.load(Ordering::Relaxed),
            served_from_cache: self.served_from_cache.load(Ordering::Relaxed),
            passed_through: self.passed_through.load(Ordering::Relaxed),
            warm_queued: self.warm_queued.load(Ordering::Relaxed),
            installs: self.installs.load(Ordering::Relaxed),
            install_failures: self.install_failures.load(Ordering::Relaxed),
        }
    }
}

/// Route handler installed on a page before navigation.
pub struct CaptureInterceptor {
    rules: BlockRules,
    nav_url: String,
    cache: Arc<ResourceCache>,
    stats: Arc<InterceptStats>,
    warmer: mpsc::UnboundedSender<String>,
}

impl CaptureInterceptor {
    pub fn new(
        rules: BlockRules,
        nav_url: String,
        cache: Arc<ResourceCache>,
        stats: Arc<InterceptStats>,
        warmer: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            rules,
            nav_url,
            cache,
            stats,
            warmer,
        }
    }

    fn decide(&self, request_id: String, url: &str) -> RequestPausedDecision {
        // The top document always goes through: blocking it would abort the
        // capture itself.
        if url != self.nav_url {
            if self.rules.should_block(url) {
                self.stats.blocked.fetch_add(1, Ordering::Relaxed);
                return RequestPausedDecision::Fail(FailRequest {
                    request_id,
                    error_reason: ErrorReason::BlockedByClient,
                });
            }

            if let Some(hit) = self.cache.lookup(url) {
                self.stats.served_from_cache.fetch_add(1, Ordering::Relaxed);
                return RequestPausedDecision::Fulfill(FulfillRequest {
                    request_id,
                    response_code: hit.status as u32,
                    response_headers: Some(vec![HeaderEntry {
                        name: "Content-Type".to_string(),
                        value: hit.content_type,
                    }]),
                    binary_response_headers: None,
                    body: Some(BASE64.encode(&hit.body)),
                    response_phrase: None,
                });
            }

            if self.cache.enabled() && self.cache.is_cacheable(url) {
                if self.warmer.send(url.to_string()).is_ok() {
                    self.stats.warm_queued.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.stats.passed_through.fetch_add(1, Ordering::Relaxed);
        RequestPausedDecision::Continue(None)
    }
}

impl RequestInterceptor for CaptureInterceptor {
    fn intercept(
        &self,
        _transport: Arc<Transport>,
        _session_id: SessionId,
        event: RequestPausedEvent,
    ) -> RequestPausedDecision {
        let url = event.params.request.url.clone();
        self.decide(event.params.request_id, &url)
    }
}

/// Install interception on a page, bounded by `route_setup_timeout`.
///
/// Returns whether the interceptor is active; on timeout or failure the
/// capture proceeds without interception for this page only.
pub async fn install_interceptor(
    tab: &Arc<Tab>,
    interceptor: Arc<CaptureInterceptor>,
    route_setup_timeout: Duration,
) -> bool {
    let stats = interceptor.stats.clone();
    let tab = tab.clone();
    let outcome = tokio::time::timeout(
        route_setup_timeout,
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            tab.enable_fetch(None, None)
                .map_err(|e| anyhow::anyhow!("Fetch.enable failed: {e}"))?;
            tab.enable_request_interception(interceptor)
                .map_err(|e| anyhow::anyhow!("interceptor registration failed: {e}"))?;
            Ok(())
        }),
    )
    .await;

    match outcome {
        Ok(Ok(Ok(()))) => {
            stats.installs.fetch_add(1, Ordering::Relaxed);
            true
        }
        Ok(Ok(Err(e))) => {
            stats.install_failures.fetch_add(1, Ordering::Relaxed);
            warn!("interceptor install failed, continuing without: {e:#}");
            false
        }
        Ok(Err(e)) => {
            stats.install_failures.fetch_add(1, Ordering::Relaxed);
            warn!("interceptor install task panicked, continuing without: {e}");
            false
        }
        Err(_) => {
            stats.install_failures.fetch_add(1, Ordering::Relaxed);
            warn!("interceptor install timed out after {route_setup_timeout:?}, continuing without");
            false
        }
    }
}

/// Spawn the cache warmer: fetches cacheable miss URLs once and offers the
/// bodies to the resource cache.
pub fn spawn_cache_warmer(
    cache: Arc<ResourceCache>,
    client: reqwest::Client,
    cancel: CancellationToken,
) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        loop {
            let url = tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(url) => url,
                    None => break,
                },
            };

            // Another capture may have warmed it while the URL sat queued.
            let already = {
                let cache = cache.clone();
                let probe = url.clone();
                tokio::task::spawn_blocking(move || cache.lookup(&probe).is_some())
                    .await
                    .unwrap_or(false)
            };
            if already {
                continue;
            }

            let max_entry = cache.config().max_entry_bytes;
            match client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if !(200..300).contains(&status) {
                        continue;
                    }
                    if response
                        .content_length()
                        .map(|len| len > max_entry)
                        .unwrap_or(false)
                    {
                        continue;
                    }
                    let content_type = response
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("application/octet-stream")
                        .to_string();
                    match response.bytes().await {
                        Ok(body) => {
                            let cache = cache.clone();
                            let url2 = url.clone();
                            let _ = tokio::task::spawn_blocking(move || {
                                cache.store(&url2, &body, &content_type, status)
                            })
                            .await;
                            debug!("cache warmer stored {url}");
                        }
                        Err(e) => debug!("cache warmer body read failed for {url}: {e}"),
                    }
                }
                Err(e) => debug!("cache warmer fetch failed for {url}: {e}"),
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_on() -> BlockConfig {
        BlockConfig {
            disable_fonts: true,
            disable_images: true,
            disable_media: true,
            disable_analytics: true,
            disable_third_party_scripts: true,
            disable_ads: true,
            disable_social_widgets: true,
        }
    }

    fn all_off() -> BlockConfig {
        BlockConfig {
            disable_fonts: false,
            disable_images: false,
            disable_media: false,
            disable_analytics: false,
            disable_third_party_scripts: false,
            disable_ads: false,
            disable_social_widgets: false,
        }
    }

    #[test]
    fn blocks_analytics_and_ad_hosts() {
        let rules = BlockRules::new(all_on(), "https://example.com/page");
        assert!(rules.should_block("https://www.google-analytics.com/collect"));
        assert!(rules.should_block("https://static.doubleclick.net/ad.js"));
        assert!(rules.should_block("https://connect.facebook.net/sdk.js"));
    }

    #[test]
    fn blocks_fonts_images_and_media_when_configured() {
        let rules = BlockRules::new(all_on(), "https://example.com/page");
        assert!(rules.should_block("https://example.com/font.woff2"));
        assert!(rules.should_block("https://example.com/hero.jpg"));
        assert!(rules.should_block("https://example.com/intro.mp4"));

        let lenient = BlockRules::new(all_off(), "https://example.com/page");
        assert!(!lenient.should_block("https://example.com/font.woff2"));
        assert!(!lenient.should_block("https://example.com/hero.jpg"));
        assert!(!lenient.should_block("https://example.com/intro.mp4"));
    }

    #[test]
    fn visual_sites_keep_fonts_and_images_despite_the_switches() {
        let rules = BlockRules::new(all_on(), "https://www.viding.co/mini-rsvp/1240");
        assert!(!rules.should_block("https://fonts.gstatic.com/s/roboto.woff2"));
        assert!(!rules.should_block("https://cdn.viding.co/banner.png"));
        // Audio and video stay blocked even on visual sites.
        assert!(rules.should_block("https://cdn.viding.co/promo.mp4"));
        // And so do trackers.
        assert!(rules.should_block("https://www.google-analytics.com/collect"));
    }

    #[test]
    fn visual_site_exemption_is_per_captured_page_not_per_resource() {
        // An instagram embed on a regular page does not lift the blocks.
        let rules = BlockRules::new(all_on(), "https://example.com/page");
        assert!(rules.should_block("https://instagram.com/static/font.woff2"));
    }

    #[test]
    fn third_party_scripts_spare_the_first_party() {
        let rules = BlockRules::new(all_on(), "https://example.com/page");
        assert!(!rules.should_block("https://example.com/app.js"));
        assert!(!rules.should_block("https://static.example.com/app.js"));
        assert!(rules.should_block("https://thirdparty.io/lib.js"));
    }

    #[test]
    fn plain_subresources_pass() {
        let rules = BlockRules::new(all_on(), "https://example.com/page");
        assert!(!rules.should_block("https://example.com/styles.css"));
        assert!(!rules.should_block("https://cdn.jsdelivr.net/pkg/style.css"));
    }

    #[test]
    fn host_match_requires_domain_boundary() {
        let rules = BlockRules::new(all_on(), "https://example.com/page");
        // Not actually the analytics domain.
        assert!(!rules.should_block("https://notgoogle-analytics.com.evil.example/x.css"));
    }
}
