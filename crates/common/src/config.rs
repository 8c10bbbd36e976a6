//! Runtime configuration, read from the environment once at startup.
//!
//! Every tuning parameter of the service lives here, grouped by subsystem.
//! Values are parsed leniently: a missing or unparsable variable falls back
//! to its default instead of aborting startup.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "t" | "yes"),
        Err(_) => default,
    }
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(key, default_secs))
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms))
}

/// HTTP server binding and worker hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Advisory worker count, surfaced in /health for parity with the
    /// process supervisor configuration.
    pub workers: usize,
    pub trust_proxy_headers: bool,
    pub trusted_proxy_ips: Vec<String>,
}

/// Browser pool sizing and lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub idle_timeout: Duration,
    pub max_age: Duration,
    pub cleanup_interval: Duration,
    /// Usage ratio at which acquisition preemptively spawns extra browsers.
    pub scale_threshold: f64,
    /// How many extra browsers a preemptive scale-up launches.
    pub scale_factor: usize,
    /// Bounded backoff attempts while waiting for a free browser.
    pub max_wait_attempts: u32,
    /// Pages a browser may open before it is recycled.
    pub max_pages_per_browser: u64,
    /// Consecutive errors after which a browser is considered unhealthy.
    pub health_error_threshold: u32,
    /// Unconditional restart horizon for long-lived browsers.
    pub force_restart_interval: Duration,
}

/// Tab pooling and the context-mode fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabConfig {
    /// When false, tab pooling is disabled entirely and every capture runs
    /// in a fresh browser context.
    pub enable_tab_reuse: bool,
    pub max_tabs_per_browser: usize,
    pub tab_idle_timeout: Duration,
    pub tab_max_age: Duration,
    pub tab_cleanup_interval: Duration,
    pub tab_acquire_timeout: Duration,
    /// Reuses per tab before it is retired.
    pub max_tab_uses: u64,
}

/// Deadlines for every external browser call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub navigation_regular: Duration,
    pub navigation_complex: Duration,
    pub screenshot: Duration,
    pub page_creation: Duration,
    pub context_creation: Duration,
    pub route_setup: Duration,
    pub settle: Duration,
    pub request_deadline: Duration,
}

/// Retry behavior for pool acquisition and fresh-browser escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter factor in [0, 1] applied to each computed delay.
    pub jitter: f64,
    /// Fresh-browser retries on target-closed failures per capture.
    pub max_fresh_retries: u32,
}

impl RetryConfig {
    /// Exponential backoff delay for the given attempt, jitter excluded.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .as_millis()
            .saturating_mul(1u128 << attempt.min(16));
        Duration::from_millis(exp.min(self.max_delay.as_millis()) as u64)
    }
}

/// Admission control: semaphores, queue, shedding, circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub max_concurrent_screenshots: usize,
    pub max_concurrent_contexts: usize,
    pub enable_request_queue: bool,
    pub max_queue_size: usize,
    pub queue_timeout: Duration,
    pub enable_load_shedding: bool,
    pub load_shedding_threshold: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_reset_time: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultCacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    pub max_items: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceCacheConfig {
    pub enabled: bool,
    /// All-content mode caches everything except volatile endpoints;
    /// selective mode caches only known static asset types.
    pub all_content: bool,
    pub max_total_bytes: u64,
    pub max_entry_bytes: u64,
    pub ttl: Duration,
    pub cleanup_interval: Duration,
    pub dir: PathBuf,
}

/// Hard-block switches for the request interceptor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlockConfig {
    pub disable_fonts: bool,
    pub disable_images: bool,
    pub disable_media: bool,
    pub disable_analytics: bool,
    pub disable_third_party_scripts: bool,
    pub disable_ads: bool,
    pub disable_social_widgets: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    pub persistence_enabled: bool,
    pub persistence_dir: PathBuf,
    pub job_ttl: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub interval: Duration,
    /// In-use browsers idle past this are force-released back to the pool.
    pub force_release_after: Duration,
    /// In-use browsers idle past this are torn down immediately.
    pub hard_stuck_after: Duration,
    pub emergency_cleanup_interval: Duration,
    /// Pool usage ratio that triggers an emergency cleanup pass.
    pub memory_cleanup_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// Scratch directory for in-flight captures.
    pub screenshot_dir: PathBuf,
    /// Directory published artifacts are moved into.
    pub artifact_dir: PathBuf,
    pub retention: Duration,
}

/// Full service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub tabs: TabConfig,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub admission: AdmissionConfig,
    pub result_cache: ResultCacheConfig,
    pub resource_cache: ResourceCacheConfig,
    pub blocking: BlockConfig,
    pub health: HealthConfig,
    pub batch: BatchSettings,
    pub watchdog: WatchdogConfig,
    pub artifacts: ArtifactConfig,
}

impl Settings {
    /// Read the whole configuration from the environment.
    pub fn from_env() -> Self {
        let screenshot_dir =
            PathBuf::from(env::var("SCREENSHOT_DIR").unwrap_or_else(|_| "/tmp/shuttergrid".into()));

        Self {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
                port: env_parse("PORT", 8000u16),
                workers: env_parse("WORKERS", 4usize),
                trust_proxy_headers: env_bool("TRUST_PROXY_HEADERS", false),
                trusted_proxy_ips: env::var("TRUSTED_PROXY_IPS")
                    .map(|v| {
                        v.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            pool: PoolConfig {
                min_size: env_parse("BROWSER_POOL_MIN", 2usize),
                max_size: env_parse("BROWSER_POOL_MAX", 10usize),
                idle_timeout: env_secs("BROWSER_POOL_IDLE_TIMEOUT", 300),
                max_age: env_secs("BROWSER_POOL_MAX_AGE", 3600),
                cleanup_interval: env_secs("BROWSER_POOL_CLEANUP_INTERVAL", 60),
                scale_threshold: env_parse("BROWSER_POOL_SCALE_THRESHOLD", 0.7f64),
                scale_factor: env_parse("BROWSER_POOL_SCALE_FACTOR", 2usize),
                max_wait_attempts: env_parse("MAX_WAIT_ATTEMPTS", 10u32),
                max_pages_per_browser: env_parse("BROWSER_POOL_MAX_PAGES", 1000u64),
                health_error_threshold: env_parse("BROWSER_POOL_HEALTH_THRESHOLD", 5u32),
                force_restart_interval: env_secs("FORCE_BROWSER_RESTART_INTERVAL", 6 * 3600),
            },
            tabs: TabConfig {
                enable_tab_reuse: env_bool("ENABLE_TAB_REUSE", true),
                max_tabs_per_browser: env_parse("MAX_TABS_PER_BROWSER", 20usize),
                tab_idle_timeout: env_secs("TAB_IDLE_TIMEOUT", 300),
                tab_max_age: env_secs("TAB_MAX_AGE", 1800),
                tab_cleanup_interval: env_secs("TAB_CLEANUP_INTERVAL", 60),
                tab_acquire_timeout: env_secs("TAB_ACQUIRE_TIMEOUT", 10),
                max_tab_uses: env_parse("MAX_TAB_USES", 50u64),
            },
            timeouts: TimeoutConfig {
                navigation_regular: env_millis("NAVIGATION_TIMEOUT_REGULAR", 20_000),
                navigation_complex: env_millis("NAVIGATION_TIMEOUT_COMPLEX", 45_000),
                screenshot: env_millis("SCREENSHOT_TIMEOUT", 20_000),
                page_creation: env_millis("PAGE_CREATION_TIMEOUT", 30_000),
                context_creation: env_millis("CONTEXT_CREATION_TIMEOUT", 30_000),
                route_setup: env_millis("ROUTE_SETUP_TIMEOUT", 5_000),
                settle: env_millis("SETTLE_TIMEOUT", 500),
                request_deadline: env_secs("REQUEST_DEADLINE", 90),
            },
            retry: RetryConfig {
                max_retries: env_parse("MAX_RETRIES_REGULAR", 3u32),
                base_delay: env_millis("RETRY_BASE_DELAY", 500),
                max_delay: env_millis("RETRY_MAX_DELAY", 10_000),
                jitter: env_parse("RETRY_JITTER", 0.1f64),
                max_fresh_retries: env_parse("MAX_FRESH_RETRIES", 3u32),
            },
            admission: AdmissionConfig {
                max_concurrent_screenshots: env_parse("MAX_CONCURRENT_SCREENSHOTS", 8usize),
                max_concurrent_contexts: env_parse("MAX_CONCURRENT_CONTEXTS", 16usize),
                enable_request_queue: env_bool("ENABLE_REQUEST_QUEUE", true),
                max_queue_size: env_parse("MAX_QUEUE_SIZE", 50usize),
                queue_timeout: env_secs("QUEUE_TIMEOUT", 30),
                enable_load_shedding: env_bool("ENABLE_LOAD_SHEDDING", true),
                load_shedding_threshold: env_parse("LOAD_SHEDDING_THRESHOLD", 0.85f64),
                circuit_breaker_threshold: env_parse("CIRCUIT_BREAKER_THRESHOLD", 5u32),
                circuit_breaker_reset_time: env_secs("CIRCUIT_BREAKER_RESET_TIME", 300),
            },
            result_cache: ResultCacheConfig {
                enabled: env_bool("RESULT_CACHE_ENABLED", true),
                ttl: env_secs("RESULT_CACHE_TTL", 3600),
                max_items: env_parse("RESULT_CACHE_MAX_ITEMS", 100usize),
            },
            resource_cache: ResourceCacheConfig {
                enabled: env_bool("RESOURCE_CACHE_ENABLED", true),
                all_content: env_bool("RESOURCE_CACHE_ALL_CONTENT", false),
                max_total_bytes: env_parse("RESOURCE_CACHE_MAX_TOTAL_BYTES", 500 * 1024 * 1024u64),
                max_entry_bytes: env_parse("RESOURCE_CACHE_MAX_ENTRY_BYTES", 10 * 1024 * 1024u64),
                ttl: env_secs("RESOURCE_CACHE_TTL", 24 * 3600),
                cleanup_interval: env_secs("RESOURCE_CACHE_CLEANUP_INTERVAL", 600),
                dir: env::var("RESOURCE_CACHE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| screenshot_dir.join("cache")),
            },
            blocking: BlockConfig {
                disable_fonts: env_bool("DISABLE_FONTS", false),
                disable_images: env_bool("DISABLE_IMAGES", false),
                disable_media: env_bool("DISABLE_MEDIA", true),
                disable_analytics: env_bool("DISABLE_ANALYTICS", true),
                disable_third_party_scripts: env_bool("DISABLE_THIRD_PARTY_SCRIPTS", false),
                disable_ads: env_bool("DISABLE_ADS", true),
                disable_social_widgets: env_bool("DISABLE_SOCIAL_WIDGETS", true),
            },
            health: HealthConfig {
                enabled: env_bool("HEALTH_CHECK_ENABLED", true),
                interval: env_secs("HEALTH_CHECK_INTERVAL", 300),
                url: env::var("HEALTH_CHECK_URL").unwrap_or_else(|_| "https://example.com".into()),
                timeout: env_secs("HEALTH_CHECK_TIMEOUT", 60),
            },
            batch: BatchSettings {
                persistence_enabled: env_bool("BATCH_JOB_PERSISTENCE_ENABLED", true),
                persistence_dir: env::var("BATCH_JOB_PERSISTENCE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("jobs")),
                job_ttl: env_secs("BATCH_JOB_TTL", 3600),
            },
            watchdog: WatchdogConfig {
                interval: env_secs("WATCHDOG_INTERVAL", 30),
                force_release_after: env_secs("WATCHDOG_FORCE_RELEASE_AFTER", 120),
                hard_stuck_after: env_secs("WATCHDOG_HARD_STUCK_AFTER", 300),
                emergency_cleanup_interval: env_secs("EMERGENCY_CLEANUP_INTERVAL", 600),
                memory_cleanup_threshold: env_parse("MEMORY_CLEANUP_THRESHOLD", 0.9f64),
            },
            artifacts: ArtifactConfig {
                artifact_dir: env::var("ARTIFACT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| screenshot_dir.join("artifacts")),
                retention: Duration::from_secs(
                    env_parse("TEMP_FILE_RETENTION_HOURS", 24u64).saturating_mul(3600),
                ),
                screenshot_dir,
            },
        }
    }

    /// Defaults without relying on ambient environment overrides being set.
    /// Used by tests.
    pub fn defaults() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let s = Settings::defaults();
        assert!(s.pool.min_size <= s.pool.max_size);
        assert!(s.admission.max_concurrent_contexts >= s.admission.max_concurrent_screenshots);
        assert!(s.admission.load_shedding_threshold > 0.0);
        assert!(s.admission.load_shedding_threshold <= 1.0);
        assert!(s.resource_cache.max_entry_bytes <= s.resource_cache.max_total_bytes);
    }

    #[test]
    fn retry_delay_is_bounded() {
        let retry = RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(10_000),
            jitter: 0.1,
            max_fresh_retries: 3,
        };
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(retry.delay_for_attempt(10), Duration::from_millis(10_000));
        // Absurd attempt counts must not overflow.
        assert_eq!(
            retry.delay_for_attempt(u32::MAX),
            Duration::from_millis(10_000)
        );
    }
}
