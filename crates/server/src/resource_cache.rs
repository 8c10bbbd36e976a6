//! Content-addressed on-disk cache for fetched sub-resources.
//!
//! Bodies live as `cache/{fingerprint}` files; the index is in-memory for
//! the lifetime of the process (bodies left behind by a previous run are
//! unreadable without it and get swept at startup). Readers share an RwLock
//! over the index; store/evict/purge serialize on the write side.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use serde::Serialize;
use shuttergrid_common::{resource_fingerprint, ResourceCacheConfig};
use tracing::{debug, info, warn};

/// Extensions cached in selective mode.
const CACHEABLE_EXTENSIONS: &[&str] = &[
    ".css", ".js", ".mjs", ".woff", ".woff2", ".ttf", ".otf", ".eot", ".png", ".jpg", ".jpeg",
    ".gif", ".webp", ".svg", ".ico", ".mp4", ".webm", ".ogg", ".mp3", ".wav",
];

/// CDN hosts cached in selective mode regardless of extension.
const PRIORITY_CDN_HOSTS: &[&str] = &[
    "cdnjs.cloudflare.com",
    "cdn.jsdelivr.net",
    "unpkg.com",
    "fonts.googleapis.com",
    "fonts.gstatic.com",
    "ajax.googleapis.com",
    "code.jquery.com",
    "stackpath.bootstrapcdn.com",
    "maxcdn.bootstrapcdn.com",
    "use.fontawesome.com",
];

/// Path fragments excluded in all-content mode.
const EXCLUDED_PATH_FRAGMENTS: &[&str] = &[
    "/api/",
    "/graphql",
    "/webhook",
    "/callback",
    "/auth/",
    "/login",
    "/logout",
    "/session",
    "/ws/",
    "/websocket",
    "/sse/",
    "/stream",
    "/analytics",
    "/track",
    "/pixel",
    "/beacon",
    "/admin/",
    "/manage/",
    "/dashboard",
];

/// Query keys that mark a URL as volatile in all-content mode.
const VOLATILE_QUERY_KEYS: &[&str] = &[
    "timestamp", "time", "rand", "random", "nonce", "token", "session",
];

struct CacheEntry {
    path: PathBuf,
    size: u64,
    content_type: String,
    status: u16,
    created: Instant,
    /// Milliseconds since the cache epoch, bumped on every hit.
    last_access_ms: AtomicU64,
}

/// A body served from cache.
#[derive(Debug, Clone)]
pub struct CachedResource {
    pub body: Vec<u8>,
    pub content_type: String,
    pub status: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    ReplacedExisting,
    RejectedTooLarge,
    RejectedPolicy,
    Disabled,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceCacheStats {
    pub enabled: bool,
    pub all_content: bool,
    pub entries: usize,
    pub total_bytes: u64,
    pub max_total_bytes: u64,
    pub max_entry_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub errors: u64,
    pub cleanup_runs: u64,
    pub hit_rate: f64,
}

pub struct ResourceCache {
    config: ResourceCacheConfig,
    epoch: Instant,
    index: RwLock<HashMap<String, CacheEntry>>,
    total_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    errors: AtomicU64,
    cleanup_runs: AtomicU64,
}

impl ResourceCache {
    pub fn new(config: ResourceCacheConfig) -> anyhow::Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let cache = Self {
            config,
            epoch: Instant::now(),
            index: RwLock::new(HashMap::new()),
            total_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            cleanup_runs: AtomicU64::new(0),
        };
        cache.sweep_orphans();
        Ok(cache)
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Remove body files with no index entry. The index starts empty, so at
    /// startup this clears anything a previous run left behind.
    fn sweep_orphans(&self) {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        let known: std::collections::HashSet<PathBuf> =
            index.values().map(|e| e.path.clone()).collect();
        drop(index);

        let entries = match fs::read_dir(&self.config.dir) {
            Ok(e) => e,
            Err(err) => {
                warn!("resource cache orphan sweep failed: {err}");
                return;
            }
        };
        let mut removed = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && !known.contains(&path) {
                if fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!("resource cache removed {removed} orphaned body files");
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn body_path(&self, fingerprint: &str) -> PathBuf {
        self.config.dir.join(fingerprint)
    }

    /// Whether this URL is cacheable under the configured policy.
    pub fn is_cacheable(&self, url: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        let parsed = match url::Url::parse(url) {
            Ok(u) => u,
            Err(_) => return false,
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return false;
        }
        let path = parsed.path().to_lowercase();

        if self.config.all_content {
            if EXCLUDED_PATH_FRAGMENTS.iter().any(|f| path.contains(f)) {
                return false;
            }
            let volatile = parsed.query_pairs().any(|(k, _)| {
                let k = k.to_lowercase();
                VOLATILE_QUERY_KEYS.iter().any(|v| k == *v)
            });
            !volatile
        } else {
            let host = parsed.host_str().map(|h| h.to_lowercase()).unwrap_or_default();
            if PRIORITY_CDN_HOSTS.iter().any(|h| host == *h) {
                return true;
            }
            CACHEABLE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
        }
    }

    /// Fetch a body by original URL. Updates last-access on hit.
    pub fn lookup(&self, url: &str) -> Option<CachedResource> {
        if !self.config.enabled {
            return None;
        }
        let fingerprint = resource_fingerprint(url);

        let (path, content_type, status, expired) = {
            let index = self.index.read().unwrap_or_else(|e| e.into_inner());
            let entry = match index.get(&fingerprint) {
                Some(e) => e,
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            };
            let expired = entry.created.elapsed() > self.config.ttl;
            if !expired {
                entry.last_access_ms.store(self.now_ms(), Ordering::Relaxed);
            }
            (
                entry.path.clone(),
                entry.content_type.clone(),
                entry.status,
                expired,
            )
        };

        if expired {
            self.remove_entry(&fingerprint);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match fs::read(&path) {
            Ok(body) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("resource cache hit: {url}");
                Some(CachedResource {
                    body,
                    content_type,
                    status,
                })
            }
            Err(err) => {
                // Body file vanished under us; drop the dangling entry.
                warn!("resource cache body read failed for {url}: {err}");
                self.remove_entry(&fingerprint);
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Offer a fetched body to the cache.
    pub fn store(
        &self,
        url: &str,
        body: &[u8],
        content_type: &str,
        status: u16,
    ) -> StoreOutcome {
        if !self.config.enabled {
            return StoreOutcome::Disabled;
        }
        if body.len() as u64 > self.config.max_entry_bytes {
            return StoreOutcome::RejectedTooLarge;
        }
        if !self.is_cacheable(url) {
            return StoreOutcome::RejectedPolicy;
        }

        let fingerprint = resource_fingerprint(url);
        let path = self.body_path(&fingerprint);
        let tmp = self.config.dir.join(format!(".tmp-{fingerprint}"));
        if let Err(err) = fs::write(&tmp, body).and_then(|_| fs::rename(&tmp, &path)) {
            warn!("resource cache store failed for {url}: {err}");
            let _ = fs::remove_file(&tmp);
            self.errors.fetch_add(1, Ordering::Relaxed);
            return StoreOutcome::Failed;
        }

        let size = body.len() as u64;
        let replaced = {
            let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
            let old = index.insert(
                fingerprint,
                CacheEntry {
                    path,
                    size,
                    content_type: content_type.to_string(),
                    status,
                    created: Instant::now(),
                    last_access_ms: AtomicU64::new(self.now_ms()),
                },
            );
            let was_replaced = old.is_some();
            if let Some(old) = old {
                self.total_bytes.fetch_sub(old.size, Ordering::Relaxed);
            }
            self.total_bytes.fetch_add(size, Ordering::Relaxed);
            was_replaced
        };

        self.stores.fetch_add(1, Ordering::Relaxed);
        self.evict_to_fit();
        debug!("resource cached: {url} ({size} bytes)");
        if replaced {
            StoreOutcome::ReplacedExisting
        } else {
            StoreOutcome::Stored
        }
    }

    fn remove_entry(&self, fingerprint: &str) {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = index.remove(fingerprint) {
            self.total_bytes.fetch_sub(entry.size, Ordering::Relaxed);
            let _ = fs::remove_file(&entry.path);
        }
    }

    /// Evict least-recently-accessed entries until the size budget holds.
    pub fn evict_to_fit(&self) -> usize {
        let mut evicted = 0usize;
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        while self.total_bytes.load(Ordering::Relaxed) > self.config.max_total_bytes {
            let victim = index
                .iter()
                .min_by_key(|(_, e)| e.last_access_ms.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else { break };
            if let Some(entry) = index.remove(&victim) {
                self.total_bytes.fetch_sub(entry.size, Ordering::Relaxed);
                let _ = fs::remove_file(&entry.path);
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            info!("resource cache evicted {evicted} entries to fit size budget");
        }
        evicted
    }

    /// Remove entries older than the TTL.
    pub fn purge_expired(&self) -> usize {
        let expired: Vec<String> = {
            let index = self.index.read().unwrap_or_else(|e| e.into_inner());
            index
                .iter()
                .filter(|(_, e)| e.created.elapsed() > self.config.ttl)
                .map(|(k, _)| k.clone())
                .collect()
        };
        for fingerprint in &expired {
            self.remove_entry(fingerprint);
        }
        let n = expired.len();
        if n > 0 {
            self.expirations.fetch_add(n as u64, Ordering::Relaxed);
            info!("resource cache purged {n} expired entries");
        }
        n
    }

    /// One maintenance pass: TTL purge then size enforcement.
    pub fn cleanup(&self) -> (usize, usize) {
        self.cleanup_runs.fetch_add(1, Ordering::Relaxed);
        (self.purge_expired(), self.evict_to_fit())
    }

    /// Delete everything.
    pub fn clear(&self) -> usize {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        let n = index.len();
        for (_, entry) in index.drain() {
            let _ = fs::remove_file(&entry.path);
        }
        self.total_bytes.store(0, Ordering::Relaxed);
        info!("resource cache cleared ({n} entries)");
        n
    }

    /// Store-then-lookup probe used by the admin surface.
    pub fn self_test(&self) -> bool {
        let probe_url = "https://cache-probe.invalid/probe.js";
        let body = b"window.__cacheProbe = true;";
        // The probe host is not a priority CDN but ".js" is cacheable in
        // both policy modes.
        if self.store(probe_url, body, "application/javascript", 200) == StoreOutcome::Disabled {
            return false;
        }
        let ok = self
            .lookup(probe_url)
            .map(|r| r.body == body)
            .unwrap_or(false);
        self.remove_entry(&resource_fingerprint(probe_url));
        ok
    }

    pub fn stats(&self) -> ResourceCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        ResourceCacheStats {
            enabled: self.config.enabled,
            all_content: self.config.all_content,
            entries: self.index.read().unwrap_or_else(|e| e.into_inner()).len(),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            max_total_bytes: self.config.max_total_bytes,
            max_entry_bytes: self.config.max_entry_bytes,
            hits,
            misses,
            stores: self.stores.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cleanup_runs: self.cleanup_runs.load(Ordering::Relaxed),
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }

    pub fn config(&self) -> &ResourceCacheConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(dir: &std::path::Path) -> ResourceCacheConfig {
        ResourceCacheConfig {
            enabled: true,
            all_content: false,
            max_total_bytes: 1024,
            max_entry_bytes: 256,
            ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(600),
            dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn store_then_lookup_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new(test_config(dir.path())).unwrap();

        let body = b"body { color: red }";
        assert_eq!(
            cache.store("https://example.com/site.css", body, "text/css", 200),
            StoreOutcome::Stored
        );
        let hit = cache.lookup("https://example.com/site.css").unwrap();
        assert_eq!(hit.body, body);
        assert_eq!(hit.content_type, "text/css");
        assert_eq!(hit.status, 200);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.stores, 1);
    }

    #[test]
    fn rejects_oversized_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new(test_config(dir.path())).unwrap();
        let big = vec![0u8; 257];
        assert_eq!(
            cache.store("https://example.com/big.js", &big, "text/javascript", 200),
            StoreOutcome::RejectedTooLarge
        );
        assert!(cache.lookup("https://example.com/big.js").is_none());
    }

    #[test]
    fn selective_policy_honors_extensions_and_cdn_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new(test_config(dir.path())).unwrap();
        assert!(cache.is_cacheable("https://example.com/app.js"));
        assert!(cache.is_cacheable("https://example.com/font.woff2"));
        assert!(cache.is_cacheable("https://cdn.jsdelivr.net/npm/pkg"));
        assert!(!cache.is_cacheable("https://example.com/api/data"));
        assert!(!cache.is_cacheable("https://example.com/page.html"));
    }

    #[test]
    fn all_content_policy_excludes_volatile_urls() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.all_content = true;
        let cache = ResourceCache::new(config).unwrap();

        assert!(cache.is_cacheable("https://example.com/page.html"));
        assert!(!cache.is_cacheable("https://example.com/api/users"));
        assert!(!cache.is_cacheable("https://example.com/auth/callback"));
        assert!(!cache.is_cacheable("https://example.com/page?token=abc"));
        assert!(!cache.is_cacheable("https://example.com/page?timestamp=1"));
        assert!(cache.is_cacheable("https://example.com/page?version=2"));
    }

    #[test]
    fn size_budget_holds_after_every_store() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new(test_config(dir.path())).unwrap();
        for i in 0..10 {
            let body = vec![b'x'; 200];
            cache.store(
                &format!("https://example.com/f{i}.js"),
                &body,
                "text/javascript",
                200,
            );
            assert!(cache.stats().total_bytes <= 1024);
        }
        assert!(cache.stats().evictions > 0);
    }

    #[test]
    fn expired_entries_miss_and_disappear() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.ttl = Duration::from_millis(0);
        let cache = ResourceCache::new(config).unwrap();

        cache.store("https://example.com/a.js", b"x", "text/javascript", 200);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.lookup("https://example.com/a.js").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn clear_removes_files_and_resets_size() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new(test_config(dir.path())).unwrap();
        cache.store("https://example.com/a.js", b"aaa", "text/javascript", 200);
        cache.store("https://example.com/b.js", b"bbb", "text/javascript", 200);
        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.stats().total_bytes, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn self_test_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResourceCache::new(test_config(dir.path())).unwrap();
        assert!(cache.self_test());
    }
}
