//! Fingerprint → artifact cache for idempotent screenshot replies.
//!
//! Keys are `SHA-256(url ":" width ":" height ":" format)`. Entries carry
//! the opaque artifact identifier returned by the storage collaborator and
//! are bounded by TTL and an LRU item cap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use shuttergrid_common::{result_fingerprint, ImageFormat, ResultCacheConfig};
use tracing::{debug, info};

struct ResultEntry {
    url: String,
    artifact: String,
    created: Instant,
    last_access: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultCacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub max_items: usize,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

pub struct ResultCache {
    config: ResultCacheConfig,
    entries: Mutex<HashMap<String, ResultEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(config: ResultCacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ResultEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached artifact identifier for these capture parameters, if fresh.
    pub fn get(&self, url: &str, width: u32, height: u32, format: ImageFormat) -> Option<String> {
        if !self.config.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let key = result_fingerprint(url, width, height, format);
        let mut entries = self.lock();
        match entries.get_mut(&key) {
            Some(entry) if entry.created.elapsed() <= self.config.ttl => {
                entry.last_access = Instant::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("result cache hit for {url}");
                Some(entry.artifact.clone())
            }
            Some(_) => {
                entries.remove(&key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a freshly captured artifact.
    pub fn put(
        &self,
        url: &str,
        width: u32,
        height: u32,
        format: ImageFormat,
        artifact: impl Into<String>,
    ) {
        if !self.config.enabled {
            return;
        }
        let key = result_fingerprint(url, width, height, format);
        let mut entries = self.lock();
        if entries.len() >= self.config.max_items && !entries.contains_key(&key) {
            Self::evict_lru_decile(&mut entries);
        }
        let now = Instant::now();
        entries.insert(
            key,
            ResultEntry {
                url: url.to_string(),
                artifact: artifact.into(),
                created: now,
                last_access: now,
            },
        );
    }

    /// When full, drop the least-recently-accessed tenth of the entries so
    /// inserts do not pay an eviction on every call.
    fn evict_lru_decile(entries: &mut HashMap<String, ResultEntry>) {
        let mut by_access: Vec<(String, Instant)> = entries
            .iter()
            .map(|(k, e)| (k.clone(), e.last_access))
            .collect();
        by_access.sort_by_key(|(_, at)| *at);
        let to_remove = (entries.len() / 10).max(1);
        for (key, _) in by_access.into_iter().take(to_remove) {
            entries.remove(&key);
        }
    }

    /// Drop every entry whose original URL matches. O(n) scan.
    pub fn invalidate_by_url(&self, url: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.url != url);
        let removed = before - entries.len();
        if removed > 0 {
            info!("result cache invalidated {removed} entries for {url}");
        }
        removed
    }

    pub fn purge_expired(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        let ttl = self.config.ttl;
        entries.retain(|_, e| e.created.elapsed() <= ttl);
        before - entries.len()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let n = entries.len();
        entries.clear();
        info!("result cache cleared ({n} entries)");
        n
    }

    pub fn stats(&self) -> ResultCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        ResultCacheStats {
            enabled: self.config.enabled,
            entries: self.lock().len(),
            max_items: self.config.max_items,
            ttl_secs: self.config.ttl.as_secs(),
            hits,
            misses,
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_items: usize, ttl: Duration) -> ResultCache {
        ResultCache::new(ResultCacheConfig {
            enabled: true,
            ttl,
            max_items,
        })
    }

    #[test]
    fn get_after_put_returns_identical_artifact() {
        let c = cache(10, Duration::from_secs(60));
        c.put("https://example.com", 1280, 720, ImageFormat::Png, "artifact-1");
        assert_eq!(
            c.get("https://example.com", 1280, 720, ImageFormat::Png),
            Some("artifact-1".to_string())
        );
        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn different_parameters_do_not_collide() {
        let c = cache(10, Duration::from_secs(60));
        c.put("https://example.com", 1280, 720, ImageFormat::Png, "png-artifact");
        assert!(c.get("https://example.com", 1280, 720, ImageFormat::Jpeg).is_none());
        assert!(c.get("https://example.com", 1280, 721, ImageFormat::Png).is_none());
    }

    #[test]
    fn expired_entries_miss() {
        let c = cache(10, Duration::from_millis(0));
        c.put("https://example.com", 1280, 720, ImageFormat::Png, "a");
        std::thread::sleep(Duration::from_millis(5));
        assert!(c.get("https://example.com", 1280, 720, ImageFormat::Png).is_none());
        assert_eq!(c.stats().entries, 0);
    }

    #[test]
    fn lru_cap_is_enforced() {
        let c = cache(10, Duration::from_secs(60));
        for i in 0..25 {
            c.put(&format!("https://example.com/{i}"), 800, 600, ImageFormat::Png, "a");
        }
        assert!(c.stats().entries <= 10 + 1);
    }

    #[test]
    fn invalidate_by_url_removes_all_variants() {
        let c = cache(10, Duration::from_secs(60));
        c.put("https://example.com", 1280, 720, ImageFormat::Png, "a");
        c.put("https://example.com", 800, 600, ImageFormat::Jpeg, "b");
        c.put("https://other.com", 800, 600, ImageFormat::Png, "c");
        assert_eq!(c.invalidate_by_url("https://example.com"), 2);
        assert!(c.get("https://other.com", 800, 600, ImageFormat::Png).is_some());
    }

    #[test]
    fn disabled_cache_never_stores_or_hits() {
        let c = ResultCache::new(ResultCacheConfig {
            enabled: false,
            ttl: Duration::from_secs(60),
            max_items: 10,
        });
        c.put("https://example.com", 1280, 720, ImageFormat::Png, "a");
        assert!(c.get("https://example.com", 1280, 720, ImageFormat::Png).is_none());
        assert_eq!(c.stats().entries, 0);
    }
}
