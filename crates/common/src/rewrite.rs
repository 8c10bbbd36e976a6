//! Host rewriting applied to URLs before navigation.
//!
//! Some captured sites are served from internal hosts that differ from the
//! public domain (e.g. a revamp deployment behind the ingress). The rewriter
//! swaps host and scheme while leaving path, query and fragment untouched.
//! Cache keys always use the original URL, so caching behavior is invariant
//! under rewriting.
//!
//! The rule table is an immutable snapshot behind an atomic pointer swap;
//! lookups never take a lock and admin updates publish a whole new table.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

/// Replacement target for a single source host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    pub target_host: String,
    pub scheme: String,
}

type RuleTable = HashMap<String, RewriteRule>;

/// Snapshot-swapped host rewrite table.
pub struct UrlRewriter {
    rules: ArcSwap<RuleTable>,
}

impl Default for UrlRewriter {
    fn default() -> Self {
        let mut table = RuleTable::new();
        table.insert(
            "viding.co".to_string(),
            RewriteRule {
                target_host: "viding-co_website-revamp".to_string(),
                scheme: "http".to_string(),
            },
        );
        table.insert(
            "viding.org".to_string(),
            RewriteRule {
                target_host: "viding-org_website-revamp".to_string(),
                scheme: "http".to_string(),
            },
        );
        Self {
            rules: ArcSwap::from_pointee(table),
        }
    }
}

impl UrlRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewriter with no built-in rules.
    pub fn empty() -> Self {
        Self {
            rules: ArcSwap::from_pointee(RuleTable::new()),
        }
    }

    /// Source host used for table lookup: lowercased, `www.` stripped.
    fn lookup_host(url: &Url) -> Option<String> {
        let host = url.host_str()?.to_lowercase();
        Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
    }

    /// Apply the rewrite rules to a URL.
    ///
    /// Returns the input unchanged when it does not parse, has no host, or
    /// matches no rule. Path, query and fragment are preserved byte-for-byte.
    pub fn rewrite(&self, raw: &str) -> String {
        let parsed = match Url::parse(raw) {
            Ok(u) => u,
            Err(e) => {
                warn!("url rewrite skipped, unparsable input {raw:?}: {e}");
                return raw.to_string();
            }
        };
        let host = match Self::lookup_host(&parsed) {
            Some(h) => h,
            None => return raw.to_string(),
        };

        let rules = self.rules.load();
        let rule = match rules.get(&host) {
            Some(r) => r,
            None => return raw.to_string(),
        };

        let mut out = parsed.clone();
        if out.set_scheme(&rule.scheme).is_err() {
            warn!("url rewrite skipped, invalid scheme {:?}", rule.scheme);
            return raw.to_string();
        }
        if out.set_host(Some(&rule.target_host)).is_err() {
            warn!("url rewrite skipped, invalid target host {:?}", rule.target_host);
            return raw.to_string();
        }
        let _ = out.set_port(None);

        info!("url rewritten: {raw} -> {out}");
        out.to_string()
    }

    /// Whether the URL's host has a rewrite rule.
    pub fn matches(&self, raw: &str) -> bool {
        Url::parse(raw)
            .ok()
            .as_ref()
            .and_then(Self::lookup_host)
            .map(|h| self.rules.load().contains_key(&h))
            .unwrap_or(false)
    }

    /// Install or replace a rule. Publishes a new snapshot.
    pub fn add_rule(&self, source_host: &str, rule: RewriteRule) {
        let mut table: RuleTable = (**self.rules.load()).clone();
        let key = source_host.to_lowercase();
        info!(
            "rewrite rule added: {} -> {}://{}",
            key, rule.scheme, rule.target_host
        );
        table.insert(key, rule);
        self.rules.store(Arc::new(table));
    }

    /// Remove a rule by source host. Returns whether one existed.
    pub fn remove_rule(&self, source_host: &str) -> bool {
        let key = source_host.to_lowercase();
        let mut table: RuleTable = (**self.rules.load()).clone();
        let existed = table.remove(&key).is_some();
        if existed {
            info!("rewrite rule removed: {key}");
            self.rules.store(Arc::new(table));
        }
        existed
    }

    /// Current rule table snapshot.
    pub fn rules(&self) -> HashMap<String, RewriteRule> {
        (**self.rules.load()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> UrlRewriter {
        UrlRewriter::new()
    }

    #[test]
    fn preserves_path_query_and_fragment() {
        let r = rewriter();
        assert_eq!(
            r.rewrite("https://viding.co/mini-rsvp/1240?x=1#frag"),
            "http://viding-co_website-revamp/mini-rsvp/1240?x=1#frag"
        );
    }

    #[test]
    fn strips_www_prefix() {
        let r = rewriter();
        assert_eq!(
            r.rewrite("https://www.viding.co/p"),
            "http://viding-co_website-revamp/p"
        );
    }

    #[test]
    fn host_match_is_case_insensitive() {
        let r = rewriter();
        assert_eq!(
            r.rewrite("https://VIDING.CO/a"),
            "http://viding-co_website-revamp/a"
        );
    }

    #[test]
    fn unknown_host_is_untouched() {
        let r = rewriter();
        let url = "https://example.com/a?b=c#d";
        assert_eq!(r.rewrite(url), url);
    }

    #[test]
    fn malformed_input_is_returned_unchanged() {
        let r = rewriter();
        assert_eq!(r.rewrite("not a url"), "not a url");
        assert_eq!(r.rewrite(""), "");
    }

    #[test]
    fn rewrite_is_idempotent() {
        let r = rewriter();
        let once = r.rewrite("https://viding.org/x");
        assert_eq!(r.rewrite(&once), once);
    }

    #[test]
    fn rules_mutate_via_snapshots() {
        let r = UrlRewriter::empty();
        assert!(!r.matches("https://old.example/x"));

        r.add_rule(
            "old.example",
            RewriteRule {
                target_host: "new.example".into(),
                scheme: "https".into(),
            },
        );
        assert!(r.matches("https://old.example/x"));
        assert_eq!(r.rewrite("https://old.example/x"), "https://new.example/x");

        assert!(r.remove_rule("OLD.EXAMPLE"));
        assert!(!r.remove_rule("old.example"));
        assert_eq!(r.rewrite("https://old.example/x"), "https://old.example/x");
    }
}
