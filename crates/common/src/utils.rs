//! Small URL and fingerprint helpers.

use sha2::{Digest, Sha256};

use crate::types::ImageFormat;

/// Extract the host from a URL.
pub fn extract_host(url: &str) -> anyhow::Result<String> {
    url::Url::parse(url)?
        .host_str()
        .map(|h| h.to_string())
        .ok_or_else(|| anyhow::anyhow!("No host in URL"))
}

/// Hex-encoded SHA-256 of arbitrary bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Fingerprint for a cached sub-resource: hash of the canonical URL.
pub fn resource_fingerprint(url: &str) -> String {
    sha256_hex(url.as_bytes())
}

/// Fingerprint for a capture result: url, dimensions and format, colon
/// separated so distinct parameter tuples can never collide textually.
pub fn result_fingerprint(url: &str, width: u32, height: u32, format: ImageFormat) -> String {
    sha256_hex(format!("{url}:{width}:{height}:{}", format.as_str()).as_bytes())
}

/// Seconds since the unix epoch.
pub fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_host_works() {
        assert_eq!(extract_host("https://example.com/path").unwrap(), "example.com");
        assert_eq!(
            extract_host("http://sub.example.com:8080/path").unwrap(),
            "sub.example.com"
        );
        assert!(extract_host("not a url").is_err());
    }

    #[test]
    fn result_fingerprint_distinguishes_parameters() {
        let base = result_fingerprint("https://example.com", 1280, 720, ImageFormat::Png);
        assert_eq!(
            base,
            result_fingerprint("https://example.com", 1280, 720, ImageFormat::Png)
        );
        assert_ne!(
            base,
            result_fingerprint("https://example.com", 1280, 720, ImageFormat::Jpeg)
        );
        assert_ne!(
            base,
            result_fingerprint("https://example.com", 1280, 721, ImageFormat::Png)
        );
        assert_ne!(
            base,
            result_fingerprint("https://example.com/", 1280, 720, ImageFormat::Png)
        );
    }

    #[test]
    fn resource_fingerprint_is_hex_sha256() {
        let fp = resource_fingerprint("https://cdn.example.com/app.js");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
