//! Artifact publication seam.
//!
//! Upload to object storage and signed-URL generation live outside this
//! service; only their contract appears here. The bundled implementation
//! moves finished captures into a served directory and returns the URL
//! path, which keeps the pipeline end-to-end runnable without external
//! collaborators.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use shuttergrid_common::ArtifactConfig;
use tracing::{info, warn};

/// Contract with the storage collaborator: persist an artifact file and
/// return its externally addressable identifier.
pub trait ArtifactStore: Send + Sync {
    fn publish(&self, path: &Path) -> Result<String>;
}

pub struct LocalArtifactStore {
    config: ArtifactConfig,
}

impl LocalArtifactStore {
    pub fn new(config: ArtifactConfig) -> Result<Self> {
        fs::create_dir_all(&config.screenshot_dir)?;
        fs::create_dir_all(&config.artifact_dir)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ArtifactConfig {
        &self.config
    }

    fn sweep_dir(dir: &Path, retention: Duration) -> usize {
        let Ok(entries) = fs::read_dir(dir) else {
            return 0;
        };
        let now = SystemTime::now();
        let mut removed = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .map(|age| age > retention)
                .unwrap_or(false);
            if stale && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Remove scratch and published files past the retention horizon.
    pub fn sweep_stale(&self) -> usize {
        let removed = Self::sweep_dir(&self.config.screenshot_dir, self.config.retention)
            + Self::sweep_dir(&self.config.artifact_dir, self.config.retention);
        if removed > 0 {
            info!("removed {removed} stale artifact files");
        }
        removed
    }

    /// Absolute path of a published artifact, for the serving route.
    pub fn resolve(&self, file_name: &str) -> Option<PathBuf> {
        // The serving route must not escape the artifact directory.
        if file_name.contains('/') || file_name.contains("..") {
            return None;
        }
        let path = self.config.artifact_dir.join(file_name);
        path.is_file().then_some(path)
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn publish(&self, path: &Path) -> Result<String> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("artifact path has no file name")?
            .to_string();
        let dest = self.config.artifact_dir.join(&file_name);
        if fs::rename(path, &dest).is_err() {
            // Cross-device fallback.
            fs::copy(path, &dest).context("artifact copy failed")?;
            if let Err(e) = fs::remove_file(path) {
                warn!("could not remove scratch artifact {}: {e}", path.display());
            }
        }
        Ok(format!("/screenshots/{file_name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> LocalArtifactStore {
        LocalArtifactStore::new(ArtifactConfig {
            screenshot_dir: dir.join("scratch"),
            artifact_dir: dir.join("artifacts"),
            retention: Duration::from_secs(3600),
        })
        .unwrap()
    }

    #[test]
    fn publish_moves_the_file_and_returns_a_url_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let scratch = store.config().screenshot_dir.join("abc.png");
        fs::write(&scratch, b"png-bytes").unwrap();

        let url = store.publish(&scratch).unwrap();
        assert_eq!(url, "/screenshots/abc.png");
        assert!(!scratch.exists());
        assert_eq!(
            fs::read(store.config().artifact_dir.join("abc.png")).unwrap(),
            b"png-bytes"
        );
    }

    #[test]
    fn resolve_refuses_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        fs::write(store.config().artifact_dir.join("ok.png"), b"x").unwrap();

        assert!(store.resolve("ok.png").is_some());
        assert!(store.resolve("../ok.png").is_none());
        assert!(store.resolve("a/b.png").is_none());
        assert!(store.resolve("missing.png").is_none());
    }
}
