//! Batch job records: item lifecycle, aggregate status, and crash-safe
//! persistence.
//!
//! Every transition rewrites the whole job JSON atomically (temp file,
//! fsync, rename). On startup the persistence directory is scanned and any
//! job that was still live is terminated with reason `restart_interrupted`,
//! preserving the per-item results that had already completed.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use shuttergrid_common::{now_unix_secs, BatchSettings, ImageFormat};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

pub const MAX_BATCH_PARALLEL: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Partial,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Partial | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobItem {
    pub id: String,
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl JobItem {
    pub fn new(id: String, url: String, width: u32, height: u32, format: ImageFormat) -> Self {
        Self {
            id,
            url,
            width,
            height,
            format,
            status: ItemStatus::Pending,
            result: None,
            error: None,
            cached: None,
            started_at: None,
            completed_at: None,
        }
    }

    fn to_result_value(&self) -> serde_json::Value {
        let mut v = json!({ "id": self.id, "status": self.status });
        if let Some(result) = &self.result {
            v["url"] = json!(result);
        }
        if let Some(error) = &self.error {
            v["error"] = json!(error);
        }
        if let Some(cached) = self.cached {
            v["cached"] = json!(cached);
        }
        v
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJobConfig {
    pub parallel: usize,
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_auth: Option<String>,
    pub fail_fast: bool,
    pub cache: bool,
}

impl Default for BatchJobConfig {
    fn default() -> Self {
        Self {
            parallel: 3,
            timeout_secs: 30,
            webhook: None,
            webhook_auth: None,
            fail_fast: false,
            cache: true,
        }
    }
}

impl BatchJobConfig {
    /// Effective scheduler parallelism.
    pub fn effective_parallel(&self) -> usize {
        self.parallel.clamp(1, MAX_BATCH_PARALLEL)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub job_id: String,
    pub items: Vec<JobItem>,
    pub config: BatchJobConfig,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ItemCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub success: usize,
    pub failed: usize,
}

impl BatchJob {
    pub fn new(items: Vec<JobItem>, config: BatchJobConfig) -> Self {
        let now = now_unix_secs();
        Self {
            // URL-safe id with 64 bits of entropy.
            job_id: format!("batch-{}", &Uuid::new_v4().simple().to_string()[..16]),
            items,
            config,
            status: JobStatus::Queued,
            error_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn counts(&self) -> ItemCounts {
        let mut c = ItemCounts {
            total: self.items.len(),
            ..Default::default()
        };
        for item in &self.items {
            match item.status {
                ItemStatus::Pending => c.pending += 1,
                ItemStatus::Running => c.running += 1,
                ItemStatus::Success => c.success += 1,
                ItemStatus::Failed => c.failed += 1,
            }
        }
        c
    }

    pub fn item_mut(&mut self, item_id: &str) -> Option<&mut JobItem> {
        self.items.iter_mut().find(|i| i.id == item_id)
    }

    /// Aggregate status as a function of the item statuses.
    pub fn recompute_status(&mut self) {
        self.updated_at = now_unix_secs();
        let c = self.counts();

        if c.total == 0 {
            self.status = JobStatus::Failed;
            return;
        }
        if c.running > 0 || (c.pending > 0 && self.status != JobStatus::Queued) {
            self.status = JobStatus::Processing;
            return;
        }
        if c.pending > 0 {
            // Nothing picked up yet.
            return;
        }

        self.status = if c.failed == 0 {
            JobStatus::Completed
        } else if c.success == 0 || self.config.fail_fast {
            JobStatus::Failed
        } else {
            JobStatus::Partial
        };
        if self.completed_at.is_none() {
            self.completed_at = Some(now_unix_secs());
        }
    }

    /// Summary object returned while the job runs.
    pub fn status_body(&self) -> serde_json::Value {
        let c = self.counts();
        let mut v = json!({
            "job_id": self.job_id,
            "status": self.status,
            "total": c.total,
            "completed": c.success + c.failed,
            "succeeded": c.success,
            "failed": c.failed,
            "created_at": self.created_at,
            "updated_at": self.updated_at,
        });
        if let Some(reason) = &self.error_reason {
            v["error_reason"] = json!(reason);
        }
        v
    }

    /// Full results object, returned once terminal and posted to webhooks.
    pub fn results_body(&self) -> serde_json::Value {
        let c = self.counts();
        let processing_time = self
            .completed_at
            .map(|done| done.saturating_sub(self.created_at));
        let mut v = json!({
            "job_id": self.job_id,
            "status": self.status,
            "total": c.total,
            "succeeded": c.success,
            "failed": c.failed,
            "results": self.items.iter().map(|i| i.to_result_value()).collect::<Vec<_>>(),
        });
        if let Some(secs) = processing_time {
            v["processing_time"] = json!(secs);
        }
        if let Some(reason) = &self.error_reason {
            v["error_reason"] = json!(reason);
        }
        v
    }

    /// Terminate a live job, failing every item that never finished.
    pub fn terminate(&mut self, reason: &str) {
        for item in &mut self.items {
            if matches!(item.status, ItemStatus::Pending | ItemStatus::Running) {
                item.status = ItemStatus::Failed;
                item.error = Some(reason.to_string());
                item.completed_at = Some(now_unix_secs());
            }
        }
        self.error_reason = Some(reason.to_string());
        self.recompute_status();
        // A terminated job is failed regardless of the item mix.
        self.status = JobStatus::Failed;
    }
}

/// In-memory job table backed by one JSON file per job.
pub struct JobStore {
    settings: BatchSettings,
    jobs: RwLock<HashMap<String, Arc<Mutex<BatchJob>>>>,
}

impl JobStore {
    pub fn new(settings: BatchSettings) -> anyhow::Result<Arc<Self>> {
        if settings.persistence_enabled {
            fs::create_dir_all(&settings.persistence_dir)?;
        }
        Ok(Arc::new(Self {
            settings,
            jobs: RwLock::new(HashMap::new()),
        }))
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.settings.persistence_dir.join(format!("{job_id}.json"))
    }

    /// Atomic write: temp file in the same directory, fsync, rename.
    fn persist_sync(&self, job: &BatchJob) -> anyhow::Result<()> {
        if !self.settings.persistence_enabled {
            return Ok(());
        }
        let path = self.job_path(&job.job_id);
        let tmp = self
            .settings
            .persistence_dir
            .join(format!(".{}.tmp", job.job_id));
        let body = serde_json::to_vec_pretty(job)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub async fn persist(&self, job: &BatchJob) {
        if let Err(e) = self.persist_sync(job) {
            warn!("failed to persist job {}: {e:#}", job.job_id);
        }
    }

    pub async fn create(
        &self,
        items: Vec<JobItem>,
        config: BatchJobConfig,
    ) -> Arc<Mutex<BatchJob>> {
        let job = BatchJob::new(items, config);
        self.persist(&job).await;
        let job_id = job.job_id.clone();
        let handle = Arc::new(Mutex::new(job));
        self.jobs.write().await.insert(job_id, handle.clone());
        handle
    }

    /// Memory first; on miss, fall back to the persisted file and cache it.
    pub async fn get(&self, job_id: &str) -> Option<Arc<Mutex<BatchJob>>> {
        if let Some(handle) = self.jobs.read().await.get(job_id) {
            return Some(handle.clone());
        }
        if !self.settings.persistence_enabled {
            return None;
        }
        let job = Self::read_job_file(&self.job_path(job_id))?;
        let handle = Arc::new(Mutex::new(job));
        self.jobs
            .write()
            .await
            .entry(job_id.to_string())
            .or_insert_with(|| handle.clone());
        Some(handle)
    }

    fn read_job_file(path: &std::path::Path) -> Option<BatchJob> {
        let bytes = fs::read(path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(job) => Some(job),
            Err(e) => {
                warn!("unreadable job file {}: {e}", path.display());
                None
            }
        }
    }

    /// Startup recovery: reload persisted jobs; anything still live lost its
    /// scheduler with the process and is terminated.
    pub async fn recover_from_disk(&self) -> usize {
        if !self.settings.persistence_enabled {
            return 0;
        }
        let entries = match fs::read_dir(&self.settings.persistence_dir) {
            Ok(e) => e,
            Err(e) => {
                warn!("job recovery scan failed: {e}");
                return 0;
            }
        };
        let mut recovered = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(mut job) = Self::read_job_file(&path) else {
                continue;
            };
            if !job.status.is_terminal() {
                job.terminate("restart_interrupted");
                if let Err(e) = self.persist_sync(&job) {
                    warn!("failed to persist recovered job {}: {e:#}", job.job_id);
                }
                info!("job {} marked failed: restart_interrupted", job.job_id);
            }
            let job_id = job.job_id.clone();
            self.jobs
                .write()
                .await
                .insert(job_id, Arc::new(Mutex::new(job)));
            recovered += 1;
        }
        if recovered > 0 {
            info!("recovered {recovered} persisted batch jobs");
        }
        recovered
    }

    /// Drop terminal jobs older than the TTL, from memory and disk.
    pub async fn purge_expired(&self) -> usize {
        let ttl = self.settings.job_ttl.as_secs();
        let now = now_unix_secs();
        let mut victims = Vec::new();
        {
            let jobs = self.jobs.read().await;
            for (id, handle) in jobs.iter() {
                let job = handle.lock().await;
                if job.status.is_terminal() && now.saturating_sub(job.updated_at) > ttl {
                    victims.push(id.clone());
                }
            }
        }
        let mut jobs = self.jobs.write().await;
        for id in &victims {
            jobs.remove(id);
            if self.settings.persistence_enabled {
                let _ = fs::remove_file(self.job_path(id));
            }
        }
        if !victims.is_empty() {
            info!("purged {} expired batch jobs", victims.len());
        }
        victims.len()
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn item(id: &str) -> JobItem {
        JobItem::new(
            id.to_string(),
            format!("https://example.com/{id}"),
            1280,
            720,
            ImageFormat::Png,
        )
    }

    fn settings(dir: &std::path::Path) -> BatchSettings {
        BatchSettings {
            persistence_enabled: true,
            persistence_dir: dir.to_path_buf(),
            job_ttl: Duration::from_secs(3600),
        }
    }

    #[test]
    fn fresh_job_is_queued_with_pending_items() {
        let job = BatchJob::new(vec![item("a"), item("b")], BatchJobConfig::default());
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.job_id.starts_with("batch-"));
        assert_eq!(job.job_id.len(), "batch-".len() + 16);
        let c = job.counts();
        assert_eq!((c.total, c.pending), (2, 2));
    }

    #[test]
    fn all_success_completes() {
        let mut job = BatchJob::new(vec![item("a"), item("b")], BatchJobConfig::default());
        for i in &mut job.items {
            i.status = ItemStatus::Success;
        }
        job.recompute_status();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn mixed_outcomes_are_partial_without_fail_fast() {
        let mut job = BatchJob::new(vec![item("a"), item("b")], BatchJobConfig::default());
        job.items[0].status = ItemStatus::Success;
        job.items[1].status = ItemStatus::Failed;
        job.recompute_status();
        assert_eq!(job.status, JobStatus::Partial);
    }

    #[test]
    fn mixed_outcomes_fail_under_fail_fast() {
        let config = BatchJobConfig {
            fail_fast: true,
            ..Default::default()
        };
        let mut job = BatchJob::new(vec![item("a"), item("b")], config);
        job.items[0].status = ItemStatus::Success;
        job.items[1].status = ItemStatus::Failed;
        job.recompute_status();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn all_failed_fails() {
        let mut job = BatchJob::new(vec![item("a"), item("b")], BatchJobConfig::default());
        for i in &mut job.items {
            i.status = ItemStatus::Failed;
        }
        job.recompute_status();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn running_items_keep_the_job_processing() {
        let mut job = BatchJob::new(vec![item("a"), item("b")], BatchJobConfig::default());
        job.items[0].status = ItemStatus::Running;
        job.recompute_status();
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[test]
    fn terminate_fails_live_items_and_keeps_done_ones() {
        let mut job = BatchJob::new(vec![item("a"), item("b"), item("c")], BatchJobConfig::default());
        job.items[0].status = ItemStatus::Success;
        job.items[0].result = Some("artifact-url".into());
        job.items[1].status = ItemStatus::Running;
        job.terminate("restart_interrupted");

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_reason.as_deref(), Some("restart_interrupted"));
        assert_eq!(job.items[0].status, ItemStatus::Success);
        assert_eq!(job.items[0].result.as_deref(), Some("artifact-url"));
        assert_eq!(job.items[1].status, ItemStatus::Failed);
        assert_eq!(job.items[2].status, ItemStatus::Failed);
    }

    #[test]
    fn parallel_is_clamped() {
        let config = BatchJobConfig {
            parallel: 99,
            ..Default::default()
        };
        assert_eq!(config.effective_parallel(), MAX_BATCH_PARALLEL);
        let config = BatchJobConfig {
            parallel: 0,
            ..Default::default()
        };
        assert_eq!(config.effective_parallel(), 1);
    }

    #[tokio::test]
    async fn persistence_round_trips_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(settings(dir.path())).unwrap();
        let handle = store
            .create(vec![item("a"), item("b")], BatchJobConfig::default())
            .await;
        let (job_id, original) = {
            let mut job = handle.lock().await;
            job.items[0].status = ItemStatus::Success;
            job.items[0].result = Some("artifact".into());
            job.items[0].cached = Some(false);
            job.recompute_status();
            store.persist(&job).await;
            (job.job_id.clone(), job.clone())
        };

        // A fresh store sees only the disk.
        let store2 = JobStore::new(settings(dir.path())).unwrap();
        let loaded = store2.get(&job_id).await.expect("job on disk");
        let loaded = loaded.lock().await;
        assert_eq!(*loaded, original);
    }

    #[tokio::test]
    async fn recovery_terminates_live_jobs_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(settings(dir.path())).unwrap();

        let done = store.create(vec![item("a")], BatchJobConfig::default()).await;
        {
            let mut job = done.lock().await;
            job.items[0].status = ItemStatus::Success;
            job.recompute_status();
            store.persist(&job).await;
        }
        let live = store.create(vec![item("b"), item("c")], BatchJobConfig::default()).await;
        let live_id = {
            let mut job = live.lock().await;
            job.status = JobStatus::Processing;
            job.items[0].status = ItemStatus::Success;
            job.items[0].result = Some("kept".into());
            job.items[1].status = ItemStatus::Running;
            store.persist(&job).await;
            job.job_id.clone()
        };

        let store2 = JobStore::new(settings(dir.path())).unwrap();
        assert_eq!(store2.recover_from_disk().await, 2);

        let recovered = store2.get(&live_id).await.unwrap();
        let recovered = recovered.lock().await;
        assert_eq!(recovered.status, JobStatus::Failed);
        assert_eq!(recovered.error_reason.as_deref(), Some("restart_interrupted"));
        assert_eq!(recovered.items[0].result.as_deref(), Some("kept"));

        let done_id = done.lock().await.job_id.clone();
        let untouched = store2.get(&done_id).await.unwrap();
        assert_eq!(untouched.lock().await.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn purge_removes_old_terminal_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(dir.path());
        s.job_ttl = Duration::from_secs(0);
        let store = JobStore::new(s).unwrap();

        let handle = store.create(vec![item("a")], BatchJobConfig::default()).await;
        let job_id = {
            let mut job = handle.lock().await;
            job.items[0].status = ItemStatus::Success;
            job.recompute_status();
            job.updated_at = now_unix_secs() - 10;
            store.persist(&job).await;
            job.job_id.clone()
        };

        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.job_count().await, 0);
        assert!(!dir.path().join(format!("{job_id}.json")).exists());
    }
}
