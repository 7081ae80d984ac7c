//! Storage backends for cron jobs and the run log.

use super::job::{CronJobDefinition, CronJobId, CronRun};
use crate::error::StorageResult;
use crate::store::{append_line, read_jsonl};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;

/// Trait for cron job storage backends.
#[async_trait]
pub trait CronStorage: Send + Sync {
    /// Load persisted jobs, if the backend has any.
    async fn init(&self) -> StorageResult<()> {
        Ok(())
    }

    /// List all jobs, ordered by id.
    async fn list(&self) -> StorageResult<Vec<CronJobDefinition>>;

    /// Get a job by ID.
    async fn get(&self, id: &str) -> StorageResult<Option<CronJobDefinition>>;

    /// Save a job (insert or update).
    async fn save(&self, job: &CronJobDefinition) -> StorageResult<()>;

    /// Delete a job by ID. Returns whether it existed.
    async fn delete(&self, id: &str) -> StorageResult<bool>;
}

/// In-memory cron job storage.
#[derive(Debug, Default)]
pub struct MemoryCronStorage {
    jobs: RwLock<BTreeMap<CronJobId, CronJobDefinition>>,
}

impl MemoryCronStorage {
    /// Create a new memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CronStorage for MemoryCronStorage {
    async fn list(&self) -> StorageResult<Vec<CronJobDefinition>> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    async fn get(&self, id: &str) -> StorageResult<Option<CronJobDefinition>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn save(&self, job: &CronJobDefinition) -> StorageResult<()> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> StorageResult<bool> {
        Ok(self.jobs.write().await.remove(id).is_some())
    }
}

/// File-based cron job storage: one JSON array, rewritten on every change.
#[derive(Debug)]
pub struct FileCronStorage {
    path: PathBuf,
    cache: RwLock<BTreeMap<CronJobId, CronJobDefinition>>,
}

impl FileCronStorage {
    /// Create a new file storage at the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    async fn persist(&self, cache: &BTreeMap<CronJobId, CronJobDefinition>) -> StorageResult<()> {
        let jobs: Vec<&CronJobDefinition> = cache.values().collect();
        let content = serde_json::to_string_pretty(&jobs)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl CronStorage for FileCronStorage {
    async fn init(&self) -> StorageResult<()> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let jobs: Vec<CronJobDefinition> = serde_json::from_str(&content)?;
        let mut cache = self.cache.write().await;
        cache.clear();
        for job in jobs {
            cache.insert(job.id.clone(), job);
        }
        debug!(path = %self.path.display(), count = cache.len(), "loaded cron jobs");
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<CronJobDefinition>> {
        Ok(self.cache.read().await.values().cloned().collect())
    }

    async fn get(&self, id: &str) -> StorageResult<Option<CronJobDefinition>> {
        Ok(self.cache.read().await.get(id).cloned())
    }

    async fn save(&self, job: &CronJobDefinition) -> StorageResult<()> {
        let mut cache = self.cache.write().await;
        cache.insert(job.id.clone(), job.clone());
        self.persist(&cache).await
    }

    async fn delete(&self, id: &str) -> StorageResult<bool> {
        let mut cache = self.cache.write().await;
        let existed = cache.remove(id).is_some();
        if existed {
            self.persist(&cache).await?;
        }
        Ok(existed)
    }
}

/// Append-only run log, in memory or as JSON lines.
#[derive(Debug, Default)]
pub struct RunLog {
    path: Option<PathBuf>,
    memory: RwLock<Vec<CronRun>>,
}

impl RunLog {
    /// In-memory run log.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Run log persisted to `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            memory: RwLock::new(Vec::new()),
        }
    }

    /// Append a run.
    pub async fn append(&self, run: &CronRun) -> StorageResult<()> {
        match &self.path {
            Some(path) => {
                let mut line = serde_json::to_string(run)?;
                line.push('\n');
                append_line(path, &line).await
            }
            None => {
                self.memory.write().await.push(run.clone());
                Ok(())
            }
        }
    }

    /// Most recent `limit` runs, optionally for one job, oldest first.
    pub async fn recent(&self, job_id: Option<&str>, limit: usize) -> StorageResult<Vec<CronRun>> {
        let runs = match &self.path {
            Some(path) => read_jsonl::<CronRun>(path).await?,
            None => self.memory.read().await.clone(),
        };
        let mut runs: Vec<CronRun> = runs
            .into_iter()
            .filter(|r| job_id.is_none_or(|id| r.job_id == id))
            .collect();
        if runs.len() > limit {
            runs.drain(..runs.len() - limit);
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::job::RunStatus;
    use crate::envelope::CorrelationId;
    use crate::routing::SessionKey;

    fn job(id: &str) -> CronJobDefinition {
        CronJobDefinition::new(id, "Test", "0 9 * * *", "Hello", SessionKey::for_group("eng")).unwrap()
    }

    fn run(job_id: &str, ts: u64) -> CronRun {
        CronRun {
            timestamp: ts,
            job_id: job_id.into(),
            correlation_id: CorrelationId::generate(),
            status: RunStatus::Ok,
            detail: "done".into(),
            elapsed_ms: 3,
        }
    }

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = MemoryCronStorage::new();
        storage.save(&job("b")).await.unwrap();
        storage.save(&job("a")).await.unwrap();

        let ids: Vec<_> = storage.list().await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(storage.delete("a").await.unwrap());
        assert!(!storage.delete("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_storage_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron").join("jobs.json");

        let storage = FileCronStorage::new(&path);
        storage.init().await.unwrap();
        storage.save(&job("nightly")).await.unwrap();

        let reopened = FileCronStorage::new(&path);
        reopened.init().await.unwrap();
        let loaded = reopened.get("nightly").await.unwrap().unwrap();
        assert_eq!(loaded.prompt, "Hello");
    }

    #[tokio::test]
    async fn test_run_log_file_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::file(dir.path().join("runs.jsonl"));
        log.append(&run("a", 1)).await.unwrap();
        log.append(&run("b", 2)).await.unwrap();
        log.append(&run("a", 3)).await.unwrap();

        let a_runs = log.recent(Some("a"), 10).await.unwrap();
        assert_eq!(a_runs.len(), 2);
        let last = log.recent(None, 1).await.unwrap();
        assert_eq!(last[0].timestamp, 3);
    }
}
