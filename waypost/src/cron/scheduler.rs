//! Cron manager: durable jobs, a polling timer loop, and the run log.

use super::job::{CronJobDefinition, CronJobPatch, CronRun, RunStatus};
use super::storage::{CronStorage, RunLog};
use crate::backend::{CallOptions, ReasoningBackend};
use crate::envelope::CorrelationId;
use crate::error::{CronError, CronResult};
use crate::routing::BusyPolicy;
use crate::util::{timestamp_ms, truncate_str};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, error, info, warn};

/// Max characters of backend output kept in a run record.
const RUN_DETAIL_MAX_CHARS: usize = 1000;

/// Called after every job execution, successful or not.
#[async_trait]
pub trait JobCompletionHandler: Send + Sync {
    /// Handle a finished run.
    async fn on_complete(&self, job: &CronJobDefinition, run: &CronRun);
}

/// Handle for controlling the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SchedulerHandle {
    /// Signal the scheduler to stop.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

#[derive(Clone)]
struct JobRunner {
    storage: Arc<dyn CronStorage>,
    runs: Arc<RunLog>,
    backend: Option<Arc<dyn ReasoningBackend>>,
    on_complete: Option<Arc<dyn JobCompletionHandler>>,
}

impl JobRunner {
    async fn execute(&self, mut job: CronJobDefinition, now: u64) -> CronResult<CronRun> {
        let correlation_id = CorrelationId::generate();
        let started = Instant::now();
        debug!(job_id = %job.id, correlation_id = %correlation_id, "running cron job");

        let outcome = match &self.backend {
            Some(backend) => backend
                .invoke(
                    &job.session_key,
                    &job.prompt,
                    &CallOptions::new(BusyPolicy::Queue, correlation_id.clone()),
                )
                .await
                .map_err(|e| e.to_string()),
            None => Err("reasoning backend disabled".to_string()),
        };

        let (status, detail) = match outcome {
            Ok(reply) => (RunStatus::Ok, truncate_str(&reply, RUN_DETAIL_MAX_CHARS)),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "cron job failed");
                (RunStatus::Error, e)
            }
        };
        let run = CronRun {
            timestamp: now,
            job_id: job.id.clone(),
            correlation_id,
            status,
            detail,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        self.runs.append(&run).await?;

        job.last_run_at = Some(now);
        job.reschedule(now)?;
        self.storage.save(&job).await?;

        if let Some(handler) = &self.on_complete {
            handler.on_complete(&job, &run).await;
        }
        info!(job_id = %job.id, status = ?run.status, elapsed_ms = run.elapsed_ms, "cron job finished");
        Ok(run)
    }

    async fn run_due(&self, now: u64) -> CronResult<usize> {
        let due: Vec<CronJobDefinition> = self
            .storage
            .list()
            .await?
            .into_iter()
            .filter(|job| job.is_due(now))
            .collect();
        let count = due.len();
        for job in due {
            let id = job.id.clone();
            if let Err(e) = self.execute(job, now).await {
                error!(job_id = %id, error = %e, "cron job bookkeeping failed");
            }
        }
        Ok(count)
    }
}

/// Owns the job store, the run log and the timer loop.
pub struct CronManager {
    runner: JobRunner,
    check_interval: Duration,
    running: Arc<RwLock<bool>>,
    handle: Mutex<Option<SchedulerHandle>>,
}

impl std::fmt::Debug for CronManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronManager")
            .field("check_interval", &self.check_interval)
            .field("has_backend", &self.runner.backend.is_some())
            .finish_non_exhaustive()
    }
}

impl CronManager {
    /// Create a manager over `storage` and `runs`.
    pub fn new(storage: Arc<dyn CronStorage>, runs: RunLog) -> Self {
        Self {
            runner: JobRunner {
                storage,
                runs: Arc::new(runs),
                backend: None,
                on_complete: None,
            },
            check_interval: Duration::from_secs(10),
            running: Arc::new(RwLock::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Backend that executes job prompts.
    #[must_use]
    pub fn with_backend(mut self, backend: Option<Arc<dyn ReasoningBackend>>) -> Self {
        self.runner.backend = backend;
        self
    }

    /// Completion callback.
    #[must_use]
    pub fn with_completion(mut self, handler: Arc<dyn JobCompletionHandler>) -> Self {
        self.runner.on_complete = Some(handler);
        self
    }

    /// Set the interval between job checks.
    #[must_use]
    pub const fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Load persisted jobs. Runs missed while the process was down are not
    /// replayed; every enabled job is rescheduled from now.
    pub async fn load(&self) -> CronResult<usize> {
        let storage = &self.runner.storage;
        storage.init().await?;
        let now = timestamp_ms();
        let jobs = storage.list().await?;
        for mut job in jobs.iter().cloned() {
            if job.enabled && job.next_run_at.is_none_or(|next| next <= now) {
                job.reschedule(now)?;
                storage.save(&job).await?;
            }
        }
        info!(count = jobs.len(), "cron jobs loaded");
        Ok(jobs.len())
    }

    /// Add a job.
    ///
    /// # Errors
    ///
    /// Returns [`CronError::AlreadyExists`] if the id is taken.
    pub async fn add(&self, job: CronJobDefinition) -> CronResult<CronJobDefinition> {
        if self.runner.storage.get(&job.id).await?.is_some() {
            return Err(CronError::AlreadyExists(job.id));
        }
        self.runner.storage.save(&job).await?;
        info!(job_id = %job.id, name = %job.name, schedule = %job.schedule, "added cron job");
        Ok(job)
    }

    /// Insert or replace a job, keeping run history fields of an existing one.
    pub async fn upsert(&self, mut job: CronJobDefinition) -> CronResult<CronJobDefinition> {
        if let Some(existing) = self.runner.storage.get(&job.id).await? {
            job.created_at = existing.created_at;
            job.last_run_at = existing.last_run_at;
            if existing.schedule == job.schedule && existing.enabled == job.enabled {
                job.next_run_at = existing.next_run_at;
            }
        }
        self.runner.storage.save(&job).await?;
        Ok(job)
    }

    /// Patch a job.
    pub async fn update(&self, id: &str, patch: CronJobPatch) -> CronResult<CronJobDefinition> {
        let mut job = self.require(id).await?;
        job.apply(patch, timestamp_ms())?;
        self.runner.storage.save(&job).await?;
        info!(job_id = %id, "updated cron job");
        Ok(job)
    }

    /// Enable a job.
    pub async fn enable(&self, id: &str) -> CronResult<CronJobDefinition> {
        self.set_enabled(id, true).await
    }

    /// Disable a job.
    pub async fn disable(&self, id: &str) -> CronResult<CronJobDefinition> {
        self.set_enabled(id, false).await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> CronResult<CronJobDefinition> {
        self.update(
            id,
            CronJobPatch {
                enabled: Some(enabled),
                ..CronJobPatch::default()
            },
        )
        .await
    }

    /// Remove a job.
    pub async fn remove(&self, id: &str) -> CronResult<()> {
        if !self.runner.storage.delete(id).await? {
            return Err(CronError::NotFound(id.to_string()));
        }
        info!(job_id = %id, "removed cron job");
        Ok(())
    }

    /// All jobs, ordered by id.
    pub async fn list(&self) -> CronResult<Vec<CronJobDefinition>> {
        Ok(self.runner.storage.list().await?)
    }

    /// Get a job by ID.
    pub async fn get(&self, id: &str) -> CronResult<Option<CronJobDefinition>> {
        Ok(self.runner.storage.get(id).await?)
    }

    /// Most recent runs, optionally for one job, oldest first.
    pub async fn runs(&self, job_id: Option<&str>, limit: usize) -> CronResult<Vec<CronRun>> {
        Ok(self.runner.runs.recent(job_id, limit).await?)
    }

    /// Execute a job immediately, regardless of its schedule.
    pub async fn run_now(&self, id: &str) -> CronResult<CronRun> {
        let job = self.require(id).await?;
        self.runner.execute(job, timestamp_ms()).await
    }

    /// Execute every job due at `now`. Returns how many ran.
    pub async fn tick(&self, now: u64) -> CronResult<usize> {
        self.runner.run_due(now).await
    }

    async fn require(&self, id: &str) -> CronResult<CronJobDefinition> {
        self.runner
            .storage
            .get(id)
            .await?
            .ok_or_else(|| CronError::NotFound(id.to_string()))
    }

    /// Start the scheduler loop. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *handle = Some(SchedulerHandle { shutdown_tx });

        let runner = self.runner.clone();
        let interval = self.check_interval;
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            *running.write().await = true;
            info!(interval_secs = interval.as_secs(), "cron scheduler started");

            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        if let Err(e) = runner.run_due(timestamp_ms()).await {
                            error!(error = %e, "error checking cron jobs");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("cron scheduler shutting down");
                        break;
                    }
                }
            }

            *running.write().await = false;
        });
    }

    /// Stop the scheduler loop.
    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.stop().await;
        }
    }

    /// Check if the scheduler loop is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::cron::storage::{FileCronStorage, MemoryCronStorage};
    use crate::routing::SessionKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job(id: &str) -> CronJobDefinition {
        CronJobDefinition::new(id, "Test", "0 9 * * *", "status?", SessionKey::for_group("eng")).unwrap()
    }

    fn manager() -> CronManager {
        CronManager::new(Arc::new(MemoryCronStorage::new()), RunLog::in_memory())
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[async_trait]
    impl JobCompletionHandler for Counter {
        async fn on_complete(&self, _: &CronJobDefinition, _: &CronRun) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_add_list_remove() {
        let manager = manager();
        manager.add(job("a")).await.unwrap();
        assert!(matches!(manager.add(job("a")).await, Err(CronError::AlreadyExists(_))));
        assert_eq!(manager.list().await.unwrap().len(), 1);

        manager.remove("a").await.unwrap();
        assert!(manager.list().await.unwrap().is_empty());
        assert!(matches!(manager.remove("a").await, Err(CronError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_enable_disable() {
        let manager = manager();
        manager.add(job("a")).await.unwrap();

        let disabled = manager.disable("a").await.unwrap();
        assert!(!disabled.enabled);
        assert!(disabled.next_run_at.is_none());

        let enabled = manager.enable("a").await.unwrap();
        assert!(enabled.enabled);
        assert!(enabled.next_run_at.is_some());
    }

    #[tokio::test]
    async fn test_run_now_records_run_and_calls_back() {
        let counter = Arc::new(Counter::default());
        let manager = manager()
            .with_backend(Some(Arc::new(MockBackend::new().with_reply("all good"))))
            .with_completion(counter.clone());
        manager.add(job("a")).await.unwrap();

        let run = manager.run_now("a").await.unwrap();
        assert_eq!(run.status, RunStatus::Ok);
        assert_eq!(run.detail, "all good");
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        let runs = manager.runs(Some("a"), 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].correlation_id, run.correlation_id);
        assert!(manager.get("a").await.unwrap().unwrap().last_run_at.is_some());
    }

    #[tokio::test]
    async fn test_run_without_backend_is_error_run() {
        let manager = manager();
        manager.add(job("a")).await.unwrap();
        let run = manager.run_now("a").await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.detail.contains("disabled"));
    }

    #[tokio::test]
    async fn test_tick_runs_only_due_jobs() {
        let manager = manager().with_backend(Some(Arc::new(MockBackend::new())));
        let mut due = job("due");
        due.next_run_at = Some(1);
        manager.add(due).await.unwrap();
        manager.add(job("later")).await.unwrap();

        assert_eq!(manager.tick(2).await.unwrap(), 1);
        assert_eq!(manager.runs(None, 10).await.unwrap().len(), 1);
        // Rescheduled into the future, so not due again.
        assert_eq!(manager.tick(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_load_reschedules_stale_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        {
            let storage = FileCronStorage::new(&path);
            let mut stale = job("stale");
            stale.next_run_at = Some(5);
            storage.save(&stale).await.unwrap();
        }

        let manager = CronManager::new(Arc::new(FileCronStorage::new(&path)), RunLog::in_memory());
        assert_eq!(manager.load().await.unwrap(), 1);
        let loaded = manager.get("stale").await.unwrap().unwrap();
        assert!(loaded.next_run_at.is_some_and(|n| n > 5));
    }

    #[tokio::test]
    async fn test_start_stop() {
        let manager = manager().with_check_interval(Duration::from_millis(10));
        manager.start().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(manager.is_running().await);

        manager.stop().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!manager.is_running().await);
    }
}
