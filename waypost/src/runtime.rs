//! One generation of live subsystems, built from one configuration.
//!
//! A [`RuntimeSnapshot`] is immutable once built. Reloading builds a new
//! snapshot, stops the old one's background work, starts the new one and
//! swaps the pointer; readers always see a complete generation.

use crate::backend::{ReasoningBackend, build_backend};
use crate::bus::EventBus;
use crate::channel::{ChannelSet, InboundSink};
use crate::config::GatewayConfig;
use crate::connector::ConnectorService;
use crate::cron::{CronManager, FileCronStorage, GroupRollup, RunLog, sync_rollup_jobs};
use crate::error::{ErrorContext, Result};
use crate::heartbeat::HeartbeatRunner;
use crate::logsink::{LogSink, Redactor};
use crate::memory::{JsonlObservationStore, MemoryObservationStore, MemoryStore, ObservationPipeline};
use crate::router::Router;
use crate::store::{JsonlMessageStore, MessageStore};
use crate::util::timestamp_ms;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Workspace subdirectories created on every build.
pub const WORKSPACE_DIRS: &[&str] = &["logs", "memory", "cron", "messages"];

/// Message store file, relative to the workspace.
pub const MESSAGES_FILE: &str = "messages/messages.jsonl";
/// Observation store file, relative to the workspace.
pub const OBSERVATIONS_FILE: &str = "memory/observations.jsonl";
/// Audit log file, relative to the workspace.
pub const AUDIT_LOG_FILE: &str = "logs/gateway.jsonl";
/// Default cron job file, relative to the workspace.
pub const CRON_JOBS_FILE: &str = "cron/jobs.json";
/// Default cron run log, relative to the workspace.
pub const CRON_RUNS_FILE: &str = "cron/runs.jsonl";

/// Create the workspace scaffolding under `workspace`.
pub async fn ensure_workspace(workspace: &Path) -> Result<()> {
    for dir in WORKSPACE_DIRS {
        let path = workspace.join(dir);
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
    }
    Ok(())
}

fn resolve(workspace: &Path, configured: Option<&PathBuf>, default: &str) -> PathBuf {
    match configured {
        Some(path) if path.is_absolute() => path.clone(),
        Some(path) => workspace.join(path),
        None => workspace.join(default),
    }
}

/// The live subsystems of one configuration generation.
pub struct RuntimeSnapshot {
    /// Configuration this generation was built from.
    pub config: Arc<GatewayConfig>,
    /// Resolved workspace directory.
    pub workspace: PathBuf,
    /// Observation pipeline over the memory store.
    pub memory: ObservationPipeline,
    /// Audit log sink.
    pub log: Arc<LogSink>,
    /// Message store.
    pub store: Arc<dyn MessageStore>,
    /// Reasoning backend, if enabled.
    pub backend: Option<Arc<dyn ReasoningBackend>>,
    /// Inbound pipeline.
    pub router: Arc<Router>,
    /// Connector service, if configured.
    pub connector: Option<ConnectorService>,
    /// Channel adapters.
    pub channels: ChannelSet,
    /// Cron manager.
    pub cron: CronManager,
    /// Group rollup aggregator.
    pub rollup: GroupRollup,
    /// Heartbeat runner.
    pub heartbeat: HeartbeatRunner,
    /// Unix milliseconds when this generation was built.
    pub built_at: u64,
}

impl std::fmt::Debug for RuntimeSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeSnapshot")
            .field("workspace", &self.workspace)
            .field("channels", &self.channels)
            .field("built_at", &self.built_at)
            .finish_non_exhaustive()
    }
}

impl RuntimeSnapshot {
    /// Build every subsystem for `config` without starting anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid, the workspace cannot be
    /// created, or an adapter or backend cannot be constructed. Nothing live
    /// is touched in that case.
    pub async fn build(config: GatewayConfig, bus: &EventBus) -> Result<Self> {
        config.ensure_valid()?;
        let config = Arc::new(config);

        let workspace = config.workspace_dir();
        ensure_workspace(&workspace).await?;

        let memory_store: Arc<dyn MemoryStore> = if config.memory.enabled {
            Arc::new(JsonlObservationStore::new(workspace.join(OBSERVATIONS_FILE)))
        } else {
            Arc::new(MemoryObservationStore::new())
        };
        let memory = ObservationPipeline::new(memory_store).with_capture(config.memory.observational);

        let redactor = Redactor::with_secrets(config.secrets());
        let log = Arc::new(if config.logging.enabled {
            LogSink::new(workspace.join(AUDIT_LOG_FILE), redactor)
        } else {
            LogSink::disabled(redactor)
        });

        let store: Arc<dyn MessageStore> = Arc::new(JsonlMessageStore::new(workspace.join(MESSAGES_FILE)));

        let backend = build_backend(&config.backend)?;

        let mut router = Router::new(Arc::clone(&config), Arc::clone(&store), bus.clone(), Arc::clone(&log))
            .with_backend(backend.clone());
        if config.memory.enabled {
            router = router.with_observational(Arc::new(memory.clone()));
        }

        let connector = config.connector.clone().map(ConnectorService::new);

        let channels = ChannelSet::from_config(&config)?;

        let rollup = GroupRollup::new(Arc::clone(&config), Arc::clone(&store), memory.clone());
        let cron = CronManager::new(
            Arc::new(FileCronStorage::new(resolve(
                &workspace,
                config.cron.jobs_path.as_ref(),
                CRON_JOBS_FILE,
            ))),
            RunLog::file(resolve(&workspace, config.cron.runs_path.as_ref(), CRON_RUNS_FILE)),
        )
        .with_backend(backend.clone())
        .with_completion(Arc::new(rollup.clone()))
        .with_check_interval(Duration::from_secs(config.cron.check_interval_secs.max(1)));

        let heartbeat = HeartbeatRunner::new(&config.heartbeat, backend.clone());

        Ok(Self {
            config,
            workspace,
            memory,
            log,
            store,
            backend,
            router: Arc::new(router),
            connector,
            channels,
            cron,
            rollup,
            heartbeat,
            built_at: timestamp_ms(),
        })
    }

    /// Start channels, the cron manager and the heartbeat runner.
    ///
    /// Channel start failures are logged, not returned.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted cron jobs cannot be loaded or resynced.
    pub async fn start(&self, sink: Arc<dyn InboundSink>) -> Result<()> {
        let started = self.channels.start_all(&sink).await;
        let failed = started.iter().filter(|(_, r)| r.is_err()).count();
        if failed > 0 {
            warn!(failed, "some channels failed to start");
        }

        self.cron.load().await?;
        let sync = sync_rollup_jobs(&self.cron, &self.config).await?;
        if self.config.cron.enabled {
            self.cron.start().await;
        }

        let heartbeat = self.heartbeat.start().await;
        info!(
            channels = started.len() - failed,
            rollup_jobs = sync.upserted.len(),
            heartbeat,
            "runtime started"
        );
        Ok(())
    }

    /// Stop background work: heartbeat and cron first, then channels.
    pub async fn stop(&self) {
        self.heartbeat.stop().await;
        self.cron.stop().await;
        self.channels.stop_all().await;
        info!("runtime stopped");
    }
}
