//! Gateway orchestrator.
//!
//! The gateway owns the event bus, the current [`RuntimeSnapshot`], the state
//! version and the idempotency cache. Every operation exposed over HTTP/RPC
//! lives here; the server module only translates requests.

use crate::approval::approval_envelope;
use crate::bus::{BusStats, EventBus};
use crate::channel::{ChannelStatus, InboundSink, ProbeResult};
use crate::config::{
    ChannelConfig, ChannelKind, ConfigSource, GatewayConfig, GroupConfig, load_config, save_config,
};
use crate::connector::ConnectorEvent;
use crate::cron::{CronJobDefinition, CronJobPatch, CronRun, NewCronJob, RollupReport};
use crate::envelope::{CorrelationId, InboundEnvelope, OutboundEnvelope};
use crate::error::{ConfigError, GatewayError, Result};
use crate::heartbeat::HealthStatus;
use crate::idempotency::{CachedResponse, Claim, IdempotencyCache, scoped_key};
use crate::memory::{NewObservation, Observation};
use crate::router::Dispatch;
use crate::runtime::RuntimeSnapshot;
use crate::store::{RoutingOutcome, StoredMessage};
use crate::util::timestamp_ms;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Session keys reported by `status`, taken from this many recent records.
const STATUS_SESSION_WINDOW: usize = 200;

/// Result of a configuration mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSummary {
    /// State version after the mutation.
    pub state_version: u64,
    /// Configured channel ids.
    pub channels: Vec<String>,
    /// Configured group ids.
    pub groups: Vec<String>,
}

/// Result of an ingestion.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    /// Whether the envelope was routed.
    pub accepted: bool,
    /// Routing outcome.
    pub outcome: RoutingOutcome,
    /// Correlation id of the exchange.
    pub correlation_id: CorrelationId,
    /// Reply produced for the originating channel.
    pub outbound: Option<OutboundEnvelope>,
    /// Delivery failure, if the reply could not be handed to its channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_error: Option<String>,
    /// State version after the ingestion.
    pub state_version: u64,
}

/// What a connector push produced.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ConnectorOutcome {
    /// Subscription handshake.
    Verification {
        /// Token to echo.
        #[serde(rename = "verificationToken")]
        verification_token: String,
    },
    /// Routed event.
    Ingested(IngestResponse),
}

/// One configured provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    /// Channel id.
    pub id: String,
    /// Adapter kind.
    pub kind: ChannelKind,
    /// Enabled in config.
    pub enabled: bool,
    /// Has what it needs to connect.
    pub credentialed: bool,
    /// Adapter currently running.
    pub running: bool,
}

/// Result of probing a provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTest {
    /// Channel id.
    pub channel_id: String,
    /// Probe result.
    #[serde(flatten)]
    pub result: ProbeResult,
}

/// Result of a memory append.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryAppend {
    /// The observation.
    pub observation: Observation,
    /// False when an observation with the same dedupe key already existed.
    pub written: bool,
}

/// Cron summary for `status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronStatus {
    /// Scheduler loop running.
    pub running: bool,
    /// Jobs defined.
    pub jobs: usize,
    /// Jobs enabled.
    pub enabled_jobs: usize,
}

/// Process, session and job summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    /// Current state version.
    pub state_version: u64,
    /// Unix milliseconds when the process started.
    pub started_at: u64,
    /// Unix milliseconds when the live runtime was built.
    pub runtime_built_at: u64,
    /// Milliseconds since start.
    pub uptime_ms: u64,
    /// Bound config path.
    pub config_path: Option<String>,
    /// Backend name, when enabled.
    pub backend: Option<String>,
    /// Channel adapter status.
    pub channels: Vec<ChannelStatus>,
    /// Configured groups.
    pub groups: Vec<String>,
    /// Session keys seen in recent traffic.
    pub sessions: Vec<String>,
    /// Cron summary.
    pub cron: CronStatus,
    /// Heartbeat health.
    pub heartbeat: HealthStatus,
    /// Event bus counters.
    pub bus: BusStats,
}

struct GatewayInner {
    source: ConfigSource,
    bus: EventBus,
    snapshot: RwLock<Arc<RuntimeSnapshot>>,
    state_version: AtomicU64,
    reload_lock: Mutex<()>,
    idempotency: Mutex<IdempotencyCache>,
    started_at: u64,
}

/// Inbound sink handed to channel adapters.
///
/// Holds a weak reference so adapters owned by a snapshot do not keep the
/// gateway alive.
struct GatewaySink {
    inner: Weak<GatewayInner>,
}

#[async_trait]
impl InboundSink for GatewaySink {
    async fn submit(&self, envelope: InboundEnvelope) -> Result<Dispatch> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| GatewayError::internal("gateway shut down"))?;
        let (dispatch, _) = Gateway { inner }.route(envelope).await?;
        Ok(dispatch)
    }
}

/// The orchestrator. Cloning is cheap.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("source", &self.inner.source)
            .field("state_version", &self.state_version())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Load config from `path` and start a gateway bound to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be loaded or the runtime fails to start.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let config = load_config(path).await?;
        Self::start(config, ConfigSource::Path(path.to_path_buf())).await
    }

    /// Start a gateway for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be built or started.
    pub async fn start(config: GatewayConfig, source: ConfigSource) -> Result<Self> {
        let bus = EventBus::new();
        let snapshot = Arc::new(RuntimeSnapshot::build(config, &bus).await?);
        let gateway = Self {
            inner: Arc::new(GatewayInner {
                source,
                bus,
                snapshot: RwLock::new(Arc::clone(&snapshot)),
                state_version: AtomicU64::new(0),
                reload_lock: Mutex::new(()),
                idempotency: Mutex::new(IdempotencyCache::new()),
                started_at: timestamp_ms(),
            }),
        };
        snapshot.start(gateway.sink()).await?;
        info!(channels = snapshot.channels.len(), "gateway started");
        Ok(gateway)
    }

    /// Stop the live runtime.
    pub async fn shutdown(&self) {
        self.snapshot().await.stop().await;
        info!("gateway stopped");
    }

    fn sink(&self) -> Arc<dyn InboundSink> {
        Arc::new(GatewaySink {
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// The live runtime.
    pub async fn snapshot(&self) -> Arc<RuntimeSnapshot> {
        Arc::clone(&*self.inner.snapshot.read().await)
    }

    /// The event bus. It survives reloads.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Current state version.
    #[must_use]
    pub fn state_version(&self) -> u64 {
        self.inner.state_version.load(Ordering::SeqCst)
    }

    fn bump(&self) -> u64 {
        self.inner.state_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    // -- idempotency ---------------------------------------------------------

    /// Run `operation` at most once per `key` under `scope`.
    ///
    /// Without a key the operation simply runs. With one, a cached success is
    /// replayed, a concurrent holder of the key is awaited, and otherwise the
    /// operation runs and a success is cached. Failures are not cached.
    ///
    /// # Errors
    ///
    /// Returns whatever `operation` returns.
    pub async fn run_once<F, Fut, E>(
        &self,
        scope: &str,
        key: Option<&str>,
        operation: F,
    ) -> std::result::Result<CachedResponse, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<CachedResponse, E>>,
    {
        let Some(key) = key else {
            return operation().await;
        };
        let scoped = scoped_key(scope, key);

        let owner = loop {
            let claim = self.inner.idempotency.lock().await.claim(&scoped, timestamp_ms());
            match claim {
                Claim::Replay(cached) => {
                    debug!(scope, key, "idempotent replay");
                    return Ok(cached);
                }
                Claim::InFlight(mut pending) => {
                    debug!(scope, key, "waiting for in-flight request");
                    let _ = pending.changed().await;
                }
                Claim::Owner(owner) => break owner,
            }
        };

        let outcome = operation().await;
        {
            let mut cache = self.inner.idempotency.lock().await;
            match &outcome {
                Ok(response) => cache.set(&scoped, response.clone(), timestamp_ms()),
                Err(_) => cache.release(&scoped),
            }
        }
        drop(owner);
        outcome
    }

    // -- ingestion -----------------------------------------------------------

    /// Route an envelope and deliver the reply to its channel.
    async fn route(&self, envelope: InboundEnvelope) -> Result<(Dispatch, Option<String>)> {
        let snapshot = self.snapshot().await;
        let dispatch = snapshot.router.dispatch(envelope).await?;
        let mut delivery_error = None;
        if let Some(outbound) = &dispatch.outbound
            && let Err(e) = snapshot.channels.deliver(outbound).await
        {
            warn!(
                channel = %outbound.channel_id,
                correlation_id = %outbound.correlation_id,
                error = %e,
                "reply delivery failed"
            );
            delivery_error = Some(e.to_string());
        }
        Ok((dispatch, delivery_error))
    }

    /// Canonical ingestion: route, deliver, bump the state version.
    ///
    /// # Errors
    ///
    /// Returns validation, storage or backend errors from the router.
    pub async fn ingest(&self, envelope: InboundEnvelope) -> Result<IngestResponse> {
        let (dispatch, delivery_error) = self.route(envelope).await?;
        Ok(IngestResponse {
            accepted: dispatch.accepted(),
            outcome: dispatch.outcome,
            correlation_id: dispatch.correlation_id,
            outbound: dispatch.outbound,
            delivery_error,
            state_version: self.bump(),
        })
    }

    /// Render the approval template from `vars` and ingest it.
    ///
    /// # Errors
    ///
    /// See [`Gateway::ingest`].
    pub async fn approve(&self, vars: Map<String, Value>) -> Result<IngestResponse> {
        let envelope = approval_envelope(&self.snapshot().await.config.server, vars);
        self.ingest(envelope).await
    }

    /// Handle a connector push: verify, interpret, then ingest.
    ///
    /// # Errors
    ///
    /// Returns not-found without a connector, unauthorized on a bad
    /// signature, and validation errors for malformed bodies.
    pub async fn connector_push(&self, body: &[u8], signature: Option<&str>) -> Result<ConnectorOutcome> {
        let snapshot = self.snapshot().await;
        let connector = snapshot
            .connector
            .as_ref()
            .ok_or_else(|| GatewayError::not_found("connector"))?;
        connector.verify(body, signature)?;
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| GatewayError::invalid(format!("connector body: {e}")))?;
        match connector.interpret(payload)? {
            ConnectorEvent::Verification(token) => Ok(ConnectorOutcome::Verification {
                verification_token: token,
            }),
            ConnectorEvent::Message(envelope) => Ok(ConnectorOutcome::Ingested(self.ingest(*envelope).await?)),
        }
    }

    // -- config --------------------------------------------------------------

    /// Re-read the bound config file and rebuild.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConfigPath`] for in-memory configs, or any
    /// load/validation/build error. The previous runtime stays live on error.
    pub async fn reload(&self) -> Result<ConfigSummary> {
        let path = self.inner.source.path().ok_or(ConfigError::NoConfigPath)?;
        let config = load_config(path).await?;
        self.rebuild(config, None).await
    }

    /// Validate and apply `config`, then persist it when bound to a file.
    ///
    /// The file is written only once the new runtime has started, so a
    /// rejected config never replaces the last good one on disk.
    ///
    /// # Errors
    ///
    /// Returns validation, build or write errors. The previous runtime stays
    /// live on error.
    pub async fn apply_config(&self, config: GatewayConfig) -> Result<ConfigSummary> {
        config.ensure_valid()?;
        self.rebuild(config, self.inner.source.path()).await
    }

    /// Replace one channel section.
    ///
    /// # Errors
    ///
    /// See [`Gateway::apply_config`].
    pub async fn put_channel(&self, id: &str, channel: ChannelConfig) -> Result<ConfigSummary> {
        let mut config = (*self.snapshot().await.config).clone();
        config.channels.insert(id.to_string(), channel);
        self.apply_config(config).await
    }

    /// Replace one group section.
    ///
    /// # Errors
    ///
    /// See [`Gateway::apply_config`].
    pub async fn put_group(&self, id: &str, group: GroupConfig) -> Result<ConfigSummary> {
        let mut config = (*self.snapshot().await.config).clone();
        config.groups.insert(id.to_string(), group);
        self.apply_config(config).await
    }

    async fn rebuild(&self, config: GatewayConfig, persist_to: Option<&Path>) -> Result<ConfigSummary> {
        let _guard = self.inner.reload_lock.lock().await;

        let next = Arc::new(RuntimeSnapshot::build(config, &self.inner.bus).await?);
        let previous = self.snapshot().await;
        previous.stop().await;

        let mut started = next.start(self.sink()).await;
        if started.is_ok()
            && let Some(path) = persist_to
        {
            started = save_config(path, &next.config).await.map_err(GatewayError::from);
        }
        if let Err(e) = started {
            warn!(error = %e, "new runtime rejected, restoring previous");
            next.stop().await;
            if let Err(restore) = previous.start(self.sink()).await {
                warn!(error = %restore, "previous runtime failed to restart");
            }
            return Err(e);
        }

        *self.inner.snapshot.write().await = Arc::clone(&next);
        let state_version = self.bump();
        info!(state_version, channels = next.channels.len(), "runtime reloaded");
        Ok(ConfigSummary {
            state_version,
            channels: next.config.channel_ids(),
            groups: next.config.group_ids(),
        })
    }

    /// Live config with secrets masked.
    pub async fn config_redacted(&self) -> GatewayConfig {
        self.snapshot().await.config.redacted()
    }

    /// One channel section with secrets masked.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown ids.
    pub async fn channel_config(&self, id: &str) -> Result<ChannelConfig> {
        self.config_redacted()
            .await
            .channels
            .remove(id)
            .ok_or_else(|| GatewayError::not_found(format!("channel {id}")))
    }

    /// One group section.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown ids.
    pub async fn group_config(&self, id: &str) -> Result<GroupConfig> {
        self.snapshot()
            .await
            .config
            .groups
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(format!("group {id}")))
    }

    // -- providers -----------------------------------------------------------

    /// Every configured channel with its runtime state.
    pub async fn providers_list(&self) -> Vec<ProviderInfo> {
        let snapshot = self.snapshot().await;
        let mut providers = Vec::with_capacity(snapshot.config.channels.len());
        for (id, channel) in &snapshot.config.channels {
            let running = match snapshot.channels.get(id) {
                Some(adapter) => adapter.is_running().await,
                None => false,
            };
            providers.push(ProviderInfo {
                id: id.clone(),
                kind: channel.kind,
                enabled: channel.enabled,
                credentialed: channel.is_credentialed(),
                running,
            });
        }
        providers
    }

    /// Status of every running adapter.
    pub async fn providers_status(&self) -> Vec<ChannelStatus> {
        self.snapshot().await.channels.status_all().await
    }

    /// Probe one adapter.
    ///
    /// # Errors
    ///
    /// Returns not-found if no adapter serves `id`.
    pub async fn providers_test(&self, id: &str) -> Result<ProviderTest> {
        let snapshot = self.snapshot().await;
        let adapter = snapshot
            .channels
            .get(id)
            .ok_or_else(|| GatewayError::not_found(format!("provider {id}")))?;
        let result = adapter.probe().await;
        self.bump();
        info!(channel = %id, ok = result.ok, "provider probed");
        Ok(ProviderTest {
            channel_id: id.to_string(),
            result,
        })
    }

    // -- messages ------------------------------------------------------------

    /// Recent persisted messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn messages(&self, channel_id: Option<&str>, limit: usize) -> Result<Vec<StoredMessage>> {
        Ok(self.snapshot().await.store.recent(channel_id, limit).await?)
    }

    // -- cron ----------------------------------------------------------------

    /// All cron jobs.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn cron_list(&self) -> Result<Vec<CronJobDefinition>> {
        Ok(self.snapshot().await.cron.list().await?)
    }

    /// Recent cron runs.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn cron_runs(&self, job_id: Option<&str>, limit: usize) -> Result<Vec<CronRun>> {
        Ok(self.snapshot().await.cron.runs(job_id, limit).await?)
    }

    /// Create a cron job.
    ///
    /// # Errors
    ///
    /// Returns schedule, duplicate-id or storage errors.
    pub async fn cron_add(&self, params: NewCronJob) -> Result<CronJobDefinition> {
        let job = self.snapshot().await.cron.add(params.into_definition()?).await?;
        self.bump();
        Ok(job)
    }

    /// Patch a cron job.
    ///
    /// # Errors
    ///
    /// Returns not-found, schedule or storage errors.
    pub async fn cron_update(&self, id: &str, patch: CronJobPatch) -> Result<CronJobDefinition> {
        let job = self.snapshot().await.cron.update(id, patch).await?;
        self.bump();
        Ok(job)
    }

    /// Enable or disable a cron job.
    ///
    /// # Errors
    ///
    /// Returns not-found or storage errors.
    pub async fn cron_set_enabled(&self, id: &str, enabled: bool) -> Result<CronJobDefinition> {
        let snapshot = self.snapshot().await;
        let job = if enabled {
            snapshot.cron.enable(id).await?
        } else {
            snapshot.cron.disable(id).await?
        };
        self.bump();
        Ok(job)
    }

    /// Remove a cron job.
    ///
    /// # Errors
    ///
    /// Returns not-found or storage errors.
    pub async fn cron_remove(&self, id: &str) -> Result<()> {
        self.snapshot().await.cron.remove(id).await?;
        self.bump();
        Ok(())
    }

    /// Run a cron job now.
    ///
    /// # Errors
    ///
    /// Returns not-found or storage errors.
    pub async fn cron_run(&self, id: &str) -> Result<CronRun> {
        let run = self.snapshot().await.cron.run_now(id).await?;
        self.bump();
        Ok(run)
    }

    // -- memory --------------------------------------------------------------

    /// Append an observation to long-term memory.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a blank summary, or storage errors.
    pub async fn memory_append(&self, params: NewObservation) -> Result<MemoryAppend> {
        if params.summary.trim().is_empty() {
            return Err(GatewayError::invalid("summary is required"));
        }
        let observation = params.into_observation();
        let written = self.snapshot().await.memory.commit(observation.clone()).await?;
        self.bump();
        Ok(MemoryAppend { observation, written })
    }

    /// Run the rollup aggregation for one group now.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown groups, or storage errors.
    pub async fn rollup_aggregate(&self, group_id: &str) -> Result<RollupReport> {
        let report = self.snapshot().await.rollup.aggregate(group_id, timestamp_ms()).await?;
        self.bump();
        Ok(report)
    }

    // -- status --------------------------------------------------------------

    /// Process, session and job summary.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn status(&self) -> Result<GatewayStatus> {
        let snapshot = self.snapshot().await;
        let now = timestamp_ms();

        let sessions: BTreeSet<String> = snapshot
            .store
            .recent(None, STATUS_SESSION_WINDOW)
            .await?
            .into_iter()
            .filter_map(|m| m.meta.session_key.map(|k| k.to_string()))
            .collect();
        let jobs = snapshot.cron.list().await?;

        Ok(GatewayStatus {
            state_version: self.state_version(),
            started_at: self.inner.started_at,
            runtime_built_at: snapshot.built_at,
            uptime_ms: now.saturating_sub(self.inner.started_at),
            config_path: self.inner.source.path().map(|p| p.display().to_string()),
            backend: snapshot.backend.as_ref().map(|b| b.name().to_string()),
            channels: snapshot.channels.status_all().await,
            groups: snapshot.config.group_ids(),
            sessions: sessions.into_iter().collect(),
            cron: CronStatus {
                running: snapshot.cron.is_running().await,
                jobs: jobs.len(),
                enabled_jobs: jobs.iter().filter(|j| j.enabled).count(),
            },
            heartbeat: snapshot.heartbeat.status().await,
            bus: self.inner.bus.stats().await,
        })
    }

    /// Liveness payload.
    #[must_use]
    pub fn health(&self) -> Value {
        json!({ "ok": true, "stateVersion": self.state_version() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, GroupSource};

    fn config(dir: &Path) -> GatewayConfig {
        let mut config = GatewayConfig {
            workspace: Some(dir.to_path_buf()),
            ..GatewayConfig::default()
        };
        config.channels.insert("telegram".into(), ChannelConfig::default());
        config.backend.mock_reply = Some("pong".into());
        config
    }

    #[tokio::test]
    async fn test_ingest_delivers_reply_and_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::start(config(dir.path()), ConfigSource::Inline).await.unwrap();

        let resp = gateway
            .ingest(InboundEnvelope::new("telegram", "chat-1", "u1", "hello"))
            .await
            .unwrap();
        assert!(resp.accepted);
        assert_eq!(resp.outbound.as_ref().unwrap().content, "pong");
        assert!(resp.delivery_error.is_none());
        assert_eq!(resp.state_version, 1);

        let snapshot = gateway.snapshot().await;
        let adapter = snapshot.channels.get("telegram").unwrap();
        assert!(adapter.status().await.messages_sent >= 1);
        let stats = gateway.bus().stats().await;
        assert_eq!(stats.inbound_count, 1);
        assert_eq!(stats.outbound_count, 1);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_requires_path() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::start(config(dir.path()), ConfigSource::Inline).await.unwrap();
        assert!(matches!(
            gateway.reload().await,
            Err(GatewayError::Config(ConfigError::NoConfigPath))
        ));
        assert_eq!(gateway.state_version(), 0);
    }

    #[tokio::test]
    async fn test_apply_invalid_config_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::start(config(dir.path()), ConfigSource::Inline).await.unwrap();
        let mut bad = config(dir.path());
        bad.server.port = 0;
        assert!(gateway.apply_config(bad).await.is_err());
        assert_eq!(gateway.state_version(), 0);
        assert_eq!(gateway.snapshot().await.channels.ids(), vec!["telegram"]);
    }

    #[tokio::test]
    async fn test_put_group_creates_rollup_job() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::start(config(dir.path()), ConfigSource::Inline).await.unwrap();
        let summary = gateway
            .put_group(
                "eng",
                GroupConfig {
                    sources: vec![GroupSource {
                        channel: "telegram".into(),
                        sources: vec![],
                    }],
                    rollup: Some(crate::config::RollupConfig::default()),
                    ..GroupConfig::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(summary.state_version, 1);
        assert_eq!(summary.groups, vec!["eng"]);
        let jobs = gateway.cron_list().await.unwrap();
        assert_eq!(jobs[0].id, "group:eng:daily-rollup");
    }

    #[tokio::test]
    async fn test_memory_append_validates() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::start(config(dir.path()), ConfigSource::Inline).await.unwrap();
        assert!(gateway.memory_append(NewObservation::default()).await.is_err());
        let appended = gateway
            .memory_append(NewObservation {
                summary: "release shipped".into(),
                dedupe_key: Some("k1".into()),
                ..NewObservation::default()
            })
            .await
            .unwrap();
        assert!(appended.written);
        assert_eq!(appended.observation.source_tag, "manual");
        assert_eq!(gateway.state_version(), 1);
    }

    #[tokio::test]
    async fn test_sink_routes_channel_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::start(config(dir.path()), ConfigSource::Inline).await.unwrap();
        let sink = gateway.sink();
        let dispatch = sink
            .submit(InboundEnvelope::new("telegram", "chat-9", "u2", "hi"))
            .await
            .unwrap();
        assert!(dispatch.accepted());
        assert_eq!(dispatch.outbound.unwrap().content, "pong");
        // Channel-originated traffic is not an API mutation.
        assert_eq!(gateway.state_version(), 0);
    }

    #[tokio::test]
    async fn test_apply_failure_leaves_config_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        save_config(&path, &config(dir.path())).await.unwrap();
        let gateway = Gateway::from_path(&path).await.unwrap();

        let jobs = dir.path().join("broken-jobs.json");
        tokio::fs::write(&jobs, "not json").await.unwrap();
        let mut next = config(dir.path());
        next.cron.jobs_path = Some(jobs);
        next.channels.insert("extra".into(), ChannelConfig::default());

        assert!(gateway.apply_config(next).await.is_err());
        assert_eq!(gateway.state_version(), 0);
        assert_eq!(gateway.snapshot().await.channels.ids(), vec!["telegram"]);
        let on_disk = load_config(&path).await.unwrap();
        assert_eq!(on_disk.channel_ids(), vec!["telegram"]);

        let mut good = config(dir.path());
        good.channels.insert("extra".into(), ChannelConfig::default());
        let summary = gateway.apply_config(good).await.unwrap();
        assert_eq!(summary.state_version, 1);
        assert_eq!(load_config(&path).await.unwrap().channel_ids(), vec!["extra", "telegram"]);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_once_waits_for_in_flight_call() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::start(config(dir.path()), ConfigSource::Inline).await.unwrap();
        let runs = AtomicU64::new(0);
        let counter = &runs;
        let call = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok::<_, GatewayError>(CachedResponse {
                status: 200,
                body: json!({"n": 1}),
            })
        };

        let (a, b) = tokio::join!(
            gateway.run_once("op", Some("k"), call),
            gateway.run_once("op", Some("k"), call),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Failures are not cached; the next caller runs again.
        let failed = gateway
            .run_once("op", Some("f"), || async { Err::<CachedResponse, _>(GatewayError::invalid("no")) })
            .await;
        assert!(failed.is_err());
        gateway.run_once("op", Some("f"), call).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
