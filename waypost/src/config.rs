//! Gateway configuration.
//!
//! Configuration is a single JSON document (camelCase keys). Every section
//! has serde defaults so a minimal file only names what it changes.

use crate::cron::parse_schedule;
use crate::envelope::MessageMode;
use crate::error::{ConfigError, ConfigResult};
use crate::routing::BusyPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Placeholder shown instead of secrets when config is read back.
pub const REDACTED: &str = "***";

/// Where the live configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Loaded from (and written back to) a file; reload is possible.
    Path(PathBuf),
    /// Supplied as an in-memory value; reload is not possible.
    Inline,
}

impl ConfigSource {
    /// The bound config path, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Path(p) => Some(p),
            Self::Inline => None,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Workspace directory; defaults to `~/.waypost/workspace`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    /// HTTP surface.
    pub server: ServerConfig,
    /// Channel adapters keyed by channel id.
    pub channels: BTreeMap<String, ChannelConfig>,
    /// Groups keyed by group id.
    pub groups: BTreeMap<String, GroupConfig>,
    /// Reasoning backend.
    pub backend: BackendConfig,
    /// Long-term memory.
    pub memory: MemoryConfig,
    /// Scheduler.
    pub cron: CronConfig,
    /// Heartbeat runner.
    pub heartbeat: HeartbeatConfig,
    /// RPC tool policy.
    pub tools: ToolPolicyConfig,
    /// Audit log sink.
    pub logging: LoggingConfig,
    /// Optional ontology/connector service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector: Option<ConnectorConfig>,
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Bind address.
    pub bind: String,
    /// Listen port.
    pub port: u16,
    /// Path of the canonical ingestion endpoint.
    pub ingest_path: String,
    /// Bearer token for mutating operations; open gateway when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest_token: Option<String>,
    /// Extra path for the approval bridge (always also served at `/approve`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approve_path: Option<String>,
    /// Template rendered by the approval bridge; `{{name}}` placeholders.
    pub approve_template: String,
    /// Channel the rendered approval is ingested on.
    pub approve_channel: String,
    /// Source the rendered approval is ingested on.
    pub approve_source: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8787,
            ingest_path: "/ingest".to_string(),
            ingest_token: None,
            approve_path: None,
            approve_template: "Approved: {{title}}".to_string(),
            approve_channel: "http".to_string(),
            approve_source: "approvals".to_string(),
        }
    }
}

/// Kind of channel adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Replies are kept in memory; messages arrive through HTTP ingest.
    #[default]
    Loopback,
    /// Replies are POSTed to `url`.
    Webhook,
    /// Messages are fetched from `url` periodically; replies are POSTed back.
    Poll,
}

/// Channel adapter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelConfig {
    /// Whether the adapter should run.
    pub enabled: bool,
    /// Adapter kind.
    pub kind: ChannelKind,
    /// Provider endpoint (webhook target or poll feed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Provider credential sent as a bearer token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Poll interval for `poll` adapters.
    pub poll_interval_secs: u64,
    /// Allowed sender ids for direct routes. Empty or `*` allows everyone.
    pub allow_from: Vec<String>,
    /// Default mode for direct routes.
    pub mode: MessageMode,
    /// Busy policy for direct routes.
    pub busy_policy: BusyPolicy,
    /// Route non-group messages that match no group to a per-source session.
    pub route_direct: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: ChannelKind::Loopback,
            url: None,
            token: None,
            poll_interval_secs: 30,
            allow_from: Vec::new(),
            mode: MessageMode::Conversational,
            busy_policy: BusyPolicy::Queue,
            route_direct: true,
        }
    }
}

impl ChannelConfig {
    /// Whether the adapter has what it needs to connect to its provider.
    #[must_use]
    pub fn is_credentialed(&self) -> bool {
        match self.kind {
            ChannelKind::Loopback => true,
            ChannelKind::Webhook | ChannelKind::Poll => {
                self.url.as_deref().is_some_and(|u| !u.trim().is_empty())
            }
        }
    }

    /// Whether the adapter should be started.
    #[must_use]
    pub fn should_run(&self) -> bool {
        self.enabled && self.is_credentialed()
    }
}

/// A channel (and optionally specific sources on it) belonging to a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSource {
    /// Channel id.
    pub channel: String,
    /// Source ids on that channel; empty matches every source.
    #[serde(default)]
    pub sources: Vec<String>,
}

impl GroupSource {
    /// Whether `(channel, source)` belongs to this entry.
    #[must_use]
    pub fn matches(&self, channel: &str, source: &str) -> bool {
        self.channel == channel && (self.sources.is_empty() || self.sources.iter().any(|s| s == source))
    }
}

/// Group settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GroupConfig {
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Declared sources.
    pub sources: Vec<GroupSource>,
    /// Allowed sender ids. Empty or `*` allows everyone.
    pub allow_from: Vec<String>,
    /// Default operating mode.
    pub mode: MessageMode,
    /// Busy policy.
    pub busy_policy: BusyPolicy,
    /// Nightly rollup settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollup: Option<RollupConfig>,
}

impl GroupConfig {
    /// Whether the group declares `channel` among its sources.
    #[must_use]
    pub fn has_channel(&self, channel: &str) -> bool {
        self.sources.iter().any(|s| s.channel == channel)
    }

    /// Whether `(channel, source)` belongs to the group.
    #[must_use]
    pub fn matches(&self, channel: &str, source: &str) -> bool {
        self.sources.iter().any(|s| s.matches(channel, source))
    }

    /// Rollup settings if the rollup is enabled.
    #[must_use]
    pub fn active_rollup(&self) -> Option<&RollupConfig> {
        self.rollup.as_ref().filter(|r| r.enabled)
    }
}

/// Observation policy attached to jobs that write memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObservationPolicy {
    /// Tag naming the producer of the observation.
    pub source_tag: String,
    /// Provenance reference recorded on every observation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance_ref: Option<String>,
    /// Project tags.
    pub project_tags: Vec<String>,
    /// Role tags.
    pub role_tags: Vec<String>,
    /// Trust class of the source.
    pub trust_class: String,
    /// Confidence used when the producer does not compute one.
    pub default_confidence: f64,
}

impl Default for ObservationPolicy {
    fn default() -> Self {
        Self {
            source_tag: "group-rollup".to_string(),
            provenance_ref: None,
            project_tags: Vec::new(),
            role_tags: Vec::new(),
            trust_class: "derived".to_string(),
            default_confidence: 0.6,
        }
    }
}

/// Group rollup settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RollupConfig {
    /// Whether the rollup job exists.
    pub enabled: bool,
    /// Cron expression.
    pub schedule: String,
    /// How far back the rollup looks.
    pub lookback_hours: u64,
    /// Max inbound messages scanned.
    pub max_inputs: usize,
    /// Max observations written per run.
    pub max_writes: usize,
    /// Width of the dedupe time bucket.
    pub dedupe_bucket_minutes: u64,
    /// Entries below this confidence become pending-review risks.
    pub low_confidence_threshold: f64,
    /// Summary character budget.
    pub summary_max_chars: usize,
    /// Observation policy for written entries.
    pub observation: ObservationPolicy,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: "0 2 * * *".to_string(),
            lookback_hours: 24,
            max_inputs: 500,
            max_writes: 5,
            dedupe_bucket_minutes: 60,
            low_confidence_threshold: 0.6,
            summary_max_chars: 280,
            observation: ObservationPolicy::default(),
        }
    }
}

/// Kind of reasoning backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process backend that echoes the prompt.
    #[default]
    Mock,
    /// JSON over HTTP.
    Http,
}

/// Reasoning backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendConfig {
    /// Whether a backend is built at all.
    pub enabled: bool,
    /// Backend kind.
    pub kind: BackendKind,
    /// Endpoint for `http` backends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Bearer credential for `http` backends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Static reply that short-circuits every backend call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mock_reply: Option<String>,
    /// Per-call timeout.
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: BackendKind::Mock,
            url: None,
            api_key: None,
            mock_reply: None,
            timeout_secs: 60,
        }
    }
}

/// Memory settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MemoryConfig {
    /// Whether the memory store exists.
    pub enabled: bool,
    /// Whether observational traffic is captured.
    pub observational: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            observational: true,
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CronConfig {
    /// Whether the cron manager runs.
    pub enabled: bool,
    /// Job definitions file; defaults to `<workspace>/cron/jobs.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs_path: Option<PathBuf>,
    /// Run log; defaults to `<workspace>/cron/runs.jsonl`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runs_path: Option<PathBuf>,
    /// Seconds between due-job checks.
    pub check_interval_secs: u64,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jobs_path: None,
            runs_path: None,
            check_interval_secs: 10,
        }
    }
}

/// Heartbeat settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HeartbeatConfig {
    /// Whether the runner starts.
    pub enabled: bool,
    /// Seconds between beats.
    pub interval_secs: u64,
    /// Channel half of the target session key.
    pub channel_id: String,
    /// Source half of the target session key.
    pub source_id: String,
    /// Prompt sent on each beat.
    pub prompt: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 1800,
            channel_id: "heartbeat".to_string(),
            source_id: "main".to_string(),
            prompt: "[Heartbeat] Review pending work and report anything that needs attention."
                .to_string(),
        }
    }
}

/// Allow/deny lists over RPC tool names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolPolicyConfig {
    /// Allowed tools; empty allows everything not denied.
    pub allow: Vec<String>,
    /// Denied tools; always wins.
    pub deny: Vec<String>,
}

impl ToolPolicyConfig {
    /// Whether `tool` may run.
    #[must_use]
    pub fn is_allowed(&self, tool: &str) -> bool {
        if self.deny.iter().any(|t| t == tool || t == "*") {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|t| t == tool || t == "*")
    }
}

/// Audit log settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Whether the JSON-lines audit log is written.
    pub enabled: bool,
    /// Extra literal values to redact.
    pub redact: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact: Vec::new(),
        }
    }
}

/// Connector service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectorConfig {
    /// Connector name, used in logs and metadata.
    pub name: String,
    /// Webhook path.
    pub webhook_path: String,
    /// HMAC-SHA256 secret; signature checks are skipped when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
    /// Header carrying the hex signature (optionally `sha256=` prefixed).
    pub signature_header: String,
    /// Channel id connector events are ingested on.
    pub channel_id: String,
    /// Mode applied to connector events.
    pub mode: MessageMode,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            name: "notion".to_string(),
            webhook_path: "/webhooks/notion".to_string(),
            signing_secret: None,
            signature_header: "x-notion-signature".to_string(),
            channel_id: "notion".to_string(),
            mode: MessageMode::Observational,
        }
    }
}

/// Severity of a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueLevel {
    /// Blocks loading.
    Error,
    /// Loads, but something will not work.
    Warning,
}

/// A problem found while validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigIssue {
    /// Severity.
    pub level: IssueLevel,
    /// Dotted path of the offending field.
    pub path: String,
    /// What is wrong.
    pub message: String,
}

impl ConfigIssue {
    fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Error,
            path: path.into(),
            message: message.into(),
        }
    }

    fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Warning,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl GatewayConfig {
    /// Workspace directory after defaults.
    #[must_use]
    pub fn workspace_dir(&self) -> PathBuf {
        self.workspace
            .clone()
            .unwrap_or_else(crate::util::workspace_dir)
    }

    /// Channel ids, sorted.
    #[must_use]
    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Group ids, sorted.
    #[must_use]
    pub fn group_ids(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    /// Whether traffic on `channel` can match any route.
    #[must_use]
    pub fn is_routable_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel) || self.groups.values().any(|g| g.has_channel(channel))
    }

    /// Every configured secret value, for log redaction.
    #[must_use]
    pub fn secrets(&self) -> Vec<String> {
        let mut out = Vec::new();
        out.extend(self.server.ingest_token.clone());
        out.extend(self.backend.api_key.clone());
        out.extend(self.channels.values().filter_map(|c| c.token.clone()));
        out.extend(
            self.connector
                .as_ref()
                .and_then(|c| c.signing_secret.clone()),
        );
        out.extend(self.logging.redact.iter().cloned());
        out.retain(|s| !s.is_empty());
        out
    }

    /// A copy safe to hand to unauthenticated readers.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        let hide = |v: &mut Option<String>| {
            if v.is_some() {
                *v = Some(REDACTED.to_string());
            }
        };
        hide(&mut copy.server.ingest_token);
        hide(&mut copy.backend.api_key);
        for channel in copy.channels.values_mut() {
            hide(&mut channel.token);
        }
        if let Some(connector) = copy.connector.as_mut() {
            hide(&mut connector.signing_secret);
        }
        if !copy.logging.redact.is_empty() {
            copy.logging.redact = vec![REDACTED.to_string()];
        }
        copy
    }

    /// Validate the configuration.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue::error("server.port", "must be non-zero"));
        }
        if !self.server.ingest_path.starts_with('/') {
            issues.push(ConfigIssue::error("server.ingestPath", "must start with '/'"));
        }
        if let Some(path) = &self.server.approve_path
            && !path.starts_with('/')
        {
            issues.push(ConfigIssue::error("server.approvePath", "must start with '/'"));
        }

        for (id, channel) in &self.channels {
            if id.trim().is_empty() {
                issues.push(ConfigIssue::error("channels", "channel id must not be blank"));
            }
            if channel.enabled && !channel.is_credentialed() {
                issues.push(ConfigIssue::warning(
                    format!("channels.{id}.url"),
                    "missing; channel will stay offline",
                ));
            }
            if channel.kind == ChannelKind::Poll && channel.poll_interval_secs == 0 {
                issues.push(ConfigIssue::error(
                    format!("channels.{id}.pollIntervalSecs"),
                    "must be non-zero",
                ));
            }
        }

        for (id, group) in &self.groups {
            if group.sources.is_empty() {
                issues.push(ConfigIssue::warning(
                    format!("groups.{id}.sources"),
                    "no sources declared; group never matches",
                ));
            }
            for source in &group.sources {
                if !self.channels.contains_key(&source.channel) {
                    issues.push(ConfigIssue::warning(
                        format!("groups.{id}.sources"),
                        format!("unknown channel '{}'", source.channel),
                    ));
                }
            }
            if let Some(rollup) = &group.rollup {
                if let Err(e) = parse_schedule(&rollup.schedule) {
                    issues.push(ConfigIssue::error(
                        format!("groups.{id}.rollup.schedule"),
                        e.to_string(),
                    ));
                }
                if !(0.0..=1.0).contains(&rollup.low_confidence_threshold) {
                    issues.push(ConfigIssue::error(
                        format!("groups.{id}.rollup.lowConfidenceThreshold"),
                        "must be within 0.0..=1.0",
                    ));
                }
                if rollup.dedupe_bucket_minutes == 0 {
                    issues.push(ConfigIssue::error(
                        format!("groups.{id}.rollup.dedupeBucketMinutes"),
                        "must be non-zero",
                    ));
                }
                if rollup.max_writes == 0 {
                    issues.push(ConfigIssue::warning(
                        format!("groups.{id}.rollup.maxWrites"),
                        "zero; rollup will never write observations",
                    ));
                }
            }
        }

        if self.backend.enabled
            && self.backend.kind == BackendKind::Http
            && self.backend.url.as_deref().is_none_or(|u| u.trim().is_empty())
        {
            issues.push(ConfigIssue::error("backend.url", "required for http backend"));
        }

        if self.cron.check_interval_secs == 0 {
            issues.push(ConfigIssue::error("cron.checkIntervalSecs", "must be non-zero"));
        }
        if self.heartbeat.enabled && self.heartbeat.interval_secs == 0 {
            issues.push(ConfigIssue::error("heartbeat.intervalSecs", "must be non-zero"));
        }

        for tool in &self.tools.allow {
            if self.tools.deny.contains(tool) {
                issues.push(ConfigIssue::warning(
                    "tools",
                    format!("'{tool}' is both allowed and denied; deny wins"),
                ));
            }
        }

        if let Some(connector) = &self.connector {
            if !connector.webhook_path.starts_with('/') {
                issues.push(ConfigIssue::error(
                    "connector.webhookPath",
                    "must start with '/'",
                ));
            }
            if !self.is_routable_channel(&connector.channel_id) {
                issues.push(ConfigIssue::warning(
                    "connector.channelId",
                    format!("'{}' is not a channel or group source; events will be dropped", connector.channel_id),
                ));
            }
        }
        if !self.is_routable_channel(&self.server.approve_channel) {
            issues.push(ConfigIssue::warning(
                "server.approveChannel",
                format!("'{}' is not a channel or group source; approvals will be dropped", self.server.approve_channel),
            ));
        }

        issues
    }

    /// Fail on the first error-level issue.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing every error-level issue.
    pub fn ensure_valid(&self) -> ConfigResult<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|i| i.level == IssueLevel::Error)
            .map(|i| i.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::invalid(errors.join("; ")))
        }
    }
}

/// Default configuration path (`~/.waypost/config.json`).
#[must_use]
pub fn config_path() -> PathBuf {
    crate::util::config_path()
}

/// Load and validate configuration from `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub async fn load_config(path: &Path) -> ConfigResult<GatewayConfig> {
    let content = tokio::fs::read_to_string(path).await?;
    let config: GatewayConfig = serde_json::from_str(&content)?;
    config.ensure_valid()?;
    Ok(config)
}

/// Write configuration to `path` as pretty JSON.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub async fn save_config(path: &Path, config: &GatewayConfig) -> ConfigResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(config)?;
    tokio::fs::write(path, content).await?;
    Ok(())
}

/// Write a starter configuration to `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub async fn init_config(path: &Path) -> ConfigResult<GatewayConfig> {
    let config = starter_config();
    save_config(path, &config).await?;
    Ok(config)
}

/// The configuration written by `waypost init`.
#[must_use]
pub fn starter_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config
        .channels
        .insert("http".to_string(), ChannelConfig::default());
    config.backend.enabled = true;
    config
}
