//! Channel adapter trait and the set of running adapters.
//!
//! An adapter normalizes provider traffic into [`InboundEnvelope`]s, hands
//! them to an [`InboundSink`] (the gateway), and delivers the replies it is
//! given through [`Channel::send`].

use crate::config::{ChannelKind, GatewayConfig};
use crate::envelope::{InboundEnvelope, OutboundEnvelope};
use crate::error::{ChannelError, ChannelResult, Result};
use crate::router::Dispatch;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// Channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// Channel is not started.
    #[default]
    Stopped,
    /// Channel is starting up.
    Starting,
    /// Channel is running and connected.
    Running,
    /// Channel is stopping.
    Stopping,
    /// Channel encountered an error.
    Error,
}

/// Channel status information.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    /// Channel id.
    pub id: String,
    /// Adapter kind.
    pub kind: ChannelKind,
    /// Current state.
    pub state: ChannelState,
    /// Messages received from the provider.
    pub messages_received: u64,
    /// Messages delivered to the provider.
    pub messages_sent: u64,
    /// Last error message, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Whether the channel is healthy.
    pub healthy: bool,
}

/// Result of probing a channel's provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    /// Whether the provider answered.
    pub ok: bool,
    /// Human-readable detail.
    pub detail: String,
}

impl ProbeResult {
    /// Successful probe.
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    /// Failed probe.
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Where adapters submit inbound envelopes.
#[async_trait]
pub trait InboundSink: Send + Sync {
    /// Route an envelope; the reply (if any) is delivered by the sink.
    async fn submit(&self, envelope: InboundEnvelope) -> Result<Dispatch>;
}

/// Trait for implementing channel adapters.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel id this adapter serves.
    fn id(&self) -> &str;

    /// Adapter kind.
    fn kind(&self) -> ChannelKind;

    /// Start the adapter. Background work submits to `sink`.
    async fn start(&self, sink: Arc<dyn InboundSink>) -> ChannelResult<()>;

    /// Stop the adapter and its background work.
    async fn stop(&self) -> ChannelResult<()>;

    /// Deliver a reply to the provider.
    async fn send(&self, msg: &OutboundEnvelope) -> ChannelResult<()>;

    /// Get the current channel status.
    async fn status(&self) -> ChannelStatus;

    /// Check that the provider is reachable.
    async fn probe(&self) -> ProbeResult {
        let status = self.status().await;
        if status.healthy {
            ProbeResult::ok(format!("{} channel running", self.id()))
        } else {
            ProbeResult::failed(
                status
                    .last_error
                    .unwrap_or_else(|| format!("channel state {:?}", status.state)),
            )
        }
    }

    /// Check if the channel is currently running.
    async fn is_running(&self) -> bool {
        self.status().await.state == ChannelState::Running
    }
}

/// The adapters of one runtime generation, keyed by channel id.
#[derive(Default)]
pub struct ChannelSet {
    channels: BTreeMap<String, Arc<dyn Channel>>,
}

impl std::fmt::Debug for ChannelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSet")
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ChannelSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one adapter per enabled, credentialed channel in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if an adapter cannot be constructed.
    pub fn from_config(config: &GatewayConfig) -> ChannelResult<Self> {
        let mut set = Self::new();
        for (id, channel) in &config.channels {
            if !channel.should_run() {
                debug!(channel = %id, "channel disabled or not credentialed, skipping");
                continue;
            }
            let adapter: Arc<dyn Channel> = crate::channels::build(id, channel)?;
            set.insert(adapter);
        }
        Ok(set)
    }

    /// Add an adapter, replacing any with the same id.
    pub fn insert(&mut self, channel: Arc<dyn Channel>) {
        info!(channel = %channel.id(), kind = ?channel.kind(), "channel registered");
        self.channels.insert(channel.id().to_string(), channel);
    }

    /// Look up an adapter.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<dyn Channel>> {
        self.channels.get(id)
    }

    /// Registered channel ids.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Number of registered adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no adapters are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Start every adapter. Failures are logged and returned, never fatal.
    pub async fn start_all(&self, sink: &Arc<dyn InboundSink>) -> Vec<(String, ChannelResult<()>)> {
        let mut results = Vec::with_capacity(self.channels.len());
        for (id, channel) in &self.channels {
            info!(channel = %id, "starting channel");
            let result = channel.start(Arc::clone(sink)).await;
            if let Err(ref e) = result {
                error!(channel = %id, error = %e, "failed to start channel");
            }
            results.push((id.clone(), result));
        }
        results
    }

    /// Stop every adapter.
    pub async fn stop_all(&self) {
        let stops = self.channels.iter().map(|(id, channel)| async move {
            info!(channel = %id, "stopping channel");
            if let Err(e) = channel.stop().await {
                error!(channel = %id, error = %e, "failed to stop channel");
            }
        });
        futures::future::join_all(stops).await;
    }

    /// Status of every adapter.
    pub async fn status_all(&self) -> Vec<ChannelStatus> {
        futures::future::join_all(self.channels.values().map(|c| c.status())).await
    }

    /// Number of adapters currently running.
    pub async fn running_count(&self) -> usize {
        let mut count = 0;
        for channel in self.channels.values() {
            if channel.is_running().await {
                count += 1;
            }
        }
        count
    }

    /// Deliver a reply to its originating channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotConnected`] if no adapter serves the channel.
    pub async fn deliver(&self, msg: &OutboundEnvelope) -> ChannelResult<()> {
        let channel = self
            .channels
            .get(&msg.channel_id)
            .ok_or(ChannelError::NotConnected)?;
        channel.send(msg).await
    }
}

/// Base implementation helpers for channels.
pub struct ChannelBase {
    id: String,
    kind: ChannelKind,
    state: RwLock<ChannelState>,
    stats: RwLock<ChannelStats>,
}

impl std::fmt::Debug for ChannelBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBase")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct ChannelStats {
    messages_received: u64,
    messages_sent: u64,
    last_error: Option<String>,
}

impl ChannelBase {
    /// Create a new channel base.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            id: id.into(),
            kind,
            state: RwLock::new(ChannelState::default()),
            stats: RwLock::new(ChannelStats::default()),
        }
    }

    /// Get the channel id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the adapter kind.
    #[must_use]
    pub const fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Get the current state.
    pub async fn state(&self) -> ChannelState {
        *self.state.read().await
    }

    /// Set the channel state.
    pub async fn set_state(&self, state: ChannelState) {
        *self.state.write().await = state;
        debug!(channel = %self.id, ?state, "channel state changed");
    }

    /// Record a received message.
    pub async fn record_received(&self) {
        self.stats.write().await.messages_received += 1;
    }

    /// Record a sent message and clear the last error.
    pub async fn record_sent(&self) {
        let mut stats = self.stats.write().await;
        stats.messages_sent += 1;
        stats.last_error = None;
    }

    /// Record an error.
    pub async fn record_error(&self, error: impl Into<String>) {
        let error = error.into();
        error!(channel = %self.id, %error, "channel error");
        self.stats.write().await.last_error = Some(error);
    }

    /// Build status from current state and stats.
    pub async fn build_status(&self) -> ChannelStatus {
        let state = *self.state.read().await;
        let stats = self.stats.read().await;

        ChannelStatus {
            id: self.id.clone(),
            kind: self.kind,
            state,
            messages_received: stats.messages_received,
            messages_sent: stats.messages_sent,
            last_error: stats.last_error.clone(),
            healthy: state == ChannelState::Running && stats.last_error.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::envelope::CorrelationId;

    #[tokio::test]
    async fn test_channel_base_status() {
        let base = ChannelBase::new("http", ChannelKind::Loopback);
        assert_eq!(base.state().await, ChannelState::Stopped);

        base.set_state(ChannelState::Running).await;
        base.record_received().await;
        base.record_sent().await;

        let status = base.build_status().await;
        assert_eq!(status.id, "http");
        assert_eq!(status.messages_received, 1);
        assert_eq!(status.messages_sent, 1);
        assert!(status.healthy);

        base.record_error("boom").await;
        assert!(!base.build_status().await.healthy);
    }

    #[test]
    fn test_from_config_skips_uncredentialed() {
        let mut config = GatewayConfig::default();
        config.channels.insert("http".into(), ChannelConfig::default());
        config.channels.insert(
            "hooks".into(),
            ChannelConfig {
                kind: ChannelKind::Webhook,
                ..ChannelConfig::default()
            },
        );
        config.channels.insert(
            "off".into(),
            ChannelConfig {
                enabled: false,
                ..ChannelConfig::default()
            },
        );

        let set = ChannelSet::from_config(&config).unwrap();
        assert_eq!(set.ids(), vec!["http".to_string()]);
    }

    #[tokio::test]
    async fn test_deliver_to_unknown_channel() {
        let set = ChannelSet::new();
        let env = InboundEnvelope::new("nowhere", "s", "u", "hi");
        let out = OutboundEnvelope::reply_to(&env, CorrelationId::generate(), "yo");
        assert!(matches!(set.deliver(&out).await, Err(ChannelError::NotConnected)));
    }
}
