//! Outbound webhook channel.
//!
//! Inbound traffic for a webhook channel arrives through the ingest endpoint;
//! replies are POSTed as JSON [`OutboundEnvelope`]s to the configured URL.

use super::provider_client;
use crate::channel::{Channel, ChannelBase, ChannelState, ChannelStatus, InboundSink, ProbeResult};
use crate::config::ChannelKind;
use crate::envelope::OutboundEnvelope;
use crate::error::{ChannelError, ChannelResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Webhook channel adapter.
pub struct WebhookChannel {
    base: ChannelBase,
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl std::fmt::Debug for WebhookChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookChannel")
            .field("id", &self.base.id())
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl WebhookChannel {
    /// Create a webhook adapter posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(id: impl Into<String>, url: impl Into<String>, token: Option<String>) -> ChannelResult<Self> {
        Ok(Self {
            base: ChannelBase::new(id, ChannelKind::Webhook),
            client: provider_client()?,
            url: url.into(),
            token,
        })
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn id(&self) -> &str {
        self.base.id()
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn start(&self, _sink: Arc<dyn InboundSink>) -> ChannelResult<()> {
        self.base.set_state(ChannelState::Running).await;
        info!(channel = %self.base.id(), url = %self.url, "webhook channel started");
        Ok(())
    }

    async fn stop(&self) -> ChannelResult<()> {
        self.base.set_state(ChannelState::Stopped).await;
        info!(channel = %self.base.id(), "webhook channel stopped");
        Ok(())
    }

    async fn send(&self, msg: &OutboundEnvelope) -> ChannelResult<()> {
        let mut request = self.client.post(&self.url).json(msg);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let result = match request.send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(ChannelError::send(format!("HTTP {}", response.status()))),
            Err(e) => Err(ChannelError::send(e.to_string())),
        };

        match &result {
            Ok(()) => {
                self.base.record_sent().await;
                debug!(channel = %self.base.id(), correlation_id = %msg.correlation_id, "reply delivered");
            }
            Err(e) => self.base.record_error(e.to_string()).await,
        }
        result
    }

    async fn status(&self) -> ChannelStatus {
        self.base.build_status().await
    }

    async fn probe(&self) -> ProbeResult {
        match self.client.head(&self.url).send().await {
            Ok(response) if !response.status().is_server_error() => {
                ProbeResult::ok(format!("provider answered HTTP {}", response.status()))
            }
            Ok(response) => ProbeResult::failed(format!("provider answered HTTP {}", response.status())),
            Err(e) => ProbeResult::failed(e.to_string()),
        }
    }
}
