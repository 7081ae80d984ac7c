//! Reference channel adapters.
//!
//! - [`LoopbackChannel`] keeps replies in memory; its traffic arrives through
//!   the HTTP ingest endpoint.
//! - [`WebhookChannel`] POSTs replies to a provider URL.
//! - [`PollChannel`] fetches a JSON feed periodically and POSTs replies back.

pub mod loopback;
pub mod poll;
pub mod webhook;

pub use loopback::LoopbackChannel;
pub use poll::PollChannel;
pub use webhook::WebhookChannel;

use crate::channel::Channel;
use crate::config::{ChannelConfig, ChannelKind};
use crate::error::{ChannelError, ChannelResult};
use std::sync::Arc;
use std::time::Duration;

/// Timeout for provider HTTP calls.
pub(crate) const PROVIDER_TIMEOUT: Duration = Duration::from_secs(15);

/// Build the adapter for one configured channel.
///
/// # Errors
///
/// Returns [`ChannelError::Config`] if the channel lacks its provider URL.
pub fn build(id: &str, config: &ChannelConfig) -> ChannelResult<Arc<dyn Channel>> {
    let url = || {
        config
            .url
            .clone()
            .ok_or_else(|| ChannelError::Config(format!("channel '{id}' has no url")))
    };
    let channel: Arc<dyn Channel> = match config.kind {
        ChannelKind::Loopback => Arc::new(LoopbackChannel::new(id)),
        ChannelKind::Webhook => Arc::new(WebhookChannel::new(id, url()?, config.token.clone())?),
        ChannelKind::Poll => Arc::new(PollChannel::new(
            id,
            url()?,
            config.token.clone(),
            Duration::from_secs(config.poll_interval_secs.max(1)),
        )?),
    };
    Ok(channel)
}

/// Build a reqwest client for provider calls.
pub(crate) fn provider_client() -> ChannelResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .map_err(|e| ChannelError::Config(e.to_string()))
}
