//! Polling connector channel.
//!
//! Periodically GETs `<url>?since=<cursor>` and expects either a JSON array
//! of messages or `{"messages": [...]}`. Each item uses the inbound envelope
//! shape without `channelId`, which the adapter fills in. Replies are POSTed
//! back to the same URL.

use super::provider_client;
use crate::channel::{Channel, ChannelBase, ChannelState, ChannelStatus, InboundSink, ProbeResult};
use crate::config::ChannelKind;
use crate::envelope::{InboundEnvelope, OutboundEnvelope};
use crate::error::{ChannelError, ChannelResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

struct PollInner {
    base: ChannelBase,
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    cursor: AtomicU64,
}

impl PollInner {
    fn feed_url(&self, since: u64) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{sep}since={since}", self.url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn poll_once(&self, sink: &Arc<dyn InboundSink>) -> ChannelResult<usize> {
        let since = self.cursor.load(Ordering::SeqCst);
        let response = self
            .authorized(self.client.get(self.feed_url(since)))
            .send()
            .await
            .map_err(|e| ChannelError::internal(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ChannelError::internal(format!("HTTP {}", response.status())));
        }
        let feed: Value = response
            .json()
            .await
            .map_err(|e| ChannelError::internal(e.to_string()))?;

        let envelopes = parse_feed(self.base.id(), feed, since);
        let count = envelopes.len();
        for envelope in envelopes {
            self.cursor.fetch_max(envelope.timestamp, Ordering::SeqCst);
            self.base.record_received().await;
            if let Err(e) = sink.submit(envelope).await {
                warn!(channel = %self.base.id(), error = %e, "polled message failed");
            }
        }
        Ok(count)
    }
}

/// Parse a feed payload into envelopes newer than `since`.
#[must_use]
pub fn parse_feed(channel_id: &str, feed: Value, since: u64) -> Vec<InboundEnvelope> {
    let items = match feed {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("messages") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|mut item| {
            let obj = item.as_object_mut()?;
            obj.insert("channelId".to_string(), Value::String(channel_id.to_string()));
            match serde_json::from_value::<InboundEnvelope>(item) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    debug!(channel = %channel_id, error = %e, "skipping malformed feed item");
                    None
                }
            }
        })
        .filter(|envelope| envelope.timestamp > since)
        .collect()
}

/// Polling channel adapter.
pub struct PollChannel {
    inner: Arc<PollInner>,
    interval: Duration,
    shutdown_tx: RwLock<Option<mpsc::Sender<()>>>,
}

impl std::fmt::Debug for PollChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollChannel")
            .field("id", &self.inner.base.id())
            .field("url", &self.inner.url)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl PollChannel {
    /// Create a poll adapter for `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        token: Option<String>,
        interval: Duration,
    ) -> ChannelResult<Self> {
        Ok(Self {
            inner: Arc::new(PollInner {
                base: ChannelBase::new(id, ChannelKind::Poll),
                client: provider_client()?,
                url: url.into(),
                token,
                cursor: AtomicU64::new(crate::util::timestamp_ms()),
            }),
            interval,
            shutdown_tx: RwLock::new(None),
        })
    }
}

#[async_trait]
impl Channel for PollChannel {
    fn id(&self) -> &str {
        self.inner.base.id()
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Poll
    }

    async fn start(&self, sink: Arc<dyn InboundSink>) -> ChannelResult<()> {
        self.inner.base.set_state(ChannelState::Starting).await;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let inner = Arc::clone(&self.inner);
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match inner.poll_once(&sink).await {
                            Ok(0) => {}
                            Ok(n) => debug!(channel = %inner.base.id(), count = n, "polled messages"),
                            Err(e) => inner.base.record_error(e.to_string()).await,
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(channel = %inner.base.id(), "poll loop shutting down");
                        break;
                    }
                }
            }
        });

        self.inner.base.set_state(ChannelState::Running).await;
        info!(channel = %self.inner.base.id(), interval_secs = interval.as_secs(), "poll channel started");
        Ok(())
    }

    async fn stop(&self) -> ChannelResult<()> {
        self.inner.base.set_state(ChannelState::Stopping).await;
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(()).await;
        }
        self.inner.base.set_state(ChannelState::Stopped).await;
        info!(channel = %self.inner.base.id(), "poll channel stopped");
        Ok(())
    }

    async fn send(&self, msg: &OutboundEnvelope) -> ChannelResult<()> {
        let result = match self
            .inner
            .authorized(self.inner.client.post(&self.inner.url).json(msg))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(ChannelError::send(format!("HTTP {}", response.status()))),
            Err(e) => Err(ChannelError::send(e.to_string())),
        };
        match &result {
            Ok(()) => self.inner.base.record_sent().await,
            Err(e) => self.inner.base.record_error(e.to_string()).await,
        }
        result
    }

    async fn status(&self) -> ChannelStatus {
        self.inner.base.build_status().await
    }

    async fn probe(&self) -> ProbeResult {
        let since = self.inner.cursor.load(Ordering::SeqCst);
        match self
            .inner
            .authorized(self.inner.client.get(self.inner.feed_url(since)))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => ProbeResult::ok("feed reachable"),
            Ok(response) => ProbeResult::failed(format!("feed answered HTTP {}", response.status())),
            Err(e) => ProbeResult::failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_feed_array_and_object() {
        let feed = json!([
            {"sourceId": "s1", "senderId": "u1", "content": "a", "timestamp": 10},
            {"sourceId": "s1", "senderId": "u1", "content": "b", "timestamp": 20},
            {"content": "missing fields"}
        ]);
        let envelopes = parse_feed("feed", feed, 10);
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].channel_id, "feed");
        assert_eq!(envelopes[0].content, "b");

        let feed = json!({"messages": [{"sourceId": "s", "senderId": "u", "content": "c", "timestamp": 5}]});
        assert_eq!(parse_feed("feed", feed, 0).len(), 1);
        assert!(parse_feed("feed", json!("nope"), 0).is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let channel = PollChannel::new("feed", "http://127.0.0.1:9/feed", None, Duration::from_secs(30)).unwrap();
        channel.stop().await.unwrap();
        assert_eq!(channel.status().await.state, ChannelState::Stopped);
    }
}
