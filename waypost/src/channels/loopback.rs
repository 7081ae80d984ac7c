//! Loopback channel.
//!
//! Messages reach a loopback channel through the HTTP ingest endpoint; the
//! reply is returned in the HTTP response and also kept in a bounded outbox
//! here so it can be inspected later.

use crate::channel::{Channel, ChannelBase, ChannelState, ChannelStatus, InboundSink, ProbeResult};
use crate::config::ChannelKind;
use crate::envelope::OutboundEnvelope;
use crate::error::ChannelResult;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Replies kept in the outbox.
const OUTBOX_CAPACITY: usize = 100;

/// In-memory channel adapter.
#[derive(Debug)]
pub struct LoopbackChannel {
    base: ChannelBase,
    outbox: RwLock<VecDeque<OutboundEnvelope>>,
}

impl LoopbackChannel {
    /// Create a loopback adapter for channel `id`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            base: ChannelBase::new(id, ChannelKind::Loopback),
            outbox: RwLock::new(VecDeque::new()),
        }
    }

    /// Replies delivered so far, oldest first.
    pub async fn outbox(&self) -> Vec<OutboundEnvelope> {
        self.outbox.read().await.iter().cloned().collect()
    }
}

#[async_trait]
impl Channel for LoopbackChannel {
    fn id(&self) -> &str {
        self.base.id()
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Loopback
    }

    async fn start(&self, _sink: Arc<dyn InboundSink>) -> ChannelResult<()> {
        self.base.set_state(ChannelState::Running).await;
        info!(channel = %self.base.id(), "loopback channel started");
        Ok(())
    }

    async fn stop(&self) -> ChannelResult<()> {
        self.base.set_state(ChannelState::Stopped).await;
        info!(channel = %self.base.id(), "loopback channel stopped");
        Ok(())
    }

    async fn send(&self, msg: &OutboundEnvelope) -> ChannelResult<()> {
        let mut outbox = self.outbox.write().await;
        if outbox.len() >= OUTBOX_CAPACITY {
            outbox.pop_front();
        }
        outbox.push_back(msg.clone());
        drop(outbox);
        self.base.record_sent().await;
        Ok(())
    }

    async fn status(&self) -> ChannelStatus {
        self.base.build_status().await
    }

    async fn probe(&self) -> ProbeResult {
        if self.is_running().await {
            ProbeResult::ok("loopback channel running")
        } else {
            ProbeResult::failed("loopback channel stopped")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{CorrelationId, InboundEnvelope};
    use crate::error::Result;
    use crate::router::Dispatch;

    struct NullSink;

    #[async_trait]
    impl InboundSink for NullSink {
        async fn submit(&self, _envelope: InboundEnvelope) -> Result<Dispatch> {
            unreachable!("loopback never submits on its own")
        }
    }

    #[tokio::test]
    async fn test_loopback_lifecycle() {
        let channel = LoopbackChannel::new("http");
        assert!(!channel.probe().await.ok);

        channel.start(Arc::new(NullSink)).await.unwrap();
        assert!(channel.is_running().await);
        assert!(channel.probe().await.ok);

        let env = InboundEnvelope::new("http", "s1", "u1", "hi");
        channel
            .send(&OutboundEnvelope::reply_to(&env, CorrelationId::generate(), "pong"))
            .await
            .unwrap();
        assert_eq!(channel.outbox().await[0].content, "pong");
        assert_eq!(channel.status().await.messages_sent, 1);

        channel.stop().await.unwrap();
        assert!(!channel.is_running().await);
    }
}
