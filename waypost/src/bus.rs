//! In-process event bus.
//!
//! The router publishes every accepted inbound message and every outbound
//! reply here. Observers (log streaming, dashboards, tests) subscribe to a
//! broadcast receiver; a slow observer lags instead of blocking the router.

use crate::envelope::{InboundEnvelope, OutboundEnvelope};
use crate::routing::SessionKey;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, trace};

/// Default capacity for the broadcast channel.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Default capacity for per-channel subscriber queues.
const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Event published on the bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    /// An inbound message was accepted and persisted.
    InboundMessage {
        /// Session the message was routed to.
        session_key: SessionKey,
        /// The envelope as received.
        envelope: InboundEnvelope,
    },
    /// A reply was produced and persisted.
    OutboundMessage {
        /// Session that produced the reply.
        session_key: SessionKey,
        /// The reply.
        envelope: OutboundEnvelope,
    },
}

impl BusEvent {
    /// Channel the event concerns.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        match self {
            Self::InboundMessage { envelope, .. } => &envelope.channel_id,
            Self::OutboundMessage { envelope, .. } => &envelope.channel_id,
        }
    }

    /// Event name as published.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InboundMessage { .. } => "inbound_message",
            Self::OutboundMessage { .. } => "outbound_message",
        }
    }
}

/// Event bus statistics.
#[derive(Debug, Default, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    /// Inbound events published.
    pub inbound_count: u64,
    /// Outbound events published.
    pub outbound_count: u64,
    /// Events no subscriber received.
    pub unobserved_count: u64,
}

struct EventBusInner {
    tx: broadcast::Sender<BusEvent>,
    channel_subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<BusEvent>>>>,
    stats: RwLock<BusStats>,
}

/// Broadcast bus shared by the router and its observers.
///
/// Cloning is cheap; clones publish to the same subscribers. The bus outlives
/// runtime reloads so subscriptions survive configuration changes.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create a new bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    /// Create a new bus with the given broadcast capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(EventBusInner {
                tx,
                channel_subscribers: RwLock::new(HashMap::new()),
                stats: RwLock::new(BusStats::default()),
            }),
        }
    }

    /// Publish an event to every subscriber.
    pub async fn publish(&self, event: BusEvent) {
        trace!(kind = event.kind(), channel = %event.channel_id(), "publishing event");

        let delivered = self.inner.tx.send(event.clone()).is_ok();

        let subscribers = self.inner.channel_subscribers.read().await;
        if let Some(senders) = subscribers.get(event.channel_id()) {
            for sender in senders {
                if sender.send(event.clone()).await.is_err() {
                    debug!(channel = %event.channel_id(), "channel subscriber disconnected");
                }
            }
        }
        drop(subscribers);

        let mut stats = self.inner.stats.write().await;
        match event {
            BusEvent::InboundMessage { .. } => stats.inbound_count += 1,
            BusEvent::OutboundMessage { .. } => stats.outbound_count += 1,
        }
        if !delivered {
            stats.unobserved_count += 1;
        }
    }

    /// Publish an `inbound_message` event.
    pub async fn publish_inbound(&self, session_key: SessionKey, envelope: InboundEnvelope) {
        self.publish(BusEvent::InboundMessage {
            session_key,
            envelope,
        })
        .await;
    }

    /// Publish an `outbound_message` event.
    pub async fn publish_outbound(&self, session_key: SessionKey, envelope: OutboundEnvelope) {
        self.publish(BusEvent::OutboundMessage {
            session_key,
            envelope,
        })
        .await;
    }

    /// Subscribe to every event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.tx.subscribe()
    }

    /// Subscribe to events concerning a single channel.
    pub async fn subscribe_channel(&self, channel: &str) -> mpsc::Receiver<BusEvent> {
        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        self.inner
            .channel_subscribers
            .write()
            .await
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        debug!(channel = %channel, "new channel subscriber registered");
        rx
    }

    /// Get current bus statistics.
    pub async fn stats(&self) -> BusStats {
        *self.inner.stats.read().await
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::CorrelationId;

    fn inbound(channel: &str) -> InboundEnvelope {
        InboundEnvelope::new(channel, "chat1", "u1", "Hello")
    }

    #[tokio::test]
    async fn test_broadcast() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish_inbound(SessionKey::for_source("test", "chat1"), inbound("test"))
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "inbound_message");
        assert_eq!(event.channel_id(), "test");
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_channel("telegram").await;

        let tg = inbound("telegram");
        let reply = OutboundEnvelope::reply_to(&tg, CorrelationId::generate(), "For Telegram");
        bus.publish_outbound(SessionKey::for_source("telegram", "chat1"), reply)
            .await;
        bus.publish_inbound(SessionKey::for_source("slack", "chat1"), inbound("slack"))
            .await;

        let event = tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            BusEvent::OutboundMessage { envelope, .. } => assert_eq!(envelope.content, "For Telegram"),
            BusEvent::InboundMessage { .. } => panic!("unexpected inbound event"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stats() {
        let bus = EventBus::new();
        bus.publish_inbound(SessionKey::for_source("t", "c"), inbound("t"))
            .await;

        let stats = bus.stats().await;
        assert_eq!(stats.inbound_count, 1);
        assert_eq!(stats.outbound_count, 0);
        assert_eq!(stats.unobserved_count, 1);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = BusEvent::InboundMessage {
            session_key: SessionKey::for_group("eng"),
            envelope: inbound("slack"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "inbound_message");
        assert_eq!(json["session_key"], "group:eng");
    }
}
