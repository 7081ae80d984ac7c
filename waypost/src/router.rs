//! The inbound message pipeline.
//!
//! [`Router::dispatch`] is the single contract every inbound source goes
//! through: resolve route, authorize, persist, publish, then either capture
//! (observational) or ask the backend for a reply (conversational). Earlier
//! steps are never rolled back when a later one fails.

use crate::backend::{CallOptions, ReasoningBackend};
use crate::bus::EventBus;
use crate::config::GatewayConfig;
use crate::envelope::{CorrelationId, InboundEnvelope, MAX_HISTORY_TURNS, MessageMode, OutboundEnvelope};
use crate::error::{BackendError, GatewayError, Result};
use crate::logsink::LogSink;
use crate::memory::ObservationPipeline;
use crate::routing::{Route, resolve_route};
use crate::store::{MessageMeta, MessageStore, RoutingOutcome, StoredMessage};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Content persisted for envelopes with no route.
pub const DROPPED_SENTINEL: &str = "[dropped unmatched group]";

/// Content persisted for envelopes from senders not on the allow-list.
pub const BLOCKED_SENTINEL: &str = "[blocked unauthorized message]";

/// Receives observational-mode messages after they are persisted.
#[async_trait]
pub trait ObservationalHandler: Send + Sync {
    /// Handle one observational message.
    async fn on_observational(
        &self,
        envelope: &InboundEnvelope,
        route: &Route,
        correlation_id: &CorrelationId,
    );
}

#[async_trait]
impl ObservationalHandler for ObservationPipeline {
    async fn on_observational(
        &self,
        envelope: &InboundEnvelope,
        route: &Route,
        correlation_id: &CorrelationId,
    ) {
        if let Err(e) = self.capture(envelope, route, correlation_id).await {
            warn!(correlation_id = %correlation_id, error = %e, "observational capture failed");
        }
    }
}

/// Result of routing one envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispatch {
    /// Correlation id of the exchange.
    pub correlation_id: CorrelationId,
    /// Routing outcome.
    pub outcome: RoutingOutcome,
    /// Effective mode, when routed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<MessageMode>,
    /// Reply for the originating channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbound: Option<OutboundEnvelope>,
}

impl Dispatch {
    /// Whether the envelope was routed.
    #[must_use]
    pub fn accepted(&self) -> bool {
        self.outcome == RoutingOutcome::Accepted
    }
}

/// Authorization, persistence and dispatch for inbound envelopes.
pub struct Router {
    config: Arc<GatewayConfig>,
    store: Arc<dyn MessageStore>,
    bus: EventBus,
    log: Arc<LogSink>,
    backend: Option<Arc<dyn ReasoningBackend>>,
    observational: Option<Arc<dyn ObservationalHandler>>,
    mock_reply: Option<String>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("backend", &self.backend.as_ref().map(|b| b.name().to_string()))
            .field("mock_reply", &self.mock_reply.is_some())
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create a router without a backend.
    pub fn new(
        config: Arc<GatewayConfig>,
        store: Arc<dyn MessageStore>,
        bus: EventBus,
        log: Arc<LogSink>,
    ) -> Self {
        let mock_reply = config.backend.mock_reply.clone();
        Self {
            config,
            store,
            bus,
            log,
            backend: None,
            observational: None,
            mock_reply,
        }
    }

    /// Set the reasoning backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Option<Arc<dyn ReasoningBackend>>) -> Self {
        self.backend = backend;
        self
    }

    /// Set the observational handler.
    #[must_use]
    pub fn with_observational(mut self, handler: Arc<dyn ObservationalHandler>) -> Self {
        self.observational = Some(handler);
        self
    }

    /// Override the static mock reply.
    #[must_use]
    pub fn with_mock_reply(mut self, reply: Option<String>) -> Self {
        self.mock_reply = reply;
        self
    }

    /// The message store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// The configured backend.
    #[must_use]
    pub fn backend(&self) -> Option<&Arc<dyn ReasoningBackend>> {
        self.backend.as_ref()
    }

    /// Route one envelope and return the reply, if any.
    ///
    /// # Errors
    ///
    /// See [`Router::dispatch`].
    pub async fn handle_inbound(&self, envelope: InboundEnvelope) -> Result<Option<OutboundEnvelope>> {
        Ok(self.dispatch(envelope).await?.outbound)
    }

    /// Route one envelope.
    ///
    /// # Errors
    ///
    /// Returns a validation error for envelopes missing required fields, a
    /// storage error if persistence fails, and a backend error if the backend
    /// fails or none is configured for conversational traffic.
    pub async fn dispatch(&self, envelope: InboundEnvelope) -> Result<Dispatch> {
        envelope
            .validate()
            .map_err(|field| GatewayError::invalid(format!("missing {field}")))?;

        let correlation_id = CorrelationId::resolve(envelope.correlation_id.as_deref());

        let Some(route) = resolve_route(&self.config, &envelope) else {
            return self
                .reject(envelope, correlation_id, RoutingOutcome::Dropped, DROPPED_SENTINEL)
                .await;
        };

        if !route.allows(&envelope.sender_id) {
            return self
                .reject(envelope, correlation_id, RoutingOutcome::Blocked, BLOCKED_SENTINEL)
                .await;
        }

        let mode = envelope.mode.unwrap_or(route.mode);
        let meta = MessageMeta {
            group_id: route.group_id.clone(),
            session_key: Some(route.session_key.clone()),
            outcome: RoutingOutcome::Accepted,
            mode: Some(mode),
            thread_id: envelope.thread_id.clone(),
            raw: envelope.raw.clone(),
        };

        self.store
            .append(&StoredMessage::inbound(&envelope, &correlation_id, meta.clone()))
            .await?;
        self.bus
            .publish_inbound(route.session_key.clone(), envelope.clone())
            .await;
        self.log
            .log(
                "message.inbound",
                json!({
                    "correlationId": correlation_id,
                    "channelId": envelope.channel_id,
                    "sourceId": envelope.source_id,
                    "senderId": envelope.sender_id,
                    "sessionKey": route.session_key,
                    "mode": mode.as_str(),
                    "content": envelope.content,
                }),
            )
            .await;
        info!(
            channel = %envelope.channel_id,
            session = %route.session_key,
            correlation_id = %correlation_id,
            mode = mode.as_str(),
            "inbound message accepted"
        );

        if mode == MessageMode::Observational {
            if let Some(handler) = &self.observational {
                handler
                    .on_observational(&envelope, &route, &correlation_id)
                    .await;
            }
            return Ok(Dispatch {
                correlation_id,
                outcome: RoutingOutcome::Accepted,
                mode: Some(mode),
                outbound: None,
            });
        }

        let prompt = build_prompt(&envelope);
        let reply = if let Some(reply) = &self.mock_reply {
            debug!(correlation_id = %correlation_id, "using static mock reply");
            reply.clone()
        } else {
            let backend = self.backend.as_ref().ok_or(BackendError::Disabled)?;
            let options = CallOptions::new(route.busy_policy, correlation_id.clone());
            match backend.invoke(&route.session_key, &prompt, &options).await {
                Ok(reply) => reply,
                Err(e) => {
                    self.log
                        .log(
                            "backend.error",
                            json!({"correlationId": correlation_id, "error": e.to_string()}),
                        )
                        .await;
                    return Err(e.into());
                }
            }
        };

        let outbound = OutboundEnvelope::reply_to(&envelope, correlation_id.clone(), reply);
        self.store
            .append(&StoredMessage::outbound(&outbound, meta))
            .await?;
        self.bus
            .publish_outbound(route.session_key.clone(), outbound.clone())
            .await;
        self.log
            .log(
                "message.outbound",
                json!({
                    "correlationId": correlation_id,
                    "channelId": outbound.channel_id,
                    "sourceId": outbound.source_id,
                    "sessionKey": route.session_key,
                    "content": outbound.content,
                }),
            )
            .await;

        Ok(Dispatch {
            correlation_id,
            outcome: RoutingOutcome::Accepted,
            mode: Some(mode),
            outbound: Some(outbound),
        })
    }

    async fn reject(
        &self,
        envelope: InboundEnvelope,
        correlation_id: CorrelationId,
        outcome: RoutingOutcome,
        sentinel: &str,
    ) -> Result<Dispatch> {
        let record = StoredMessage::inbound(
            &envelope,
            &correlation_id,
            MessageMeta::unrouted(outcome, &envelope),
        )
        .with_content(sentinel);
        self.store.append(&record).await?;

        let event = match outcome {
            RoutingOutcome::Blocked => "message.blocked",
            _ => "message.dropped",
        };
        self.log
            .log(
                event,
                json!({
                    "correlationId": correlation_id,
                    "channelId": envelope.channel_id,
                    "sourceId": envelope.source_id,
                    "senderId": envelope.sender_id,
                }),
            )
            .await;
        info!(
            channel = %envelope.channel_id,
            source = %envelope.source_id,
            sender = %envelope.sender_id,
            correlation_id = %correlation_id,
            outcome = event,
            "inbound message not routed"
        );

        Ok(Dispatch {
            correlation_id,
            outcome,
            mode: None,
            outbound: None,
        })
    }
}

/// Build the backend prompt: a labelled history block, then the latest message.
#[must_use]
pub fn build_prompt(envelope: &InboundEnvelope) -> String {
    if envelope.history.is_empty() {
        return envelope.content.clone();
    }
    let skip = envelope.history.len().saturating_sub(MAX_HISTORY_TURNS);
    let mut prompt = String::from("[history]\n");
    for turn in envelope.history.iter().skip(skip) {
        let _ = writeln!(prompt, "{}: {}", turn.speaker, turn.content);
    }
    prompt.push_str("[/history]\n\n");
    let _ = write!(prompt, "{}: {}", envelope.sender_label(), envelope.content);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::config::{ChannelConfig, GroupConfig, GroupSource};
    use crate::envelope::{Direction, HistoryTurn};
    use crate::logsink::Redactor;
    use crate::store::MemoryMessageStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ObservationalHandler for Counting {
        async fn on_observational(&self, envelope: &InboundEnvelope, route: &Route, _: &CorrelationId) {
            assert_eq!(envelope.content, "fyi");
            assert_eq!(route.group_id.as_deref(), Some("eng"));
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config
            .channels
            .insert("telegram".into(), ChannelConfig::default());
        config.groups.insert(
            "eng".into(),
            GroupConfig {
                sources: vec![GroupSource {
                    channel: "slack".into(),
                    sources: vec![],
                }],
                allow_from: vec!["alice".into()],
                mode: MessageMode::Observational,
                ..GroupConfig::default()
            },
        );
        config
    }

    fn router(store: Arc<MemoryMessageStore>) -> Router {
        Router::new(
            Arc::new(config()),
            store,
            EventBus::new(),
            Arc::new(LogSink::disabled(Redactor::new())),
        )
    }

    #[tokio::test]
    async fn test_conversational_roundtrip_with_mock_reply() {
        let store = Arc::new(MemoryMessageStore::new());
        let router = router(store.clone()).with_mock_reply(Some("pong".into()));

        let out = router
            .handle_inbound(InboundEnvelope::new("telegram", "chat-1", "u1", "hello"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.content, "pong");
        assert_eq!(out.source_id, "chat-1");

        let records = store.recent(None, 10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].direction, Direction::Inbound);
        assert_eq!(records[1].direction, Direction::Outbound);
        assert_eq!(records[0].correlation_id, records[1].correlation_id);
        assert_eq!(records[0].correlation_id, out.correlation_id);
    }

    #[tokio::test]
    async fn test_unmatched_group_is_dropped() {
        let store = Arc::new(MemoryMessageStore::new());
        let router = router(store.clone()).with_mock_reply(Some("pong".into()));
        let mut events = router.bus.subscribe();

        let dispatch = router
            .dispatch(InboundEnvelope::new("telegram", "room", "u1", "hi").in_group())
            .await
            .unwrap();
        assert_eq!(dispatch.outcome, RoutingOutcome::Dropped);
        assert!(dispatch.outbound.is_none());

        let records = store.recent(None, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, DROPPED_SENTINEL);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disallowed_sender_is_blocked() {
        let store = Arc::new(MemoryMessageStore::new());
        let router = router(store.clone());

        let dispatch = router
            .dispatch(InboundEnvelope::new("slack", "C1", "mallory", "hi"))
            .await
            .unwrap();
        assert_eq!(dispatch.outcome, RoutingOutcome::Blocked);

        let records = store.recent(None, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, BLOCKED_SENTINEL);
        assert_eq!(records[0].direction, Direction::Inbound);
        assert_eq!(records[0].channel_id, "slack");
        assert_eq!(records[0].source_id, "C1");
        assert_eq!(records[0].meta.outcome, RoutingOutcome::Blocked);
    }

    #[tokio::test]
    async fn test_observational_invokes_handler_once() {
        let store = Arc::new(MemoryMessageStore::new());
        let handler = Arc::new(Counting::default());
        let router = router(store.clone()).with_observational(handler.clone());

        let out = router
            .handle_inbound(InboundEnvelope::new("slack", "C1", "alice", "fyi"))
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.recent(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_backend_errors_after_persisting() {
        let store = Arc::new(MemoryMessageStore::new());
        let router = router(store.clone());

        let err = router
            .handle_inbound(InboundEnvelope::new("telegram", "chat-1", "u1", "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Backend(BackendError::Disabled)));
        assert_eq!(store.recent(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backend_reply_and_bus_order() {
        let store = Arc::new(MemoryMessageStore::new());
        let router = router(store).with_backend(Some(Arc::new(MockBackend::new())));
        let mut events = router.bus.subscribe();

        let out = router
            .handle_inbound(InboundEnvelope::new("telegram", "chat-1", "u1", "hello"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.content, "echo: hello");
        assert_eq!(events.recv().await.unwrap().kind(), "inbound_message");
        assert_eq!(events.recv().await.unwrap().kind(), "outbound_message");
    }

    #[tokio::test]
    async fn test_missing_fields_rejected() {
        let router = router(Arc::new(MemoryMessageStore::new()));
        let err = router
            .dispatch(InboundEnvelope::new("telegram", "chat-1", "", "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn test_build_prompt_with_history() {
        let env = InboundEnvelope::new("telegram", "chat-1", "u1", "and now?")
            .with_sender_name("Ana")
            .with_history(vec![
                HistoryTurn::new("Ana", "first"),
                HistoryTurn::new("assistant", "second"),
            ]);
        let prompt = build_prompt(&env);
        assert_eq!(
            prompt,
            "[history]\nAna: first\nassistant: second\n[/history]\n\nAna: and now?"
        );
        assert_eq!(build_prompt(&InboundEnvelope::new("a", "b", "c", "plain")), "plain");
    }
}
