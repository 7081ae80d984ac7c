//! Message persistence.
//!
//! Every envelope the router sees, including dropped and blocked ones, ends up
//! here as a [`StoredMessage`]. Two backends are provided: an in-memory store
//! for tests and embedding, and an append-only JSON-lines file.

use crate::envelope::{CorrelationId, Direction, InboundEnvelope, MessageMode, OutboundEnvelope};
use crate::error::StorageResult;
use crate::routing::SessionKey;
use crate::util::generate_message_id;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Terminal outcome of routing an inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingOutcome {
    /// Routed and processed.
    Accepted,
    /// No route matched.
    Dropped,
    /// Sender not on the route's allow-list.
    Blocked,
}

/// Routing metadata attached to a stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    /// Group the message was routed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Session the message was routed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<SessionKey>,
    /// Routing outcome.
    pub outcome: RoutingOutcome,
    /// Effective mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<MessageMode>,
    /// Provider thread id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Provider metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl MessageMeta {
    /// Metadata for an unrouted envelope.
    #[must_use]
    pub fn unrouted(outcome: RoutingOutcome, envelope: &InboundEnvelope) -> Self {
        Self {
            group_id: None,
            session_key: None,
            outcome,
            mode: envelope.mode,
            thread_id: envelope.thread_id.clone(),
            raw: envelope.raw.clone(),
        }
    }
}

/// A persisted message record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Record id.
    pub id: String,
    /// Inbound or outbound.
    pub direction: Direction,
    /// Channel id.
    pub channel_id: String,
    /// Source id.
    pub source_id: String,
    /// Sender id; `assistant` for replies.
    pub sender_id: String,
    /// Sender display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Text content (or a sentinel for dropped/blocked records).
    pub content: String,
    /// Unix milliseconds.
    pub timestamp: u64,
    /// Correlation id of the exchange.
    pub correlation_id: CorrelationId,
    /// Routing metadata.
    pub meta: MessageMeta,
}

impl StoredMessage {
    /// Record an inbound envelope.
    #[must_use]
    pub fn inbound(envelope: &InboundEnvelope, correlation_id: &CorrelationId, meta: MessageMeta) -> Self {
        Self {
            id: generate_message_id(),
            direction: Direction::Inbound,
            channel_id: envelope.channel_id.clone(),
            source_id: envelope.source_id.clone(),
            sender_id: envelope.sender_id.clone(),
            sender_name: envelope.sender_name.clone(),
            content: envelope.content.clone(),
            timestamp: envelope.timestamp,
            correlation_id: correlation_id.clone(),
            meta,
        }
    }

    /// Record an outbound reply.
    #[must_use]
    pub fn outbound(envelope: &OutboundEnvelope, meta: MessageMeta) -> Self {
        Self {
            id: generate_message_id(),
            direction: Direction::Outbound,
            channel_id: envelope.channel_id.clone(),
            source_id: envelope.source_id.clone(),
            sender_id: "assistant".to_string(),
            sender_name: None,
            content: envelope.content.clone(),
            timestamp: crate::util::timestamp_ms(),
            correlation_id: envelope.correlation_id.clone(),
            meta,
        }
    }

    /// Replace the content, e.g. with a drop/block sentinel.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }
}

/// Durable message persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a record.
    async fn append(&self, message: &StoredMessage) -> StorageResult<()>;

    /// Most recent `limit` records, optionally for one channel, oldest first.
    async fn recent(&self, channel_id: Option<&str>, limit: usize) -> StorageResult<Vec<StoredMessage>>;

    /// Most recent `limit` inbound records at or after `since_ms`, oldest first.
    async fn recent_inbound(&self, since_ms: u64, limit: usize) -> StorageResult<Vec<StoredMessage>> {
        let all = self.recent(None, usize::MAX).await?;
        Ok(tail(
            all.into_iter()
                .filter(|m| m.direction == Direction::Inbound && m.timestamp >= since_ms)
                .collect(),
            limit,
        ))
    }
}

fn tail<T>(mut items: Vec<T>, limit: usize) -> Vec<T> {
    if items.len() > limit {
        items.drain(..items.len() - limit);
    }
    items
}

fn filter_recent(items: impl Iterator<Item = StoredMessage>, channel_id: Option<&str>, limit: usize) -> Vec<StoredMessage> {
    tail(
        items
            .filter(|m| channel_id.is_none_or(|c| m.channel_id == c))
            .collect(),
        limit,
    )
}

/// In-memory message store.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    messages: RwLock<Vec<StoredMessage>>,
}

impl MemoryMessageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: &StoredMessage) -> StorageResult<()> {
        self.messages.write().await.push(message.clone());
        Ok(())
    }

    async fn recent(&self, channel_id: Option<&str>, limit: usize) -> StorageResult<Vec<StoredMessage>> {
        let messages = self.messages.read().await;
        Ok(filter_recent(messages.iter().cloned(), channel_id, limit))
    }
}

/// Append-only JSON-lines message store.
#[derive(Debug)]
pub struct JsonlMessageStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlMessageStore {
    /// Create a store backed by `path`; the file is created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MessageStore for JsonlMessageStore {
    async fn append(&self, message: &StoredMessage) -> StorageResult<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        append_line(&self.path, &line).await
    }

    async fn recent(&self, channel_id: Option<&str>, limit: usize) -> StorageResult<Vec<StoredMessage>> {
        let records = read_jsonl::<StoredMessage>(&self.path).await?;
        Ok(filter_recent(records.into_iter(), channel_id, limit))
    }
}

/// Append one line to a file, creating it and its parent directory if needed.
pub(crate) async fn append_line(path: &Path, line: &str) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Read every well-formed record of a JSON-lines file; a missing file is empty.
pub(crate) async fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> StorageResult<Vec<T>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), line = index + 1, error = %e, "skipping malformed record"),
        }
    }
    debug!(path = %path.display(), count = records.len(), "loaded records");
    Ok(records)
}
