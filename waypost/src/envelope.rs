//! Canonical message envelopes.
//!
//! Every channel adapter normalizes its provider payloads into an
//! [`InboundEnvelope`]; the router answers conversational traffic with an
//! [`OutboundEnvelope`] that the adapter delivers back to the provider.

use crate::util::timestamp_ms;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on history turns carried into a single prompt.
pub const MAX_HISTORY_TURNS: usize = 20;

/// Operating mode of an inbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageMode {
    /// Answered by the reasoning backend.
    #[default]
    Conversational,
    /// Captured into memory, never answered.
    Observational,
}

impl MessageMode {
    /// Get the string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Conversational => "conversational",
            Self::Observational => "observational",
        }
    }
}

/// Direction of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Channel to gateway.
    Inbound,
    /// Gateway to channel.
    Outbound,
}

/// Opaque token threading one logical exchange through every record it produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh correlation id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Use the adapter-supplied id when present and non-blank, otherwise generate one.
    #[must_use]
    pub fn resolve(supplied: Option<&str>) -> Self {
        match supplied.map(str::trim) {
            Some(id) if !id.is_empty() => Self(id.to_string()),
            _ => Self::generate(),
        }
    }

    /// Borrow the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One prior turn of conversation supplied by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryTurn {
    /// Who spoke: a sender name, or "assistant".
    pub speaker: String,
    /// What was said.
    pub content: String,
}

impl HistoryTurn {
    /// Create a history turn.
    #[must_use]
    pub fn new(speaker: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
            content: content.into(),
        }
    }
}

/// A message from a channel into the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEnvelope {
    /// Channel identifier (e.g. "telegram", "webhook", "http").
    pub channel_id: String,
    /// Conversation/thread identity within the channel.
    pub source_id: String,
    /// Sender's identifier within the channel.
    pub sender_id: String,
    /// Sender display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Message text content.
    pub content: String,
    /// Unix milliseconds.
    #[serde(default = "timestamp_ms")]
    pub timestamp: u64,
    /// Whether the message was posted in a group context.
    #[serde(default)]
    pub is_group: bool,
    /// Mode override; the route default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<MessageMode>,
    /// Provider thread id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Adapter-supplied correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Opaque provider metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
    /// Prior turns, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryTurn>,
}

impl InboundEnvelope {
    /// Create a new inbound envelope with minimal required fields.
    pub fn new(
        channel_id: impl Into<String>,
        source_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            source_id: source_id.into(),
            sender_id: sender_id.into(),
            sender_name: None,
            content: content.into(),
            timestamp: timestamp_ms(),
            is_group: false,
            mode: None,
            thread_id: None,
            correlation_id: None,
            raw: None,
            history: Vec::new(),
        }
    }

    /// Set the sender display name.
    #[must_use]
    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }

    /// Mark as posted in a group context.
    #[must_use]
    pub const fn in_group(mut self) -> Self {
        self.is_group = true;
        self
    }

    /// Override the operating mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: MessageMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set the thread id.
    #[must_use]
    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the timestamp (Unix milliseconds).
    #[must_use]
    pub const fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach provider metadata.
    #[must_use]
    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Attach prior turns, oldest first.
    #[must_use]
    pub fn with_history(mut self, history: Vec<HistoryTurn>) -> Self {
        self.history = history;
        self
    }

    /// Check the fields every adapter must fill in.
    ///
    /// # Errors
    ///
    /// Returns the name of the first blank required field.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.channel_id.trim().is_empty() {
            return Err("channelId");
        }
        if self.source_id.trim().is_empty() {
            return Err("sourceId");
        }
        if self.sender_id.trim().is_empty() {
            return Err("senderId");
        }
        Ok(())
    }

    /// Display name of the sender, falling back to the sender id.
    #[must_use]
    pub fn sender_label(&self) -> &str {
        self.sender_name.as_deref().unwrap_or(&self.sender_id)
    }
}

/// A reply from the gateway to a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEnvelope {
    /// Target channel identifier.
    pub channel_id: String,
    /// Target conversation within the channel.
    pub source_id: String,
    /// Provider thread id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Correlation id of the exchange this reply belongs to.
    pub correlation_id: CorrelationId,
    /// Reply text.
    pub content: String,
    /// Provider fields echoed back to the adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl OutboundEnvelope {
    /// Create a reply to an inbound envelope, echoing its addressing and raw metadata.
    pub fn reply_to(
        inbound: &InboundEnvelope,
        correlation_id: CorrelationId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: inbound.channel_id.clone(),
            source_id: inbound.source_id.clone(),
            thread_id: inbound.thread_id.clone(),
            correlation_id,
            content: content.into(),
            raw: inbound.raw.clone(),
        }
    }
}
