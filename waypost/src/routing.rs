//! Session keys and route resolution.
//!
//! A [`Route`] tells the router which session an inbound envelope belongs to,
//! who may talk on it, and how the reasoning backend should treat it. Routes
//! are derived from configuration alone; nothing here touches runtime state.

use crate::config::GatewayConfig;
use crate::envelope::{InboundEnvelope, MessageMode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one conversation context for the reasoning backend.
///
/// Only constructible through [`SessionKey::for_source`] and
/// [`SessionKey::for_group`], so every key in the system has one of two shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionKey(String);

/// Prefix of group session keys.
const GROUP_PREFIX: &str = "group:";

impl SessionKey {
    /// Session of a single conversation: `<channel>:<source>`.
    #[must_use]
    pub fn for_source(channel: &str, source: &str) -> Self {
        Self(format!("{channel}:{source}"))
    }

    /// Session shared by every source of a group: `group:<group>`.
    #[must_use]
    pub fn for_group(group: &str) -> Self {
        Self(format!("{GROUP_PREFIX}{group}"))
    }

    /// Parse a key received from outside (job definitions, RPC params).
    ///
    /// Returns `None` unless the text has one of the two canonical shapes.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(group) = raw.strip_prefix(GROUP_PREFIX) {
            return (!group.is_empty()).then(|| Self::for_group(group));
        }
        let (channel, source) = raw.split_once(':')?;
        (!channel.is_empty() && !source.is_empty()).then(|| Self::for_source(channel, source))
    }

    /// Group id if this is a group session.
    #[must_use]
    pub fn group_id(&self) -> Option<&str> {
        self.0.strip_prefix(GROUP_PREFIX)
    }

    /// Borrow the key text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid session key '{raw}': expected '<channel>:<source>' or 'group:<id>'"
            ))
        })
    }
}

/// What happens when a message arrives while the session is still working.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Wait for the running turn to finish.
    #[default]
    Queue,
    /// Cancel the running turn in favour of the new message.
    Interrupt,
    /// Reject the new message.
    Drop,
}

impl BusyPolicy {
    /// Get the string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Interrupt => "interrupt",
            Self::Drop => "drop",
        }
    }
}

/// Resolved routing decision for one inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Group the envelope was matched to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Target session.
    pub session_key: SessionKey,
    /// Allowed sender ids; empty or `*` allows everyone.
    pub allow_from: Vec<String>,
    /// Default operating mode.
    pub mode: MessageMode,
    /// Busy policy.
    pub busy_policy: BusyPolicy,
}

impl Route {
    /// Check if a sender may use this route.
    #[must_use]
    pub fn allows(&self, sender: &str) -> bool {
        self.allow_from.is_empty() || self.allow_from.iter().any(|s| s == "*" || s == sender)
    }
}

/// Resolve the route for `envelope`.
///
/// Groups are tried in id order and the first whose sources include the
/// envelope's `(channel, source)` wins. Otherwise a direct route is produced
/// when the envelope is not in group context and its channel is known, enabled
/// and has `routeDirect` set.
#[must_use]
pub fn resolve_route(config: &GatewayConfig, envelope: &InboundEnvelope) -> Option<Route> {
    let channel = envelope.channel_id.as_str();
    let source = envelope.source_id.as_str();

    if let Some((id, group)) = config
        .groups
        .iter()
        .find(|(_, g)| g.matches(channel, source))
    {
        return Some(Route {
            group_id: Some(id.clone()),
            session_key: SessionKey::for_group(id),
            allow_from: group.allow_from.clone(),
            mode: group.mode,
            busy_policy: group.busy_policy,
        });
    }

    if envelope.is_group {
        return None;
    }

    let channel_config = config.channels.get(channel)?;
    if !channel_config.enabled || !channel_config.route_direct {
        return None;
    }

    Some(Route {
        group_id: None,
        session_key: SessionKey::for_source(channel, source),
        allow_from: channel_config.allow_from.clone(),
        mode: channel_config.mode,
        busy_policy: channel_config.busy_policy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, GroupConfig, GroupSource};

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config
            .channels
            .insert("telegram".into(), ChannelConfig::default());
        config.channels.insert(
            "slack".into(),
            ChannelConfig {
                route_direct: false,
                ..ChannelConfig::default()
            },
        );
        config.groups.insert(
            "eng".into(),
            GroupConfig {
                sources: vec![
                    GroupSource {
                        channel: "slack".into(),
                        sources: vec![],
                    },
                    GroupSource {
                        channel: "telegram".into(),
                        sources: vec!["team-chat".into()],
                    },
                ],
                allow_from: vec!["alice".into()],
                mode: MessageMode::Observational,
                ..GroupConfig::default()
            },
        );
        config
    }

    #[test]
    fn test_session_key_shapes() {
        assert_eq!(SessionKey::for_source("telegram", "chat-1").as_str(), "telegram:chat-1");
        assert_eq!(SessionKey::for_group("eng").as_str(), "group:eng");
        assert_eq!(SessionKey::for_group("eng").group_id(), Some("eng"));
        assert_eq!(SessionKey::for_source("a", "b").group_id(), None);
    }

    #[test]
    fn test_session_key_parse() {
        assert_eq!(SessionKey::parse("group:eng"), Some(SessionKey::for_group("eng")));
        assert_eq!(
            SessionKey::parse("telegram:chat-1"),
            Some(SessionKey::for_source("telegram", "chat-1"))
        );
        assert_eq!(SessionKey::parse("nocolon"), None);
        assert_eq!(SessionKey::parse("group:"), None);
        assert!(serde_json::from_str::<SessionKey>("\"bad\"").is_err());
    }

    #[test]
    fn test_direct_route() {
        let env = InboundEnvelope::new("telegram", "chat-1", "u1", "hello");
        let route = resolve_route(&config(), &env).unwrap();
        assert_eq!(route.group_id, None);
        assert_eq!(route.session_key.as_str(), "telegram:chat-1");
        assert!(route.allows("anyone"));
    }

    #[test]
    fn test_group_route_by_channel_and_source() {
        let cfg = config();

        let env = InboundEnvelope::new("slack", "C42", "alice", "hi");
        let route = resolve_route(&cfg, &env).unwrap();
        assert_eq!(route.group_id.as_deref(), Some("eng"));
        assert_eq!(route.session_key.as_str(), "group:eng");
        assert_eq!(route.mode, MessageMode::Observational);
        assert!(route.allows("alice"));
        assert!(!route.allows("mallory"));

        let env = InboundEnvelope::new("telegram", "team-chat", "alice", "hi");
        assert_eq!(resolve_route(&cfg, &env).unwrap().session_key.as_str(), "group:eng");
    }

    #[test]
    fn test_no_route() {
        let cfg = config();
        // Group context without a matching group.
        let env = InboundEnvelope::new("telegram", "other", "u1", "hi").in_group();
        assert!(resolve_route(&cfg, &env).is_none());
        // Unknown channel.
        let env = InboundEnvelope::new("discord", "x", "u1", "hi");
        assert!(resolve_route(&cfg, &env).is_none());
    }

    #[test]
    fn test_wildcard_allow() {
        let route = Route {
            group_id: None,
            session_key: SessionKey::for_source("a", "b"),
            allow_from: vec!["*".into()],
            mode: MessageMode::Conversational,
            busy_policy: BusyPolicy::Queue,
        };
        assert!(route.allows("anyone"));
    }
}
