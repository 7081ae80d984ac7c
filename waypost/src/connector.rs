//! Connector service: signed webhook pushes from an ontology source.
//!
//! The connector verifies an HMAC-SHA256 signature over the raw request body,
//! answers subscription verification handshakes, and turns every other event
//! into an [`InboundEnvelope`] (observational by default) for the router.

use crate::config::ConnectorConfig;
use crate::envelope::InboundEnvelope;
use crate::error::{GatewayError, Result};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// What a connector push turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    /// Subscription handshake; echo the token back.
    Verification(String),
    /// A regular event to route.
    Message(Box<InboundEnvelope>),
}

/// Compute the hex HMAC-SHA256 of `body` under `secret`.
///
/// # Errors
///
/// Returns an error if the key is rejected by the MAC.
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::internal(format!("invalid HMAC key: {e}")))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Connector bound to one configuration.
#[derive(Debug, Clone)]
pub struct ConnectorService {
    config: ConnectorConfig,
}

impl ConnectorService {
    /// Create a connector service.
    #[must_use]
    pub const fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }

    /// Connector configuration.
    #[must_use]
    pub const fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Verify the signature header against the raw body.
    ///
    /// Accepts plain hex or `sha256=<hex>`. Passes when no secret is set.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Unauthorized`] if the signature is missing or wrong.
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> Result<()> {
        let Some(secret) = self.config.signing_secret.as_deref() else {
            return Ok(());
        };
        let signature = signature
            .ok_or_else(|| GatewayError::Unauthorized("missing signature".to_string()))?;
        let hex_sig = signature.trim().trim_start_matches("sha256=");
        let expected = hex::decode(hex_sig)
            .map_err(|_| GatewayError::Unauthorized("malformed signature".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| GatewayError::internal(format!("invalid HMAC key: {e}")))?;
        mac.update(body);
        mac.verify_slice(&expected)
            .map_err(|_| GatewayError::Unauthorized("signature mismatch".to_string()))
    }

    /// Interpret a verified payload.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the body is not a JSON object.
    pub fn interpret(&self, payload: Value) -> Result<ConnectorEvent> {
        if !payload.is_object() {
            return Err(GatewayError::invalid("connector payload must be a JSON object"));
        }
        if let Some(token) = payload.get("verification_token").and_then(Value::as_str) {
            return Ok(ConnectorEvent::Verification(token.to_string()));
        }

        let event_type = str_at(&payload, &["type"]).unwrap_or("event");
        let entity_id = str_at(&payload, &["entity", "id"])
            .or_else(|| str_at(&payload, &["id"]))
            .unwrap_or("unknown");
        let title = str_at(&payload, &["data", "title"])
            .or_else(|| str_at(&payload, &["data", "name"]))
            .unwrap_or(entity_id);
        let sender = str_at(&payload, &["authors", "0", "id"]).unwrap_or(self.config.name.as_str());

        let mut envelope = InboundEnvelope::new(
            &self.config.channel_id,
            entity_id,
            sender,
            format!("{event_type}: {title}"),
        )
        .with_mode(self.config.mode);
        if let Some(id) = str_at(&payload, &["id"]) {
            envelope = envelope.with_correlation_id(id);
        }
        if let Some(ts) = str_at(&payload, &["timestamp"])
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .and_then(|t| u64::try_from(t.timestamp_millis()).ok())
        {
            envelope = envelope.at(ts);
        }

        debug!(connector = %self.config.name, event_type, entity_id, "connector event interpreted");
        Ok(ConnectorEvent::Message(Box::new(envelope.with_raw(payload))))
    }
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for segment in path {
        current = match segment.parse::<usize>() {
            Ok(index) => current.get(index)?,
            Err(_) => current.get(*segment)?,
        };
    }
    current.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageMode;
    use serde_json::json;

    fn service(secret: Option<&str>) -> ConnectorService {
        ConnectorService::new(ConnectorConfig {
            signing_secret: secret.map(String::from),
            ..ConnectorConfig::default()
        })
    }

    #[test]
    fn test_verify_signature() {
        let svc = service(Some("s3cret"));
        let body = br#"{"type":"page.created"}"#;
        let sig = sign("s3cret", body).unwrap();

        assert!(svc.verify(body, Some(&sig)).is_ok());
        assert!(svc.verify(body, Some(&format!("sha256={sig}"))).is_ok());
        assert!(matches!(svc.verify(body, None), Err(GatewayError::Unauthorized(_))));
        assert!(svc.verify(b"tampered", Some(&sig)).is_err());
        assert!(svc.verify(body, Some("zz")).is_err());
    }

    #[test]
    fn test_no_secret_skips_verification() {
        assert!(service(None).verify(b"anything", None).is_ok());
    }

    #[test]
    fn test_interpret_event() {
        let event = service(None)
            .interpret(json!({
                "id": "evt-1",
                "type": "page.updated",
                "timestamp": "2024-05-01T10:00:00Z",
                "entity": {"id": "page-9", "type": "page"},
                "authors": [{"id": "user-3"}],
                "data": {"title": "Roadmap"}
            }))
            .unwrap();
        let ConnectorEvent::Message(envelope) = event else {
            panic!("expected message");
        };
        assert_eq!(envelope.channel_id, "notion");
        assert_eq!(envelope.source_id, "page-9");
        assert_eq!(envelope.sender_id, "user-3");
        assert_eq!(envelope.content, "page.updated: Roadmap");
        assert_eq!(envelope.mode, Some(MessageMode::Observational));
        assert_eq!(envelope.correlation_id.as_deref(), Some("evt-1"));
        assert_eq!(envelope.timestamp, 1_714_557_600_000);
    }

    #[test]
    fn test_interpret_verification() {
        let event = service(None)
            .interpret(json!({"verification_token": "abc"}))
            .unwrap();
        assert_eq!(event, ConnectorEvent::Verification("abc".into()));
        assert!(service(None).interpret(json!([1, 2])).is_err());
    }
}
