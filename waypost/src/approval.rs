//! Approval bridge: renders a templated message from request variables and
//! feeds it into the gateway as an ordinary inbound envelope.

use crate::config::ServerConfig;
use crate::envelope::InboundEnvelope;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").ok());

/// Render `{{name}}` placeholders from `vars`. Missing names render empty;
/// non-string values render as JSON.
#[must_use]
pub fn render_template(template: &str, vars: &Map<String, Value>) -> String {
    let Some(placeholder) = PLACEHOLDER.as_ref() else {
        return template.to_string();
    };
    placeholder
        .replace_all(template, |caps: &Captures<'_>| match vars.get(&caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        })
        .into_owned()
}

/// Build the inbound envelope for an approval request.
#[must_use]
pub fn approval_envelope(server: &ServerConfig, vars: Map<String, Value>) -> InboundEnvelope {
    let content = render_template(&server.approve_template, &vars);
    let approver = vars
        .get("approver")
        .and_then(Value::as_str)
        .unwrap_or("approver")
        .to_string();
    let mut envelope = InboundEnvelope::new(
        &server.approve_channel,
        &server.approve_source,
        approver,
        content,
    );
    if let Some(id) = vars.get("id").and_then(Value::as_str) {
        envelope = envelope.with_correlation_id(id);
    }
    envelope.with_raw(Value::Object(vars))
}
