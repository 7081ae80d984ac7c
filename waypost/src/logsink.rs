//! Audit log sink with secret redaction.
//!
//! The sink writes one JSON line per routing event to `logs/gateway.jsonl`.
//! Each line passes through a [`Redactor`] built from the live
//! configuration's secrets, so rotating a token and reloading also changes
//! what gets masked.

use crate::store::append_line;
use crate::util::timestamp_ms;
use regex::Regex;
use serde::Serialize;
use std::borrow::Cow;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Replacement for configured secret values.
const SECRET_REPLACEMENT: &str = "[REDACTED]";

/// Built-in patterns: bearer headers and common API key shapes.
const DEFAULT_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)bearer\s+[A-Za-z0-9._~+/=-]{8,}", "Bearer [REDACTED]"),
    (r"\bsk-[A-Za-z0-9_-]{16,}", "[REDACTED_API_KEY]"),
    (r"\bxox[abprs]-[A-Za-z0-9-]{10,}", "[REDACTED_TOKEN]"),
];

struct CompiledPattern {
    regex: Regex,
    replacement: String,
}

/// Masks secrets in strings.
pub struct Redactor {
    patterns: Vec<CompiledPattern>,
}

impl std::fmt::Debug for Redactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redactor")
            .field("patterns", &self.patterns.len())
            .finish()
    }
}

impl Redactor {
    /// Redactor with only the built-in patterns.
    #[must_use]
    pub fn new() -> Self {
        let patterns = DEFAULT_PATTERNS
            .iter()
            .filter_map(|(pattern, replacement)| {
                Regex::new(pattern).ok().map(|regex| CompiledPattern {
                    regex,
                    replacement: (*replacement).to_string(),
                })
            })
            .collect();
        Self { patterns }
    }

    /// Redactor that also masks each literal in `secrets`.
    #[must_use]
    pub fn with_secrets<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut redactor = Self::new();
        for secret in secrets {
            redactor = redactor.with_literal(secret.as_ref());
        }
        redactor
    }

    /// Mask occurrences of `secret`. Blank values are ignored.
    #[must_use]
    pub fn with_literal(mut self, secret: &str) -> Self {
        if secret.trim().is_empty() {
            return self;
        }
        match Regex::new(&regex::escape(secret)) {
            Ok(regex) => self.patterns.push(CompiledPattern {
                regex,
                replacement: SECRET_REPLACEMENT.to_string(),
            }),
            Err(e) => warn!(error = %e, "failed to compile redaction literal"),
        }
        self
    }

    /// Redact `input`; borrows when nothing matches.
    #[must_use]
    pub fn redact<'a>(&self, input: &'a str) -> Cow<'a, str> {
        if !self.patterns.iter().any(|p| p.regex.is_match(input)) {
            return Cow::Borrowed(input);
        }
        let mut result = input.to_string();
        for pattern in &self.patterns {
            if let Cow::Owned(replaced) = pattern
                .regex
                .replace_all(&result, regex::NoExpand(pattern.replacement.as_str()))
            {
                result = replaced;
            }
        }
        Cow::Owned(result)
    }

    /// Number of compiled patterns.
    #[must_use]
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogLine<'a> {
    ts: u64,
    event: &'a str,
    #[serde(flatten)]
    fields: serde_json::Value,
}

/// JSON-lines audit log.
#[derive(Debug)]
pub struct LogSink {
    path: Option<PathBuf>,
    redactor: Redactor,
}

impl LogSink {
    /// Sink writing to `path`.
    pub fn new(path: impl Into<PathBuf>, redactor: Redactor) -> Self {
        Self {
            path: Some(path.into()),
            redactor,
        }
    }

    /// Sink that only redacts and traces.
    #[must_use]
    pub fn disabled(redactor: Redactor) -> Self {
        Self {
            path: None,
            redactor,
        }
    }

    /// The sink's redactor.
    #[must_use]
    pub const fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Record an event. Write failures are traced, never returned.
    pub async fn log(&self, event: &str, fields: serde_json::Value) {
        let line = LogLine {
            ts: timestamp_ms(),
            event,
            fields,
        };
        let serialized = match serde_json::to_string(&line) {
            Ok(s) => s,
            Err(e) => {
                warn!(event, error = %e, "failed to serialize log line");
                return;
            }
        };
        let mut redacted = self.redactor.redact(&serialized).into_owned();
        debug!(target: "waypost::audit", "{redacted}");

        if let Some(path) = &self.path {
            redacted.push('\n');
            if let Err(e) = append_line(path, &redacted).await {
                warn!(path = %path.display(), error = %e, "failed to write audit log");
            }
        }
    }
}
