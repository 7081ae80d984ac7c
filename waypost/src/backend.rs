//! Reasoning backend collaborator.
//!
//! The gateway never reasons itself; it hands a session key and a prompt to a
//! [`ReasoningBackend`] and relays whatever text comes back.

use crate::config::{BackendConfig, BackendKind};
use crate::envelope::CorrelationId;
use crate::error::{BackendError, BackendResult};
use crate::routing::{BusyPolicy, SessionKey};
use crate::util::truncate_str;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Per-call options.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// How to treat a session that is already busy.
    pub busy_policy: BusyPolicy,
    /// Correlation id of the exchange.
    pub correlation_id: CorrelationId,
}

impl CallOptions {
    /// Create call options.
    #[must_use]
    pub const fn new(busy_policy: BusyPolicy, correlation_id: CorrelationId) -> Self {
        Self {
            busy_policy,
            correlation_id,
        }
    }
}

/// The pluggable "brain".
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Backend name for logs and status.
    fn name(&self) -> &str;

    /// Produce a reply for `prompt` in the context of `session`.
    async fn invoke(
        &self,
        session: &SessionKey,
        prompt: &str,
        options: &CallOptions,
    ) -> BackendResult<String>;
}

/// Serializes calls per session according to the busy policy.
#[derive(Debug, Default)]
pub struct SessionGate {
    sessions: Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
}

impl SessionGate {
    /// Create an empty gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter `session`.
    ///
    /// `queue` waits for the running turn, `drop` fails with
    /// [`BackendError::Busy`] if one is running, `interrupt` never waits.
    pub async fn enter(
        &self,
        session: &SessionKey,
        policy: BusyPolicy,
    ) -> BackendResult<Option<OwnedMutexGuard<()>>> {
        let lock = {
            let mut sessions = self.sessions.lock().await;
            Arc::clone(sessions.entry(session.clone()).or_default())
        };
        match policy {
            BusyPolicy::Queue => Ok(Some(lock.lock_owned().await)),
            BusyPolicy::Drop => lock
                .try_lock_owned()
                .map(Some)
                .map_err(|_| BackendError::Busy(session.to_string())),
            BusyPolicy::Interrupt => Ok(None),
        }
    }
}

/// In-process backend that echoes the prompt back.
#[derive(Debug, Default)]
pub struct MockBackend {
    gate: SessionGate,
    reply: Option<String>,
}

impl MockBackend {
    /// Create an echoing backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Always reply with `reply`.
    #[must_use]
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }
}

#[async_trait]
impl ReasoningBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn invoke(
        &self,
        session: &SessionKey,
        prompt: &str,
        options: &CallOptions,
    ) -> BackendResult<String> {
        let _turn = self.gate.enter(session, options.busy_policy).await?;
        debug!(session = %session, correlation_id = %options.correlation_id, "mock backend invoked");
        Ok(self
            .reply
            .clone()
            .unwrap_or_else(|| format!("echo: {prompt}")))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpBackendRequest<'a> {
    session_key: &'a SessionKey,
    prompt: &'a str,
    correlation_id: &'a CorrelationId,
    busy_policy: BusyPolicy,
}

#[derive(Deserialize)]
struct HttpBackendResponse {
    reply: String,
}

/// JSON-over-HTTP backend.
///
/// POSTs `{sessionKey, prompt, correlationId, busyPolicy}` and expects
/// `{"reply": "..."}` back.
#[derive(Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    gate: SessionGate,
}

impl HttpBackend {
    /// Create a backend posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            api_key: None,
            gate: SessionGate::new(),
        })
    }

    /// Send `api_key` as a bearer token.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[async_trait]
impl ReasoningBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn invoke(
        &self,
        session: &SessionKey,
        prompt: &str,
        options: &CallOptions,
    ) -> BackendResult<String> {
        let _turn = self.gate.enter(session, options.busy_policy).await?;

        let body = HttpBackendRequest {
            session_key: session,
            prompt,
            correlation_id: &options.correlation_id,
            busy_policy: options.busy_policy,
        };
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            warn!(session = %session, status, "backend returned error status");
            return Err(BackendError::Status {
                status,
                body: truncate_str(&body, 500),
            });
        }

        let parsed: HttpBackendResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        info!(
            session = %session,
            correlation_id = %options.correlation_id,
            reply_len = parsed.reply.len(),
            "backend replied"
        );
        Ok(parsed.reply)
    }
}

/// Build the configured backend, or `None` when disabled.
///
/// # Errors
///
/// Returns an error if an `http` backend has no URL or its client fails to build.
pub fn build_backend(config: &BackendConfig) -> BackendResult<Option<Arc<dyn ReasoningBackend>>> {
    if !config.enabled {
        return Ok(None);
    }
    let backend: Arc<dyn ReasoningBackend> = match config.kind {
        BackendKind::Mock => Arc::new(MockBackend::new()),
        BackendKind::Http => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| BackendError::Request("backend.url is not set".to_string()))?;
            let mut backend = HttpBackend::new(url, Duration::from_secs(config.timeout_secs))?;
            if let Some(key) = &config.api_key {
                backend = backend.with_api_key(key);
            }
            Arc::new(backend)
        }
    };
    Ok(Some(backend))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(policy: BusyPolicy) -> CallOptions {
        CallOptions::new(policy, CorrelationId::generate())
    }

    #[tokio::test]
    async fn test_mock_backend_echo_and_reply() {
        let session = SessionKey::for_source("telegram", "chat-1");
        let echo = MockBackend::new();
        assert_eq!(
            echo.invoke(&session, "hi", &options(BusyPolicy::Queue)).await.unwrap(),
            "echo: hi"
        );

        let fixed = MockBackend::new().with_reply("pong");
        assert_eq!(
            fixed.invoke(&session, "hi", &options(BusyPolicy::Queue)).await.unwrap(),
            "pong"
        );
    }

    #[tokio::test]
    async fn test_gate_drop_policy_rejects_busy_session() {
        let gate = SessionGate::new();
        let session = SessionKey::for_group("eng");

        let held = gate.enter(&session, BusyPolicy::Queue).await.unwrap();
        assert!(held.is_some());
        assert!(matches!(
            gate.enter(&session, BusyPolicy::Drop).await,
            Err(BackendError::Busy(_))
        ));
        assert!(gate.enter(&session, BusyPolicy::Interrupt).await.unwrap().is_none());

        drop(held);
        assert!(gate.enter(&session, BusyPolicy::Drop).await.unwrap().is_some());
    }

    #[test]
    fn test_build_backend() {
        assert!(build_backend(&BackendConfig::default()).unwrap().is_none());

        let config = BackendConfig {
            enabled: true,
            ..BackendConfig::default()
        };
        assert_eq!(build_backend(&config).unwrap().unwrap().name(), "mock");

        let config = BackendConfig {
            enabled: true,
            kind: BackendKind::Http,
            ..BackendConfig::default()
        };
        assert!(build_backend(&config).is_err());
    }
}
