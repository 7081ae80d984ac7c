//! Bearer token and tool policy checks.

use super::error::ApiError;
use crate::config::GatewayConfig;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use std::collections::HashMap;
use subtle::ConstantTimeEq;

/// Header carrying a client idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

fn matches(candidate: &str, expected: &str) -> bool {
    bool::from(candidate.as_bytes().ct_eq(expected.as_bytes()))
}

/// Check the ingest token from `Authorization: Bearer` or `?token=`.
///
/// Passes when no token is configured.
///
/// # Errors
///
/// Returns 401 if a token is configured and neither source carries it.
pub fn authorize(
    config: &GatewayConfig,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<(), ApiError> {
    let Some(expected) = config.server.ingest_token.as_deref() else {
        return Ok(());
    };

    if let Some(value) = headers.get(AUTHORIZATION)
        && let Ok(value) = value.to_str()
        && let Some(token) = value.strip_prefix("Bearer ")
        && matches(token.trim(), expected)
    {
        return Ok(());
    }

    if let Some(token) = query.get("token")
        && matches(token, expected)
    {
        return Ok(());
    }

    Err(ApiError::unauthorized("invalid or missing token"))
}

/// Check the tool policy for `tool`.
///
/// # Errors
///
/// Returns 403 `blocked` if the policy denies the tool.
pub fn permit(config: &GatewayConfig, tool: &str) -> Result<(), ApiError> {
    if config.tools.is_allowed(tool) {
        Ok(())
    } else {
        Err(ApiError::blocked(tool))
    }
}

/// Idempotency key from the request headers, if any.
#[must_use]
pub fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}
