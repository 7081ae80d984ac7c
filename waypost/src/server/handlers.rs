//! HTTP handlers.

use super::auth::{authorize, idempotency_key, permit};
use super::error::{ApiError, ApiResult};
use super::rpc::{self, MessagesParams, list_limit};
use crate::config::{ChannelConfig, GatewayConfig, GroupConfig};
use crate::envelope::InboundEnvelope;
use crate::error::GatewayError;
use crate::gateway::{ConfigSummary, Gateway, GatewayStatus};
use crate::idempotency::CachedResponse;
use crate::store::StoredMessage;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

type Params = Query<HashMap<String, String>>;

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::invalid(format!("bad request body: {e}")))
}

fn to_json<T: serde::Serialize>(value: T) -> ApiResult<Value> {
    serde_json::to_value(value).map_err(|e| ApiError::from(GatewayError::from(e)))
}

async fn live_config(gateway: &Gateway) -> Arc<GatewayConfig> {
    Arc::clone(&gateway.snapshot().await.config)
}

/// Run `operation` once per idempotency key; replay the cached body after.
async fn idempotent<F, Fut>(gateway: &Gateway, scope: &str, key: Option<String>, operation: F) -> Response
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ApiResult<Value>>,
{
    let outcome = gateway
        .run_once(scope, key.as_deref(), || async move {
            operation().await.map(|body| CachedResponse {
                status: StatusCode::OK.as_u16(),
                body,
            })
        })
        .await;
    match outcome {
        Ok(cached) => {
            let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
            (status, Json(cached.body)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// `GET /health`
pub async fn health(State(gateway): State<Gateway>) -> Json<Value> {
    Json(gateway.health())
}

/// `GET /status`
pub async fn status(State(gateway): State<Gateway>) -> ApiResult<Json<GatewayStatus>> {
    Ok(Json(gateway.status().await?))
}

/// `GET /messages?channelId&limit`
pub async fn messages(
    State(gateway): State<Gateway>,
    Query(params): Query<MessagesParams>,
) -> ApiResult<Json<Vec<StoredMessage>>> {
    let messages = gateway
        .messages(params.channel_id.as_deref(), list_limit(params.limit))
        .await?;
    Ok(Json(messages))
}

/// `GET /config`
pub async fn config_get(State(gateway): State<Gateway>) -> Json<GatewayConfig> {
    Json(gateway.config_redacted().await)
}

/// `GET /config/channels/{id}`
pub async fn channel_get(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> ApiResult<Json<ChannelConfig>> {
    Ok(Json(gateway.channel_config(&id).await?))
}

/// `POST /config/channels/{id}`
pub async fn channel_put(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
    Query(query): Params,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<ConfigSummary>> {
    let config = live_config(&gateway).await;
    authorize(&config, &headers, &query)?;
    permit(&config, "config.apply")?;
    let channel: ChannelConfig = parse_body(&body)?;
    Ok(Json(gateway.put_channel(&id, channel).await?))
}

/// `GET /config/groups/{id}`
pub async fn group_get(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> ApiResult<Json<GroupConfig>> {
    Ok(Json(gateway.group_config(&id).await?))
}

/// `POST /config/groups/{id}`
pub async fn group_put(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
    Query(query): Params,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<ConfigSummary>> {
    let config = live_config(&gateway).await;
    authorize(&config, &headers, &query)?;
    permit(&config, "config.apply")?;
    let group: GroupConfig = parse_body(&body)?;
    Ok(Json(gateway.put_group(&id, group).await?))
}

/// `POST /config/reload`
pub async fn config_reload(
    State(gateway): State<Gateway>,
    Query(query): Params,
    headers: HeaderMap,
) -> ApiResult<Json<ConfigSummary>> {
    let config = live_config(&gateway).await;
    authorize(&config, &headers, &query)?;
    permit(&config, "config.reload")?;
    Ok(Json(gateway.reload().await?))
}

/// `POST /rpc`
pub async fn rpc(
    State(gateway): State<Gateway>,
    Query(query): Params,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: Value = match parse_body(&body) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let key = idempotency_key(&headers);
    let (status, body) = rpc::handle(&gateway, &headers, &query, request, key.as_deref()).await;
    (status, Json(body)).into_response()
}

/// Canonical HTTP ingestion.
pub async fn ingest(gateway: &Gateway, query: &HashMap<String, String>, headers: &HeaderMap, body: &[u8]) -> Response {
    let config = live_config(gateway).await;
    if let Err(e) = authorize(&config, headers, query).and_then(|()| permit(&config, "ingest.message")) {
        return e.into_response();
    }
    let envelope: InboundEnvelope = match parse_body(body) {
        Ok(env) => env,
        Err(e) => return e.into_response(),
    };
    idempotent(gateway, "http.ingest", idempotency_key(headers), || async move {
        to_json(gateway.ingest(envelope).await?)
    })
    .await
}

/// Approval bridge.
pub async fn approve_request(
    gateway: &Gateway,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: &[u8],
) -> Response {
    let config = live_config(gateway).await;
    if let Err(e) = authorize(&config, headers, query).and_then(|()| permit(&config, "approve")) {
        return e.into_response();
    }
    let vars: Map<String, Value> = if body.iter().all(u8::is_ascii_whitespace) {
        Map::new()
    } else {
        match parse_body(body) {
            Ok(vars) => vars,
            Err(e) => return e.into_response(),
        }
    };
    idempotent(gateway, "approve", idempotency_key(headers), || async move {
        to_json(gateway.approve(vars).await?)
    })
    .await
}

/// `POST /approve`
pub async fn approve(
    State(gateway): State<Gateway>,
    Query(query): Params,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    approve_request(&gateway, &query, &headers, &body).await
}

/// Connector webhook.
pub async fn connector_push(gateway: &Gateway, headers: &HeaderMap, body: &[u8]) -> Response {
    let config = live_config(gateway).await;
    if let Err(e) = permit(&config, "connector.push") {
        return e.into_response();
    }
    let signature = config
        .connector
        .as_ref()
        .and_then(|c| headers.get(c.signature_header.as_str()))
        .and_then(|v| v.to_str().ok());
    match gateway.connector_push(body, signature).await {
        Ok(outcome) => match to_json(outcome) {
            Ok(body) => (StatusCode::OK, Json(body)).into_response(),
            Err(e) => e.into_response(),
        },
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Paths configured at runtime: ingest, approval and connector webhook.
///
/// Resolved against the live config on every request, so a reload that
/// moves a path takes effect without rebuilding the router.
pub async fn configured_paths(
    State(gateway): State<Gateway>,
    method: Method,
    uri: Uri,
    Query(query): Params,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let config = live_config(&gateway).await;
    let path = uri.path();
    let known = path == config.server.ingest_path
        || config.server.approve_path.as_deref() == Some(path)
        || config.connector.as_ref().is_some_and(|c| c.webhook_path == path);
    if !known {
        return ApiError::not_found(format!("no route for {path}")).into_response();
    }
    if method != Method::POST {
        return ApiError::new(StatusCode::METHOD_NOT_ALLOWED, "invalid_request", "use POST").into_response();
    }

    if path == config.server.ingest_path {
        ingest(&gateway, &query, &headers, &body).await
    } else if config.server.approve_path.as_deref() == Some(path) {
        approve_request(&gateway, &query, &headers, &body).await
    } else {
        connector_push(&gateway, &headers, &body).await
    }
}
