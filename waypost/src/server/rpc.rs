//! JSON-RPC style dispatcher.
//!
//! A request is `{"id", "method", "params", "idempotencyKey"}`; a batch is an
//! array of requests answered in order. Responses carry the current state
//! version: `{"id", "result" | "error", "stateVersion"}`.

use super::auth::{authorize, permit};
use super::error::{ApiError, ApiResult};
use crate::config::GatewayConfig;
use crate::cron::{CronJobPatch, NewCronJob};
use crate::envelope::InboundEnvelope;
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::idempotency::CachedResponse;
use crate::memory::NewObservation;
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;

/// Default `limit` for list methods.
pub const DEFAULT_LIST_LIMIT: usize = 50;
/// Upper bound on `limit` for list methods.
pub const MAX_LIST_LIMIT: usize = 500;

/// Clamp a caller-supplied list limit.
#[must_use]
pub fn list_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

/// Parameters of `messages.list`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessagesParams {
    /// Restrict to one channel.
    pub channel_id: Option<String>,
    /// Maximum records.
    pub limit: Option<usize>,
}

/// Parameters of `cron.runs`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunsParams {
    /// Restrict to one job.
    pub job_id: Option<String>,
    /// Maximum records.
    pub limit: Option<usize>,
}

/// Every RPC method.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RpcCommand {
    /// Process summary.
    #[serde(rename = "status")]
    Status {},
    /// Configured providers.
    #[serde(rename = "providers.list")]
    ProvidersList {},
    /// Running adapter status.
    #[serde(rename = "providers.status")]
    ProvidersStatus {},
    /// Config with secrets masked.
    #[serde(rename = "config.get")]
    ConfigGet {},
    /// Recent messages.
    #[serde(rename = "messages.list")]
    MessagesList(MessagesParams),
    /// Cron jobs.
    #[serde(rename = "cron.list")]
    CronList {},
    /// Cron run log.
    #[serde(rename = "cron.runs")]
    CronRuns(RunsParams),
    /// Route an inbound envelope.
    #[serde(rename = "ingest.message")]
    IngestMessage(Box<InboundEnvelope>),
    /// Probe one adapter.
    #[serde(rename = "providers.test")]
    ProvidersTest {
        /// Channel id.
        id: String,
    },
    /// Create a job.
    #[serde(rename = "cron.add")]
    CronAdd(Box<NewCronJob>),
    /// Patch a job.
    #[serde(rename = "cron.update")]
    CronUpdate {
        /// Job id.
        id: String,
        /// Fields to change.
        #[serde(flatten)]
        patch: CronJobPatch,
    },
    /// Enable a job.
    #[serde(rename = "cron.enable")]
    CronEnable {
        /// Job id.
        id: String,
    },
    /// Disable a job.
    #[serde(rename = "cron.disable")]
    CronDisable {
        /// Job id.
        id: String,
    },
    /// Delete a job.
    #[serde(rename = "cron.remove")]
    CronRemove {
        /// Job id.
        id: String,
    },
    /// Run a job now.
    #[serde(rename = "cron.run")]
    CronRun {
        /// Job id.
        id: String,
    },
    /// Append an observation.
    #[serde(rename = "memory.observation.append")]
    MemoryAppend(Box<NewObservation>),
    /// Run a group rollup now.
    #[serde(rename = "group.rollup.aggregate")]
    RollupAggregate {
        /// Group id.
        #[serde(rename = "groupId")]
        group_id: String,
    },
    /// Replace the config.
    #[serde(rename = "config.apply")]
    ConfigApply {
        /// Full configuration.
        config: Box<GatewayConfig>,
    },
    /// Re-read the config file.
    #[serde(rename = "config.reload")]
    ConfigReload {},
}

impl RpcCommand {
    /// Method name, also the tool name checked against the policy.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Status {} => "status",
            Self::ProvidersList {} => "providers.list",
            Self::ProvidersStatus {} => "providers.status",
            Self::ConfigGet {} => "config.get",
            Self::MessagesList(_) => "messages.list",
            Self::CronList {} => "cron.list",
            Self::CronRuns(_) => "cron.runs",
            Self::IngestMessage(_) => "ingest.message",
            Self::ProvidersTest { .. } => "providers.test",
            Self::CronAdd(_) => "cron.add",
            Self::CronUpdate { .. } => "cron.update",
            Self::CronEnable { .. } => "cron.enable",
            Self::CronDisable { .. } => "cron.disable",
            Self::CronRemove { .. } => "cron.remove",
            Self::CronRun { .. } => "cron.run",
            Self::MemoryAppend(_) => "memory.observation.append",
            Self::RollupAggregate { .. } => "group.rollup.aggregate",
            Self::ConfigApply { .. } => "config.apply",
            Self::ConfigReload {} => "config.reload",
        }
    }

    /// Read-only methods need no token and never bump the state version.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        matches!(
            self,
            Self::Status {}
                | Self::ProvidersList {}
                | Self::ProvidersStatus {}
                | Self::ConfigGet {}
                | Self::MessagesList(_)
                | Self::CronList {}
                | Self::CronRuns(_)
        )
    }

    /// Whether an idempotency key is honoured.
    #[must_use]
    pub const fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Self::IngestMessage(_)
                | Self::ProvidersTest { .. }
                | Self::CronAdd(_)
                | Self::MemoryAppend(_)
                | Self::RollupAggregate { .. }
        )
    }
}

/// One answered request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    /// Request id, echoed.
    pub id: Value,
    /// Result on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// State version after the call.
    pub state_version: u64,
}

fn to_json<T: Serialize>(value: T) -> ApiResult<Value> {
    serde_json::to_value(value).map_err(|e| ApiError::from(GatewayError::from(e)))
}

/// Split a raw request into its id, idempotency key and typed command.
fn parse(request: Value) -> (Value, Option<String>, ApiResult<RpcCommand>) {
    let Value::Object(mut obj) = request else {
        return (Value::Null, None, Err(ApiError::invalid("request must be an object")));
    };
    let id = obj.remove("id").unwrap_or(Value::Null);
    let key = obj
        .remove("idempotencyKey")
        .and_then(|v| v.as_str().map(ToString::to_string))
        .filter(|k| !k.trim().is_empty());

    let Some(method) = obj.remove("method") else {
        return (id, key, Err(ApiError::invalid("method is required")));
    };
    let params = match obj.remove("params") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(p) => p,
    };
    let command = serde_json::from_value::<RpcCommand>(json!({ "method": method, "params": params }))
        .map_err(|e| ApiError::invalid(format!("bad request: {e}")));
    (id, key, command)
}

async fn execute(gateway: &Gateway, command: RpcCommand) -> ApiResult<Value> {
    match command {
        RpcCommand::Status {} => to_json(gateway.status().await?),
        RpcCommand::ProvidersList {} => to_json(gateway.providers_list().await),
        RpcCommand::ProvidersStatus {} => to_json(gateway.providers_status().await),
        RpcCommand::ConfigGet {} => to_json(gateway.config_redacted().await),
        RpcCommand::MessagesList(p) => {
            to_json(gateway.messages(p.channel_id.as_deref(), list_limit(p.limit)).await?)
        }
        RpcCommand::CronList {} => to_json(gateway.cron_list().await?),
        RpcCommand::CronRuns(p) => to_json(gateway.cron_runs(p.job_id.as_deref(), list_limit(p.limit)).await?),
        RpcCommand::IngestMessage(envelope) => to_json(gateway.ingest(*envelope).await?),
        RpcCommand::ProvidersTest { id } => to_json(gateway.providers_test(&id).await?),
        RpcCommand::CronAdd(job) => to_json(gateway.cron_add(*job).await?),
        RpcCommand::CronUpdate { id, patch } => to_json(gateway.cron_update(&id, patch).await?),
        RpcCommand::CronEnable { id } => to_json(gateway.cron_set_enabled(&id, true).await?),
        RpcCommand::CronDisable { id } => to_json(gateway.cron_set_enabled(&id, false).await?),
        RpcCommand::CronRemove { id } => {
            gateway.cron_remove(&id).await?;
            Ok(json!({ "removed": id }))
        }
        RpcCommand::CronRun { id } => to_json(gateway.cron_run(&id).await?),
        RpcCommand::MemoryAppend(observation) => to_json(gateway.memory_append(*observation).await?),
        RpcCommand::RollupAggregate { group_id } => to_json(gateway.rollup_aggregate(&group_id).await?),
        RpcCommand::ConfigApply { config } => to_json(gateway.apply_config(*config).await?),
        RpcCommand::ConfigReload {} => to_json(gateway.reload().await?),
    }
}

/// Answer one request. `header_key` is the `Idempotency-Key` header, used
/// when the request carries no `idempotencyKey` of its own.
pub async fn handle_one(
    gateway: &Gateway,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    request: Value,
    header_key: Option<&str>,
) -> (StatusCode, Value) {
    let (id, key, command) = parse(request);
    let key = key.or_else(|| header_key.map(ToString::to_string));

    let command = match command {
        Ok(c) => c,
        Err(e) => return failure(gateway, id, &e),
    };
    let method = command.name();

    let config = gateway.snapshot().await.config.clone();
    let gate = permit(&config, method).and_then(|()| {
        if command.is_read_only() {
            Ok(())
        } else {
            authorize(&config, headers, query)
        }
    });
    if let Err(e) = gate {
        return failure(gateway, id, &e);
    }

    let key = key.filter(|_| command.is_idempotent());
    let request_id = id.clone();
    let outcome = gateway
        .run_once(method, key.as_deref(), || async move {
            let result = execute(gateway, command).await?;
            let body = json!(RpcResponse {
                id: request_id,
                result: Some(result),
                error: None,
                state_version: gateway.state_version(),
            });
            Ok::<_, ApiError>(CachedResponse {
                status: StatusCode::OK.as_u16(),
                body,
            })
        })
        .await;
    match outcome {
        Ok(cached) => (StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK), cached.body),
        Err(e) => failure(gateway, id, &e),
    }
}

fn failure(gateway: &Gateway, id: Value, error: &ApiError) -> (StatusCode, Value) {
    let body = json!(RpcResponse {
        id,
        result: None,
        error: Some(error.body()),
        state_version: gateway.state_version(),
    });
    (error.status, body)
}

/// Answer a single request or a batch.
///
/// A batch answers 200 with one response per element, in order; a single
/// request answers with its own status.
pub async fn handle(
    gateway: &Gateway,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: Value,
    header_key: Option<&str>,
) -> (StatusCode, Value) {
    match body {
        Value::Array(requests) => {
            if requests.is_empty() {
                return failure(gateway, Value::Null, &ApiError::invalid("empty batch"));
            }
            let mut responses = Vec::with_capacity(requests.len());
            for request in requests {
                responses.push(handle_one(gateway, headers, query, request, None).await.1);
            }
            (StatusCode::OK, Value::Array(responses))
        }
        request => handle_one(gateway, headers, query, request, header_key).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(value: Value) -> ApiResult<RpcCommand> {
        parse(value).2
    }

    #[test]
    fn test_param_less_methods_parse_without_params() {
        for method in ["status", "providers.list", "config.get", "cron.list", "config.reload"] {
            let cmd = command(json!({"id": 1, "method": method})).unwrap();
            assert_eq!(cmd.name(), method);
        }
        let cmd = command(json!({"method": "status", "params": null})).unwrap();
        assert!(cmd.is_read_only());
    }

    #[test]
    fn test_ingest_message_parses_envelope() {
        let (id, key, cmd) = parse(json!({
            "id": "r1",
            "idempotencyKey": "k1",
            "method": "ingest.message",
            "params": {"channelId": "telegram", "sourceId": "chat-1", "senderId": "u1", "content": "hello"}
        }));
        assert_eq!(id, json!("r1"));
        assert_eq!(key.as_deref(), Some("k1"));
        let cmd = cmd.unwrap();
        assert!(!cmd.is_read_only());
        assert!(cmd.is_idempotent());
        match cmd {
            RpcCommand::IngestMessage(env) => assert_eq!(env.content, "hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cron_update_flattens_patch() {
        let cmd = command(json!({
            "method": "cron.update",
            "params": {"id": "job_1", "schedule": "*/5 * * * *", "enabled": false}
        }))
        .unwrap();
        match cmd {
            RpcCommand::CronUpdate { id, patch } => {
                assert_eq!(id, "job_1");
                assert_eq!(patch.schedule.as_deref(), Some("*/5 * * * *"));
                assert_eq!(patch.enabled, Some(false));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rollup_params_use_group_id() {
        let cmd = command(json!({"method": "group.rollup.aggregate", "params": {"groupId": "eng"}})).unwrap();
        assert!(matches!(cmd, RpcCommand::RollupAggregate { ref group_id } if group_id == "eng"));
    }

    #[test]
    fn test_side_effecting_probes_honour_keys() {
        let cmd = command(json!({"method": "providers.test", "params": {"id": "telegram"}})).unwrap();
        assert!(!cmd.is_read_only());
        assert!(cmd.is_idempotent());
        let cmd = command(json!({"method": "config.reload"})).unwrap();
        assert!(!cmd.is_idempotent());
    }

    #[test]
    fn test_unknown_method_and_missing_method() {
        assert_eq!(command(json!({"method": "nope"})).unwrap_err().code, "invalid_request");
        assert_eq!(command(json!({"params": {}})).unwrap_err().code, "invalid_request");
        assert_eq!(command(json!([1])).unwrap_err().code, "invalid_request");
    }

    #[test]
    fn test_list_limit() {
        assert_eq!(list_limit(None), DEFAULT_LIST_LIMIT);
        assert_eq!(list_limit(Some(0)), 1);
        assert_eq!(list_limit(Some(10_000)), MAX_LIST_LIMIT);
    }
}
