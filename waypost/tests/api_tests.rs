use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use std::path::Path;
use tempfile::TempDir;
use tower::ServiceExt;

use waypost::config::{
    ChannelConfig, ConfigSource, ConnectorConfig, GatewayConfig, GroupConfig, GroupSource,
    save_config,
};
use waypost::connector::sign;
use waypost::gateway::Gateway;
use waypost::server;

// -- Helpers --------------------------------------------------------------

fn base_config(workspace: &Path) -> GatewayConfig {
    let mut config = GatewayConfig {
        workspace: Some(workspace.to_path_buf()),
        ..GatewayConfig::default()
    };
    config.channels.insert("telegram".into(), ChannelConfig::default());
    config.channels.insert("http".into(), ChannelConfig::default());
    config.backend.mock_reply = Some("pong".into());
    config
}

async fn start(config: GatewayConfig) -> Gateway {
    Gateway::start(config, ConfigSource::Inline)
        .await
        .expect("gateway should start")
}

fn post(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_with(uri: &str, body: &Value, name: &str, value: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(name, value)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(gateway: &Gateway, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let resp = server::router(gateway.clone()).oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn send_json(gateway: &Gateway, req: Request<Body>) -> (StatusCode, Value) {
    let (status, bytes) = send(gateway, req).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn hello() -> Value {
    json!({"channelId": "telegram", "sourceId": "chat-1", "senderId": "u1", "content": "hello"})
}

// -- Tests ----------------------------------------------------------------

#[tokio::test]
async fn health_returns_200() {
    let dir = TempDir::new().unwrap();
    let gateway = start(base_config(dir.path())).await;

    let (status, body) = send_json(&gateway, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["stateVersion"], 0);
}

#[tokio::test]
async fn ingest_hello_returns_pong_and_persists_pair() {
    let dir = TempDir::new().unwrap();
    let gateway = start(base_config(dir.path())).await;

    let (status, body) = send_json(&gateway, post("/ingest", &hello())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);
    assert_eq!(body["outbound"]["content"], "pong");
    assert_eq!(body["outbound"]["channelId"], "telegram");
    assert_eq!(body["stateVersion"], 1);

    let (status, messages) = send_json(&gateway, get("/messages?channelId=telegram&limit=10")).await;
    assert_eq!(status, StatusCode::OK);
    let messages = messages.as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["direction"], "inbound");
    assert_eq!(messages[1]["direction"], "outbound");
    assert_eq!(messages[0]["correlationId"], messages[1]["correlationId"]);
    assert_eq!(messages[0]["correlationId"], body["correlationId"]);
}

#[tokio::test]
async fn idempotent_ingest_replays_identical_response() {
    let dir = TempDir::new().unwrap();
    let gateway = start(base_config(dir.path())).await;

    let (s1, first) = send(&gateway, post_with("/ingest", &hello(), "Idempotency-Key", "k-1")).await;
    let (s2, second) = send(&gateway, post_with("/ingest", &hello(), "Idempotency-Key", "k-1")).await;
    assert_eq!(s1, StatusCode::OK);
    assert_eq!(s2, StatusCode::OK);
    assert_eq!(first, second);
    assert_eq!(gateway.state_version(), 1);

    let (_, messages) = send_json(&gateway, get("/messages")).await;
    assert_eq!(messages.as_array().unwrap().len(), 2);

    // A different key is a new request.
    let (_, third) = send_json(&gateway, post_with("/ingest", &hello(), "Idempotency-Key", "k-2")).await;
    assert_eq!(third["stateVersion"], 2);
}

#[tokio::test]
async fn state_version_counts_only_mutations() {
    let dir = TempDir::new().unwrap();
    let gateway = start(base_config(dir.path())).await;
    let before = gateway.state_version();

    let calls = [
        json!({"id": 1, "method": "status"}),
        json!({"id": 2, "method": "memory.observation.append", "params": {"summary": "release planned"}}),
        json!({"id": 3, "method": "cron.list"}),
        json!({"id": 4, "method": "cron.add", "params": {
            "id": "nightly", "schedule": "0 3 * * *", "prompt": "summarize", "sessionKey": "telegram:chat-1"
        }}),
        json!({"id": 5, "method": "providers.list"}),
        json!({"id": 6, "method": "ingest.message", "params": hello()}),
        json!({"id": 7, "method": "config.get"}),
    ];
    for call in &calls {
        let (status, body) = send_json(&gateway, post("/rpc", call)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert!(body.get("result").is_some(), "{body}");
    }

    assert_eq!(gateway.state_version(), before + 3);
}

#[tokio::test]
async fn rpc_batch_answers_in_order() {
    let dir = TempDir::new().unwrap();
    let gateway = start(base_config(dir.path())).await;

    let batch = json!([
        {"id": "a", "method": "status"},
        {"id": "b", "method": "no.such.method"},
        {"id": "c", "method": "cron.remove", "params": {"id": "missing"}}
    ]);
    let (status, body) = send_json(&gateway, post("/rpc", &batch)).await;
    assert_eq!(status, StatusCode::OK);
    let responses = body.as_array().unwrap();
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0]["id"], "a");
    assert!(responses[0]["result"]["channels"].is_array());
    assert_eq!(responses[1]["error"]["code"], "invalid_request");
    assert_eq!(responses[2]["error"]["code"], "not_found");
}

#[tokio::test]
async fn rpc_idempotency_key_applies_once() {
    let dir = TempDir::new().unwrap();
    let gateway = start(base_config(dir.path())).await;

    let call = json!({
        "id": 1,
        "idempotencyKey": "obs-1",
        "method": "memory.observation.append",
        "params": {"summary": "standup moved to 10:00"}
    });
    let (_, first) = send(&gateway, post("/rpc", &call)).await;
    let (_, second) = send(&gateway, post("/rpc", &call)).await;
    assert_eq!(first, second);
    assert_eq!(gateway.state_version(), 1);
}

#[tokio::test]
async fn rpc_provider_test_replays_with_same_key() {
    let dir = TempDir::new().unwrap();
    let gateway = start(base_config(dir.path())).await;

    let call = json!({
        "idempotencyKey": "p-1",
        "method": "providers.test",
        "params": {"id": "telegram"}
    });
    let (s1, first) = send(&gateway, post("/rpc", &call)).await;
    let (s2, second) = send(&gateway, post("/rpc", &call)).await;
    assert_eq!(s1, StatusCode::OK);
    assert_eq!(s2, StatusCode::OK);
    assert_eq!(first, second);
    assert_eq!(gateway.state_version(), 1);
}

#[tokio::test]
async fn concurrent_ingest_with_same_key_runs_once() {
    let dir = TempDir::new().unwrap();
    let gateway = start(base_config(dir.path())).await;

    let ((s1, first), (s2, second)) = tokio::join!(
        send(&gateway, post_with("/ingest", &hello(), "Idempotency-Key", "k-race")),
        send(&gateway, post_with("/ingest", &hello(), "Idempotency-Key", "k-race")),
    );
    assert_eq!(s1, StatusCode::OK);
    assert_eq!(s2, StatusCode::OK);
    assert_eq!(first, second);
    assert_eq!(gateway.state_version(), 1);

    let (_, messages) = send_json(&gateway, get("/messages")).await;
    assert_eq!(messages.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn ingest_requires_token_when_configured() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(dir.path());
    config.server.ingest_token = Some("s3cret".into());
    let gateway = start(config).await;

    let (status, body) = send_json(&gateway, post("/ingest", &hello())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let (status, _) = send_json(
        &gateway,
        post_with("/ingest", &hello(), "Authorization", "Bearer s3cret"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send_json(&gateway, post("/ingest?token=s3cret", &hello())).await;
    assert_eq!(status, StatusCode::OK);

    // Read-only RPC needs no token; mutating RPC does.
    let (status, _) = send_json(&gateway, post("/rpc", &json!({"method": "status"}))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send_json(&gateway, post("/rpc", &json!({"method": "config.reload"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn denied_tool_is_blocked_before_side_effects() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(dir.path());
    config.tools.deny = vec!["ingest.message".into()];
    let gateway = start(config).await;

    let (status, body) = send_json(&gateway, post("/ingest", &hello())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "blocked");

    let (_, messages) = send_json(&gateway, get("/messages")).await;
    assert!(messages.as_array().unwrap().is_empty());
    assert_eq!(gateway.state_version(), 0);
}

#[tokio::test]
async fn unmatched_group_and_disallowed_sender_are_not_answered() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(dir.path());
    if let Some(http) = config.channels.get_mut("http") {
        http.allow_from = vec!["alice".into()];
    }
    let gateway = start(config).await;

    let group_msg = json!({
        "channelId": "telegram", "sourceId": "room-9", "senderId": "u1",
        "content": "hi all", "isGroup": true
    });
    let (status, body) = send_json(&gateway, post("/ingest", &group_msg)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], false);
    assert_eq!(body["outcome"], "dropped");
    assert!(body["outbound"].is_null());

    let intruder = json!({"channelId": "http", "sourceId": "s1", "senderId": "mallory", "content": "hi"});
    let (_, body) = send_json(&gateway, post("/ingest", &intruder)).await;
    assert_eq!(body["outcome"], "blocked");
    assert!(body["outbound"].is_null());

    let (_, messages) = send_json(&gateway, get("/messages")).await;
    let messages = messages.as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["channelId"], "http");
    assert_eq!(messages[1]["sourceId"], "s1");
    assert_eq!(messages[1]["direction"], "inbound");
}

#[tokio::test]
async fn observational_message_gets_no_reply() {
    let dir = TempDir::new().unwrap();
    let gateway = start(base_config(dir.path())).await;

    let observe = json!({
        "channelId": "telegram", "sourceId": "chat-2", "senderId": "u1",
        "content": "fyi: deploy at 5", "mode": "observational"
    });
    let (status, body) = send_json(&gateway, post("/ingest", &observe)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);
    assert!(body["outbound"].is_null());

    let (_, messages) = send_json(&gateway, get("/messages?channelId=telegram")).await;
    assert_eq!(messages.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn approve_renders_template_and_ingests() {
    let dir = TempDir::new().unwrap();
    let gateway = start(base_config(dir.path())).await;

    let (status, body) = send_json(
        &gateway,
        post("/approve", &json!({"title": "Budget Q3", "approver": "dana", "id": "apr-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["correlationId"], "apr-1");
    assert_eq!(body["outbound"]["content"], "pong");

    let (_, messages) = send_json(&gateway, get("/messages?channelId=http")).await;
    assert_eq!(messages[0]["content"], "Approved: Budget Q3");
    assert_eq!(messages[0]["senderId"], "dana");
}

#[tokio::test]
async fn connector_push_checks_signature() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(dir.path());
    config.channels.insert("notion".into(), ChannelConfig::default());
    config.connector = Some(ConnectorConfig {
        signing_secret: Some("whsec".into()),
        ..ConnectorConfig::default()
    });
    let gateway = start(config).await;

    let event = json!({"type": "page.updated", "id": "evt-1", "entity": {"id": "page-7"}, "data": {"title": "Roadmap"}});
    let raw = event.to_string();

    let (status, _) = send_json(
        &gateway,
        post_with("/webhooks/notion", &event, "x-notion-signature", "sha256=00"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let signature = sign("whsec", raw.as_bytes()).unwrap();
    let (status, body) = send_json(
        &gateway,
        post_with("/webhooks/notion", &event, "x-notion-signature", &signature),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);
    assert!(body["outbound"].is_null());

    let handshake = json!({"verification_token": "vt-123"});
    let signature = sign("whsec", handshake.to_string().as_bytes()).unwrap();
    let (_, body) = send_json(
        &gateway,
        post_with("/webhooks/notion", &handshake, "x-notion-signature", &signature),
    )
    .await;
    assert_eq!(body["verificationToken"], "vt-123");
}

#[tokio::test]
async fn two_reloads_bump_version_and_keep_one_adapter_per_channel() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    save_config(&path, &base_config(dir.path())).await.unwrap();
    let gateway = Gateway::from_path(&path).await.unwrap();

    for expected in [1, 2] {
        let (status, body) = send_json(&gateway, post("/config/reload", &json!({}))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["stateVersion"], expected);
        assert_eq!(body["channels"], json!(["http", "telegram"]));
    }

    let (_, providers) = send_json(&gateway, post("/rpc", &json!({"method": "providers.list"}))).await;
    let providers = providers["result"].as_array().unwrap().clone();
    assert_eq!(providers.len(), 2);
    assert!(providers.iter().all(|p| p["running"] == true));
    assert_eq!(gateway.snapshot().await.channels.running_count().await, 2);
}

#[tokio::test]
async fn reload_without_path_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let gateway = start(base_config(dir.path())).await;

    let (status, body) = send_json(&gateway, post("/config/reload", &json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "config_error");
    assert_eq!(gateway.state_version(), 0);
}

#[tokio::test]
async fn config_sections_read_and_write() {
    let dir = TempDir::new().unwrap();
    let gateway = start(base_config(dir.path())).await;

    let (status, _) = send_json(&gateway, get("/config/channels/slack")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send_json(&gateway, post("/config/channels/slack", &json!({"kind": "loopback"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stateVersion"], 1);
    assert_eq!(body["channels"], json!(["http", "slack", "telegram"]));

    let group = GroupConfig {
        sources: vec![GroupSource {
            channel: "slack".into(),
            sources: vec![],
        }],
        ..GroupConfig::default()
    };
    let (status, body) = send_json(
        &gateway,
        post("/config/groups/eng", &serde_json::to_value(&group).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["groups"], json!(["eng"]));

    let (status, body) = send_json(&gateway, get("/config/groups/eng")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sources"][0]["channel"], "slack");

    // A group with an unparsable rollup schedule is rejected and nothing changes.
    let (status, body) = send_json(
        &gateway,
        post(
            "/config/groups/ops",
            &json!({"sources": [{"channel": "slack"}], "rollup": {"schedule": "bogus"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");
    assert_eq!(gateway.state_version(), 2);
}

#[tokio::test]
async fn invalid_cron_schedule_is_bad_request() {
    let dir = TempDir::new().unwrap();
    let gateway = start(base_config(dir.path())).await;

    let call = json!({"method": "cron.add", "params": {
        "schedule": "not a schedule", "prompt": "x", "sessionKey": "telegram:chat-1"
    }});
    let (status, body) = send_json(&gateway, post("/rpc", &call)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_request");
    assert_eq!(gateway.state_version(), 0);
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let dir = TempDir::new().unwrap();
    let gateway = start(base_config(dir.path())).await;
    let (status, body) = send_json(&gateway, get("/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}
