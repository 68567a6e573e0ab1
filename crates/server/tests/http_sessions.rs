//! End-to-end tests of the streamable HTTP endpoint, driven both by raw
//! HTTP requests and by the switchboard client connector.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    serde_json::{Value, json},
    switchboard_config::ServerConfig,
    switchboard_mcp::{CallToolOptions, Connector, HttpTransport, SamplingHandler, TransportError},
    switchboard_protocol::{
        SESSION_ID_HEADER, error_codes,
        types::{CallToolResult, Content, CreateMessageParams, CreateMessageResult, Role, Tool},
    },
    switchboard_server::{ExecutionContext, HttpState, SampleOptions, ToolRouter, router},
};

fn tools() -> ToolRouter {
    ToolRouter::new("http-test", "1.0")
        .tool(
            Tool::new("echo", "Echo text", json!({"type": "object"})),
            |args, _ctx| async move {
                Ok(CallToolResult::success(vec![Content::text(
                    args["text"].as_str().unwrap_or_default(),
                )]))
            },
        )
        .tool(
            Tool::new("ask", "Ask the client's model", json!({"type": "object"})),
            |_args, ctx: ExecutionContext| async move {
                let reply = ctx.sample("What is 6x7?", SampleOptions::default()).await?;
                Ok(CallToolResult::success(vec![reply.content]))
            },
        )
        .tool(
            Tool::new("count", "Reports progress", json!({"type": "object"})),
            |_args, ctx: ExecutionContext| async move {
                for step in 1..=3 {
                    ctx.report_progress(f64::from(step), Some(3.0), Some(format!("step {step}")));
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(CallToolResult::success(vec![Content::text("done")]))
            },
        )
}

async fn spawn_server(config: ServerConfig) -> (String, HttpState) {
    let state = HttpState::from_config(&config, Arc::new(tools()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone(), "/mcp");
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (format!("http://{addr}/mcp"), state)
}

fn config(auto_create: bool) -> ServerConfig {
    ServerConfig {
        auto_create_session_on_invalid_id: auto_create,
        ..ServerConfig::default()
    }
}

fn initialize_body(id: i64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": {"name": "raw", "version": "1"}
        }
    })
}

async fn post(url: &str, session_id: Option<&str>, body: Value) -> reqwest::Response {
    let mut req = reqwest::Client::new()
        .post(url)
        .header("accept", "application/json")
        .json(&body);
    if let Some(id) = session_id {
        req = req.header(SESSION_ID_HEADER, id);
    }
    req.send().await.unwrap()
}

async fn open_session(url: &str) -> String {
    let resp = post(url, None, initialize_body(1)).await;
    assert_eq!(resp.status(), 200);
    resp.headers()
        .get(SESSION_ID_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

fn tools_list(id: i64) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": "tools/list"})
}

struct Answer42;

#[async_trait]
impl SamplingHandler for Answer42 {
    async fn create_message(
        &self,
        params: CreateMessageParams,
    ) -> switchboard_mcp::Result<CreateMessageResult> {
        assert_eq!(params.messages[0].content.as_text(), Some("What is 6x7?"));
        Ok(CreateMessageResult {
            role: Role::Assistant,
            content: Content::text("42"),
            model: "fake".into(),
            stop_reason: None,
        })
    }
}

async fn connector(url: &str) -> Connector {
    let transport = HttpTransport::new(url, HashMap::new()).unwrap();
    let connector = Connector::new("http-test", Arc::new(transport));
    connector.set_sampling_handler(Arc::new(Answer42)).await;
    connector.connect().await.unwrap();
    connector.initialize().await.unwrap();
    connector
}

#[tokio::test]
async fn connector_round_trip_with_sampling_and_progress() {
    let (url, state) = spawn_server(config(false)).await;
    let connector = connector(&url).await;

    let names: Vec<_> = connector
        .tools()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, ["ask", "count", "echo"]);
    assert_eq!(state.sessions.len().await, 1);

    let echoed = connector
        .call_tool("echo", json!({"text": "over http"}), CallToolOptions::default())
        .await
        .unwrap();
    assert_eq!(echoed.text(), "over http");

    let sampled = connector
        .call_tool("ask", json!({}), CallToolOptions::default())
        .await
        .unwrap();
    assert_eq!(sampled.text(), "42");

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let counted = connector
        .call_tool(
            "count",
            json!({}),
            CallToolOptions::default().on_progress(move |p| {
                assert_eq!(p.total, Some(3.0));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
    assert_eq!(counted.text(), "done");
    assert_eq!(seen.load(Ordering::SeqCst), 3);

    connector.disconnect().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.sessions.is_empty().await);
}

#[tokio::test]
async fn idle_session_is_evicted_and_refused_without_auto_create() {
    let (url, state) = spawn_server(config(false)).await;
    let session_id = open_session(&url).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(state.sessions.sweep_idle_sessions(Duration::from_millis(1000)).await, 1);

    let resp = post(&url, Some(&session_id), tools_list(2)).await;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], error_codes::SESSION_NOT_FOUND);
    assert_eq!(body["id"], 2);
}

#[tokio::test]
async fn idle_session_is_recreated_with_auto_create() {
    let (url, state) = spawn_server(config(true)).await;
    let session_id = open_session(&url).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(state.sessions.sweep_idle_sessions(Duration::from_millis(1000)).await, 1);
    assert!(state.sessions.is_empty().await);

    let resp = post(&url, Some(&session_id), tools_list(2)).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get(SESSION_ID_HEADER).unwrap().to_str().unwrap(),
        session_id
    );
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["tools"].as_array().unwrap().len(), 3);
    assert_eq!(state.sessions.session_ids().await, [session_id]);
}

#[tokio::test]
async fn connector_sees_expired_session() {
    let (url, state) = spawn_server(config(false)).await;
    let connector = connector(&url).await;

    state.sessions.close_all().await;
    let err = connector
        .call_tool("echo", json!({"text": "x"}), CallToolOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        switchboard_mcp::Error::Transport(TransportError::SessionExpired { .. })
    ));
}

#[tokio::test]
async fn initialize_always_issues_a_new_session() {
    let (url, state) = spawn_server(config(false)).await;
    let first = open_session(&url).await;

    let resp = post(&url, Some(&first), initialize_body(5)).await;
    assert_eq!(resp.status(), 200);
    let second = resp.headers().get(SESSION_ID_HEADER).unwrap().to_str().unwrap().to_string();
    assert_ne!(first, second);
    assert_eq!(state.sessions.session_ids().await, [second]);

    let stale = post(&url, Some(&first), tools_list(6)).await;
    assert_eq!(stale.status(), 404);
}

#[tokio::test]
async fn requests_without_a_session_id_are_not_found() {
    let (url, state) = spawn_server(config(true)).await;
    let resp = post(&url, None, tools_list(1)).await;
    assert_eq!(resp.status(), 404);
    assert!(state.sessions.is_empty().await);
}

#[tokio::test]
async fn notifications_are_accepted() {
    let (url, _state) = spawn_server(config(false)).await;
    let session_id = open_session(&url).await;
    let resp = post(
        &url,
        Some(&session_id),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
    )
    .await;
    assert_eq!(resp.status(), 202);
}

#[tokio::test]
async fn malformed_and_batch_bodies_are_rejected() {
    let (url, _state) = spawn_server(config(false)).await;

    let resp = reqwest::Client::new()
        .post(&url)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], error_codes::PARSE_ERROR);

    let resp = post(&url, None, json!([tools_list(1)])).await;
    assert_eq!(resp.status(), 400);

    let resp = reqwest::Client::new()
        .post(&url)
        .header("accept", "image/png")
        .json(&initialize_body(1))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 406);
}

#[tokio::test]
async fn get_is_not_allowed_and_delete_closes() {
    let (url, state) = spawn_server(config(false)).await;
    let client = reqwest::Client::new();

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 405);

    let session_id = open_session(&url).await;
    let resp = client
        .delete(&url)
        .header(SESSION_ID_HEADER, &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(state.sessions.is_empty().await);

    let resp = client
        .delete(&url)
        .header(SESSION_ID_HEADER, &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client.delete(&url).send().await.unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn production_origin_allow_list() {
    let (url, _state) = spawn_server(ServerConfig {
        production: true,
        allowed_origins: vec!["https://app.example".into()],
        ..ServerConfig::default()
    })
    .await;
    let client = reqwest::Client::new();

    let denied = client
        .post(&url)
        .header("accept", "application/json")
        .header("origin", "https://evil.example")
        .json(&initialize_body(1))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 403);

    let allowed = client
        .post(&url)
        .header("accept", "application/json")
        .header("origin", "https://app.example")
        .json(&initialize_body(1))
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
}
