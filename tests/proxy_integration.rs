//! End-to-end tests: a real proxy router in front of an in-process
//! streamable-HTTP upstream.

use anyhow::Context as _;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use mcp_switchboard::config::{ProxySettings, ServerMode};
use mcp_switchboard::http::{create_router, AppState};
use mcp_switchboard::session::SessionManager;
use mcp_switchboard::upstream::{UpstreamFactory, UpstreamTarget};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SESSION_HEADER: &str = "mcp-session-id";

// ============================================================================
// Fake upstream
// ============================================================================

struct FakeUpstream {
    /// Refuse every initialize after the first with the singleton error.
    singleton: bool,
    initializes: AtomicUsize,
}

async fn upstream_mcp(
    State(state): State<Arc<FakeUpstream>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let message: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid json").into_response(),
    };
    let method = message.get("method").and_then(Value::as_str);
    let id = message.get("id").cloned();

    match (method, id) {
        (Some("initialize"), Some(id)) => {
            let count = state.initializes.fetch_add(1, Ordering::SeqCst);
            if state.singleton && count > 0 {
                return Json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32600, "message": "Server already initialized"}
                }))
                .into_response();
            }
            let mut response = Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}, "logging": {}},
                    "serverInfo": {"name": "fake-upstream", "version": "1"}
                }
            }))
            .into_response();
            response
                .headers_mut()
                .insert(SESSION_HEADER, "upstream-session-1".parse().unwrap());
            response
        }
        (Some(_), None) => StatusCode::ACCEPTED.into_response(),
        (None, _) => StatusCode::ACCEPTED.into_response(),
        (Some(method), Some(id)) => {
            // Requests past initialize must carry the upstream session id.
            if headers.get(SESSION_HEADER).is_none() {
                return (StatusCode::BAD_REQUEST, "missing upstream session id").into_response();
            }
            match method {
                "tools/list" => Json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"tools": [{"name": "echo", "inputSchema": {"type": "object"}}]}
                }))
                .into_response(),
                "tools/call" => Json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "content": [{"type": "text", "text": "echoed"}],
                        "arguments": message["params"]["arguments"]
                    }
                }))
                .into_response(),
                other => Json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": format!("unknown method {other}")}
                }))
                .into_response(),
            }
        }
    }
}

async fn start_fake_upstream(singleton: bool) -> anyhow::Result<String> {
    let state = Arc::new(FakeUpstream {
        singleton,
        initializes: AtomicUsize::new(0),
    });
    let app = Router::new()
        .route("/mcp", post(upstream_mcp).delete(|| async { StatusCode::NO_CONTENT }))
        .route("/ping", get(|| async { Json(json!({"ok": true})) }))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

// ============================================================================
// Proxy fixture
// ============================================================================

struct Proxy {
    base: String,
    manager: Arc<SessionManager>,
}

async fn start_proxy(upstream_url: &str, enable_proxy: bool) -> anyhow::Result<Proxy> {
    let http = reqwest::Client::new();
    let factory = UpstreamFactory::new(
        UpstreamTarget::Remote {
            url: format!("{upstream_url}/mcp"),
        },
        http.clone(),
    );
    let settings = ProxySettings {
        request_timeout: Duration::from_secs(5),
        ..ProxySettings::default()
    };
    let manager = SessionManager::new(Box::new(factory), settings);

    let state = Arc::new(AppState {
        manager: manager.clone(),
        sse_endpoint: "/sse".to_string(),
        stream_endpoint: "/mcp".to_string(),
        dynamic_proxy: false,
        enable_proxy,
        http,
        start_time: Instant::now(),
        version: "test",
        max_body_bytes: 1024 * 1024,
        total_requests: AtomicU64::new(0),
        failed_requests: AtomicU64::new(0),
    });
    let app = create_router(state, ServerMode::Both);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(Proxy {
        base: format!("http://{addr}"),
        manager,
    })
}

fn initialize_body(id: i64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "c", "version": "1"}
        }
    })
}

async fn post_mcp(
    client: &reqwest::Client,
    base: &str,
    session_id: Option<&str>,
    body: Value,
) -> anyhow::Result<reqwest::Response> {
    let mut request = client
        .post(format!("{base}/mcp"))
        .header("Content-Type", "application/json")
        .json(&body);
    if let Some(sid) = session_id {
        request = request.header(SESSION_HEADER, sid);
    }
    request.send().await.context("POST /mcp")
}

/// Initialize a session against the proxy; returns the minted session id.
async fn initialize_session(client: &reqwest::Client, base: &str) -> anyhow::Result<String> {
    let response = post_mcp(client, base, None, initialize_body(1)).await?;
    anyhow::ensure!(response.status() == StatusCode::OK, "initialize failed");
    let sid = response
        .headers()
        .get(SESSION_HEADER)
        .context("missing session header")?
        .to_str()?
        .to_string();
    Ok(sid)
}

// ============================================================================
// SSE reading helpers
// ============================================================================

#[derive(Debug, Clone, Default)]
struct SseEvent {
    id: Option<String>,
    event: Option<String>,
    data: String,
}

struct SseReader {
    stream: std::pin::Pin<
        Box<dyn futures::Stream<Item = Result<Bytes, reqwest::Error>> + Send>,
    >,
    buffer: String,
}

impl SseReader {
    fn new(response: reqwest::Response) -> Self {
        SseReader {
            stream: Box::pin(response.bytes_stream()),
            buffer: String::new(),
        }
    }

    /// Next complete SSE event, skipping comment/keep-alive frames.
    async fn next_event(&mut self) -> anyhow::Result<SseEvent> {
        loop {
            if let Some(idx) = self.buffer.find("\n\n") {
                let frame = self.buffer[..idx].to_string();
                self.buffer.drain(..idx + 2);
                let mut event = SseEvent::default();
                let mut saw_field = false;
                for line in frame.lines() {
                    if let Some(rest) = line.strip_prefix("id:") {
                        event.id = Some(rest.trim().to_string());
                        saw_field = true;
                    } else if let Some(rest) = line.strip_prefix("event:") {
                        event.event = Some(rest.trim().to_string());
                        saw_field = true;
                    } else if let Some(rest) = line.strip_prefix("data:") {
                        if !event.data.is_empty() {
                            event.data.push('\n');
                        }
                        event.data.push_str(rest.trim_start());
                        saw_field = true;
                    }
                }
                if saw_field {
                    return Ok(event);
                }
                continue;
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), self.stream.next())
                .await
                .context("timed out waiting for SSE event")?
                .context("SSE stream ended")??;
            self.buffer.push_str(std::str::from_utf8(&chunk)?);
        }
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn cold_initialize_returns_upstream_capabilities_and_session_header() -> anyhow::Result<()> {
    let upstream = start_fake_upstream(false).await?;
    let proxy = start_proxy(&upstream, false).await?;
    let client = reqwest::Client::new();

    let response = post_mcp(&client, &proxy.base, None, initialize_body(1)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let sid = response
        .headers()
        .get(SESSION_HEADER)
        .context("expected mcp-session-id header")?
        .to_str()?
        .to_string();
    assert!(uuid::Uuid::parse_str(&sid).is_ok(), "session id is a uuid");

    let body: Value = response.json().await?;
    assert_eq!(body["id"], json!(1));
    assert_eq!(
        body["result"]["capabilities"],
        json!({"tools": {}, "logging": {}})
    );
    Ok(())
}

#[tokio::test]
async fn list_tools_then_call_tool() -> anyhow::Result<()> {
    let upstream = start_fake_upstream(false).await?;
    let proxy = start_proxy(&upstream, false).await?;
    let client = reqwest::Client::new();
    let sid = initialize_session(&client, &proxy.base).await?;

    let response = post_mcp(
        &client,
        &proxy.base,
        Some(&sid),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await?;
    assert_eq!(body["id"], json!(2));
    assert_eq!(body["result"]["tools"][0]["name"], "echo");

    let response = post_mcp(
        &client,
        &proxy.base,
        Some(&sid),
        json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {"x": 1}}
        }),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await?;
    assert_eq!(body["id"], json!(3));
    assert_eq!(body["result"]["arguments"], json!({"x": 1}));
    Ok(())
}

#[tokio::test]
async fn singleton_upstream_shares_the_global_connection() -> anyhow::Result<()> {
    let upstream = start_fake_upstream(true).await?;
    let proxy = start_proxy(&upstream, false).await?;
    let client = reqwest::Client::new();

    let first = initialize_session(&client, &proxy.base).await?;
    let second = initialize_session(&client, &proxy.base).await?;
    assert_ne!(first, second);

    assert_eq!(
        proxy.manager.connection_id_for_session(&first).as_deref(),
        Some("global-mcp-connection")
    );
    assert_eq!(
        proxy.manager.connection_id_for_session(&second).as_deref(),
        Some("global-mcp-connection")
    );
    let (sessions, connections) = proxy.manager.counts();
    assert_eq!((sessions, connections), (2, 1));
    Ok(())
}

#[tokio::test]
async fn unknown_session_yields_the_literal_error_body() -> anyhow::Result<()> {
    let upstream = start_fake_upstream(false).await?;
    let proxy = start_proxy(&upstream, false).await?;
    let client = reqwest::Client::new();

    let response = post_mcp(
        &client,
        &proxy.base,
        Some("deadbeef"),
        json!({"jsonrpc": "2.0", "id": 9, "method": "tools/list"}),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await?;
    assert_eq!(
        body,
        json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": -32000, "message": "Session not found"}
        })
    );
    Ok(())
}

#[tokio::test]
async fn missing_session_header_is_rejected_with_400() -> anyhow::Result<()> {
    let upstream = start_fake_upstream(false).await?;
    let proxy = start_proxy(&upstream, false).await?;
    let client = reqwest::Client::new();

    let response = post_mcp(
        &client,
        &proxy.base,
        None,
        json!({"jsonrpc": "2.0", "id": 9, "method": "tools/list"}),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await?;
    assert_eq!(body["error"]["code"], json!(-32000));
    assert_eq!(body["error"]["message"], "Missing session ID");
    Ok(())
}

#[tokio::test]
async fn malformed_body_yields_parse_error() -> anyhow::Result<()> {
    let upstream = start_fake_upstream(false).await?;
    let proxy = start_proxy(&upstream, false).await?;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/mcp", proxy.base))
        .header("Content-Type", "application/json")
        .body("this is not json")
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await?;
    assert_eq!(body["id"], Value::Null);
    assert_eq!(body["error"]["code"], json!(-32700));
    Ok(())
}

#[tokio::test]
async fn cors_preflight_echoes_origin() -> anyhow::Result<()> {
    let upstream = start_fake_upstream(false).await?;
    let proxy = start_proxy(&upstream, false).await?;
    let client = reqwest::Client::new();

    let response = client
        .request(reqwest::Method::OPTIONS, format!("{}/mcp", proxy.base))
        .header("Origin", "https://x")
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let headers = response.headers();
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "https://x");
    assert_eq!(headers.get("access-control-allow-credentials").unwrap(), "true");
    let methods = headers
        .get("access-control-allow-methods")
        .unwrap()
        .to_str()?;
    assert!(methods.contains("POST") && methods.contains("OPTIONS"));
    Ok(())
}

#[tokio::test]
async fn sse_session_delivers_and_resumes_without_duplicates() -> anyhow::Result<()> {
    let upstream = start_fake_upstream(false).await?;
    let proxy = start_proxy(&upstream, false).await?;
    let client = reqwest::Client::new();

    // Attach the stream first; the proxy mints the session id.
    let attach = client
        .get(format!("{}/sse", proxy.base))
        .header("Accept", "text/event-stream")
        .send()
        .await?;
    assert_eq!(attach.status(), StatusCode::OK);
    let sid = attach
        .headers()
        .get(SESSION_HEADER)
        .context("sse attach returns session id")?
        .to_str()?
        .to_string();
    let mut reader = SseReader::new(attach);

    let endpoint = reader.next_event().await?;
    assert_eq!(endpoint.event.as_deref(), Some("endpoint"));
    assert!(endpoint.data.contains(&sid));

    // Initialize over the message endpoint; the response arrives on the
    // stream as event 1.
    let response = client
        .post(format!("{}/sse?sessionId={}", proxy.base, sid))
        .json(&initialize_body(1))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let init_event = reader.next_event().await?;
    assert_eq!(init_event.id.as_deref(), Some("1"));
    let init: Value = serde_json::from_str(&init_event.data)?;
    assert_eq!(init["result"]["capabilities"]["tools"], json!({}));

    // tools/list lands as event 2.
    let response = client
        .post(format!("{}/sse?sessionId={}", proxy.base, sid))
        .json(&json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let list_event = reader.next_event().await?;
    assert_eq!(list_event.id.as_deref(), Some("2"));
    drop(reader);

    // Resume after event 1: event 2 replays exactly once, in order.
    let resumed = client
        .get(format!("{}/sse?sessionId={}", proxy.base, sid))
        .header("Accept", "text/event-stream")
        .header("Last-Event-ID", "1")
        .send()
        .await?;
    let mut reader = SseReader::new(resumed);
    let endpoint = reader.next_event().await?;
    assert_eq!(endpoint.event.as_deref(), Some("endpoint"));
    let replayed = reader.next_event().await?;
    assert_eq!(replayed.id.as_deref(), Some("2"));
    let body: Value = serde_json::from_str(&replayed.data)?;
    assert_eq!(body["id"], json!(2));
    assert_eq!(body["result"]["tools"][0]["name"], "echo");
    Ok(())
}

#[tokio::test]
async fn delete_closes_the_session() -> anyhow::Result<()> {
    let upstream = start_fake_upstream(false).await?;
    let proxy = start_proxy(&upstream, false).await?;
    let client = reqwest::Client::new();
    let sid = initialize_session(&client, &proxy.base).await?;

    let response = client
        .delete(format!("{}/mcp", proxy.base))
        .header(SESSION_HEADER, &sid)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = post_mcp(
        &client,
        &proxy.base,
        Some(&sid),
        json!({"jsonrpc": "2.0", "id": 4, "method": "tools/list"}),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await?;
    assert_eq!(body["error"]["message"], "Session not found");
    Ok(())
}

#[tokio::test]
async fn pass_through_forwards_when_enabled() -> anyhow::Result<()> {
    let upstream = start_fake_upstream(false).await?;

    let disabled = start_proxy(&upstream, false).await?;
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/?target={}/ping", disabled.base, upstream))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let enabled = start_proxy(&upstream, true).await?;
    let response = client
        .get(format!("{}/?target={}/ping", enabled.base, upstream))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await?;
    assert_eq!(body, json!({"ok": true}));
    Ok(())
}

#[tokio::test]
async fn status_reports_sessions_and_uptime() -> anyhow::Result<()> {
    let upstream = start_fake_upstream(false).await?;
    let proxy = start_proxy(&upstream, false).await?;
    let client = reqwest::Client::new();
    let _sid = initialize_session(&client, &proxy.base).await?;

    let body: Value = client
        .get(format!("{}/status", proxy.base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["sessions"], json!(1));
    assert_eq!(body["connections"], json!(1));
    assert!(body["stats"]["total_requests"].as_u64().unwrap() >= 1);
    Ok(())
}
