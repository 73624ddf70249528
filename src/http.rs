//! HTTP front end.
//!
//! Routes the configured SSE and streamable endpoints to their transports,
//! applies permissive CORS, exposes the health/status surface, counts
//! requests, and (when enabled) hands `?target=` traffic to the opaque
//! pass-through.

use crate::config::ServerMode;
use crate::downstream::streamable::{
    accepted_response, envelope_response, envelope_response_with_session_id,
    HEADER_LAST_EVENT_ID, HEADER_SESSION_ID,
};
use crate::error::ProxyError;
use crate::protocol::{self, Envelope, Response as RpcResponse};
use crate::session::{Dispatch, SessionManager, TransportKind};
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state, Next};
use axum::response::sse::KeepAlive;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

const ALLOWED_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS, PATCH";

pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub sse_endpoint: String,
    pub stream_endpoint: String,
    pub dynamic_proxy: bool,
    pub enable_proxy: bool,
    pub http: reqwest::Client,
    pub start_time: Instant,
    pub version: &'static str,
    pub max_body_bytes: usize,
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

/// Build the router for the configured server mode.
pub fn create_router(state: Arc<AppState>, mode: ServerMode) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/status", get(status));

    if mode.serves_sse() {
        router = router.route(
            state.sse_endpoint.as_str(),
            get(sse_get).post(sse_post),
        );
    }
    if mode.serves_stream() {
        router = router.route(
            state.stream_endpoint.as_str(),
            post(stream_post).delete(stream_delete),
        );
    }

    router
        .fallback(fallback)
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .layer(from_fn_with_state(state.clone(), count_requests))
        .layer(from_fn(cors))
        .with_state(state)
}

// ============================================================================
// Middleware
// ============================================================================

/// Permissive CORS: echo the origin with credentials, allow everything, and
/// short-circuit preflight with 204.
async fn cors(request: Request<Body>, next: Next) -> Response {
    let origin = request.headers().get(header::ORIGIN).cloned();
    let requested_headers = request
        .headers()
        .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .cloned();

    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    if let Some(origin) = origin {
        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            requested_headers.unwrap_or(HeaderValue::from_static("*")),
        );
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static("*"),
        );
    }
    response
}

async fn count_requests(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();
    let should_count = path != "/health" && path != "/status";

    if should_count {
        state.total_requests.fetch_add(1, Ordering::Relaxed);
    }
    let response = next.run(request).await;
    if should_count && response.status().is_server_error() {
        state.failed_requests.fetch_add(1, Ordering::Relaxed);
    }
    response
}

// ============================================================================
// Health / status
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

#[derive(Serialize)]
struct StatusResponse {
    version: &'static str,
    uptime_seconds: u64,
    sessions: usize,
    connections: usize,
    stats: StatsInfo,
}

#[derive(Serialize)]
struct StatsInfo {
    total_requests: u64,
    failed_requests: u64,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let (sessions, connections) = state.manager.counts();
    Json(StatusResponse {
        version: state.version,
        uptime_seconds: state.start_time.elapsed().as_secs(),
        sessions,
        connections,
        stats: StatsInfo {
            total_requests: state.total_requests.load(Ordering::Relaxed),
            failed_requests: state.failed_requests.load(Ordering::Relaxed),
        },
    })
}

// ============================================================================
// Shared helpers
// ============================================================================

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn session_from(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    session_header(headers).or_else(|| query.get("sessionId").cloned())
}

fn upstream_hint(state: &AppState, query: &HashMap<String, String>) -> Option<String> {
    if state.dynamic_proxy {
        query.get("upstream").cloned()
    } else {
        None
    }
}

/// Decode a POST body. `Err` carries a ready-to-send JSON-RPC error response:
/// unparseable bodies are treated as `null` and answered with a parse error,
/// valid JSON of the wrong shape with an invalid-request error.
fn decode_body(body: &Bytes) -> Result<Envelope, Response> {
    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "request body is not JSON");
            return Err(Json(
                ProxyError::BodyParse(e.to_string()).to_envelope(protocol::RequestId::Null),
            )
            .into_response());
        }
    };
    match serde_json::from_value::<Envelope>(value.clone()) {
        Ok(envelope) => Ok(envelope),
        Err(e) => {
            tracing::debug!(error = %e, "request body is not a JSON-RPC envelope");
            let id = protocol::request_id_from_value(&value);
            Err(Json(Envelope::Response(RpcResponse::error(
                id,
                -32600,
                "Invalid Request",
            )))
            .into_response())
        }
    }
}

fn dispatch_error_response(status: u16, envelope: Envelope) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    (status, Json(envelope)).into_response()
}

// ============================================================================
// Streamable HTTP endpoint
// ============================================================================

async fn stream_post(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope = match decode_body(&body) {
        Ok(envelope) => envelope,
        Err(response) => return response,
    };
    let session_id = session_from(&headers, &query);

    if envelope.is_initialize_request() {
        let Envelope::Request(request) = envelope else {
            unreachable!("initialize requests are requests");
        };
        let hint = upstream_hint(&state, &query);
        let outcome = state
            .manager
            .initialize(session_id, request, TransportKind::Streamable, hint)
            .await;
        return match outcome {
            Dispatch::ReplyWithSession {
                session_id,
                envelope,
            } => envelope_response_with_session_id(&headers, &envelope, &session_id),
            Dispatch::Error { status, envelope } => dispatch_error_response(status, envelope),
            Dispatch::Reply(envelope) => envelope_response(&headers, &envelope),
            Dispatch::Accepted => accepted_response(),
        };
    }

    match state.manager.dispatch(session_id, envelope).await {
        Dispatch::Reply(envelope) => envelope_response(&headers, &envelope),
        Dispatch::Accepted => accepted_response(),
        Dispatch::Error { status, envelope } => dispatch_error_response(status, envelope),
        Dispatch::ReplyWithSession {
            session_id,
            envelope,
        } => envelope_response_with_session_id(&headers, &envelope, &session_id),
    }
}

async fn stream_delete(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_header(&headers) else {
        return (StatusCode::BAD_REQUEST, "Missing session ID").into_response();
    };
    if state.manager.close_session(&session_id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::NOT_FOUND, "Session not found").into_response()
    }
}

// ============================================================================
// SSE endpoint
// ============================================================================

async fn sse_get(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let presented = session_from(&headers, &query);
    let last_event_id = headers
        .get(HEADER_LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let (session_id, transport) = state.manager.sse_attach(presented);
    tracing::debug!(session_id = %session_id, last_event_id = ?last_event_id, "SSE stream attached");

    let endpoint = format!("{}?sessionId={}", state.sse_endpoint, session_id);
    let stream = transport.stream(last_event_id, Some(endpoint));
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(HEADER_SESSION_ID, value);
    }
    response
}

async fn sse_post(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope = match decode_body(&body) {
        Ok(envelope) => envelope,
        Err(response) => return response,
    };
    let Some(session_id) = session_from(&headers, &query) else {
        return dispatch_error_response(
            400,
            ProxyError::MissingSession.to_envelope(protocol::RequestId::Null),
        );
    };

    if envelope.is_initialize_request() {
        let Envelope::Request(request) = envelope else {
            unreachable!("initialize requests are requests");
        };
        let hint = upstream_hint(&state, &query);
        let outcome = state
            .manager
            .initialize(
                Some(session_id.clone()),
                request,
                TransportKind::Sse,
                hint,
            )
            .await;
        return match outcome {
            Dispatch::ReplyWithSession {
                session_id,
                envelope,
            } => {
                // Responses travel on the event stream for this transport.
                state.manager.deliver_to_session(&session_id, &envelope);
                let mut response = accepted_response();
                if let Ok(value) = HeaderValue::from_str(&session_id) {
                    response.headers_mut().insert(HEADER_SESSION_ID, value);
                }
                response
            }
            Dispatch::Error { status, envelope } => dispatch_error_response(status, envelope),
            Dispatch::Reply(envelope) => {
                state.manager.deliver_to_session(&session_id, &envelope);
                accepted_response()
            }
            Dispatch::Accepted => accepted_response(),
        };
    }

    match state.manager.dispatch(Some(session_id.clone()), envelope).await {
        Dispatch::Reply(envelope) => {
            state.manager.deliver_to_session(&session_id, &envelope);
            accepted_response()
        }
        Dispatch::Accepted => accepted_response(),
        Dispatch::Error { status, envelope } => dispatch_error_response(status, envelope),
        Dispatch::ReplyWithSession { envelope, .. } => {
            state.manager.deliver_to_session(&session_id, &envelope);
            accepted_response()
        }
    }
}

// ============================================================================
// Fallback: opaque pass-through
// ============================================================================

async fn fallback(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let target = request
        .uri()
        .query()
        .and_then(|q| {
            url_query_pairs(q)
                .into_iter()
                .find(|(k, _)| k == "target")
                .map(|(_, v)| v)
        });

    match target {
        Some(target) if state.enable_proxy => {
            crate::passthrough::forward(&state.http, &target, request, state.max_body_bytes).await
        }
        Some(_) => (
            StatusCode::FORBIDDEN,
            "pass-through proxying is disabled",
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Minimal query-string splitting with percent-decoding for the `target`
/// parameter.
fn url_query_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((k.to_string(), percent_decode(v)))
        })
        .collect()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit() =>
            {
                let byte = u8::from_str_radix(&input[i + 1..i + 3], 16)
                    .expect("both digits checked as hex");
                out.push(byte);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_decodes_query_pairs() {
        let pairs = url_query_pairs("target=http%3A%2F%2Flocalhost%3A9000%2Fapi&x=1");
        assert_eq!(pairs[0].0, "target");
        assert_eq!(pairs[0].1, "http://localhost:9000/api");
        assert_eq!(pairs[1], ("x".to_string(), "1".to_string()));
    }

    #[test]
    fn decode_body_recovers_ids_from_invalid_shapes() {
        let err = decode_body(&Bytes::from_static(b"{\"id\": 7, \"nope\": true}")).unwrap_err();
        assert_eq!(err.status(), StatusCode::OK);
        let err = decode_body(&Bytes::from_static(b"not json at all")).unwrap_err();
        assert_eq!(err.status(), StatusCode::OK);
    }
}
