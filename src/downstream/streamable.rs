//! Streamable-HTTP server transport.
//!
//! One endpoint carries both directions; every HTTP interaction is answered
//! in place. The response body is a single JSON envelope, or a one-shot SSE
//! stream when the client advertises `Accept: text/event-stream`. Server-push
//! toward sessions on this transport lands in the event store, where a later
//! SSE attach can pick it up.

use crate::event_store::EventStore;
use crate::protocol::Envelope;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const HEADER_SESSION_ID: &str = "mcp-session-id";
pub const HEADER_LAST_EVENT_ID: &str = "last-event-id";

pub struct StreamableServerTransport {
    session_id: String,
    store: Arc<EventStore>,
    closed: CancellationToken,
}

impl StreamableServerTransport {
    pub fn new(session_id: String, store: Arc<EventStore>) -> Arc<Self> {
        Arc::new(StreamableServerTransport {
            session_id,
            store,
            closed: CancellationToken::new(),
        })
    }

    /// Buffer a server-push envelope for this session.
    pub fn deliver(&self, envelope: &Envelope) {
        let event_id = self.store.append(&self.session_id, envelope.encode());
        tracing::debug!(
            session_id = %self.session_id,
            event_id,
            "buffered server-push for streamable session"
        );
    }

    pub fn close(&self) {
        self.closed.cancel();
        self.store.remove_session(&self.session_id);
    }
}

/// Does the request accept an event-stream reply?
pub fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"))
}

/// Respond with one envelope as plain JSON.
pub fn json_envelope_response(envelope: &Envelope) -> Response {
    axum::Json(envelope).into_response()
}

/// Respond with one envelope as a single-message SSE stream.
pub fn sse_single_message(envelope: &Envelope) -> Response {
    let payload = envelope.encode();
    let stream = futures::stream::once(async move {
        Ok::<_, Infallible>(Event::default().data(payload))
    });
    Sse::new(stream).into_response()
}

/// Envelope reply shaped by the client's `Accept` header.
pub fn envelope_response(headers: &HeaderMap, envelope: &Envelope) -> Response {
    if accepts_event_stream(headers) {
        sse_single_message(envelope)
    } else {
        json_envelope_response(envelope)
    }
}

/// Envelope reply carrying the session id header (initialize responses).
pub fn envelope_response_with_session_id(
    headers: &HeaderMap,
    envelope: &Envelope,
    session_id: &str,
) -> Response {
    let mut response = envelope_response(headers, envelope);
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(HEADER_SESSION_ID, value);
    }
    response
}

pub fn accepted_response() -> Response {
    StatusCode::ACCEPTED.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RequestId, Response as RpcResponse};

    #[test]
    fn detects_event_stream_accept() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_event_stream(&headers));
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        assert!(accepts_event_stream(&headers));
    }

    #[test]
    fn initialize_reply_carries_session_header() {
        let envelope = Envelope::Response(RpcResponse::ok(
            RequestId::Number(1),
            serde_json::json!({"ok": true}),
        ));
        let response =
            envelope_response_with_session_id(&HeaderMap::new(), &envelope, "abc-123");
        assert_eq!(
            response.headers().get(HEADER_SESSION_ID).unwrap(),
            "abc-123"
        );
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
