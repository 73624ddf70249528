//! Client-facing server transports.
//!
//! One transport instance exists per session. The SSE variant owns a
//! long-lived event stream; the streamable-HTTP variant answers within each
//! HTTP interaction and buffers server-push into the event store.

use crate::protocol::Envelope;
use std::sync::Arc;

pub mod sse;
pub mod streamable;

pub use sse::SseServerTransport;
pub use streamable::StreamableServerTransport;

/// The per-session server transport bound into a connection.
#[derive(Clone)]
pub enum SessionTransport {
    Sse(Arc<SseServerTransport>),
    Streamable(Arc<StreamableServerTransport>),
}

impl SessionTransport {
    /// Deliver a proxy→client envelope.
    pub fn deliver(&self, envelope: &Envelope) {
        match self {
            SessionTransport::Sse(t) => t.deliver(envelope),
            SessionTransport::Streamable(t) => t.deliver(envelope),
        }
    }

    pub fn close(&self) {
        match self {
            SessionTransport::Sse(t) => t.close(),
            SessionTransport::Streamable(t) => t.close(),
        }
    }
}
