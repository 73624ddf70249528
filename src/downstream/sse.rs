//! SSE server transport.
//!
//! A session's GET stream replays retained events after `Last-Event-ID`, then
//! follows the live log. Delivery and replay share one cursor over the event
//! store, which is what keeps resumed streams duplicate-free and in order.

use crate::event_store::EventStore;
use crate::protocol::Envelope;
use axum::response::sse::Event;
use futures::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub struct SseServerTransport {
    session_id: String,
    store: Arc<EventStore>,
    wakeup: Notify,
    closed: CancellationToken,
    last_activity: parking_lot::Mutex<Instant>,
}

impl SseServerTransport {
    pub fn new(session_id: String, store: Arc<EventStore>) -> Arc<Self> {
        Arc::new(SseServerTransport {
            session_id,
            store,
            wakeup: Notify::new(),
            closed: CancellationToken::new(),
            last_activity: parking_lot::Mutex::new(Instant::now()),
        })
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }

    /// Append an envelope to the session log and wake the stream.
    pub fn deliver(&self, envelope: &Envelope) {
        let event_id = self.store.append(&self.session_id, envelope.encode());
        tracing::trace!(session_id = %self.session_id, event_id, "queued SSE event");
        self.wakeup.notify_one();
    }

    pub fn close(&self) {
        self.closed.cancel();
        self.store.remove_session(&self.session_id);
    }

    /// The event stream for a GET attach.
    ///
    /// `endpoint` is announced first as an `endpoint` event so clients learn
    /// where to POST; `last_event_id` resumes strictly after that id.
    pub fn stream(
        self: Arc<Self>,
        last_event_id: Option<u64>,
        endpoint: Option<String>,
    ) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
        let transport = self;
        async_stream::stream! {
            if let Some(endpoint) = endpoint {
                yield Ok(Event::default().event("endpoint").data(endpoint));
            }
            let mut cursor = last_event_id.unwrap_or(0);
            loop {
                let batch = transport.store.replay_from(&transport.session_id, cursor);
                if batch.is_empty() {
                    // A cursor behind the retained window can never produce a
                    // batch again; resync to the window start and deliver the
                    // current snapshot instead of stalling.
                    if let Some((oldest, newest)) =
                        transport.store.retained_range(&transport.session_id)
                    {
                        if cursor + 1 < oldest {
                            tracing::debug!(
                                session_id = %transport.session_id,
                                cursor,
                                oldest,
                                "resume cursor fell behind retained events; resyncing"
                            );
                            cursor = oldest - 1;
                            continue;
                        }
                        // A cursor past the newest id is stale (prior session
                        // epoch); clamp so future events still deliver.
                        if cursor > newest {
                            cursor = newest;
                        }
                    }
                    tokio::select! {
                        () = transport.closed.cancelled() => break,
                        () = transport.wakeup.notified() => {}
                    }
                    continue;
                }
                for (event_id, payload) in batch {
                    cursor = event_id;
                    yield Ok(Event::default().id(event_id.to_string()).data(payload));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, RequestId, Version2};
    use futures::StreamExt;

    fn envelope(id: i64) -> Envelope {
        Envelope::Request(Request {
            jsonrpc: Version2,
            id: RequestId::Number(id),
            method: "ping".into(),
            params: None,
        })
    }

    #[tokio::test]
    async fn stream_replays_then_follows_live_events() {
        let store = Arc::new(EventStore::new(16));
        let transport = SseServerTransport::new("s1".into(), store);
        transport.deliver(&envelope(1));
        transport.deliver(&envelope(2));

        let mut stream = Box::pin(transport.clone().stream(None, Some("/sse?sessionId=s1".into())));

        let endpoint = stream.next().await.unwrap().unwrap();
        // Endpoint announcement comes first.
        assert!(format!("{endpoint:?}").contains("endpoint"));

        let first = stream.next().await.unwrap().unwrap();
        assert!(format!("{first:?}").contains("\"id\":1"));
        let second = stream.next().await.unwrap().unwrap();
        assert!(format!("{second:?}").contains("\"id\":2"));

        transport.deliver(&envelope(3));
        let third = stream.next().await.unwrap().unwrap();
        assert!(format!("{third:?}").contains("\"id\":3"));
    }

    #[tokio::test]
    async fn resume_skips_already_seen_events() {
        let store = Arc::new(EventStore::new(16));
        let transport = SseServerTransport::new("s1".into(), store);
        for i in 1..=3 {
            transport.deliver(&envelope(i));
        }

        let mut stream = Box::pin(transport.clone().stream(Some(2), None));
        let next = stream.next().await.unwrap().unwrap();
        let debug = format!("{next:?}");
        assert!(debug.contains("\"id\":3"), "got {debug}");
    }

    #[tokio::test]
    async fn resume_past_retained_window_resyncs_to_snapshot() {
        let store = Arc::new(EventStore::new(3));
        let transport = SseServerTransport::new("s1".into(), store);
        for i in 1..=6 {
            transport.deliver(&envelope(i));
        }

        // Events 1..=3 were evicted; a cursor of 1 must not stall the stream.
        let mut stream = Box::pin(transport.clone().stream(Some(1), None));
        for expected in 4..=6 {
            let next = stream.next().await.unwrap().unwrap();
            let debug = format!("{next:?}");
            assert!(debug.contains(&format!("\"id\":{expected}")), "got {debug}");
        }

        // The stream keeps following live events after the resync.
        transport.deliver(&envelope(7));
        let next = stream.next().await.unwrap().unwrap();
        assert!(format!("{next:?}").contains("\"id\":7"));
    }

    #[tokio::test]
    async fn stale_future_cursor_still_receives_new_events() {
        let store = Arc::new(EventStore::new(8));
        let transport = SseServerTransport::new("s1".into(), store);
        transport.deliver(&envelope(1));

        // A Last-Event-ID from a prior session epoch points past everything
        // retained; the stream must still pick up new events.
        let mut stream = Box::pin(transport.clone().stream(Some(500), None));
        transport.deliver(&envelope(2));
        let next = stream.next().await.unwrap().unwrap();
        assert!(format!("{next:?}").contains("\"id\":2"));
    }

    #[tokio::test]
    async fn close_ends_the_stream() {
        let store = Arc::new(EventStore::new(16));
        let transport = SseServerTransport::new("s1".into(), store);
        let mut stream = Box::pin(transport.clone().stream(None, None));
        transport.close();
        assert!(stream.next().await.is_none());
    }
}
