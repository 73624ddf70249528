//! Remote streamable-HTTP upstream transport.
//!
//! Each outgoing envelope is POSTed to the upstream URL. The session id the
//! upstream hands back on initialize is echoed on every subsequent request.
//! Response bodies are either a single JSON envelope or an SSE stream of
//! envelopes; after initialize the transport also opens a best-effort GET
//! stream for server-initiated traffic.

use crate::error::{ProxyError, Result};
use crate::protocol::Envelope;
use crate::upstream::{TransportEvent, UpstreamTransport};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const HEADER_SESSION_ID: &str = "mcp-session-id";

pub struct StreamableHttpTransport {
    http: reqwest::Client,
    url: String,
    session_id: Arc<parking_lot::Mutex<Option<String>>>,
    events_tx: Option<mpsc::UnboundedSender<TransportEvent>>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    /// True while the GET listening stream is running.
    stream_running: Arc<AtomicBool>,
    /// False once the upstream answered the GET with 405.
    stream_supported: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl StreamableHttpTransport {
    pub fn new(http: reqwest::Client, url: String) -> Self {
        StreamableHttpTransport {
            http,
            url,
            session_id: Arc::new(parking_lot::Mutex::new(None)),
            events_tx: None,
            events_rx: None,
            stream_running: Arc::new(AtomicBool::new(false)),
            stream_supported: Arc::new(AtomicBool::new(true)),
            shutdown: CancellationToken::new(),
        }
    }

    fn base_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        if let Some(sid) = self.session_id.lock().as_deref() {
            if let Ok(v) = HeaderValue::from_str(sid) {
                headers.insert(HEADER_SESSION_ID, v);
            }
        }
        headers
    }

    /// Open the server→client GET stream if it is not already running.
    fn maybe_open_listen_stream(&self) {
        let Some(events_tx) = self.events_tx.clone() else {
            return;
        };
        if !self.stream_supported.load(Ordering::SeqCst) {
            return;
        }
        if self.stream_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(sid) = self.session_id.lock().clone() else {
            self.stream_running.store(false, Ordering::SeqCst);
            return;
        };

        let http = self.http.clone();
        let url = self.url.clone();
        let running = self.stream_running.clone();
        let supported = self.stream_supported.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let result = http
                .get(&url)
                .header(ACCEPT, "text/event-stream")
                .header(HEADER_SESSION_ID, sid)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED => {
                    supported.store(false, Ordering::SeqCst);
                }
                Ok(resp) if resp.status().is_success() => {
                    let mut stream = resp.bytes_stream().eventsource();
                    loop {
                        tokio::select! {
                            () = shutdown.cancelled() => break,
                            event = stream.next() => match event {
                                Some(Ok(event)) => {
                                    if event.data.trim().is_empty() {
                                        continue;
                                    }
                                    match Envelope::decode(event.data.as_bytes()) {
                                        Ok(envelope) => {
                                            if events_tx.send(TransportEvent::Message(envelope)).is_err() {
                                                break;
                                            }
                                        }
                                        Err(e) => {
                                            tracing::warn!(error = %e, "undecodable upstream SSE event");
                                        }
                                    }
                                }
                                Some(Err(e)) => {
                                    tracing::debug!(error = %e, "upstream listen stream error");
                                    break;
                                }
                                None => break,
                            }
                        }
                    }
                }
                Ok(resp) => {
                    tracing::debug!(status = %resp.status(), "upstream listen stream rejected");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "upstream listen stream failed");
                }
            }
            running.store(false, Ordering::SeqCst);
        });
    }
}

#[async_trait]
impl UpstreamTransport for StreamableHttpTransport {
    async fn connect(&mut self) -> Result<()> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.events_tx = Some(events_tx);
        self.events_rx = Some(events_rx);
        tracing::info!(url = %self.url, "connected streamable-http upstream");
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.take()
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let events_tx = self
            .events_tx
            .clone()
            .ok_or(ProxyError::UpstreamClosed)?;
        let is_initialize = envelope.is_initialize_request();

        let response = self
            .http
            .post(&self.url)
            .headers(self.base_headers())
            .json(envelope)
            .send()
            .await
            .map_err(|e| ProxyError::UpstreamIo(format!("POST {} failed: {e}", self.url)))?;

        if is_initialize {
            if let Some(sid) = response
                .headers()
                .get(HEADER_SESSION_ID)
                .and_then(|v| v.to_str().ok())
            {
                tracing::debug!(session_id = %sid, "captured upstream session id");
                *self.session_id.lock() = Some(sid.to_string());
            }
        }

        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            // Stream of envelopes answering this POST; drain in background so
            // the caller's pending-map waiter sees the response when it lands.
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let mut stream = response.bytes_stream().eventsource();
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        event = stream.next() => match event {
                            Some(Ok(event)) => {
                                if event.data.trim().is_empty() {
                                    continue;
                                }
                                match Envelope::decode(event.data.as_bytes()) {
                                    Ok(envelope) => {
                                        if events_tx.send(TransportEvent::Message(envelope)).is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!(error = %e, "undecodable upstream SSE event");
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                tracing::debug!(error = %e, "upstream response stream error");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            });
        } else {
            // Single JSON envelope, or an error body. A JSON-RPC error body on
            // a non-2xx status still has to reach the requester for proper
            // error pass-through.
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ProxyError::UpstreamIo(format!("reading upstream body: {e}")))?;
            if !bytes.is_empty() {
                match Envelope::decode(&bytes) {
                    Ok(envelope) => {
                        let _ = events_tx.send(TransportEvent::Message(envelope));
                    }
                    Err(e) => {
                        if !status.is_success() {
                            return Err(ProxyError::UpstreamIo(format!(
                                "upstream returned {status}: {}",
                                String::from_utf8_lossy(&bytes)
                            )));
                        }
                        tracing::warn!(error = %e, "undecodable upstream response body");
                    }
                }
            } else if !status.is_success() {
                return Err(ProxyError::UpstreamIo(format!(
                    "upstream returned {status}"
                )));
            }
        }

        if is_initialize {
            self.maybe_open_listen_stream();
        }
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
        // Best-effort session teardown on the upstream.
        let sid = self.session_id.lock().clone();
        if let Some(sid) = sid {
            let _ = self
                .http
                .delete(&self.url)
                .header(HEADER_SESSION_ID, sid)
                .send()
                .await;
        }
        if let Some(tx) = &self.events_tx {
            let _ = tx.send(TransportEvent::Closed);
        }
    }

    fn describe(&self) -> String {
        format!("streamable-http:{}", self.url)
    }
}
