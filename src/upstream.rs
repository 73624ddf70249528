//! Upstream-facing client transports.
//!
//! An [`UpstreamTransport`] moves envelopes between the proxy and one MCP
//! server; [`UpstreamConnection`] layers request/response correlation, the
//! forwarded-request timeout, and a broadcast of server-initiated traffic on
//! top of whichever transport variant is in use.

use crate::error::{ProxyError, Result};
use crate::protocol::{Envelope, Request, RequestId, Response};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub mod stdio;
pub mod streamable_http;

pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;

/// Events a transport reports back to its connection.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One decoded envelope arrived from the upstream.
    Message(Envelope),
    /// The transport is gone (child exited, stream ended, close requested).
    Closed,
}

/// Contract implemented by both upstream transport variants.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Establish the transport (spawn the child / prime the HTTP client).
    async fn connect(&mut self) -> Result<()>;

    /// Take the inbound event stream. Yields `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Write one envelope toward the upstream.
    async fn send(&self, envelope: &Envelope) -> Result<()>;

    /// Tear the transport down. Idempotent.
    async fn close(&self);

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

type PendingMap = Arc<Mutex<HashMap<RequestId, VecDeque<oneshot::Sender<Response>>>>>;

/// One live upstream MCP session.
///
/// Requests are correlated by the exact JSON-RPC id the caller chose; ids are
/// never rewritten. Sessions sharing a connection may race the same id value,
/// so each id keys a FIFO of waiters and same-id responses are fulfilled in
/// arrival order.
pub struct UpstreamConnection {
    transport: Box<dyn UpstreamTransport>,
    pending: PendingMap,
    server_tx: broadcast::Sender<Envelope>,
    closed: CancellationToken,
    request_timeout: Duration,
}

impl UpstreamConnection {
    /// Connect the transport and start pumping its events.
    pub async fn establish(
        mut transport: Box<dyn UpstreamTransport>,
        request_timeout: Duration,
    ) -> Result<Arc<Self>> {
        transport.connect().await?;
        let events = transport
            .take_events()
            .ok_or_else(|| ProxyError::Internal("transport events already taken".into()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (server_tx, _) = broadcast::channel(256);
        let closed = CancellationToken::new();

        tokio::spawn(pump_events(
            events,
            pending.clone(),
            server_tx.clone(),
            closed.clone(),
        ));

        Ok(Arc::new(UpstreamConnection {
            transport,
            pending,
            server_tx,
            closed,
            request_timeout,
        }))
    }

    /// Forward a request and await the correlated response.
    pub async fn request(&self, request: Request) -> Result<Response> {
        if self.is_closed() {
            return Err(ProxyError::UpstreamClosed);
        }

        let id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().entry(id.clone()).or_default().push_back(tx);

        // The timeout covers the whole round trip: a hung write counts the
        // same as a missing response.
        let round_trip = async {
            self.transport.send(&Envelope::Request(request)).await?;
            rx.await.map_err(|_| ProxyError::UpstreamClosed)
        };
        match tokio::time::timeout(self.request_timeout, round_trip).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.prune_pending(&id);
                Err(e)
            }
            Err(_) => {
                self.prune_pending(&id);
                Err(ProxyError::RequestTimeout(self.request_timeout))
            }
        }
    }

    /// Forward a notification or a client-originated response verbatim.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(ProxyError::UpstreamClosed);
        }
        self.transport.send(envelope).await
    }

    /// Subscribe to server-initiated envelopes (notifications and requests).
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.server_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled once the transport is gone.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// Close the transport and fail anything still in flight.
    pub async fn close(&self) {
        self.transport.close().await;
        self.closed.cancel();
        self.pending.lock().clear();
    }

    fn prune_pending(&self, id: &RequestId) {
        let mut pending = self.pending.lock();
        if let Some(queue) = pending.get_mut(id) {
            queue.retain(|tx| !tx.is_closed());
            if queue.is_empty() {
                pending.remove(id);
            }
        }
    }
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    pending: PendingMap,
    server_tx: broadcast::Sender<Envelope>,
    closed: CancellationToken,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(Envelope::Response(response)) => {
                deliver_response(&pending, response);
            }
            TransportEvent::Message(envelope) => {
                // Server-initiated request or notification; fan out to
                // whoever is listening. No listeners is fine.
                let _ = server_tx.send(envelope);
            }
            TransportEvent::Closed => break,
        }
    }

    closed.cancel();
    // Dropping the waiters fails every in-flight request with UpstreamClosed.
    pending.lock().clear();
}

fn deliver_response(pending: &PendingMap, response: Response) {
    let mut pending = pending.lock();
    let Some(queue) = pending.get_mut(&response.id) else {
        tracing::debug!(id = %response.id, "dropping unmatched upstream response");
        return;
    };
    // Skip waiters that already timed out.
    while let Some(tx) = queue.pop_front() {
        if tx.send(response.clone()).is_ok() {
            break;
        }
    }
    if queue.is_empty() {
        pending.remove(&response.id);
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Where new upstream connections come from.
#[derive(Debug, Clone)]
pub enum UpstreamTarget {
    /// Spawn a child process speaking newline-delimited JSON on stdio.
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        shell: bool,
    },
    /// A fixed remote streamable-HTTP endpoint.
    Remote { url: String },
    /// No fixed upstream: each session supplies its own URL at initialize.
    Dynamic,
}

/// Builds one transport per new connection.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn build(&self, upstream_hint: Option<&str>) -> Result<Box<dyn UpstreamTransport>>;
}

pub struct UpstreamFactory {
    target: UpstreamTarget,
    http: reqwest::Client,
}

impl UpstreamFactory {
    pub fn new(target: UpstreamTarget, http: reqwest::Client) -> Self {
        UpstreamFactory { target, http }
    }
}

#[async_trait]
impl TransportFactory for UpstreamFactory {
    async fn build(&self, upstream_hint: Option<&str>) -> Result<Box<dyn UpstreamTransport>> {
        match &self.target {
            UpstreamTarget::Stdio {
                command,
                args,
                env,
                shell,
            } => Ok(Box::new(StdioTransport::new(
                command.clone(),
                args.clone(),
                env.clone(),
                *shell,
            ))),
            UpstreamTarget::Remote { url } => Ok(Box::new(StreamableHttpTransport::new(
                self.http.clone(),
                url.clone(),
            ))),
            UpstreamTarget::Dynamic => {
                let url = upstream_hint.ok_or_else(|| {
                    ProxyError::TransportSetup(
                        "dynamic proxy mode requires an `upstream=<url>` query parameter on initialize"
                            .into(),
                    )
                })?;
                Ok(Box::new(StreamableHttpTransport::new(
                    self.http.clone(),
                    url.to_string(),
                )))
            }
        }
    }
}
