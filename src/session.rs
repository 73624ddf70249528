//! Session manager: the binding between client sessions and upstream
//! connections.
//!
//! Owns the connection table, the session→connection index, the in-flight
//! initialize guard, the shared global connection for singleton upstreams,
//! validation, and TTL eviction. All table state sits behind one coarse lock;
//! upstream I/O never happens while the lock is held.

use crate::bridge::ProxyBridge;
use crate::config::ProxySettings;
use crate::downstream::{SessionTransport, SseServerTransport, StreamableServerTransport};
use crate::error::ProxyError;
use crate::event_store::EventStore;
use crate::protocol::{
    self, Envelope, Notification, Request, RequestId, Response, ServerCapabilities, Version2,
};
use crate::upstream::{TransportFactory, UpstreamConnection};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Sentinel connection id shared by every session once the upstream turns out
/// to be a singleton that refuses to initialize twice.
pub const GLOBAL_CONNECTION_ID: &str = "global-mcp-connection";

/// Centralized predicate for the singleton-upstream signal. The upstream
/// contract is a message substring today; swap this for a structured code if
/// one appears.
pub fn is_already_initialized_error(message: &str) -> bool {
    message.contains("Server already initialized")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initializing,
    Connected,
    Disconnected,
    Error,
}

/// Which client-facing transport a session arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Sse,
    Streamable,
}

/// One upstream binding, shared by one or more sessions.
///
/// The id starts as the first session id that created the binding and changes
/// exactly once, to the global sentinel, when the upstream reveals itself as
/// a singleton. There is always one record per upstream session; keys alias,
/// the record is never cloned.
pub struct Connection {
    id: Mutex<String>,
    state: Mutex<ConnectionState>,
    pub bridge: ProxyBridge,
    /// The upstream's initialize result, relayed verbatim on session reuse.
    pub initialize_result: Value,
    pub upstream: Arc<UpstreamConnection>,
    pub created_at: Instant,
    last_used: Mutex<Instant>,
    /// Per-session server transports; the key set is the set of bound
    /// session ids.
    transports: Mutex<HashMap<String, SessionTransport>>,
    is_global: AtomicBool,
}

impl Connection {
    pub fn id(&self) -> String {
        self.id.lock().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn is_global(&self) -> bool {
        self.is_global.load(Ordering::Acquire)
    }

    fn promote_to_global(&self) {
        *self.id.lock() = GLOBAL_CONNECTION_ID.to_string();
        self.is_global.store(true, Ordering::Release);
    }

    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn last_used_instant(&self) -> Instant {
        *self.last_used.lock()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    pub fn session_count(&self) -> usize {
        self.transports.lock().len()
    }
}

/// Outcome of handling one client HTTP interaction.
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// Respond with this envelope (HTTP 200).
    Reply(Envelope),
    /// Initialize reply: envelope plus the session id for the
    /// `mcp-session-id` response header.
    ReplyWithSession { session_id: String, envelope: Envelope },
    /// Nothing to return beyond HTTP 202.
    Accepted,
    /// Session lifecycle error: HTTP status plus a JSON-RPC error envelope.
    Error { status: u16, envelope: Envelope },
}

fn session_error(status: u16, id: RequestId, error: &ProxyError) -> Dispatch {
    Dispatch::Error {
        status,
        envelope: error.to_envelope(id),
    }
}

#[derive(Default)]
struct Tables {
    active_connections: HashMap<String, Arc<Connection>>,
    session_to_connection: HashMap<String, String>,
    initializing: HashMap<String, Arc<Notify>>,
    /// SSE sessions exist from GET attach onward, possibly before any
    /// connection is bound.
    sse_sessions: HashMap<String, Arc<SseServerTransport>>,
}

pub struct SessionManager {
    tables: Mutex<Tables>,
    factory: Box<dyn TransportFactory>,
    store: Arc<EventStore>,
    settings: ProxySettings,
    shutdown: CancellationToken,
    /// Self-reference handed to background tasks so they never keep the
    /// manager alive.
    weak_self: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(factory: Box<dyn TransportFactory>, settings: ProxySettings) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak| SessionManager {
            tables: Mutex::new(Tables::default()),
            store: Arc::new(EventStore::new(settings.event_capacity)),
            factory,
            settings,
            shutdown: CancellationToken::new(),
            weak_self: weak.clone(),
        });
        manager.clone().spawn_sweeper();
        manager
    }

    pub fn event_store(&self) -> Arc<EventStore> {
        self.store.clone()
    }

    /// (bound sessions, active connections) for the status surface.
    pub fn counts(&self) -> (usize, usize) {
        let tables = self.tables.lock();
        (
            tables.session_to_connection.len(),
            tables.active_connections.len(),
        )
    }

    /// Connection id a session currently resolves to.
    pub fn connection_id_for_session(&self, sid: &str) -> Option<String> {
        self.tables.lock().session_to_connection.get(sid).cloned()
    }

    // ========================================================================
    // Initialize
    // ========================================================================

    /// Handle an `initialize` request for `header_sid` (minting a session id
    /// when absent).
    pub async fn initialize(
        &self,
        header_sid: Option<String>,
        request: Request,
        kind: TransportKind,
        upstream_hint: Option<String>,
    ) -> Dispatch {
        let sid = header_sid.unwrap_or_else(|| Uuid::new_v4().to_string());

        // Guard: one initialize in flight per session id. A waiter that finds
        // a published mapping after the bounded wait proceeds as a reuse; one
        // that does not takes the guard over.
        loop {
            let waiter = {
                let mut tables = self.tables.lock();
                match tables.initializing.get(&sid) {
                    Some(notify) => Some(notify.clone()),
                    None => {
                        tables
                            .initializing
                            .insert(sid.clone(), Arc::new(Notify::new()));
                        None
                    }
                }
            };
            let Some(notify) = waiter else { break };
            let _ = tokio::time::timeout(self.settings.initialize_wait, notify.notified()).await;
            let mut tables = self.tables.lock();
            tables
                .initializing
                .insert(sid.clone(), Arc::new(Notify::new()));
            break;
        }

        let outcome = self
            .run_initialize(sid.clone(), request, kind, upstream_hint)
            .await;

        let notify = self.tables.lock().initializing.remove(&sid);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
        outcome
    }

    async fn run_initialize(
        &self,
        sid: String,
        request: Request,
        kind: TransportKind,
        upstream_hint: Option<String>,
    ) -> Dispatch {
        // Reuse: the session is already bound.
        if let Some(conn) = self.connection_for_session(&sid) {
            if self.validate_connection(&conn) {
                tracing::debug!(session_id = %sid, connection_id = %conn.id(), "initialize reuses existing connection");
                conn.touch();
                self.bind_session(&conn, &sid, kind);
                let envelope = Envelope::Response(Response::ok(
                    request.id,
                    conn.initialize_result.clone(),
                ));
                return Dispatch::ReplyWithSession {
                    session_id: sid,
                    envelope,
                };
            }
            self.cleanup_connection(&conn.id()).await;
        }

        // Global reuse: a singleton upstream is already shared.
        let global = self
            .tables
            .lock()
            .active_connections
            .get(GLOBAL_CONNECTION_ID)
            .cloned();
        if let Some(conn) = global {
            if self.validate_connection(&conn) {
                tracing::info!(session_id = %sid, "binding session to the global connection");
                conn.touch();
                self.bind_session(&conn, &sid, kind);
                let envelope = Envelope::Response(Response::ok(
                    request.id,
                    conn.initialize_result.clone(),
                ));
                return Dispatch::ReplyWithSession {
                    session_id: sid,
                    envelope,
                };
            }
            self.cleanup_connection(&conn.id()).await;
        }

        // New connection: connect the upstream and run its initialize with
        // the client's original request (ids are never rewritten).
        let transport = match self.factory.build(upstream_hint.as_deref()).await {
            Ok(t) => t,
            Err(e) => return self.initialize_failure(&sid, request.id, e),
        };
        let upstream = match UpstreamConnection::establish(
            transport,
            self.settings.request_timeout,
        )
        .await
        {
            Ok(u) => u,
            Err(e) => return self.initialize_failure(&sid, request.id, e),
        };

        let client_id = request.id.clone();
        let client_params = request.params.clone();
        let init_response = match upstream.request(request).await {
            Ok(r) => r,
            Err(e) => {
                upstream.close().await;
                return self.initialize_failure(&sid, client_id, e);
            }
        };

        let init_error = init_response.error.clone();
        let (connection_id, bridge, initialize_result, reply, is_global) =
            match &init_error {
                None => {
                    let result = init_response.result.clone().unwrap_or(Value::Null);
                    let caps = protocol::capabilities_from_initialize_result(&result);
                    // Complete the MCP handshake on the upstream's behalf.
                    let initialized = Envelope::Notification(Notification {
                        jsonrpc: Version2,
                        method: "notifications/initialized".into(),
                        params: None,
                    });
                    if let Err(e) = upstream.send(&initialized).await {
                        tracing::warn!(error = %e, "failed to send notifications/initialized upstream");
                    }
                    (
                        sid.clone(),
                        ProxyBridge::new(caps),
                        result,
                        Envelope::Response(init_response),
                        false,
                    )
                }
                Some(err) if is_already_initialized_error(&err.message) => {
                    tracing::info!(
                        session_id = %sid,
                        "upstream is a singleton; using the shared global connection"
                    );
                    let caps = ServerCapabilities::default_for_global();
                    let result =
                        protocol::synthesized_initialize_result(client_params.as_ref(), &caps);

                    // Promote the connection that already initialized this
                    // upstream; the freshly opened transport is redundant.
                    if let Some(conn) = self.promote_existing_to_global() {
                        if self.validate_connection(&conn) {
                            upstream.close().await;
                            conn.touch();
                            self.bind_session(&conn, &sid, kind);
                            return Dispatch::ReplyWithSession {
                                session_id: sid,
                                envelope: Envelope::Response(Response::ok(client_id, result)),
                            };
                        }
                        self.cleanup_connection(&conn.id()).await;
                    }

                    // Nothing to promote (the upstream was initialized before
                    // we ever connected): this transport becomes the global
                    // connection, gated by the default capability set.
                    let reply =
                        Envelope::Response(Response::ok(client_id.clone(), result.clone()));
                    (
                        GLOBAL_CONNECTION_ID.to_string(),
                        ProxyBridge::new(caps),
                        result,
                        reply,
                        true,
                    )
                }
                Some(err) => {
                    tracing::warn!(session_id = %sid, code = err.code, error = %err.message, "upstream rejected initialize");
                    upstream.close().await;
                    // Pass the upstream's own error through verbatim.
                    return Dispatch::Error {
                        status: 200,
                        envelope: Envelope::Response(init_response),
                    };
                }
            };

        let connection = Arc::new(Connection {
            id: Mutex::new(connection_id.clone()),
            state: Mutex::new(ConnectionState::Connected),
            bridge,
            initialize_result,
            upstream: upstream.clone(),
            created_at: Instant::now(),
            last_used: Mutex::new(Instant::now()),
            transports: Mutex::new(HashMap::new()),
            is_global: AtomicBool::new(is_global),
        });

        // Publish. If a racing initialize already registered this key, fold
        // into the existing record and drop ours.
        let raced = {
            let mut tables = self.tables.lock();
            match tables.active_connections.get(&connection_id).cloned() {
                Some(existing) => Some(existing),
                None => {
                    tables
                        .active_connections
                        .insert(connection_id.clone(), connection.clone());
                    None
                }
            }
        };
        let connection = match raced {
            Some(existing) => {
                upstream.close().await;
                existing
            }
            None => {
                self.spawn_connection_pumps(&connection);
                connection
            }
        };
        self.bind_session(&connection, &sid, kind);
        connection.touch();

        tracing::info!(
            session_id = %sid,
            connection_id = %connection.id(),
            upstream = %connection.upstream.describe(),
            "session initialized"
        );

        Dispatch::ReplyWithSession {
            session_id: sid,
            envelope: reply,
        }
    }

    /// Re-key the connection that holds the singleton upstream session under
    /// the global sentinel, re-pointing every bound session id. Returns the
    /// global connection if one exists or was promoted.
    fn promote_existing_to_global(&self) -> Option<Arc<Connection>> {
        let mut tables = self.tables.lock();
        if let Some(conn) = tables.active_connections.get(GLOBAL_CONNECTION_ID) {
            return Some(conn.clone());
        }
        let old_key = tables
            .active_connections
            .iter()
            .filter(|(key, _)| key.as_str() != GLOBAL_CONNECTION_ID)
            .max_by_key(|(_, conn)| conn.last_used_instant())
            .map(|(key, _)| key.clone())?;
        let conn = tables.active_connections.remove(&old_key)?;
        conn.promote_to_global();
        tables
            .active_connections
            .insert(GLOBAL_CONNECTION_ID.to_string(), conn.clone());
        for mapped in tables.session_to_connection.values_mut() {
            if *mapped == old_key {
                *mapped = GLOBAL_CONNECTION_ID.to_string();
            }
        }
        tracing::info!(previous = %old_key, "promoted connection to the global sentinel");
        Some(conn)
    }

    fn initialize_failure(&self, sid: &str, id: RequestId, error: ProxyError) -> Dispatch {
        tracing::warn!(session_id = %sid, error = %error, "initialize failed");
        session_error(200, id, &error)
    }

    // ========================================================================
    // Subsequent dispatch
    // ========================================================================

    /// Handle a non-initialize envelope for an existing session.
    pub async fn dispatch(
        &self,
        header_sid: Option<String>,
        envelope: Envelope,
    ) -> Dispatch {
        let Some(sid) = header_sid else {
            return session_error(400, RequestId::Null, &ProxyError::MissingSession);
        };

        let Some(conn) = self.connection_for_session(&sid) else {
            return session_error(200, RequestId::Null, &ProxyError::SessionNotFound);
        };

        if !self.validate_connection(&conn) {
            self.cleanup_connection(&conn.id()).await;
            let id = envelope.request_id().cloned().unwrap_or(RequestId::Null);
            return session_error(200, id, &ProxyError::ConnectionLost);
        }
        conn.touch();

        match envelope {
            Envelope::Request(request) => {
                let response = conn.bridge.forward_request(&conn.upstream, request).await;
                Dispatch::Reply(Envelope::Response(response))
            }
            Envelope::Notification(notification) => {
                if conn.bridge.relays_to_upstream(&notification.method) {
                    if let Err(e) = conn
                        .upstream
                        .send(&Envelope::Notification(notification))
                        .await
                    {
                        tracing::warn!(session_id = %sid, error = %e, "failed to relay notification upstream");
                    }
                } else {
                    tracing::debug!(
                        session_id = %sid,
                        method = %notification.method,
                        "dropping notification outside negotiated capabilities"
                    );
                }
                Dispatch::Accepted
            }
            Envelope::Response(response) => {
                // Client answering a server-initiated request.
                if let Err(e) = conn.upstream.send(&Envelope::Response(response)).await {
                    tracing::warn!(session_id = %sid, error = %e, "failed to relay response upstream");
                }
                Dispatch::Accepted
            }
        }
    }

    // ========================================================================
    // Session/transport bookkeeping
    // ========================================================================

    /// Get or create the SSE transport for a GET attach; mints a session id
    /// when the client presents none.
    pub fn sse_attach(&self, header_sid: Option<String>) -> (String, Arc<SseServerTransport>) {
        let sid = header_sid.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut tables = self.tables.lock();
        let transport = tables
            .sse_sessions
            .entry(sid.clone())
            .or_insert_with(|| SseServerTransport::new(sid.clone(), self.store.clone()))
            .clone();
        transport.touch();
        (sid, transport)
    }

    /// Deliver an envelope to a session's server transport, if any.
    pub fn deliver_to_session(&self, sid: &str, envelope: &Envelope) -> bool {
        let transport = {
            let tables = self.tables.lock();
            tables
                .session_to_connection
                .get(sid)
                .and_then(|cid| tables.active_connections.get(cid))
                .and_then(|conn| conn.transports.lock().get(sid).cloned())
                .or_else(|| {
                    tables
                        .sse_sessions
                        .get(sid)
                        .cloned()
                        .map(SessionTransport::Sse)
                })
        };
        match transport {
            Some(t) => {
                t.deliver(envelope);
                true
            }
            None => false,
        }
    }

    /// Unbind and close one session. The connection itself lingers until the
    /// TTL sweep once its session set drains.
    pub async fn close_session(&self, sid: &str) -> bool {
        let transport = {
            let mut tables = self.tables.lock();
            let cid = tables.session_to_connection.remove(sid);
            let conn = cid.and_then(|cid| tables.active_connections.get(&cid).cloned());
            tables.sse_sessions.remove(sid);
            conn.as_ref().and_then(|c| c.transports.lock().remove(sid))
        };
        match transport {
            Some(t) => {
                t.close();
                tracing::info!(session_id = %sid, "session closed");
                true
            }
            None => false,
        }
    }

    fn connection_for_session(&self, sid: &str) -> Option<Arc<Connection>> {
        let tables = self.tables.lock();
        tables
            .session_to_connection
            .get(sid)
            .and_then(|cid| tables.active_connections.get(cid))
            .cloned()
    }

    fn bind_session(&self, conn: &Arc<Connection>, sid: &str, kind: TransportKind) {
        let mut tables = self.tables.lock();
        tables
            .session_to_connection
            .insert(sid.to_string(), conn.id());
        let mut transports = conn.transports.lock();
        if transports.contains_key(sid) {
            return;
        }
        let transport = match kind {
            TransportKind::Sse => {
                let t = tables
                    .sse_sessions
                    .entry(sid.to_string())
                    .or_insert_with(|| {
                        SseServerTransport::new(sid.to_string(), self.store.clone())
                    })
                    .clone();
                SessionTransport::Sse(t)
            }
            TransportKind::Streamable => SessionTransport::Streamable(
                StreamableServerTransport::new(sid.to_string(), self.store.clone()),
            ),
        };
        transports.insert(sid.to_string(), transport);
    }

    // ========================================================================
    // Validation & cleanup
    // ========================================================================

    pub fn validate_connection(&self, conn: &Connection) -> bool {
        conn.state() == ConnectionState::Connected && !conn.upstream.is_closed()
    }

    /// Remove a connection and everything bound to it. Errors on the close
    /// paths are logged, never propagated.
    pub async fn cleanup_connection(&self, connection_id: &str) {
        let conn = {
            let mut tables = self.tables.lock();
            let Some(conn) = tables.active_connections.remove(connection_id) else {
                return;
            };
            let bound: Vec<String> = conn.transports.lock().keys().cloned().collect();
            for sid in &bound {
                tables.session_to_connection.remove(sid);
                tables.sse_sessions.remove(sid);
            }
            conn
        };
        conn.set_state(ConnectionState::Disconnected);
        let transports: Vec<SessionTransport> =
            conn.transports.lock().drain().map(|(_, t)| t).collect();
        for transport in transports {
            transport.close();
        }
        conn.upstream.close().await;
        tracing::info!(connection_id = %connection_id, "connection cleaned up");
    }

    /// One eviction pass: drop connections idle past the TTL with no bound
    /// sessions, and orphaned SSE sessions that never initialized.
    pub async fn sweep_once(&self) {
        let idle_ttl = self.settings.idle_ttl;
        let stale: Vec<String> = {
            let tables = self.tables.lock();
            tables
                .active_connections
                .iter()
                .filter(|(_, c)| c.session_count() == 0 && c.idle_for() > idle_ttl)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for connection_id in stale {
            tracing::info!(connection_id = %connection_id, "evicting idle connection");
            self.cleanup_connection(&connection_id).await;
        }

        let orphans: Vec<Arc<SseServerTransport>> = {
            let mut tables = self.tables.lock();
            let stale_sids: Vec<String> = tables
                .sse_sessions
                .iter()
                .filter(|(sid, transport)| {
                    !tables.session_to_connection.contains_key(*sid)
                        && transport.idle_for() > idle_ttl
                })
                .map(|(sid, _)| sid.clone())
                .collect();
            stale_sids
                .iter()
                .filter_map(|sid| tables.sse_sessions.remove(sid))
                .collect()
        };
        for transport in orphans {
            transport.close();
        }
    }

    fn spawn_sweeper(self: Arc<Self>) {
        let weak = Arc::downgrade(&self);
        let interval = self.settings.sweep_interval;
        let shutdown = self.shutdown.clone();
        drop(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = weak.upgrade() else { break };
                manager.sweep_once().await;
            }
        });
    }

    /// Relay server-initiated traffic to bound sessions and reap the
    /// connection when its upstream goes away.
    fn spawn_connection_pumps(&self, conn: &Arc<Connection>) {
        let weak_conn = Arc::downgrade(conn);
        let mut server_rx = conn.upstream.subscribe();
        tokio::spawn(async move {
            loop {
                let envelope = match server_rx.recv().await {
                    Ok(envelope) => envelope,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "server-push fan-out lagged; events dropped");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let Some(conn) = weak_conn.upgrade() else { break };
                let targets: Vec<SessionTransport> =
                    conn.transports.lock().values().cloned().collect();
                match &envelope {
                    Envelope::Notification(n) => {
                        if !conn.bridge.relays_to_client(&n.method) {
                            tracing::debug!(method = %n.method, "suppressing upstream notification outside capabilities");
                            continue;
                        }
                        for transport in targets {
                            transport.deliver(&envelope);
                        }
                    }
                    // Server→client request: delivered opaquely; the client's
                    // response envelope comes back on its POST path.
                    Envelope::Request(_) => {
                        for transport in targets {
                            transport.deliver(&envelope);
                        }
                    }
                    Envelope::Response(_) => {}
                }
            }
        });

        let weak_manager = self.weak_self.clone();
        let weak_conn = Arc::downgrade(conn);
        let closed = conn.upstream.closed_token();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = closed.cancelled() => {
                    if let (Some(manager), Some(conn)) = (weak_manager.upgrade(), weak_conn.upgrade()) {
                        let connection_id = conn.id();
                        tracing::info!(connection_id = %connection_id, "upstream closed; tearing the connection down");
                        manager.cleanup_connection(&connection_id).await;
                    }
                }
            }
        });
    }

    /// Close every connection; used on graceful shutdown.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<String> = {
            let tables = self.tables.lock();
            tables.active_connections.keys().cloned().collect()
        };
        for id in ids {
            self.cleanup_connection(&id).await;
        }
    }
}
