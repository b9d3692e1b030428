//! Connection registry and dispatch engine.
//!
//! The [`Server`] owns the identity↔connection mappings and the route
//! table, accepts WebSocket upgrades, and runs the per-connection loops:
//! an inline reader, a processing loop draining the bounded channel, an
//! acknowledgment loop when the configured tier needs one, and a
//! keepalive watcher that reclaims idle sockets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::SplitStream;
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use courier_core::{AckMode, Frame, FrameType};

use crate::auth::{Authenticator, UpgradeRequest, SUBPROTOCOL_HEADER};
use crate::connection::{AckStep, Connection, ConnectionId};
use crate::error::SendError;
use crate::router::{Route, RouteHandler};
use crate::transport::WsTransport;

/// How long the acknowledgment loop waits before retransmitting an
/// unanswered Ack request.
const ACK_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Default idle allowance. Large enough that reclamation is effectively
/// off until configured.
const DEFAULT_MAX_CONNECTION_IDLE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    /// URL path that accepts the WebSocket upgrade.
    pub pattern: String,
    /// Connections read/write-idle longer than this are reclaimed.
    pub max_connection_idle: Duration,
    /// Reliability tier applied to inbound frames.
    pub ack_mode: AckMode,
    /// How long a rigorous-tier frame may await client confirmation.
    pub ack_timeout: Duration,
    /// Reserved worker-pool size; handler dispatch currently runs inline
    /// on the processing loop.
    pub concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9090,
            pattern: "/ws".to_string(),
            max_connection_idle: DEFAULT_MAX_CONNECTION_IDLE,
            ack_mode: AckMode::Disabled,
            ack_timeout: Duration::from_secs(30),
            concurrency: 10,
        }
    }
}

/// Identity↔connection mappings, kept mutual inverses under one lock.
#[derive(Default)]
struct ConnectionTable {
    by_conn: HashMap<ConnectionId, String>,
    by_user: HashMap<String, Arc<Connection>>,
}

/// The connection registry and dispatcher.
pub struct Server {
    config: ServerConfig,
    auth: Arc<dyn Authenticator>,
    routes: RwLock<HashMap<String, RouteHandler>>,
    table: RwLock<ConnectionTable>,
}

impl Server {
    pub fn new(config: ServerConfig, auth: Arc<dyn Authenticator>) -> Arc<Self> {
        Arc::new(Self {
            config,
            auth,
            routes: RwLock::new(HashMap::new()),
            table: RwLock::new(ConnectionTable::default()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Install method routes. Called once at startup, before `start`.
    pub fn add_routes(&self, routes: Vec<Route>) {
        let mut table = self.routes.write();
        for r in routes {
            table.insert(r.method, r.handler);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.table.read().by_user.len()
    }

    pub fn connection_for(&self, uid: &str) -> Option<Arc<Connection>> {
        self.table.read().by_user.get(uid).cloned()
    }

    /// Live connections for the given identities; identities without one
    /// are skipped.
    pub fn connections_for(&self, uids: &[&str]) -> Vec<Arc<Connection>> {
        let table = self.table.read();
        uids.iter()
            .filter_map(|uid| table.by_user.get(*uid).cloned())
            .collect()
    }

    /// Identities for the given connections; with no connections given,
    /// every identity currently registered.
    pub fn user_ids(&self, conns: &[Arc<Connection>]) -> Vec<String> {
        let table = self.table.read();
        if conns.is_empty() {
            table.by_conn.values().cloned().collect()
        } else {
            conns
                .iter()
                .filter_map(|conn| table.by_conn.get(conn.id()).cloned())
                .collect()
        }
    }

    /// Install a connection for an identity, evicting and closing any
    /// previous connection registered under it. The map surgery happens
    /// under the exclusive lock; the evicted transport is closed after.
    pub async fn register(&self, conn: Arc<Connection>, uid: String) {
        let evicted = {
            let mut table = self.table.write();
            let evicted = table.by_user.remove(&uid);
            if let Some(old) = &evicted {
                table.by_conn.remove(old.id());
            }
            table.by_conn.insert(conn.id().clone(), uid.clone());
            table.by_user.insert(uid.clone(), conn);
            evicted
        };
        if let Some(old) = evicted {
            tracing::info!(uid = %uid, conn_id = %old.id(), "evicted previous connection for identity");
            old.close().await;
        }
    }

    /// Remove a connection from the registry and close its transport.
    /// A connection that is not registered is a no-op.
    pub async fn close(&self, conn: &Arc<Connection>) {
        let uid = {
            let mut table = self.table.write();
            let Some(uid) = table.by_conn.remove(conn.id()) else {
                return;
            };
            table.by_user.remove(&uid);
            uid
        };
        tracing::info!(uid = %uid, conn_id = %conn.id(), "connection closed");
        conn.close().await;
    }

    /// Send a frame to each identity, skipping identities with no live
    /// connection.
    pub async fn send_to_users(&self, frame: &Frame, uids: &[&str]) -> Result<(), SendError> {
        if uids.is_empty() {
            return Ok(());
        }
        let conns = self.connections_for(uids);
        self.broadcast(frame, &conns).await
    }

    /// Serialize once and write to each connection sequentially, stopping
    /// at the first write failure.
    pub async fn broadcast(
        &self,
        frame: &Frame,
        conns: &[Arc<Connection>],
    ) -> Result<(), SendError> {
        if conns.is_empty() {
            return Ok(());
        }
        let text = serde_json::to_string(frame)?;
        for conn in conns {
            conn.write_text(&text).await?;
        }
        Ok(())
    }

    /// Whether the frame participates in acknowledgment tracking. With no
    /// frame, answers for the configured tier as a whole.
    fn requires_ack(&self, frame: Option<&Frame>) -> bool {
        self.config.ack_mode != AckMode::Disabled
            && frame.map_or(true, |f| f.frame_type != FrameType::NoAck)
    }

    /// Build the HTTP router: the upgrade endpoint plus a health probe.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(&self.config.pattern, get(upgrade_handler))
            .route("/health", get(health_handler))
            .with_state(Arc::clone(self))
            .layer(CorsLayer::permissive())
    }

    /// Bind and serve. Returns a handle holding the serve task and the
    /// bound port (useful with port 0).
    pub async fn start(self: Arc<Self>) -> Result<ServerHandle, std::io::Error> {
        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(
            port = local_addr.port(),
            pattern = %self.config.pattern,
            ack_mode = %self.config.ack_mode,
            "courier server started"
        );
        let router = self.router();
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        Ok(ServerHandle {
            port: local_addr.port(),
            _server: server,
        })
    }
}

/// Handle returned by `start` — keeps the serve task alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler.
async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    // The handshake response must echo the offered subprotocol (it carries
    // the bearer token) or browser clients abort the connection.
    let ws = match headers.get(SUBPROTOCOL_HEADER).and_then(|v| v.to_str().ok()) {
        Some(proto) => ws.protocols([proto.to_string()]),
        None => ws,
    };
    let req = UpgradeRequest { headers, query };
    ws.on_upgrade(move |socket| handle_socket(server, socket, req))
}

/// Health probe.
async fn health_handler(State(server): State<Arc<Server>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "connections": server.connection_count(),
    }))
}

/// Drive one upgraded socket through its whole lifecycle.
async fn handle_socket(server: Arc<Server>, socket: WebSocket, mut req: UpgradeRequest) {
    let (sink, stream) = socket.split();
    let transport = Arc::new(WsTransport::new(sink));
    let (conn, frames_rx) = Connection::new(transport);

    // The watcher owns transport reclamation from the moment the socket
    // exists, before authentication has run.
    tokio::spawn(keepalive(Arc::clone(&server), Arc::clone(&conn)));

    if !server.auth.authenticate(&mut req) {
        tracing::warn!(conn_id = %conn.id(), "upgrade rejected: authentication failed");
        let _ = conn.write_frame(&Frame::error("authentication failed")).await;
        conn.close().await;
        return;
    }

    let uid = server.auth.identity(&req);
    conn.set_uid(uid.clone());
    server.register(Arc::clone(&conn), uid.clone()).await;
    tracing::info!(uid = %uid, conn_id = %conn.id(), "client connected");

    tokio::spawn(process_loop(
        Arc::clone(&server),
        Arc::clone(&conn),
        frames_rx,
    ));
    if server.requires_ack(None) {
        tokio::spawn(ack_loop(Arc::clone(&server), Arc::clone(&conn)));
    }

    read_loop(server, conn, stream).await;
}

/// Blocking reader: decode frames and either admit them for
/// acknowledgment or hand them straight to the processing channel.
async fn read_loop(server: Arc<Server>, conn: Arc<Connection>, mut stream: SplitStream<WebSocket>) {
    loop {
        let next = tokio::select! {
            _ = conn.closed() => break,
            next = stream.next() => next,
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                tracing::warn!(uid = conn.uid().unwrap_or("-"), error = %e, "websocket read failed");
                break;
            }
            None => break,
        };
        conn.mark_active();
        match msg {
            WsMessage::Text(text) => {
                let frame: Frame = match serde_json::from_str(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        // Malformed input is tolerated per frame.
                        tracing::warn!(uid = conn.uid().unwrap_or("-"), error = %e, "dropping undecodable frame");
                        continue;
                    }
                };
                if server.requires_ack(Some(&frame)) {
                    tracing::debug!(frame_id = %frame.id, seq = frame.ack_seq, "frame admitted for acknowledgment");
                    conn.admit(frame);
                } else if conn.frames_tx.send(frame).await.is_err() {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            // Transport-level ping/pong and binary payloads are not part
            // of the frame protocol.
            _ => {}
        }
    }
    server.close(&conn).await;
}

/// Drain the processing channel: answer pings, dispatch data frames, and
/// clear acknowledgment tracking after dispatch.
async fn process_loop(server: Arc<Server>, conn: Arc<Connection>, mut frames: mpsc::Receiver<Frame>) {
    loop {
        let frame = tokio::select! {
            _ = conn.closed() => return,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };
        let frame_id = frame.id.clone();
        let tracked = server.requires_ack(Some(&frame));
        match frame.frame_type {
            FrameType::Ping => {
                if let Err(e) = conn.write_frame(&Frame::ping()).await {
                    tracing::warn!(uid = conn.uid().unwrap_or("-"), error = %e, "ping reply failed");
                }
            }
            FrameType::Data | FrameType::NoAck => {
                dispatch(&server, &conn, frame).await;
            }
            _ => {}
        }
        if tracked {
            conn.clear_tracked(&frame_id);
        }
    }
}

/// Invoke the matching route handler, shielding the loop from panics.
async fn dispatch(server: &Arc<Server>, conn: &Arc<Connection>, frame: Frame) {
    let handler = server.routes.read().get(&frame.method).cloned();
    let Some(handler) = handler else {
        let reply = Frame::data(
            "",
            serde_json::Value::String(format!(
                "no handler registered for method {}",
                frame.method
            )),
        );
        if let Err(e) = conn.write_frame(&reply).await {
            tracing::warn!(error = %e, "unknown-method reply failed");
        }
        return;
    };
    let method = frame.method.clone();
    let fut = handler(Arc::clone(server), Arc::clone(conn), frame);
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(method = %method, error = %e, "handler failed");
            let _ = conn.write_frame(&Frame::error(&e)).await;
        }
        Err(_) => {
            tracing::error!(method = %method, "handler panicked");
        }
    }
}

/// Advance the acknowledgment state machine for one connection. Wakes on
/// admissions and sequence updates; a timer only drives retransmits and
/// the confirmation timeout.
async fn ack_loop(server: Arc<Server>, conn: Arc<Connection>) {
    let mode = server.config.ack_mode;
    let timeout = server.config.ack_timeout;
    loop {
        if conn.is_closed() {
            tracing::info!(uid = conn.uid().unwrap_or("-"), "acknowledgment loop stopped");
            return;
        }
        match conn.advance_ack(mode, timeout) {
            AckStep::Empty => {
                tokio::select! {
                    _ = conn.closed() => return,
                    _ = conn.ack_wake.notified() => {}
                }
            }
            AckStep::Request { reply } | AckStep::Retry { reply } => {
                if let Err(e) = conn.write_frame(&reply).await {
                    tracing::warn!(frame_id = %reply.id, error = %e, "ack request write failed");
                }
                tokio::select! {
                    _ = conn.closed() => return,
                    _ = conn.ack_wake.notified() => {}
                    _ = tokio::time::sleep(ACK_RETRY_INTERVAL) => {}
                }
            }
            AckStep::Deliver { frame, reply } => {
                if let Some(reply) = reply {
                    if let Err(e) = conn.write_frame(&reply).await {
                        tracing::warn!(frame_id = %reply.id, error = %e, "ack reply write failed");
                    }
                }
                tokio::select! {
                    _ = conn.closed() => return,
                    sent = conn.frames_tx.send(frame) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            AckStep::Expired { id } => {
                tracing::debug!(frame_id = %id, "confirmation timed out, dropping frame");
            }
        }
    }
}

/// Timer-driven watcher closing connections idle beyond the allowance.
async fn keepalive(server: Arc<Server>, conn: Arc<Connection>) {
    let max_idle = server.config.max_connection_idle;
    let mut wait = max_idle;
    loop {
        tokio::select! {
            _ = conn.closed() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        match conn.idle_since() {
            // A read is in flight; start a fresh full period.
            None => wait = max_idle,
            Some(idle) => {
                let elapsed = idle.elapsed();
                if elapsed >= max_idle {
                    tracing::info!(uid = conn.uid().unwrap_or("-"), conn_id = %conn.id(), "closing idle connection");
                    server.close(&conn).await;
                    // The registry ignores connections it never saw;
                    // release the transport regardless.
                    conn.close().await;
                    return;
                }
                wait = max_idle - elapsed;
            }
        }
    }
}
