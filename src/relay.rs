//! The blind relay: session issuance plus opaque frame forwarding.
//!
//! One listening socket serves three endpoints. `POST /session/create`
//! issues credentials; `GET /share` and `GET /connect` upgrade to the
//! tunnel transport and install the connection into the session's
//! `ConnectionPair`. Each endpoint runs its own read loop that copies
//! complete messages to the other endpoint verbatim. After the peers'
//! handshake, every forwarded byte is ciphertext the relay cannot read.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use hyper::header::{HeaderValue, CONNECTION, CONTENT_TYPE, UPGRADE};
use hyper::service::{make_service_fn, service_fn};
use hyper::upgrade::Upgraded;
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::interval;

use crate::session::{SessionManager, SWEEP_INTERVAL};
use crate::transport::{self, Message, SharedSink, UPGRADE_PROTOCOL};
use crate::{Error, Result};

const WRITE_WAIT: Duration = Duration::from_secs(10);
const READ_IDLE: Duration = Duration::from_secs(60);
// Just under the read idle window, so an otherwise silent peer always
// has a pong in flight before the deadline.
const PING_PERIOD: Duration = Duration::from_secs(54);
const PAIR_STALE: Duration = Duration::from_secs(30 * 60);
const MONITOR_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Side {
    Sharer,
    Connector,
}

impl Side {
    fn label(self) -> &'static str {
        match self {
            Side::Sharer => "sharer",
            Side::Connector => "connector",
        }
    }
}

/// The two endpoints of one session. Either slot may be empty while the
/// other peer is still on its way.
struct ConnectionPair {
    sharer: StdMutex<Option<SharedSink>>,
    connector: StdMutex<Option<SharedSink>>,
    last_seen: StdMutex<Instant>,
}

impl ConnectionPair {
    fn new() -> Self {
        Self {
            sharer: StdMutex::new(None),
            connector: StdMutex::new(None),
            last_seen: StdMutex::new(Instant::now()),
        }
    }

    fn slot(&self, side: Side) -> &StdMutex<Option<SharedSink>> {
        match side {
            Side::Sharer => &self.sharer,
            Side::Connector => &self.connector,
        }
    }

    fn install(&self, side: Side, sink: SharedSink) {
        *self.slot(side).lock().expect("pair lock poisoned") = Some(sink);
        self.touch();
    }

    /// The opposite endpoint's write half, if it has joined.
    fn peer(&self, side: Side) -> Option<SharedSink> {
        let peer_side = match side {
            Side::Sharer => Side::Connector,
            Side::Connector => Side::Sharer,
        };
        self.slot(peer_side).lock().expect("pair lock poisoned").clone()
    }

    /// Clears this side's slot, but only if it still holds `sink`; a
    /// reconnected endpoint must not be evicted by its predecessor's
    /// cleanup.
    fn clear_if_current(&self, side: Side, sink: &SharedSink) {
        let mut slot = self.slot(side).lock().expect("pair lock poisoned");
        if slot.as_ref().map_or(false, |current| Arc::ptr_eq(current, sink)) {
            *slot = None;
        }
    }

    fn is_empty(&self) -> bool {
        self.sharer.lock().expect("pair lock poisoned").is_none()
            && self.connector.lock().expect("pair lock poisoned").is_none()
    }

    fn touch(&self) {
        *self.last_seen.lock().expect("pair lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().expect("pair lock poisoned").elapsed()
    }

    async fn close_both(&self) {
        let sharer = self.sharer.lock().expect("pair lock poisoned").take();
        let connector = self.connector.lock().expect("pair lock poisoned").take();
        if let Some(sink) = sharer {
            transport::close_sink(&sink).await;
        }
        if let Some(sink) = connector {
            transport::close_sink(&sink).await;
        }
    }
}

struct RelayState {
    sessions: SessionManager,
    pairs: RwLock<HashMap<String, Arc<ConnectionPair>>>,
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    shared_path: String,
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
    passcode: String,
}

pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RelayState {
                sessions: SessionManager::new(),
                pairs: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.state.sessions
    }

    /// Binds the listening socket and returns the bound address plus the
    /// serve future. Background maintenance (session sweeper, stale-pair
    /// monitor) starts here.
    pub fn serve(
        &self,
        addr: &SocketAddr,
    ) -> Result<(SocketAddr, impl Future<Output = hyper::Result<()>>)> {
        let state = self.state.clone();
        let make_svc = make_service_fn(move |_conn| {
            let state = state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| route(state.clone(), req)))
            }
        });

        let server = Server::try_bind(addr)
            .map_err(|e| Error::Transport(format!("failed to bind {}: {}", addr, e)))?
            .serve(make_svc);
        let local_addr = server.local_addr();

        tokio::spawn(run_maintenance(self.state.clone()));

        info!("relay server listening on {}", local_addr);
        Ok((local_addr, server))
    }

    pub fn pair_count(&self) -> usize {
        self.state.pairs.read().expect("pair map lock poisoned").len()
    }
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn route(
    state: Arc<RelayState>,
    req: Request<Body>,
) -> std::result::Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, "/session/create") => handle_create_session(&state, req).await,
        (&Method::GET, "/share") => handle_join(&state, req, Side::Sharer),
        (&Method::GET, "/connect") => handle_join(&state, req, Side::Connector),
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn handle_create_session(state: &Arc<RelayState>, req: Request<Body>) -> Response<Body> {
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(_) => return text_response(StatusCode::BAD_REQUEST, "invalid request"),
    };

    let parsed: CreateSessionRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(_) => return text_response(StatusCode::BAD_REQUEST, "invalid request"),
    };

    if parsed.shared_path.is_empty() {
        return text_response(StatusCode::BAD_REQUEST, "shared_path required");
    }

    let session = state.sessions.create_session(&parsed.shared_path);
    // Log the id only; the passcode must never reach the logs
    info!("session created: {}", session.id);

    let response = CreateSessionResponse {
        session_id: session.id,
        passcode: session.passcode,
    };
    match serde_json::to_vec(&response) {
        Ok(json) => Response::builder()
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(json))
            .expect("static response parts are valid"),
        Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to create session"),
    }
}

/// Validates the join request, answers 101 and hands the upgraded
/// connection to its endpoint task.
fn handle_join(state: &Arc<RelayState>, req: Request<Body>, side: Side) -> Response<Body> {
    let session_id = match query_param(req.uri().query(), "session") {
        Some(id) if !id.is_empty() => id,
        _ => return text_response(StatusCode::BAD_REQUEST, "session required"),
    };

    if state.sessions.lookup(&session_id).is_none() {
        return text_response(StatusCode::NOT_FOUND, "invalid session");
    }

    let state = state.clone();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => serve_endpoint(state, session_id, side, upgraded).await,
            Err(e) => warn!("connection upgrade failed: {}", e),
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    response
        .headers_mut()
        .insert(UPGRADE, HeaderValue::from_static(UPGRADE_PROTOCOL));
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    response
}

/// One relay endpoint: reads complete messages and forwards data to the
/// paired peer byte for byte. Never inspects, never re-frames.
async fn serve_endpoint(
    state: Arc<RelayState>,
    session_id: String,
    side: Side,
    upgraded: Upgraded,
) {
    let (sink, mut source) = transport::into_message_stream(upgraded);
    let sink: SharedSink = Arc::new(Mutex::new(sink));

    let pair = {
        let mut pairs = state.pairs.write().expect("pair map lock poisoned");
        pairs
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(ConnectionPair::new()))
            .clone()
    };
    pair.install(side, sink.clone());
    state.sessions.touch(&session_id);
    info!("{} connected: session={}", side.label(), session_id);

    let keepalive = tokio::spawn(keepalive_loop(sink.clone()));

    loop {
        match transport::recv_message(&mut source, READ_IDLE).await {
            Ok(None) => break,
            Err(e) => {
                debug!("{} read ended: session={} ({})", side.label(), session_id, e);
                break;
            }
            Ok(Some(Message::Ping)) => {
                pair.touch();
                if transport::send_message(&sink, transport::pong_message(), WRITE_WAIT)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Some(Message::Pong)) => pair.touch(),
            Ok(Some(Message::Data(payload))) => {
                pair.touch();
                state.sessions.touch(&session_id);

                // Without a peer the message has nowhere to go; drop it
                let Some(peer) = pair.peer(side) else {
                    debug!("no peer yet for session {}, dropping message", session_id);
                    continue;
                };

                if let Err(e) =
                    transport::send_message(&peer, transport::data_message(&payload), WRITE_WAIT)
                        .await
                {
                    warn!("failed to forward message: session={} ({})", session_id, e);
                    break;
                }
            }
        }
    }

    keepalive.abort();
    transport::close_sink(&sink).await;
    pair.clear_if_current(side, &sink);

    // Closing one end cancels the other: the peer observes EOF on its
    // next read instead of waiting out its deadline
    if let Some(peer) = pair.peer(side) {
        transport::close_sink(&peer).await;
    }

    if pair.is_empty() {
        state.pairs.write().expect("pair map lock poisoned").remove(&session_id);
        info!("session pair closed: {}", session_id);
    }
}

async fn keepalive_loop(sink: SharedSink) {
    let mut ticker = interval(PING_PERIOD);
    // The first tick fires immediately; the connection is self-evidently
    // alive at that point
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if transport::send_message(&sink, transport::ping_message(), WRITE_WAIT)
            .await
            .is_err()
        {
            return;
        }
    }
}

async fn run_maintenance(state: Arc<RelayState>) {
    let mut sweeper = interval(SWEEP_INTERVAL);
    let mut monitor = interval(MONITOR_INTERVAL);

    loop {
        tokio::select! {
            _ = sweeper.tick() => {
                let removed = state.sessions.sweep();
                if removed > 0 {
                    info!("swept {} expired sessions", removed);
                }
            }
            _ = monitor.tick() => {
                remove_stale_pairs(&state).await;
            }
        }
    }
}

async fn remove_stale_pairs(state: &Arc<RelayState>) {
    let stale: Vec<(String, Arc<ConnectionPair>)> = {
        let pairs = state.pairs.read().expect("pair map lock poisoned");
        pairs
            .iter()
            .filter(|(_, pair)| pair.idle_for() > PAIR_STALE)
            .map(|(id, pair)| (id.clone(), pair.clone()))
            .collect()
    };

    for (session_id, pair) in stale {
        warn!("removing stale connection pair: {}", session_id);
        pair.close_both().await;
        state
            .pairs
            .write()
            .expect("pair map lock poisoned")
            .remove(&session_id);
    }
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some(key) {
            return parts.next().map(|v| v.to_string());
        }
    }
    None
}

fn text_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .expect("static response parts are valid")
}
