//! WebSocket transport adapter.
//!
//! # Responsibilities
//! - Admit a peer: `client_id` query parameter, connection limit, one live
//!   connection per client id
//! - Bridge socket frames to the connection's `Correlator`
//! - Spawn a dispatch for every fresh request or notification
//! - Tear down on close: fail pending requests, kill the peer's services
//!
//! # Data Flow
//! ```text
//! Peer ──frames──▶ read loop ─▶ Correlator::handle_frame ─┬─ reply    → waiting request
//!                                                         └─ request  → Dispatcher (spawned)
//! Peer ◀──frames── writer task ◀── mpsc ◀── WsChannel ◀── Correlator::send
//! ```
//!
//! # Design Decisions
//! - Outbound frames go through an unbounded queue to a single writer task
//! - Pings and pongs at the WebSocket layer are left to axum; relay pings are messages
//! - Admission state (peer slot, tracker guard) is released by drop, so a
//!   failed upgrade cleans up the same way a closed socket does

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::correlation::{Correlator, Inbound};
use crate::dispatch::Outcome;
use crate::net::{ConnectionGuard, ConnectionId, ConnectionInfo, DuplexChannel, TransportError};
use crate::observability::metrics;
use crate::protocol::RELAY_ID;

use super::server::AppState;

/// Time the writer gets to flush the close frame.
const WRITER_FLUSH: Duration = Duration::from_secs(1);

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// [`DuplexChannel`] over a WebSocket writer task.
pub struct WsChannel {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl WsChannel {
    fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DuplexChannel for WsChannel {
    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub client_id: Option<String>,
    pub token: Option<String>,
}

/// Reservation of a client id in the peer table.
struct PeerSlot {
    peers: Arc<DashMap<String, Arc<Correlator>>>,
    client_id: String,
    connection_id: ConnectionId,
}

impl Drop for PeerSlot {
    fn drop(&mut self) {
        let connection_id = self.connection_id;
        self.peers
            .remove_if(&self.client_id, |_, c| c.connection_id() == connection_id);
    }
}

/// Everything a connection holds for its lifetime.
struct Admitted {
    info: Arc<ConnectionInfo>,
    correlator: Arc<Correlator>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    slot: PeerSlot,
    guard: ConnectionGuard,
}

impl Admitted {
    /// Close the correlator when the upgrade never happened.
    fn abandon(self) {
        self.correlator.close();
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
) -> Response {
    let admitted = match admit(&state, addr, params) {
        Ok(admitted) => admitted,
        Err((status, reason)) => {
            warn!(peer_addr = %addr, status = %status, reason, "Connection refused");
            return (status, reason).into_response();
        }
    };

    let pending = Arc::new(std::sync::Mutex::new(Some(admitted)));
    let on_failure = Arc::clone(&pending);
    ws.on_failed_upgrade(move |e| {
        warn!(error = %e, "WebSocket upgrade failed");
        let admitted = on_failure
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(admitted) = admitted {
            admitted.abandon();
        }
    })
    .on_upgrade(move |socket| async move {
        let admitted = pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(admitted) = admitted {
            serve_connection(socket, state, admitted).await;
        }
    })
}

fn admit(
    state: &AppState,
    addr: SocketAddr,
    params: ConnectParams,
) -> Result<Admitted, (StatusCode, &'static str)> {
    let client_id = params
        .client_id
        .filter(|id| !id.trim().is_empty())
        .ok_or((StatusCode::BAD_REQUEST, "client_id is required"))?;
    if client_id == RELAY_ID {
        return Err((StatusCode::FORBIDDEN, "client_id is reserved"));
    }

    let config = state.config.load();
    let guard = state
        .tracker
        .try_track(config.listener.max_connections)
        .ok_or((StatusCode::SERVICE_UNAVAILABLE, "connection limit reached"))?;

    let info = Arc::new(ConnectionInfo::new(guard.id(), client_id.clone(), addr, params.token));
    let (channel, outbound) = WsChannel::new();
    let correlator = Arc::new(Correlator::new(
        guard.id(),
        client_id.clone(),
        Arc::new(channel),
        Arc::clone(&state.scheduler),
        config.timeouts.request(),
    ));

    match state.peers.entry(client_id.clone()) {
        Entry::Occupied(_) => return Err((StatusCode::CONFLICT, "client_id is already connected")),
        Entry::Vacant(vacant) => {
            vacant.insert(Arc::clone(&correlator));
        }
    }

    metrics::set_active_connections(state.tracker.active_count());
    Ok(Admitted {
        info,
        correlator,
        outbound,
        slot: PeerSlot {
            peers: Arc::clone(&state.peers),
            client_id,
            connection_id: guard.id(),
        },
        guard,
    })
}

async fn serve_connection(socket: WebSocket, state: AppState, admitted: Admitted) {
    let Admitted {
        info,
        correlator,
        mut outbound,
        slot,
        guard,
    } = admitted;

    info!(
        connection_id = %info.id,
        client_id = %info.client_id,
        peer_addr = %info.peer_addr,
        "Peer connected"
    );

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(out) = outbound.recv().await {
            match out {
                Outbound::Frame(frame) => {
                    if sink.send(WsMessage::Binary(frame.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    let mut shutdown = state.shutdown.subscribe();
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Binary(bytes))) => on_frame(&state, &info, &correlator, &bytes),
                Some(Ok(WsMessage::Text(text))) => {
                    on_frame(&state, &info, &correlator, text.as_str().as_bytes())
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection_id = %info.id, error = %e, "Socket error");
                    break;
                }
            },
            _ = shutdown.recv() => {
                debug!(connection_id = %info.id, "Closing connection for shutdown");
                break;
            }
        }
    }

    correlator.close();
    let abandoned = state.dispatcher.abandon_connection(info.id);
    let killed = state.registry.kill_owner(&info.client_id);
    metrics::set_services_registered(state.registry.len());
    drop(slot);
    drop(guard);
    metrics::set_active_connections(state.tracker.active_count());

    if tokio::time::timeout(WRITER_FLUSH, writer).await.is_err() {
        debug!(connection_id = %info.id, "Writer did not flush before close");
    }

    info!(
        connection_id = %info.id,
        client_id = %info.client_id,
        services_killed = killed,
        requests_abandoned = abandoned,
        "Peer disconnected"
    );
}

fn on_frame(state: &AppState, info: &Arc<ConnectionInfo>, correlator: &Arc<Correlator>, frame: &[u8]) {
    let Inbound::Request(message) = correlator.handle_frame(frame) else {
        return;
    };

    let dispatcher = Arc::clone(&state.dispatcher);
    let info = Arc::clone(info);
    let correlator = Arc::clone(correlator);
    tokio::spawn(async move {
        if let Outcome::Reply(reply) = dispatcher.dispatch(&info, &correlator, message).await {
            if let Err(e) = correlator.send(&reply) {
                debug!(connection_id = %info.id, message_id = %reply.id(), error = %e, "Reply not delivered");
            }
        }
    });
}
