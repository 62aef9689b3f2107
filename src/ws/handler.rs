//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::rooms::RoomHandle;
use crate::util::rate_limit::PeerRateLimiter;
use crate::ws::protocol::{ClientFrame, Delivery, PeerId, RelayFrame};

const MAX_ROOM_NAME: usize = 64;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Room to join
    pub room: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame exceeds {0} bytes")]
    TooLarge(usize),
}

/// Upper bound on one inbound text frame; full snapshots are the largest
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

pub fn decode_frame(text: &str) -> Result<ClientFrame, FrameError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(MAX_FRAME_BYTES));
    }
    Ok(serde_json::from_str(text)?)
}

/// What to do with a decoded inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Forward,
    /// Over budget but droppable
    Throttled,
    /// Over budget and must not be lost: close the connection instead
    Disconnect,
}

/// Charge one frame against the peer's budget
pub fn admit(limiter: &PeerRateLimiter, frame: &ClientFrame) -> Admission {
    if limiter.check_frame() {
        return Admission::Forward;
    }
    match frame.msg.delivery() {
        Delivery::Unreliable => Admission::Throttled,
        Delivery::ReliableOrdered => Admission::Disconnect,
    }
}

pub fn valid_room_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_ROOM_NAME
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    if !valid_room_name(&query.room) {
        warn!(room = %query.room, "Rejected room name");
        return (StatusCode::BAD_REQUEST, "Invalid room name").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, query.room, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, room: String, state: AppState) {
    let conn_id = Uuid::new_v4();
    info!(conn = %conn_id, room = %room, "New WebSocket connection");

    let (mut ws_sink, ws_stream) = socket.split();

    let (handle, link) = match state.rooms.join(&room).await {
        Ok(joined) => joined,
        Err(e) => {
            warn!(conn = %conn_id, room = %room, error = %e, "Join refused");
            let refusal = RelayFrame::Error {
                code: "join_refused".to_string(),
                message: e.to_string(),
            };
            let _ = send_frame(&mut ws_sink, &refusal).await;
            return;
        }
    };
    let peer = link.peer;
    info!(conn = %conn_id, room = %room, peer = %peer, "Joined room");

    let limiter = PeerRateLimiter::new(state.config.peer_frame_rate);
    run_session(conn_id, peer, &handle, limiter, ws_sink, ws_stream, link.frames).await;

    // Cleanup on disconnect
    handle.leave(peer).await;
    state.rooms.prune();

    info!(conn = %conn_id, peer = %peer, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split
async fn run_session(
    conn_id: Uuid,
    peer: PeerId,
    room: &RoomHandle,
    limiter: PeerRateLimiter,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut ws_stream: SplitStream<WebSocket>,
    mut frames: mpsc::UnboundedReceiver<RelayFrame>,
) {
    // Spawn writer task: room -> WebSocket
    let writer_handle = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = send_frame(&mut ws_sink, &frame).await {
                debug!(conn = %conn_id, error = %e, "WebSocket send failed");
                break;
            }
        }
        debug!(conn = %conn_id, "Relay channel closed");
    });

    // Reader loop: WebSocket -> room
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let frame = match decode_frame(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(conn = %conn_id, peer = %peer, error = %e, "Failed to decode frame");
                        continue;
                    }
                };

                match admit(&limiter, &frame) {
                    Admission::Forward => {}
                    Admission::Throttled => {
                        trace!(conn = %conn_id, peer = %peer, "Rate limited sample");
                        continue;
                    }
                    Admission::Disconnect => {
                        warn!(
                            conn = %conn_id,
                            peer = %peer,
                            kind = frame.msg.kind(),
                            "Reliable frame over rate limit, disconnecting"
                        );
                        break;
                    }
                }
                if room.send(peer, frame).await.is_err() {
                    debug!(conn = %conn_id, "Room closed");
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(conn = %conn_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(conn = %conn_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(conn = %conn_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    writer_handle.abort();
}

/// Send a frame over WebSocket
async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &RelayFrame,
) -> Result<(), String> {
    let json = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
