//! WebSocket attach endpoint.
//!
//! `GET /ws?user_id=<id>` upgrades the request and hands both halves of the
//! socket to [`run_session`]. The axum socket is adapted to the plain text
//! frame sink/stream the session works with.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{future, SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;

use super::connection::{ConnectionError, FrameSink, FrameStream};
use super::error::ApiError;
use super::session::run_session;
use super::validate::validate_user_id;
use crate::notification::UserId;
use crate::server::ServerState;

#[derive(Debug, Deserialize)]
pub struct AttachQuery {
    pub user_id: Option<String>,
}

/// GET /ws?user_id=<id>
///
/// The user id is checked before the upgrade so a bad request gets a 400
/// rather than an upgraded socket that closes immediately.
pub async fn ws_attach(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AttachQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, ApiError> {
    let user = validate_user_id(query.user_id.as_deref().unwrap_or_default())?;
    let ws = ws.ok_or_else(|| ApiError::BadRequest("expected a WebSocket upgrade request".into()))?;

    tracing::debug!(user_id = %user, "WebSocket upgrade accepted");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user)))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, user: UserId) {
    let (sink, inbound) = split_socket(socket);
    run_session(state.session_context(), user, sink, inbound).await;
}

/// Adapt an axum socket to text frame halves.
///
/// Outbound strings go out as text frames. Inbound text frames pass through,
/// binary and control frames are dropped, and a close frame ends the stream.
fn split_socket(socket: WebSocket) -> (FrameSink, FrameStream) {
    let (ws_tx, ws_rx) = socket.split();

    let sink: FrameSink = Box::pin(
        ws_tx
            .sink_map_err(|e| ConnectionError::Transport(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, ConnectionError>(Message::Text(text)))),
    );

    let inbound: FrameStream = Box::pin(
        ws_rx
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => {
                        tracing::debug!(len = bytes.len(), "Ignoring binary frame");
                        None
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(ConnectionError::Transport(e.to_string()))),
                })
            }),
    );

    (sink, inbound)
}
