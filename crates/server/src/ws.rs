//! WebSocket transport for the hub.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use dashlite_api::bearer_token;
use dashlite_core::Identity;
use dashlite_hub::{Hub, HubError};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::routes::ApiError;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WsParams {
    /// Browsers cannot set headers on a WebSocket handshake.
    token: Option<String>,
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let header_token = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()).and_then(bearer_token);
    let identity = state.identities.resolve(header_token.or(params.token.as_deref()))?;
    info!(user = %identity.username, "ws: upgrade requested");
    let hub = Arc::clone(&state.hub);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, identity)).into_response())
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, identity: Identity) {
    let user = identity.username.clone();
    let mut conn = hub.connect(identity);
    let id = conn.id;
    if let Err(e) = hub.open(id) {
        warn!(conn = %id, error = %e, "ws: open failed");
        hub.close(id);
        return;
    }
    counter!("ws_sessions_total", 1u64);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => {
                debug!(conn = %id, "ws: hub closed the connection");
                break;
            }
            out = conn.outbound.recv() => match out {
                Some(msg) => {
                    if let Err(e) = sink.send(Message::Text(msg.to_json())).await {
                        debug!(conn = %id, error = %e, "ws: send failed");
                        break;
                    }
                }
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => match hub.handle_text(id, &text) {
                    Err(HubError::UnknownConnection(_)) => break,
                    Err(e) => debug!(conn = %id, error = %e, "ws: client message rejected"),
                    Ok(()) => {}
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => hub.touch(id),
                Some(Ok(Message::Binary(_))) => debug!(conn = %id, "ws: binary frame ignored"),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(conn = %id, error = %e, "ws: receive failed");
                    break;
                }
            },
        }
    }

    hub.close(id);
    let _ = sink.send(Message::Close(None)).await;
    info!(conn = %id, user = %user, "ws: disconnected");
}
