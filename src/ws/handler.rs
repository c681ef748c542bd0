//! WebSocket upgrade handler. Hands a fresh socket to the hub and runs the
//! connection's pumps until it goes away.

use axum::extract::ws::WebSocket;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::api::state::SharedState;

use super::connection::run_session;

/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Register the connection, then drive it until either pump exits.
async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (conn, outbound) = state.hub.new_connection();
    let id = conn.id();

    if let Err(e) = state.hub.register(conn.clone()).await {
        warn!(connection_id = id, "could not register connection: {e}");
        return;
    }
    debug!(connection_id = id, user_id = %conn.user_id(), "WS client connected");

    let (sink, stream) = socket.split();
    run_session(conn, sink, stream, outbound, state.hub.clone()).await;
}
