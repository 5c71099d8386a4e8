//! WebSocket support: connection registry and the axum upgrade handler.
//!
//! Upgraded sockets register with the [`Registry`]; inbound messages are
//! relayed to a worker through the pool's forwarder, and worker replies are
//! routed back out as room broadcasts or unicasts.

pub mod registry;

pub use registry::{Registry, RegistryStats, StreamForwarder, OUTBOUND_QUEUE};

use crate::error::Result;
use crate::pool::Pool;
use crate::protocol::wire::Frame;
use crate::server::AppState;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

impl StreamForwarder for Arc<Pool> {
    async fn forward(&self, frame: Frame) -> Result<Frame> {
        Pool::forward(self, frame).await
    }
}

/// Handle a WebSocket upgrade request.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(registry) = state.registry.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(registry, socket, addr))
}

async fn handle_socket(registry: Arc<Registry<Arc<Pool>>>, socket: WebSocket, addr: SocketAddr) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);

    // Writer task: drains the outbound queue so registry broadcasts never
    // block on this socket.
    let writer = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if sink.send(Message::Binary(data.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let conn_id = match registry.add(addr.to_string(), tx).await {
        Ok(id) => id,
        Err(e) => {
            warn!(remote_addr = %addr, error = %e, "rejecting websocket connection");
            writer.abort();
            return;
        }
    };

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Err(e) = registry
                    .handle_message(&conn_id, text.as_bytes().to_vec())
                    .await
                {
                    warn!(conn_id = %conn_id, error = %e, "handling websocket message");
                }
            }
            Ok(Message::Binary(data)) => {
                if let Err(e) = registry.handle_message(&conn_id, data.to_vec()).await {
                    warn!(conn_id = %conn_id, error = %e, "handling websocket message");
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // ping/pong are answered by the protocol layer
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "websocket read error");
                break;
            }
        }
    }

    registry.remove(&conn_id).await;
    writer.abort();
}
