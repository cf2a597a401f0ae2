//! Websocket transport for interactive sessions

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use relaybox::{Launcher, ServerMessage, SessionCoordinator};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub type Coordinator = SessionCoordinator<Launcher>;

/// Client messages buffered before the coordinator picks them up
const INBOUND_BUFFER: usize = 64;

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/ws/interactive/", get(interactive))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

async fn health() -> &'static str {
    "ok"
}

/// GET /ws/interactive/
async fn interactive(
    State(coordinator): State<Arc<Coordinator>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, coordinator))
}

/// Run one session over one websocket connection
async fn handle_socket(socket: WebSocket, coordinator: Arc<Coordinator>) {
    let (mut sender, mut receiver) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(INBOUND_BUFFER);
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<ServerMessage>(coordinator.settings().outbound_buffer.max(1));

    // Ends once the coordinator and its relays dropped every sender
    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender
                .send(Message::Text(message.to_json().into()))
                .await
                .is_err()
            {
                debug!("client gone, dropping outbound messages");
                return;
            }
        }
        if let Err(e) = sender.close().await {
            debug!(error = %e, "failed to close websocket");
        }
    });

    // Dropping `inbound_tx` tells the coordinator the client disconnected
    let recv_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if inbound_tx.send(text.as_str().to_owned()).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Binary(_)) => debug!("ignoring binary message"),
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Ok(Message::Close(_)) => {
                    debug!("client closed websocket");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "websocket error");
                    break;
                }
            }
        }
    });

    let outcome = coordinator.run(inbound_rx, outbound_tx).await;
    match outcome {
        Some(outcome) => info!(?outcome, "session finished"),
        None => info!("client disconnected"),
    }

    if let Err(e) = send_task.await {
        warn!(error = %e, "websocket send task failed");
    }
    recv_task.abort();
}
