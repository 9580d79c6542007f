//! The `/gw` endpoint: gateway connections. The first frame must be a valid
//! Fernet auth token within a 2-second window, or the socket is closed
//! without ever registering the gateway in the hub.

use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{self, CloseFrame, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};

use crate::auth;
use crate::broker::GatewayId;
use crate::message::Message;

use super::SharedState;

const AUTH_WINDOW: Duration = Duration::from_secs(2);

/// Close code sent when a gateway frame fails to parse as a known message
/// type, per the wire protocol's unsupported-data convention.
const CLOSE_UNSUPPORTED_DATA: u16 = 1003;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: SharedState) {
    if authenticate(&mut socket, &state).await.is_none() {
        let _ = socket.send(ws::Message::Close(None)).await;
        return;
    }

    let (gw, outbox_rx) = state.hub.register_gateway();
    let (close_tx, close_rx) = oneshot::channel();

    let (sender, receiver) = socket.split();
    let mut send_task = tokio::spawn(task_send(sender, outbox_rx, close_rx));
    let mut receive_task = tokio::spawn(task_receive(receiver, state.clone(), gw, close_tx));

    tokio::select! {
        _ = &mut send_task => receive_task.abort(),
        _ = &mut receive_task => send_task.abort(),
    }

    state.hub.remove_gateway(gw).await;
}

/// Waits up to [`AUTH_WINDOW`] for the gateway's first frame and verifies it
/// as an auth token. Returns `None` on timeout, disconnect, or a bad token.
async fn authenticate(socket: &mut WebSocket, state: &SharedState) -> Option<()> {
    let first = tokio::time::timeout(AUTH_WINDOW, socket.recv()).await.ok()??;
    let ws::Message::Text(token) = first.ok()? else {
        return None;
    };

    if auth::verify_auth_token(&token, &state.keys) {
        Some(())
    } else {
        tracing::warn!("gateway sent an invalid auth token, closing connection");
        None
    }
}

async fn task_send(
    mut sender: futures::stream::SplitSink<WebSocket, ws::Message>,
    mut outbox_rx: mpsc::Receiver<Message>,
    mut close_rx: oneshot::Receiver<&'static str>,
) {
    loop {
        tokio::select! {
            message = outbox_rx.recv() => {
                let Some(message) = message else { break };
                if sender.send(ws::Message::Text(message.to_json().into())).await.is_err() {
                    break;
                }
            }
            reason = &mut close_rx => {
                if let Ok(reason) = reason {
                    let frame = CloseFrame { code: CLOSE_UNSUPPORTED_DATA, reason: reason.into() };
                    let _ = sender.send(ws::Message::Close(Some(frame))).await;
                }
                break;
            }
        }
    }
}

async fn task_receive(
    mut receiver: futures::stream::SplitStream<WebSocket>,
    state: SharedState,
    gw: GatewayId,
    close_tx: oneshot::Sender<&'static str>,
) {
    let mut close_tx = Some(close_tx);
    while let Some(message) = receiver.next().await {
        let Ok(ws::Message::Text(raw)) = message else {
            continue;
        };

        match Message::parse(&raw) {
            Ok(message) => state.hub.route_gateway_message(gw, message).await,
            Err(err) => {
                tracing::debug!(%err, gateway = %gw, "closing gateway connection for malformed message");
                if let Some(tx) = close_tx.take() {
                    let _ = tx.send("unsupported message type");
                }
                return;
            }
        }
    }
}
