//! The `/ws` endpoint: dashboard clients. No authentication — matches the
//! original broker, which only guards the gateway-facing endpoint.

use axum::extract::State;
use axum::extract::ws::{self, CloseFrame, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};

use crate::broker::ClientId;
use crate::message::Message;

use super::SharedState;

/// Close code sent when a client frame fails to parse as a known message
/// type, per the wire protocol's unsupported-data convention.
const CLOSE_UNSUPPORTED_DATA: u16 = 1003;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (id, outbox_rx) = state.hub.register_client();
    let (close_tx, close_rx) = oneshot::channel();

    let (sender, receiver) = socket.split();
    let mut send_task = tokio::spawn(task_send(sender, outbox_rx, close_rx));
    let mut receive_task = tokio::spawn(task_receive(receiver, state.clone(), id.clone(), close_tx));

    tokio::select! {
        _ = &mut send_task => receive_task.abort(),
        _ = &mut receive_task => send_task.abort(),
    }

    state.hub.remove_client(&id);
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
    id: ClientId,
    close_tx: oneshot::Sender<&'static str>,
) {
    let mut close_tx = Some(close_tx);
    while let Some(message) = receiver.next().await {
        let Ok(ws::Message::Text(raw)) = message else {
            continue;
        };

        match Message::parse(&raw) {
            Ok(message) => state.hub.route_client_message(&id, message).await,
            Err(err) => {
                tracing::debug!(%err, client = %id, "closing client connection for malformed message");
                if let Some(tx) = close_tx.take() {
                    let _ = tx.send("unsupported message type");
                }
                return;
            }
        }
    }
}
