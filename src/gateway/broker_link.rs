//! The websocket connection a gateway keeps open to the broker's `/gw`
//! endpoint: auth handshake, outbound message draining, inbound message
//! dispatch, and the 3-second reconnect loop.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use crate::auth::{self, Keys};
use crate::message::Message;

use super::registry::NodeRegistry;

const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const POST_CONNECT_DELAY: Duration = Duration::from_secs(1);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// What a gateway does in response to a message the broker forwarded from a
/// dashboard client. Implemented per protocol (CoAP/MQTT/WS-node), since
/// only the protocol-specific controller knows how to reach a live node.
pub trait BrokerEventSink: Send + Sync {
    /// A new dashboard client connected; replay this gateway's node cache
    /// to it alone.
    fn on_client_connected(&self, client_uid: &str);

    /// A dashboard client asked to set `endpoint` on node `uid` to `payload`.
    fn on_node_update_request(&self, uid: &str, endpoint: &str, payload: &str);
}

/// Runs the broker connection forever, reconnecting on any failure.
///
/// `outbound_rx` carries messages the registry wants delivered to the
/// broker (`new`/`update`/`out`/`reset`, emitted by [`NodeRegistry`]).
pub async fn run(
    url: &str,
    keys: Keys,
    registry: Arc<NodeRegistry>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    sink: Arc<dyn BrokerEventSink>,
) -> ! {
    loop {
        match tokio_tungstenite::connect_async(url).await {
            Ok((ws_stream, _response)) => {
                tracing::info!(url, "connected to broker, sending auth token");
                let (mut write, mut read) = ws_stream.split();

                let token = match auth::auth_token(&keys) {
                    Ok(token) => token,
                    Err(err) => {
                        tracing::error!(%err, "failed to build gateway auth token");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                };

                if let Err(err) = write.send(tungstenite::Message::Text(token.into())).await {
                    tracing::warn!(%err, "failed to send auth token, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }

                tokio::time::sleep(POST_CONNECT_DELAY).await;

                let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
                heartbeat.tick().await; // first tick fires immediately

                registry.fetch_nodes_cache("all");

                'session: loop {
                    tokio::select! {
                        _ = heartbeat.tick() => {
                            if write.send(tungstenite::Message::Text(Message::gateway_alive().to_json().into())).await.is_err() {
                                tracing::warn!("broker link closed while sending heartbeat");
                                break 'session;
                            }
                        }
                        outgoing = outbound_rx.recv() => {
                            match outgoing {
                                Some(message) => {
                                    if write.send(tungstenite::Message::Text(message.to_json().into())).await.is_err() {
                                        tracing::warn!("broker link closed while forwarding node event");
                                        break 'session;
                                    }
                                }
                                None => {
                                    tracing::warn!("registry outbound channel closed, gateway shutting down");
                                    return std::future::pending().await;
                                }
                            }
                        }
                        incoming = read.next() => {
                            match incoming {
                                Some(Ok(tungstenite::Message::Text(raw))) => {
                                    handle_broker_message(&raw, sink.as_ref());
                                }
                                Some(Ok(tungstenite::Message::Close(_))) | None => {
                                    tracing::warn!("connection with broker lost");
                                    break 'session;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    tracing::warn!(%err, "error reading from broker websocket");
                                    break 'session;
                                }
                            }
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(%err, "cannot connect to broker, retrying in 3s");
            }
        }

        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// A message inbound to a gateway only ever originates from a dashboard
/// client (the broker never echoes a gateway's own `new`/`update`/`out`
/// notifications back to the gateway that emitted them), so every message
/// here carries the `src` the broker stamped on it.
fn handle_broker_message(raw: &str, sink: &dyn BrokerEventSink) {
    let message = match Message::parse(raw) {
        Ok(message) => message,
        Err(err) => {
            tracing::debug!(%err, raw, "invalid message received from broker");
            return;
        }
    };

    match &message {
        Message::New { src: Some(client_uid), .. } => {
            sink.on_client_connected(client_uid);
        }
        Message::Update {
            uid,
            endpoint: Some(endpoint),
            data: Some(payload),
            ..
        } => {
            sink.on_node_update_request(uid, endpoint, payload);
        }
        _ => {
            tracing::debug!(?message, "unhandled message from broker");
        }
    }
}
