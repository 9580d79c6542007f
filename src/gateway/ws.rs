//! WebSocket-node protocol gateway: nodes speak the fabric's native
//! websocket frames directly instead of through a translation layer, so this
//! gateway is mostly plumbing between a per-node socket task and the shared
//! [`NodeRegistry`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::gateway::broker_link::BrokerEventSink;
use crate::gateway::registry::NodeRegistry;
use crate::message::{DiscoverRequest, NodeSetFrame, NodeUpdateFrame};
use crate::node::Node;

pub const DEFAULT_PORT: u16 = 8001;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Runs the `/node` websocket endpoint nodes connect to, and tracks the
/// per-node outbox used to push discovery requests and resource writes.
pub struct WsNodeGateway {
    registry: Arc<NodeRegistry>,
    outboxes: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl WsNodeGateway {
    pub fn new(registry: Arc<NodeRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            outboxes: RwLock::new(HashMap::new()),
        })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route("/node", get(ws_handler)).with_state(self)
    }

    fn send_to_node(&self, uid: &str, text: String) {
        let outboxes = self.outboxes.read().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = outboxes.get(uid) {
            let _ = tx.send(text);
        }
    }

    /// Removes nodes that haven't sent an update within `max_time`, closing
    /// their socket task by dropping the outbox.
    pub async fn run_liveness_sweep(&self, max_time: Duration) -> ! {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            for uid in self.registry.expired(max_time) {
                self.outboxes.write().unwrap_or_else(|e| e.into_inner()).remove(&uid);
                self.registry.remove(&uid);
            }
        }
    }
}

impl BrokerEventSink for Arc<WsNodeGateway> {
    fn on_client_connected(&self, client_uid: &str) {
        self.registry.fetch_nodes_cache(client_uid);
    }

    fn on_node_update_request(&self, uid: &str, endpoint: &str, payload: &str) {
        let frame = NodeSetFrame {
            endpoint: endpoint.to_string(),
            payload: payload.to_string(),
        };
        self.send_to_node(uid, serde_json::to_string(&frame).expect("NodeSetFrame always serializes"));
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(gateway): State<Arc<WsNodeGateway>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

async fn handle_socket(socket: WebSocket, gateway: Arc<WsNodeGateway>) {
    let uid = Node::fresh_uid();
    gateway.registry.add(Node::new(uid.clone(), HashMap::new()));
    tracing::info!(uid, "ws node connected");

    let (tx, rx) = mpsc::unbounded_channel::<String>();
    gateway
        .outboxes
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(uid.clone(), tx);

    gateway.send_to_node(&uid, DiscoverRequest::default().to_json());

    let (sender, receiver) = socket.split();
    let mut send_task = tokio::spawn(task_send(sender, rx));
    let mut receive_task = tokio::spawn(task_receive(receiver, Arc::clone(&gateway), uid.clone()));

    tokio::select! {
        _ = &mut send_task => receive_task.abort(),
        _ = &mut receive_task => send_task.abort(),
    }

    gateway.outboxes.write().unwrap_or_else(|e| e.into_inner()).remove(&uid);
    gateway.registry.remove(&uid);
    tracing::info!(uid, "ws node disconnected");
}

async fn task_send(mut sender: futures::stream::SplitSink<WebSocket, ws::Message>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = rx.recv().await {
        if sender.send(ws::Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}

async fn task_receive(mut receiver: futures::stream::SplitStream<WebSocket>, gateway: Arc<WsNodeGateway>, uid: String) {
    while let Some(message) = receiver.next().await {
        let Ok(ws::Message::Text(raw)) = message else {
            continue;
        };

        let Ok(frame) = serde_json::from_str::<NodeUpdateFrame>(&raw) else {
            tracing::debug!(uid, raw = %raw, "dropping unparseable ws node frame");
            continue;
        };

        for (resource, value) in frame.data {
            gateway.registry.forward_data_from_node(&uid, &resource, &value);
        }
    }
}
