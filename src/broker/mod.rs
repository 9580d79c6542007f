//! The broker hub: the single process every gateway and every dashboard
//! client websocket connects to. Mirrors the routing rules of the original
//! tornado `BrokerApplication` almost one for one, just expressed over
//! `tokio::sync::mpsc` outboxes instead of directly writing to sockets.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::message::Message;

pub mod client;
pub mod gateway;

pub use client::ClientId;
pub use gateway::GatewayId;

/// Outbox depth before a subscriber is considered caught up. A dashboard
/// client or gateway consuming at a normal rate never gets close to this.
const OUTBOX_CAPACITY: usize = 64;

/// How long a single send is allowed to block on a full outbox before the
/// subscriber behind it is dropped. Keeps one stuck client from stalling the
/// whole fan-out.
const SLOW_SUBSCRIBER_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared hub state. Every `/ws` and `/gw` connection handler holds an
/// `Arc<Hub>` and drives its own send/receive tasks against it; the hub
/// itself never touches a socket.
#[derive(Default)]
pub struct Hub {
    clients: RwLock<HashMap<ClientId, mpsc::Sender<Message>>>,
    gateways: RwLock<HashMap<GatewayId, GatewayEntry>>,
}

struct GatewayEntry {
    outbox: mpsc::Sender<Message>,
    nodes: gateway::OwnedNodes,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly connected dashboard client, returning its id and
    /// the receiving end of its bounded outbox.
    pub fn register_client(&self) -> (ClientId, mpsc::Receiver<Message>) {
        let id = ClientId::fresh();
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        self.clients.write().unwrap_or_else(|e| e.into_inner()).insert(id.clone(), tx);
        tracing::info!(client = %id, "client connected");
        (id, rx)
    }

    /// Registers a gateway once its auth token has been verified, returning
    /// its id and the receiving end of its bounded outbox.
    pub fn register_gateway(&self) -> (GatewayId, mpsc::Receiver<Message>) {
        let id = GatewayId::fresh();
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        self.gateways.write().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            GatewayEntry {
                outbox: tx,
                nodes: gateway::OwnedNodes::default(),
            },
        );
        tracing::info!(gateway = %id, "gateway authenticated and registered");
        (id, rx)
    }

    /// Sends `message` to a single client, if it's still connected. A client
    /// whose outbox doesn't drain within [`SLOW_SUBSCRIBER_TIMEOUT`] is
    /// dropped from the hub rather than let it block the fan-out.
    async fn send_to_client(&self, dst: &ClientId, message: &Message) {
        let outbox = {
            let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
            clients.get(dst).cloned()
        };
        let Some(outbox) = outbox else {
            return;
        };
        if tokio::time::timeout(SLOW_SUBSCRIBER_TIMEOUT, outbox.send(message.clone())).await.is_err() {
            tracing::warn!(client = %dst, "client outbox did not drain in time, dropping slow subscriber");
            self.clients.write().unwrap_or_else(|e| e.into_inner()).remove(dst);
        }
    }

    /// Sends `message` to every connected client.
    async fn broadcast_to_clients(&self, message: &Message) {
        let targets: Vec<(ClientId, mpsc::Sender<Message>)> = {
            let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
            clients.iter().map(|(id, tx)| (id.clone(), tx.clone())).collect()
        };
        for (id, outbox) in targets {
            if tokio::time::timeout(SLOW_SUBSCRIBER_TIMEOUT, outbox.send(message.clone())).await.is_err() {
                tracing::warn!(client = %id, "client outbox did not drain in time, dropping slow subscriber");
                self.clients.write().unwrap_or_else(|e| e.into_inner()).remove(&id);
            }
        }
    }

    /// Forwards `message` to every connected gateway, unchanged.
    async fn forward_to_gateways(&self, message: &Message) {
        let targets: Vec<(GatewayId, mpsc::Sender<Message>)> = {
            let gateways = self.gateways.read().unwrap_or_else(|e| e.into_inner());
            gateways.iter().map(|(id, entry)| (*id, entry.outbox.clone())).collect()
        };
        for (id, outbox) in targets {
            if tokio::time::timeout(SLOW_SUBSCRIBER_TIMEOUT, outbox.send(message.clone())).await.is_err() {
                tracing::warn!(gateway = %id, "gateway outbox did not drain in time, dropping slow subscriber");
                self.gateways.write().unwrap_or_else(|e| e.into_inner()).remove(&id);
            }
        }
    }

    /// Routes a message received on a client's `/ws` connection.
    ///
    /// Every client message, regardless of type, is forwarded verbatim to
    /// every connected gateway after `src` has been stamped with the
    /// client's id.
    pub async fn route_client_message(&self, src: &ClientId, message: Message) {
        let message = message.with_src(src.as_str());
        tracing::debug!(client = %src, ?message, "routing client message to gateways");
        self.forward_to_gateways(&message).await;
    }

    /// Routes a message received on a gateway's `/gw` connection.
    ///
    /// - `new`/`update` with `dst: "all"` broadcasts to every client.
    /// - `new`/`update` with `dst` set to a known client id replays only to
    ///   that client (the per-client cache fetch on connect).
    /// - `out` always broadcasts, and forgets the uid from the gateway's
    ///   owned-node set.
    pub async fn route_gateway_message(&self, from: GatewayId, message: Message) {
        enum Action {
            DispatchByDst(Option<String>),
            Broadcast,
            Ignore,
        }

        let action = {
            let mut gateways = self.gateways.write().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = gateways.get_mut(&from) else {
                return;
            };

            match &message {
                Message::New { uid, dst, .. } => {
                    entry.nodes.insert(uid.clone());
                    Action::DispatchByDst(dst.clone())
                }
                Message::Update { uid, dst, .. } => {
                    if entry.nodes.contains(uid) {
                        Action::DispatchByDst(dst.clone())
                    } else {
                        Action::Ignore
                    }
                }
                Message::Out { uid } => {
                    if entry.nodes.contains(uid) {
                        entry.nodes.remove(uid);
                        Action::Broadcast
                    } else {
                        Action::Ignore
                    }
                }
                Message::Reset { .. } => Action::Broadcast,
            }
        };

        match action {
            Action::DispatchByDst(dst) => self.dispatch_by_dst(dst.as_deref(), &message).await,
            Action::Broadcast => self.broadcast_to_clients(&message).await,
            Action::Ignore => {}
        }
    }

    async fn dispatch_by_dst(&self, dst: Option<&str>, message: &Message) {
        match dst {
            Some("all") | None => self.broadcast_to_clients(message).await,
            Some(dst) => {
                let target_id = {
                    let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
                    clients.keys().find(|id| id.as_str() == dst).cloned()
                };
                if let Some(id) = target_id {
                    self.send_to_client(&id, message).await;
                }
            }
        }
    }

    /// Removes a disconnected client.
    pub fn remove_client(&self, id: &ClientId) {
        self.clients.write().unwrap_or_else(|e| e.into_inner()).remove(id);
        tracing::info!(client = %id, "client disconnected");
    }

    /// Removes a disconnected gateway, broadcasting `out` for every node it
    /// owned so dashboards don't keep stale entries around.
    pub async fn remove_gateway(&self, id: GatewayId) {
        let entry = self.gateways.write().unwrap_or_else(|e| e.into_inner()).remove(&id);
        let Some(entry) = entry else {
            return;
        };
        tracing::info!(gateway = %id, nodes = entry.nodes.iter().count(), "gateway disconnected");
        for uid in entry.nodes.iter() {
            self.broadcast_to_clients(&Message::out_node(uid.clone())).await;
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn gateway_count(&self) -> usize {
        self.gateways.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
