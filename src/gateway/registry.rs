//! Canonical per-gateway store of [`Node`] objects.
//!
//! The registry is the single place that mutates a gateway's node map. Every
//! mutation emits the matching [`Message`] onto the gateway's outbound-to-broker
//! channel; the registry itself never touches the network.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::message::{Message, DST_ALL};
use crate::node::Node;

/// Default liveness window before an unresponsive node is expired.
pub const DEFAULT_MAX_TIME: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("node registry lock was poisoned")]
    Poisoned,
}

/// Per-gateway registry of managed nodes.
///
/// `protocol` is the value written into every node's `protocol` resource
/// (`CoAP`, `MQTT`, `WebSocket`), matching each gateway's `PROTOCOL` constant
/// in the original implementation.
pub struct NodeRegistry {
    protocol: &'static str,
    nodes: RwLock<HashMap<String, Node>>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl NodeRegistry {
    pub fn new(protocol: &'static str, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            protocol,
            nodes: RwLock::new(HashMap::new()),
            outbound,
        }
    }

    fn emit(&self, message: Message) {
        // The broker-connection actor owns the receiving end; if it has
        // already shut down there's nothing useful left to do with the
        // message, so the send failure is simply logged.
        if self.outbound.send(message).is_err() {
            tracing::warn!("dropped outbound message, broker link is closed");
        }
    }

    pub fn has_node(&self, uid: &str) -> bool {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).contains_key(uid)
    }

    /// Registers a brand-new node, stamps the protocol resource, and emits
    /// `new_node` followed by one `update_node` per resource, then returns
    /// control to the caller so it can run protocol-specific discovery.
    pub fn add(&self, mut node: Node) -> String {
        let uid = node.uid.clone();
        node.set_resource("protocol", self.protocol);

        self.emit(Message::new_node(uid.clone(), DST_ALL));
        let resources: Vec<(String, String)> = node
            .resources
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uid.clone(), node);

        for (resource, value) in resources {
            self.emit(Message::update_node(uid.clone(), resource, value, DST_ALL));
        }

        uid
    }

    /// Clears a node's resources, reapplies `protocol` and any protocol
    /// supplied defaults (e.g. the refreshed `ip`), and emits `reset_node`.
    /// Callers are expected to re-run discovery afterwards.
    pub fn reset(&self, uid: &str, defaults: &[(&str, &str)]) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let Some(node) = nodes.get_mut(uid) else {
            return;
        };
        node.clear_resources();
        node.set_resource("protocol", self.protocol);
        for (key, value) in defaults {
            node.set_resource(*key, *value);
        }
        drop(nodes);
        self.emit(Message::reset_node(uid));
    }

    /// Drops the node from the registry and emits `out_node`.
    pub fn remove(&self, uid: &str) {
        let removed = self
            .nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(uid)
            .is_some();
        if removed {
            self.emit(Message::out_node(uid));
        }
    }

    pub fn touch(&self, uid: &str) {
        if let Some(node) = self.nodes.write().unwrap_or_else(|e| e.into_inner()).get_mut(uid) {
            node.touch();
        }
    }

    /// Updates a single resource's cached value and emits `update_node`.
    pub fn forward_data_from_node(&self, uid: &str, resource: &str, value: &str) {
        let exists = {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            match nodes.get_mut(uid) {
                Some(node) => {
                    node.set_resource(resource, value);
                    true
                }
                None => false,
            }
        };
        if exists {
            self.emit(Message::update_node(uid, resource, value, DST_ALL));
        }
    }

    /// Replays every known node's full cache (`new` + one `update` per
    /// resource) to a single newly-connected client.
    pub fn fetch_nodes_cache(&self, dst: &str) {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        for node in nodes.values() {
            self.emit(Message::new_node(node.uid.clone(), dst));
            for (resource, value) in node.resources.iter() {
                self.emit(Message::update_node(
                    node.uid.clone(),
                    resource.clone(),
                    value.clone(),
                    dst,
                ));
            }
        }
    }

    /// Returns uids of nodes whose `last_seen` is older than `max_time`.
    pub fn expired(&self, max_time: Duration) -> Vec<String> {
        let now = Instant::now();
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|node| now.duration_since(node.last_seen) > max_time)
            .map(|node| node.uid.clone())
            .collect()
    }

    /// Runs `f` with a read lock on a single node, if present.
    pub fn with_node<R>(&self, uid: &str, f: impl FnOnce(&Node) -> R) -> Option<R> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).get(uid).map(f)
    }

    /// Installs a secure channel on an existing node.
    pub fn install_secure_channel(
        &self,
        uid: &str,
        channel: std::sync::Arc<dyn crate::node::SecureChannel>,
    ) {
        if let Some(node) = self.nodes.write().unwrap_or_else(|e| e.into_inner()).get_mut(uid) {
            node.secure_channel = Some(channel);
        }
    }

    /// Returns the uids of every currently-known node.
    pub fn uids(&self) -> Vec<String> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
