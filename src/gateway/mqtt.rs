//! MQTT protocol gateway. Nodes check in on `node/check`, announce their
//! resource set on `node/<id>/resources`, and report individual updates on
//! `node/<id>/<resource>`; the gateway answers with discovery requests on
//! `gateway/<id>/discover` and resource writes on `gateway/<id>/<endpoint>/set`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::Value;

use crate::gateway::broker_link::BrokerEventSink;
use crate::gateway::registry::NodeRegistry;
use crate::node::Node;

pub const DEFAULT_PORT: u16 = 1886;
const REANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error(transparent)]
    Client(#[from] rumqttc::ClientError),
}

/// Maps an MQTT node's own `id` (its client-chosen identifier) to the uid
/// this gateway assigned it.
#[derive(Default)]
struct IdIndex(RwLock<HashMap<String, String>>);

impl IdIndex {
    fn get(&self, id: &str) -> Option<String> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }

    fn insert(&self, id: &str, uid: &str) {
        self.0
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), uid.to_string());
    }

    fn uid_to_id(&self, uid: &str) -> Option<String> {
        self.0
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(_, v)| v.as_str() == uid)
            .map(|(k, _)| k.clone())
    }

    fn remove_by_uid(&self, uid: &str) -> Option<String> {
        let mut map = self.0.write().unwrap_or_else(|e| e.into_inner());
        let id = map.iter().find(|(_, v)| v.as_str() == uid).map(|(k, _)| k.clone())?;
        map.remove(&id);
        Some(id)
    }
}

pub struct MqttGateway {
    registry: Arc<NodeRegistry>,
    ids: IdIndex,
    client: AsyncClient,
}

impl MqttGateway {
    /// Connects to the MQTT broker at `host:port` and subscribes to the
    /// shared node check-in topic. Returns the gateway plus the event loop
    /// that must be driven by [`run_event_loop`].
    pub async fn connect(host: &str, port: u16, registry: Arc<NodeRegistry>) -> Result<(Arc<Self>, EventLoop), MqttError> {
        let mut options = MqttOptions::new("iot-bridge-mqtt-gateway", host, port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, eventloop) = AsyncClient::new(options, 64);

        client.subscribe("node/check", QoS::AtLeastOnce).await?;

        Ok((
            Arc::new(Self {
                registry,
                ids: IdIndex::default(),
                client,
            }),
            eventloop,
        ))
    }

    /// Drives the rumqttc event loop forever, dispatching incoming
    /// publishes to the right handler by topic shape.
    pub async fn run_event_loop(self: Arc<Self>, mut eventloop: EventLoop) -> ! {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.handle_publish(&publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(%err, "mqtt event loop error, retrying");
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
            }
        }
    }

    fn handle_publish(&self, topic: &str, payload: &[u8]) {
        let Ok(data): Result<Value, _> = serde_json::from_slice(payload) else {
            tracing::debug!(topic, "dropping non-JSON mqtt payload");
            return;
        };

        let parts: Vec<&str> = topic.split('/').collect();
        match parts.as_slice() {
            ["node", "check"] => self.handle_check(&data),
            [_, id, "resources"] => self.handle_resources(id, &data),
            [_, id, resource] => self.handle_update(id, resource, &data),
            _ => tracing::debug!(topic, "unrecognized mqtt topic shape"),
        }
    }

    fn handle_check(&self, data: &Value) {
        let Some(node_id) = data.get("id").and_then(Value::as_str) else {
            return;
        };

        if let Some(uid) = self.ids.get(node_id) {
            self.registry.touch(&uid);
            return;
        }

        let uid = Node::fresh_uid();
        self.ids.insert(node_id, &uid);
        let node = Node::new(uid.clone(), HashMap::from([("id".to_string(), node_id.to_string())]));
        self.registry.add(node);
        self.spawn_request_discover(node_id.to_string());
    }

    fn spawn_request_discover(&self, node_id: String) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let topic = format!("gateway/{node_id}/discover");
            if let Err(err) = client.publish(&topic, QoS::AtLeastOnce, false, "resources").await {
                tracing::debug!(%err, topic, "failed to request node discovery");
            }
        });
    }

    fn handle_resources(&self, node_id: &str, data: &Value) {
        let Some(uid) = self.ids.get(node_id) else {
            return;
        };
        let Some(map) = data.as_object() else {
            return;
        };

        for (resource, value) in map {
            let value = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            self.registry.forward_data_from_node(&uid, resource, &value);
            self.spawn_subscribe(node_id.to_string(), resource.clone());
        }

        self.spawn_request_discover_values(node_id.to_string());
    }

    fn spawn_subscribe(&self, node_id: String, resource: String) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let topic = format!("node/{node_id}/{resource}");
            if let Err(err) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                tracing::debug!(%err, topic, "failed to subscribe to node resource topic");
            }
        });
    }

    fn spawn_request_discover_values(&self, node_id: String) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let topic = format!("gateway/{node_id}/discover");
            if let Err(err) = client.publish(&topic, QoS::AtLeastOnce, false, "values").await {
                tracing::debug!(%err, topic, "failed to request node value discovery");
            }
        });
    }

    fn handle_update(&self, node_id: &str, resource: &str, data: &Value) {
        let Some(uid) = self.ids.get(node_id) else {
            return;
        };
        let Some(value) = data.get("value") else {
            return;
        };
        let value = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
        self.registry.forward_data_from_node(&uid, resource, &value);
    }

    async fn publish_set(&self, uid: &str, endpoint: &str, payload: &str) {
        let Some(node_id) = self.ids.uid_to_id(uid) else {
            tracing::debug!(uid, "set requested for unknown mqtt node");
            return;
        };
        let topic = format!("gateway/{node_id}/{endpoint}/set");
        if let Err(err) = self.client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
            tracing::debug!(%err, topic, "failed to publish resource set");
            return;
        }
        self.registry.forward_data_from_node(uid, endpoint, payload);
    }

    /// Publishes `gateway/check` on [`REANNOUNCE_INTERVAL`], asking every
    /// node to re-publish its own check-in so dead ones don't linger.
    pub async fn run_reannounce(&self) -> ! {
        let mut interval = tokio::time::interval(REANNOUNCE_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(err) = self.client.publish("gateway/check", QoS::AtLeastOnce, false, "").await {
                tracing::debug!(%err, "failed to publish re-announce request");
            }
        }
    }

    /// Removes nodes that haven't checked in within `max_time`, unsubscribing
    /// from their topics first.
    pub async fn run_liveness_sweep(&self, max_time: Duration) -> ! {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            for uid in self.registry.expired(max_time) {
                if let Some(node_id) = self.ids.remove_by_uid(&uid) {
                    let _ = self.client.unsubscribe(format!("node/{node_id}/resources")).await;
                    if let Some(resources) = self.registry.with_node(&uid, |n| n.resources.clone()) {
                        for resource in resources.keys() {
                            let _ = self.client.unsubscribe(format!("node/{node_id}/{resource}")).await;
                        }
                    }
                }
                self.registry.remove(&uid);
            }
        }
    }

    /// Unsubscribes every per-node topic and disconnects from the MQTT
    /// broker. Run on gateway shutdown so the broker doesn't keep retained
    /// subscriptions for a gateway that's gone, mirroring the original
    /// gateway's `_disconnect`.
    pub async fn disconnect(&self) {
        for uid in self.registry.uids() {
            let Some(node_id) = self.ids.remove_by_uid(&uid) else {
                continue;
            };
            let _ = self.client.unsubscribe(format!("node/{node_id}/resources")).await;
            if let Some(resources) = self.registry.with_node(&uid, |n| n.resources.clone()) {
                for resource in resources.keys() {
                    let _ = self.client.unsubscribe(format!("node/{node_id}/{resource}")).await;
                }
            }
        }
        if let Err(err) = self.client.disconnect().await {
            tracing::warn!(%err, "failed to cleanly disconnect from mqtt broker");
        }
    }
}

impl BrokerEventSink for Arc<MqttGateway> {
    fn on_client_connected(&self, client_uid: &str) {
        self.registry.fetch_nodes_cache(client_uid);
    }

    fn on_node_update_request(&self, uid: &str, endpoint: &str, payload: &str) {
        let gateway = Arc::clone(self);
        let (uid, endpoint, payload) = (uid.to_string(), endpoint.to_string(), payload.to_string());
        tokio::spawn(async move { gateway.publish_set(&uid, &endpoint, &payload).await });
    }
}
