//! CoAP protocol gateway: a UDP CoAP server accepting node check-ins and
//! resource reports on `/alive` and `/server`, plus a CoAP client used to
//! run CoRE-link discovery and forward client-initiated resource writes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use coap_lite::{CoapRequest, MessageClass, Packet, RequestType, ResponseType};
use fernet::Fernet;
use tokio::net::UdpSocket;

use crate::gateway::broker_link::BrokerEventSink;
use crate::gateway::registry::NodeRegistry;
use crate::node::{Node, SecureChannel, SecureChannelError};

/// Path a node runs its EDHOC handshake against before its first `/server`
/// POST, installing a [`SecureChannel`] on its registry entry.
const EDHOC_PATH: &str = ".well-known/edhoc";

pub const DEFAULT_PORT: u16 = 5683;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum CoapError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("coap packet decode failed")]
    Decode,
}

/// Maps a node's IP address to the uid it was assigned on first contact.
/// CoAP nodes, unlike MQTT nodes, have no persistent id of their own.
#[derive(Default)]
struct IpIndex(RwLock<HashMap<String, String>>);

impl IpIndex {
    fn get(&self, ip: &str) -> Option<String> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).get(ip).cloned()
    }

    fn insert(&self, ip: &str, uid: &str) {
        self.0
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ip.to_string(), uid.to_string());
    }

    fn remove_by_uid(&self, uid: &str) {
        self.0.write().unwrap_or_else(|e| e.into_inner()).retain(|_, v| v != uid);
    }
}

/// Runs the CoAP gateway: the UDP server loop, the liveness sweep, and
/// exposes the [`BrokerEventSink`] the broker link drives PUT forwarding
/// through.
pub struct CoapGateway {
    registry: Arc<NodeRegistry>,
    ips: IpIndex,
    socket: Arc<UdpSocket>,
}

impl CoapGateway {
    pub async fn bind(port: u16, registry: Arc<NodeRegistry>) -> Result<Arc<Self>, CoapError> {
        let socket = UdpSocket::bind(("::", port)).await?;
        Ok(Arc::new(Self {
            registry,
            ips: IpIndex::default(),
            socket: Arc::new(socket),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Drives the UDP server loop forever, dispatching `/alive` and
    /// `/server` POSTs from nodes.
    pub async fn serve(&self) -> ! {
        let mut buf = vec![0u8; 2048];
        loop {
            let (len, remote) = match self.socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(%err, "coap recv_from failed");
                    continue;
                }
            };

            let Ok(packet) = Packet::from_bytes(&buf[..len]) else {
                tracing::debug!(%remote, "dropping malformed coap packet");
                continue;
            };

            let request: CoapRequest<SocketAddr> = CoapRequest::from_packet(packet, remote);
            if request.get_method() != &RequestType::Post {
                continue;
            }

            let path = request.get_path();
            let payload = String::from_utf8_lossy(&request.message.payload).into_owned();
            let ip = remote.ip().to_string();

            match path.as_str() {
                "alive" => self.handle_alive(&ip, &payload),
                "server" => self.handle_server_post(&ip, &payload),
                other => tracing::debug!(path = other, "unknown coap resource"),
            }

            let mut ack = Packet::new();
            ack.header.set_type(coap_lite::PacketType::Acknowledgement);
            ack.header.message_id = request.message.header.message_id;
            ack.set_token(request.message.get_token().to_vec());
            ack.header.code = MessageClass::Response(ResponseType::Changed);
            ack.payload = format!("Received '{payload}'").into_bytes();
            if let Ok(bytes) = ack.to_bytes() {
                let _ = self.socket.send_to(&bytes, remote).await;
            }
        }
    }

    /// `/alive` payload is `"<token>:<uid>"`, or `"reset:<uid>"` on a node
    /// reboot. The node-supplied `uid` is the node's identity; the ip→uid
    /// index is only a lookup aid for `/server` POSTs, which carry no uid of
    /// their own.
    fn handle_alive(&self, ip: &str, payload: &str) {
        let Some((marker, uid)) = payload.split_once(':') else {
            tracing::debug!(payload, "malformed alive payload, expected '<token>:<uid>'");
            return;
        };
        if uid.is_empty() {
            tracing::debug!(payload, "malformed alive payload, empty uid");
            return;
        }

        self.ips.insert(ip, uid);

        if self.registry.has_node(uid) {
            if marker == "reset" {
                self.registry.reset(uid, &[("ip", ip)]);
                self.spawn_discovery(ip.to_string(), uid.to_string());
            } else {
                self.registry.touch(uid);
            }
        } else {
            let node = Node::new(uid.to_string(), HashMap::from([("ip".to_string(), ip.to_string())]));
            self.registry.add(node);
            self.spawn_discovery(ip.to_string(), uid.to_string());
        }
    }

    fn handle_server_post(&self, ip: &str, payload: &str) {
        let Some(uid) = self.ips.get(ip) else {
            tracing::debug!(ip, "server POST from unknown coap node");
            return;
        };
        let Some((endpoint, value)) = payload.split_once(':') else {
            tracing::debug!(payload, "malformed coap server payload");
            return;
        };
        let plaintext = match self.registry.with_node(&uid, |node| node.decrypt_if_secured(value)) {
            Some(Ok(plaintext)) => plaintext,
            Some(Err(err)) => {
                tracing::debug!(uid, %err, "failed to decrypt coap server payload");
                return;
            }
            None => {
                tracing::debug!(uid, "server POST for node missing from registry");
                return;
            }
        };
        self.registry.forward_data_from_node(&uid, endpoint, &plaintext);
    }

    fn spawn_discovery(&self, ip: String, uid: String) {
        let socket = Arc::clone(&self.socket);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            if let Err(err) = discover_node(&socket, &ip, &uid, &registry).await {
                tracing::debug!(ip, %err, "coap resource discovery failed");
            }
        });
    }

    /// Implements [`BrokerEventSink::on_node_update_request`]'s PUT
    /// forwarding; split out so it can be awaited from a spawned task.
    async fn put_resource(&self, uid: &str, endpoint: &str, payload: &str) {
        let Some(ip) = self.registry.with_node(uid, |node| node.resources.get("ip").cloned()).flatten() else {
            tracing::debug!(uid, "PUT requested for unknown coap node");
            return;
        };
        let wire_payload = self
            .registry
            .with_node(uid, |node| node.encrypt_if_secured(payload))
            .unwrap_or_else(|| payload.to_string());

        match coap_request(&self.socket, &ip, RequestType::Put, endpoint, wire_payload.as_bytes()).await {
            Ok((code, _)) if code == MessageClass::Response(ResponseType::Changed) => {
                self.registry.forward_data_from_node(uid, endpoint, payload);
            }
            Ok((code, _)) => {
                tracing::debug!(uid, endpoint, ?code, "coap PUT rejected by node");
            }
            Err(err) => {
                tracing::debug!(uid, endpoint, %err, "coap PUT failed");
            }
        }
    }
}

impl BrokerEventSink for Arc<CoapGateway> {
    fn on_client_connected(&self, client_uid: &str) {
        self.registry.fetch_nodes_cache(client_uid);
    }

    fn on_node_update_request(&self, uid: &str, endpoint: &str, payload: &str) {
        let gateway = Arc::clone(self);
        let (uid, endpoint, payload) = (uid.to_string(), endpoint.to_string(), payload.to_string());
        tokio::spawn(async move { gateway.put_resource(&uid, &endpoint, &payload).await });
    }
}

impl CoapGateway {
    /// Removes nodes that haven't checked in within `max_time`, forever,
    /// at a fixed 1-second cadence.
    pub async fn run_liveness_sweep(&self, max_time: Duration) -> ! {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            for uid in self.registry.expired(max_time) {
                self.ips.remove_by_uid(&uid);
                self.registry.remove(&uid);
            }
        }
    }
}

/// Runs CoRE-link discovery against a freshly-seen node: GET
/// `/.well-known/core`, then GET each advertised endpoint and cache its
/// value, forwarding each as an `update` to the broker.
async fn discover_node(
    socket: &UdpSocket,
    ip: &str,
    uid: &str,
    registry: &NodeRegistry,
) -> Result<(), CoapError> {
    let (code, body) = coap_request(socket, ip, RequestType::Get, ".well-known/core", b"").await?;
    if code != MessageClass::Response(ResponseType::Content) {
        return Ok(());
    }

    for endpoint in core_link_paths(&body) {
        if endpoint == EDHOC_PATH {
            match run_edhoc_handshake(socket, ip).await {
                Ok(channel) => registry.install_secure_channel(uid, std::sync::Arc::new(channel)),
                Err(err) => tracing::debug!(ip, %err, "edhoc handshake failed, node stays unsecured"),
            }
            continue;
        }

        let Ok((code, payload)) = coap_request(socket, ip, RequestType::Get, &endpoint, b"").await else {
            continue;
        };
        if code != MessageClass::Response(ResponseType::Content) {
            continue;
        }
        registry.forward_data_from_node(uid, &endpoint, &payload);
    }

    Ok(())
}

/// Runs the responder side of a two-exchange EDHOC handshake against a node
/// that advertised `.well-known/edhoc`. The handshake itself (message_1/
/// message_2 exchange, COSE envelope) is out of scope; this only performs
/// the two round-trip POSTs and derives the resulting [`SecureChannel`].
async fn run_edhoc_handshake(socket: &UdpSocket, ip: &str) -> Result<EdhocChannel, CoapError> {
    let key = Fernet::generate_key();
    let fernet = Fernet::new(&key).ok_or(CoapError::Decode)?;

    let (code, _) = coap_request(socket, ip, RequestType::Post, EDHOC_PATH, b"message_1").await?;
    if code != MessageClass::Response(ResponseType::Changed) {
        return Err(CoapError::Decode);
    }
    let (code, _) = coap_request(socket, ip, RequestType::Post, EDHOC_PATH, key.as_bytes()).await?;
    if code != MessageClass::Response(ResponseType::Changed) {
        return Err(CoapError::Decode);
    }

    Ok(EdhocChannel(fernet))
}

/// [`SecureChannel`] backed by the symmetric key exchanged during
/// [`run_edhoc_handshake`].
struct EdhocChannel(Fernet);

impl SecureChannel for EdhocChannel {
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        self.0.encrypt(plaintext).into_bytes()
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, SecureChannelError> {
        let token = std::str::from_utf8(ciphertext).map_err(|_| SecureChannelError)?;
        self.0.decrypt(token).map_err(|_| SecureChannelError)
    }
}

/// Parses a CoRE-link header (`</a>;ct=0,</b>;ct=0`) into bare resource
/// paths, dropping the `.well-known/core` resource itself and option
/// metadata after the `;`.
fn core_link_paths(link_header: &str) -> Vec<String> {
    link_header
        .replace(' ', "")
        .split(',')
        .filter_map(|entry| {
            let path = entry.split(';').next().unwrap_or("").trim_matches(['<', '>']);
            let path = path.trim_start_matches('/');
            if path.is_empty() || path == ".well-known/core" {
                None
            } else {
                Some(path.to_string())
            }
        })
        .collect()
}

/// Sends a single CoAP request to `ip` and awaits its response, bounded by
/// [`REQUEST_TIMEOUT`]. Uses a fresh ephemeral socket per request since
/// this gateway's bound socket is reserved for the inbound server loop.
async fn coap_request(
    _server_socket: &UdpSocket,
    ip: &str,
    method: RequestType,
    path: &str,
    payload: &[u8],
) -> Result<(MessageClass, String), CoapError> {
    let client = UdpSocket::bind(("::", 0)).await?;
    let addr: SocketAddr = format!("[{ip}]:{}", DEFAULT_PORT).parse().map_err(|_| CoapError::Decode)?;

    let mut packet = Packet::new();
    packet.header.set_type(coap_lite::PacketType::Confirmable);
    packet.header.code = method_to_code(method);
    packet.set_path(path);
    packet.payload = payload.to_vec();
    let message_id = rand::random::<u16>();
    packet.header.message_id = message_id;

    let bytes = packet.to_bytes().map_err(|_| CoapError::Decode)?;

    tokio::time::timeout(REQUEST_TIMEOUT, async {
        client.send_to(&bytes, addr).await?;
        let mut buf = vec![0u8; 2048];
        let (len, _) = client.recv_from(&mut buf).await?;
        let response = Packet::from_bytes(&buf[..len]).map_err(|_| CoapError::Decode)?;
        let body = String::from_utf8_lossy(&response.payload).into_owned();
        Ok((response.header.code, body))
    })
    .await
    .map_err(|_| CoapError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "coap request timed out")))?
}

fn method_to_code(method: RequestType) -> MessageClass {
    match method {
        RequestType::Get => MessageClass::Request(coap_lite::RequestType::Get),
        RequestType::Put => MessageClass::Request(coap_lite::RequestType::Put),
        RequestType::Post => MessageClass::Request(coap_lite::RequestType::Post),
        other => MessageClass::Request(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use tokio::sync::mpsc;

    #[test]
    fn core_link_paths_strips_metadata_and_self() {
        let header = r#"</.well-known/core>;ct=40,</temp>;rt="t",</led>;rt="l""#;
        let paths = core_link_paths(header);
        assert_eq!(paths, vec!["temp".to_string(), "led".to_string()]);
    }

    #[test]
    fn core_link_paths_handles_single_entry() {
        assert_eq!(core_link_paths("</led>"), vec!["led".to_string()]);
    }

    #[test]
    fn core_link_paths_empty_header_yields_nothing() {
        assert!(core_link_paths("").is_empty());
    }

    #[test]
    fn ip_index_tracks_and_forgets_by_uid() {
        let ips = IpIndex::default();
        ips.insert("::1", "n1");
        assert_eq!(ips.get("::1"), Some("n1".to_string()));

        ips.remove_by_uid("n1");
        assert_eq!(ips.get("::1"), None);
    }

    #[test]
    fn method_to_code_maps_request_types() {
        assert_eq!(method_to_code(RequestType::Get), MessageClass::Request(coap_lite::RequestType::Get));
        assert_eq!(method_to_code(RequestType::Put), MessageClass::Request(coap_lite::RequestType::Put));
    }

    #[test]
    fn core_link_paths_surfaces_edhoc_entry() {
        let header = r#"</.well-known/core>;ct=40,</.well-known/edhoc>;ct=60"#;
        assert_eq!(core_link_paths(header), vec![EDHOC_PATH.to_string()]);
    }

    async fn harness() -> (std::sync::Arc<CoapGateway>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = std::sync::Arc::new(NodeRegistry::new("CoAP", tx));
        let gateway = CoapGateway::bind(0, registry).await.expect("bind ephemeral coap port");
        (gateway, rx)
    }

    #[tokio::test]
    async fn handle_alive_keys_node_by_node_supplied_uid() {
        let (gateway, mut rx) = harness().await;
        gateway.handle_alive("10.0.0.1", "tok:node-7");
        assert!(gateway.registry.has_node("node-7"));
        assert_eq!(gateway.ips.get("10.0.0.1"), Some("node-7".to_string()));
        assert_eq!(rx.try_recv().unwrap().uid(), "node-7");
    }

    #[tokio::test]
    async fn handle_alive_tracks_uid_across_ip_change() {
        let (gateway, mut rx) = harness().await;
        gateway.handle_alive("10.0.0.1", "tok:node-7");
        while rx.try_recv().is_ok() {}

        gateway.handle_alive("10.0.0.2", "tok:node-7");
        assert_eq!(gateway.ips.get("10.0.0.2"), Some("node-7".to_string()));
        assert!(rx.try_recv().is_err(), "a plain re-announce is just a touch, not a new node");
    }

    #[tokio::test]
    async fn handle_alive_reset_prefix_resets_known_node() {
        let (gateway, mut rx) = harness().await;
        gateway.handle_alive("10.0.0.1", "tok:node-7");
        while rx.try_recv().is_ok() {}

        gateway.handle_alive("10.0.0.1", "reset:node-7");
        assert_eq!(rx.try_recv().unwrap(), Message::reset_node("node-7"));
    }

    #[tokio::test]
    async fn handle_alive_rejects_payload_without_uid() {
        let (gateway, _rx) = harness().await;
        gateway.handle_alive("10.0.0.1", "no-colon-here");
        assert!(gateway.registry.is_empty());
    }
}
