//! End-to-end exercises of the broker's `/ws` and `/gw` websocket surface:
//! real TCP connections, real auth tokens, real JSON frames.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use iot_bridge::auth;
use iot_bridge::broker::Hub;
use iot_bridge::http;
use iot_bridge::message::Message;
use tokio::net::TcpListener;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;

type GwStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_broker() -> (String, auth::Keys) {
    let keys = auth::generate_keys();
    let hub = Arc::new(Hub::new());
    let app = http::make_app_router(hub, keys.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    (format!("127.0.0.1:{}", addr.port()), keys)
}

async fn connect_gateway(addr: &str, keys: &auth::Keys) -> GwStream {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/gw")).await.unwrap();
    let token = auth::auth_token(keys).unwrap();
    ws.send(WsMessage::Text(token.into())).await.unwrap();
    ws
}

async fn connect_client(addr: &str) -> GwStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn recv_message(ws: &mut GwStream) -> Message {
    loop {
        match ws.next().await.expect("socket closed unexpectedly").unwrap() {
            WsMessage::Text(raw) => return Message::parse(&raw).unwrap(),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn two_clients_both_receive_a_broadcast_new_node() {
    let (addr, keys) = spawn_broker().await;

    let mut gateway = connect_gateway(&addr, &keys).await;
    let mut c1 = connect_client(&addr).await;
    let mut c2 = connect_client(&addr).await;

    // Give the broker a moment to register both clients before the gateway
    // broadcasts, since registration and the gateway message race over two
    // independent connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    gateway
        .send(WsMessage::Text(Message::new_node("n1", "all").to_json().into()))
        .await
        .unwrap();

    let m1 = recv_message(&mut c1).await;
    let m2 = recv_message(&mut c2).await;
    assert_eq!(m1, Message::new_node("n1", "all"));
    assert_eq!(m2, Message::new_node("n1", "all"));
}

#[tokio::test]
async fn client_message_is_forwarded_to_gateway_with_src_stamped() {
    let (addr, keys) = spawn_broker().await;

    let mut gateway = connect_gateway(&addr, &keys).await;
    let mut client = connect_client(&addr).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    client
        .send(WsMessage::Text(
            Message::update_node("n1", "led", "1", "all").to_json().into(),
        ))
        .await
        .unwrap();

    let forwarded = recv_message(&mut gateway).await;
    match forwarded {
        Message::Update { uid, endpoint, data, src, .. } => {
            assert_eq!(uid, "n1");
            assert_eq!(endpoint.as_deref(), Some("led"));
            assert_eq!(data.as_deref(), Some("1"));
            assert!(src.is_some(), "broker must stamp src on forwarded client messages");
        }
        other => panic!("expected update, got {other:?}"),
    }
}

#[tokio::test]
async fn gateway_replays_cache_only_to_requesting_client_dst() {
    let (addr, keys) = spawn_broker().await;

    let mut gateway = connect_gateway(&addr, &keys).await;
    let mut c1 = connect_client(&addr).await;
    let mut c2 = connect_client(&addr).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Drive the dashboard hello frame through the broker so it reaches the
    // gateway with `src` stamped, exactly like a real fetch-cache request.
    c1.send(WsMessage::Text(Message::client_hello().to_json().into())).await.unwrap();
    let hello = recv_message(&mut gateway).await;
    let client_id = hello.src().expect("hello must carry the stamped client id").to_string();

    gateway
        .send(WsMessage::Text(Message::new_node("n1", client_id.clone()).to_json().into()))
        .await
        .unwrap();

    let replay = recv_message(&mut c1).await;
    assert_eq!(replay, Message::new_node("n1", client_id));

    // c2 never asked, so it gets nothing within a short window.
    let nothing = tokio::time::timeout(Duration::from_millis(200), c2.next()).await;
    assert!(nothing.is_err(), "a dst-targeted replay must not reach other clients");
}

#[tokio::test]
async fn gateway_socket_closes_if_first_frame_is_not_a_valid_token() {
    let (addr, _keys) = spawn_broker().await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/gw")).await.unwrap();
    ws.send(WsMessage::Text("not-a-real-token".into())).await.unwrap();

    let next = tokio::time::timeout(Duration::from_secs(3), ws.next()).await;
    match next {
        Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) => {}
        other => panic!("expected the connection to be closed after a bad token, got {other:?}"),
    }
}

#[tokio::test]
async fn gateway_socket_closes_if_no_frame_arrives_within_auth_window() {
    let (addr, _keys) = spawn_broker().await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/gw")).await.unwrap();

    let next = tokio::time::timeout(Duration::from_secs(3), ws.next()).await;
    match next {
        Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) => {}
        other => panic!("expected the connection to be closed after the auth window elapsed, got {other:?}"),
    }
}

/// A fake CoAP node bound to the well-known CoAP port on `::1`, answering
/// `.well-known/core` discovery and the two resource GETs it advertises.
async fn spawn_fake_coap_node() {
    use coap_lite::{CoapRequest, MessageClass, Packet, PacketType, ResponseType};

    let socket = tokio::net::UdpSocket::bind("[::1]:5683")
        .await
        .expect("bind fake coap node on the well-known coap port");
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(packet) = Packet::from_bytes(&buf[..len]) else { continue };
            let request: CoapRequest<std::net::SocketAddr> = CoapRequest::from_packet(packet, from);
            let body: &[u8] = match request.get_path().as_str() {
                ".well-known/core" => br#"</temp>;rt="t",</led>;rt="l""#,
                "temp" => b"23",
                "led" => b"0",
                _ => b"",
            };
            let mut reply = Packet::new();
            reply.header.set_type(PacketType::Acknowledgement);
            reply.header.message_id = request.message.header.message_id;
            reply.set_token(request.message.get_token().to_vec());
            reply.header.code = MessageClass::Response(ResponseType::Content);
            reply.payload = body.to_vec();
            if let Ok(bytes) = reply.to_bytes() {
                let _ = socket.send_to(&bytes, from).await;
            }
        }
    });
}

fn coap_post(path: &str, payload: &[u8], message_id: u16) -> Vec<u8> {
    use coap_lite::{MessageClass, Packet, PacketType, RequestType};

    let mut packet = Packet::new();
    packet.header.set_type(PacketType::Confirmable);
    packet.header.code = MessageClass::Request(RequestType::Post);
    packet.set_path(path);
    packet.payload = payload.to_vec();
    packet.header.message_id = message_id;
    packet.to_bytes().unwrap()
}

#[tokio::test]
async fn coap_alive_then_discovery_replays_full_resource_set() {
    use iot_bridge::gateway::coap::CoapGateway;
    use iot_bridge::gateway::registry::NodeRegistry;
    use tokio::net::UdpSocket;

    spawn_fake_coap_node().await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let registry = Arc::new(NodeRegistry::new("CoAP", tx));
    let gateway = CoapGateway::bind(0, registry).await.expect("bind coap gateway");
    let gw_port = gateway.local_addr().expect("gateway has a local addr").port();

    tokio::spawn({
        let gateway = Arc::clone(&gateway);
        async move { gateway.serve().await }
    });

    let client = UdpSocket::bind("[::1]:0").await.unwrap();
    client
        .send_to(&coap_post("alive", b"tok:n1", 1), format!("[::1]:{gw_port}"))
        .await
        .unwrap();

    // `new`, then `update(ip)`/`update(protocol)` in either order, then the
    // discovered resources in core-link order (temp, led).
    let mut seen = vec![];
    for _ in 0..5 {
        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("expected 5 messages for the full alive+discovery sequence")
            .expect("registry outbound channel closed early");
        seen.push(message);
    }

    assert_eq!(seen[0], Message::new_node("n1", "all"));

    let mut early_updates: Vec<(String, String)> = seen[1..3]
        .iter()
        .map(|m| match m {
            Message::Update { endpoint, data, .. } => (endpoint.clone().unwrap(), data.clone().unwrap()),
            other => panic!("expected update, got {other:?}"),
        })
        .collect();
    early_updates.sort();
    assert_eq!(
        early_updates,
        vec![("ip".to_string(), "::1".to_string()), ("protocol".to_string(), "CoAP".to_string())]
    );

    assert_eq!(seen[3], Message::update_node("n1", "temp", "23", "all"));
    assert_eq!(seen[4], Message::update_node("n1", "led", "0", "all"));
}

#[tokio::test]
async fn coap_node_expiry_emits_exactly_one_out() {
    use iot_bridge::gateway::coap::CoapGateway;
    use iot_bridge::gateway::registry::NodeRegistry;
    use tokio::net::UdpSocket;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let registry = Arc::new(NodeRegistry::new("CoAP", tx));
    let gateway = CoapGateway::bind(0, registry).await.expect("bind coap gateway");
    let gw_port = gateway.local_addr().expect("gateway has a local addr").port();

    tokio::spawn({
        let gateway = Arc::clone(&gateway);
        async move { gateway.serve().await }
    });
    tokio::spawn({
        let gateway = Arc::clone(&gateway);
        async move { gateway.run_liveness_sweep(Duration::from_millis(50)).await }
    });

    let client = UdpSocket::bind("[::1]:0").await.unwrap();
    client
        .send_to(&coap_post("alive", b"tok:n1", 1), format!("[::1]:{gw_port}"))
        .await
        .unwrap();

    // n1 has no real node listening at [::1]:5683 in this test, so discovery
    // simply times out in the background; only the liveness sweep's `out`
    // matters here. Drain the `new`+update pair first.
    tokio::time::sleep(Duration::from_millis(50)).await;
    while rx.try_recv().is_ok() {}

    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut outs = vec![];
    while let Ok(message) = rx.try_recv() {
        outs.push(message);
    }
    assert_eq!(outs, vec![Message::out_node("n1")]);
}

#[tokio::test]
async fn gateway_reconnect_replays_full_node_cache() {
    use iot_bridge::gateway::broker_link::{self, BrokerEventSink};
    use iot_bridge::gateway::registry::NodeRegistry;
    use iot_bridge::node::Node;
    use std::collections::HashMap;

    let keys = auth::generate_keys();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_str = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

    let hub = Arc::new(Hub::new());
    let app = http::make_app_router(hub, keys.clone());
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });

    let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let registry = Arc::new(NodeRegistry::new("CoAP", outbound_tx));
    registry.add(Node::new("n1", HashMap::from([("ip".to_string(), "::1".to_string())])));

    struct NoopSink;
    impl BrokerEventSink for NoopSink {
        fn on_client_connected(&self, _client_uid: &str) {}
        fn on_node_update_request(&self, _uid: &str, _endpoint: &str, _payload: &str) {}
    }
    let sink: Arc<dyn BrokerEventSink> = Arc::new(NoopSink);

    let ws_url = format!("ws://{addr_str}/gw");
    tokio::spawn(broker_link::run(&ws_url, keys.clone(), Arc::clone(&registry), outbound_rx, sink));

    tokio::time::sleep(Duration::from_millis(300)).await;

    // Kill the broker to force the gateway's broker_link into its reconnect
    // loop, then bring a fresh broker instance up on the same port.
    let _ = shutdown_tx.send(());
    let _ = server.await;

    let listener2 = TcpListener::bind(&addr_str).await.unwrap();
    let hub2 = Arc::new(Hub::new());
    let app2 = http::make_app_router(hub2, keys.clone());
    tokio::spawn(async move {
        axum::serve(listener2, app2).await.ok();
    });

    // A dashboard client connected to the new broker instance should see the
    // full `new`+`update*` replay once the gateway's reconnect loop
    // re-establishes the link and re-runs its cache fetch.
    let mut client = connect_client(&addr_str).await;

    let new = tokio::time::timeout(Duration::from_secs(8), recv_message(&mut client))
        .await
        .expect("gateway must reconnect and replay its node cache within the reconnect window");
    assert_eq!(new, Message::new_node("n1", "all"));

    let u1 = recv_message(&mut client).await;
    let u2 = recv_message(&mut client).await;
    let mut updates: Vec<(String, String)> = [u1, u2]
        .into_iter()
        .map(|m| match m {
            Message::Update { endpoint, data, .. } => (endpoint.unwrap(), data.unwrap()),
            other => panic!("expected update, got {other:?}"),
        })
        .collect();
    updates.sort();
    assert_eq!(
        updates,
        vec![("ip".to_string(), "::1".to_string()), ("protocol".to_string(), "CoAP".to_string())]
    );
}
