use std::sync::Arc;

use clap::Parser;
use iot_bridge::auth;
use iot_bridge::config::{self, CommonArgs, GatewayConfig};
use iot_bridge::gateway::broker_link::{self, BrokerEventSink};
use iot_bridge::gateway::registry::NodeRegistry;
use iot_bridge::gateway::ws::{self, WsNodeGateway};

/// The WebSocket-node protocol gateway: bridges nodes that speak the
/// fabric's native websocket frames directly to the broker.
#[derive(Parser)]
#[command(version, about = "WebSocket gateway")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Port the WebSocket-node server listens on. Overrides `--port` and the
    /// config file's `gateway_port`.
    #[arg(long = "gateway-port")]
    gateway_port: Option<u16>,

    /// Liveness window, in seconds, before an unresponsive node is expired.
    #[arg(long = "max-time")]
    max_time: Option<u64>,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let file_config = config::load_file_layer(&cli.common).unwrap_or_else(|err| {
        eprintln!("failed to load config file: {err}");
        std::process::exit(1);
    });
    let mut config = GatewayConfig::resolve(&cli.common, &file_config);
    if let Some(max_time) = cli.max_time {
        config.max_time = std::time::Duration::from_secs(max_time);
    }
    let gateway_port = cli
        .gateway_port
        .or(cli.common.port)
        .or(file_config.gateway_port)
        .unwrap_or(ws::DEFAULT_PORT);

    let filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let keys = auth::check_key_file(&config.key_file).unwrap_or_else(|err| {
        eprintln!("failed to load key file {:?}: {err}", config.key_file);
        std::process::exit(1);
    });

    let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let registry = Arc::new(NodeRegistry::new("WebSocket", outbound_tx));

    let gateway = WsNodeGateway::new(Arc::clone(&registry));
    let app = gateway.clone().router();

    let addr = format!("0.0.0.0:{gateway_port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|err| panic!("failed to bind {addr}: {err}"));

    tracing::info!(%addr, "ws-node gateway listening");

    let max_time = config.max_time;
    let ws_url = format!("ws://{}:{}/gw", config.broker_host, config.broker_port);

    tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .unwrap_or_else(|err| panic!("ws-node gateway server failed: {err}"));
    });
    tokio::spawn({
        let gateway = Arc::clone(&gateway);
        async move { gateway.run_liveness_sweep(max_time).await }
    });

    let sink: Arc<dyn BrokerEventSink> = Arc::new(Arc::clone(&gateway));
    tokio::spawn(async move { broker_link::run(&ws_url, keys, registry, outbound_rx, sink).await });

    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
