use std::sync::Arc;

use clap::Parser;
use iot_bridge::auth;
use iot_bridge::config::{self, CommonArgs, GatewayConfig};
use iot_bridge::gateway::broker_link::{self, BrokerEventSink};
use iot_bridge::gateway::coap::{self, CoapGateway};
use iot_bridge::gateway::registry::NodeRegistry;

/// The CoAP protocol gateway: bridges CoAP nodes reachable over UDP to the
/// broker's websocket fabric.
#[derive(Parser)]
#[command(version, about = "CoAP gateway")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Port the CoAP server listens on. Overrides `--port` and the config
    /// file's `coap_port`.
    #[arg(long = "coap-port")]
    coap_port: Option<u16>,

    /// Liveness window, in seconds, before an unresponsive node is expired.
    #[arg(long = "max-time")]
    max_time: Option<u64>,

    /// Require a DTLS-secured (CoAPs) transport for node traffic.
    #[arg(long = "use-coaps")]
    use_coaps: bool,
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
    let coap_port = cli.coap_port.or(cli.common.port).or(file_config.coap_port).unwrap_or(coap::DEFAULT_PORT);
    let use_coaps = cli.use_coaps || file_config.use_coaps.unwrap_or(false);

    let filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    if use_coaps {
        tracing::warn!("--use-coaps requested but DTLS transport is not implemented; falling back to plaintext UDP");
    }

    let keys = auth::check_key_file(&config.key_file).unwrap_or_else(|err| {
        eprintln!("failed to load key file {:?}: {err}", config.key_file);
        std::process::exit(1);
    });

    let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let registry = Arc::new(NodeRegistry::new("CoAP", outbound_tx));

    let gateway = CoapGateway::bind(coap_port, Arc::clone(&registry))
        .await
        .unwrap_or_else(|err| panic!("failed to bind coap socket on port {coap_port}: {err}"));

    tracing::info!(port = coap_port, "coap gateway listening");

    let max_time = config.max_time;
    let ws_url = format!("ws://{}:{}/gw", config.broker_host, config.broker_port);

    tokio::spawn({
        let gateway = Arc::clone(&gateway);
        async move { gateway.serve().await }
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
