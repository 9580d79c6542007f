use std::sync::Arc;

use clap::Parser;
use iot_bridge::auth;
use iot_bridge::config::{self, CommonArgs, GatewayConfig};
use iot_bridge::gateway::broker_link::{self, BrokerEventSink};
use iot_bridge::gateway::mqtt::{self, MqttGateway};
use iot_bridge::gateway::registry::NodeRegistry;

/// The MQTT protocol gateway: bridges MQTT nodes reachable through a shared
/// MQTT broker to the IoT broker's websocket fabric.
#[derive(Parser)]
#[command(version, about = "MQTT gateway")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Hostname of the MQTT broker nodes publish to. Overrides the config
    /// file's `mqtt_host`.
    #[arg(long = "mqtt-host")]
    mqtt_host: Option<String>,

    /// Port of the MQTT broker nodes publish to. Overrides the config
    /// file's `mqtt_port`.
    #[arg(long = "mqtt-port")]
    mqtt_port: Option<u16>,

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
    let mqtt_host = cli
        .mqtt_host
        .clone()
        .or_else(|| file_config.mqtt_host.clone())
        .unwrap_or_else(|| "localhost".to_string());
    let mqtt_port = cli.mqtt_port.or(file_config.mqtt_port).unwrap_or(mqtt::DEFAULT_PORT);

    let filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let keys = auth::check_key_file(&config.key_file).unwrap_or_else(|err| {
        eprintln!("failed to load key file {:?}: {err}", config.key_file);
        std::process::exit(1);
    });

    let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let registry = Arc::new(NodeRegistry::new("MQTT", outbound_tx));

    let (gateway, eventloop) = MqttGateway::connect(&mqtt_host, mqtt_port, Arc::clone(&registry))
        .await
        .unwrap_or_else(|err| panic!("failed to connect to mqtt broker {mqtt_host}:{mqtt_port}: {err}"));

    tracing::info!(host = mqtt_host, port = mqtt_port, "mqtt gateway connected");

    let max_time = config.max_time;
    let ws_url = format!("ws://{}:{}/gw", config.broker_host, config.broker_port);

    tokio::spawn({
        let gateway = Arc::clone(&gateway);
        async move { gateway.run_event_loop(eventloop).await }
    });
    tokio::spawn({
        let gateway = Arc::clone(&gateway);
        async move { gateway.run_reannounce().await }
    });
    tokio::spawn({
        let gateway = Arc::clone(&gateway);
        async move { gateway.run_liveness_sweep(max_time).await }
    });

    let sink: Arc<dyn BrokerEventSink> = Arc::new(Arc::clone(&gateway));
    tokio::spawn(async move { broker_link::run(&ws_url, keys, registry, outbound_rx, sink).await });

    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, unsubscribing from node topics");
    gateway.disconnect().await;
}
