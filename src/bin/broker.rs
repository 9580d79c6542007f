use std::sync::Arc;

use clap::Parser;
use iot_bridge::auth::{self, Keys};
use iot_bridge::broker::Hub;
use iot_bridge::config::{self, BrokerConfig, CommonArgs};
use iot_bridge::http;

/// The broker: the single process every gateway and every dashboard client
/// connects to.
#[derive(Parser)]
#[command(version, about = "IoT message broker")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let file_config = config::load_file_layer(&cli.common).unwrap_or_else(|err| {
        eprintln!("failed to load config file: {err}");
        std::process::exit(1);
    });
    let config = BrokerConfig::resolve(&cli.common, &file_config);

    init_tracing(config.debug);

    let keys = load_or_generate_keys(&config);

    let hub = Arc::new(Hub::new());
    let app = http::make_app_router(hub, keys);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|err| panic!("failed to bind {addr}: {err}"));

    tracing::info!(%addr, "broker listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|err| panic!("broker server failed: {err}"));
}

fn init_tracing(debug: bool) {
    let filter = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

/// Loads the broker's key file, generating and persisting a fresh one on
/// first run. Gateways are expected to be handed a copy of this same file
/// out of band.
fn load_or_generate_keys(config: &BrokerConfig) -> Keys {
    match auth::check_key_file(&config.key_file) {
        Ok(keys) => keys,
        Err(_) => {
            tracing::info!(path = ?config.key_file, "no key file found, generating one");
            let keys = auth::generate_keys();
            if let Err(err) = auth::write_keys_to_file(&config.key_file, &keys) {
                tracing::warn!(%err, "failed to persist generated key file");
            }
            keys
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
