//! Layered configuration: built-in defaults, overridden by an optional TOML
//! config file, overridden by CLI flags.

use std::path::PathBuf;

use clap::Args;
use serde::Deserialize;

use crate::auth::default_key_path;

/// Flags shared by every binary (broker and every gateway).
#[derive(Args, Clone, Debug)]
pub struct CommonArgs {
    /// Port this process listens on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Hostname of the broker to connect to (gateways only).
    #[arg(long = "broker-host")]
    pub broker_host: Option<String>,

    /// Port of the broker to connect to (gateways only).
    #[arg(long = "broker-port")]
    pub broker_port: Option<u16>,

    /// Path to the key file holding the shared secret and private key.
    #[arg(long = "key-file")]
    pub key_file: Option<PathBuf>,

    /// Enable debug-level logging.
    #[arg(long)]
    pub debug: bool,

    /// Path to a TOML config file; overrides built-in defaults, is itself
    /// overridden by any other flag given on the command line.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// The subset of fields a TOML config file may set. Every field is
/// optional: whatever isn't present falls back to the built-in default,
/// and whatever the CLI does specify wins regardless.
#[derive(Deserialize, Default, Clone, Debug)]
#[serde(default)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub broker_host: Option<String>,
    pub broker_port: Option<u16>,
    pub key_file: Option<PathBuf>,
    pub debug: Option<bool>,
    pub coap_port: Option<u16>,
    pub mqtt_host: Option<String>,
    pub mqtt_port: Option<u16>,
    pub gateway_port: Option<u16>,
    pub max_time: Option<u64>,
    pub use_coaps: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
}

impl FileConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }
}

/// Fully resolved broker configuration: defaults, then file, then CLI.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub port: u16,
    pub key_file: PathBuf,
    pub debug: bool,
}

impl BrokerConfig {
    pub fn resolve(common: &CommonArgs, file: &FileConfig) -> Self {
        Self {
            port: common.port.or(file.port).unwrap_or(8000),
            key_file: common
                .key_file
                .clone()
                .or_else(|| file.key_file.clone())
                .unwrap_or_else(default_key_path),
            debug: common.debug || file.debug.unwrap_or(false),
        }
    }
}

/// Fully resolved gateway configuration common to all three protocol
/// gateways.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub key_file: PathBuf,
    pub debug: bool,
    pub max_time: std::time::Duration,
}

impl GatewayConfig {
    pub fn resolve(common: &CommonArgs, file: &FileConfig) -> Self {
        Self {
            broker_host: common
                .broker_host
                .clone()
                .or_else(|| file.broker_host.clone())
                .unwrap_or_else(|| "localhost".to_string()),
            broker_port: common.broker_port.or(file.broker_port).unwrap_or(8000),
            key_file: common
                .key_file
                .clone()
                .or_else(|| file.key_file.clone())
                .unwrap_or_else(default_key_path),
            debug: common.debug || file.debug.unwrap_or(false),
            max_time: std::time::Duration::from_secs(file.max_time.unwrap_or(120)),
        }
    }
}

/// Loads the file layer if `--config` was given, otherwise returns defaults.
pub fn load_file_layer(common: &CommonArgs) -> Result<FileConfig, ConfigError> {
    match &common.config {
        Some(path) => FileConfig::load(path),
        None => Ok(FileConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_file_overrides_default() {
        let file = FileConfig {
            port: Some(9000),
            ..Default::default()
        };
        let common = CommonArgs {
            port: Some(9500),
            broker_host: None,
            broker_port: None,
            key_file: None,
            debug: false,
            config: None,
        };
        let resolved = BrokerConfig::resolve(&common, &file);
        assert_eq!(resolved.port, 9500);
    }

    #[test]
    fn file_overrides_default_when_cli_absent() {
        let file = FileConfig {
            port: Some(9000),
            ..Default::default()
        };
        let common = CommonArgs {
            port: None,
            broker_host: None,
            broker_port: None,
            key_file: None,
            debug: false,
            config: None,
        };
        let resolved = BrokerConfig::resolve(&common, &file);
        assert_eq!(resolved.port, 9000);
    }

    #[test]
    fn default_applies_when_nothing_set() {
        let resolved = BrokerConfig::resolve(&CommonArgs {
            port: None,
            broker_host: None,
            broker_port: None,
            key_file: None,
            debug: false,
            config: None,
        }, &FileConfig::default());
        assert_eq!(resolved.port, 8000);
    }
}
