use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::transport::{
    Connector, DisconnectPolicy, ProcessConnector, TcpConnector, TransportConfig,
};

/// Main configuration for wallet-sync
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub signer: SignerConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

/// Chain server connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// First reconnect delay
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,

    /// Reconnect delay ceiling
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// What happens to in-flight requests when the connection drops
    #[serde(default)]
    pub on_disconnect: DisconnectPolicy,

    /// Longest accepted message line
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_secs: default_connect_timeout_secs(),
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            on_disconnect: DisconnectPolicy::default(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            backoff_min: Duration::from_millis(self.backoff_min_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            max_line_bytes: self.max_line_bytes,
            on_disconnect: self.on_disconnect,
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(TcpConnector::new(self.host.clone(), self.port))
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    50001
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_backoff_min_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_max_line_bytes() -> usize {
    1024 * 1024
}

/// How to reach the signing authority
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignerConfig {
    /// Program to spawn; it speaks line-delimited JSON on stdin/stdout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// `host:port` of a signing authority listening on TCP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl SignerConfig {
    /// Connector for the configured authority. A spawned process wins over
    /// a TCP address.
    pub fn connector(&self) -> Result<Arc<dyn Connector>> {
        if let Some(command) = &self.command {
            return Ok(Arc::new(ProcessConnector::new(command.clone(), self.args.clone())));
        }
        if let Some(address) = &self.address {
            let (host, port) = address
                .rsplit_once(':')
                .with_context(|| format!("Signer address {} has no port", address))?;
            let port: u16 = port
                .parse()
                .with_context(|| format!("Invalid signer port in {}", address))?;
            return Ok(Arc::new(TcpConnector::new(host, port)));
        }
        anyhow::bail!("No signing authority configured; set [signer] command or address")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Directory holding the wallet and credential documents
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds the wallet stays unlocked
    #[serde(default = "default_relock_after_secs")]
    pub relock_after_secs: u64,

    /// Addresses added per watermark extension
    #[serde(default = "default_address_batch")]
    pub address_batch: u32,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            relock_after_secs: default_relock_after_secs(),
            address_batch: default_address_batch(),
        }
    }
}

impl WalletConfig {
    pub fn relock_after(&self) -> Duration {
        Duration::from_secs(self.relock_after_secs)
    }
}

fn default_relock_after_secs() -> u64 {
    60
}

fn default_address_batch() -> u32 {
    8
}

impl Config {
    /// Load config from a file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        Ok(())
    }
}

/// Get the default data directory path
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".wallet-sync")
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.server.host = "electrum.example.org".to_string();
        config.server.on_disconnect = DisconnectPolicy::Reject;
        config.signer.command = Some("wallet-signer".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.server.host, "electrum.example.org");
        assert_eq!(loaded.server.on_disconnect, DisconnectPolicy::Reject);
        assert_eq!(loaded.signer.command.as_deref(), Some("wallet-signer"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 50001);
        assert_eq!(config.server.on_disconnect, DisconnectPolicy::Abandon);
        assert_eq!(config.wallet.address_batch, 8);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            host = "10.0.0.2"
            on_disconnect = "reject"
            backoff_max_ms = 5000

            [wallet]
            relock_after_secs = 300
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 50001);
        assert_eq!(config.server.backoff_min_ms, 1000);

        let transport = config.server.transport_config();
        assert_eq!(transport.backoff_max, Duration::from_millis(5000));
        assert_eq!(transport.on_disconnect, DisconnectPolicy::Reject);
        assert_eq!(config.wallet.relock_after(), Duration::from_secs(300));
    }

    #[test]
    fn test_signer_connector_selection() {
        let signer = SignerConfig {
            command: None,
            args: vec![],
            address: Some("127.0.0.1:7000".to_string()),
        };
        assert_eq!(signer.connector().unwrap().describe(), "127.0.0.1:7000");

        let signer = SignerConfig {
            address: Some("no-port".to_string()),
            ..SignerConfig::default()
        };
        assert!(signer.connector().is_err());
        assert!(SignerConfig::default().connector().is_err());
    }
}
