use crate::contract::DEFAULT_ENVELOPE_KEY;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Top-level key of enveloped responses
    pub envelope_key: String,
    pub client: ClientConfig,
    pub session: SessionConfig,
}

/// Where and how to reach the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    /// Bearer token sent with every call
    pub token: Option<String>,
    /// Seconds before a call is abandoned
    pub request_timeout: u64,
    /// Seconds allowed to establish a connection
    pub connection_timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds a heartbeat may hang on the server (long poll)
    pub server_timeout: u64,
    /// Seconds to wait after a failed heartbeat
    pub reconnect_delay: u64,
    /// Milliseconds between successful heartbeats
    pub heartbeat_min_delay_ms: u64,
    /// Reported to the server; defaults to the host name
    pub node_name: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            envelope_key: DEFAULT_ENVELOPE_KEY.to_string(),
            client: ClientConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8888,
            ssl: false,
            token: None,
            request_timeout: 120,
            connection_timeout: 120,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_timeout: 120,
            reconnect_delay: 5,
            heartbeat_min_delay_ms: 100,
            node_name: default_node_name(),
        }
    }
}

fn default_node_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}

impl ClientConfig {
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }
}

impl SessionConfig {
    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }

    pub fn heartbeat_min_delay(&self) -> Duration {
        Duration::from_millis(self.heartbeat_min_delay_ms)
    }
}

impl RpcConfig {
    fn default_path() -> PathBuf {
        PathBuf::from("orchestra-rpc.toml")
    }

    /// Load configuration from file, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = path.unwrap_or_else(Self::default_path);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: RpcConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(RpcConfig::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<PathBuf>) -> Result<()> {
        let config_path = path.unwrap_or_else(Self::default_path);

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RpcConfig::load(Some(dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, RpcConfig::default());
        assert_eq!(config.envelope_key, "data");
        assert_eq!(config.session.reconnect_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rpc.toml");
        let mut config = RpcConfig::default();
        config.client.host = "orchestrator.example".to_string();
        config.client.ssl = true;
        config.client.token = Some("secret".to_string());
        config.save(Some(path.clone())).unwrap();

        let loaded = RpcConfig::load(Some(path)).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.client.base_url(), "https://orchestrator.example:8888");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpc.toml");
        std::fs::write(&path, "[client]\nport = 9000\n").unwrap();
        let loaded = RpcConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.client.port, 9000);
        assert_eq!(loaded.client.host, "localhost");
        assert_eq!(loaded.session.server_timeout, 120);
    }
}
