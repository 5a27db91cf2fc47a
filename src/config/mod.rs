//! Configuration management
//!
//! Layers, lowest precedence first: built-in defaults, an optional TOML file
//! (`config/coach-call.toml`, or the path in `COACH_CALL_CONFIG`), then
//! `COACH_CALL__SECTION__KEY` environment variables.

use crate::domain::call::CallerType;
use crate::domain::shared::UserId;
use crate::infrastructure::protocols::webrtc::{IceServerConfig, PeerConfig, DEFAULT_STUN_SERVERS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/coach-call.toml";
pub const CONFIG_PATH_ENV: &str = "COACH_CALL_CONFIG";
pub const ENV_PREFIX: &str = "COACH_CALL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub identity: IdentityConfig,
    pub call: CallConfig,
    pub ice: IceConfig,
    pub database: DatabaseConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: true,
        }
    }
}

/// The local user this client acts for
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Generated at startup when absent
    pub user_id: Option<UserId>,
    pub display_name: Option<String>,
    pub caller_type: CallerType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ringing_timeout_secs: u64,
    pub offer_timeout_secs: u64,
    pub disconnect_grace_secs: u64,
    pub profile_lookup_timeout_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ringing_timeout_secs: 45,
            offer_timeout_secs: 15,
            disconnect_grace_secs: 5,
            profile_lookup_timeout_ms: 3000,
        }
    }
}

impl CallConfig {
    pub fn ringing_timeout(&self) -> Duration {
        Duration::from_secs(self.ringing_timeout_secs)
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_secs(self.offer_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    pub fn profile_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.profile_lookup_timeout_ms)
    }

    /// How long a ringing record keeps the user pair reserved
    pub fn ringing_window(&self) -> Duration {
        self.ringing_timeout() + self.disconnect_grace()
    }
}

/// Peer transport implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// `webrtc` crate peer connections
    Webrtc,
    /// In-process transport, no network
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub transport: TransportKind,
    pub servers: Vec<IceServerConfig>,
    pub candidate_pool_size: u8,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Webrtc,
            servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|url| IceServerConfig::stun(*url))
                .collect(),
            candidate_pool_size: 10,
        }
    }
}

impl IceConfig {
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            ice_servers: self.servers.clone(),
            ice_candidate_pool_size: self.candidate_pool_size,
        }
    }
}

/// Persistence backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: StorageBackend,
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            url: "postgres://postgres@localhost/coach_call".to_string(),
            max_connections: 10,
            min_connections: 2,
            connect_timeout_secs: 5,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
            run_migrations: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `tracing` filter directive; `RUST_LOG` wins when set
    pub log_filter: String,
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: "coach_call=debug,info".to_string(),
            metrics_enabled: true,
        }
    }
}

impl Config {
    /// Load from defaults, the config file and the environment
    pub fn load() -> Result<Self, config::ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Effective configuration rendered as TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.call.ringing_timeout(), Duration::from_secs(45));
        assert_eq!(config.call.ringing_window(), Duration::from_secs(50));
        assert_eq!(config.ice.servers.len(), 7);
        assert_eq!(config.database.backend, StorageBackend::Memory);
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.call.offer_timeout_secs, 15);
    }

    #[test]
    fn test_toml_file_overrides() {
        let dir = std::env::temp_dir().join(format!("coach-call-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("coach-call.toml");
        std::fs::write(
            &path,
            "[call]\nringing_timeout_secs = 30\n\n[ice]\ntransport = \"simulated\"\n",
        )
        .unwrap();

        let config = Config::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.call.ringing_timeout_secs, 30);
        assert_eq!(config.call.disconnect_grace_secs, 5);
        assert_eq!(config.ice.transport, TransportKind::Simulated);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_renders_as_toml() {
        let rendered = Config::default().to_toml().unwrap();
        assert!(rendered.contains("[call]"));
        assert!(rendered.contains("ringing_timeout_secs = 45"));
    }
}
