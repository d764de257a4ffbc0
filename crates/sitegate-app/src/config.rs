//! Application configuration file.
//!
//! Settings live in a JSON file, by default `config.json` in the platform
//! config directory. Every field is optional; missing fields take their
//! defaults.
//!
//! ```json
//! {
//!   "host": "127.0.0.1",
//!   "port": 8766,
//!   "retention_days": 30,
//!   "clients": { "192.168.1.20": "alice" },
//!   "rules": {
//!     "rules": [
//!       { "id": "social", "pattern": "social.example", "match_type": "domain", "action": "block" }
//!     ]
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use sitegate_core::RuleSet;
use sitegate_proxy::{ProxyConfig, StaticClientMap, DEFAULT_PROXY_PORT};
use thiserror::Error;

/// Config file name inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or written.
    #[error("Failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON for this schema.
    #[error("Failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A value is out of range.
    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Proxy listen host.
    pub host: IpAddr,
    /// Proxy listen port.
    pub port: u16,
    /// SQLite database path. Defaults to the platform data directory.
    pub database_path: Option<PathBuf>,
    /// Days of intercept history to keep.
    pub retention_days: u32,
    /// Seconds between retention cleanups.
    pub cleanup_interval_secs: u64,
    pub header_read_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub tunnel_idle_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub queue_capacity: usize,
    pub flush_interval_secs: u64,
    pub flush_batch_size: usize,
    /// Client IP address to user id.
    pub clients: BTreeMap<String, String>,
    /// Rules written to an empty database on first start.
    pub rules: Option<RuleSet>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PROXY_PORT,
            database_path: None,
            retention_days: 30,
            cleanup_interval_secs: 3600,
            header_read_timeout_secs: 30,
            connect_timeout_secs: 10,
            tunnel_idle_timeout_secs: 300,
            shutdown_grace_secs: 5,
            queue_capacity: 1024,
            flush_interval_secs: 5,
            flush_batch_size: 64,
            clients: BTreeMap::new(),
            rules: None,
        }
    }
}

impl AppConfig {
    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "sitegate", "sitegate")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Reads and validates a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Loads `explicit` if given (it must exist), otherwise the default file
    /// if present, otherwise the defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Writes the config as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        std::fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks value ranges and the client map.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1"));
        }
        if self.flush_batch_size == 0 {
            return Err(invalid("flush_batch_size", "must be at least 1"));
        }
        if self.flush_interval_secs == 0 {
            return Err(invalid("flush_interval_secs", "must be at least 1"));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(invalid("cleanup_interval_secs", "must be at least 1"));
        }
        self.client_map()?;
        Ok(())
    }

    /// Proxy listen address.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Parses the client map.
    pub fn client_map(&self) -> Result<StaticClientMap> {
        let mut map = StaticClientMap::new();
        for (ip, user) in &self.clients {
            let parsed: IpAddr = ip
                .parse()
                .map_err(|_| invalid("clients", format!("{:?} is not an IP address", ip)))?;
            if user.trim().is_empty() {
                return Err(invalid("clients", format!("empty user id for {}", ip)));
            }
            map.insert(parsed, user.clone());
        }
        Ok(map)
    }

    /// Proxy settings from this config. Rule engine and recorder are left at
    /// their defaults for the caller to attach.
    pub fn proxy_config(&self) -> Result<ProxyConfig> {
        let mut config = ProxyConfig::new()
            .with_addr(self.listen_addr())
            .with_header_read_timeout(Duration::from_secs(self.header_read_timeout_secs))
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .with_tunnel_idle_timeout(Duration::from_secs(self.tunnel_idle_timeout_secs))
            .with_shutdown_grace(Duration::from_secs(self.shutdown_grace_secs))
            .with_queue_capacity(self.queue_capacity)
            .with_flush_interval(Duration::from_secs(self.flush_interval_secs))
            .with_flush_batch_size(self.flush_batch_size);

        let clients = self.client_map()?;
        if !clients.is_empty() {
            config = config.with_user_resolver(clients);
        }
        Ok(config)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    #[test]
    fn defaults() {
        let config = AppConfig::default();
        assert_eq!(config.listen_addr(), SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)));
        assert_eq!(config.retention_days, 30);
        assert!(config.rules.is_none());
        assert_ok!(config.validate());
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "port": 9000, "retention_days": 7 }"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.connect_timeout_secs, 10);
    }

    #[test]
    fn save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = AppConfig::default();
        config.port = 9100;
        config.clients.insert("10.0.0.5".to_string(), "alice".to_string());
        config.save(&path).unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn seed_rules_parse() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "rules": {
                    "rules": [
                        { "id": "social", "pattern": "social.example", "match_type": "domain", "action": "block" }
                    ],
                    "blocked_domains": [ { "domain": "ads.example", "enabled": true } ]
                }
            }"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        let rules = config.rules.unwrap();
        assert_eq!(rules.rules.len(), 1);
        assert_eq!(rules.rules[0].id, "social");
        assert!(rules.rules[0].enabled);
        assert_eq!(rules.blocked_domains.len(), 1);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            AppConfig::load_or_default(Some(&missing)),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(AppConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let config = AppConfig {
            queue_capacity: 0,
            ..AppConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "queue_capacity", .. })
        ));

        let mut config = AppConfig::default();
        config.clients.insert("not-an-ip".to_string(), "alice".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "clients", .. })
        ));
    }

    #[test]
    fn proxy_config_follows_settings() {
        let mut config = AppConfig {
            port: 9200,
            connect_timeout_secs: 3,
            ..AppConfig::default()
        };
        config.clients.insert("10.0.0.5".to_string(), "alice".to_string());

        let proxy = config.proxy_config().unwrap();
        assert_eq!(proxy.addr.port(), 9200);
        assert_eq!(proxy.connect_timeout, Duration::from_secs(3));
        assert_eq!(proxy.queue_capacity, 1024);
    }
}
