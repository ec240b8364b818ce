use serde::{Deserialize, Serialize};
use std::path::Path;
use std::fs;
use std::time::Duration;
use anyhow::{Context, Result};

use crate::connection::{AbandonPolicy, ConnectionOptions, DEFAULT_ABANDONED_TIMEOUT};
use crate::ldap_protocol::{DecodeOptions, DEFAULT_MAX_ELEMENT_SIZE};

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_POOL_MAX_SIZE: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Simple bind performed on every new connection.
    pub bind: Option<BindConfig>,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// ldap://host[:port] or ldaps://host[:port] (default ports 389 / 636).
    pub uri: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Largest accepted BER element in bytes (default 8 MiB). 0 disables the limit.
    pub max_element_size: Option<usize>,
    /// TCP (and TLS handshake) connect timeout in milliseconds (default 10000).
    pub connect_timeout_ms: Option<u64>,
    /// Per-operation inactivity timeout in milliseconds. Absent or 0: no timeout.
    pub request_timeout_ms: Option<u64>,
    /// deliver_late_result (default) or cancel_locally.
    #[serde(default)]
    pub abandon_policy: AbandonPolicy,
    /// How long an abandoned operation waits for a late result (default 30000).
    pub abandoned_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of connections leased at once (default 10).
    pub max_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    pub binddn: String,
    pub credentials: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Do not verify the server certificate of ldaps:// servers (tests / internal networks only).
    pub skip_verify: Option<bool>,
    /// PEM bundle trusted in addition to the system roots.
    pub ca_file: Option<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Read config file: {}", path.display()))?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Parse YAML config")?;
        Ok(config)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            decode: DecodeOptions {
                max_element_size: self
                    .connection
                    .max_element_size
                    .unwrap_or(DEFAULT_MAX_ELEMENT_SIZE),
            },
            request_timeout: self
                .connection
                .request_timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            abandon_policy: self.connection.abandon_policy,
            abandoned_timeout: self
                .connection
                .abandoned_timeout_ms
                .map_or(DEFAULT_ABANDONED_TIMEOUT, Duration::from_millis),
            ..ConnectionOptions::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(
            self.connection
                .connect_timeout_ms
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
        )
    }

    pub fn pool_max_size(&self) -> usize {
        self.pool.max_size.unwrap_or(DEFAULT_POOL_MAX_SIZE)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                uri: "ldap://127.0.0.1:389".to_string(),
            },
            connection: ConnectionConfig {
                max_element_size: Some(DEFAULT_MAX_ELEMENT_SIZE),
                connect_timeout_ms: Some(DEFAULT_CONNECT_TIMEOUT_MS),
                request_timeout_ms: None,
                abandon_policy: AbandonPolicy::default(),
                abandoned_timeout_ms: None,
            },
            pool: PoolConfig {
                max_size: Some(DEFAULT_POOL_MAX_SIZE),
            },
            bind: None,
            tls: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.uri, "ldap://127.0.0.1:389");
        assert_eq!(config.pool_max_size(), 10);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        let options = config.connection_options();
        assert_eq!(options.decode.max_element_size, 8 * 1024 * 1024);
        assert_eq!(options.request_timeout, None);
        assert_eq!(options.abandon_policy, AbandonPolicy::DeliverLateResult);
        assert_eq!(options.abandoned_timeout, DEFAULT_ABANDONED_TIMEOUT);
    }

    #[test]
    fn test_config_from_str() {
        let yaml = r#"
server:
  uri: "ldaps://ldap.example.com"
connection:
  max_element_size: 1048576
  connect_timeout_ms: 2500
  request_timeout_ms: 30000
  abandon_policy: cancel_locally
  abandoned_timeout_ms: 1500
pool:
  max_size: 4
bind:
  binddn: "cn=admin,dc=example,dc=com"
  credentials: "password"
tls:
  skip_verify: true
  ca_file: "/etc/ssl/ca.pem"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.server.uri, "ldaps://ldap.example.com");
        assert_eq!(config.pool_max_size(), 4);
        assert_eq!(config.connect_timeout(), Duration::from_millis(2500));
        let bind = config.bind.as_ref().unwrap();
        assert_eq!(bind.binddn, "cn=admin,dc=example,dc=com");
        assert_eq!(bind.credentials, "password");
        let tls = config.tls.as_ref().unwrap();
        assert_eq!(tls.skip_verify, Some(true));
        assert_eq!(tls.ca_file, Some("/etc/ssl/ca.pem".to_string()));

        let options = config.connection_options();
        assert_eq!(options.decode.max_element_size, 1048576);
        assert_eq!(options.request_timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.abandon_policy, AbandonPolicy::CancelLocally);
        assert_eq!(options.abandoned_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_config_from_str_minimal() {
        let yaml = r#"
server:
  uri: "ldap://localhost:1389"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.server.uri, "ldap://localhost:1389");
        assert!(config.bind.is_none());
        assert!(config.tls.is_none());
        assert_eq!(config.pool_max_size(), DEFAULT_POOL_MAX_SIZE);
        assert_eq!(config.connection_options().decode.max_element_size, DEFAULT_MAX_ELEMENT_SIZE);
    }

    #[test]
    fn test_zero_request_timeout_disables_timeout() {
        let yaml = r#"
server:
  uri: "ldap://localhost"
connection:
  request_timeout_ms: 0
  max_element_size: 0
"#;
        let options = Config::from_str(yaml).unwrap().connection_options();
        assert_eq!(options.request_timeout, None);
        assert_eq!(options.decode.max_element_size, 0);
    }

    #[test]
    fn test_config_from_file() {
        let yaml = r#"
server:
  uri: "ldap://127.0.0.1:1389"
pool:
  max_size: 2
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.uri, "ldap://127.0.0.1:1389");
        assert_eq!(config.pool_max_size(), 2);
    }

    #[test]
    fn test_config_from_str_invalid() {
        assert!(Config::from_str("invalid: yaml: content: [").is_err());
        let yaml = r#"
server:
  uri: "ldap://localhost"
connection:
  abandon_policy: drop_everything
"#;
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn test_config_from_file_nonexistent() {
        let err = Config::from_file("/nonexistent/path/config.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/path/config.yaml"));
    }
}
