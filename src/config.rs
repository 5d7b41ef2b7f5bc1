//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `DEPLOYMENT_MODE`, `CLUSTER_SECRET`,
//!    `MASTER_URL`, `SLAVE_ID`, `SLAVE_NAME`, `PORT`, `CTUN_LISTEN`,
//!    `CTUN_API_KEY`
//! 2. **Config file** — path via `--config <path>`, or `ctun.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! local_port = 3000          # port of the local service being fronted
//!
//! [auth]
//! api_key = "your-admin-key" # guards /api/cluster/slaves*
//!
//! [cluster]
//! mode = "standalone"        # "master" | "slave" | "standalone"
//! secret = "shared-secret"   # master<->slave auth
//! auth_timeout_secs = 10
//! request_timeout_secs = 30
//!
//! [slave]
//! master_url = "wss://master.example.com"
//! slave_id = "rack-1"
//! slave_name = "Rack 1"
//! reconnect_delay_secs = 5
//! reconnect_max_delay_secs = 60
//! ping_interval_secs = 30
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    Standalone,
    Master,
    Slave,
}

impl DeploymentMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standalone => "standalone",
            Self::Master => "master",
            Self::Slave => "slave",
        }
    }
}

impl std::str::FromStr for DeploymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standalone" => Ok(Self::Standalone),
            "master" => Ok(Self::Master),
            "slave" => Ok(Self::Slave),
            other => Err(format!("unknown deployment mode {other:?}")),
        }
    }
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub slave: SlaveConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP gateway settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Port of the local service this gateway fronts (default 3000).
    #[serde(default = "default_local_port")]
    pub local_port: u16,
}

/// Authentication for the gateway's own admin endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token for `/api/cluster/slaves*`. Override with
    /// `CTUN_API_KEY`. Defaults to `"change-me"` which triggers a startup
    /// warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Cluster role and tunnel policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Role of this node (default standalone). Override with
    /// `DEPLOYMENT_MODE`.
    #[serde(default = "default_mode")]
    pub mode: DeploymentMode,
    /// Shared secret for master<->slave authentication. Override with
    /// `CLUSTER_SECRET`. Required in master and slave modes.
    pub secret: Option<String>,
    /// Seconds a control connection may idle before the `auth` frame
    /// (default 10).
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
    /// Seconds a forwarded HTTP request may wait for its response
    /// (default 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Slave-mode settings. Ignored in other modes.
#[derive(Debug, Clone, Deserialize)]
pub struct SlaveConfig {
    /// Master base URL, e.g. `wss://master.example.com`. Override with
    /// `MASTER_URL`.
    pub master_url: Option<String>,
    /// Stable identity of this slave. Override with `SLAVE_ID`.
    pub slave_id: Option<String>,
    /// Display name (defaults to the slave id). Override with `SLAVE_NAME`.
    pub slave_name: Option<String>,
    /// Initial reconnect backoff in seconds (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Maximum reconnect backoff in seconds (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Seconds between application-level pings (default 30).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Fully resolved settings for the slave-side tunnel client.
#[derive(Debug, Clone)]
pub struct SlaveSettings {
    pub master_url: String,
    pub slave_id: String,
    pub slave_name: String,
    pub secret: String,
    pub local_port: u16,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub ping_interval: Duration,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_local_port() -> u16 {
    3000
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_mode() -> DeploymentMode {
    DeploymentMode::Standalone
}
fn default_auth_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_ping_interval() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            local_port: default_local_port(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            secret: None,
            auth_timeout_secs: default_auth_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            master_url: None,
            slave_id: None,
            slave_name: None,
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            cluster: ClusterConfig::default(),
            slave: SlaveConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file >
    /// defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `ctun.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("ctun.toml").exists() {
            let content = std::fs::read_to_string("ctun.toml").expect("Failed to read ctun.toml");
            toml::from_str(&content).expect("Failed to parse ctun.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(mode) = std::env::var("DEPLOYMENT_MODE") {
            config.cluster.mode = mode
                .parse()
                .unwrap_or_else(|e| panic!("Invalid DEPLOYMENT_MODE: {e}"));
        }
        if let Ok(secret) = std::env::var("CLUSTER_SECRET") {
            config.cluster.secret = Some(secret);
        }
        if let Ok(url) = std::env::var("MASTER_URL") {
            config.slave.master_url = Some(url);
        }
        if let Ok(id) = std::env::var("SLAVE_ID") {
            config.slave.slave_id = Some(id);
        }
        if let Ok(name) = std::env::var("SLAVE_NAME") {
            config.slave.slave_name = Some(name);
        }
        if let Ok(port) = std::env::var("PORT") {
            config.server.local_port = port
                .parse()
                .unwrap_or_else(|e| panic!("Invalid PORT: {e}"));
        }
        if let Ok(listen) = std::env::var("CTUN_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(key) = std::env::var("CTUN_API_KEY") {
            config.auth.api_key = key;
        }

        config
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.auth_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.request_timeout_secs)
    }

    /// Resolve the slave-mode settings, or explain what is missing. A slave
    /// without a complete tunnel configuration must not start.
    pub fn slave_settings(&self) -> Result<SlaveSettings, String> {
        let master_url = self
            .slave
            .master_url
            .clone()
            .ok_or("slave mode requires a master URL (MASTER_URL or [slave] master_url)")?;
        let slave_id = self
            .slave
            .slave_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or("slave mode requires a slave id (SLAVE_ID or [slave] slave_id)")?;
        let secret = self
            .cluster
            .secret
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or("slave mode requires a shared secret (CLUSTER_SECRET or [cluster] secret)")?;
        let slave_name = self
            .slave
            .slave_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| slave_id.clone());
        Ok(SlaveSettings {
            master_url,
            slave_id,
            slave_name,
            secret,
            local_port: self.server.local_port,
            reconnect_delay: Duration::from_secs(self.slave.reconnect_delay_secs),
            reconnect_max_delay: Duration::from_secs(self.slave.reconnect_max_delay_secs),
            ping_interval: Duration::from_secs(self.slave.ping_interval_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_standalone() {
        let config = Config::default();
        assert_eq!(config.cluster.mode, DeploymentMode::Standalone);
        assert_eq!(config.server.local_port, 3000);
        assert_eq!(config.cluster.auth_timeout_secs, 10);
        assert_eq!(config.cluster.request_timeout_secs, 30);
        assert_eq!(config.slave.reconnect_delay_secs, 5);
        assert_eq!(config.slave.reconnect_max_delay_secs, 60);
    }

    #[test]
    fn toml_round_trip() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"
            local_port = 4000

            [cluster]
            mode = "master"
            secret = "s3"

            [slave]
            master_url = "wss://m.example.com"
            slave_id = "rack-1"
            "#,
        )
        .unwrap();
        assert_eq!(config.cluster.mode, DeploymentMode::Master);
        assert_eq!(config.server.local_port, 4000);
        assert_eq!(config.cluster.secret.as_deref(), Some("s3"));
        assert_eq!(config.slave.slave_id.as_deref(), Some("rack-1"));
        // Unspecified fields keep their defaults.
        assert_eq!(config.slave.ping_interval_secs, 30);
    }

    #[test]
    fn slave_settings_require_the_full_triple() {
        let mut config = Config {
            cluster: ClusterConfig {
                mode: DeploymentMode::Slave,
                ..ClusterConfig::default()
            },
            ..Config::default()
        };
        assert!(config.slave_settings().is_err());

        config.slave.master_url = Some("ws://m".into());
        config.slave.slave_id = Some("s1".into());
        assert!(config.slave_settings().unwrap_err().contains("secret"));

        config.cluster.secret = Some("k".into());
        let settings = config.slave_settings().unwrap();
        assert_eq!(settings.slave_name, "s1");
        assert_eq!(settings.reconnect_delay, Duration::from_secs(5));
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("MASTER".parse::<DeploymentMode>().unwrap(), DeploymentMode::Master);
        assert!("primary".parse::<DeploymentMode>().is_err());
    }
}
