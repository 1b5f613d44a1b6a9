//! Client configuration.
//!
//! Built in code with the `with_*` methods, or loaded from a TOML file:
//!
//! ```toml
//! app_id = "my-app"
//! websocket_uri = "wss://sync.example.com/runtime/session"
//! device_name = "laptop"
//! heartbeat_interval_ms = 15000
//! query_cache_limit = 25
//! database_path = "/var/lib/my-app/tessel.db"
//!
//! [reconnect]
//! base_ms = 500
//! max_ms = 30000
//! jitter_ms = 1000
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tessel_sync_core::heartbeat::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_TIMEOUT};
use tessel_sync_core::streams::DEFAULT_STREAM_WINDOW;
use tessel_sync_core::{BackoffConfig, DEFAULT_QUERY_CACHE_LIMIT};

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Application id, also the key of all persisted state.
    pub app_id: String,
    /// Sync server endpoint.
    pub websocket_uri: String,
    /// Refresh token of the signed-in user.
    pub refresh_token: Option<String>,
    /// Human-readable device name sent with `init`.
    pub device_name: String,
    /// How often to ping.
    pub heartbeat_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Reconnect backoff.
    pub reconnect: BackoffConfig,
    /// Cached query results kept for inactive queries.
    pub query_cache_limit: usize,
    /// Reject unknown namespaces and attributes in transactions.
    pub strict_schema: bool,
    /// SQLite database file; `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    /// In-flight window per outbound byte stream.
    pub stream_window: u64,
}

impl ClientConfig {
    /// Create a configuration with defaults for everything but the endpoint.
    pub fn new(app_id: &str, websocket_uri: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            websocket_uri: websocket_uri.to_string(),
            refresh_token: None,
            device_name: default_device_name(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            reconnect: BackoffConfig::default(),
            query_cache_limit: DEFAULT_QUERY_CACHE_LIMIT,
            strict_schema: false,
            database_path: None,
            stream_window: DEFAULT_STREAM_WINDOW,
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::ParseError { source, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::new(),
            source: e,
        })?;
        file.into_config()
    }

    /// Set the refresh token.
    pub fn with_refresh_token(mut self, token: &str) -> Self {
        self.refresh_token = Some(token.to_string());
        self
    }

    /// Set the device name.
    pub fn with_device_name(mut self, name: &str) -> Self {
        self.device_name = name.to_string();
        self
    }

    /// Set heartbeat interval and timeout.
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the reconnect backoff.
    pub fn with_reconnect(mut self, reconnect: BackoffConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the query cache limit.
    pub fn with_query_cache_limit(mut self, limit: usize) -> Self {
        self.query_cache_limit = limit;
        self
    }

    /// Reject unknown namespaces and attributes in transactions.
    pub fn with_strict_schema(mut self, strict: bool) -> Self {
        self.strict_schema = strict;
        self
    }

    /// Persist to a SQLite database at `path`.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Set the outbound stream window.
    pub fn with_stream_window(mut self, window: u64) -> Self {
        self.stream_window = window;
        self
    }
}

/// On-disk shape of [`ClientConfig`]; durations are milliseconds.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    app_id: String,
    websocket_uri: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_device_name")]
    device_name: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    heartbeat_timeout_ms: u64,
    #[serde(default)]
    reconnect: ReconnectFile,
    #[serde(default = "default_query_cache_limit")]
    query_cache_limit: usize,
    #[serde(default)]
    strict_schema: bool,
    #[serde(default)]
    database_path: Option<PathBuf>,
    #[serde(default = "default_stream_window")]
    stream_window: u64,
}

#[derive(Debug, Deserialize)]
struct ReconnectFile {
    #[serde(default = "default_reconnect_base_ms")]
    base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    max_ms: u64,
    #[serde(default = "default_reconnect_jitter_ms")]
    jitter_ms: u64,
}

impl Default for ReconnectFile {
    fn default() -> Self {
        Self {
            base_ms: default_reconnect_base_ms(),
            max_ms: default_reconnect_max_ms(),
            jitter_ms: default_reconnect_jitter_ms(),
        }
    }
}

impl ConfigFile {
    fn into_config(self) -> Result<ClientConfig, ConfigError> {
        if self.app_id.trim().is_empty() {
            return Err(ConfigError::Invalid("app_id must not be empty".into()));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(ClientConfig {
            app_id: self.app_id,
            websocket_uri: self.websocket_uri,
            refresh_token: self.refresh_token,
            device_name: self.device_name,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            reconnect: BackoffConfig {
                base: Duration::from_millis(self.reconnect.base_ms),
                max: Duration::from_millis(self.reconnect.max_ms),
                jitter: Duration::from_millis(self.reconnect.jitter_ms),
            },
            query_cache_limit: self.query_cache_limit,
            strict_schema: self.strict_schema,
            database_path: self.database_path,
            stream_window: self.stream_window,
        })
    }
}

fn default_device_name() -> String {
    "tessel device".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64
}

fn default_heartbeat_timeout_ms() -> u64 {
    DEFAULT_HEARTBEAT_TIMEOUT.as_millis() as u64
}

fn default_reconnect_base_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_reconnect_jitter_ms() -> u64 {
    1_000
}

fn default_query_cache_limit() -> usize {
    DEFAULT_QUERY_CACHE_LIMIT
}

fn default_stream_window() -> u64 {
    DEFAULT_STREAM_WINDOW
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the config file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path that could not be parsed.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },

    /// Values parsed but are inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = ClientConfig::new("app", "ws://localhost:8888");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(45));
        assert_eq!(config.reconnect.base, Duration::from_millis(500));
        assert_eq!(config.reconnect.max, Duration::from_secs(30));
        assert_eq!(config.reconnect.jitter, Duration::from_secs(1));
        assert_eq!(config.query_cache_limit, 10);
        assert!(!config.strict_schema);
        assert!(config.database_path.is_none());
    }

    #[test]
    fn builder_overrides() {
        let config = ClientConfig::new("app", "ws://x")
            .with_refresh_token("tok")
            .with_device_name("phone")
            .with_strict_schema(true)
            .with_query_cache_limit(3)
            .with_database_path("/tmp/app.db");
        assert_eq!(config.refresh_token.as_deref(), Some("tok"));
        assert_eq!(config.device_name, "phone");
        assert!(config.strict_schema);
        assert_eq!(config.query_cache_limit, 3);
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/app.db")));
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
app_id = "todo"
websocket_uri = "wss://sync.example.com"
device_name = "laptop"
heartbeat_interval_ms = 1000
heartbeat_timeout_ms = 5000
query_cache_limit = 25
strict_schema = true

[reconnect]
base_ms = 100
jitter_ms = 0
"#;
        let config = ClientConfig::from_toml(toml).unwrap();
        assert_eq!(config.app_id, "todo");
        assert_eq!(config.device_name, "laptop");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect.base, Duration::from_millis(100));
        assert_eq!(config.reconnect.max, Duration::from_secs(30));
        assert_eq!(config.reconnect.jitter, Duration::ZERO);
        assert_eq!(config.query_cache_limit, 25);
        assert!(config.strict_schema);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let config =
            ClientConfig::from_toml("app_id = \"a\"\nwebsocket_uri = \"ws://x\"\n").unwrap();
        assert_eq!(config, ClientConfig::new("a", "ws://x"));
    }

    #[test]
    fn rejects_timeout_shorter_than_interval() {
        let toml = r#"
app_id = "a"
websocket_uri = "ws://x"
heartbeat_interval_ms = 5000
heartbeat_timeout_ms = 1000
"#;
        assert!(matches!(
            ClientConfig::from_toml(toml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn from_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "app_id = ").unwrap();
        match ClientConfig::from_file(file.path()) {
            Err(ConfigError::ParseError { path, .. }) => assert_eq!(path, file.path()),
            other => panic!("expected parse error, got {other:?}"),
        }

        let missing = Path::new("/definitely/not/here.toml");
        assert!(matches!(
            ClientConfig::from_file(missing),
            Err(ConfigError::ReadError { .. })
        ));
    }
}
