//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::protocol::AllowedOrigins;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and connection management
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_keepalive_pings")]
    pub keepalive_pings: bool,

    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_clients() -> usize {
    1000
}

fn default_ping_interval() -> u64 {
    30
}

fn default_keepalive_pings() -> bool {
    true
}

fn default_tick_interval() -> u64 {
    200
}

fn default_read_buffer_size() -> usize {
    8192
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_clients: default_max_clients(),
            ping_interval_secs: default_ping_interval(),
            keepalive_pings: default_keepalive_pings(),
            tick_interval_ms: default_tick_interval(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

/// Handshake and message limits
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// `"*"`, a comma-separated string, or a list of origins
    #[serde(default)]
    pub allowed_origins: AllowedOrigins,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_max_message_size() -> usize {
    1024 * 1024 // 1 MB
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_origins: AllowedOrigins::Any,
            max_message_size: default_max_message_size(),
        }
    }
}

/// TLS termination
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,

    pub cert_file: Option<PathBuf>,

    pub key_file: Option<PathBuf>,

    /// Search well-known certificate locations when files are not given
    #[serde(default)]
    pub auto_detect: bool,

    /// Domain used when probing; defaults to the system hostname
    pub server_name: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let (config, source) = Self::discover();
        source.log();
        config
    }

    /// Like [`load_default`](Self::load_default), but report where the
    /// config came from instead of logging it
    ///
    /// Lets the binary set up logging from the loaded config first.
    pub fn discover() -> (Self, ConfigSource) {
        let config_paths: Vec<PathBuf> = [
            dirs::config_dir().map(|p| p.join("pubsock").join("config.toml")),
            Some(PathBuf::from("/etc/pubsock/config.toml")),
            Some(PathBuf::from("./pubsock.toml")),
        ]
        .into_iter()
        .flatten()
        .collect();

        let (file, source) = Self::first_loadable(&config_paths);
        let mut config = file.unwrap_or_default();
        config.apply_env_overrides();
        (config, source)
    }

    fn first_loadable(paths: &[PathBuf]) -> (Option<Self>, ConfigSource) {
        let mut skipped = Vec::new();
        for path in paths {
            if !path.exists() {
                continue;
            }
            match Self::load(path) {
                Ok(config) => return (Some(config), ConfigSource::File(path.clone())),
                Err(e) => skipped.push(e),
            }
        }
        (None, ConfigSource::Defaults { skipped })
    }

    /// Check values that would make the server unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_clients == 0 {
            return Err(ConfigError::Invalid("server.max_clients must be at least 1".into()));
        }
        if self.server.ping_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "server.ping_interval_secs must be at least 1".into(),
            ));
        }
        if self.server.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "server.tick_interval_ms must be at least 1".into(),
            ));
        }
        if self.server.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "server.read_buffer_size must be at least 1".into(),
            ));
        }
        if self.tls.enabled
            && !self.tls.auto_detect
            && (self.tls.cert_file.is_none() || self.tls.key_file.is_none())
        {
            return Err(ConfigError::Invalid(
                "tls.enabled requires cert_file and key_file, or auto_detect".into(),
            ));
        }
        Ok(())
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Server overrides
        if let Some(host) = var("PUBSOCK_HOST") {
            self.server.host = host;
        }
        if let Some(p) = var("PUBSOCK_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = p;
        }
        if let Some(n) = var("PUBSOCK_MAX_CLIENTS").and_then(|v| v.parse().ok()) {
            self.server.max_clients = n;
        }
        if let Some(secs) = var("PUBSOCK_PING_INTERVAL").and_then(|v| v.parse().ok()) {
            self.server.ping_interval_secs = secs;
        }

        // Security overrides
        if let Some(origins) = var("PUBSOCK_ALLOWED_ORIGINS") {
            self.security.allowed_origins = AllowedOrigins::parse(&origins);
        }

        // TLS overrides; giving both files turns TLS on
        if let Some(cert) = var("PUBSOCK_TLS_CERT") {
            self.tls.cert_file = Some(PathBuf::from(cert));
        }
        if let Some(key) = var("PUBSOCK_TLS_KEY") {
            self.tls.key_file = Some(PathBuf::from(key));
        }
        if self.tls.cert_file.is_some() && self.tls.key_file.is_some() {
            self.tls.enabled = true;
        }

        // Logging overrides
        if let Some(level) = var("PUBSOCK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("PUBSOCK_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Where [`Config::discover`] found its settings
#[derive(Debug)]
pub enum ConfigSource {
    File(PathBuf),
    /// No loadable file; defaults plus environment. Files that existed but
    /// failed to load are kept here.
    Defaults { skipped: Vec<ConfigError> },
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            ConfigSource::File(path) => tracing::info!("Loaded config from {:?}", path),
            ConfigSource::Defaults { skipped } => {
                for error in skipped {
                    tracing::warn!("Skipping config file: {}", error);
                }
                tracing::info!("Using default config with environment overrides");
            }
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# pubsock Configuration
#
# Environment variables override these settings:
# - PUBSOCK_HOST
# - PUBSOCK_PORT
# - PUBSOCK_MAX_CLIENTS
# - PUBSOCK_PING_INTERVAL
# - PUBSOCK_ALLOWED_ORIGINS
# - PUBSOCK_TLS_CERT / PUBSOCK_TLS_KEY
# - PUBSOCK_LOG_LEVEL
# - PUBSOCK_LOG_FORMAT

[server]
# Listen address
host = "0.0.0.0"
port = 8080

# Connections beyond this are closed right after accept
max_clients = 1000

# Idle seconds before a keepalive ping; twice this disconnects
ping_interval_secs = 30

# Send pings to idle connections before disconnecting them
keepalive_pings = true

# How often the keepalive sweep runs (ms)
tick_interval_ms = 200

# Socket read size (bytes)
read_buffer_size = 8192

[security]
# "*" allows any origin; otherwise a list or comma-separated string
allowed_origins = "*"

# Largest message accepted from a client, after reassembly (bytes)
max_message_size = 1048576

[tls]
enabled = false
# cert_file = "/etc/ssl/certs/server.crt"
# key_file = "/etc/ssl/private/server.key"

# Look for certificates in common locations (Let's Encrypt, cPanel, Apache)
auto_detect = false
# server_name = "example.com"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_first_loadable_reports_source() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let broken = dir.path().join("broken.toml");
        let good = dir.path().join("good.toml");
        std::fs::write(&broken, "[server\nport = ").unwrap();
        std::fs::write(&good, "[server]\nport = 9100\n").unwrap();

        let (config, source) =
            Config::first_loadable(&[missing.clone(), broken.clone(), good.clone()]);
        assert_eq!(config.unwrap().server.port, 9100);
        assert!(matches!(source, ConfigSource::File(ref path) if *path == good));

        let (config, source) = Config::first_loadable(&[missing, broken.clone()]);
        assert!(config.is_none());
        match source {
            ConfigSource::Defaults { skipped } => {
                assert_eq!(skipped.len(), 1);
                assert!(matches!(&skipped[0], ConfigError::Parse { path, .. } if *path == broken));
            }
            other => panic!("Expected defaults, got {:?}", other),
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.max_clients, 1000);
        assert_eq!(config.server.ping_interval_secs, 30);
        assert_eq!(config.server.tick_interval_ms, 200);
        assert_eq!(config.security.max_message_size, 1024 * 1024);
        assert_eq!(config.security.allowed_origins, AllowedOrigins::Any);
        assert!(!config.tls.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_template_parses() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.server.keepalive_pings);
        assert_eq!(config.logging.format, "pretty");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9001
max_clients = 5

[security]
allowed_origins = ["https://a.example", "https://b.example"]
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.server.max_clients, 5);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.security.allowed_origins.allows("https://b.example"));
        assert!(!config.security.allowed_origins.allows("https://c.example"));
    }

    #[test]
    fn test_load_errors() {
        let err = Config::load(Path::new("/nonexistent/pubsock.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = \"not a number\"").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PUBSOCK_PORT", "7000"),
            ("PUBSOCK_MAX_CLIENTS", "12"),
            ("PUBSOCK_PING_INTERVAL", "bogus"),
            ("PUBSOCK_ALLOWED_ORIGINS", "https://x.example, https://y.example"),
            ("PUBSOCK_TLS_CERT", "/tmp/cert.pem"),
            ("PUBSOCK_TLS_KEY", "/tmp/key.pem"),
            ("PUBSOCK_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.max_clients, 12);
        // unparsable values are ignored
        assert_eq!(config.server.ping_interval_secs, 30);
        assert!(config.security.allowed_origins.allows("https://y.example"));
        assert!(config.tls.enabled);
        assert_eq!(config.tls.key_file, Some(PathBuf::from("/tmp/key.pem")));
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.server.max_clients = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.server.ping_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tls.enabled = true;
        assert!(config.validate().is_err());
        config.tls.auto_detect = true;
        assert!(config.validate().is_ok());
    }
}
