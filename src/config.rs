// Configuration module
use anyhow::{anyhow, Result};
use pgproxy_core::auth::CredentialMaps;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub maps: MapSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    pub ws_port: u16,
    /// WebSocket endpoint path (default: "/pgproxy")
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// Proxy behavior settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Bound on one backend connect attempt, in seconds
    #[serde(default = "default_pg_connect_timeout")]
    pub pg_connect_timeout_secs: u64,
    /// Delay between a stop request and forced client destruction, in seconds
    #[serde(default = "default_delay_before_stop")]
    pub delay_before_stop_secs: u64,
    /// How long a disconnected client lingers before garbage collection
    #[serde(default = "default_gc_after")]
    pub garbage_collect_disconnected_clients_after_secs: u64,
    /// Seconds of inactivity before a state dump; 0 disables
    #[serde(default = "default_idle_dump_frequency")]
    pub idle_dump_state_frequency_secs: u64,
    #[serde(default)]
    pub debug: bool,
}

/// Credential remap tables. An absent table passes values through; a
/// configured table maps unknown keys to "invalid" (port: 0).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapSettings {
    pub host: Option<HashMap<String, String>>,
    /// TOML keys are strings; validated as u16 on load
    pub port: Option<HashMap<String, u16>>,
    pub database: Option<HashMap<String, String>>,
    pub user: Option<HashMap<String, String>>,
    pub password: Option<HashMap<String, String>>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_file")]
    pub file_path: String,
    #[serde(default = "default_true")]
    pub log_to_console: bool,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            pg_connect_timeout_secs: default_pg_connect_timeout(),
            delay_before_stop_secs: default_delay_before_stop(),
            garbage_collect_disconnected_clients_after_secs: default_gc_after(),
            idle_dump_state_frequency_secs: default_idle_dump_frequency(),
            debug: false,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_path: default_log_file(),
            log_to_console: true,
        }
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_path() -> String {
    "/pgproxy".to_string()
}

fn default_workers() -> usize {
    0
}

fn default_pg_connect_timeout() -> u64 {
    10
}

fn default_delay_before_stop() -> u64 {
    5
}

fn default_gc_after() -> u64 {
    60
}

fn default_idle_dump_frequency() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "./logs/pgproxy.log".to_string()
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow!("Failed to read config file: {}", e))?;

        let mut config: ServerConfig =
            toml::from_str(&content).map_err(|e| anyhow!("Failed to parse config file: {}", e))?;

        // Override with environment variables if present
        config.apply_env_overrides()?;

        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - PGPROXY_HOST: Override server.host
    /// - PGPROXY_WS_PORT: Override server.ws_port
    /// - PGPROXY_LOG_FILE_PATH: Override logging.file_path
    fn apply_env_overrides(&mut self) -> Result<()> {
        use std::env;

        if let Ok(host) = env::var("PGPROXY_HOST") {
            self.server.host = host;
        }

        if let Ok(port_str) = env::var("PGPROXY_WS_PORT") {
            self.server.ws_port = port_str
                .parse()
                .map_err(|_| anyhow!("Invalid PGPROXY_WS_PORT value: {}", port_str))?;
        }

        if let Ok(path) = env::var("PGPROXY_LOG_FILE_PATH") {
            self.logging.file_path = path;
        }

        Ok(())
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<()> {
        if self.server.ws_port == 0 {
            return Err(anyhow!("server.ws_port cannot be 0"));
        }

        if !self.server.path.starts_with('/') {
            return Err(anyhow!(
                "server.path must start with '/': {}",
                self.server.path
            ));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        if let Some(ports) = &self.maps.port {
            for key in ports.keys() {
                key.parse::<u16>()
                    .map_err(|_| anyhow!("maps.port key is not a port number: {}", key))?;
            }
        }

        Ok(())
    }

    /// Build the credential remap tables for the proxy core.
    pub fn credential_maps(&self) -> CredentialMaps {
        CredentialMaps {
            host: self.maps.host.clone(),
            port: self.maps.port.as_ref().map(|table| {
                table
                    .iter()
                    .filter_map(|(k, v)| k.parse::<u16>().ok().map(|k| (k, *v)))
                    .collect()
            }),
            database: self.maps.database.clone(),
            user: self.maps.user.clone(),
            password: self.maps.password.clone(),
        }
    }

    /// Get default configuration (useful for testing)
    pub fn default() -> Self {
        ServerConfig {
            server: ServerSettings {
                host: default_host(),
                ws_port: 8080,
                path: default_path(),
                workers: 0,
            },
            proxy: ProxySettings::default(),
            maps: MapSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.path, "/pgproxy");
        assert_eq!(config.server.ws_port, 8080);
    }

    #[test]
    fn test_invalid_port() {
        let mut config = ServerConfig::default();
        config.server.ws_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = ServerConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_path() {
        let mut config = ServerConfig::default();
        config.server.path = "pgproxy".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_map_keys_validated() {
        let mut config = ServerConfig::default();
        config.maps.port = Some(HashMap::from([("not-a-port".to_string(), 5432u16)]));
        assert!(config.validate().is_err());

        config.maps.port = Some(HashMap::from([("1".to_string(), 5432u16)]));
        assert!(config.validate().is_ok());
        let maps = config.credential_maps();
        assert_eq!(maps.port.unwrap().get(&1), Some(&5432));
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [server]
            ws_port = 9000
            path = "/db"

            [proxy]
            delay_before_stop_secs = 2
            debug = true

            [maps.user]
            alias = "real"
        "#;
        let config: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.ws_port, 9000);
        assert_eq!(config.server.path, "/db");
        assert_eq!(config.proxy.delay_before_stop_secs, 2);
        assert!(config.proxy.debug);
        assert_eq!(
            config.maps.user.unwrap().get("alias"),
            Some(&"real".to_string())
        );
    }
}
