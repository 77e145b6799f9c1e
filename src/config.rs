//! Configuration management for huddle
//!
//! Defaults cover a loopback deployment; a TOML file can override any
//! field and the CLI flags override the file.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};

/// Top-level configuration with one table per binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Relay server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client configuration
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for both the TCP control plane and the UDP relay
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP control port
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// UDP media relay port
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address to dial
    #[serde(default = "default_server")]
    pub server: String,

    /// Server TCP control port
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// Server UDP media port
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    /// Camera index handed to the frame source
    #[serde(default)]
    pub camera: u32,

    /// Simulated packet loss rate in percent (0-100)
    #[serde(default)]
    pub drop_rate: f64,

    /// Display name announced to the meeting
    #[serde(default = "default_name")]
    pub name: String,

    /// Directory for received files
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server() -> String {
    "127.0.0.1".to_string()
}

fn default_tcp_port() -> u16 {
    crate::protocol::DEFAULT_TCP_PORT
}

fn default_udp_port() -> u16 {
    crate::protocol::DEFAULT_UDP_PORT
}

fn default_name() -> String {
    "Guest".to_string()
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("downloads")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
            camera: 0,
            drop_rate: 0.0,
            name: default_name(),
            downloads_dir: default_downloads_dir(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config = toml::from_str(&content).map_err(ConfigError::Parse)?;
        Ok(config)
    }

    /// Validate field ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.tcp_port == self.server.udp_port {
            return Err(ConfigError::Invalid(
                "tcp_port and udp_port must differ".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.client.drop_rate) {
            return Err(ConfigError::Invalid(format!(
                "drop_rate must be within 0-100, got {}",
                self.client.drop_rate
            )));
        }
        if self.client.name.trim().is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    /// File could not be read
    Io(std::io::Error),
    /// TOML parsing failed
    Parse(toml::de::Error),
    /// A field is out of range
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.server.tcp_port, 5000);
        assert_eq!(config.server.udp_port, 5001);
        assert_eq!(config.client.server, "127.0.0.1");
    }

    #[test]
    fn parse_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [server]
            tcp_port = 6000

            [client]
            name = "Ada"
            drop_rate = 20.0
            "#,
        )
        .expect("parse");
        assert_eq!(config.server.tcp_port, 6000);
        assert_eq!(config.server.udp_port, 5001);
        assert_eq!(config.client.name, "Ada");
        assert_eq!(config.client.drop_rate, 20.0);
        config.validate().expect("valid");
    }

    #[test]
    fn rejects_out_of_range_drop_rate() {
        let mut config = Config::default();
        config.client.drop_rate = 120.0;
        assert!(config.validate().is_err());
    }
}
