//! Configuration module
//!
//! Handles loading and saving BeamNet configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::{
    ClientOptions, ClientTlsOptions, Endpoint, ReconnectPolicy, ServerOptions, ServerTlsOptions,
    DEFAULT_RECONNECT_MS,
};
use crate::protocol::MAX_FRAME_SIZE;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Listening side
    #[serde(default)]
    pub server: ServerConfig,

    /// Connecting side
    #[serde(default)]
    pub client: ClientConfig,

    /// Wire protocol limits
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Log filter directive (e.g. "beamnet=debug"), overrides `verbose`
    pub log_filter: Option<String>,
}

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Endpoint to listen on
    #[serde(default)]
    pub endpoint: Endpoint,
    /// Serve over TLS
    pub tls: Option<ServerTlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTlsConfig {
    /// Certificate chain (PEM)
    pub certificate: PathBuf,
    /// Private key (PEM, PKCS#8)
    pub key: PathBuf,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Endpoint to connect to
    #[serde(default)]
    pub endpoint: Endpoint,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Reconnection behavior
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Connect over TLS
    pub tls: Option<ClientTlsConfig>,
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            connect_timeout_ms: default_connect_timeout(),
            reconnect: ReconnectConfig::default(),
            tls: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientTlsConfig {
    /// Name to verify the certificate against (defaults to the endpoint host)
    pub domain: Option<String>,
    /// Skip certificate verification
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Extra trusted root certificate (PEM)
    pub ca_certificate: Option<PathBuf>,
}

/// `[client.reconnect]`, selected by `mode`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReconnectConfig {
    Off,
    Fixed {
        #[serde(default = "default_reconnect_delay")]
        delay_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        #[serde(default = "default_backoff_factor")]
        factor: f64,
    },
}

fn default_reconnect_delay() -> u64 {
    DEFAULT_RECONNECT_MS
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig::Fixed {
            delay_ms: default_reconnect_delay(),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        match self {
            ReconnectConfig::Off => ReconnectPolicy::Off,
            ReconnectConfig::Fixed { delay_ms } => ReconnectPolicy::Fixed(Duration::from_millis(*delay_ms)),
            ReconnectConfig::Exponential {
                initial_ms,
                max_ms,
                factor,
            } => ReconnectPolicy::exponential(
                Duration::from_millis(*initial_ms),
                Duration::from_millis(*max_ms),
                *factor,
            ),
        }
    }
}

/// Protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Largest frame body accepted or sent
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("beamnet/config.toml")),
            Some(PathBuf::from("./beamnet.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Options for `Client::new`, optionally overriding the endpoint
    pub fn client_options(&self, endpoint: Option<&str>) -> ConfigResult<ClientOptions> {
        let endpoint = match endpoint {
            Some(s) => parse_endpoint(s)?,
            None => self.client.endpoint.clone(),
        };

        Ok(ClientOptions {
            endpoint,
            connect_timeout: Duration::from_millis(self.client.connect_timeout_ms),
            reconnect: self.client.reconnect.policy(),
            tls: self.client.tls.as_ref().map(|tls| ClientTlsOptions {
                domain: tls.domain.clone(),
                ca_certificate: tls.ca_certificate.clone(),
                accept_invalid_certs: tls.accept_invalid_certs,
            }),
            max_frame_size: self.protocol.max_frame_size,
        })
    }

    /// Options for `Server::listen`, optionally overriding the endpoint
    pub fn server_options(&self, endpoint: Option<&str>) -> ConfigResult<ServerOptions> {
        let endpoint = match endpoint {
            Some(s) => parse_endpoint(s)?,
            None => self.server.endpoint.clone(),
        };

        Ok(ServerOptions {
            endpoint,
            tls: self.server.tls.as_ref().map(|tls| ServerTlsOptions {
                certificate: tls.certificate.clone(),
                key: tls.key.clone(),
            }),
            max_frame_size: self.protocol.max_frame_size,
            ..ServerOptions::default()
        })
    }
}

fn parse_endpoint(s: &str) -> ConfigResult<Endpoint> {
    s.parse().map_err(ConfigError::InvalidEndpoint)
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        server: ServerConfig {
            endpoint: Endpoint::tcp("0.0.0.0", crate::protocol::DEFAULT_PORT),
            tls: None,
        },
        client: ClientConfig {
            reconnect: ReconnectConfig::Exponential {
                initial_ms: 250,
                max_ms: 10_000,
                factor: 2.0,
            },
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
