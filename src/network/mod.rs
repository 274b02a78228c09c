//! Network module - Connections, client multiplexer and server dispatcher
//!
//! Provides:
//! - Transports (TCP, Unix domain sockets, TLS) behind `Connector`/`Listener`
//! - `Client`: request/response, one-way messages and subscriptions with reconnection
//! - `Server`: connection registry, topic handlers and push fan-out

mod client;
mod connection;
mod server;
mod transport;

pub use client::*;
pub use connection::*;
pub use server::*;
pub use transport::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::{DEFAULT_PORT, MAX_FRAME_SIZE};

/// Address of a BeamNet endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix { path: path.into() }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::tcp("127.0.0.1", DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    /// Accepts `host:port`, `[v6]:port`, `unix:PATH` or a filesystem path
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err("empty socket path".to_string());
            }
            return Ok(Endpoint::unix(path));
        }
        if s.starts_with('/') || s.starts_with('.') {
            return Ok(Endpoint::unix(s));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got {:?}", s))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in {:?}: {}", s, e))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("missing host in {:?}", s));
        }
        Ok(Endpoint::tcp(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

/// How the client reacts to losing its connection
#[derive(Clone)]
pub enum ReconnectPolicy {
    /// Stay closed
    Off,
    /// Retry after a fixed delay
    Fixed(Duration),
    /// Retry after `f(attempt)`, attempt counting from 0
    Backoff(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(Duration::from_millis(DEFAULT_RECONNECT_MS))
    }
}

impl ReconnectPolicy {
    pub fn backoff<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        ReconnectPolicy::Backoff(Arc::new(f))
    }

    /// Exponential backoff: `initial * factor^attempt`, capped at `max`
    pub fn exponential(initial: Duration, max: Duration, factor: f64) -> Self {
        let initial_ms = initial.as_millis() as f64;
        let max_ms = max.as_millis() as f64;
        Self::backoff(move |attempt| {
            let scale = factor.max(1.0).powi(attempt.min(64) as i32);
            Duration::from_millis((initial_ms * scale).min(max_ms).round() as u64)
        })
    }

    /// Delay before retry number `attempt`, or `None` when reconnection is off
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            ReconnectPolicy::Off => None,
            ReconnectPolicy::Fixed(delay) => Some(*delay),
            ReconnectPolicy::Backoff(f) => Some(f(attempt)),
        }
    }
}

impl fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectPolicy::Off => f.write_str("Off"),
            ReconnectPolicy::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            ReconnectPolicy::Backoff(_) => f.write_str("Backoff(..)"),
        }
    }
}

/// Default reconnect delay in milliseconds
pub const DEFAULT_RECONNECT_MS: u64 = 1000;

/// TLS settings for outbound connections
#[derive(Debug, Clone, Default)]
pub struct ClientTlsOptions {
    /// Name to verify the server certificate against (defaults to the host)
    pub domain: Option<String>,
    /// Additional trusted root certificate (PEM)
    pub ca_certificate: Option<PathBuf>,
    /// Skip certificate verification
    pub accept_invalid_certs: bool,
}

/// TLS settings for a listening endpoint
#[derive(Debug, Clone)]
pub struct ServerTlsOptions {
    /// Certificate chain (PEM)
    pub certificate: PathBuf,
    /// Private key (PEM, PKCS#8)
    pub key: PathBuf,
}

/// Configuration for a client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub endpoint: Endpoint,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub tls: Option<ClientTlsOptions>,
    pub max_frame_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            connect_timeout: Duration::from_millis(5000),
            reconnect: ReconnectPolicy::default(),
            tls: None,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ClientOptions {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_tls(mut self, tls: ClientTlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Configuration for a server
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub endpoint: Endpoint,
    pub tls: Option<ServerTlsOptions>,
    pub handshake_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            tls: None,
            handshake_timeout: Duration::from_millis(5000),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ServerOptions {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }

    pub fn with_tls(mut self, certificate: PathBuf, key: PathBuf) -> Self {
        self.tls = Some(ServerTlsOptions { certificate, key });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!("localhost:7420".parse::<Endpoint>().unwrap(), Endpoint::tcp("localhost", 7420));
        assert_eq!("[::1]:80".parse::<Endpoint>().unwrap(), Endpoint::tcp("::1", 80));
        assert_eq!(
            "unix:/tmp/beam.sock".parse::<Endpoint>().unwrap(),
            Endpoint::unix("/tmp/beam.sock")
        );
        assert_eq!("/tmp/beam.sock".parse::<Endpoint>().unwrap(), Endpoint::unix("/tmp/beam.sock"));
        assert!("localhost".parse::<Endpoint>().is_err());
        assert!("localhost:http".parse::<Endpoint>().is_err());
        assert!(":80".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_endpoint_display_roundtrip() {
        for endpoint in [
            Endpoint::tcp("127.0.0.1", 1),
            Endpoint::tcp("::1", 2),
            Endpoint::unix("/run/beam.sock"),
        ] {
            assert_eq!(endpoint.to_string().parse::<Endpoint>().unwrap(), endpoint);
        }
    }

    #[test]
    fn test_reconnect_delays() {
        assert_eq!(ReconnectPolicy::Off.delay(0), None);
        assert_eq!(
            ReconnectPolicy::Fixed(Duration::from_millis(50)).delay(9),
            Some(Duration::from_millis(50))
        );
        assert_eq!(ReconnectPolicy::default().delay(3), Some(Duration::from_secs(1)));

        let policy = ReconnectPolicy::backoff(|n| Duration::from_millis(10 * u64::from(n)));
        assert_eq!(policy.delay(4), Some(Duration::from_millis(40)));

        let exp = ReconnectPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1), 2.0);
        assert_eq!(exp.delay(0), Some(Duration::from_millis(100)));
        assert_eq!(exp.delay(2), Some(Duration::from_millis(400)));
        assert_eq!(exp.delay(10), Some(Duration::from_secs(1)));
    }
}
