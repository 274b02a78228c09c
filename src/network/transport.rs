//! Transport seams
//!
//! The client only needs "something that produces a duplex byte stream" and the
//! server only needs "a source of stream connections". TCP, Unix domain sockets
//! and TLS-over-TCP are provided; anything implementing `AsyncRead + AsyncWrite`
//! can be plugged in through `Connector`/`Listener`.

use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_native_tls::native_tls;

use super::{ClientTlsOptions, Endpoint, ServerTlsOptions};

/// A duplex byte stream
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Connection setup still to run after `accept` (e.g. a TLS handshake).
/// The server awaits it in the connection's own task.
pub type Handshake = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send>>;

/// A stream that needs no further setup
pub fn established<S: Stream + 'static>(stream: S) -> Handshake {
    Box::pin(async move { Ok(Box::new(stream) as BoxedStream) })
}

/// Produces outbound streams; called again on every reconnection attempt
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> io::Result<BoxedStream>;

    /// Human-readable target, used in logs
    fn describe(&self) -> String;
}

/// Source of inbound streams
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next connection; returns its pending setup and a peer description
    async fn accept(&mut self) -> io::Result<(Handshake, String)>;

    fn local_addr(&self) -> String;
}

/// Plain TCP connector
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    async fn connect_tcp(&self) -> io::Result<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, format!("Connection to {} timed out", addr))
            })??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        Ok(Box::new(self.connect_tcp().await?))
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// TLS over TCP connector
pub struct TlsConnector {
    tcp: TcpConnector,
    domain: String,
    tls: tokio_native_tls::TlsConnector,
}

impl TlsConnector {
    pub fn new(tcp: TcpConnector, options: &ClientTlsOptions) -> io::Result<Self> {
        let mut builder = native_tls::TlsConnector::builder();
        builder.danger_accept_invalid_certs(options.accept_invalid_certs);
        if let Some(path) = &options.ca_certificate {
            let pem = std::fs::read(path)?;
            let certificate = native_tls::Certificate::from_pem(&pem).map_err(tls_error)?;
            builder.add_root_certificate(certificate);
        }
        let tls = builder.build().map_err(tls_error)?;

        Ok(Self {
            domain: options.domain.clone().unwrap_or_else(|| tcp.host.clone()),
            tcp,
            tls: tokio_native_tls::TlsConnector::from(tls),
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        let stream = self.tcp.connect_tcp().await?;
        let stream = self.tls.connect(&self.domain, stream).await.map_err(tls_error)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tls://{}", self.tcp.describe())
    }
}

/// Unix domain socket connector
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: PathBuf,
}

#[cfg(unix)]
impl UnixConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(unix)]
#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        Ok(Box::new(tokio::net::UnixStream::connect(&self.path).await?))
    }

    fn describe(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

/// Build the connector for an endpoint
pub fn connector_for(
    endpoint: &Endpoint,
    tls: Option<&ClientTlsOptions>,
    timeout: Duration,
) -> io::Result<Arc<dyn Connector>> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let tcp = TcpConnector::new(host.clone(), *port, timeout);
            match tls {
                Some(options) => Ok(Arc::new(TlsConnector::new(tcp, options)?)),
                None => Ok(Arc::new(tcp)),
            }
        }
        #[cfg(unix)]
        Endpoint::Unix { path } => {
            if tls.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "TLS is not supported on Unix domain sockets",
                ));
            }
            Ok(Arc::new(UnixConnector::new(path.clone())))
        }
        #[cfg(not(unix))]
        Endpoint::Unix { .. } => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Unix domain sockets are not supported on this platform",
        )),
    }
}

/// Plain TCP listener
pub struct TcpStreamListener {
    listener: TcpListener,
    local_addr: String,
}

impl TcpStreamListener {
    pub async fn bind(host: &str, port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?.to_string();
        Ok(Self { listener, local_addr })
    }
}

#[async_trait]
impl Listener for TcpStreamListener {
    async fn accept(&mut self) -> io::Result<(Handshake, String)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((established(stream), addr.to_string()))
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }
}

/// TLS over TCP listener. `accept` returns at once; the handshake, bounded by a
/// timeout, is left to the returned `Handshake`.
pub struct TlsStreamListener {
    tcp: TcpStreamListener,
    acceptor: tokio_native_tls::TlsAcceptor,
    handshake_timeout: Duration,
}

impl TlsStreamListener {
    pub async fn bind(
        host: &str,
        port: u16,
        options: &ServerTlsOptions,
        handshake_timeout: Duration,
    ) -> io::Result<Self> {
        let certificate = std::fs::read(&options.certificate)?;
        let key = std::fs::read(&options.key)?;
        let identity = native_tls::Identity::from_pkcs8(&certificate, &key).map_err(tls_error)?;
        let acceptor = native_tls::TlsAcceptor::new(identity).map_err(tls_error)?;

        Ok(Self {
            tcp: TcpStreamListener::bind(host, port).await?,
            acceptor: tokio_native_tls::TlsAcceptor::from(acceptor),
            handshake_timeout,
        })
    }
}

#[async_trait]
impl Listener for TlsStreamListener {
    async fn accept(&mut self) -> io::Result<(Handshake, String)> {
        let (stream, addr) = self.tcp.listener.accept().await?;
        stream.set_nodelay(true)?;

        let acceptor = self.acceptor.clone();
        let handshake_timeout = self.handshake_timeout;
        let handshake: Handshake = Box::pin(async move {
            let stream = tokio::time::timeout(handshake_timeout, acceptor.accept(stream))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))?
                .map_err(tls_error)?;
            Ok(Box::new(stream) as BoxedStream)
        });
        Ok((handshake, addr.to_string()))
    }

    fn local_addr(&self) -> String {
        format!("tls://{}", self.tcp.local_addr)
    }
}

/// Unix domain socket listener
#[cfg(unix)]
pub struct UnixStreamListener {
    listener: tokio::net::UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl UnixStreamListener {
    /// Bind to `path`, replacing a stale socket file left by a previous run
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        use std::os::unix::fs::FileTypeExt;

        let path = path.into();
        if let Ok(meta) = std::fs::symlink_metadata(&path) {
            if meta.file_type().is_socket() {
                std::fs::remove_file(&path)?;
            }
        }
        let listener = tokio::net::UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }
}

#[cfg(unix)]
#[async_trait]
impl Listener for UnixStreamListener {
    async fn accept(&mut self) -> io::Result<(Handshake, String)> {
        let (stream, _) = self.listener.accept().await?;
        Ok((established(stream), format!("unix:{}", self.path.display())))
    }

    fn local_addr(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

#[cfg(unix)]
impl Drop for UnixStreamListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Bind the listener for an endpoint
pub async fn listener_for(
    endpoint: &Endpoint,
    tls: Option<&ServerTlsOptions>,
    handshake_timeout: Duration,
) -> io::Result<Box<dyn Listener>> {
    match endpoint {
        Endpoint::Tcp { host, port } => match tls {
            Some(options) => Ok(Box::new(
                TlsStreamListener::bind(host, *port, options, handshake_timeout).await?,
            )),
            None => Ok(Box::new(TcpStreamListener::bind(host, *port).await?)),
        },
        #[cfg(unix)]
        Endpoint::Unix { path } => {
            if tls.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "TLS is not supported on Unix domain sockets",
                ));
            }
            Ok(Box::new(UnixStreamListener::bind(path.clone())?))
        }
        #[cfg(not(unix))]
        Endpoint::Unix { .. } => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Unix domain sockets are not supported on this platform",
        )),
    }
}

fn tls_error(err: native_tls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}
