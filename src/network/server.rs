//! BeamNet Server
//!
//! The server owns every accepted connection, routes inbound frames to the
//! registered topic handlers and fans pushes out to connected clients.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use super::connection::{spawn_writer, Connection, ConnectionError, ConnectionHandle, ConnectionId, Outbound};
use super::transport::{listener_for, BoxedStream, Listener};
use super::ServerOptions;
use crate::protocol::{Frame, Payload, RequestError, MAX_FRAME_SIZE};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Server started
    Started { local_addr: String },
    /// A new client has connected
    ClientConnected { id: ConnectionId, peer: String },
    /// A client has disconnected
    ClientDisconnected {
        id: ConnectionId,
        peer: String,
        reason: String,
    },
    /// Error occurred
    Error { message: String },
    /// Server stopped
    Stopped,
}

/// Outcome of a request handler: a result (possibly absent) or a typed error
pub type HandlerResult = Result<Option<Payload>, RequestError>;

/// Boxed future for request handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type MessageHandler = Arc<dyn Fn(Option<Payload>) + Send + Sync>;
type RequestHandler = Arc<dyn Fn(Option<Payload>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// BeamNet Server
pub struct Server {
    inner: Arc<ServerInner>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal shared by the accept loop and every connection
    shutdown_tx: watch::Sender<bool>,
    /// Address the server is listening on
    local_addr: Option<String>,
    accept_task: Option<JoinHandle<()>>,
    max_frame_size: usize,
}

struct ServerInner {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    /// Topic bookkeeping from SUBSCRIBE/UNSUBSCRIBE; `push` ignores it
    subscriptions: RwLock<HashMap<String, HashSet<ConnectionId>>>,
    message_handlers: RwLock<HashMap<String, Vec<(u64, MessageHandler)>>>,
    request_handlers: RwLock<HashMap<String, (u64, RequestHandler)>>,
    next_handler_id: AtomicU64,
    event_tx: mpsc::Sender<ServerEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerKind {
    Message,
    Request,
}

/// Deregistration handle returned by `on_message` / `on_request`
#[derive(Debug)]
pub struct Registration {
    inner: Weak<ServerInner>,
    kind: HandlerKind,
    topic: String,
    id: u64,
}

impl Registration {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Remove exactly the handler this handle was returned for.
    /// Returns false if it was already gone or replaced.
    pub async fn remove(self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };

        match self.kind {
            HandlerKind::Message => {
                let mut handlers = inner.message_handlers.write().await;
                let Some(set) = handlers.get_mut(&self.topic) else {
                    return false;
                };
                let before = set.len();
                set.retain(|(id, _)| *id != self.id);
                let removed = set.len() != before;
                if set.is_empty() {
                    handlers.remove(&self.topic);
                }
                removed
            }
            HandlerKind::Request => {
                let mut handlers = inner.request_handlers.write().await;
                match handlers.get(&self.topic) {
                    Some((id, _)) if *id == self.id => {
                        handlers.remove(&self.topic);
                        true
                    }
                    _ => false,
                }
            }
        }
    }
}

impl Server {
    /// Create a new server
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(ServerInner {
                connections: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                message_handlers: RwLock::new(HashMap::new()),
                request_handlers: RwLock::new(HashMap::new()),
                next_handler_id: AtomicU64::new(1),
                event_tx,
            }),
            event_rx: Some(event_rx),
            shutdown_tx,
            local_addr: None,
            accept_task: None,
            max_frame_size,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Bind the endpoint in `options` and start accepting connections.
    /// Returns the bound address.
    pub async fn listen(&mut self, options: &ServerOptions) -> ServerResult<String> {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = listener_for(&options.endpoint, options.tls.as_ref(), options.handshake_timeout)
            .await
            .map_err(|e| match (&options.tls, e.kind()) {
                (Some(_), std::io::ErrorKind::Other | std::io::ErrorKind::NotFound) => {
                    ServerError::Tls(format!("{}: {}", options.endpoint, e))
                }
                _ => ServerError::BindFailed(format!("Failed to bind to {}: {}", options.endpoint, e)),
            })?;
        self.max_frame_size = options.max_frame_size;
        self.serve(listener)
    }

    /// Start accepting connections from any listener
    pub fn serve(&mut self, mut listener: Box<dyn Listener>) -> ServerResult<String> {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }

        let local_addr = listener.local_addr();
        tracing::info!("Server listening on {}", local_addr);

        self.shutdown_tx.send_replace(false);
        self.local_addr = Some(local_addr.clone());
        self.inner.emit(ServerEvent::Started {
            local_addr: local_addr.clone(),
        });

        let inner = self.inner.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let max_frame_size = self.max_frame_size;

        // Spawn the accept loop
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((handshake, peer)) => {
                                tracing::info!("New connection from {}", peer);
                                let inner = inner.clone();
                                let mut shutdown_rx = shutdown_rx.clone();
                                // A slow handshake only holds up its own task
                                tokio::spawn(async move {
                                    let established = tokio::select! {
                                        result = handshake => result,
                                        _ = shutdown_rx.changed() => return,
                                    };
                                    match established {
                                        Ok(stream) => {
                                            handle_client(inner, stream, peer, shutdown_rx, max_frame_size).await;
                                        }
                                        Err(e) => {
                                            tracing::warn!("Handshake with {} failed: {}", peer, e);
                                            inner.emit(ServerEvent::Error {
                                                message: format!("Handshake with {} failed: {}", peer, e),
                                            });
                                        }
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                inner.emit(ServerEvent::Error { message: e.to_string() });
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            inner.emit(ServerEvent::Stopped);
        }));

        Ok(local_addr)
    }

    /// Stop accepting and close every connection
    pub async fn stop(&mut self) -> ServerResult<()> {
        if !self.is_running() {
            return Err(ServerError::NotRunning);
        }

        self.shutdown_tx.send_replace(true);
        self.local_addr = None;

        // The listener is released once the accept loop returns
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::error!("Accept loop failed: {}", e);
            }
        }
        Ok(())
    }

    /// Check if the server is running
    pub fn is_running(&self) -> bool {
        self.local_addr.is_some()
    }

    /// Address the server is bound to
    pub fn local_addr(&self) -> Option<&str> {
        self.local_addr.as_deref()
    }

    /// Register a handler for one-way messages on `topic`
    pub async fn on_message<F>(&self, topic: impl Into<String>, handler: F) -> Registration
    where
        F: Fn(Option<Payload>) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .message_handlers
            .write()
            .await
            .entry(topic.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        self.inner.registration(HandlerKind::Message, topic, id)
    }

    /// Register the request handler for `topic`, replacing any previous one
    pub async fn on_request<F, Fut>(&self, topic: impl Into<String>, handler: F) -> Registration
    where
        F: Fn(Option<Payload>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let topic = topic.into();
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::SeqCst);
        let handler: RequestHandler = Arc::new(move |payload: Option<Payload>| -> BoxFuture<'static, HandlerResult> {
            Box::pin(handler(payload))
        });

        if self
            .inner
            .request_handlers
            .write()
            .await
            .insert(topic.clone(), (id, handler))
            .is_some()
        {
            tracing::debug!("Replaced request handler for '{}'", topic);
        }

        self.inner.registration(HandlerKind::Request, topic, id)
    }

    /// Push to every open connection, subscribed or not.
    /// Returns the number of connections the frame was flushed to.
    pub async fn push(&self, topic: &str, payload: impl Into<Payload>) -> usize {
        let targets: Vec<ConnectionHandle> = self.inner.connections.read().await.values().cloned().collect();
        self.inner.fan_out(targets, Frame::push(topic, Some(&payload.into()))).await
    }

    /// Push only to connections that subscribed to `topic`
    pub async fn push_subscribed(&self, topic: &str, payload: impl Into<Payload>) -> usize {
        let targets: Vec<ConnectionHandle> = {
            let subscriptions = self.inner.subscriptions.read().await;
            let connections = self.inner.connections.read().await;
            match subscriptions.get(topic) {
                Some(ids) => ids.iter().filter_map(|id| connections.get(id).cloned()).collect(),
                None => Vec::new(),
            }
        };
        self.inner.fan_out(targets, Frame::push(topic, Some(&payload.into()))).await
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    /// Connections currently subscribed to `topic`
    pub async fn subscribers(&self, topic: &str) -> Vec<ConnectionId> {
        self.inner
            .subscriptions
            .read()
            .await
            .get(topic)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl ServerInner {
    fn emit(&self, event: ServerEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::trace!("Dropping server event: {}", e);
        }
    }

    fn registration(self: &Arc<Self>, kind: HandlerKind, topic: String, id: u64) -> Registration {
        Registration {
            inner: Arc::downgrade(self),
            kind,
            topic,
            id,
        }
    }

    async fn fan_out(&self, targets: Vec<ConnectionHandle>, frame: Frame) -> usize {
        let mut writes = JoinSet::new();
        for handle in targets {
            let frame = frame.clone();
            writes.spawn(async move {
                let result = handle.send(frame).await;
                (handle, result)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok((_, Ok(()))) => delivered += 1,
                Ok((handle, Err(e))) => {
                    tracing::warn!("Push to {} failed: {}", handle.peer(), e);
                    self.emit(ServerEvent::Error {
                        message: format!("Push to {} failed: {}", handle.peer(), e),
                    });
                }
                Err(e) => tracing::error!("Push task failed: {}", e),
            }
        }
        delivered
    }

    /// Route one inbound frame from `conn`
    async fn dispatch(self: &Arc<Self>, conn: &ConnectionHandle, frame: Frame) {
        match frame {
            Frame::Subscribe { topic, .. } => {
                tracing::debug!("{} subscribed to '{}'", conn.peer(), topic);
                self.subscriptions
                    .write()
                    .await
                    .entry(topic)
                    .or_default()
                    .insert(conn.id());
            }
            Frame::Unsubscribe { topic } => {
                let mut subscriptions = self.subscriptions.write().await;
                if let Some(set) = subscriptions.get_mut(&topic) {
                    set.remove(&conn.id());
                    if set.is_empty() {
                        subscriptions.remove(&topic);
                    }
                    tracing::debug!("{} unsubscribed from '{}'", conn.peer(), topic);
                }
            }
            Frame::Push { topic, body } => {
                let payload = match Payload::decode_body(body.as_deref()) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Dropping undecodable message on '{}' from {}: {}", topic, conn.peer(), e);
                        return;
                    }
                };

                let handlers: Vec<MessageHandler> = match self.message_handlers.read().await.get(&topic) {
                    Some(set) => set.iter().map(|(_, h)| h.clone()).collect(),
                    None => {
                        tracing::debug!("No message handler for '{}'", topic);
                        return;
                    }
                };

                for handler in handlers {
                    let payload = payload.clone();
                    if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                        tracing::warn!("Message handler for '{}' panicked", topic);
                    }
                }
            }
            Frame::Request { topic, id, body } => {
                let payload = match Payload::decode_body(body.as_deref()) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Dropping undecodable request {} on '{}' from {}: {}", id, topic, conn.peer(), e);
                        return;
                    }
                };

                let handler = self.request_handlers.read().await.get(&topic).map(|(_, h)| h.clone());
                let conn = conn.clone();

                // Handlers may suspend; answer from a separate task so the read loop keeps going
                tokio::spawn(async move {
                    let outcome = match handler {
                        Some(handler) => match tokio::spawn(handler(payload)).await {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                tracing::warn!("Request handler for '{}' failed: {}", topic, e);
                                Err(RequestError::handler_panicked(&topic))
                            }
                        },
                        None => {
                            tracing::debug!("No request handler for '{}'", topic);
                            Err(RequestError::no_handler(&topic))
                        }
                    };

                    let response = match outcome {
                        // JSON null travels as an absent result
                        Ok(result) => {
                            let result = result.filter(|payload| !matches!(payload, Payload::Json(Value::Null)));
                            Frame::response_ok(id, result.as_ref())
                        }
                        Err(RequestError { code, message }) => Frame::ResponseErr { id, code, message },
                    };

                    if let Err(e) = conn.send(response).await {
                        tracing::warn!("Failed to answer request {} from {}: {}", id, conn.peer(), e);
                    }
                });
            }
            other => {
                tracing::warn!("Ignoring unexpected {:?} frame from {}", other.opcode(), conn.peer());
            }
        }
    }

    /// Forget a closed connection everywhere it is referenced
    async fn remove_connection(&self, id: ConnectionId) {
        self.connections.write().await.remove(&id);

        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.retain(|_, set| {
            set.remove(&id);
            !set.is_empty()
        });
    }
}

/// Handle a client connection.
///
/// Frames are read here; replies and pushes are written by a separate task
/// so a peer that is slow to read never stalls dispatch.
async fn handle_client(
    inner: Arc<ServerInner>,
    stream: BoxedStream,
    peer: String,
    mut shutdown_rx: watch::Receiver<bool>,
    max_frame_size: usize,
) {
    let id = ConnectionId::new();
    let (mut reader, writer) = Connection::with_max_frame_size(stream, peer.clone(), max_frame_size).into_split();

    // Create outbound channel for this client
    let (tx, rx) = mpsc::channel::<Outbound>(256);
    let handle = ConnectionHandle::new(id, &peer, tx);

    let (stop_tx, stop_rx) = oneshot::channel();
    let mut writer_task = spawn_writer(writer, rx, stop_rx, |_| {});

    inner.connections.write().await.insert(id, handle.clone());
    inner.emit(ServerEvent::ClientConnected {
        id,
        peer: peer.clone(),
    });

    // Main frame loop
    let mut finished = None;
    let reason = loop {
        tokio::select! {
            result = reader.recv() => {
                match result {
                    Ok(Some(frame)) => inner.dispatch(&handle, frame).await,
                    Ok(None) => break "Connection closed".to_string(),
                    Err(e) => {
                        inner.emit(ServerEvent::Error { message: format!("{}: {}", peer, e) });
                        break format!("Error: {}", e);
                    }
                }
            }

            exit = &mut writer_task => {
                let reason = match &exit {
                    Ok(exit) => match &exit.error {
                        Some(message) => format!("Send error: {}", message),
                        None => "Outbound queue closed".to_string(),
                    },
                    Err(e) => format!("Writer task failed: {}", e),
                };
                finished = Some(exit);
                break reason;
            }

            _ = shutdown_rx.changed() => {
                break "Server shutting down".to_string();
            }
        }
    };

    // Clean up
    handle.mark_disconnected();
    inner.remove_connection(id).await;

    let exit = match finished {
        Some(exit) => exit,
        None => {
            let _ = stop_tx.send(());
            writer_task.await
        }
    };
    let mut writer = match exit {
        Ok(mut exit) => {
            exit.queue.close();
            while let Some(outbound) = exit.queue.recv().await {
                outbound.complete(Err(ConnectionError::Closed));
            }
            Some(exit.writer)
        }
        Err(e) => {
            tracing::error!("Writer task for {} failed: {}", peer, e);
            None
        }
    };

    tracing::info!("Client {} disconnected: {}", peer, reason);
    inner.emit(ServerEvent::ClientDisconnected { id, peer, reason });

    if let Some(writer) = writer.as_mut() {
        let _ = writer.close().await;
    }
}
