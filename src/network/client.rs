//! BeamNet Client
//!
//! One client multiplexes requests, one-way messages and subscriptions over a
//! single outbound connection, and re-establishes that connection according
//! to its `ReconnectPolicy`.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use super::connection::{spawn_writer, Connection, ConnectionError, ConnectionResult, Outbound};
use super::transport::{connector_for, BoxedStream, Connector};
use super::{ClientOptions, ReconnectPolicy};
use crate::protocol::{is_valid_topic, Frame, Payload, PayloadError, RequestError};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Invalid topic {0:?}: topics must not contain '|'")]
    InvalidTopic(String),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Connection lost before a response arrived")]
    ConnectionLost,

    #[error("Client closed")]
    Closed,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A connection attempt started
    Connecting,
    /// Connected to the server
    Connected { peer: String },
    /// The connection was lost or closed
    Disconnected { reason: String },
    /// A reconnection attempt is scheduled
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Transport error
    Error { message: String },
    /// The client stopped for good
    Closed,
}

/// Reconnection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Closed,
    Connecting,
    Connected,
    RetryScheduled,
}

type PushHandler = Arc<dyn Fn(Option<Payload>) + Send + Sync>;
type PendingResponse = oneshot::Sender<Result<Option<Bytes>, ClientError>>;

/// BeamNet Client
pub struct Client {
    inner: Arc<Inner>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    reconnect: ReconnectPolicy,
    max_frame_size: usize,
    /// Correlation ids, shared by requests and subscriptions; never reused
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingResponse>>,
    push_handlers: RwLock<HashMap<String, Vec<(u64, PushHandler)>>>,
    /// Frames queued for whichever connection is current, in call order
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    state: watch::Sender<ClientState>,
    user_closed: AtomicBool,
    shutdown: Notify,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl Client {
    /// Create a client for the endpoint in `options`
    pub fn new(options: ClientOptions) -> ClientResult<Self> {
        let connector = connector_for(&options.endpoint, options.tls.as_ref(), options.connect_timeout)?;
        Ok(Self::with_connector(connector, options.reconnect, options.max_frame_size))
    }

    /// Create a client on top of a custom stream producer
    pub fn with_connector(
        connector: Arc<dyn Connector>,
        reconnect: ReconnectPolicy,
        max_frame_size: usize,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (state, _) = watch::channel(ClientState::Closed);

        Self {
            inner: Arc::new(Inner {
                connector,
                reconnect,
                max_frame_size,
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                push_handlers: RwLock::new(HashMap::new()),
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                state,
                user_closed: AtomicBool::new(false),
                shutdown: Notify::new(),
                supervisor: Mutex::new(None),
                event_tx,
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Start connecting in the background.
    ///
    /// Returns immediately; writes issued before the connection is up are
    /// queued and flushed in call order once it is. Transport errors are
    /// reported as `ClientEvent::Error`, never returned here.
    pub async fn connect(&self) -> ClientResult<()> {
        if self.inner.user_closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        let mut supervisor = self.inner.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(ClientError::AlreadyConnected);
        }

        let outbound_rx = self
            .inner
            .outbound_rx
            .lock()
            .await
            .take()
            .ok_or(ClientError::AlreadyConnected)?;

        tracing::info!("Connecting to {}", self.inner.connector.describe());
        *supervisor = Some(tokio::spawn(supervise(self.inner.clone(), outbound_rx)));
        Ok(())
    }

    /// Send a one-way message. Resolves once the frame is flushed.
    pub async fn send(&self, topic: &str, payload: impl Into<Payload>) -> ClientResult<()> {
        check_topic(topic)?;
        let payload = payload.into();
        self.inner.write(Frame::push(topic, Some(&payload))).await
    }

    /// Send a request and wait for its response.
    ///
    /// There is no built-in timeout; wrap the call in `tokio::time::timeout`
    /// if one is needed.
    pub async fn request(&self, topic: &str, payload: impl Into<Payload>) -> ClientResult<Option<Payload>> {
        check_topic(topic)?;
        let payload = payload.into();
        self.request_frame(topic, Some(&payload)).await
    }

    /// Send a request without a body
    pub async fn request_empty(&self, topic: &str) -> ClientResult<Option<Payload>> {
        check_topic(topic)?;
        self.request_frame(topic, None).await
    }

    async fn request_frame(&self, topic: &str, payload: Option<&Payload>) -> ClientResult<Option<Payload>> {
        let id = self.inner.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        if let Err(e) = self.inner.write(Frame::request(topic, id, payload)).await {
            self.inner.pending.lock().await.remove(&id);
            return Err(e);
        }

        let body = rx.await.map_err(|_| ClientError::Closed)??;
        Ok(Payload::decode_body(body.as_deref())?)
    }

    /// Register a push handler for `topic`.
    ///
    /// Only the first handler of a topic sends SUBSCRIBE; the returned
    /// `Subscription` removes exactly this handler.
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> ClientResult<Subscription>
    where
        F: Fn(Option<Payload>) + Send + Sync + 'static,
    {
        check_topic(topic)?;
        let permit = self.inner.reserve().await?;

        // SUBSCRIBE is queued under the handler lock so it cannot overtake an
        // UNSUBSCRIBE for the same topic
        let id = self.inner.next_id();
        let flushed = {
            let mut handlers = self.inner.push_handlers.write().await;
            let set = handlers.entry(topic.to_string()).or_default();
            set.push((id, Arc::new(handler)));
            if set.len() == 1 {
                tracing::debug!("Subscribing to '{}'", topic);
                let (outbound, done) = Outbound::new(Frame::Subscribe {
                    topic: topic.to_string(),
                    id,
                });
                permit.send(outbound);
                Some(done)
            } else {
                None
            }
        };

        if let Some(done) = flushed {
            if let Err(e) = wait_flushed(done).await {
                self.inner.remove_handler(topic, id).await;
                return Err(e);
            }
        }

        Ok(Subscription {
            inner: self.inner.clone(),
            topic: topic.to_string(),
            id,
        })
    }

    /// Stop the client for good.
    ///
    /// Cancels any scheduled retry, ends the stream, and rejects pending
    /// requests and queued writes with `ClientError::Closed`.
    pub async fn close(&self) {
        if self.inner.user_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.notify_one();

        let task = self.inner.supervisor.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }

        if let Some(mut rx) = self.inner.outbound_rx.lock().await.take() {
            fail_queued(&mut rx);
        }
        self.inner.fail_pending(None, || ClientError::Closed).await;
        self.inner.set_state(ClientState::Closed);
        tracing::info!("Client closed");
    }

    /// Get the current state
    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Wait until the client reaches `state`
    pub async fn wait_for_state(&self, state: ClientState) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == state).await;
    }

    /// Number of requests still waiting for a response
    pub async fn pending_requests(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.user_closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_one();
    }
}

/// Handle returned by `Client::subscribe`
pub struct Subscription {
    inner: Arc<Inner>,
    topic: String,
    id: u64,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Remove this handler; the last handler of a topic sends UNSUBSCRIBE
    pub async fn unsubscribe(self) -> ClientResult<()> {
        let permit = match self.inner.reserve().await {
            Ok(permit) => permit,
            Err(e) => {
                self.inner.remove_handler(&self.topic, self.id).await;
                return Err(e);
            }
        };

        let flushed = {
            let mut handlers = self.inner.push_handlers.write().await;
            if take_handler(&mut handlers, &self.topic, self.id) {
                tracing::debug!("Unsubscribing from '{}'", self.topic);
                let (outbound, done) = Outbound::new(Frame::Unsubscribe {
                    topic: self.topic.clone(),
                });
                permit.send(outbound);
                Some(done)
            } else {
                None
            }
        };

        match flushed {
            Some(done) => wait_flushed(done).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::trace!("Dropping client event: {}", e);
        }
    }

    fn is_closed(&self) -> bool {
        self.user_closed.load(Ordering::SeqCst)
    }

    /// Claim a slot in the outbound queue
    async fn reserve(&self) -> ClientResult<mpsc::Permit<'_, Outbound>> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        self.outbound_tx.reserve().await.map_err(|_| ClientError::Closed)
    }

    /// Queue a frame for the current connection and wait for its flush
    async fn write(&self, frame: Frame) -> ClientResult<()> {
        let permit = self.reserve().await?;
        let (outbound, done) = Outbound::new(frame);
        permit.send(outbound);
        wait_flushed(done).await
    }

    async fn remove_handler(&self, topic: &str, id: u64) {
        take_handler(&mut *self.push_handlers.write().await, topic, id);
    }

    /// Reject pending requests, either all of them or only `ids`
    async fn fail_pending(&self, ids: Option<&HashSet<u64>>, error: impl Fn() -> ClientError) {
        let mut pending = self.pending.lock().await;
        let failed: Vec<u64> = match ids {
            Some(ids) => ids.iter().copied().filter(|id| pending.contains_key(id)).collect(),
            None => pending.keys().copied().collect(),
        };
        for id in failed {
            if let Some(tx) = pending.remove(&id) {
                let _ = tx.send(Err(error()));
            }
        }
    }

    /// Route one inbound frame
    async fn dispatch(&self, frame: Frame, in_flight: &mut HashSet<u64>) {
        match frame {
            Frame::ResponseOk { id, body } => self.complete(id, Ok(body), in_flight).await,
            Frame::ResponseErr { id, code, message } => {
                let error = ClientError::Request(RequestError { code, message });
                self.complete(id, Err(error), in_flight).await
            }
            Frame::Push { topic, body } => {
                let payload = match Payload::decode_body(body.as_deref()) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Dropping undecodable push on '{}': {}", topic, e);
                        return;
                    }
                };

                let handlers: Vec<PushHandler> = match self.push_handlers.read().await.get(&topic) {
                    Some(set) => set.iter().map(|(_, h)| h.clone()).collect(),
                    None => return,
                };

                for handler in handlers {
                    let payload = payload.clone();
                    if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                        tracing::warn!("Push handler for '{}' panicked", topic);
                    }
                }
            }
            other => {
                tracing::warn!("Ignoring unexpected {:?} frame from server", other.opcode());
            }
        }
    }

    async fn complete(
        &self,
        id: u64,
        outcome: Result<Option<Bytes>, ClientError>,
        in_flight: &mut HashSet<u64>,
    ) {
        in_flight.remove(&id);
        match self.pending.lock().await.remove(&id) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => tracing::warn!("Ignoring response for unknown request id {}", id),
        }
    }
}

/// Drive connect / serve / retry until the client is closed or reconnection gives up
async fn supervise(inner: Arc<Inner>, outbound_rx: mpsc::Receiver<Outbound>) {
    let mut outbound_rx = Some(outbound_rx);
    let mut attempt: u32 = 0;
    let mut sessions: u64 = 0;

    loop {
        if inner.is_closed() {
            break;
        }

        inner.set_state(ClientState::Connecting);
        inner.emit(ClientEvent::Connecting);

        let connected = tokio::select! {
            result = inner.connector.connect() => Some(result),
            _ = inner.shutdown.notified() => None,
        };

        match connected {
            None => break,
            Some(Ok(stream)) => {
                let Some(queue) = outbound_rx.take() else {
                    break;
                };
                attempt = 0;
                let peer = inner.connector.describe();
                tracing::info!("Connected to {}", peer);
                inner.set_state(ClientState::Connected);
                inner.emit(ClientEvent::Connected { peer: peer.clone() });

                let (reason, queue) = run_session(&inner, stream, peer, queue, sessions > 0).await;
                outbound_rx = queue;
                sessions += 1;

                tracing::info!("Disconnected: {}", reason);
                inner.emit(ClientEvent::Disconnected { reason });
                if outbound_rx.is_none() {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!("Error connecting to {}: {}", inner.connector.describe(), e);
                inner.emit(ClientEvent::Error {
                    message: e.to_string(),
                });
            }
        }

        if inner.is_closed() {
            break;
        }

        let Some(delay) = inner.reconnect.delay(attempt) else {
            tracing::info!("Reconnection disabled, staying closed");
            break;
        };
        attempt = attempt.saturating_add(1);

        inner.set_state(ClientState::RetryScheduled);
        inner.emit(ClientEvent::ReconnectScheduled { attempt, delay });
        tracing::debug!("Reconnecting in {:?} (attempt {})", delay, attempt);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.shutdown.notified() => break,
        }
    }

    if let Some(rx) = outbound_rx.as_mut() {
        fail_queued(rx);
    }
    inner.fail_pending(None, || ClientError::Closed).await;
    inner.set_state(ClientState::Closed);
    inner.emit(ClientEvent::Closed);

    if !inner.is_closed() {
        // Allow a later connect() to pick up where this one stopped
        *inner.outbound_rx.lock().await = outbound_rx;
    }
}

/// Serve one stream until it closes.
///
/// Reading stays here while a writer task drains the outbound queue, so a
/// large write never stops inbound frames from being consumed. Returns the
/// disconnect reason and the queue, which is `None` only if the writer task
/// itself failed.
async fn run_session(
    inner: &Inner,
    stream: BoxedStream,
    peer: String,
    outbound_rx: mpsc::Receiver<Outbound>,
    resubscribe: bool,
) -> (String, Option<mpsc::Receiver<Outbound>>) {
    let (mut reader, mut writer) = Connection::with_max_frame_size(stream, peer, inner.max_frame_size).into_split();
    // Requests written to this stream that still await a response
    let mut in_flight: HashSet<u64> = HashSet::new();

    if resubscribe {
        let topics: Vec<String> = inner.push_handlers.read().await.keys().cloned().collect();
        for topic in topics {
            let frame = Frame::Subscribe {
                topic,
                id: inner.next_id(),
            };
            if let Err(e) = writer.send(&frame).await {
                let _ = writer.close().await;
                return (format!("Resubscribe error: {}", e), Some(outbound_rx));
            }
        }
    }

    // Request ids are reported before their bytes hit the stream, so a
    // response can never be read ahead of its id
    let (flushed_tx, mut flushed_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel();
    let mut writer_task = spawn_writer(writer, outbound_rx, stop_rx, move |frame| {
        if let Frame::Request { id, .. } = frame {
            let _ = flushed_tx.send(*id);
        }
    });

    let mut finished = None;
    let reason = loop {
        tokio::select! {
            biased;

            Some(id) = flushed_rx.recv() => {
                in_flight.insert(id);
            }

            exit = &mut writer_task => {
                let reason = match &exit {
                    Ok(exit) => match &exit.error {
                        Some(message) => {
                            inner.emit(ClientEvent::Error { message: message.clone() });
                            format!("Send error: {}", message)
                        }
                        None => "Outbound queue closed".to_string(),
                    },
                    Err(e) => format!("Writer task failed: {}", e),
                };
                finished = Some(exit);
                break reason;
            }

            result = reader.recv() => {
                match result {
                    Ok(Some(frame)) => inner.dispatch(frame, &mut in_flight).await,
                    Ok(None) => break "Connection closed".to_string(),
                    Err(e) => {
                        inner.emit(ClientEvent::Error { message: e.to_string() });
                        break format!("Error: {}", e);
                    }
                }
            }

            _ = inner.shutdown.notified() => {
                break "Client shutdown requested".to_string();
            }
        }
    };

    let exit = match finished {
        Some(exit) => exit,
        None => {
            let _ = stop_tx.send(());
            writer_task.await
        }
    };
    while let Ok(id) = flushed_rx.try_recv() {
        in_flight.insert(id);
    }
    inner.fail_pending(Some(&in_flight), || ClientError::ConnectionLost).await;

    match exit {
        Ok(mut exit) => {
            let _ = exit.writer.close().await;
            (reason, Some(exit.queue))
        }
        Err(e) => {
            tracing::error!("Writer task for {} failed: {}", inner.connector.describe(), e);
            (reason, None)
        }
    }
}

/// Wait for a queued frame to reach the stream
async fn wait_flushed(done: oneshot::Receiver<ConnectionResult<()>>) -> ClientResult<()> {
    match done.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(ConnectionError::Closed)) | Err(_) => Err(ClientError::Closed),
        Ok(Err(e)) => Err(ClientError::Connection(e)),
    }
}

/// Drop handler `id` from `topic`; true if it was the topic's last one
fn take_handler(handlers: &mut HashMap<String, Vec<(u64, PushHandler)>>, topic: &str, id: u64) -> bool {
    let Some(set) = handlers.get_mut(topic) else {
        return false;
    };
    let before = set.len();
    set.retain(|(handler_id, _)| *handler_id != id);
    if set.is_empty() {
        handlers.remove(topic);
        before > 0
    } else {
        false
    }
}

fn fail_queued(rx: &mut mpsc::Receiver<Outbound>) {
    while let Ok(outbound) = rx.try_recv() {
        outbound.complete(Err(ConnectionError::Closed));
    }
}

fn check_topic(topic: &str) -> ClientResult<()> {
    if is_valid_topic(topic) {
        Ok(())
    } else {
        Err(ClientError::InvalidTopic(topic.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorCode, Opcode, MAX_FRAME_SIZE};
    use async_trait::async_trait;
    use serde_json::json;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;

    /// Hands out in-memory pipes; the test holds the server ends
    struct PipeConnector {
        peers: mpsc::UnboundedSender<DuplexStream>,
    }

    #[async_trait]
    impl Connector for PipeConnector {
        async fn connect(&self) -> io::Result<BoxedStream> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            self.peers
                .send(server)
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "no peer"))?;
            Ok(Box::new(client))
        }

        fn describe(&self) -> String {
            "pipe".to_string()
        }
    }

    fn pipe_client(reconnect: ReconnectPolicy) -> (Client, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Client::with_connector(Arc::new(PipeConnector { peers: tx }), reconnect, MAX_FRAME_SIZE);
        (client, rx)
    }

    async fn accept(peers: &mut mpsc::UnboundedReceiver<DuplexStream>) -> Connection<DuplexStream> {
        let stream = timeout(Duration::from_secs(2), peers.recv())
            .await
            .expect("no connection attempt")
            .expect("connector dropped");
        Connection::new(stream, "client")
    }

    async fn next_frame(remote: &mut Connection<DuplexStream>) -> Frame {
        timeout(Duration::from_secs(2), remote.recv())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("stream closed")
    }

    #[tokio::test]
    async fn test_send_writes_push_frame() {
        let (client, mut peers) = pipe_client(ReconnectPolicy::Off);
        client.connect().await.unwrap();
        let mut remote = accept(&mut peers).await;

        client.send("greet", json!({ "text": "hi" })).await.unwrap();
        assert_eq!(
            next_frame(&mut remote).await.encode(),
            Bytes::from_static(br#"!greet|J{"text":"hi"}"#)
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_writes_before_connect_are_flushed_in_order() {
        let (client, mut peers) = pipe_client(ReconnectPolicy::Off);

        // join! polls in order: both frames are queued before the connection exists
        let (first, second, connected) =
            tokio::join!(client.send("a", "1"), client.send("b", "2"), client.connect());
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert!(connected.is_ok());

        let mut remote = accept(&mut peers).await;
        assert_eq!(next_frame(&mut remote).await, Frame::push("a", Some(&Payload::from("1"))));
        assert_eq!(next_frame(&mut remote).await, Frame::push("b", Some(&Payload::from("2"))));
        client.close().await;
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated() {
        let (client, mut peers) = pipe_client(ReconnectPolicy::Off);
        let client = Arc::new(client);
        client.connect().await.unwrap();
        let mut remote = accept(&mut peers).await;

        let calls: Vec<_> = (0..3)
            .map(|n| {
                let client = client.clone();
                tokio::spawn(async move { client.request("double", json!(n)).await })
            })
            .collect();

        let mut requests = Vec::new();
        for _ in 0..3 {
            match next_frame(&mut remote).await {
                Frame::Request { topic, id, body } => {
                    assert_eq!(topic, "double");
                    let n = Payload::decode_body(body.as_deref()).unwrap().unwrap();
                    requests.push((id, n.parse::<i64>().unwrap()));
                }
                other => panic!("Wrong frame: {:?}", other),
            }
        }

        // Answer in reverse arrival order
        for (id, n) in requests.iter().rev() {
            let answer = Payload::from(json!(n * 2));
            remote.send(&Frame::response_ok(*id, Some(&answer))).await.unwrap();
        }

        for (n, call) in calls.into_iter().enumerate() {
            let result = call.await.unwrap().unwrap().unwrap();
            assert_eq!(result, Payload::from(json!(n as i64 * 2)));
        }
        assert_eq!(client.pending_requests().await, 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_error_response_rejects_with_code() {
        let (client, mut peers) = pipe_client(ReconnectPolicy::Off);
        let client = Arc::new(client);
        client.connect().await.unwrap();
        let mut remote = accept(&mut peers).await;

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.request("sum", json!({ "a": 2, "b": 3 })).await }
        });

        let Frame::Request { id, .. } = next_frame(&mut remote).await else {
            panic!("expected a request");
        };
        remote
            .send(&Frame::ResponseErr {
                id,
                code: ErrorCode::Numeric(7),
                message: "bad input".to_string(),
            })
            .await
            .unwrap();

        match call.await.unwrap() {
            Err(ClientError::Request(e)) => {
                assert_eq!(e.code, ErrorCode::Numeric(7));
                assert_eq!(e.message, "bad input");
            }
            other => panic!("Unexpected result: {:?}", other),
        }
        client.close().await;
    }

    #[tokio::test]
    async fn test_absent_result_and_stale_response() {
        let (client, mut peers) = pipe_client(ReconnectPolicy::Off);
        let client = Arc::new(client);
        client.connect().await.unwrap();
        let mut remote = accept(&mut peers).await;

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.request_empty("noop").await }
        });
        let Frame::Request { id, body, .. } = next_frame(&mut remote).await else {
            panic!("expected a request");
        };
        assert!(body.is_none());

        // Unknown id first: must be ignored without disturbing the real one
        remote.send(&Frame::response_ok(id + 100, None)).await.unwrap();
        remote.send(&Frame::response_ok(id, None)).await.unwrap();
        remote.send(&Frame::response_ok(id, None)).await.unwrap();

        assert_eq!(call.await.unwrap().unwrap(), None);
        assert!(client.is_connected());
        client.close().await;
    }

    #[tokio::test]
    async fn test_subscription_refcounting() {
        let (client, mut peers) = pipe_client(ReconnectPolicy::Off);
        client.connect().await.unwrap();
        let mut remote = accept(&mut peers).await;

        let first = client.subscribe("tick", |_| {}).await.unwrap();
        let second = client.subscribe("tick", |_| {}).await.unwrap();
        assert!(matches!(next_frame(&mut remote).await, Frame::Subscribe { ref topic, .. } if topic == "tick"));

        first.unsubscribe().await.unwrap();
        second.unsubscribe().await.unwrap();
        // Exactly one UNSUBSCRIBE, and no second SUBSCRIBE before it
        assert_eq!(next_frame(&mut remote).await, Frame::Unsubscribe { topic: "tick".into() });

        client.send("after", "x").await.unwrap();
        assert!(matches!(next_frame(&mut remote).await, Frame::Push { ref topic, .. } if topic == "after"));
        client.close().await;
    }

    #[tokio::test]
    async fn test_push_handlers_isolated_from_panics() {
        let (client, mut peers) = pipe_client(ReconnectPolicy::Off);
        client.connect().await.unwrap();
        let mut remote = accept(&mut peers).await;

        let hits = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _panicky = client
            .subscribe("tick", |_| panic!("handler failure"))
            .await
            .unwrap();
        let _counting = client
            .subscribe("tick", {
                let hits = hits.clone();
                move |payload| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(payload);
                }
            })
            .await
            .unwrap();
        let _ = next_frame(&mut remote).await;

        let tick = Payload::from(json!({ "n": 1 }));
        remote.send(&Frame::push("tick", Some(&tick))).await.unwrap();
        remote.send(&Frame::push("tick", Some(&tick))).await.unwrap();

        for _ in 0..2 {
            let payload = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            assert_eq!(payload, Some(tick.clone()));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(client.is_connected());
        client.close().await;
    }

    #[tokio::test]
    async fn test_disconnect_rejects_in_flight_requests() {
        let (client, mut peers) = pipe_client(ReconnectPolicy::Off);
        let client = Arc::new(client);
        client.connect().await.unwrap();
        let mut remote = accept(&mut peers).await;

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.request("slow", "x").await }
        });
        let _ = next_frame(&mut remote).await;
        drop(remote);

        assert!(matches!(call.await.unwrap(), Err(ClientError::ConnectionLost)));
        client.wait_for_state(ClientState::Closed).await;
        assert_eq!(client.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_reconnects_and_resubscribes() {
        let (mut client, mut peers) = pipe_client(ReconnectPolicy::Fixed(Duration::from_millis(10)));
        let mut events = client.take_event_receiver().unwrap();
        client.connect().await.unwrap();

        let remote = accept(&mut peers).await;
        let _sub = client.subscribe("tick", |_| {}).await.unwrap();
        drop(remote);

        let mut remote = accept(&mut peers).await;
        assert!(matches!(next_frame(&mut remote).await, Frame::Subscribe { ref topic, .. } if topic == "tick"));
        client.wait_for_state(ClientState::Connected).await;

        let mut saw_retry = false;
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::ReconnectScheduled { attempt, delay } = event {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_millis(10));
                saw_retry = true;
            }
        }
        assert!(saw_retry);
        client.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_reconnection() {
        let (client, mut peers) = pipe_client(ReconnectPolicy::Fixed(Duration::from_millis(10)));
        client.connect().await.unwrap();
        let remote = accept(&mut peers).await;

        client.close().await;
        drop(remote);

        assert_eq!(client.state(), ClientState::Closed);
        assert!(timeout(Duration::from_millis(100), peers.recv()).await.is_err());
        assert!(matches!(client.send("t", "x").await, Err(ClientError::Closed)));
        assert!(matches!(client.connect().await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_backoff_function_receives_attempts() {
        let (tx, rx) = mpsc::unbounded_channel::<DuplexStream>();
        drop(rx);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let policy = ReconnectPolicy::backoff({
            let seen = seen.clone();
            move |attempt| {
                seen.lock().unwrap().push(attempt);
                Duration::from_millis(1)
            }
        });
        let mut client = Client::with_connector(Arc::new(PipeConnector { peers: tx }), policy, MAX_FRAME_SIZE);
        let mut events = client.take_event_receiver().unwrap();
        client.connect().await.unwrap();

        let mut errors = 0;
        while errors < 3 {
            match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
                Some(ClientEvent::Error { .. }) => errors += 1,
                Some(_) => {}
                None => break,
            }
        }
        client.close().await;
        let seen = seen.lock().unwrap().clone();
        assert!(seen.len() >= 2);
        assert_eq!(&seen[..2], &[0, 1]);
    }

    /// Hands out one scripted stream, then refuses
    struct ScriptedConnector {
        mock: std::sync::Mutex<Option<tokio_test::io::Mock>>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self) -> io::Result<BoxedStream> {
            let mock = self.mock.lock().unwrap().take();
            match mock {
                Some(mock) => Ok(Box::new(mock)),
                None => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "script used up")),
            }
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    #[tokio::test]
    async fn test_failed_subscribe_drops_handler() {
        let mock = tokio_test::io::Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
            .build();
        let connector = ScriptedConnector {
            mock: std::sync::Mutex::new(Some(mock)),
        };
        let client = Client::with_connector(Arc::new(connector), ReconnectPolicy::Off, MAX_FRAME_SIZE);
        client.connect().await.unwrap();

        let result = timeout(Duration::from_secs(2), client.subscribe("tick", |_| {}))
            .await
            .unwrap();
        assert!(matches!(result, Err(ClientError::Connection(_))));
        assert!(client.inner.push_handlers.read().await.get("tick").is_none());
        client.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_control_frames_follow_handler_changes() {
        let (client, mut peers) = pipe_client(ReconnectPolicy::Off);
        let client = Arc::new(client);
        client.connect().await.unwrap();
        let mut remote = accept(&mut peers).await;

        for round in 0..50 {
            let first = client.subscribe("t", |_| {}).await.unwrap();
            assert!(matches!(next_frame(&mut remote).await, Frame::Subscribe { .. }));

            // Last handler leaves while a new one arrives
            let leaving = tokio::spawn(first.unsubscribe());
            let joining = tokio::spawn({
                let client = client.clone();
                async move { client.subscribe("t", |_| {}).await }
            });
            leaving.await.unwrap().unwrap();
            let second = joining.await.unwrap().unwrap();

            client.send("sync", "x").await.unwrap();
            let mut last_control = None;
            loop {
                match next_frame(&mut remote).await {
                    Frame::Push { topic, .. } if topic == "sync" => break,
                    frame => last_control = Some(frame.opcode()),
                }
            }
            // A handler is live, so the server must end up subscribed
            if let Some(opcode) = last_control {
                assert_eq!(opcode, Opcode::Subscribe, "round {}", round);
            }

            second.unsubscribe().await.unwrap();
            assert_eq!(next_frame(&mut remote).await, Frame::Unsubscribe { topic: "t".into() });
        }
        client.close().await;
    }

    #[tokio::test]
    async fn test_invalid_topic_rejected() {
        let (client, _peers) = pipe_client(ReconnectPolicy::Off);
        assert!(matches!(client.send("a|b", "x").await, Err(ClientError::InvalidTopic(_))));
    }
}
