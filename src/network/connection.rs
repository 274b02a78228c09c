//! Connection handling for BeamNet
//!
//! Manages a single framed stream, including:
//! - Length-prefix reassembly and opcode frame parsing
//! - Flush-aware writes, driven by a dedicated writer task per connection
//! - Handles that let other tasks queue frames for that writer

use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{CodecError, Decoder, Encoder, Frame, FrameError, MAX_FRAME_SIZE};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("Connection closed")]
    Closed,

    #[error("Send channel closed")]
    SendChannelClosed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Identifier of an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Frames sent
    pub frames_sent: u64,
    /// Frames received
    pub frames_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// Receiving half: length-prefix reassembly and opcode parsing
pub struct FrameReader<R> {
    stream: R,
    decoder: Decoder,
    read_buf: BytesMut,
    frames_received: u64,
    bytes_received: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(stream: R, max_frame_size: usize) -> Self {
        Self {
            stream,
            decoder: Decoder::with_max_frame_size(max_frame_size),
            read_buf: BytesMut::with_capacity(4096),
            frames_received: 0,
            bytes_received: 0,
        }
    }

    /// Receive the next frame. Returns None on a clean close at a frame boundary.
    ///
    /// Cancel safe: partial input stays buffered in the reader.
    pub async fn recv(&mut self) -> ConnectionResult<Option<Frame>> {
        loop {
            if let Some(body) = self.decoder.decode(&mut self.read_buf)? {
                self.frames_received += 1;
                return Ok(Some(Frame::parse(body)?));
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() && self.decoder.is_idle() {
                    return Ok(None); // Clean close
                } else {
                    return Err(ConnectionError::Closed);
                }
            }

            self.bytes_received += n as u64;
        }
    }
}

/// Sending half: one length-prefixed frame per `send`, flushed before returning
pub struct FrameWriter<W> {
    stream: W,
    encoder: Encoder,
    write_buf: BytesMut,
    frames_sent: u64,
    bytes_sent: u64,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(stream: W, max_frame_size: usize) -> Self {
        Self {
            stream,
            encoder: Encoder::with_max_frame_size(max_frame_size),
            write_buf: BytesMut::with_capacity(4096),
            frames_sent: 0,
            bytes_sent: 0,
        }
    }

    pub async fn send(&mut self, frame: &Frame) -> ConnectionResult<()> {
        self.write_buf.clear();
        self.encoder.encode(&frame.encode(), &mut self.write_buf)?;

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.frames_sent += 1;
        self.bytes_sent += self.write_buf.len() as u64;
        Ok(())
    }

    /// Shut down the write side of the stream
    pub async fn close(&mut self) -> ConnectionResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// A framed byte stream to a remote peer
pub struct Connection<S> {
    /// Remote peer description
    peer: String,
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Create a new connection from an established stream
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self::with_max_frame_size(stream, peer, MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(stream: S, peer: impl Into<String>, max_frame_size: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            peer: peer.into(),
            reader: FrameReader::new(read_half, max_frame_size),
            writer: FrameWriter::new(write_half, max_frame_size),
        }
    }

    /// Get the remote peer description
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            frames_sent: self.writer.frames_sent,
            frames_received: self.reader.frames_received,
            bytes_sent: self.writer.bytes_sent,
            bytes_received: self.reader.bytes_received,
        }
    }

    /// Write one frame and wait until the stream has flushed it
    pub async fn send(&mut self, frame: &Frame) -> ConnectionResult<()> {
        self.writer.send(frame).await
    }

    /// Receive the next frame. Returns None on a clean close at a frame boundary.
    pub async fn recv(&mut self) -> ConnectionResult<Option<Frame>> {
        self.reader.recv().await
    }

    /// Shut down the write side of the stream
    pub async fn close(&mut self) -> ConnectionResult<()> {
        self.writer.close().await?;
        tracing::debug!(
            "Connection to {} closed (sent {} frames, received {} frames)",
            self.peer,
            self.writer.frames_sent,
            self.reader.frames_received
        );
        Ok(())
    }

    /// Separate the halves so reading never waits behind a blocked write
    pub fn into_split(self) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}

/// A frame queued for a connection, with an optional flush notification
pub(crate) struct Outbound {
    pub(crate) frame: Frame,
    pub(crate) done: Option<oneshot::Sender<ConnectionResult<()>>>,
}

impl Outbound {
    pub(crate) fn new(frame: Frame) -> (Self, oneshot::Receiver<ConnectionResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self { frame, done: Some(tx) }, rx)
    }

    /// Report the write outcome to whoever queued the frame
    pub(crate) fn complete(self, result: ConnectionResult<()>) {
        if let Some(done) = self.done {
            let _ = done.send(result);
        }
    }
}

/// What a writer task hands back when it stops
pub(crate) struct WriterExit<W> {
    pub(crate) writer: FrameWriter<W>,
    pub(crate) queue: mpsc::Receiver<Outbound>,
    /// Set when a write failed
    pub(crate) error: Option<String>,
}

/// Spawn the task that owns the sending half of a connection.
///
/// It writes queued frames in order until `stop` fires (or its sender is
/// dropped), the queue closes, or a write fails. `on_dequeue` sees every frame
/// right before it is written.
pub(crate) fn spawn_writer<W, F>(
    mut writer: FrameWriter<W>,
    mut queue: mpsc::Receiver<Outbound>,
    mut stop: oneshot::Receiver<()>,
    mut on_dequeue: F,
) -> JoinHandle<WriterExit<W>>
where
    W: AsyncWrite + Unpin + Send + 'static,
    F: FnMut(&Frame) + Send + 'static,
{
    tokio::spawn(async move {
        let error = loop {
            let outbound = tokio::select! {
                biased;
                _ = &mut stop => break None,
                next = queue.recv() => match next {
                    Some(outbound) => outbound,
                    None => break None,
                },
            };

            on_dequeue(&outbound.frame);

            let written = tokio::select! {
                biased;
                _ = &mut stop => None,
                written = writer.send(&outbound.frame) => Some(written),
            };

            match written {
                Some(Ok(())) => outbound.complete(Ok(())),
                Some(Err(e)) => {
                    let message = e.to_string();
                    outbound.complete(Err(e));
                    break Some(message);
                }
                None => {
                    outbound.complete(Err(ConnectionError::Closed));
                    break None;
                }
            }
        };

        WriterExit { writer, queue, error }
    })
}

/// A handle for sending frames through a connection owned by another task
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: Arc<str>,
    sender: mpsc::Sender<Outbound>,
    connected: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: ConnectionId, peer: &str, sender: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            peer: Arc::from(peer),
            sender,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue a frame and wait until it has been flushed to the stream
    pub async fn send(&self, frame: Frame) -> ConnectionResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        let (outbound, done) = Outbound::new(frame);
        self.sender
            .send(outbound)
            .await
            .map_err(|_| ConnectionError::SendChannelClosed)?;

        done.await.map_err(|_| ConnectionError::Closed)?
    }

    /// Check if the connection is still active
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark the connection as disconnected
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .finish()
    }
}
