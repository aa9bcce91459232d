//! Client-facing output sinks
//!
//! Every forwarding task of a connection writes into the same sink, so
//! implementations take `&self` and serialize writes internally.

use std::io;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use crate::envelope::MessageEnvelope;

#[derive(Debug, Error)]
pub enum SinkError {
    /// The client went away; a disconnect, not a failure
    #[error("client disconnected")]
    Closed,

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("client write failed: {0}")]
    Io(String),
}

impl From<io::Error> for SinkError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Io(e.to_string()),
        }
    }
}

/// Destination for envelopes forwarded to one client connection
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, envelope: &MessageEnvelope) -> Result<(), SinkError>;
}

/// In-process sink backed by a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<MessageEnvelope>,
}

impl ChannelSink {
    /// Sink plus the receiving end the client side reads from
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MessageEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn deliver(&self, envelope: &MessageEnvelope) -> Result<(), SinkError> {
        self.tx
            .send(envelope.clone())
            .await
            .map_err(|_| SinkError::Closed)
    }
}

/// One-way push writer emitting server-sent events:
///
/// ```text
/// event: message
/// data: {"from":"...","to":"...","message":"..."}
///
/// ```
#[derive(Debug)]
pub struct PushSink<W> {
    writer: Mutex<W>,
}

impl<W> PushSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> MessageSink for PushSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn deliver(&self, envelope: &MessageEnvelope) -> Result<(), SinkError> {
        let data = serde_json::to_string(envelope)?;
        let frame = format!("event: message\ndata: {data}\n\n");

        let mut writer = self.writer.lock().await;
        writer.write_all(frame.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}
