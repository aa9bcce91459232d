//! WebSocket transport adapters
//!
//! Outbound frames are text messages carrying the envelope JSON. Inbound
//! frames are text messages carrying a send request; binary, ping and pong
//! frames are ignored.

use std::borrow::Cow;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::inbound::InboundFrames;
use super::sink::{MessageSink, SinkError};
use crate::envelope::MessageEnvelope;

fn sink_error(e: WsError) -> SinkError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => SinkError::Closed,
        WsError::Io(io) => io.into(),
        other => SinkError::Io(other.to_string()),
    }
}

/// Write half of a WebSocket connection
pub struct WebSocketSink<S> {
    inner: Mutex<S>,
}

impl<S> WebSocketSink<S>
where
    S: Sink<Message, Error = WsError> + Unpin + Send,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Send a close frame; a peer that is already gone is not an error
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), SinkError> {
        let frame = CloseFrame {
            code,
            reason: Cow::Owned(reason.to_string()),
        };
        let mut inner = self.inner.lock().await;
        match inner.send(Message::Close(Some(frame))).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(sink_error(e)),
        }
    }
}

#[async_trait]
impl<S> MessageSink for WebSocketSink<S>
where
    S: Sink<Message, Error = WsError> + Unpin + Send,
{
    async fn deliver(&self, envelope: &MessageEnvelope) -> Result<(), SinkError> {
        let text = serde_json::to_string(envelope)?;
        let mut inner = self.inner.lock().await;
        inner.send(Message::Text(text)).await.map_err(sink_error)
    }
}

/// Read half of a WebSocket connection
pub struct WebSocketInbound<S> {
    inner: S,
}

impl<S> WebSocketInbound<S>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin + Send,
{
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> InboundFrames for WebSocketInbound<S>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin + Send,
{
    async fn next_frame(&mut self) -> Option<String> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "WebSocket read ended");
                    return None;
                }
            }
        }
    }
}
