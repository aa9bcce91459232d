//! Client-submitted frames on bidirectional transports
//!
//! Frames are JSON text:
//!
//! ```json
//! {"conversation_id": "01HF6Y8Z00ABCDEFGHJKMNPQRS", "message": "hello"}
//! ```
//!
//! Malformed frames, invalid requests and non-members are logged and
//! skipped; only the end of the stream stops the inbound task.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::delivery::{DeliveryError, MessageDelivery, SendRequest};
use crate::error::RelayError;
use crate::identifier::UserId;

/// Source of text frames sent by the client
#[async_trait]
pub trait InboundFrames: Send {
    /// Next frame, or `None` once the client transport closed
    async fn next_frame(&mut self) -> Option<String>;
}

/// In-process frame source backed by a channel
#[derive(Debug)]
pub struct ChannelInbound {
    rx: mpsc::Receiver<String>,
}

impl ChannelInbound {
    /// Frame source plus the sender the client side writes to.
    /// Dropping the sender closes the source.
    pub fn new(capacity: usize) -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl InboundFrames for ChannelInbound {
    async fn next_frame(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Read frames until the client closes or the connection is cancelled
///
/// A delivery in progress is finished before cancellation is observed, so an
/// accepted frame is either published or compensated, never abandoned.
pub(crate) async fn relay_inbound(
    mut frames: Box<dyn InboundFrames>,
    delivery: MessageDelivery,
    user: UserId,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            frame = frames.next_frame() => frame,
        };

        let Some(frame) = frame else {
            tracing::debug!(user = %user, "Client closed inbound stream");
            cancel.cancel();
            return Ok(());
        };

        let request: SendRequest = match serde_json::from_str(&frame) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(user = %user, error = %e, "Ignoring malformed client frame");
                continue;
            }
        };

        match delivery.send(&user, &request).await {
            Ok(receipt) => {
                tracing::debug!(
                    user = %user,
                    conversation = %receipt.conversation,
                    record = %receipt.record_id,
                    "Client message delivered"
                );
            }
            Err(DeliveryError::Publish {
                compensated,
                source,
                ..
            }) => {
                tracing::warn!(
                    user = %user,
                    compensated,
                    error = %source,
                    "Client message not published"
                );
            }
            Err(e) => {
                tracing::warn!(user = %user, error = %e, "Client message rejected");
            }
        }
    }
}
