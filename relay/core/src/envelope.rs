//! Wire envelope exchanged through the broker
//!
//! One JSON object per broker record:
//!
//! ```json
//! {"from": "<sender id>", "to": "<conversation id>", "message": "<text>"}
//! ```
//!
//! The `to` field doubles as the broker message key. There is no version
//! field, so any schema change is a breaking change for every consumer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifier::{ConversationId, UserId};

/// Envelope codec failure
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
}

/// A message on its way from one sender to one conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Sender identifier
    pub from: UserId,
    /// Conversation the message belongs to
    pub to: ConversationId,
    /// Message text, unconstrained at this layer
    pub message: String,
}

impl MessageEnvelope {
    pub fn new(from: impl Into<UserId>, to: ConversationId, message: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to,
            message: message.into(),
        }
    }

    /// Broker message key (the conversation identifier)
    #[must_use]
    pub fn key(&self) -> Vec<u8> {
        self.to.to_string().into_bytes()
    }

    /// Serialize to the wire format
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    /// Parse from the wire format
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)
    }
}
