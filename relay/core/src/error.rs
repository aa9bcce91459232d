//! Relay error taxonomy
//!
//! [`RelayError`] is what every publish, subscribe and delivery operation
//! returns. [`RelayError::Cancelled`] is the expected teardown signal: it is
//! returned so callers can unwind, but it is never logged or reported as a
//! failure. [`ConnectionError`] is the single aggregate a fan-in run hands
//! back to the connection layer.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::broker::BrokerError;
use crate::envelope::EnvelopeError;
use crate::fanin::{ConnectionId, SinkError};
use crate::identifier::{ConversationId, IdentifierError};
use crate::records::RecordError;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed identifier or zero partition count
    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    /// Broker metadata fetch failed while resolving a partition
    #[error("partition resolution failed for conversation {conversation}: {source}")]
    PartitionResolution {
        conversation: ConversationId,
        #[source]
        source: BrokerError,
    },

    /// Publish failed after the retry budget was spent
    #[error("publish to conversation {conversation} failed after {attempts} attempt(s): {source}")]
    Publish {
        conversation: ConversationId,
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    /// Broker connect or read failure on the receive path
    #[error("subscription to conversation {conversation} failed: {source}")]
    Subscription {
        conversation: ConversationId,
        #[source]
        source: BrokerError,
    },

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Durable-record collaborator failure
    #[error(transparent)]
    Record(#[from] RecordError),

    /// Client sink write failure
    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("envelope for conversation {envelope} sent through session bound to {session}")]
    MisroutedEnvelope {
        session: ConversationId,
        envelope: ConversationId,
    },

    /// The session was already closed
    #[error("session closed")]
    SessionClosed,

    #[error("task {0} panicked")]
    TaskPanicked(String),

    /// Expected teardown; never a failure
    #[error("cancelled")]
    Cancelled,
}

impl RelayError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Which task of a connection produced its terminating error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOrigin {
    /// Forwarding task of one conversation
    Forwarder(ConversationId),
    /// Task reading client-submitted frames
    Inbound,
    /// The multiplexer itself (join failures)
    Supervisor,
}

impl fmt::Display for TaskOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forwarder(conversation) => write!(f, "forwarder[{conversation}]"),
            Self::Inbound => write!(f, "inbound"),
            Self::Supervisor => write!(f, "supervisor"),
        }
    }
}

/// First error captured across all tasks of one client connection
#[derive(Debug, Clone, Error)]
#[error("connection {connection} terminated by {origin}: {source}")]
pub struct ConnectionError {
    pub connection: ConnectionId,
    pub origin: TaskOrigin,
    #[source]
    pub source: Arc<RelayError>,
}
