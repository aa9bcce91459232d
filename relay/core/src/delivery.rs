//! Compensated message delivery
//!
//! The send path shared by the connection inbound task and request/response
//! handlers:
//!
//! ```text
//!   validate ─> is_member ─> record_message ─> publish (sync)
//!                                                 │
//!                                      failure ───┴──> delete_message (once)
//! ```
//!
//! Publishing always uses [`PublishMode::Sync`] here. An asynchronous publish
//! cannot report failure, and without a failure signal the durable record
//! could never be compensated.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::MessageEnvelope;
use crate::error::RelayError;
use crate::identifier::{ConversationId, UserId, IDENTIFIER_LEN};
use crate::metrics::RelayMetrics;
use crate::publisher::{PublishMode, Publisher};
use crate::records::{RecordError, RecordId, RecordStore};

/// A client request to post a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub conversation_id: String,
    pub message: String,
}

impl SendRequest {
    pub fn new(conversation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message: message.into(),
        }
    }

    /// Check the request shape and parse its conversation id
    pub fn validate(&self) -> Result<ConversationId, DeliveryError> {
        if self.conversation_id.len() != IDENTIFIER_LEN {
            return Err(DeliveryError::InvalidRequest(format!(
                "conversation_id must be {IDENTIFIER_LEN} characters"
            )));
        }
        if self.message.is_empty() {
            return Err(DeliveryError::InvalidRequest(
                "message is required".to_string(),
            ));
        }
        ConversationId::parse(&self.conversation_id)
            .map_err(|e| DeliveryError::InvalidRequest(e.to_string()))
    }
}

/// Outcome of a successful delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub record_id: RecordId,
    pub conversation: ConversationId,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("user {user} is not a member of conversation {conversation}")]
    NotMember {
        user: UserId,
        conversation: ConversationId,
    },

    #[error(transparent)]
    Record(#[from] RecordError),

    /// Publish failed; `compensated` tells whether the record was deleted
    #[error("{source} (record {record_id} compensated: {compensated})")]
    Publish {
        record_id: RecordId,
        compensated: bool,
        #[source]
        source: RelayError,
    },
}

/// Validates, records, publishes and compensates client messages
#[derive(Clone)]
pub struct MessageDelivery {
    records: Arc<dyn RecordStore>,
    publisher: Publisher,
    metrics: Arc<RelayMetrics>,
}

impl fmt::Debug for MessageDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDelivery")
            .field("publisher", &self.publisher)
            .finish_non_exhaustive()
    }
}

impl MessageDelivery {
    pub fn new(records: Arc<dyn RecordStore>, publisher: Publisher) -> Self {
        Self {
            records,
            publisher,
            metrics: Arc::new(RelayMetrics::new()),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Deliver one message from `user`
    pub async fn send(
        &self,
        user: &UserId,
        request: &SendRequest,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let conversation = request.validate()?;

        if !self.records.is_member(&conversation, user).await? {
            return Err(DeliveryError::NotMember {
                user: user.clone(),
                conversation,
            });
        }

        let record_id = self
            .records
            .record_message(user, &conversation, &request.message)
            .await?;

        let envelope = MessageEnvelope::new(user.clone(), conversation, request.message.clone());
        match self
            .publisher
            .publish_one(conversation, &envelope, PublishMode::Sync)
            .await
        {
            Ok(()) => Ok(DeliveryReceipt {
                record_id,
                conversation,
            }),
            Err(source) => {
                let compensated = self.compensate(&record_id, &source).await;
                Err(DeliveryError::Publish {
                    record_id,
                    compensated,
                    source,
                })
            }
        }
    }

    /// Issue exactly one compensating delete for a record whose publish failed
    async fn compensate(&self, record_id: &RecordId, cause: &RelayError) -> bool {
        self.metrics.record_compensation();
        match self.records.delete_message(record_id).await {
            Ok(()) => {
                tracing::warn!(
                    record = %record_id,
                    cause = %cause,
                    "Publish failed, durable record deleted"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    record = %record_id,
                    cause = %cause,
                    error = %e,
                    "Compensating delete failed, record left without broker message"
                );
                false
            }
        }
    }
}
