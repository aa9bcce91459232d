//! Publisher
//!
//! Per-conversation send path. Opening a session fetches the partition count
//! fresh from the broker, resolves the conversation's partition and connects
//! a producer bound to it.
//!
//! # Architecture
//!
//! ```text
//!   PublisherSession::publish(env, Sync) ──┐
//!   PublisherSession::publish(env, Async) ─┤  mpsc (bounded)
//!                                          v
//!                                   ┌──────────────┐   send (1 attempt)
//!                                   │ writer task  │ ───────────────────> broker
//!                                   │ retry/backoff│ <─────────────────── ack / error
//!                                   └──────────────┘
//!                                          │
//!                         oneshot ack ─────┘ (Sync only)
//! ```
//!
//! The writer task is the only owner of the producer connection, so requests
//! are appended in submission order. `Sync` callers wait on a oneshot for the
//! final outcome after the retry budget; `Async` callers return once the
//! request is queued, and a later failure can only be logged.
//!
//! The publisher never undoes a durable write itself. A `Sync` failure is the
//! caller's signal to compensate.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::broker::{Broker, BrokerError, ProducerConnection};
use crate::config::{PublishConfig, RelayConfig};
use crate::envelope::MessageEnvelope;
use crate::error::RelayError;
use crate::identifier::ConversationId;
use crate::metrics::RelayMetrics;

/// How long `publish` waits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    /// Wait for the broker acknowledgement or retry exhaustion
    #[default]
    Sync,
    /// Return after handing the envelope to the writer task
    Async,
}

impl fmt::Display for PublishMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Async => write!(f, "async"),
        }
    }
}

impl FromStr for PublishMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            other => Err(format!("unknown publish mode: {other}")),
        }
    }
}

/// Factory for publisher sessions
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    config: Arc<RelayConfig>,
    metrics: Arc<RelayMetrics>,
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.config.broker.topic)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, config: Arc<RelayConfig>) -> Self {
        Self {
            broker,
            config,
            metrics: Arc::new(RelayMetrics::new()),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Open a session bound to the partition `conversation` currently routes to
    pub async fn open(&self, conversation: ConversationId) -> Result<PublisherSession, RelayError> {
        let topic = &self.config.broker.topic;
        let credentials = self.config.broker.credentials.as_ref();
        let resolution_failed = |source: BrokerError| RelayError::PartitionResolution {
            conversation,
            source,
        };

        let partition_count = self
            .broker
            .partition_count(topic, credentials)
            .await
            .map_err(resolution_failed)?;
        let partition = conversation.partition(partition_count)?;
        let connection = self
            .broker
            .connect_producer(topic, partition, credentials)
            .await
            .map_err(resolution_failed)?;

        tracing::debug!(
            conversation = %conversation,
            partition,
            partition_count,
            "Opened publisher session"
        );

        let (requests, queue) = mpsc::channel(self.config.publish.queue_depth);
        let writer = Writer {
            conversation,
            partition,
            connection,
            policy: self.config.publish.clone(),
            metrics: Arc::clone(&self.metrics),
        };
        let writer = tokio::spawn(writer.run(queue));

        Ok(PublisherSession {
            conversation,
            partition,
            requests: Some(requests),
            writer: Some(writer),
        })
    }

    /// Open, publish one envelope and release, for request/response paths
    ///
    /// In `Async` mode the session is detached after the handoff so the call
    /// does not wait for the broker.
    pub async fn publish_one(
        &self,
        conversation: ConversationId,
        envelope: &MessageEnvelope,
        mode: PublishMode,
    ) -> Result<(), RelayError> {
        let mut session = self.open(conversation).await?;
        let result = session.publish(envelope, mode).await;
        match mode {
            PublishMode::Sync => session.close().await,
            PublishMode::Async => session.detach(),
        }
        result
    }
}

struct PublishRequest {
    key: Vec<u8>,
    payload: Vec<u8>,
    ack: Option<oneshot::Sender<Result<u64, RelayError>>>,
}

/// One outbound connection bound to a resolved partition
///
/// Exclusively owned by its creator; `publish` takes `&mut self` so only one
/// operation runs at a time. Release with [`PublisherSession::close`].
#[derive(Debug)]
pub struct PublisherSession {
    conversation: ConversationId,
    partition: usize,
    requests: Option<mpsc::Sender<PublishRequest>>,
    writer: Option<JoinHandle<()>>,
}

impl PublisherSession {
    #[must_use]
    pub fn conversation(&self) -> ConversationId {
        self.conversation
    }

    #[must_use]
    pub fn partition(&self) -> usize {
        self.partition
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.requests.is_none()
    }

    /// Publish one envelope addressed to this session's conversation
    pub async fn publish(
        &mut self,
        envelope: &MessageEnvelope,
        mode: PublishMode,
    ) -> Result<(), RelayError> {
        if envelope.to != self.conversation {
            return Err(RelayError::MisroutedEnvelope {
                session: self.conversation,
                envelope: envelope.to,
            });
        }
        let requests = self.requests.as_ref().ok_or(RelayError::SessionClosed)?;
        let payload = envelope.encode()?;

        let (ack, outcome) = match mode {
            PublishMode::Sync => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            PublishMode::Async => (None, None),
        };

        requests
            .send(PublishRequest {
                key: envelope.key(),
                payload,
                ack,
            })
            .await
            .map_err(|_| RelayError::SessionClosed)?;

        match outcome {
            Some(rx) => rx.await.map_err(|_| RelayError::SessionClosed)?.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Flush queued publishes and release the connection. Idempotent.
    pub async fn close(&mut self) {
        self.requests.take();
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                tracing::warn!(
                    conversation = %self.conversation,
                    error = %e,
                    "Publisher writer task ended abnormally"
                );
            }
        }
    }

    /// Release without waiting; the writer drains its queue in the background
    fn detach(mut self) {
        self.requests.take();
        self.writer.take();
    }
}

struct Writer {
    conversation: ConversationId,
    partition: usize,
    connection: Box<dyn ProducerConnection>,
    policy: PublishConfig,
    metrics: Arc<RelayMetrics>,
}

impl Writer {
    async fn run(mut self, mut queue: mpsc::Receiver<PublishRequest>) {
        while let Some(request) = queue.recv().await {
            let result = self.send_with_retry(&request.key, &request.payload).await;
            self.metrics.record_publish(result.is_ok());

            match request.ack {
                Some(ack) => {
                    // The caller may have stopped waiting; the outcome is
                    // still recorded in metrics.
                    let _ = ack.send(result);
                }
                None => {
                    if let Err(e) = result {
                        tracing::warn!(
                            conversation = %self.conversation,
                            partition = self.partition,
                            error = %e,
                            "Async publish failed; no compensation is possible"
                        );
                    }
                }
            }
        }

        self.connection.close().await;
        tracing::debug!(
            conversation = %self.conversation,
            partition = self.partition,
            "Publisher session closed"
        );
    }

    async fn send_with_retry(&mut self, key: &[u8], payload: &[u8]) -> Result<u64, RelayError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome =
                match tokio::time::timeout(self.policy.write_timeout, self.connection.send(key, payload))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(BrokerError::Timeout(self.policy.write_timeout)),
                };

            match outcome {
                Ok(offset) => return Ok(offset),
                Err(e) if attempt >= self.policy.max_attempts || !e.is_retriable() => {
                    return Err(RelayError::Publish {
                        conversation: self.conversation,
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    let backoff = self.policy.backoff(attempt);
                    tracing::debug!(
                        conversation = %self.conversation,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Publish attempt failed, retrying"
                    );
                    self.metrics.record_retry();
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
