//! Partitioned Log Broker Abstraction
//!
//! The relay talks to the broker through three narrow traits:
//!
//! ```text
//!   Broker                      (metadata + connection factory)
//!     ├── partition_count()     fresh metadata fetch, never cached
//!     ├── watch_partitions()    topology change notifications
//!     ├── connect_producer()    -> ProducerConnection (bound to one partition)
//!     └── connect_consumer()    -> ConsumerConnection (bound to one partition)
//! ```
//!
//! A producer `send` is exactly one acknowledged attempt; retry policy lives
//! in the publisher. A consumer `next` blocks until the next record arrives
//! on its partition and returns an error once the connection is dropped or
//! closed, so closing is how a parked reader gets released.
//!
//! [`InMemoryBroker`] is the in-process implementation used by the embedded
//! daemon and by tests.

mod memory;

pub use memory::{InMemoryBroker, DEFAULT_PARTITION_CAPACITY};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::BrokerCredentials;

/// Broker-level failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// No broker could be reached
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// Credentials were missing or rejected
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Topic metadata could not be fetched
    #[error("metadata unavailable for topic {topic}: {reason}")]
    Metadata { topic: String, reason: String },

    #[error("unknown topic {0}")]
    UnknownTopic(String),

    #[error("partition {partition} does not exist on topic {topic}")]
    UnknownPartition { topic: String, partition: usize },

    /// The broker refused to append the record
    #[error("broker rejected record: {0}")]
    Rejected(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection was dropped by the broker side
    #[error("connection dropped: {0}")]
    Disconnected(String),

    /// The connection was closed locally
    #[error("connection closed")]
    Closed,
}

impl BrokerError {
    /// Whether another attempt on the same connection may succeed
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Self::Authentication(_)
                | Self::UnknownTopic(_)
                | Self::UnknownPartition { .. }
                | Self::Closed
        )
    }
}

/// Where a new consumer starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOffset {
    /// Oldest retained record
    Earliest,
    /// Only records appended after the consumer connects
    #[default]
    Latest,
}

/// A record read back from a partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub partition: usize,
    pub offset: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Metadata and connection factory for a partitioned log
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Current number of partitions of `topic`
    async fn partition_count(
        &self,
        topic: &str,
        credentials: Option<&BrokerCredentials>,
    ) -> Result<usize, BrokerError>;

    /// Receiver that observes every partition count change of `topic`
    async fn watch_partitions(
        &self,
        topic: &str,
        credentials: Option<&BrokerCredentials>,
    ) -> Result<watch::Receiver<usize>, BrokerError>;

    /// Open a producer bound to one partition
    async fn connect_producer(
        &self,
        topic: &str,
        partition: usize,
        credentials: Option<&BrokerCredentials>,
    ) -> Result<Box<dyn ProducerConnection>, BrokerError>;

    /// Open a consumer bound to one partition
    async fn connect_consumer(
        &self,
        topic: &str,
        partition: usize,
        start: StartOffset,
        credentials: Option<&BrokerCredentials>,
    ) -> Result<Box<dyn ConsumerConnection>, BrokerError>;
}

/// Outbound connection to one partition
#[async_trait]
pub trait ProducerConnection: Send {
    /// Append one record, returning its offset once acknowledged
    async fn send(&mut self, key: &[u8], value: &[u8]) -> Result<u64, BrokerError>;

    /// Release the connection. Idempotent.
    async fn close(&mut self);
}

/// Inbound connection to one partition
#[async_trait]
pub trait ConsumerConnection: Send {
    /// Block until the next record is available
    async fn next(&mut self) -> Result<BrokerRecord, BrokerError>;

    /// Release the connection. Idempotent.
    async fn close(&mut self);
}
