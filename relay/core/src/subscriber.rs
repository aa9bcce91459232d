//! Subscription Manager
//!
//! Per-conversation receive path. A [`SubscriberSession`] owns one consumer
//! connection positioned at the partition's latest offset when it was opened,
//! so a new subscriber never sees history.
//!
//! # Read loop
//!
//! ```text
//!   read() ── select ─┬─ cancel token fired      -> close connection, Cancelled
//!                     ├─ partition count changed -> re-resolve, reconnect at latest
//!                     └─ record from consumer    -> decode, keep if `to` matches
//! ```
//!
//! Cancellation closes the consumer connection rather than setting a flag the
//! reader has to poll, so a read parked inside the broker is released.
//! Envelopes for other conversations that share the partition are skipped.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, BrokerError, BrokerRecord, ConsumerConnection, StartOffset};
use crate::config::RelayConfig;
use crate::envelope::MessageEnvelope;
use crate::error::RelayError;
use crate::identifier::ConversationId;
use crate::metrics::RelayMetrics;

/// Factory for subscriber sessions
#[derive(Clone)]
pub struct SubscriptionManager {
    broker: Arc<dyn Broker>,
    config: Arc<RelayConfig>,
    metrics: Arc<RelayMetrics>,
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("topic", &self.config.broker.topic)
            .finish_non_exhaustive()
    }
}

impl SubscriptionManager {
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

    /// Open a live subscription for `conversation`, cancelled by `cancel`
    pub async fn open(
        &self,
        conversation: ConversationId,
        cancel: CancellationToken,
    ) -> Result<SubscriberSession, RelayError> {
        let topic = &self.config.broker.topic;
        let credentials = self.config.broker.credentials.as_ref();
        let failed = |source: BrokerError| RelayError::Subscription {
            conversation,
            source,
        };

        let topology = self
            .broker
            .watch_partitions(topic, credentials)
            .await
            .map_err(failed)?;
        let partition_count = self
            .broker
            .partition_count(topic, credentials)
            .await
            .map_err(failed)?;
        let partition = conversation.partition(partition_count)?;
        let consumer = self
            .broker
            .connect_consumer(topic, partition, StartOffset::Latest, credentials)
            .await
            .map_err(failed)?;

        self.metrics.record_subscription();
        tracing::debug!(
            conversation = %conversation,
            partition,
            partition_count,
            "Opened subscriber session"
        );

        Ok(SubscriberSession {
            conversation,
            partition,
            partition_count,
            consumer: Some(consumer),
            topology: self
                .config
                .subscribe
                .resubscribe_on_topology_change
                .then_some(topology),
            cancel,
            manager: self.clone(),
        })
    }
}

/// One live subscription to a conversation
///
/// Owned by exactly one task. `close` is idempotent and safe after
/// cancellation.
pub struct SubscriberSession {
    conversation: ConversationId,
    partition: usize,
    partition_count: usize,
    consumer: Option<Box<dyn ConsumerConnection>>,
    topology: Option<watch::Receiver<usize>>,
    cancel: CancellationToken,
    manager: SubscriptionManager,
}

impl fmt::Debug for SubscriberSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberSession")
            .field("conversation", &self.conversation)
            .field("partition", &self.partition)
            .field("partition_count", &self.partition_count)
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum Wake {
    Cancelled,
    /// Partition count changed, or the metadata source went away
    Topology { alive: bool },
    Record(Result<BrokerRecord, BrokerError>),
}

impl SubscriberSession {
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
        self.consumer.is_none()
    }

    /// Block until the next envelope for this conversation, or cancellation
    pub async fn read(&mut self) -> Result<MessageEnvelope, RelayError> {
        loop {
            let Some(consumer) = self.consumer.as_mut() else {
                return Err(if self.cancel.is_cancelled() {
                    RelayError::Cancelled
                } else {
                    RelayError::SessionClosed
                });
            };

            let wake = match self.topology.as_mut() {
                Some(topology) => tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Wake::Cancelled,
                    changed = topology.changed() => Wake::Topology { alive: changed.is_ok() },
                    record = consumer.next() => Wake::Record(record),
                },
                None => tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Wake::Cancelled,
                    record = consumer.next() => Wake::Record(record),
                },
            };

            match wake {
                Wake::Cancelled => {
                    self.close().await;
                    return Err(RelayError::Cancelled);
                }
                Wake::Topology { alive: true } => {
                    let count = self
                        .topology
                        .as_ref()
                        .map_or(self.partition_count, |topology| *topology.borrow());
                    self.resubscribe(count).await?;
                }
                Wake::Topology { alive: false } => {
                    // Metadata source went away; keep reading the current partition.
                    self.topology = None;
                }
                Wake::Record(Ok(record)) => {
                    if let Some(envelope) = self.accept(&record) {
                        return Ok(envelope);
                    }
                }
                Wake::Record(Err(source)) => {
                    if self.cancel.is_cancelled() {
                        self.close().await;
                        return Err(RelayError::Cancelled);
                    }
                    return Err(RelayError::Subscription {
                        conversation: self.conversation,
                        source,
                    });
                }
            }
        }
    }

    /// Release the connection. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut consumer) = self.consumer.take() {
            consumer.close().await;
            tracing::debug!(
                conversation = %self.conversation,
                partition = self.partition,
                "Subscriber session closed"
            );
        }
    }

    fn accept(&self, record: &BrokerRecord) -> Option<MessageEnvelope> {
        match MessageEnvelope::decode(&record.value) {
            Ok(envelope) if envelope.to == self.conversation => Some(envelope),
            Ok(_) => {
                self.manager.metrics.record_skipped();
                None
            }
            Err(e) => {
                tracing::warn!(
                    conversation = %self.conversation,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Skipping undecodable record"
                );
                self.manager.metrics.record_skipped();
                None
            }
        }
    }

    async fn resubscribe(&mut self, partition_count: usize) -> Result<(), RelayError> {
        let partition = self.conversation.partition(partition_count)?;
        self.partition_count = partition_count;
        if partition == self.partition {
            tracing::debug!(
                conversation = %self.conversation,
                partition,
                partition_count,
                "Partition count changed, routing unchanged"
            );
            return Ok(());
        }

        let config = &self.manager.config.broker;
        let consumer = self
            .manager
            .broker
            .connect_consumer(
                &config.topic,
                partition,
                StartOffset::Latest,
                config.credentials.as_ref(),
            )
            .await
            .map_err(|source| RelayError::Subscription {
                conversation: self.conversation,
                source,
            })?;

        if let Some(mut previous) = self.consumer.replace(consumer) {
            previous.close().await;
        }
        tracing::info!(
            conversation = %self.conversation,
            from = self.partition,
            to = partition,
            partition_count,
            "Re-subscribed after partition count change"
        );
        self.partition = partition;
        self.manager.metrics.record_resubscription();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::broker::InMemoryBroker;
    use crate::publisher::{PublishMode, Publisher};

    const TOPIC: &str = "messages";

    struct Fixture {
        broker: InMemoryBroker,
        publisher: Publisher,
        subscriptions: SubscriptionManager,
    }

    fn fixture(partitions: usize) -> Fixture {
        let broker = InMemoryBroker::new();
        broker.create_topic(TOPIC, partitions).unwrap();
        let config = Arc::new(RelayConfig::default());
        let shared: Arc<dyn Broker> = Arc::new(broker.clone());
        Fixture {
            publisher: Publisher::new(Arc::clone(&shared), Arc::clone(&config)),
            subscriptions: SubscriptionManager::new(shared, config),
            broker,
        }
    }

    async fn send(publisher: &Publisher, conversation: ConversationId, text: &str) {
        publisher
            .publish_one(
                conversation,
                &MessageEnvelope::new("alice", conversation, text),
                PublishMode::Sync,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_starts_at_latest() {
        let f = fixture(1);
        let conversation = ConversationId::generate();
        send(&f.publisher, conversation, "before").await;

        let mut session = f
            .subscriptions
            .open(conversation, CancellationToken::new())
            .await
            .unwrap();
        send(&f.publisher, conversation, "after").await;

        let envelope = session.read().await.unwrap();
        assert_eq!(envelope.message, "after");
        session.close().await;
    }

    #[tokio::test]
    async fn test_filters_colocated_conversations() {
        let f = fixture(2);
        // Same timestamp parity -> same partition
        let mine = ConversationId::from_parts(100, 1);
        let theirs = ConversationId::from_parts(102, 1);
        assert_eq!(mine.partition(2).unwrap(), theirs.partition(2).unwrap());

        let mut session = f
            .subscriptions
            .open(mine, CancellationToken::new())
            .await
            .unwrap();
        send(&f.publisher, theirs, "not for me").await;
        send(&f.publisher, mine, "for me").await;

        assert_eq!(session.read().await.unwrap().message, "for me");
    }

    #[tokio::test]
    async fn test_cancel_releases_parked_read() {
        let f = fixture(1);
        let cancel = CancellationToken::new();
        let mut session = f
            .subscriptions
            .open(ConversationId::generate(), cancel.clone())
            .await
            .unwrap();
        assert_eq!(f.broker.open_consumers(), 1);

        let reader = tokio::spawn(async move {
            let result = session.read().await;
            (result, session)
        });
        tokio::task::yield_now().await;
        cancel.cancel();

        let (result, mut session) = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RelayError::Cancelled)));
        assert!(session.is_closed());
        assert_eq!(f.broker.open_consumers(), 0);

        // close after cancellation is a no-op
        session.close().await;
        session.close().await;
        assert!(matches!(session.read().await, Err(RelayError::Cancelled)));
    }

    #[tokio::test]
    async fn test_dropped_connection_is_subscription_error() {
        let f = fixture(1);
        let conversation = ConversationId::generate();
        let mut session = f
            .subscriptions
            .open(conversation, CancellationToken::new())
            .await
            .unwrap();

        f.broker.sever_partition(TOPIC, 0).unwrap();
        let err = session.read().await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Subscription {
                source: BrokerError::Disconnected(_),
                ..
            }
        ));
        session.close().await;
    }

    #[tokio::test]
    async fn test_resubscribes_when_partition_count_changes() {
        let f = fixture(2);
        // ts 5: partition 1 of 2, partition 2 of 3
        let conversation = ConversationId::from_parts(5, 1);
        let mut session = f
            .subscriptions
            .open(conversation, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(session.partition(), 1);

        f.broker.set_partition_count(TOPIC, 3).unwrap();
        let reader = tokio::spawn(async move {
            let envelope = session.read().await;
            (envelope, session)
        });

        // Publish until the re-subscribed reader picks it up on partition 2
        let mut delivered = None;
        for _ in 0..50 {
            send(&f.publisher, conversation, "moved").await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            if reader.is_finished() {
                delivered = Some(reader.await.unwrap());
                break;
            }
        }

        let (envelope, session) = delivered.expect("reader never received the envelope");
        assert_eq!(envelope.unwrap().message, "moved");
        assert_eq!(session.partition(), 2);
        assert_eq!(f.broker.open_consumers(), 1);
    }

    #[tokio::test]
    async fn test_metadata_failure_is_subscription_error() {
        let f = fixture(1);
        f.broker.fail_metadata(true);
        let err = f
            .subscriptions
            .open(ConversationId::generate(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Subscription { .. }));
    }
}
