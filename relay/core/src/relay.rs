//! Relay facade
//!
//! Wires one broker, one record store and one configuration into the
//! publisher, the subscription manager, the delivery path and the fan-in
//! multiplexer, all sharing a single [`RelayMetrics`].

use std::fmt;
use std::sync::Arc;

use crate::broker::Broker;
use crate::config::RelayConfig;
use crate::delivery::{DeliveryError, DeliveryReceipt, MessageDelivery, SendRequest};
use crate::envelope::MessageEnvelope;
use crate::error::{ConnectionError, RelayError, TaskOrigin};
use crate::fanin::{ClientConnection, ConnectionFanIn};
use crate::identifier::{ConversationId, UserId};
use crate::metrics::RelayMetrics;
use crate::publisher::{PublishMode, Publisher};
use crate::records::RecordStore;
use crate::subscriber::SubscriptionManager;

/// Entry point for embedding the relay
#[derive(Clone)]
pub struct Relay {
    config: Arc<RelayConfig>,
    records: Arc<dyn RecordStore>,
    publisher: Publisher,
    subscriptions: SubscriptionManager,
    delivery: MessageDelivery,
    fanin: ConnectionFanIn,
    metrics: Arc<RelayMetrics>,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("topic", &self.config.broker.topic)
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        broker: Arc<dyn Broker>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        let config = Arc::new(config);
        let metrics = Arc::new(RelayMetrics::new());

        let publisher = Publisher::new(Arc::clone(&broker), Arc::clone(&config))
            .with_metrics(Arc::clone(&metrics));
        let subscriptions = SubscriptionManager::new(broker, Arc::clone(&config))
            .with_metrics(Arc::clone(&metrics));
        let delivery = MessageDelivery::new(Arc::clone(&records), publisher.clone())
            .with_metrics(Arc::clone(&metrics));
        let fanin = ConnectionFanIn::new(subscriptions.clone(), delivery.clone())
            .with_metrics(Arc::clone(&metrics));

        Self {
            config,
            records,
            publisher,
            subscriptions,
            delivery,
            fanin,
            metrics,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn delivery(&self) -> &MessageDelivery {
        &self.delivery
    }

    pub fn fan_in(&self) -> &ConnectionFanIn {
        &self.fanin
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Publish one envelope without touching the record store
    ///
    /// `mode` defaults to the configured publish mode.
    pub async fn publish_one(
        &self,
        envelope: &MessageEnvelope,
        mode: Option<PublishMode>,
    ) -> Result<(), RelayError> {
        let mode = mode.unwrap_or(self.config.publish.default_mode);
        self.publisher.publish_one(envelope.to, envelope, mode).await
    }

    /// Record and publish a client message, compensating on publish failure
    pub async fn send_message(
        &self,
        user: &UserId,
        request: &SendRequest,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        self.delivery.send(user, request).await
    }

    /// Serve a client connection over every conversation its user belongs to
    pub async fn serve_connection(
        &self,
        connection: ClientConnection,
    ) -> Result<(), ConnectionError> {
        let conversations = match self.records.conversations_for(&connection.user).await {
            Ok(conversations) => conversations,
            Err(e) => {
                tracing::error!(
                    connection = %connection.id,
                    user = %connection.user,
                    error = %e,
                    "Failed to list conversations for connection"
                );
                return Err(ConnectionError {
                    connection: connection.id,
                    origin: TaskOrigin::Supervisor,
                    source: Arc::new(e.into()),
                });
            }
        };
        self.serve_conversations(connection, conversations).await
    }

    /// Serve a client connection over an explicit conversation list
    pub async fn serve_conversations(
        &self,
        connection: ClientConnection,
        conversations: Vec<ConversationId>,
    ) -> Result<(), ConnectionError> {
        self.fanin.run(connection, conversations).await
    }
}
