//! Relay Core - Conversation Message Relay over a Partitioned Log
//!
//! Moves chat messages between a durable record store and a partitioned,
//! append-only message broker, and multiplexes the live streams of many
//! conversations onto one client connection.
//!
//! # Architecture
//!
//! ```text
//!   client ──send──> MessageDelivery ──record──> RecordStore
//!                          │
//!                          └──publish (sync)──> Publisher ──> Broker[partition]
//!                                                                 │
//!   client <──sink── ConnectionFanIn <── SubscriberSession(s) <──────┘
//! ```
//!
//! Every conversation is pinned to one partition derived from the timestamp
//! embedded in its ULID ([`identifier::resolve_partition`]), so all messages
//! of a conversation share a single total order.
//!
//! # Key Types
//!
//! - [`Relay`]: Facade wiring everything for one broker and record store
//! - [`Publisher`] / [`PublisherSession`]: Outbound path with retry budget
//! - [`SubscriptionManager`] / [`SubscriberSession`]: Per-conversation reads
//! - [`ConnectionFanIn`]: One client connection over many conversations
//! - [`MessageDelivery`]: Record, publish, compensate
//!
//! # Module Overview
//!
//! - [`broker`]: Broker seam and the embedded in-memory broker
//! - [`config`]: Layered configuration (defaults, TOML file, environment)
//! - [`delivery`]: Compensated send path
//! - [`envelope`]: Wire envelope
//! - [`error`]: Error taxonomy
//! - [`fanin`]: Connection multiplexer, client sinks and inbound frames
//! - [`identifier`]: Conversation identifiers and partition resolution
//! - [`metrics`]: Relay counters
//! - [`publisher`]: Outbound sessions
//! - [`records`]: Durable record store seam
//! - [`subscriber`]: Inbound sessions

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod broker;
pub mod config;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod fanin;
pub mod identifier;
pub mod metrics;
pub mod publisher;
pub mod records;
pub mod relay;
pub mod subscriber;

// Re-exports for convenience
pub use broker::{Broker, BrokerError, InMemoryBroker, StartOffset};
pub use config::{load_config, ConfigError, ConfigOverrides, RelayConfig};
pub use delivery::{DeliveryError, DeliveryReceipt, MessageDelivery, SendRequest};
pub use envelope::MessageEnvelope;
pub use error::{ConnectionError, RelayError, TaskOrigin};
pub use fanin::{
    ChannelInbound, ChannelSink, ClientConnection, ConnectionFanIn, ConnectionId, InboundFrames,
    MessageSink, PushSink, SinkError,
};
pub use identifier::{resolve_partition, ConversationId, IdentifierError, UserId};
pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use publisher::{PublishMode, Publisher, PublisherSession};
pub use records::{InMemoryRecordStore, RecordError, RecordId, RecordStore};
pub use relay::Relay;
pub use subscriber::{SubscriberSession, SubscriptionManager};
