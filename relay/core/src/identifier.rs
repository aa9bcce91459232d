//! Conversation Identifiers and Partition Routing
//!
//! Conversations are keyed by ULIDs: 26 Crockford base32 characters whose
//! first 10 characters encode a 48-bit millisecond creation timestamp.
//! The timestamp is the only part of the identifier used for routing:
//!
//! ```text
//!   01HF6Y8Z00   ABCDEFGHJKMNPQRS
//!   \________/   \______________/
//!   timestamp     random suffix (ignored for routing)
//!        |
//!        v
//!   timestamp_ms % partition_count  ->  partition index
//! ```
//!
//! Every message of a conversation therefore lands on the same partition
//! while the partition count stays constant, which preserves per-conversation
//! ordering without a partition metadata table. When the count changes the
//! mapping changes too; nothing here tries to keep it stable.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Length of a textual ULID
pub const IDENTIFIER_LEN: usize = 26;

/// Errors produced while parsing identifiers or resolving partitions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    /// The input is not a well-formed time-ordered identifier
    #[error("invalid conversation identifier {input:?}: {reason}")]
    InvalidIdentifier { input: String, reason: String },

    /// Partition counts must be at least one
    #[error("partition count must be at least 1, got {0}")]
    InvalidPartitionCount(usize),
}

/// Identifier of a conversation, used as routing key and broker message key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationId(Ulid);

impl ConversationId {
    /// Parse a textual identifier
    pub fn parse(input: &str) -> Result<Self, IdentifierError> {
        if input.len() != IDENTIFIER_LEN {
            return Err(IdentifierError::InvalidIdentifier {
                input: input.to_string(),
                reason: format!("expected {IDENTIFIER_LEN} characters, got {}", input.len()),
            });
        }
        // 26 base32 characters carry 130 bits; a ULID has 128.
        if input.as_bytes()[0] > b'7' {
            return Err(IdentifierError::InvalidIdentifier {
                input: input.to_string(),
                reason: "value overflows 128 bits".to_string(),
            });
        }

        Ulid::from_string(input)
            .map(Self)
            .map_err(|e| IdentifierError::InvalidIdentifier {
                input: input.to_string(),
                reason: e.to_string(),
            })
    }

    /// Mint a fresh identifier stamped with the current time
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Build an identifier from an explicit timestamp and random suffix
    #[must_use]
    pub fn from_parts(timestamp_ms: u64, random: u128) -> Self {
        Self(Ulid::from_parts(timestamp_ms, random))
    }

    /// Embedded creation timestamp in milliseconds since the Unix epoch
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }

    /// Embedded creation time
    #[must_use]
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.timestamp_ms())
            .ok()
            .and_then(DateTime::from_timestamp_millis)
    }

    /// Partition this conversation routes to for the given partition count
    pub fn partition(&self, partition_count: usize) -> Result<usize, IdentifierError> {
        if partition_count == 0 {
            return Err(IdentifierError::InvalidPartitionCount(partition_count));
        }
        Ok((self.timestamp_ms() % partition_count as u64) as usize)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConversationId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ConversationId {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ConversationId> for String {
    fn from(id: ConversationId) -> Self {
        id.to_string()
    }
}

/// Resolve the partition for a textual conversation identifier
///
/// Pure function of the identifier's timestamp component and
/// `partition_count`. Fails with [`IdentifierError::InvalidIdentifier`] for
/// malformed input and [`IdentifierError::InvalidPartitionCount`] for a
/// count of zero.
pub fn resolve_partition(id: &str, partition_count: usize) -> Result<usize, IdentifierError> {
    if partition_count == 0 {
        return Err(IdentifierError::InvalidPartitionCount(partition_count));
    }
    ConversationId::parse(id)?.partition(partition_count)
}

/// Identifier of a user (message sender), opaque to the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
