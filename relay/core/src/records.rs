//! Durable-record collaborator boundary
//!
//! The relay never owns conversation or message storage. It needs four
//! things from whoever does: the conversations a user belongs to, a
//! membership check, a durable write that returns a record id, and a
//! compensating delete keyed by that id.
//!
//! [`InMemoryRecordStore`] backs the embedded daemon and the tests.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::identifier::{ConversationId, UserId};

#[derive(Debug, Error)]
pub enum RecordError {
    /// The store could not serve the request
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("record {0} not found")]
    NotFound(RecordId),

    #[error("failed to read seed file {path}: {source}")]
    SeedRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse seed file: {0}")]
    SeedParse(#[from] toml::de::Error),
}

/// Identifier of a durably recorded message, minted at write time
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A durably recorded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: RecordId,
    pub sender: UserId,
    pub conversation: ConversationId,
    pub message: String,
}

/// Operations the relay consumes from the durable-record collaborator
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Conversations `user` is a member of
    async fn conversations_for(&self, user: &UserId) -> Result<Vec<ConversationId>, RecordError>;

    async fn is_member(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<bool, RecordError>;

    /// Durably record a message, returning its record id
    async fn record_message(
        &self,
        sender: &UserId,
        conversation: &ConversationId,
        message: &str,
    ) -> Result<RecordId, RecordError>;

    /// Compensating delete of a previously recorded message
    async fn delete_message(&self, id: &RecordId) -> Result<(), RecordError>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default)]
    conversations: Vec<SeedConversation>,
}

#[derive(Debug, Deserialize)]
struct SeedConversation {
    id: ConversationId,
    #[serde(default)]
    members: Vec<String>,
}

/// DashMap-backed record store
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    members: DashMap<ConversationId, HashSet<UserId>>,
    messages: DashMap<RecordId, StoredMessage>,
    delete_calls: AtomicUsize,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a membership fixture:
    ///
    /// ```toml
    /// [[conversations]]
    /// id = "01HF6Y8Z00ABCDEFGHJKMNPQRS"
    /// members = ["alice", "bob"]
    /// ```
    pub fn from_seed(content: &str) -> Result<Self, RecordError> {
        let seed: SeedFile = toml::from_str(content)?;
        let store = Self::new();
        for conversation in seed.conversations {
            for member in conversation.members {
                store.add_member(conversation.id, UserId::new(member));
            }
        }
        tracing::info!(
            conversations = store.members.len(),
            "Seeded record store"
        );
        Ok(store)
    }

    pub async fn load_seed(path: &Path) -> Result<Self, RecordError> {
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| RecordError::SeedRead {
                    path: path.to_path_buf(),
                    source,
                })?;
        Self::from_seed(&content)
    }

    pub fn add_member(&self, conversation: ConversationId, user: UserId) {
        self.members.entry(conversation).or_default().insert(user);
    }

    /// Messages currently recorded for `conversation`
    #[must_use]
    pub fn messages_in(&self, conversation: &ConversationId) -> Vec<StoredMessage> {
        self.messages
            .iter()
            .filter(|entry| entry.conversation == *conversation)
            .map(|entry| entry.value().clone())
            .collect()
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Number of compensating deletes requested so far
    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn conversations_for(&self, user: &UserId) -> Result<Vec<ConversationId>, RecordError> {
        let mut conversations: Vec<ConversationId> = self
            .members
            .iter()
            .filter(|entry| entry.value().contains(user))
            .map(|entry| *entry.key())
            .collect();
        conversations.sort();
        Ok(conversations)
    }

    async fn is_member(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<bool, RecordError> {
        Ok(self
            .members
            .get(conversation)
            .is_some_and(|members| members.contains(user)))
    }

    async fn record_message(
        &self,
        sender: &UserId,
        conversation: &ConversationId,
        message: &str,
    ) -> Result<RecordId, RecordError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RecordError::Unavailable("writes disabled".to_string()));
        }
        let id = RecordId::generate();
        self.messages.insert(
            id.clone(),
            StoredMessage {
                id: id.clone(),
                sender: sender.clone(),
                conversation: *conversation,
                message: message.to_string(),
            },
        );
        Ok(id)
    }

    async fn delete_message(&self, id: &RecordId) -> Result<(), RecordError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(RecordError::Unavailable("deletes disabled".to_string()));
        }
        self.messages
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RecordError::NotFound(id.clone()))
    }
}
