//! Connection Fan-in Multiplexer
//!
//! Orchestrates one client connection: one forwarding task per conversation
//! the user belongs to, plus (bidirectional transports only) one task reading
//! client-submitted frames.
//!
//! # Architecture
//!
//! ```text
//!                 shutdown (caller)
//!                       │ child token
//!                       v
//!               ┌───────────────┐
//!               │  cancel token │ <──── any task failure / client close
//!               └───────┬───────┘
//!        ┌──────────────┼──────────────┬─────────────────┐
//!        v              v              v                 v
//!   forwarder[c1]  forwarder[c2]  forwarder[c3]      inbound task
//!        │              │              │           (validate, record,
//!        └──────────────┴──────┬───────┘            publish, compensate)
//!                              v
//!                         MessageSink
//! ```
//!
//! # Termination
//!
//! `run` joins every spawned task before returning; no task outlives the
//! connection. The first non-cancellation error is kept in a set-once cell
//! and returned as a [`ConnectionError`]. When several tasks fail at the same
//! time only one of their errors is reported. A single subscription failure
//! ends the whole connection.
//!
//! A connection with no conversations and no inbound source has no task to
//! wait on, so `run` returns `Ok(())` at once and the transport closes it
//! normally. Clients that join a conversation later reconnect to pick it up.

mod inbound;
mod sink;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use inbound::{ChannelInbound, InboundFrames};
pub use sink::{ChannelSink, MessageSink, PushSink, SinkError};

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::delivery::MessageDelivery;
use crate::error::{ConnectionError, RelayError, TaskOrigin};
use crate::identifier::{ConversationId, UserId};
use crate::metrics::RelayMetrics;
use crate::subscriber::SubscriptionManager;

/// Unique identifier for a client connection
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(format!("conn-{}", Uuid::new_v4()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the connection layer hands over for one client
pub struct ClientConnection {
    pub id: ConnectionId,
    pub user: UserId,
    pub sink: Arc<dyn MessageSink>,
    pub inbound: Option<Box<dyn InboundFrames>>,
    /// Caller-side shutdown; cancelling it ends the connection
    pub shutdown: CancellationToken,
}

impl ClientConnection {
    pub fn new(user: impl Into<UserId>, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            id: ConnectionId::new(),
            user: user.into(),
            sink,
            inbound: None,
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: ConnectionId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_inbound(mut self, inbound: Box<dyn InboundFrames>) -> Self {
        self.inbound = Some(inbound);
        self
    }

    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("inbound", &self.inbound.is_some())
            .finish_non_exhaustive()
    }
}

/// Set-once cell holding the first task failure of a connection
#[derive(Debug)]
struct FirstError {
    connection: ConnectionId,
    slot: OnceLock<(TaskOrigin, Arc<RelayError>)>,
}

impl FirstError {
    fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            slot: OnceLock::new(),
        }
    }

    /// Keep `error` if no other task got there first. Cancellation is never
    /// kept.
    fn record(&self, origin: TaskOrigin, error: RelayError) {
        if error.is_cancelled() {
            return;
        }
        if let Err((origin, error)) = self.slot.set((origin, Arc::new(error))) {
            tracing::debug!(
                connection = %self.connection,
                origin = %origin,
                error = %error,
                "Suppressed additional task error"
            );
        }
    }

    fn get(&self) -> Option<(TaskOrigin, Arc<RelayError>)> {
        self.slot.get().cloned()
    }
}

/// Shared state handed to every task of one connection
#[derive(Clone)]
struct TaskContext {
    cancel: CancellationToken,
    first_error: Arc<FirstError>,
    metrics: Arc<RelayMetrics>,
}

impl TaskContext {
    fn fail(&self, origin: TaskOrigin, error: RelayError) {
        self.first_error.record(origin, error);
        self.cancel.cancel();
    }
}

/// Runs client connections
#[derive(Clone, Debug)]
pub struct ConnectionFanIn {
    subscriptions: SubscriptionManager,
    delivery: MessageDelivery,
    metrics: Arc<RelayMetrics>,
}

impl ConnectionFanIn {
    pub fn new(subscriptions: SubscriptionManager, delivery: MessageDelivery) -> Self {
        Self {
            subscriptions,
            delivery,
            metrics: Arc::new(RelayMetrics::new()),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Serve `connection` until it is cancelled, the client goes away or a
    /// task fails. Returns only after every spawned task has exited.
    pub async fn run(
        &self,
        connection: ClientConnection,
        conversations: Vec<ConversationId>,
    ) -> Result<(), ConnectionError> {
        let ClientConnection {
            id,
            user,
            sink,
            inbound,
            shutdown,
        } = connection;

        let mut conversations = conversations;
        conversations.sort();
        conversations.dedup();

        let ctx = TaskContext {
            cancel: shutdown.child_token(),
            first_error: Arc::new(FirstError::new(id.clone())),
            metrics: Arc::clone(&self.metrics),
        };
        self.metrics.record_connection_opened();
        tracing::info!(
            connection = %id,
            user = %user,
            conversations = conversations.len(),
            inbound = inbound.is_some(),
            "Connection fan-in started"
        );

        let mut tasks = JoinSet::new();
        for conversation in conversations {
            let span = tracing::debug_span!("forwarder", conversation = %conversation);
            tasks.spawn(
                forward(
                    self.subscriptions.clone(),
                    conversation,
                    Arc::clone(&sink),
                    ctx.clone(),
                )
                .instrument(span),
            );
        }
        if let Some(frames) = inbound {
            let delivery = self.delivery.clone();
            let task_ctx = ctx.clone();
            let user = user.clone();
            tasks.spawn(
                async move {
                    if let Err(e) =
                        inbound::relay_inbound(frames, delivery, user, task_ctx.cancel.clone())
                            .await
                    {
                        task_ctx.fail(TaskOrigin::Inbound, e);
                    }
                }
                .instrument(tracing::debug_span!("inbound")),
            );
        }

        // Wait for the first trigger: cancellation, or tasks running out.
        while !tasks.is_empty() {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = joined {
                        ctx.fail(TaskOrigin::Supervisor, RelayError::TaskPanicked(e.to_string()));
                    }
                }
            }
        }

        // Join barrier: every task observes cancellation and exits.
        ctx.cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                ctx.first_error
                    .record(TaskOrigin::Supervisor, RelayError::TaskPanicked(e.to_string()));
            }
        }

        let outcome = ctx.first_error.get();
        self.metrics.record_connection_closed(outcome.is_some());
        match outcome {
            None => {
                tracing::info!(connection = %id, user = %user, "Connection fan-in finished");
                Ok(())
            }
            Some((origin, source)) => {
                tracing::error!(
                    connection = %id,
                    user = %user,
                    origin = %origin,
                    error = %source,
                    "Connection terminated by task failure"
                );
                Err(ConnectionError {
                    connection: id,
                    origin,
                    source,
                })
            }
        }
    }
}

/// Forward one conversation's envelopes into the shared sink
async fn forward(
    subscriptions: SubscriptionManager,
    conversation: ConversationId,
    sink: Arc<dyn MessageSink>,
    ctx: TaskContext,
) {
    let origin = TaskOrigin::Forwarder(conversation);
    // Opening touches the broker several times; shutdown must not wait on it.
    let opened = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return,
        opened = subscriptions.open(conversation, ctx.cancel.clone()) => opened,
    };
    let mut session = match opened {
        Ok(session) => session,
        Err(e) => {
            ctx.fail(origin, e);
            return;
        }
    };
    tracing::debug!(
        conversation = %conversation,
        created_at = ?conversation.created_at(),
        "Forwarding conversation"
    );

    loop {
        let envelope = match session.read().await {
            Ok(envelope) => envelope,
            Err(RelayError::Cancelled) => break,
            Err(e) => {
                ctx.fail(origin, e);
                break;
            }
        };

        // Nothing reaches the client once the connection is being torn down.
        let delivered = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            delivered = sink.deliver(&envelope) => delivered,
        };

        match delivered {
            Ok(()) => ctx.metrics.record_forwarded(),
            Err(SinkError::Closed) => {
                tracing::debug!(conversation = %conversation, "Client sink closed");
                ctx.cancel.cancel();
                break;
            }
            Err(e) => {
                ctx.fail(origin, e.into());
                break;
            }
        }
    }

    session.close().await;
}
