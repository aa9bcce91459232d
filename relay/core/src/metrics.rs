//! Relay Metrics
//!
//! Lock-free counters shared by the publisher, the subscription manager and
//! the fan-in multiplexer:
//! - Envelopes forwarded to clients
//! - Publish acknowledgements and failures
//! - Compensating deletes
//! - Connection and subscription lifecycle

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one relay instance
#[derive(Debug, Default)]
pub struct RelayMetrics {
    envelopes_forwarded: AtomicU64,
    envelopes_skipped: AtomicU64,
    publishes_acknowledged: AtomicU64,
    publish_failures: AtomicU64,
    publish_retries: AtomicU64,
    compensations: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    connection_failures: AtomicU64,
    subscriptions_opened: AtomicU64,
    resubscriptions: AtomicU64,
}

/// Point-in-time copy of [`RelayMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub envelopes_forwarded: u64,
    pub envelopes_skipped: u64,
    pub publishes_acknowledged: u64,
    pub publish_failures: u64,
    pub publish_retries: u64,
    pub compensations: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connection_failures: u64,
    pub subscriptions_opened: u64,
    pub resubscriptions: u64,
}

impl MetricsSnapshot {
    /// Connections opened but not yet closed
    #[must_use]
    pub fn active_connections(&self) -> u64 {
        self.connections_opened
            .saturating_sub(self.connections_closed)
    }
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_forwarded(&self) {
        self.envelopes_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.envelopes_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish(&self, acknowledged: bool) {
        let counter = if acknowledged {
            &self.publishes_acknowledged
        } else {
            &self.publish_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.publish_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compensation(&self) {
        self.compensations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_closed(&self, failed: bool) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.connection_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_subscription(&self) {
        self.subscriptions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resubscription(&self) {
        self.resubscriptions.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            envelopes_forwarded: self.envelopes_forwarded.load(Ordering::Relaxed),
            envelopes_skipped: self.envelopes_skipped.load(Ordering::Relaxed),
            publishes_acknowledged: self.publishes_acknowledged.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
            compensations: self.compensations.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            subscriptions_opened: self.subscriptions_opened.load(Ordering::Relaxed),
            resubscriptions: self.resubscriptions.load(Ordering::Relaxed),
        }
    }
}
