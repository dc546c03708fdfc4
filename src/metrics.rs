//! Process counters, exposed as an injected capability so components never
//! reach for globals.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub trait MetricsSink: Send + Sync {
    /// A payload was received from upstream and persisted.
    fn message_received(&self);
    /// A delivery reached its target.
    fn message_forwarded(&self);
    /// A delivery attempt failed.
    fn message_error(&self);

    fn snapshot(&self) -> MetricsSnapshot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_forwarded: u64,
    pub message_errors: u64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received: {}, forwarded: {}, errors: {}",
            self.messages_received, self.messages_forwarded, self.message_errors
        )
    }
}

#[derive(Default)]
pub struct AtomicMetrics {
    received: AtomicU64,
    forwarded: AtomicU64,
    errors: AtomicU64,
}

impl MetricsSink for AtomicMetrics {
    fn message_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn message_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    fn message_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.received.load(Ordering::Relaxed),
            messages_forwarded: self.forwarded.load(Ordering::Relaxed),
            message_errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Discards everything; handy in tests.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn message_received(&self) {}
    fn message_forwarded(&self) {}
    fn message_error(&self) {}

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: 0,
            messages_forwarded: 0,
            message_errors: 0,
        }
    }
}
