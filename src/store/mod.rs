//! The durable queue: message rows, the per-(message, target) delivery
//! ledger, and the reconciled target table.
//!
//! The store is presented as a trait so the relational adapter stays
//! swappable; [`sqlite::SqliteStore`] is the production implementation and
//! [`memory::MemoryStore`] backs tests.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::config::TargetConfig;
use crate::error::Error;

pub mod memory;
pub mod sqlite;

/// Per-(message, target) delivery state.
///
/// `Sent` is terminal; a row never leaves it. `Failed` with
/// `send_attempts >= max_attempts` is terminal too (dead-lettered in place).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

/// A persisted upstream payload. Created once by the ingest path; only the
/// terminal `processed_at` stamp is ever written afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: i64,
    pub source_ip: Option<String>,
    pub original_data: Vec<u8>,
    pub data_length: i64,
    pub created_at: i64,
    pub processed_at: Option<i64>,
    pub status: String,
}

/// One delivery-ledger row. Name and address are snapshots taken at message
/// ingest time, so later target renames do not rewrite history.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Delivery {
    pub id: i64,
    pub message_id: i64,
    pub target_server_id: String,
    pub target_server_name: String,
    pub target_address: String,
    pub status: DeliveryStatus,
    pub send_attempts: i64,
    pub max_attempts: i64,
    pub last_attempt_at: Option<i64>,
    pub next_retry_at: Option<i64>,
    pub sent_at: Option<i64>,
    pub last_error: Option<String>,
    pub error_count: i64,
    pub data_size: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A downstream endpoint as reconciled into the store.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Target {
    pub id: String,
    pub name: String,
    pub address: String,
    pub enabled: bool,
    pub connection_timeout_sec: i64,
    pub max_retries: i64,
    pub batch_size: i64,
    pub priority: i64,
    pub created_at: i64,
}

impl Target {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_sec.max(0) as u64)
    }
}

/// Exponential backoff: `min(base * 2^attempts, max)`.
pub fn backoff(base: Duration, max: Duration, attempts: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempts)).min(max)
}

/// The single retry schedule both the workers and the store observe. The
/// store is the only writer of `next_retry_at`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay to stamp after the `attempts`-th failure (1-indexed): the first
    /// failure waits `base`, doubling from there.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        backoff(self.base, self.max, attempts.saturating_sub(1))
    }
}

/// The queue interface the upstream client and the target workers consume.
///
/// Status transitions on a delivery row are owned exclusively by the one
/// worker responsible for its target id; the store enforces only that `sent`
/// never regresses.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persists a message and one `pending` delivery row per currently
    /// enabled target, atomically. Returns the assigned message id.
    async fn save_message(&self, payload: &[u8], source_label: Option<&str>)
        -> Result<i64, Error>;

    /// Returns up to `limit` messages whose delivery row for `target_id` is
    /// eligible, oldest first. Does not mark anything; claiming and marking
    /// are separate calls.
    async fn claim_pending(&self, target_id: &str, limit: u32) -> Result<Vec<Message>, Error>;

    async fn mark_sending(
        &self,
        message_id: i64,
        target_id: &str,
        attempts: u32,
    ) -> Result<(), Error>;

    /// Idempotent; also stamps the message's `processed_at` once every
    /// delivery for it has been sent.
    async fn mark_sent(&self, message_id: i64, target_id: &str) -> Result<(), Error>;

    async fn mark_failed(
        &self,
        message_id: i64,
        target_id: &str,
        attempts: u32,
        error: &str,
    ) -> Result<(), Error>;

    async fn get_attempts(&self, message_id: i64, target_id: &str) -> Result<u32, Error>;

    /// Upserts every configured target and soft-disables stored targets
    /// absent from the configuration, in one transaction.
    async fn reconcile_targets(&self, configured: &[TargetConfig]) -> Result<(), Error>;

    /// Enabled targets ordered by priority, then creation time.
    async fn list_enabled_targets(&self) -> Result<Vec<Target>, Error>;

    /// Ledger row lookup, for operational visibility.
    async fn delivery(&self, message_id: i64, target_id: &str)
        -> Result<Option<Delivery>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotone_and_bounded() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);

        let mut previous = Duration::ZERO;
        for attempts in 0..128 {
            let delay = backoff(base, max, attempts);
            assert!(delay >= previous);
            assert!(delay <= max);
            previous = delay;
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);

        assert_eq!(backoff(base, max, 0), Duration::from_secs(1));
        assert_eq!(backoff(base, max, 1), Duration::from_secs(2));
        assert_eq!(backoff(base, max, 4), Duration::from_secs(16));
        assert_eq!(backoff(base, max, 6), Duration::from_secs(60));
        assert_eq!(backoff(base, max, 100), Duration::from_secs(60));
    }

    #[test]
    fn retry_policy_matches_failure_schedule() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60));

        // Gaps observed across successive failures of one delivery.
        let gaps: Vec<u64> = (1..=5).map(|n| policy.delay_after(n).as_secs()).collect();
        assert_eq!(gaps, vec![1, 2, 4, 8, 16]);
    }
}
