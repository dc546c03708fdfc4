//! SQLite-backed queue store.

use async_trait::async_trait;
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqlitePool,
};

use crate::config::TargetConfig;
use crate::error::Error;
use crate::store::{Delivery, Message, QueueStore, RetryPolicy, Target};

#[derive(Clone)]
pub struct SqliteStore {
    db: SqlitePool,
    retry: RetryPolicy,
}

impl SqliteStore {
    pub async fn connect(path: &str, retry: RetryPolicy) -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { db: pool, retry })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn save_message(
        &self,
        payload: &[u8],
        source_label: Option<&str>,
    ) -> Result<i64, Error> {
        let mut tx = self.db.begin().await?;

        let message_id: i64 = sqlx::query_scalar(
            "
            INSERT INTO messages (source_ip, original_data, data_length, status, created_at)
            VALUES ($1, $2, $3, 'received', unixepoch('now'))
            RETURNING id
            ",
        )
        .bind(source_label)
        .bind(payload)
        .bind(payload.len() as i64)
        .fetch_one(&mut *tx)
        .await?;

        let targets: Vec<Target> = sqlx::query_as(
            "
            SELECT id, name, address, enabled, connection_timeout_sec,
                   max_retries, batch_size, priority, created_at
            FROM targets
            WHERE enabled = TRUE
            ORDER BY priority ASC, created_at ASC
            ",
        )
        .fetch_all(&mut *tx)
        .await?;

        for target in &targets {
            sqlx::query(
                "
                INSERT INTO deliveries
                    (message_id, target_server_id, target_server_name, target_address,
                     status, send_attempts, max_attempts, data_size, created_at, updated_at)
                VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6, unixepoch('now'), unixepoch('now'))
                ",
            )
            .bind(message_id)
            .bind(&target.id)
            .bind(&target.name)
            .bind(&target.address)
            .bind(target.max_retries)
            .bind(payload.len() as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(message_id, targets = targets.len(), "message persisted");

        Ok(message_id)
    }

    async fn claim_pending(&self, target_id: &str, limit: u32) -> Result<Vec<Message>, Error> {
        // `sending` rows with no due time are admitted too: a crash between
        // mark_sending and the send leaves them stranded otherwise. A live
        // worker never observes its own in-flight rows here because a tick
        // joins all its sends before the next claim.
        Ok(sqlx::query_as(
            "
            SELECT m.id, m.source_ip, m.original_data, m.data_length,
                   m.created_at, m.processed_at, m.status
            FROM messages m
            JOIN deliveries d ON m.id = d.message_id
            WHERE d.target_server_id = $1
              AND d.status IN ('pending', 'sending', 'failed')
              AND (d.next_retry_at IS NULL OR d.next_retry_at <= unixepoch('now'))
              AND d.send_attempts < d.max_attempts
            ORDER BY m.created_at ASC, m.id ASC
            LIMIT $2
            ",
        )
        .bind(target_id)
        .bind(limit as i64)
        .fetch_all(&mut *self.db.acquire().await?)
        .await?)
    }

    async fn mark_sending(
        &self,
        message_id: i64,
        target_id: &str,
        attempts: u32,
    ) -> Result<(), Error> {
        sqlx::query(
            "
            UPDATE deliveries
            SET status = 'sending', last_attempt_at = unixepoch('now'),
                send_attempts = $1, updated_at = unixepoch('now')
            WHERE message_id = $2 AND target_server_id = $3 AND status != 'sent'
            ",
        )
        .bind(attempts as i64)
        .bind(message_id)
        .bind(target_id)
        .execute(&mut *self.db.acquire().await?)
        .await?;

        Ok(())
    }

    async fn mark_sent(&self, message_id: i64, target_id: &str) -> Result<(), Error> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "
            UPDATE deliveries
            SET status = 'sent', sent_at = unixepoch('now'),
                last_error = NULL, updated_at = unixepoch('now')
            WHERE message_id = $1 AND target_server_id = $2 AND status != 'sent'
            ",
        )
        .bind(message_id)
        .bind(target_id)
        .execute(&mut *tx)
        .await?;

        // Terminal stamp once every delivery of the message has gone out.
        sqlx::query(
            "
            UPDATE messages
            SET processed_at = unixepoch('now'), status = 'processed'
            WHERE id = $1
              AND processed_at IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM deliveries
                  WHERE message_id = $1 AND status != 'sent'
              )
            ",
        )
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    async fn mark_failed(
        &self,
        message_id: i64,
        target_id: &str,
        attempts: u32,
        error: &str,
    ) -> Result<(), Error> {
        let delay = self.retry.delay_after(attempts);

        sqlx::query(
            "
            UPDATE deliveries
            SET status = 'failed', last_attempt_at = unixepoch('now'),
                send_attempts = $1,
                next_retry_at = unixepoch('now') + $2,
                last_error = $3, error_count = error_count + 1,
                updated_at = unixepoch('now')
            WHERE message_id = $4 AND target_server_id = $5 AND status != 'sent'
            ",
        )
        .bind(attempts as i64)
        .bind(delay.as_secs() as i64)
        .bind(error)
        .bind(message_id)
        .bind(target_id)
        .execute(&mut *self.db.acquire().await?)
        .await?;

        Ok(())
    }

    async fn get_attempts(&self, message_id: i64, target_id: &str) -> Result<u32, Error> {
        let attempts: i64 = sqlx::query_scalar(
            "
            SELECT send_attempts FROM deliveries
            WHERE message_id = $1 AND target_server_id = $2
            ",
        )
        .bind(message_id)
        .bind(target_id)
        .fetch_one(&mut *self.db.acquire().await?)
        .await?;

        Ok(attempts.max(0) as u32)
    }

    async fn reconcile_targets(&self, configured: &[TargetConfig]) -> Result<(), Error> {
        let mut tx = self.db.begin().await?;

        let existing: Vec<Target> = sqlx::query_as(
            "
            SELECT id, name, address, enabled, connection_timeout_sec,
                   max_retries, batch_size, priority, created_at
            FROM targets
            ",
        )
        .fetch_all(&mut *tx)
        .await?;

        for target in configured {
            let known = existing.iter().find(|t| t.id == target.id);
            match known {
                Some(stored) if !target_changed(stored, target) => {}
                Some(_) => {
                    sqlx::query(
                        "
                        UPDATE targets
                        SET name = $1, address = $2, enabled = $3,
                            connection_timeout_sec = $4, max_retries = $5,
                            batch_size = $6, priority = $7
                        WHERE id = $8
                        ",
                    )
                    .bind(&target.name)
                    .bind(&target.address)
                    .bind(target.enabled)
                    .bind(target.timeout_secs as i64)
                    .bind(target.max_retries as i64)
                    .bind(target.batch_size as i64)
                    .bind(target.priority as i64)
                    .bind(&target.id)
                    .execute(&mut *tx)
                    .await?;

                    tracing::info!(id = %target.id, address = %target.address, "updated target");
                }
                None => {
                    sqlx::query(
                        "
                        INSERT INTO targets
                            (id, name, address, enabled, connection_timeout_sec,
                             max_retries, batch_size, priority, created_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, unixepoch('now'))
                        ",
                    )
                    .bind(&target.id)
                    .bind(&target.name)
                    .bind(&target.address)
                    .bind(target.enabled)
                    .bind(target.timeout_secs as i64)
                    .bind(target.max_retries as i64)
                    .bind(target.batch_size as i64)
                    .bind(target.priority as i64)
                    .execute(&mut *tx)
                    .await?;

                    tracing::info!(id = %target.id, address = %target.address, "created target");
                }
            }
        }

        // Soft-disable anything no longer configured; targets are never
        // deleted so the ledger keeps its history.
        for stored in &existing {
            if !configured.iter().any(|t| t.id == stored.id) {
                sqlx::query("UPDATE targets SET enabled = FALSE WHERE id = $1")
                    .bind(&stored.id)
                    .execute(&mut *tx)
                    .await?;

                tracing::info!(id = %stored.id, "disabled target absent from configuration");
            }
        }

        tx.commit().await?;

        Ok(())
    }

    async fn list_enabled_targets(&self) -> Result<Vec<Target>, Error> {
        Ok(sqlx::query_as(
            "
            SELECT id, name, address, enabled, connection_timeout_sec,
                   max_retries, batch_size, priority, created_at
            FROM targets
            WHERE enabled = TRUE
            ORDER BY priority ASC, created_at ASC
            ",
        )
        .fetch_all(&mut *self.db.acquire().await?)
        .await?)
    }

    async fn delivery(
        &self,
        message_id: i64,
        target_id: &str,
    ) -> Result<Option<Delivery>, Error> {
        Ok(sqlx::query_as(
            "
            SELECT id, message_id, target_server_id, target_server_name, target_address,
                   status, send_attempts, max_attempts, last_attempt_at, next_retry_at,
                   sent_at, last_error, error_count, data_size, created_at, updated_at
            FROM deliveries
            WHERE message_id = $1 AND target_server_id = $2
            ",
        )
        .bind(message_id)
        .bind(target_id)
        .fetch_optional(&mut *self.db.acquire().await?)
        .await?)
    }
}

fn target_changed(stored: &Target, configured: &TargetConfig) -> bool {
    stored.name != configured.name
        || stored.address != configured.address
        || stored.enabled != configured.enabled
        || stored.connection_timeout_sec != configured.timeout_secs as i64
        || stored.max_retries != configured.max_retries as i64
        || stored.batch_size != configured.batch_size as i64
        || stored.priority != configured.priority as i64
}
