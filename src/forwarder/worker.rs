//! Per-target delivery worker.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::ForwarderConfig;
use crate::error::Error;
use crate::metrics::MetricsSink;
use crate::store::{Message, QueueStore, Target};

/// Delivers queued messages to one downstream target.
///
/// Exactly one worker exists per target id; it is the sole owner of status
/// transitions on that target's delivery rows.
#[derive(Clone)]
pub struct TargetWorker {
    target: Target,
    config: ForwarderConfig,
    store: Arc<dyn QueueStore>,
    metrics: Arc<dyn MetricsSink>,
    shutdown: CancellationToken,
}

impl TargetWorker {
    pub fn new(
        target: Target,
        config: ForwarderConfig,
        store: Arc<dyn QueueStore>,
        metrics: Arc<dyn MetricsSink>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            target,
            config,
            store,
            metrics,
            shutdown,
        }
    }

    pub async fn run(self) {
        tracing::info!(
            target_id = %self.target.id,
            name = %self.target.name,
            address = %self.target.address,
            "target worker started"
        );

        let mut ticker = tokio::time::interval(self.config.process_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.process_batch().await {
                        tracing::warn!(target_id = %self.target.id, error = %e, "batch failed");
                    }
                }
            }
        }

        tracing::info!(target_id = %self.target.id, "target worker stopped");
    }

    /// Claims one batch and sends it with bounded parallelism. Every spawned
    /// send is joined before this returns, so the next tick never overlaps
    /// in-flight work for the same target.
    async fn process_batch(&self) -> Result<(), Error> {
        let messages = self
            .store
            .claim_pending(&self.target.id, self.target.batch_size.max(1) as u32)
            .await?;

        if messages.is_empty() {
            return Ok(());
        }

        tracing::debug!(
            target_id = %self.target.id,
            count = messages.len(),
            "processing batch"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_processing_workers.max(1) as usize));
        let mut sends = JoinSet::new();

        for message in messages {
            if self.shutdown.is_cancelled() {
                break;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore is never closed");
            let worker = self.clone();
            sends.spawn(async move {
                let _permit = permit;
                worker.deliver(message).await;
            });
        }

        while sends.join_next().await.is_some() {}

        Ok(())
    }

    async fn deliver(&self, message: Message) {
        // The zero is a "sending" sentinel, not the attempt count; the true
        // count is read back on failure. During the send window the row
        // briefly shows send_attempts = 0.
        if let Err(e) = self.store.mark_sending(message.id, &self.target.id, 0).await {
            tracing::warn!(message_id = message.id, error = %e, "mark_sending failed");
            return;
        }

        match self.send_to_target(&message.original_data).await {
            Ok(()) => match self.store.mark_sent(message.id, &self.target.id).await {
                Ok(()) => {
                    self.metrics.message_forwarded();
                    tracing::debug!(
                        message_id = message.id,
                        target_id = %self.target.id,
                        bytes = message.data_length,
                        "message forwarded"
                    );
                }
                Err(e) => {
                    tracing::warn!(message_id = message.id, error = %e, "mark_sent failed");
                }
            },
            Err(e) => {
                tracing::warn!(
                    message_id = message.id,
                    target_id = %self.target.id,
                    error = %e,
                    "delivery failed"
                );

                let attempts = match self.store.get_attempts(message.id, &self.target.id).await {
                    Ok(attempts) => attempts,
                    Err(e) => {
                        tracing::warn!(message_id = message.id, error = %e, "get_attempts failed");
                        return;
                    }
                };

                if let Err(e) = self
                    .store
                    .mark_failed(message.id, &self.target.id, attempts + 1, &e.to_string())
                    .await
                {
                    tracing::warn!(message_id = message.id, error = %e, "mark_failed failed");
                }

                self.metrics.message_error();
            }
        }
    }

    /// One raw-TCP delivery: dial, write the payload verbatim, close. The
    /// configured per-target timeout bounds both the dial and the write.
    async fn send_to_target(&self, payload: &[u8]) -> Result<(), Error> {
        let deadline = self.target.timeout();
        let address = self.target.address.as_str();

        let mut stream = timeout(deadline, TcpStream::connect(address))
            .await
            .map_err(|_| Error::deliver(address, "connect timed out"))?
            .map_err(|e| Error::deliver(address, format!("connect failed: {e}")))?;

        timeout(deadline, stream.write_all(payload))
            .await
            .map_err(|_| Error::deliver(address, "write timed out"))?
            .map_err(|e| Error::deliver(address, format!("write failed: {e}")))?;

        let _ = stream.shutdown().await;

        Ok(())
    }
}
