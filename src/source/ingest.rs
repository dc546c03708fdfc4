//! Bridges the upstream session into the durable queue.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::metrics::MetricsSink;
use crate::source::IngestSink;
use crate::store::QueueStore;

/// Persists every upstream payload and bumps the received counter.
pub struct QueueIngest {
    store: Arc<dyn QueueStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl QueueIngest {
    pub fn new(store: Arc<dyn QueueStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { store, metrics }
    }
}

#[async_trait]
impl IngestSink for QueueIngest {
    async fn ingest(&self, payload: &[u8], source: &str) -> Result<(), Error> {
        let message_id = self.store.save_message(payload, Some(source)).await?;
        self.metrics.message_received();

        tracing::debug!(message_id, bytes = payload.len(), source, "payload queued");

        Ok(())
    }
}
