//! Lifecycle of the per-target workers.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ForwarderConfig;
use crate::error::Error;
use crate::forwarder::TargetWorker;
use crate::metrics::MetricsSink;
use crate::store::QueueStore;

/// Owns one [`TargetWorker`] per enabled target, keyed by target id.
///
/// Ownership is one-directional: workers receive an immutable target
/// snapshot, a store handle, and a child cancellation token; nothing points
/// back at the manager. `stop` cancels the child token and joins every
/// worker before returning.
pub struct ForwarderManager {
    config: ForwarderConfig,
    store: Arc<dyn QueueStore>,
    metrics: Arc<dyn MetricsSink>,
    shutdown: CancellationToken,
    state: tokio::sync::Mutex<State>,
}

#[derive(Default)]
struct State {
    cancel: Option<CancellationToken>,
    workers: JoinSet<()>,
}

impl ForwarderManager {
    pub fn new(
        config: ForwarderConfig,
        store: Arc<dyn QueueStore>,
        metrics: Arc<dyn MetricsSink>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            metrics,
            shutdown,
            state: tokio::sync::Mutex::new(State::default()),
        }
    }

    /// Spawns one worker per enabled target. Idempotent: a second start on a
    /// running manager is a no-op.
    pub async fn start(&self) -> Result<usize, Error> {
        let mut state = self.state.lock().await;

        if state.cancel.is_some() {
            return Ok(state.workers.len());
        }

        let targets = self.store.list_enabled_targets().await?;
        let cancel = self.shutdown.child_token();

        for target in targets {
            let worker = TargetWorker::new(
                target,
                self.config.clone(),
                self.store.clone(),
                self.metrics.clone(),
                cancel.clone(),
            );
            state.workers.spawn(worker.run());
        }

        let count = state.workers.len();
        state.cancel = Some(cancel);

        tracing::info!(workers = count, "forwarder manager started");

        Ok(count)
    }

    /// Signals every worker and waits for all of them to exit. Idempotent.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;

        let Some(cancel) = state.cancel.take() else {
            return;
        };

        cancel.cancel();
        while state.workers.join_next().await.is_some() {}

        tracing::info!("forwarder manager stopped");
    }
}
