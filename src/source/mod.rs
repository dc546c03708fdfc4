//! Upstream side of the bridge: the main/backup failover state machine and
//! the framed-protocol client session.

use async_trait::async_trait;

use crate::error::Error;

pub mod client;
pub mod failover;
pub mod ingest;

pub use client::SourceClient;
pub use failover::Failover;
pub use ingest::QueueIngest;

/// Receives every application payload read from the upstream link.
///
/// Decode failures still reach the sink (with the raw record) so no payload
/// is silently lost.
#[async_trait]
pub trait IngestSink: Send + Sync {
    async fn ingest(&self, payload: &[u8], source: &str) -> Result<(), Error>;
}
