//! Fan-out of persisted messages to downstream targets: one worker per
//! enabled target, owned by the manager.

pub mod manager;
pub mod worker;

pub use manager::ForwarderManager;
pub use worker::TargetWorker;
