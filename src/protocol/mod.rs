//! Wire protocol for the upstream link: the base-packet codec, the
//! delimiter-based packet reassembler, and the heartbeat supervisor.

pub mod codec;
pub mod delimiter;
pub mod heartbeat;
