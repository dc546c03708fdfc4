//! Heartbeat supervision for an upstream session.

use std::time::Instant;

use crate::config::HeartbeatConfig;
use crate::protocol::codec::HEARTBEAT_MARKER;

/// Tracks when the session last wrote to and heard from the upstream.
///
/// Owned by the session read loop; reset on every new connection. Write
/// idleness is a diagnostic; read idleness tears the session down.
pub struct HeartbeatClock {
    last_sent: Instant,
    last_recv: Instant,
    config: HeartbeatConfig,
}

impl HeartbeatClock {
    pub fn new(config: HeartbeatConfig) -> Self {
        let now = Instant::now();
        Self {
            last_sent: now,
            last_recv: now,
            config,
        }
    }

    pub fn should_send(&self) -> bool {
        self.last_sent.elapsed() >= self.config.interval()
    }

    pub fn write_idle(&self) -> bool {
        self.last_sent.elapsed() >= self.config.write_idle_timeout()
    }

    pub fn read_idle(&self) -> bool {
        self.last_recv.elapsed() >= self.config.read_idle_timeout()
    }

    pub fn mark_sent(&mut self) {
        self.last_sent = Instant::now();
    }

    pub fn mark_recv(&mut self) {
        self.last_recv = Instant::now();
    }
}

/// True when a reassembled record is a heartbeat.
///
/// Heartbeats carry the fixed marker first; a trailing separator may be
/// present when the configured delimiter differs from the fixed literal.
pub fn is_heartbeat(record: &[u8]) -> bool {
    record.starts_with(&HEARTBEAT_MARKER)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::codec::SEPARATOR;

    fn config(interval: u64, write_idle: u64, read_idle: u64) -> HeartbeatConfig {
        HeartbeatConfig {
            interval_secs: interval,
            write_idle_timeout_secs: write_idle,
            read_idle_timeout_secs: read_idle,
        }
    }

    #[test]
    fn fresh_clock_is_quiet() {
        let clock = HeartbeatClock::new(config(10, 30, 60));

        assert!(!clock.should_send());
        assert!(!clock.write_idle());
        assert!(!clock.read_idle());
    }

    #[test]
    fn zero_thresholds_trip_immediately() {
        // A zero interval is rejected by config validation; the clock itself
        // treats elapsed >= threshold inclusively.
        let mut clock = HeartbeatClock::new(config(0, 0, 0));
        std::thread::sleep(Duration::from_millis(5));

        assert!(clock.should_send());
        assert!(clock.write_idle());
        assert!(clock.read_idle());

        clock.mark_sent();
        clock.mark_recv();
        // Marks move the baseline forward again.
        assert!(clock.last_sent.elapsed() < Duration::from_secs(1));
        assert!(clock.last_recv.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn heartbeat_records_are_recognized() {
        assert!(is_heartbeat(&HEARTBEAT_MARKER));

        let mut with_separator = HEARTBEAT_MARKER.to_vec();
        with_separator.extend_from_slice(&SEPARATOR);
        assert!(is_heartbeat(&with_separator));

        assert!(!is_heartbeat(b"data"));
        assert!(!is_heartbeat(&HEARTBEAT_MARKER[..4]));
        assert!(!is_heartbeat(&[]));
    }
}
