//! Main/backup failover state machine.

use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::config::{SourceEndpoint, SourceServers};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Primary,
    Backup,
}

impl Slot {
    fn other(self) -> Self {
        match self {
            Self::Primary => Self::Backup,
            Self::Backup => Self::Primary,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Primary => 0,
            Self::Backup => 1,
        }
    }
}

struct Inner {
    current: Slot,
    failures: [u32; 2],
    last_failure: [Option<DateTime<Utc>>; 2],
}

/// Tracks per-endpoint failure counts and decides which endpoint the next
/// connection goes to. Dial results and probe results both feed it; the
/// in-flight session is never interrupted, a switchover only takes effect
/// at the next reconnection.
pub struct Failover {
    servers: SourceServers,
    inner: RwLock<Inner>,
}

impl Failover {
    pub fn new(servers: SourceServers) -> Self {
        Self {
            servers,
            inner: RwLock::new(Inner {
                current: Slot::Primary,
                failures: [0; 2],
                last_failure: [None; 2],
            }),
        }
    }

    fn endpoint(&self, slot: Slot) -> &SourceEndpoint {
        match slot {
            Slot::Primary => &self.servers.primary,
            Slot::Backup => &self.servers.backup,
        }
    }

    fn slot_of(&self, endpoint_id: &str) -> Option<Slot> {
        if endpoint_id == self.servers.primary.id {
            Some(Slot::Primary)
        } else if endpoint_id == self.servers.backup.id {
            Some(Slot::Backup)
        } else {
            None
        }
    }

    /// The endpoint the next dial should use.
    pub fn current(&self) -> SourceEndpoint {
        let inner = self.inner.read().expect("failover lock poisoned");
        self.endpoint(inner.current).clone()
    }

    pub fn failure_count(&self, endpoint_id: &str) -> u32 {
        let Some(slot) = self.slot_of(endpoint_id) else {
            return 0;
        };
        let inner = self.inner.read().expect("failover lock poisoned");
        inner.failures[slot.index()]
    }

    pub fn last_failure(&self, endpoint_id: &str) -> Option<DateTime<Utc>> {
        let slot = self.slot_of(endpoint_id)?;
        let inner = self.inner.read().expect("failover lock poisoned");
        inner.last_failure[slot.index()]
    }

    /// Records a failed connection attempt; switches to the peer once the
    /// endpoint's failover threshold is reached and the peer is enabled.
    pub fn connect_failed(&self, endpoint_id: &str) {
        let Some(slot) = self.slot_of(endpoint_id) else {
            return;
        };

        let mut inner = self.inner.write().expect("failover lock poisoned");
        inner.failures[slot.index()] += 1;
        inner.last_failure[slot.index()] = Some(Utc::now());

        let failures = inner.failures[slot.index()];
        tracing::warn!(
            endpoint = %self.endpoint(slot).name,
            failures,
            "recorded connection failure"
        );

        let threshold = self.endpoint(slot).failover_threshold;
        let other = slot.other();
        if inner.current == slot && failures >= threshold && self.endpoint(other).enabled {
            tracing::warn!(
                from = %self.endpoint(slot).name,
                to = %self.endpoint(other).name,
                "failing over"
            );
            inner.current = other;
        }
    }

    pub fn connect_succeeded(&self, endpoint_id: &str) {
        let Some(slot) = self.slot_of(endpoint_id) else {
            return;
        };

        let mut inner = self.inner.write().expect("failover lock poisoned");
        if inner.failures[slot.index()] > 0 {
            tracing::info!(endpoint = %self.endpoint(slot).name, "resetting failure count");
            inner.failures[slot.index()] = 0;
        }
    }

    /// Applies one round of health-probe results. `None` means the endpoint
    /// was not probed (disabled).
    pub fn apply_probe(&self, primary_healthy: Option<bool>, backup_healthy: Option<bool>) {
        let mut inner = self.inner.write().expect("failover lock poisoned");

        for (slot, healthy) in [
            (Slot::Primary, primary_healthy),
            (Slot::Backup, backup_healthy),
        ] {
            match healthy {
                Some(true) => inner.failures[slot.index()] = 0,
                Some(false) => {
                    inner.failures[slot.index()] += 1;
                    inner.last_failure[slot.index()] = Some(Utc::now());
                    tracing::warn!(
                        endpoint = %self.endpoint(slot).name,
                        failures = inner.failures[slot.index()],
                        "health probe failed"
                    );
                }
                None => {}
            }
        }

        // Unhealthy current endpoint: move to the peer.
        let current = inner.current;
        let threshold = self.endpoint(current).failover_threshold;
        if inner.failures[current.index()] >= threshold && self.endpoint(current.other()).enabled {
            tracing::warn!(
                from = %self.endpoint(current).name,
                to = %self.endpoint(current.other()).name,
                "failing over after health probes"
            );
            inner.current = current.other();
            return;
        }

        // On backup with a clean, enabled primary: fail back.
        if inner.current == Slot::Backup
            && inner.failures[Slot::Primary.index()] == 0
            && self.servers.primary.enabled
        {
            tracing::info!(
                from = %self.servers.backup.name,
                to = %self.servers.primary.name,
                "failing back to primary"
            );
            inner.current = Slot::Primary;
        }
    }
}
