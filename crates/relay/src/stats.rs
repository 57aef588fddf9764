//! Relay counters exposed on the health endpoint.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// The most recent broker fault.
#[derive(Debug, Clone, Serialize)]
pub struct LastFault {
    pub action: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
    pub lost_locks: u64,
    pub faults: u64,
    pub degraded: bool,
    pub last_fault: Option<LastFault>,
}

/// Counters shared by the handler, the fault handler and the health endpoint.
#[derive(Debug, Default)]
pub struct RelayStats {
    received: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    lost_locks: AtomicU64,
    faults: AtomicU64,
    degraded: AtomicBool,
    last_fault: Mutex<Option<LastFault>>,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// The downstream accepted the message but its lock was gone at completion.
    pub fn record_lost_lock(&self) {
        self.lost_locks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a broker fault and mark the relay degraded until the broker
    /// answers again.
    pub fn record_fault(&self, action: &str, error: &str) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        self.degraded.store(true, Ordering::Relaxed);

        // A poisoned lock only loses the fault detail; the counters above are
        // already updated.
        if let Ok(mut last) = self.last_fault.lock() {
            *last = Some(LastFault {
                action: action.to_string(),
                error: error.to_string(),
                at: Utc::now(),
            });
        }
    }

    /// Clear the degraded flag after a successful broker round trip.
    pub fn record_broker_ok(&self) {
        self.degraded.store(false, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            lost_locks: self.lost_locks.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            last_fault: self.last_fault.lock().ok().and_then(|last| last.clone()),
        }
    }
}
