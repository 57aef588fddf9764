//! Subscription-level fault reporting.
//!
//! Faults raised by the broker outside any single message's processing (a
//! dropped connection, a failed receive) are logged here. The handler never
//! reconnects: the broker client owns reconnection.

use std::error::Error;
use std::sync::Arc;

use crate::stats::RelayStats;

/// Broker operation that was running when a fault occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    Subscribe,
    Reclaim,
    Receive,
    Complete,
    Close,
}

impl std::fmt::Display for FaultAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultAction::Subscribe => write!(f, "Subscribe"),
            FaultAction::Reclaim => write!(f, "Reclaim"),
            FaultAction::Receive => write!(f, "Receive"),
            FaultAction::Complete => write!(f, "Complete"),
            FaultAction::Close => write!(f, "Close"),
        }
    }
}

/// Logs broker faults with enough context to correlate with the broker.
#[derive(Clone)]
pub struct FaultHandler {
    endpoint: String,
    entity_path: String,
    stats: Arc<RelayStats>,
}

impl FaultHandler {
    pub fn new(
        endpoint: impl Into<String>,
        entity_path: impl Into<String>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            entity_path: entity_path.into(),
            stats,
        }
    }

    /// Report a fault. Infallible: nothing here can take the relay down.
    pub fn report(&self, action: FaultAction, error: &(dyn Error + 'static)) {
        let detail = error.to_string();

        tracing::error!(
            endpoint = %self.endpoint,
            entity_path = %self.entity_path,
            action = %action,
            error = %detail,
            "Subscription fault"
        );

        self.stats.record_fault(&action.to_string(), &detail);
    }

    /// Mark the broker reachable again after a successful operation.
    pub fn clear(&self) {
        self.stats.record_broker_ok();
    }
}
