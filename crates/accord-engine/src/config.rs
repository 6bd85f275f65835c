//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for one engine replica.
///
/// Every field has a default, so `{}` is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name of this replica, used in log fields.
    pub replica_id: String,
    /// Seconds between polls of each datasource.
    pub poll_interval_secs: u64,
    /// Seconds a single poll or webhook translation may take.
    pub poll_timeout_secs: u64,
    /// Seconds a single action dispatch may take.
    pub action_timeout_secs: u64,
    /// Times any single policy may be re-evaluated in one propagation before
    /// the propagation is abandoned.
    pub max_propagation_rounds: usize,
    /// Fixpoint iterations allowed per recursive stratum.
    pub max_fixpoint_iterations: usize,
    /// Buffered table-change notifications per subscriber.
    pub change_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            replica_id: "replica-0".to_string(),
            poll_interval_secs: 60,
            poll_timeout_secs: 30,
            action_timeout_secs: 30,
            max_propagation_rounds: 1000,
            max_fixpoint_iterations: accord_datalog::eval::DEFAULT_MAX_ITERATIONS,
            change_capacity: accord_datalog::store::DEFAULT_CHANGE_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    /// Config with a replica name, other fields defaulted.
    pub fn for_replica(replica_id: impl Into<String>) -> Self {
        Self {
            replica_id: replica_id.into(),
            ..Self::default()
        }
    }
}
