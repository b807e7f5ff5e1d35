use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{MaatError, Result};

/// Tunables for conflict resolution and the wait queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ResolverConfig {
    /// When false no wait queue is used, even if one is supplied, and
    /// `WaitOnConflict` fails with a configuration error.
    pub enable_wait_queues: bool,
    /// When false deadlock signals delivered to the wait queue are ignored.
    pub enable_deadlock_detection: bool,
    /// Maximum number of transaction ids per status round-trip.
    pub status_batch_size: usize,
    /// How often the wait-queue poller re-checks blocker statuses.
    pub wait_queue_poll_interval: Duration,
    /// How long the poller tolerates an unreachable status authority before
    /// waking every waiter with `StatusUnavailable`.
    pub status_unreachable_timeout: Duration,
    /// How long finished transactions are remembered so that enqueueing
    /// against one that already finished does not wait.
    pub recently_finished_retention: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            enable_wait_queues: true,
            enable_deadlock_detection: true,
            status_batch_size: 64,
            wait_queue_poll_interval: Duration::from_millis(100),
            status_unreachable_timeout: Duration::from_secs(10),
            recently_finished_retention: Duration::from_secs(5),
        }
    }
}

impl ResolverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.status_batch_size == 0 {
            return Err(MaatError::Configuration(
                "status_batch_size must be positive".to_string(),
            ));
        }
        if self.wait_queue_poll_interval.is_zero() {
            return Err(MaatError::Configuration(
                "wait_queue_poll_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
