//! Process-instance queue and lock record.
//!
//! One `QueueEntry` per process instance serializes engine-step cycles
//! across workers: a worker must hold the lock before advancing the
//! instance. A stale lock (holder presumed crashed) may be confiscated
//! after a configured timeout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lock and scheduling record for one process instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    /// The instance this entry serializes (one entry per instance).
    pub process_instance_id: Uuid,
    /// Identifier of the worker currently holding the lock, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    /// When the current holder took the lock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    /// Earliest time a future (timer-delayed) execution should run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    /// Scheduling priority for future execution (lower runs first).
    #[serde(default)]
    pub priority: i32,
}

impl QueueEntry {
    /// An unlocked entry for a freshly created instance.
    pub fn unlocked(process_instance_id: Uuid) -> Self {
        Self {
            process_instance_id,
            locked_by: None,
            locked_at: None,
            run_at: None,
            priority: 0,
        }
    }

    /// Whether the lock is held and older than `confiscation_secs`, meaning
    /// another worker may forcibly reclaim it.
    pub fn is_stale(&self, now: DateTime<Utc>, confiscation_secs: u64) -> bool {
        match (self.locked_by.as_ref(), self.locked_at) {
            (Some(_), Some(locked_at)) => {
                (now - locked_at).num_seconds() >= confiscation_secs as i64
            }
            _ => false,
        }
    }
}
