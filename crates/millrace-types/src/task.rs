//! Task domain types for Millrace.
//!
//! A `Task` is one live node instance in a running process's task graph,
//! persisted as a normalized row. Its GUID matches the in-memory graph node.
//! The static node-type description lives in
//! [`crate::definition::TaskDefinition`]; a `Task` is one execution of it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// State of a task in the live graph.
///
/// `Maybe` and `Likely` are speculative states: the graph predicts the node
/// might exist (an un-taken gateway branch, a future loop iteration) but the
/// prediction may still be retracted. A speculative task must never be
/// persisted as a real child until it resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Future,
    Waiting,
    Ready,
    Started,
    Completed,
    Error,
    Cancelled,
    Maybe,
    Likely,
}

impl TaskState {
    /// True for `Completed`, `Error`, and `Cancelled`.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// True for the speculative `Maybe`/`Likely` states.
    pub fn is_predicted(&self) -> bool {
        matches!(self, Self::Maybe | Self::Likely)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Future => "FUTURE",
            Self::Waiting => "WAITING",
            Self::Ready => "READY",
            Self::Started => "STARTED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Maybe => "MAYBE",
            Self::Likely => "LIKELY",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Task properties blob
// ---------------------------------------------------------------------------

/// Structural properties of a task row.
///
/// Stored as a JSON blob on the row, NOT content-addressed: the parent/child
/// shape is unique per task, so deduplication would never hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProperties {
    /// GUID of the parent task (None only for the synthetic root).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Uuid>,
    /// Ordered child GUIDs. Every GUID listed here must correspond to a
    /// persisted task row in the same instance.
    #[serde(default)]
    pub children: Vec<Uuid>,
    /// BPMN identifier of the task spec this node instantiates.
    pub task_spec: String,
    /// Whether an attached boundary event has fired.
    #[serde(default)]
    pub triggered: bool,
    /// Engine-internal scratch data (loop counters, retry bookkeeping).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub internal_data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Task row
// ---------------------------------------------------------------------------

/// One persisted task-graph node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// GUID shared with the in-memory graph node.
    pub guid: Uuid,
    /// Owning process instance.
    pub process_instance_id: Uuid,
    /// The static node-type description this task instantiates.
    pub task_definition_id: Uuid,
    /// Current state in the task state machine.
    pub state: TaskState,
    /// Structural properties (parent, children, spec name, internal data).
    pub properties: TaskProperties,
    /// Content hash of the task's plain data snapshot, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_data_hash: Option<String>,
    /// Content hash of the script-environment-only data snapshot, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_env_data_hash: Option<String>,
    /// Wall-clock start of execution, seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_in_seconds: Option<f64>,
    /// Wall-clock end of execution, seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_in_seconds: Option<f64>,
}

impl Task {
    /// Seconds-since-epoch for `now`, used for start/end spans.
    pub fn now_in_seconds(now: DateTime<Utc>) -> f64 {
        now.timestamp_millis() as f64 / 1000.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
