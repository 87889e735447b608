//! Process instance domain types.
//!
//! A `ProcessInstance` is one execution of a process definition. Its status
//! transitions are driven exclusively by the workflow execution service.
//! A `BpmnProcess` is one running process scope (top-level or subprocess)
//! within an instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Instance status
// ---------------------------------------------------------------------------

/// Overall status of a process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessInstanceStatus {
    NotStarted,
    UserInputRequired,
    Waiting,
    Complete,
    Error,
    Suspended,
    Terminated,
}

impl ProcessInstanceStatus {
    /// Terminal statuses: `complete`, `error`, `terminated`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Terminated)
    }

    /// Whether an instance in this status may receive correlated messages.
    ///
    /// Terminal and suspended instances cannot accept delivery; a matched
    /// send is rolled back to `ready` and retried on a later sweep.
    pub fn accepts_messages(&self) -> bool {
        !self.is_terminal() && !matches!(self, Self::Suspended)
    }
}

// ---------------------------------------------------------------------------
// Process instance
// ---------------------------------------------------------------------------

/// One execution of a process definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInstance {
    /// UUIDv7 instance id.
    pub id: Uuid,
    /// Identifier of the process model this instance executes.
    pub process_model_identifier: String,
    /// The persisted, content-hashed definition being executed.
    pub process_definition_id: Uuid,
    /// Current status.
    pub status: ProcessInstanceStatus,
    /// Who started the instance (already-authorized caller identifier).
    pub initiator: String,
    /// When execution first started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
    /// When the instance reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// BPMN process scope
// ---------------------------------------------------------------------------

/// One running process scope (top-level or nested subprocess invocation)
/// within a process instance. Holds live correlation-key values snapshotted
/// from process data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BpmnProcess {
    pub id: Uuid,
    /// Owning process instance.
    pub process_instance_id: Uuid,
    /// Definition of this scope (may differ from the instance's top-level
    /// definition for subprocess scopes).
    pub process_definition_id: Uuid,
    /// Graph GUID of the scope's root task.
    pub guid: Uuid,
    /// Live correlation-key values, name -> extracted value.
    #[serde(default)]
    pub correlation_values: HashMap<String, serde_json::Value>,
    /// Whether this is the instance's top-level scope.
    pub top_level: bool,
    /// Content hash of the scope's top-level data snapshot, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
