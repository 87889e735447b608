//! Process definition domain types.
//!
//! A `ProcessDefinition` is an immutable, content-hashed description of one
//! process. Identity is the hex SHA-256 of its canonical serialized form
//! (`single_process_hash`) plus a hash over the full process+subprocess
//! bundle (`full_process_model_hash`). Many instances may reference the
//! same definition; definitions are never mutated after insert.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum stored length for display names. Hashes are never truncated.
pub const MAX_DISPLAY_NAME_LEN: usize = 255;

// ---------------------------------------------------------------------------
// Process definition
// ---------------------------------------------------------------------------

/// An immutable, content-hashed process definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: Uuid,
    /// BPMN process identifier (unique within its model file).
    pub bpmn_identifier: String,
    /// Human-readable name, truncated to [`MAX_DISPLAY_NAME_LEN`].
    pub display_name: String,
    /// Hex SHA-256 of this process's own canonical spec.
    pub single_process_hash: String,
    /// Hex SHA-256 of the process together with all its subprocess specs.
    /// None for subprocess rows persisted only as bundle members.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_process_model_hash: Option<String>,
    /// The canonical serialized spec this definition was hashed from.
    pub spec_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ProcessDefinition {
    /// Truncate a display name to the storage width limit.
    pub fn truncate_display_name(name: &str) -> String {
        if name.len() <= MAX_DISPLAY_NAME_LEN {
            name.to_string()
        } else {
            let mut end = MAX_DISPLAY_NAME_LEN;
            while !name.is_char_boundary(end) {
                end -= 1;
            }
            name[..end].to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// Task definition
// ---------------------------------------------------------------------------

/// Static description of one node (task/gateway/event) within a definition.
/// Created at definition-persistence time, immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: Uuid,
    /// Owning process definition.
    pub process_definition_id: Uuid,
    /// BPMN identifier, unique within the owning definition.
    pub bpmn_identifier: String,
    /// Static node properties (kind, inputs, outputs, loop type, lane,
    /// lookahead hints) in canonical serialized form.
    pub properties: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Parent/subprocess relationship
// ---------------------------------------------------------------------------

/// An explicit parent -> subprocess edge between definitions.
///
/// Stored in a relationship table rather than inferred from hashes, because
/// identical subprocess content can be called from multiple distinct parents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionRelationship {
    pub parent_id: Uuid,
    pub child_id: Uuid,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
