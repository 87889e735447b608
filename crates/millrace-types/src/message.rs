//! Message instance domain types.
//!
//! A `MessageInstance` is one send or receive obligation tied to a process
//! instance. Instances are matched by the correlation service using
//! correlation-key equality; a `ready -> running` status flip committed
//! before any further work guarantees at-most-once delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Whether a message instance is the sending or the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Send,
    Receive,
}

/// Lifecycle of a message instance. Terminal once `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Ready,
    Running,
    Completed,
    Failed,
}

// ---------------------------------------------------------------------------
// Message instance
// ---------------------------------------------------------------------------

/// One send or receive obligation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageInstance {
    /// UUIDv7, so iteration in ascending id order is oldest-first.
    pub id: Uuid,
    /// Owning process instance.
    pub process_instance_id: Uuid,
    pub message_type: MessageType,
    /// BPMN message name. Send and receive sides match on name first.
    pub name: String,
    pub status: MessageStatus,
    /// Correlation-key values, name -> extracted value. A send matches a
    /// receive only if the full key sets are equal.
    #[serde(default)]
    pub correlation_keys: HashMap<String, serde_json::Value>,
    /// Message payload delivered to the receiving graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// The matched instance on the other side, once delivery completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterpart_id: Option<Uuid>,
    /// Human-readable cause when status is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_cause: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageInstance {
    /// Full correlation-key-set equality: same key names, equal values.
    pub fn correlates_with(&self, other: &MessageInstance) -> bool {
        self.name == other.name && self.correlation_keys == other.correlation_keys
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(
        message_type: MessageType,
        name: &str,
        keys: &[(&str, serde_json::Value)],
    ) -> MessageInstance {
        MessageInstance {
            id: Uuid::now_v7(),
            process_instance_id: Uuid::now_v7(),
            message_type,
            name: name.to_string(),
            status: MessageStatus::Ready,
            correlation_keys: keys
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            payload: None,
            counterpart_id: None,
            failure_cause: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn correlates_on_equal_key_sets() {
        let send = message(MessageType::Send, "invoice", &[("po_number", json!(1001))]);
        let recv = message(MessageType::Receive, "invoice", &[("po_number", json!(1001))]);
        assert!(send.correlates_with(&recv));
    }

    #[test]
    fn different_value_does_not_correlate() {
        let send = message(MessageType::Send, "invoice", &[("po_number", json!(1001))]);
        let recv = message(MessageType::Receive, "invoice", &[("po_number", json!(2002))]);
        assert!(!send.correlates_with(&recv));
    }

    #[test]
    fn extra_key_does_not_correlate() {
        let send = message(MessageType::Send, "invoice", &[("po_number", json!(1001))]);
        let recv = message(
            MessageType::Receive,
            "invoice",
            &[("po_number", json!(1001)), ("region", json!("emea"))],
        );
        assert!(!send.correlates_with(&recv));
    }

    #[test]
    fn different_name_does_not_correlate() {
        let send = message(MessageType::Send, "invoice", &[("po_number", json!(1001))]);
        let recv = message(MessageType::Receive, "payment", &[("po_number", json!(1001))]);
        assert!(!send.correlates_with(&recv));
    }

    #[test]
    fn status_serde_snake_case() {
        assert_eq!(serde_json::to_string(&MessageStatus::Ready).unwrap(), "\"ready\"");
        assert_eq!(serde_json::to_string(&MessageType::Receive).unwrap(), "\"receive\"");
    }
}
