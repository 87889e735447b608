//! Serialization registry for task-data payloads.
//!
//! The registry is constructed once at engine startup and passed by
//! reference wherever task data is converted for persistence. It owns the
//! split of a task's data object into persistable slots: the plain JSON
//! slot and the script-environment slot (keys starting with `_`, which
//! scripts use for private scratch state).

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::hash::content_hash;

/// Persistable data slot names.
pub const SLOT_JSON_DATA: &str = "json_data";
pub const SLOT_SCRIPT_ENV: &str = "script_env";

type SlotFilter = fn(&Map<String, Value>) -> Map<String, Value>;

fn plain_keys(data: &Map<String, Value>) -> Map<String, Value> {
    data.iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn script_env_keys(data: &Map<String, Value>) -> Map<String, Value> {
    data.iter()
        .filter(|(k, _)| k.starts_with('_'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// A content-addressable payload extracted from task data.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotPayload {
    pub hash: String,
    pub payload: Value,
}

/// Maps task data to persisted payload slots. Construct once, share by
/// reference.
pub struct SerializationRegistry {
    filters: HashMap<&'static str, SlotFilter>,
}

impl SerializationRegistry {
    /// The standard registry: plain keys in `json_data`, underscore keys
    /// in `script_env`.
    pub fn standard() -> Self {
        let mut filters: HashMap<&'static str, SlotFilter> = HashMap::new();
        filters.insert(SLOT_JSON_DATA, plain_keys);
        filters.insert(SLOT_SCRIPT_ENV, script_env_keys);
        Self { filters }
    }

    /// Extract one slot from a task data object. Returns `None` when the
    /// slot is empty or unknown, so empty payloads never hit storage.
    pub fn extract(&self, slot: &str, data: &Value) -> Option<SlotPayload> {
        let filter = self.filters.get(slot)?;
        let object = data.as_object()?;
        let selected = filter(object);
        if selected.is_empty() {
            return None;
        }
        let payload = Value::Object(selected);
        Some(SlotPayload {
            hash: content_hash(&payload),
            payload,
        })
    }

    /// Reassemble task data from its persisted slots.
    pub fn assemble(&self, slots: &[Value]) -> Value {
        let mut merged = Map::new();
        for slot in slots {
            if let Some(object) = slot.as_object() {
                for (k, v) in object {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
        Value::Object(merged)
    }
}

impl Default for SerializationRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_plain_and_script_env_keys() {
        let registry = SerializationRegistry::standard();
        let data = json!({"amount": 5, "_scratch": [1, 2]});

        let plain = registry.extract(SLOT_JSON_DATA, &data).unwrap();
        assert_eq!(plain.payload, json!({"amount": 5}));

        let env = registry.extract(SLOT_SCRIPT_ENV, &data).unwrap();
        assert_eq!(env.payload, json!({"_scratch": [1, 2]}));
    }

    #[test]
    fn empty_slot_yields_none() {
        let registry = SerializationRegistry::standard();
        let data = json!({"amount": 5});
        assert!(registry.extract(SLOT_SCRIPT_ENV, &data).is_none());
        assert!(registry.extract(SLOT_JSON_DATA, &json!({})).is_none());
    }

    #[test]
    fn identical_payloads_share_a_hash() {
        let registry = SerializationRegistry::standard();
        let a = registry.extract(SLOT_JSON_DATA, &json!({"x": 1, "y": 2})).unwrap();
        let b = registry.extract(SLOT_JSON_DATA, &json!({"y": 2, "x": 1})).unwrap();
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn assemble_restores_merged_data() {
        let registry = SerializationRegistry::standard();
        let data = json!({"amount": 5, "_scratch": true});
        let plain = registry.extract(SLOT_JSON_DATA, &data).unwrap();
        let env = registry.extract(SLOT_SCRIPT_ENV, &data).unwrap();
        let restored = registry.assemble(&[plain.payload, env.payload]);
        assert_eq!(restored, data);
    }
}
