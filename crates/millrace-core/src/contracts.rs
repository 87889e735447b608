//! Collaborator contracts consumed by the engine.
//!
//! The engine treats its surroundings as external collaborators: process
//! model files come from a read-only [`ModelSource`], service tasks call
//! out through a [`ServiceConnector`], and instance lifecycle transitions
//! go through [`InstanceCallbacks`]. Production wiring supplies real
//! implementations; tests supply mocks.

use millrace_types::process::{ProcessInstance, ProcessInstanceStatus};
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Model source
// ---------------------------------------------------------------------------

/// Read-only source of process model definition files (filesystem or
/// git-backed).
pub trait ModelSource: Send + Sync {
    /// Load the definition files of a process model as
    /// `(filename, bytes)` pairs. The first file holds the primary process.
    fn load_definition_files(
        &self,
        process_model_identifier: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, ModelSourceError>;
}

/// Errors from the model source collaborator.
#[derive(Debug, Error)]
pub enum ModelSourceError {
    #[error("process model not found: {0}")]
    NotFound(String),

    #[error("model source I/O error: {0}")]
    Io(String),
}

// ---------------------------------------------------------------------------
// Service connector
// ---------------------------------------------------------------------------

/// JSON envelope returned by the connector proxy.
#[derive(Debug, Clone)]
pub struct ConnectorResponse {
    pub body: String,
    pub mimetype: String,
    pub http_status: u16,
}

/// Errors from connector invocation. These surface as task-level failures
/// (the task enters ERROR state), never as engine crashes.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("connector '{operator}' failed: {cause}")]
    Invocation { operator: String, cause: String },
}

/// Remote connector proxy invoked by service tasks.
pub trait ServiceConnector: Send + Sync {
    fn call_connector(
        &self,
        operator: &str,
        params: &Value,
        task_context: &Value,
    ) -> Result<ConnectorResponse, ConnectorError>;
}

/// Connector that fails every call. Used where service tasks are not
/// expected to run (e.g. correlation-only cycles in tests).
pub struct NoopConnector;

impl ServiceConnector for NoopConnector {
    fn call_connector(
        &self,
        operator: &str,
        _params: &Value,
        _task_context: &Value,
    ) -> Result<ConnectorResponse, ConnectorError> {
        Err(ConnectorError::Invocation {
            operator: operator.to_string(),
            cause: "no connector configured".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Instance lifecycle callbacks
// ---------------------------------------------------------------------------

/// Hooks owned by the instance-lifecycle collaborator.
///
/// `on_complete` runs when the graph reports overall completion and owns
/// the terminal status transition. `save` runs only when the caller asked
/// for a full-state save (persistence_level=full).
pub trait InstanceCallbacks: Send + Sync {
    /// Transition a finished instance to its terminal status.
    fn on_complete(&self, instance: &mut ProcessInstance, has_error_tasks: bool) {
        instance.status = if has_error_tasks {
            ProcessInstanceStatus::Error
        } else {
            ProcessInstanceStatus::Complete
        };
        instance.end_at = Some(chrono::Utc::now());
    }

    /// Instance-level full-state save hook. Default: nothing beyond the
    /// engine's own row updates.
    fn save(&self, _instance: &ProcessInstance) {}
}

/// Default lifecycle: terminal status transition only.
pub struct DefaultCallbacks;

impl InstanceCallbacks for DefaultCallbacks {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
