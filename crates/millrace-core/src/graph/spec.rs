//! Process spec tree: the parsed, static description of a process model.
//!
//! A `SpecBundle` holds one primary process plus any subprocess specs it
//! calls. Task kinds are a closed, compile-time set; dispatch happens by
//! matching on [`TaskKind`], never through a runtime type registry.
//!
//! Model files arrive through the `ModelSource` collaborator as canonical
//! JSON process-spec documents (BPMN XML parsing internals are an external
//! concern); `parse_model` deserializes and validates them into a bundle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while parsing or validating a process model.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("parse error in '{file}': {cause}")]
    Parse { file: String, cause: String },

    #[error("model has no process files")]
    Empty,

    #[error("process '{process}': task '{task}' references unknown flow target '{target}'")]
    UnknownFlowTarget {
        process: String,
        task: String,
        target: String,
    },

    #[error("process '{process}' has no start event")]
    NoStartEvent { process: String },

    #[error("duplicate process identifier '{0}' across model files")]
    DuplicateProcess(String),
}

// ---------------------------------------------------------------------------
// Task kinds
// ---------------------------------------------------------------------------

/// The closed set of node kinds a process spec can contain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Process entry point. A `message` start event waits for correlation
    /// instead of firing on instantiation.
    StartEvent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    EndEvent {},
    /// Pass-through task with no behavior of its own.
    NoneTask {},
    /// Waits for a human to acknowledge completion.
    ManualTask {},
    /// Waits for a human to complete it with input data.
    UserTask {},
    /// Evaluates expression assignments against task data.
    ScriptTask {
        /// Variable name -> expression, applied in key order.
        assignments: BTreeMap<String, String>,
    },
    /// Calls the external connector proxy.
    ServiceTask {
        operator: String,
        #[serde(default)]
        params: serde_json::Value,
        /// Variable the response body is stored under. Defaults to
        /// `operator_response`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_variable: Option<String>,
    },
    /// Takes exactly one outgoing flow based on conditions.
    ExclusiveGateway {
        /// Outgoing spec name -> condition expression. An outgoing flow
        /// without an entry here is the default flow.
        #[serde(default)]
        conditions: BTreeMap<String, String>,
    },
    /// Activates every outgoing flow.
    ParallelSplit {},
    /// Waits until every incoming flow has arrived.
    ParallelJoin {},
    /// Waits for a correlated message.
    MessageCatchEvent { message: String },
    /// Emits a message for cross-instance correlation.
    MessageThrowEvent { message: String },
    /// Waits until a wall-clock duration elapses.
    TimerCatchEvent { duration_secs: u64 },
    /// Invokes a subprocess spec.
    CallActivity { spec: String },
}

impl TaskKind {
    /// Whether the engine can complete a READY task of this kind on its
    /// own. User and manual tasks wait for human input.
    pub fn is_engine_kind(&self) -> bool {
        !matches!(self, Self::UserTask {} | Self::ManualTask {})
    }

    /// Short tag for logging and step results.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::StartEvent { .. } => "start_event",
            Self::EndEvent {} => "end_event",
            Self::NoneTask {} => "none_task",
            Self::ManualTask {} => "manual_task",
            Self::UserTask {} => "user_task",
            Self::ScriptTask { .. } => "script_task",
            Self::ServiceTask { .. } => "service_task",
            Self::ExclusiveGateway { .. } => "exclusive_gateway",
            Self::ParallelSplit {} => "parallel_split",
            Self::ParallelJoin {} => "parallel_join",
            Self::MessageCatchEvent { .. } => "message_catch_event",
            Self::MessageThrowEvent { .. } => "message_throw_event",
            Self::TimerCatchEvent { .. } => "timer_catch_event",
            Self::CallActivity { .. } => "call_activity",
        }
    }
}

// ---------------------------------------------------------------------------
// Task spec
// ---------------------------------------------------------------------------

/// Static description of one node within a process spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(flatten)]
    pub kind: TaskKind,
    /// Spec names of downstream nodes.
    #[serde(default)]
    pub outgoing: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
}

// ---------------------------------------------------------------------------
// Correlation properties
// ---------------------------------------------------------------------------

/// A named correlation key with the expression that extracts its value
/// from process or message data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationProperty {
    pub name: String,
    pub retrieval_expression: String,
}

// ---------------------------------------------------------------------------
// Process spec
// ---------------------------------------------------------------------------

/// The parsed static description of one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// BPMN process identifier.
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Node specs keyed by spec name. BTreeMap keeps serialization
    /// canonical so content hashes are stable.
    pub task_specs: BTreeMap<String, TaskSpec>,
    #[serde(default)]
    pub correlation_properties: Vec<CorrelationProperty>,
}

impl ProcessSpec {
    /// Spec names of this process's start events.
    pub fn start_specs(&self) -> Vec<&str> {
        self.task_specs
            .iter()
            .filter(|(_, spec)| matches!(spec.kind, TaskKind::StartEvent { .. }))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Number of flows pointing at `target`.
    pub fn incoming_count(&self, target: &str) -> usize {
        self.task_specs
            .values()
            .filter(|spec| spec.outgoing.iter().any(|o| o == target))
            .count()
    }

    /// Subprocess spec names referenced by call activities.
    pub fn called_subprocesses(&self) -> Vec<&str> {
        self.task_specs
            .values()
            .filter_map(|spec| match &spec.kind {
                TaskKind::CallActivity { spec } => Some(spec.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Message names of message start events.
    pub fn message_start_names(&self) -> Vec<&str> {
        self.task_specs
            .values()
            .filter_map(|spec| match &spec.kind {
                TaskKind::StartEvent { message: Some(m) } => Some(m.as_str()),
                _ => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Spec bundle
// ---------------------------------------------------------------------------

/// One primary process plus the subprocess specs it (transitively) calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecBundle {
    /// Identifier of the primary process.
    pub primary: String,
    /// All process specs keyed by identifier.
    pub processes: BTreeMap<String, ProcessSpec>,
}

impl SpecBundle {
    /// The primary process spec.
    pub fn primary_process(&self) -> &ProcessSpec {
        // Validated at parse time.
        &self.processes[&self.primary]
    }

    pub fn process(&self, identifier: &str) -> Option<&ProcessSpec> {
        self.processes.get(identifier)
    }

    pub fn task_spec(&self, process: &str, name: &str) -> Option<&TaskSpec> {
        self.processes.get(process)?.task_specs.get(name)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse model files into a validated spec bundle.
///
/// Each file holds one canonical JSON `ProcessSpec` document; the first
/// file's process is the primary. Validation checks flow-target integrity
/// and start-event presence for every process.
pub fn parse_model(files: &[(String, Vec<u8>)]) -> Result<SpecBundle, SpecError> {
    let mut processes = BTreeMap::new();
    let mut primary = None;

    for (filename, bytes) in files {
        let spec: ProcessSpec = serde_json::from_slice(bytes).map_err(|e| SpecError::Parse {
            file: filename.clone(),
            cause: e.to_string(),
        })?;
        if primary.is_none() {
            primary = Some(spec.identifier.clone());
        }
        if processes.contains_key(&spec.identifier) {
            return Err(SpecError::DuplicateProcess(spec.identifier));
        }
        processes.insert(spec.identifier.clone(), spec);
    }

    let primary = primary.ok_or(SpecError::Empty)?;
    let bundle = SpecBundle { primary, processes };
    validate_bundle(&bundle)?;
    Ok(bundle)
}

fn validate_bundle(bundle: &SpecBundle) -> Result<(), SpecError> {
    for (process_name, process) in &bundle.processes {
        if process.start_specs().is_empty() {
            return Err(SpecError::NoStartEvent {
                process: process_name.clone(),
            });
        }
        for (task_name, spec) in &process.task_specs {
            for target in &spec.outgoing {
                if !process.task_specs.contains_key(target) {
                    return Err(SpecError::UnknownFlowTarget {
                        process: process_name.clone(),
                        task: task_name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
