//! In-memory task graph for one running process instance.
//!
//! The graph is an arena of tasks keyed by GUID; parent and children are
//! stored as GUID references, never pointers. Speculative (MAYBE/LIKELY)
//! nodes model branches the graph predicts might run; they are promoted to
//! real states when taken, discarded when not, and are never handed to
//! persistence as real children.
//!
//! Execution dispatches on the closed [`spec::TaskKind`] set. A task-level
//! failure (script error, connector failure) puts that one task in ERROR
//! and records it as a failing task; sibling branches keep running.

pub mod spec;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use millrace_types::task::TaskState;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::contracts::ServiceConnector;
use crate::expression::ExpressionEvaluator;
use spec::{SpecBundle, TaskKind, TaskSpec};

/// Spec name of the synthetic root task. The root anchors the tree and is
/// never persisted.
pub const ROOT_SPEC: &str = "__root__";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Engine-level graph failures: invariant violations, not task failures.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("task not found in graph: {0}")]
    TaskNotFound(Uuid),

    #[error("task spec '{spec}' not found in process '{process}'")]
    SpecNotFound { process: String, spec: String },

    #[error("task {guid} is in state {state}, expected READY")]
    NotReady { guid: Uuid, state: TaskState },

    #[error("no waiting receiver for message '{0}'")]
    NoWaitingReceiver(String),

    #[error("graph hydration failed: {0}")]
    Hydration(String),
}

// ---------------------------------------------------------------------------
// Graph task node
// ---------------------------------------------------------------------------

/// One node in the arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphTask {
    pub guid: Uuid,
    /// Identifier of the process scope this node belongs to.
    pub process: String,
    /// Spec name within that process.
    pub spec: String,
    pub state: TaskState,
    pub parent: Option<Uuid>,
    pub children: Vec<Uuid>,
    /// Task data snapshot (inherited from the parent at creation).
    pub data: Value,
    /// Engine-internal scratch (join arrivals, timer deadlines, errors).
    pub internal_data: Value,
    /// Whether an attached boundary trigger has fired.
    pub triggered: bool,
}

impl GraphTask {
    fn set_internal(&mut self, key: &str, value: Value) {
        if !self.internal_data.is_object() {
            self.internal_data = json!({});
        }
        if let Some(map) = self.internal_data.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }
}

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// A message produced by a throw event during an engine-step cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedMessage {
    pub name: String,
    pub payload: Value,
    pub correlation_keys: HashMap<String, Value>,
}

/// A waiting message catch (or message start) event eligible for a
/// receive-message registration.
#[derive(Debug, Clone)]
pub struct WaitingReceive {
    pub guid: Uuid,
    pub name: String,
    pub correlation_keys: HashMap<String, Value>,
}

/// What completing one task produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task finished and its successors were advanced.
    Completed,
    /// The task hit a business-logic failure and entered ERROR.
    Failed,
    /// The task stays STARTED (call activity waiting on its subprocess,
    /// or a lazy-load placeholder).
    InProgress,
}

/// External capabilities a completion dispatch may need.
pub struct ExecutionServices<'a> {
    pub connector: &'a dyn ServiceConnector,
    pub evaluator: &'a ExpressionEvaluator,
}

// ---------------------------------------------------------------------------
// Task graph
// ---------------------------------------------------------------------------

/// Arena task graph for one process instance.
#[derive(Debug)]
pub struct TaskGraph {
    bundle: Arc<SpecBundle>,
    tasks: HashMap<Uuid, GraphTask>,
    /// Creation order, for deterministic iteration.
    order: Vec<Uuid>,
    root: Uuid,
    /// Tasks that failed during this cycle, with causes.
    failing: Vec<(Uuid, String)>,
    emitted: Vec<EmittedMessage>,
}

impl TaskGraph {
    /// Start a new graph for the bundle's primary process.
    ///
    /// Plain start events become READY; message start events are not
    /// instantiated (they exist only for message-triggered starts).
    pub fn new(bundle: Arc<SpecBundle>, start_data: Value) -> Self {
        let mut graph = Self::empty(bundle, start_data);
        let primary = graph.bundle.primary.clone();
        let starts: Vec<(String, bool)> = graph
            .bundle
            .primary_process()
            .task_specs
            .iter()
            .filter_map(|(name, spec)| match &spec.kind {
                TaskKind::StartEvent { message } => Some((name.clone(), message.is_some())),
                _ => None,
            })
            .collect();
        let root = graph.root;
        let root_data = graph
            .tasks
            .get(&root)
            .map(|t| t.data.clone())
            .unwrap_or_else(|| json!({}));
        for (name, is_message) in starts {
            if !is_message {
                graph.create_task(&primary, &name, Some(root), TaskState::Ready, root_data.clone());
            }
        }
        graph
    }

    /// Start a new graph for a message-triggered instantiation.
    ///
    /// Only the start event listening for `message_name` is armed (WAITING,
    /// ready to catch); every alternative start branch is CANCELLED so that
    /// exactly one start trigger wins.
    pub fn new_for_message(bundle: Arc<SpecBundle>, message_name: &str) -> Self {
        let mut graph = Self::empty(bundle, json!({}));
        let primary = graph.bundle.primary.clone();
        let starts: Vec<(String, Option<String>)> = graph
            .bundle
            .primary_process()
            .task_specs
            .iter()
            .filter_map(|(name, spec)| match &spec.kind {
                TaskKind::StartEvent { message } => Some((name.clone(), message.clone())),
                _ => None,
            })
            .collect();
        let root = graph.root;
        for (name, message) in starts {
            let state = if message.as_deref() == Some(message_name) {
                TaskState::Waiting
            } else {
                TaskState::Cancelled
            };
            graph.create_task(&primary, &name, Some(root), state, json!({}));
        }
        graph
    }

    fn empty(bundle: Arc<SpecBundle>, start_data: Value) -> Self {
        let root_guid = Uuid::now_v7();
        let root = GraphTask {
            guid: root_guid,
            process: bundle.primary.clone(),
            spec: ROOT_SPEC.to_string(),
            state: TaskState::Started,
            parent: None,
            children: Vec::new(),
            data: if start_data.is_object() { start_data } else { json!({}) },
            internal_data: json!({}),
            triggered: false,
        };
        let mut tasks = HashMap::new();
        tasks.insert(root_guid, root);
        Self {
            bundle,
            tasks,
            order: vec![root_guid],
            root: root_guid,
            failing: Vec::new(),
            emitted: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn bundle(&self) -> &Arc<SpecBundle> {
        &self.bundle
    }

    pub fn root(&self) -> Uuid {
        self.root
    }

    pub fn task(&self, guid: &Uuid) -> Result<&GraphTask, GraphError> {
        self.tasks.get(guid).ok_or(GraphError::TaskNotFound(*guid))
    }

    fn task_mut(&mut self, guid: &Uuid) -> Result<&mut GraphTask, GraphError> {
        self.tasks
            .get_mut(guid)
            .ok_or(GraphError::TaskNotFound(*guid))
    }

    pub fn contains(&self, guid: &Uuid) -> bool {
        self.tasks.contains_key(guid)
    }

    fn spec_of(&self, task: &GraphTask) -> Result<&TaskSpec, GraphError> {
        self.bundle
            .task_spec(&task.process, &task.spec)
            .ok_or_else(|| GraphError::SpecNotFound {
                process: task.process.clone(),
                spec: task.spec.clone(),
            })
    }

    /// Spec kind of a task; the synthetic root has no spec.
    pub fn kind_of(&self, guid: &Uuid) -> Result<Option<&TaskKind>, GraphError> {
        let task = self.task(guid)?;
        if task.spec == ROOT_SPEC {
            return Ok(None);
        }
        Ok(Some(&self.spec_of(task)?.kind))
    }

    /// Tasks in creation order, root included.
    pub fn tasks_in_order(&self) -> impl Iterator<Item = &GraphTask> {
        self.order.iter().filter_map(|guid| self.tasks.get(guid))
    }

    /// READY tasks the engine can complete on its own, in creation order.
    pub fn ready_engine_tasks(&self) -> Vec<Uuid> {
        self.tasks_in_order()
            .filter(|t| t.state == TaskState::Ready && t.spec != ROOT_SPEC)
            .filter(|t| {
                self.bundle
                    .task_spec(&t.process, &t.spec)
                    .is_some_and(|s| s.kind.is_engine_kind())
            })
            .map(|t| t.guid)
            .collect()
    }

    /// Tasks a caller might act on: STARTED, READY, or WAITING.
    pub fn pending_tasks(&self) -> Vec<&GraphTask> {
        self.tasks_in_order()
            .filter(|t| {
                t.spec != ROOT_SPEC
                    && matches!(
                        t.state,
                        TaskState::Started | TaskState::Ready | TaskState::Waiting
                    )
            })
            .collect()
    }

    /// Call-activity tasks whose subprocess spec is not in the bundle.
    pub fn lazy_load_tasks(&self) -> Vec<&GraphTask> {
        self.tasks_in_order()
            .filter(|t| {
                t.internal_data
                    .get("lazy_load")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                    && !t.state.is_finished()
            })
            .collect()
    }

    /// Tasks in ERROR state with their recorded causes.
    pub fn error_tasks(&self) -> Vec<(&GraphTask, String)> {
        self.tasks_in_order()
            .filter(|t| t.state == TaskState::Error)
            .map(|t| {
                let cause = t
                    .internal_data
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("task failed")
                    .to_string();
                (t, cause)
            })
            .collect()
    }

    /// Failing tasks recorded during the current cycle (drains the list).
    pub fn drain_failing_tasks(&mut self) -> Vec<(Uuid, String)> {
        std::mem::take(&mut self.failing)
    }

    /// Messages thrown during the current cycle (drains the list).
    pub fn drain_emitted_messages(&mut self) -> Vec<EmittedMessage> {
        std::mem::take(&mut self.emitted)
    }

    /// The graph is complete when nothing can still run: no FUTURE,
    /// WAITING, READY, or STARTED task remains (the root aside).
    pub fn is_completed(&self) -> bool {
        !self.tasks.values().any(|t| {
            t.spec != ROOT_SPEC
                && matches!(
                    t.state,
                    TaskState::Future | TaskState::Waiting | TaskState::Ready | TaskState::Started
                )
        })
    }

    /// Final process data: the union of completed end-event data in the
    /// primary scope.
    pub fn final_data(&self) -> Value {
        let mut result = json!({});
        for task in self.tasks_in_order() {
            if task.process != self.bundle.primary || task.state != TaskState::Completed {
                continue;
            }
            if let Some(spec) = self.bundle.task_spec(&task.process, &task.spec)
                && matches!(spec.kind, TaskKind::EndEvent {})
            {
                merge_object(&mut result, &task.data);
            }
        }
        result
    }

    // -----------------------------------------------------------------------
    // Structural mutation
    // -----------------------------------------------------------------------

    fn create_task(
        &mut self,
        process: &str,
        spec_name: &str,
        parent: Option<Uuid>,
        state: TaskState,
        data: Value,
    ) -> Uuid {
        let guid = Uuid::now_v7();
        let task = GraphTask {
            guid,
            process: process.to_string(),
            spec: spec_name.to_string(),
            state,
            parent,
            children: Vec::new(),
            data,
            internal_data: json!({}),
            triggered: false,
        };
        self.tasks.insert(guid, task);
        self.order.push(guid);
        if let Some(parent_guid) = parent
            && let Some(parent_task) = self.tasks.get_mut(&parent_guid)
            && !parent_task.children.contains(&guid)
        {
            parent_task.children.push(guid);
        }
        guid
    }

    /// Remove a speculative task from the arena and from its parent's
    /// child list. Only predicted tasks may be discarded.
    pub fn discard_task(&mut self, guid: &Uuid) -> Result<(), GraphError> {
        let task = self.task(guid)?;
        debug_assert!(task.state.is_predicted());
        let parent = task.parent;
        if let Some(parent_guid) = parent
            && let Some(parent_task) = self.tasks.get_mut(&parent_guid)
        {
            parent_task.children.retain(|c| c != guid);
        }
        self.tasks.remove(guid);
        self.order.retain(|g| g != guid);
        Ok(())
    }

    /// Merge user-supplied data into a task (user-task completion input).
    pub fn merge_task_data(&mut self, guid: &Uuid, data: &Value) -> Result<(), GraphError> {
        let task = self.task_mut(guid)?;
        merge_object(&mut task.data, data);
        Ok(())
    }

    /// GUIDs from a task's parent up to, but not including, the root.
    pub fn ancestors(&self, guid: &Uuid) -> Vec<Uuid> {
        let mut result = Vec::new();
        let mut current = self.tasks.get(guid).and_then(|t| t.parent);
        while let Some(g) = current {
            if g == self.root {
                break;
            }
            result.push(g);
            current = self.tasks.get(&g).and_then(|t| t.parent);
        }
        result
    }

    /// GUIDs of all current descendants of a task.
    pub fn descendants(&self, guid: &Uuid) -> Vec<Uuid> {
        let mut result = Vec::new();
        let mut stack: Vec<Uuid> = self
            .tasks
            .get(guid)
            .map(|t| t.children.clone())
            .unwrap_or_default();
        while let Some(g) = stack.pop() {
            if let Some(task) = self.tasks.get(&g) {
                result.push(g);
                stack.extend(task.children.iter().copied());
            }
        }
        result
    }

    // -----------------------------------------------------------------------
    // Prediction
    // -----------------------------------------------------------------------

    /// Compute speculative descendants so gateway and branch shapes are
    /// known before a completion's effects apply.
    ///
    /// Unresolved exclusive-gateway branches become MAYBE children;
    /// parallel-split branches become LIKELY (they will run unless the
    /// split itself is abandoned).
    pub fn predict(&mut self) {
        let candidates: Vec<Uuid> = self
            .tasks_in_order()
            .filter(|t| {
                t.spec != ROOT_SPEC
                    && matches!(t.state, TaskState::Ready | TaskState::Waiting)
            })
            .map(|t| t.guid)
            .collect();

        for guid in candidates {
            let Some(task) = self.tasks.get(&guid) else { continue };
            let Some(spec) = self.bundle.task_spec(&task.process, &task.spec) else {
                continue;
            };
            let predicted_state = match spec.kind {
                TaskKind::ExclusiveGateway { .. } => TaskState::Maybe,
                TaskKind::ParallelSplit {} => TaskState::Likely,
                _ => continue,
            };
            let process = task.process.clone();
            let existing: Vec<String> = task
                .children
                .iter()
                .filter_map(|c| self.tasks.get(c))
                .map(|c| c.spec.clone())
                .collect();
            let targets: Vec<String> = spec
                .outgoing
                .iter()
                .filter(|t| !existing.contains(t))
                .cloned()
                .collect();
            for target in targets {
                self.create_task(&process, &target, Some(guid), predicted_state, json!({}));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Waiting-task refresh
    // -----------------------------------------------------------------------

    /// Re-evaluate WAITING tasks against wall-clock time: timer events
    /// whose deadline has passed become READY.
    pub fn refresh_waiting_tasks(&mut self, now: DateTime<Utc>) {
        let waiting: Vec<Uuid> = self
            .tasks_in_order()
            .filter(|t| t.state == TaskState::Waiting)
            .map(|t| t.guid)
            .collect();
        for guid in waiting {
            let Some(task) = self.tasks.get(&guid) else { continue };
            let Some(spec) = self.bundle.task_spec(&task.process, &task.spec) else {
                continue;
            };
            if !matches!(spec.kind, TaskKind::TimerCatchEvent { .. }) {
                continue;
            }
            let fire_at = task
                .internal_data
                .get("fire_at")
                .and_then(Value::as_i64)
                .unwrap_or(i64::MAX);
            if now.timestamp() >= fire_at
                && let Some(task) = self.tasks.get_mut(&guid)
            {
                tracing::debug!(guid = %guid, "timer fired");
                task.state = TaskState::Ready;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Message events
    // -----------------------------------------------------------------------

    /// Waiting message catch (and message start) events, with their
    /// expected correlation-key values extracted from current task data.
    pub fn waiting_receives(&self, evaluator: &ExpressionEvaluator) -> Vec<WaitingReceive> {
        let mut result = Vec::new();
        for task in self.tasks_in_order() {
            if task.state != TaskState::Waiting {
                continue;
            }
            let Some(spec) = self.bundle.task_spec(&task.process, &task.spec) else {
                continue;
            };
            let name = match &spec.kind {
                TaskKind::MessageCatchEvent { message } => message.clone(),
                TaskKind::StartEvent { message: Some(message) } => message.clone(),
                _ => continue,
            };
            let keys = self.correlation_keys_for(&task.process, &task.data, evaluator);
            result.push(WaitingReceive {
                guid: task.guid,
                name,
                correlation_keys: keys,
            });
        }
        result
    }

    /// Deliver a message payload to the first waiting receiver for `name`,
    /// making it READY. The caller runs an engine-step cycle afterwards to
    /// complete it.
    pub fn catch_message(&mut self, name: &str, payload: &Value) -> Result<Uuid, GraphError> {
        let target = self
            .tasks_in_order()
            .find(|t| {
                t.state == TaskState::Waiting
                    && self
                        .bundle
                        .task_spec(&t.process, &t.spec)
                        .is_some_and(|s| match &s.kind {
                            TaskKind::MessageCatchEvent { message } => message == name,
                            TaskKind::StartEvent { message: Some(m) } => m == name,
                            _ => false,
                        })
            })
            .map(|t| t.guid)
            .ok_or_else(|| GraphError::NoWaitingReceiver(name.to_string()))?;

        let task = self.task_mut(&target)?;
        merge_object(&mut task.data, payload);
        task.state = TaskState::Ready;
        tracing::debug!(guid = %target, message = name, "message caught");
        Ok(target)
    }

    fn correlation_keys_for(
        &self,
        process: &str,
        data: &Value,
        evaluator: &ExpressionEvaluator,
    ) -> HashMap<String, Value> {
        let Some(spec) = self.bundle.process(process) else {
            return HashMap::new();
        };
        spec.correlation_properties
            .iter()
            .map(|prop| {
                let value = evaluator
                    .evaluate(&prop.retrieval_expression, data)
                    .unwrap_or(Value::Null);
                (prop.name.clone(), value)
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Complete one READY task: run its kind-specific behavior and advance
    /// its successors. A business-logic failure turns into ERROR on this
    /// task only.
    pub fn complete_task(
        &mut self,
        guid: &Uuid,
        services: &ExecutionServices<'_>,
    ) -> Result<TaskOutcome, GraphError> {
        let task = self.task(guid)?;
        if task.state != TaskState::Ready {
            return Err(GraphError::NotReady {
                guid: *guid,
                state: task.state,
            });
        }
        let spec = self.spec_of(task)?.clone();
        let process = task.process.clone();
        let spec_name = task.spec.clone();
        let task_data = task.data.clone();

        self.task_mut(guid)?.state = TaskState::Started;

        // Kind-specific behavior. Err(cause) is a task failure, not an
        // engine failure.
        let selected: Result<Vec<String>, String> = match &spec.kind {
            TaskKind::StartEvent { .. }
            | TaskKind::EndEvent {}
            | TaskKind::NoneTask {}
            | TaskKind::ManualTask {}
            | TaskKind::UserTask {}
            | TaskKind::ParallelSplit {}
            | TaskKind::ParallelJoin {}
            | TaskKind::MessageCatchEvent { .. }
            | TaskKind::TimerCatchEvent { .. } => Ok(spec.outgoing.clone()),

            TaskKind::ScriptTask { assignments } => {
                match run_script(task_data, assignments, services) {
                    Ok(data) => {
                        self.task_mut(guid)?.data = data;
                        Ok(spec.outgoing.clone())
                    }
                    Err(cause) => Err(cause),
                }
            }

            TaskKind::ServiceTask {
                operator,
                params,
                result_variable,
            } => match run_service(&task_data, operator, params, services) {
                Ok(body) => {
                    let variable = result_variable.as_deref().unwrap_or("operator_response");
                    self.task_mut(guid)?.data[variable] = body;
                    Ok(spec.outgoing.clone())
                }
                Err(cause) => Err(cause),
            },

            TaskKind::ExclusiveGateway { conditions } => {
                pick_exclusive_flow(&task_data, &spec, conditions, services)
            }

            TaskKind::MessageThrowEvent { message } => {
                self.throw_message(guid, &process, message, &task_data, services);
                Ok(spec.outgoing.clone())
            }

            TaskKind::CallActivity { spec: sub_spec } => {
                return self.start_call_activity(guid, sub_spec, task_data);
            }
        };

        let selected = match selected {
            Ok(selected) => selected,
            Err(cause) => {
                self.fail_task(guid, &cause);
                return Ok(TaskOutcome::Failed);
            }
        };

        // Discard speculative children for branches that were not taken.
        let stale: Vec<Uuid> = self
            .task(guid)?
            .children
            .iter()
            .filter(|c| {
                self.tasks
                    .get(c)
                    .is_some_and(|child| child.state.is_predicted() && !selected.contains(&child.spec))
            })
            .copied()
            .collect();
        for child in stale {
            self.discard_task(&child)?;
        }

        for target in &selected {
            self.advance_to(guid, &process, target)?;
        }
        self.task_mut(guid)?.state = TaskState::Completed;
        tracing::debug!(guid = %guid, spec = %spec_name, "task completed");

        if matches!(spec.kind, TaskKind::EndEvent {}) {
            self.handle_scope_end(guid, &process)?;
        }
        Ok(TaskOutcome::Completed)
    }

    /// Mark a task failed with a cause and record it as a failing task so
    /// persistence never silently drops it.
    pub fn fail_task(&mut self, guid: &Uuid, cause: &str) {
        if let Some(task) = self.tasks.get_mut(guid) {
            task.state = TaskState::Error;
            task.set_internal("error", json!(cause));
            tracing::warn!(guid = %guid, cause, "task failed");
        }
        self.failing.push((*guid, cause.to_string()));
    }

    fn throw_message(
        &mut self,
        guid: &Uuid,
        process: &str,
        message: &str,
        data: &Value,
        services: &ExecutionServices<'_>,
    ) {
        let correlation_keys = self.correlation_keys_for(process, data, services.evaluator);
        tracing::debug!(guid = %guid, message, "message thrown");
        self.emitted.push(EmittedMessage {
            name: message.to_string(),
            payload: data.clone(),
            correlation_keys,
        });
    }

    fn start_call_activity(
        &mut self,
        guid: &Uuid,
        sub_spec: &str,
        data: Value,
    ) -> Result<TaskOutcome, GraphError> {
        let Some(subprocess) = self.bundle.process(sub_spec) else {
            // Subprocess spec not loaded; surface via lazy_load_tasks.
            self.task_mut(guid)?.set_internal("lazy_load", json!(true));
            return Ok(TaskOutcome::InProgress);
        };
        let starts: Vec<(String, bool)> = subprocess
            .task_specs
            .iter()
            .filter_map(|(name, spec)| match &spec.kind {
                TaskKind::StartEvent { message } => Some((name.clone(), message.is_some())),
                _ => None,
            })
            .collect();
        self.task_mut(guid)?.set_internal("subprocess", json!(sub_spec));
        for (name, is_message) in starts {
            if !is_message {
                self.create_task(sub_spec, &name, Some(*guid), TaskState::Ready, data.clone());
            }
        }
        Ok(TaskOutcome::InProgress)
    }

    /// Advance flow from a completing task to one outgoing target:
    /// promote a matching predicted child, join into an existing parallel
    /// join, or create a fresh child.
    fn advance_to(&mut self, from: &Uuid, process: &str, target: &str) -> Result<(), GraphError> {
        let target_spec = self
            .bundle
            .task_spec(process, target)
            .ok_or_else(|| GraphError::SpecNotFound {
                process: process.to_string(),
                spec: target.to_string(),
            })?
            .clone();
        let data = self.task(from)?.data.clone();

        if matches!(target_spec.kind, TaskKind::ParallelJoin {}) {
            return self.arrive_at_join(from, process, target, data);
        }

        // Promote an existing predicted child of the same spec.
        let predicted = self
            .task(from)?
            .children
            .iter()
            .find(|c| {
                self.tasks
                    .get(c)
                    .is_some_and(|child| child.spec == target && child.state.is_predicted())
            })
            .copied();
        if let Some(child_guid) = predicted {
            let state = self.initial_state(&target_spec.kind);
            let child = self.task_mut(&child_guid)?;
            child.state = state;
            child.data = data;
            self.arm_timer(&child_guid, &target_spec.kind);
            return Ok(());
        }

        let state = self.initial_state(&target_spec.kind);
        let guid = self.create_task(process, target, Some(*from), state, data);
        self.arm_timer(&guid, &target_spec.kind);
        Ok(())
    }

    fn initial_state(&self, kind: &TaskKind) -> TaskState {
        match kind {
            TaskKind::MessageCatchEvent { .. }
            | TaskKind::TimerCatchEvent { .. }
            | TaskKind::ParallelJoin {} => TaskState::Waiting,
            _ => TaskState::Ready,
        }
    }

    fn arm_timer(&mut self, guid: &Uuid, kind: &TaskKind) {
        if let TaskKind::TimerCatchEvent { duration_secs } = kind
            && let Some(task) = self.tasks.get_mut(guid)
        {
            let fire_at = Utc::now().timestamp() + *duration_secs as i64;
            task.set_internal("fire_at", json!(fire_at));
        }
    }

    fn arrive_at_join(
        &mut self,
        from: &Uuid,
        process: &str,
        target: &str,
        data: Value,
    ) -> Result<(), GraphError> {
        let existing = self
            .tasks_in_order()
            .find(|t| t.process == process && t.spec == target && !t.state.is_finished())
            .map(|t| t.guid);
        let join_guid = match existing {
            Some(guid) => {
                // Link the arriving branch to the shared join instance.
                let from_task = self.task_mut(from)?;
                if !from_task.children.contains(&guid) {
                    from_task.children.push(guid);
                }
                guid
            }
            None => self.create_task(process, target, Some(*from), TaskState::Waiting, json!({})),
        };

        let from_spec = self.task(from)?.spec.clone();
        let incoming = self
            .bundle
            .process(process)
            .map(|p| p.incoming_count(target))
            .unwrap_or(1);

        let join = self.task_mut(&join_guid)?;
        merge_object(&mut join.data, &data);
        let mut arrivals: Vec<Value> = join
            .internal_data
            .get("arrivals")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if !arrivals.iter().any(|v| v.as_str() == Some(&from_spec)) {
            arrivals.push(json!(from_spec));
        }
        let arrived = arrivals.len();
        join.set_internal("arrivals", Value::Array(arrivals));
        if arrived >= incoming {
            join.state = TaskState::Ready;
        }
        Ok(())
    }

    /// When an end event of a subprocess scope completes and nothing in
    /// that scope can still run, complete the owning call activity and
    /// advance its outgoing flows with the subprocess result data.
    fn handle_scope_end(&mut self, end_guid: &Uuid, scope: &str) -> Result<(), GraphError> {
        if scope == self.bundle.primary {
            return Ok(());
        }
        let still_running = self.tasks.values().any(|t| {
            t.process == scope
                && matches!(
                    t.state,
                    TaskState::Future | TaskState::Waiting | TaskState::Ready | TaskState::Started
                )
        });
        if still_running {
            return Ok(());
        }
        let end_data = self.task(end_guid)?.data.clone();
        let call_activity = self
            .tasks_in_order()
            .find(|t| {
                t.state == TaskState::Started
                    && t.internal_data.get("subprocess").and_then(Value::as_str) == Some(scope)
            })
            .map(|t| (t.guid, t.process.clone(), t.spec.clone()));
        let Some((ca_guid, ca_process, ca_spec)) = call_activity else {
            return Ok(());
        };
        merge_object(&mut self.task_mut(&ca_guid)?.data, &end_data);
        let outgoing = self
            .bundle
            .task_spec(&ca_process, &ca_spec)
            .map(|s| s.outgoing.clone())
            .unwrap_or_default();
        for target in &outgoing {
            self.advance_to(&ca_guid, &ca_process, target)?;
        }
        self.task_mut(&ca_guid)?.state = TaskState::Completed;
        tracing::debug!(guid = %ca_guid, scope, "call activity completed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    /// Opaque serialized snapshot of the full graph state.
    pub fn serialize(&self) -> Value {
        let tasks: Vec<&GraphTask> = self.tasks_in_order().collect();
        json!({
            "primary": self.bundle.primary,
            "root": self.root,
            "tasks": tasks,
        })
    }

    /// Rebuild a graph from a snapshot produced by [`Self::serialize`].
    pub fn hydrate(bundle: Arc<SpecBundle>, state: &Value) -> Result<Self, GraphError> {
        let root: Uuid = serde_json::from_value(
            state.get("root").cloned().unwrap_or(Value::Null),
        )
        .map_err(|e| GraphError::Hydration(format!("root: {e}")))?;
        let tasks: Vec<GraphTask> = serde_json::from_value(
            state.get("tasks").cloned().unwrap_or(Value::Null),
        )
        .map_err(|e| GraphError::Hydration(format!("tasks: {e}")))?;
        Self::from_parts(bundle, tasks, Some(root))
    }

    /// Rebuild a graph from task nodes, regenerating the synthetic root if
    /// `root` is absent (the database-hydration path; the root is never
    /// persisted, so depth-1 tasks arrive with no parent).
    pub fn from_parts(
        bundle: Arc<SpecBundle>,
        mut nodes: Vec<GraphTask>,
        root: Option<Uuid>,
    ) -> Result<Self, GraphError> {
        let root_guid = match root {
            Some(guid) => guid,
            None => {
                let guid = Uuid::now_v7();
                let orphans: Vec<Uuid> = nodes
                    .iter()
                    .filter(|t| t.parent.is_none())
                    .map(|t| t.guid)
                    .collect();
                for node in &mut nodes {
                    if node.parent.is_none() {
                        node.parent = Some(guid);
                    }
                }
                nodes.push(GraphTask {
                    guid,
                    process: bundle.primary.clone(),
                    spec: ROOT_SPEC.to_string(),
                    state: TaskState::Started,
                    parent: None,
                    children: orphans,
                    data: json!({}),
                    internal_data: json!({}),
                    triggered: false,
                });
                guid
            }
        };

        let mut order: Vec<Uuid> = nodes.iter().map(|t| t.guid).collect();
        // Deterministic order: root first, then UUIDv7 creation order.
        order.sort();
        if let Some(pos) = order.iter().position(|g| *g == root_guid) {
            order.remove(pos);
            order.insert(0, root_guid);
        }

        let tasks: HashMap<Uuid, GraphTask> =
            nodes.into_iter().map(|t| (t.guid, t)).collect();
        if !tasks.contains_key(&root_guid) {
            return Err(GraphError::Hydration("root task missing".to_string()));
        }
        for task in tasks.values() {
            for child in &task.children {
                if !tasks.contains_key(child) {
                    return Err(GraphError::Hydration(format!(
                        "task {} lists unknown child {}",
                        task.guid, child
                    )));
                }
            }
        }
        Ok(Self {
            bundle,
            tasks,
            order,
            root: root_guid,
            failing: Vec::new(),
            emitted: Vec::new(),
        })
    }
}

fn run_script(
    mut data: Value,
    assignments: &std::collections::BTreeMap<String, String>,
    services: &ExecutionServices<'_>,
) -> Result<Value, String> {
    for (variable, expression) in assignments {
        let value = services
            .evaluator
            .evaluate(expression, &data)
            .map_err(|e| format!("script assignment '{variable}': {e}"))?;
        data[variable.as_str()] = value;
    }
    Ok(data)
}

fn run_service(
    context: &Value,
    operator: &str,
    params: &Value,
    services: &ExecutionServices<'_>,
) -> Result<Value, String> {
    let response = services
        .connector
        .call_connector(operator, params, context)
        .map_err(|e| e.to_string())?;
    Ok(serde_json::from_str(&response.body).unwrap_or(Value::String(response.body)))
}

fn pick_exclusive_flow(
    data: &Value,
    spec: &TaskSpec,
    conditions: &std::collections::BTreeMap<String, String>,
    services: &ExecutionServices<'_>,
) -> Result<Vec<String>, String> {
    for target in &spec.outgoing {
        if let Some(condition) = conditions.get(target) {
            let taken = services
                .evaluator
                .evaluate_bool(condition, data)
                .map_err(|e| format!("gateway condition on '{target}': {e}"))?;
            if taken {
                return Ok(vec![target.clone()]);
            }
        }
    }
    // Fall back to the default flow (first outgoing without condition).
    spec.outgoing
        .iter()
        .find(|t| !conditions.contains_key(*t))
        .map(|t| vec![t.clone()])
        .ok_or_else(|| "no gateway condition matched and no default flow".to_string())
}

/// Merge `src` object entries into `dst`, overwriting existing keys.
pub fn merge_object(dst: &mut Value, src: &Value) {
    if !dst.is_object() {
        *dst = json!({});
    }
    if let (Some(dst_map), Some(src_map)) = (dst.as_object_mut(), src.as_object()) {
        for (k, v) in src_map {
            dst_map.insert(k.clone(), v.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{ConnectorError, ConnectorResponse, NoopConnector};
    use serde_json::json;

    fn bundle_from_json(doc: Value) -> Arc<SpecBundle> {
        let bytes = serde_json::to_vec(&doc).unwrap();
        Arc::new(spec::parse_model(&[("p.json".to_string(), bytes)]).unwrap())
    }

    fn simple_user_task_bundle() -> Arc<SpecBundle> {
        bundle_from_json(json!({
            "identifier": "p",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["ask"]},
                "ask": {"kind": "user_task", "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        }))
    }

    struct OkConnector(Value);
    impl ServiceConnector for OkConnector {
        fn call_connector(
            &self,
            _operator: &str,
            _params: &Value,
            _task_context: &Value,
        ) -> Result<ConnectorResponse, ConnectorError> {
            Ok(ConnectorResponse {
                body: self.0.to_string(),
                mimetype: "application/json".to_string(),
                http_status: 200,
            })
        }
    }

    fn run_to_quiescence(graph: &mut TaskGraph, connector: &dyn ServiceConnector) {
        let evaluator = ExpressionEvaluator::new();
        let services = ExecutionServices { connector, evaluator: &evaluator };
        for _ in 0..100 {
            let ready = graph.ready_engine_tasks();
            if ready.is_empty() {
                break;
            }
            for guid in ready {
                graph.complete_task(&guid, &services).unwrap();
            }
        }
    }

    #[test]
    fn start_event_becomes_ready_on_new_graph() {
        let graph = TaskGraph::new(simple_user_task_bundle(), json!({}));
        let ready = graph.ready_engine_tasks();
        assert_eq!(ready.len(), 1);
        assert_eq!(graph.task(&ready[0]).unwrap().spec, "start");
    }

    #[test]
    fn user_task_blocks_engine_until_completed() {
        let mut graph = TaskGraph::new(simple_user_task_bundle(), json!({}));
        run_to_quiescence(&mut graph, &NoopConnector);

        assert!(!graph.is_completed());
        let pending = graph.pending_tasks();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].spec, "ask");
        assert_eq!(pending[0].state, TaskState::Ready);

        // Complete the user task with input data.
        let guid = pending[0].guid;
        graph.merge_task_data(&guid, &json!({"x": 1})).unwrap();
        let evaluator = ExpressionEvaluator::new();
        let services = ExecutionServices { connector: &NoopConnector, evaluator: &evaluator };
        graph.complete_task(&guid, &services).unwrap();
        run_to_quiescence(&mut graph, &NoopConnector);

        assert!(graph.is_completed());
        assert_eq!(graph.final_data(), json!({"x": 1}));
    }

    #[test]
    fn script_task_assigns_variables() {
        let bundle = bundle_from_json(json!({
            "identifier": "p",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["calc"]},
                "calc": {"kind": "script_task", "assignments": {"doubled": "x * 2"}, "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        }));
        let mut graph = TaskGraph::new(bundle, json!({"x": 21}));
        run_to_quiescence(&mut graph, &NoopConnector);
        assert!(graph.is_completed());
        assert_eq!(graph.final_data()["doubled"], json!(42.0));
    }

    #[test]
    fn exclusive_gateway_takes_matching_branch() {
        let bundle = bundle_from_json(json!({
            "identifier": "p",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["decide"]},
                "decide": {
                    "kind": "exclusive_gateway",
                    "conditions": {"big": "amount > 100"},
                    "outgoing": ["big", "small"]
                },
                "big": {"kind": "script_task", "assignments": {"path": "'big'"}, "outgoing": ["end"]},
                "small": {"kind": "script_task", "assignments": {"path": "'small'"}, "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        }));
        let mut graph = TaskGraph::new(bundle, json!({"amount": 500}));
        run_to_quiescence(&mut graph, &NoopConnector);
        assert!(graph.is_completed());
        assert_eq!(graph.final_data()["path"], json!("big"));
        // The un-taken branch never became a real task.
        assert!(!graph.tasks_in_order().any(|t| t.spec == "small"));
    }

    #[test]
    fn predicted_gateway_children_pruned_when_branch_not_taken() {
        let bundle = bundle_from_json(json!({
            "identifier": "p",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["decide"]},
                "decide": {
                    "kind": "exclusive_gateway",
                    "conditions": {"yes": "go"},
                    "outgoing": ["yes", "no"]
                },
                "yes": {"kind": "none_task", "outgoing": ["end"]},
                "no": {"kind": "none_task", "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        }));
        let mut graph = TaskGraph::new(bundle, json!({"go": true}));
        let evaluator = ExpressionEvaluator::new();
        let services = ExecutionServices { connector: &NoopConnector, evaluator: &evaluator };

        // Complete the start event, then predict: both branches speculative.
        let start = graph.ready_engine_tasks()[0];
        graph.complete_task(&start, &services).unwrap();
        graph.predict();
        let speculative: Vec<String> = graph
            .tasks_in_order()
            .filter(|t| t.state.is_predicted())
            .map(|t| t.spec.clone())
            .collect();
        assert!(speculative.contains(&"yes".to_string()));
        assert!(speculative.contains(&"no".to_string()));

        run_to_quiescence(&mut graph, &NoopConnector);
        assert!(graph.is_completed());
        // The retracted branch is gone from the arena entirely.
        assert!(!graph.tasks_in_order().any(|t| t.spec == "no"));
        // No dangling child references anywhere.
        let guids: Vec<Uuid> = graph.tasks_in_order().map(|t| t.guid).collect();
        for task in graph.tasks_in_order() {
            for child in &task.children {
                assert!(guids.contains(child), "dangling child {child}");
            }
        }
    }

    #[test]
    fn parallel_split_and_join_merge_branch_data() {
        let bundle = bundle_from_json(json!({
            "identifier": "p",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["fork"]},
                "fork": {"kind": "parallel_split", "outgoing": ["a", "b"]},
                "a": {"kind": "script_task", "assignments": {"from_a": "1"}, "outgoing": ["join"]},
                "b": {"kind": "script_task", "assignments": {"from_b": "2"}, "outgoing": ["join"]},
                "join": {"kind": "parallel_join", "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        }));
        let mut graph = TaskGraph::new(bundle, json!({}));
        run_to_quiescence(&mut graph, &NoopConnector);
        assert!(graph.is_completed());
        let result = graph.final_data();
        assert_eq!(result["from_a"], json!(1.0));
        assert_eq!(result["from_b"], json!(2.0));
        // Exactly one join instance exists.
        assert_eq!(graph.tasks_in_order().filter(|t| t.spec == "join").count(), 1);
    }

    #[test]
    fn service_task_failure_errors_one_branch_only() {
        let bundle = bundle_from_json(json!({
            "identifier": "p",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["fork"]},
                "fork": {"kind": "parallel_split", "outgoing": ["call", "other"]},
                "call": {"kind": "service_task", "operator": "http/Get", "outgoing": ["join"]},
                "other": {"kind": "none_task", "outgoing": ["join"]},
                "join": {"kind": "parallel_join", "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        }));
        let mut graph = TaskGraph::new(bundle, json!({}));
        run_to_quiescence(&mut graph, &NoopConnector);

        let errors = graph.error_tasks();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0.spec, "call");
        // The healthy branch still reached the join.
        assert!(graph.tasks_in_order().any(|t| t.spec == "other" && t.state == TaskState::Completed));
        // The failed branch produced no descendants past the service task.
        let failed_guid = errors[0].0.guid;
        assert!(graph.descendants(&failed_guid).is_empty());
    }

    #[test]
    fn service_task_response_stored_under_result_variable() {
        let bundle = bundle_from_json(json!({
            "identifier": "p",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["call"]},
                "call": {
                    "kind": "service_task",
                    "operator": "http/Get",
                    "result_variable": "response",
                    "outgoing": ["end"]
                },
                "end": {"kind": "end_event"}
            }
        }));
        let mut graph = TaskGraph::new(bundle, json!({}));
        run_to_quiescence(&mut graph, &OkConnector(json!({"ok": true})));
        assert!(graph.is_completed());
        assert_eq!(graph.final_data()["response"], json!({"ok": true}));
    }

    #[test]
    fn throw_event_emits_message_with_correlation_keys() {
        let bundle = bundle_from_json(json!({
            "identifier": "p",
            "correlation_properties": [
                {"name": "po_number", "retrieval_expression": "po_number"}
            ],
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["send"]},
                "send": {"kind": "message_throw_event", "message": "invoice", "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        }));
        let mut graph = TaskGraph::new(bundle, json!({"po_number": 1001}));
        run_to_quiescence(&mut graph, &NoopConnector);
        let emitted = graph.drain_emitted_messages();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].name, "invoice");
        assert_eq!(emitted[0].correlation_keys["po_number"], json!(1001.0));
    }

    #[test]
    fn catch_event_waits_then_receives() {
        let bundle = bundle_from_json(json!({
            "identifier": "p",
            "correlation_properties": [
                {"name": "po_number", "retrieval_expression": "po_number"}
            ],
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["wait"]},
                "wait": {"kind": "message_catch_event", "message": "invoice", "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        }));
        let mut graph = TaskGraph::new(bundle, json!({"po_number": 1001}));
        run_to_quiescence(&mut graph, &NoopConnector);
        assert!(!graph.is_completed());

        let evaluator = ExpressionEvaluator::new();
        let receives = graph.waiting_receives(&evaluator);
        assert_eq!(receives.len(), 1);
        assert_eq!(receives[0].name, "invoice");
        assert_eq!(receives[0].correlation_keys["po_number"], json!(1001.0));

        graph.catch_message("invoice", &json!({"amount": 7})).unwrap();
        run_to_quiescence(&mut graph, &NoopConnector);
        assert!(graph.is_completed());
        assert_eq!(graph.final_data()["amount"], json!(7));
    }

    #[test]
    fn message_triggered_start_cancels_other_start_branches() {
        let bundle = bundle_from_json(json!({
            "identifier": "p",
            "task_specs": {
                "plain_start": {"kind": "start_event", "outgoing": ["end"]},
                "invoice_start": {"kind": "start_event", "message": "invoice", "outgoing": ["end"]},
                "other_start": {"kind": "start_event", "message": "refund", "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        }));
        let mut graph = TaskGraph::new_for_message(bundle, "invoice");
        let states: HashMap<String, TaskState> = graph
            .tasks_in_order()
            .filter(|t| t.spec != ROOT_SPEC)
            .map(|t| (t.spec.clone(), t.state))
            .collect();
        assert_eq!(states["invoice_start"], TaskState::Waiting);
        assert_eq!(states["plain_start"], TaskState::Cancelled);
        assert_eq!(states["other_start"], TaskState::Cancelled);

        graph.catch_message("invoice", &json!({"po_number": 1001})).unwrap();
        run_to_quiescence(&mut graph, &NoopConnector);
        assert!(graph.is_completed());
    }

    #[test]
    fn call_activity_runs_subprocess_inline() {
        let parent = serde_json::to_vec(&json!({
            "identifier": "parent",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["call"]},
                "call": {"kind": "call_activity", "spec": "child", "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        }))
        .unwrap();
        let child = serde_json::to_vec(&json!({
            "identifier": "child",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["work"]},
                "work": {"kind": "script_task", "assignments": {"done": "true"}, "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        }))
        .unwrap();
        let bundle = Arc::new(
            spec::parse_model(&[
                ("parent.json".to_string(), parent),
                ("child.json".to_string(), child),
            ])
            .unwrap(),
        );
        let mut graph = TaskGraph::new(bundle, json!({}));
        run_to_quiescence(&mut graph, &NoopConnector);
        assert!(graph.is_completed());
        assert_eq!(graph.final_data()["done"], json!(true));
    }

    #[test]
    fn call_activity_without_loaded_spec_reports_lazy_load() {
        let bundle = bundle_from_json(json!({
            "identifier": "p",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["call"]},
                "call": {"kind": "call_activity", "spec": "not_loaded", "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        }));
        let mut graph = TaskGraph::new(bundle, json!({}));
        run_to_quiescence(&mut graph, &NoopConnector);
        assert!(!graph.is_completed());
        let lazy = graph.lazy_load_tasks();
        assert_eq!(lazy.len(), 1);
        assert_eq!(lazy[0].spec, "call");
    }

    #[test]
    fn timer_event_fires_on_refresh() {
        let bundle = bundle_from_json(json!({
            "identifier": "p",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["wait"]},
                "wait": {"kind": "timer_catch_event", "duration_secs": 60, "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        }));
        let mut graph = TaskGraph::new(bundle, json!({}));
        run_to_quiescence(&mut graph, &NoopConnector);
        assert!(!graph.is_completed());

        // Not yet due.
        graph.refresh_waiting_tasks(Utc::now());
        assert!(graph.ready_engine_tasks().is_empty());

        // Past the deadline.
        graph.refresh_waiting_tasks(Utc::now() + chrono::Duration::seconds(120));
        run_to_quiescence(&mut graph, &NoopConnector);
        assert!(graph.is_completed());
    }

    #[test]
    fn serialize_hydrate_round_trip() {
        let mut graph = TaskGraph::new(simple_user_task_bundle(), json!({"seed": 1}));
        run_to_quiescence(&mut graph, &NoopConnector);

        let snapshot = graph.serialize();
        let hydrated = TaskGraph::hydrate(graph.bundle().clone(), &snapshot).unwrap();

        assert_eq!(hydrated.root(), graph.root());
        let original: Vec<&GraphTask> = graph.tasks_in_order().collect();
        let restored: Vec<&GraphTask> = hydrated.tasks_in_order().collect();
        assert_eq!(original.len(), restored.len());
        for (a, b) in original.iter().zip(restored.iter()) {
            assert_eq!(a, b);
        }
        assert_eq!(
            hydrated.pending_tasks().iter().map(|t| t.guid).collect::<Vec<_>>(),
            graph.pending_tasks().iter().map(|t| t.guid).collect::<Vec<_>>(),
        );
    }

    #[test]
    fn unknown_guid_is_a_graph_error() {
        let mut graph = TaskGraph::new(simple_user_task_bundle(), json!({}));
        let ghost = Uuid::now_v7();
        let evaluator = ExpressionEvaluator::new();
        let services = ExecutionServices { connector: &NoopConnector, evaluator: &evaluator };

        assert!(matches!(
            graph.complete_task(&ghost, &services),
            Err(GraphError::TaskNotFound(g)) if g == ghost
        ));
        assert!(matches!(
            graph.merge_task_data(&ghost, &json!({"x": 1})),
            Err(GraphError::TaskNotFound(g)) if g == ghost
        ));
        assert!(matches!(
            graph.catch_message("nothing-waits", &json!({})),
            Err(GraphError::NoWaitingReceiver(_))
        ));
    }

    #[test]
    fn hydrate_rejects_dangling_children() {
        let graph = TaskGraph::new(simple_user_task_bundle(), json!({}));
        let mut snapshot = graph.serialize();
        snapshot["tasks"][0]["children"]
            .as_array_mut()
            .unwrap()
            .push(json!(Uuid::now_v7()));
        let err = TaskGraph::hydrate(graph.bundle().clone(), &snapshot).unwrap_err();
        assert!(matches!(err, GraphError::Hydration(_)));
    }
}
