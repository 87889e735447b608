//! Workflow execution service: the single entry point for advancing a
//! process instance.
//!
//! Every cycle follows the same shape: acquire the instance lock (fail
//! fast), hydrate the graph, optionally apply a human task completion, run
//! the chosen strategy, then persist. Persistence of whatever progress was
//! made happens even when the strategy fails partway; the error is
//! re-raised after the flush so completed sibling work is never lost.

use std::sync::Arc;

use chrono::Utc;
use millrace_types::config::EngineConfig;
use millrace_types::error::RepositoryError;
use millrace_types::message::{MessageInstance, MessageStatus, MessageType};
use millrace_types::process::{BpmnProcess, ProcessInstance, ProcessInstanceStatus};
use millrace_types::queue::QueueEntry;
use millrace_types::task::TaskState;
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::contracts::{InstanceCallbacks, ModelSource, ServiceConnector};
use crate::definitions::{CachedModel, DefinitionCache, DefinitionError};
use crate::engine::lock::{InstanceLock, InstanceLockService, LockError};
use crate::expression::ExpressionEvaluator;
use crate::graph::{ExecutionServices, GraphError, TaskGraph};
use crate::hash::content_hash;
use crate::persist::{
    hydrate_graph, MapperError, SerializationRegistry, TaskMapper, SLOT_JSON_DATA,
};
use crate::repository::EngineRepository;
use crate::strategy::{strategy_named, ExecutionStrategy, StrategyError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Engine-level failures. Task-level failures never appear here; they are
/// recorded on the task rows and reported through [`StepResult`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("process instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("task not found in instance graph: {0}")]
    TaskNotFound(Uuid),

    #[error("task {0} is engine-owned and cannot be completed by a caller")]
    TaskNotActionable(Uuid),

    #[error("engine steps attempted without holding the lock for instance {0}")]
    LockContract(Uuid),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Mapper(#[from] MapperError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Step result
// ---------------------------------------------------------------------------

/// One task a caller might act on or wait for.
#[derive(Debug, Clone)]
pub struct PendingTask {
    pub guid: Uuid,
    pub process: String,
    pub spec: String,
    pub kind: String,
    pub state: TaskState,
    pub display_name: Option<String>,
}

/// A task that entered ERROR during execution.
#[derive(Debug, Clone)]
pub struct ErrorTask {
    pub guid: Uuid,
    pub spec: String,
    pub cause: String,
}

/// Outcome of one engine-step cycle, as reported to the caller.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub instance_id: Uuid,
    pub status: ProcessInstanceStatus,
    pub completed: bool,
    /// Final process data when `completed`, empty object otherwise.
    pub result: Value,
    /// Opaque serialized graph snapshot, rehydratable via
    /// [`TaskGraph::hydrate`]. Lets callers carry state themselves instead
    /// of reading it back from storage.
    pub state: Value,
    pub pending_tasks: Vec<PendingTask>,
    /// Subprocess spec names referenced by call activities whose specs are
    /// not loaded in this model.
    pub lazy_load_specs: Vec<String>,
    pub error_tasks: Vec<ErrorTask>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Advances process instances under the per-instance lock.
pub struct WorkflowExecutionService<R, M: ModelSource> {
    repo: R,
    definitions: Arc<DefinitionCache<M>>,
    registry: Arc<SerializationRegistry>,
    evaluator: Arc<ExpressionEvaluator>,
    connector: Arc<dyn ServiceConnector>,
    callbacks: Arc<dyn InstanceCallbacks>,
    locks: InstanceLockService,
    config: EngineConfig,
}

impl<R: EngineRepository, M: ModelSource> WorkflowExecutionService<R, M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: R,
        definitions: Arc<DefinitionCache<M>>,
        connector: Arc<dyn ServiceConnector>,
        callbacks: Arc<dyn InstanceCallbacks>,
        worker_id: impl Into<String>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo,
            definitions,
            registry: Arc::new(SerializationRegistry::standard()),
            evaluator: Arc::new(ExpressionEvaluator::new()),
            connector,
            callbacks,
            locks: InstanceLockService::new(worker_id, config.clone()),
            config,
        }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn definitions(&self) -> &Arc<DefinitionCache<M>> {
        &self.definitions
    }

    // -----------------------------------------------------------------------
    // Instance lifecycle
    // -----------------------------------------------------------------------

    /// Create a new instance of a process model. No tasks exist until the
    /// first [`Self::advance`] call builds the graph.
    pub async fn start_instance(
        &self,
        process_model_identifier: &str,
        initiator: &str,
    ) -> Result<ProcessInstance, EngineError> {
        let model = self
            .definitions
            .persist(process_model_identifier, &self.repo)
            .await?;
        let now = Utc::now();
        let instance = ProcessInstance {
            id: Uuid::now_v7(),
            process_model_identifier: process_model_identifier.to_string(),
            process_definition_id: model.definition.id,
            status: ProcessInstanceStatus::NotStarted,
            initiator: initiator.to_string(),
            start_at: None,
            end_at: None,
            created_at: now,
            updated_at: now,
        };
        self.repo.create_instance(&instance).await?;
        self.repo
            .create_queue_entry(&QueueEntry::unlocked(instance.id))
            .await?;
        tracing::info!(
            instance = %instance.id,
            model = process_model_identifier,
            initiator,
            "process instance created"
        );
        Ok(instance)
    }

    /// Create an instance armed for message-triggered instantiation: the
    /// matching message start event waits, every alternative start branch
    /// is cancelled, and a receive registration row is written.
    pub async fn start_instance_for_message(
        &self,
        process_model_identifier: &str,
        message_name: &str,
        initiator: &str,
    ) -> Result<ProcessInstance, EngineError> {
        let model = self
            .definitions
            .persist(process_model_identifier, &self.repo)
            .await?;
        let mut instance = self
            .start_instance(process_model_identifier, initiator)
            .await?;

        let mut graph = TaskGraph::new_for_message(model.bundle.clone(), message_name);
        let mut mapper = TaskMapper::new(instance.id, model.index.clone());
        mapper.stage_all(&graph);
        mapper.flush(&graph, &self.repo, &self.registry).await?;
        self.create_top_level_scope(&instance, &model, &graph).await?;
        self.register_receives(&instance, &mut graph).await?;

        instance.status = ProcessInstanceStatus::Waiting;
        instance.updated_at = Utc::now();
        self.repo.update_instance(&instance).await?;
        Ok(instance)
    }

    // -----------------------------------------------------------------------
    // Advancing
    // -----------------------------------------------------------------------

    /// Run one engine-step cycle under the instance lock.
    ///
    /// `start_params` seeds the graph on the first cycle of a fresh
    /// instance. `completed_task` applies a human task completion (task
    /// GUID plus submitted data) before engine steps run. `save` asks for
    /// the instance-level full-state save callback at the end of the cycle.
    pub async fn advance(
        &self,
        instance_id: &Uuid,
        strategy_name: &str,
        start_params: Option<Value>,
        completed_task: Option<(Uuid, Value)>,
        save: bool,
    ) -> Result<StepResult, EngineError> {
        let strategy = strategy_named(strategy_name)?;
        let lock = self.locks.acquire(&self.repo, instance_id).await?;
        let outcome = self
            .advance_locked(&lock, instance_id, strategy.as_ref(), start_params, completed_task, save)
            .await;
        let released = self.locks.release(&self.repo, &lock).await;
        let result = outcome?;
        released?;
        Ok(result)
    }

    /// Deliver a correlated message payload to a waiting receiver in this
    /// instance and run a greedy cycle. Delivery never requests the
    /// full-state save callback; that is a caller opt-in on [`Self::advance`].
    pub async fn deliver_message(
        &self,
        instance_id: &Uuid,
        message_name: &str,
        payload: &Value,
    ) -> Result<StepResult, EngineError> {
        let strategy = strategy_named("greedy")?;
        let lock = self.locks.acquire(&self.repo, instance_id).await?;
        let outcome = self
            .deliver_locked(&lock, instance_id, strategy.as_ref(), message_name, payload)
            .await;
        let released = self.locks.release(&self.repo, &lock).await;
        let result = outcome?;
        released?;
        Ok(result)
    }

    async fn advance_locked(
        &self,
        lock: &InstanceLock,
        instance_id: &Uuid,
        strategy: &dyn ExecutionStrategy,
        start_params: Option<Value>,
        completed_task: Option<(Uuid, Value)>,
        save: bool,
    ) -> Result<StepResult, EngineError> {
        let (mut instance, model) = self.load_instance(instance_id).await?;
        let (mut graph, mut mapper, first_cycle) = self
            .hydrate(&instance, &model, start_params)
            .await?;
        if first_cycle {
            instance.start_at = Some(Utc::now());
            self.create_top_level_scope(&instance, &model, &graph).await?;
        }

        if let Some((guid, data)) = completed_task {
            self.apply_manual_completion(&mut graph, &mut mapper, &guid, &data)?;
        }

        self.do_engine_steps(lock, &mut instance, &model, &mut graph, &mut mapper, strategy, save)
            .await?;
        Ok(self.step_result(&instance, &graph))
    }

    async fn deliver_locked(
        &self,
        lock: &InstanceLock,
        instance_id: &Uuid,
        strategy: &dyn ExecutionStrategy,
        message_name: &str,
        payload: &Value,
    ) -> Result<StepResult, EngineError> {
        let (mut instance, model) = self.load_instance(instance_id).await?;
        let (mut graph, mut mapper, _) = self.hydrate(&instance, &model, None).await?;

        let guid = graph.catch_message(message_name, payload)?;
        mapper.on_task_did_complete(&graph, &guid);

        self.do_engine_steps(lock, &mut instance, &model, &mut graph, &mut mapper, strategy, false)
            .await?;
        Ok(self.step_result(&instance, &graph))
    }

    /// Run strategy steps and persist. Always flushes the mapper and
    /// updates the instance row, then re-raises any strategy error. The
    /// full-state save callback runs only when `save` is set.
    #[allow(clippy::too_many_arguments)]
    async fn do_engine_steps(
        &self,
        lock: &InstanceLock,
        instance: &mut ProcessInstance,
        model: &CachedModel,
        graph: &mut TaskGraph,
        mapper: &mut TaskMapper,
        strategy: &dyn ExecutionStrategy,
        save: bool,
    ) -> Result<(), EngineError> {
        // Programming contract: engine steps run only under this
        // instance's lock, within the expected hold window.
        if lock.instance_id != instance.id {
            return Err(EngineError::LockContract(instance.id));
        }
        self.locks.assert_within_hold(lock, Utc::now())?;

        graph.refresh_waiting_tasks(Utc::now());

        let services = ExecutionServices {
            connector: self.connector.as_ref(),
            evaluator: &self.evaluator,
        };
        let run_result = strategy.run(
            graph,
            mapper,
            &services,
            self.config.greedy_iteration_cap as usize,
        );

        let message_result = self.sync_messages(instance, graph).await;
        let scope_result = self.sync_scopes(instance, model, graph).await;
        let flush_result = mapper.flush(graph, &self.repo, &self.registry).await;

        let completed = graph.is_completed();
        if completed {
            let has_errors = !graph.error_tasks().is_empty();
            self.callbacks.on_complete(instance, has_errors);
            tracing::info!(
                instance = %instance.id,
                status = ?instance.status,
                "process instance finished"
            );
        } else {
            instance.status = if self.awaits_human_input(graph) {
                ProcessInstanceStatus::UserInputRequired
            } else {
                ProcessInstanceStatus::Waiting
            };
        }
        instance.updated_at = Utc::now();
        let update_result = self.repo.update_instance(instance).await;

        // Partial progress is already persisted; now surface failures in
        // severity order.
        run_result?;
        flush_result?;
        update_result?;
        message_result?;
        scope_result?;

        if completed {
            self.finish_top_level_scope(instance, model, graph).await?;
        }
        if save {
            self.callbacks.save(instance);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn load_instance(
        &self,
        instance_id: &Uuid,
    ) -> Result<(ProcessInstance, Arc<CachedModel>), EngineError> {
        let instance = self
            .repo
            .get_instance(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(*instance_id))?;
        let model = self
            .definitions
            .persist(&instance.process_model_identifier, &self.repo)
            .await?;
        Ok((instance, model))
    }

    async fn hydrate(
        &self,
        instance: &ProcessInstance,
        model: &CachedModel,
        start_params: Option<Value>,
    ) -> Result<(TaskGraph, TaskMapper, bool), EngineError> {
        let rows = self.repo.list_tasks(&instance.id).await?;
        let mut mapper = TaskMapper::new(instance.id, model.index.clone());
        if rows.is_empty() {
            let graph = TaskGraph::new(
                model.bundle.clone(),
                start_params.unwrap_or_else(|| json!({})),
            );
            mapper.stage_all(&graph);
            return Ok((graph, mapper, true));
        }
        let graph = hydrate_graph(
            model.bundle.clone(),
            &rows,
            &model.index,
            &self.repo,
            &self.registry,
        )
        .await?;
        Ok((graph, mapper, false))
    }

    fn apply_manual_completion(
        &self,
        graph: &mut TaskGraph,
        mapper: &mut TaskMapper,
        guid: &Uuid,
        data: &Value,
    ) -> Result<(), EngineError> {
        let kind = graph
            .kind_of(guid)
            .map_err(|_| EngineError::TaskNotFound(*guid))?;
        if kind.is_none_or(|k| k.is_engine_kind()) {
            return Err(EngineError::TaskNotActionable(*guid));
        }
        graph.merge_task_data(guid, data)?;
        mapper.on_task_will_complete(graph, guid);
        let services = ExecutionServices {
            connector: self.connector.as_ref(),
            evaluator: &self.evaluator,
        };
        graph.complete_task(guid, &services)?;
        mapper.on_task_did_complete(graph, guid);
        Ok(())
    }

    fn awaits_human_input(&self, graph: &TaskGraph) -> bool {
        graph.pending_tasks().iter().any(|t| {
            t.state == TaskState::Ready
                && graph
                    .kind_of(&t.guid)
                    .ok()
                    .flatten()
                    .is_some_and(|k| !k.is_engine_kind())
        })
    }

    /// Create send rows for thrown messages and receive registrations for
    /// newly waiting catch events, deduplicated per (instance, name).
    async fn sync_messages(
        &self,
        instance: &ProcessInstance,
        graph: &mut TaskGraph,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        for emitted in graph.drain_emitted_messages() {
            let message = MessageInstance {
                id: Uuid::now_v7(),
                process_instance_id: instance.id,
                message_type: MessageType::Send,
                name: emitted.name.clone(),
                status: MessageStatus::Ready,
                correlation_keys: emitted.correlation_keys,
                payload: Some(emitted.payload),
                counterpart_id: None,
                failure_cause: None,
                created_at: now,
                updated_at: now,
            };
            self.repo.create_message(&message).await?;
            tracing::debug!(instance = %instance.id, name = %emitted.name, "send message queued");
        }
        self.register_receives(instance, graph).await?;
        Ok(())
    }

    async fn register_receives(
        &self,
        instance: &ProcessInstance,
        graph: &mut TaskGraph,
    ) -> Result<(), EngineError> {
        let existing: Vec<String> = self
            .repo
            .list_messages(&instance.id)
            .await?
            .into_iter()
            .filter(|m| {
                m.message_type == MessageType::Receive && m.status == MessageStatus::Ready
            })
            .map(|m| m.name)
            .collect();
        let now = Utc::now();
        for receive in graph.waiting_receives(&self.evaluator) {
            if existing.contains(&receive.name) {
                continue;
            }
            let message = MessageInstance {
                id: Uuid::now_v7(),
                process_instance_id: instance.id,
                message_type: MessageType::Receive,
                name: receive.name.clone(),
                status: MessageStatus::Ready,
                correlation_keys: receive.correlation_keys,
                payload: None,
                counterpart_id: None,
                failure_cause: None,
                created_at: now,
                updated_at: now,
            };
            self.repo.create_message(&message).await?;
            tracing::debug!(instance = %instance.id, name = %receive.name, "receive registration queued");
        }
        Ok(())
    }

    /// Persist scope rows for subprocess invocations opened by call
    /// activities. One row per invocation, keyed by the call-activity
    /// task's GUID; rows already written in earlier cycles are left alone.
    async fn sync_scopes(
        &self,
        instance: &ProcessInstance,
        model: &CachedModel,
        graph: &TaskGraph,
    ) -> Result<(), EngineError> {
        let existing: Vec<Uuid> = self
            .repo
            .list_bpmn_processes(&instance.id)
            .await?
            .into_iter()
            .map(|scope| scope.guid)
            .collect();
        for task in graph.tasks_in_order() {
            let Some(scope_name) = task.internal_data.get("subprocess").and_then(Value::as_str)
            else {
                continue;
            };
            if existing.contains(&task.guid) {
                continue;
            }
            let Some(spec) = model.bundle.process(scope_name) else {
                continue;
            };
            let single_hash =
                content_hash(&serde_json::to_value(spec).unwrap_or_default());
            let definition_id = match self.repo.get_definition_by_single_hash(&single_hash).await? {
                Some(definition) => definition.id,
                None => model.definition.id,
            };
            let correlation_values = spec
                .correlation_properties
                .iter()
                .map(|prop| {
                    let value = self
                        .evaluator
                        .evaluate(&prop.retrieval_expression, &task.data)
                        .unwrap_or(Value::Null);
                    (prop.name.clone(), value)
                })
                .collect();
            let scope = BpmnProcess {
                id: Uuid::now_v7(),
                process_instance_id: instance.id,
                process_definition_id: definition_id,
                guid: task.guid,
                correlation_values,
                top_level: false,
                data_hash: None,
            };
            self.repo.create_bpmn_process(&scope).await?;
            tracing::debug!(
                instance = %instance.id,
                scope = scope_name,
                guid = %task.guid,
                "subprocess scope row created"
            );
        }
        Ok(())
    }

    async fn create_top_level_scope(
        &self,
        instance: &ProcessInstance,
        model: &CachedModel,
        graph: &TaskGraph,
    ) -> Result<(), EngineError> {
        let scope = BpmnProcess {
            id: Uuid::now_v7(),
            process_instance_id: instance.id,
            process_definition_id: model.definition.id,
            guid: graph.root(),
            correlation_values: Default::default(),
            top_level: true,
            data_hash: None,
        };
        self.repo.create_bpmn_process(&scope).await?;
        Ok(())
    }

    /// Snapshot the final data onto the top-level scope row once the
    /// instance finishes.
    async fn finish_top_level_scope(
        &self,
        instance: &ProcessInstance,
        model: &CachedModel,
        graph: &TaskGraph,
    ) -> Result<(), EngineError> {
        let final_data = graph.final_data();
        let mut data_hash = None;
        if let Some(slot) = self.registry.extract(SLOT_JSON_DATA, &final_data) {
            self.repo.put_blob(&slot.hash, &slot.payload).await?;
            data_hash = Some(slot.hash);
        }
        let correlation_values = model
            .bundle
            .primary_process()
            .correlation_properties
            .iter()
            .map(|prop| {
                let value = self
                    .evaluator
                    .evaluate(&prop.retrieval_expression, &final_data)
                    .unwrap_or(Value::Null);
                (prop.name.clone(), value)
            })
            .collect();

        for mut scope in self.repo.list_bpmn_processes(&instance.id).await? {
            if !scope.top_level {
                continue;
            }
            scope.data_hash = data_hash.clone();
            scope.correlation_values = correlation_values;
            self.repo.update_bpmn_process(&scope).await?;
            break;
        }
        Ok(())
    }

    fn step_result(&self, instance: &ProcessInstance, graph: &TaskGraph) -> StepResult {
        let completed = graph.is_completed();
        let pending_tasks = graph
            .pending_tasks()
            .iter()
            .map(|t| {
                let (kind, display_name) = graph
                    .bundle()
                    .task_spec(&t.process, &t.spec)
                    .map(|s| (s.kind.tag().to_string(), s.display_name.clone()))
                    .unwrap_or_default();
                PendingTask {
                    guid: t.guid,
                    process: t.process.clone(),
                    spec: t.spec.clone(),
                    kind,
                    state: t.state,
                    display_name,
                }
            })
            .collect();
        let lazy_load_specs = graph
            .lazy_load_tasks()
            .iter()
            .filter_map(|t| {
                match graph.kind_of(&t.guid) {
                    Ok(Some(crate::graph::spec::TaskKind::CallActivity { spec })) => {
                        Some(spec.clone())
                    }
                    _ => None,
                }
            })
            .collect();
        let error_tasks = graph
            .error_tasks()
            .into_iter()
            .map(|(t, cause)| ErrorTask {
                guid: t.guid,
                spec: t.spec.clone(),
                cause,
            })
            .collect();
        StepResult {
            instance_id: instance.id,
            status: instance.status,
            completed,
            result: if completed { graph.final_data() } else { json!({}) },
            state: graph.serialize(),
            pending_tasks,
            lazy_load_specs,
            error_tasks,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{DefaultCallbacks, ModelSourceError, NoopConnector};
    use crate::repository::memory::InMemoryEngineRepository;
    use std::collections::HashMap;

    struct MapSource(HashMap<String, Vec<(String, Vec<u8>)>>);

    impl ModelSource for MapSource {
        fn load_definition_files(
            &self,
            id: &str,
        ) -> Result<Vec<(String, Vec<u8>)>, ModelSourceError> {
            self.0
                .get(id)
                .cloned()
                .ok_or_else(|| ModelSourceError::NotFound(id.to_string()))
        }
    }

    fn service_with(
        models: &[(&str, Value)],
    ) -> WorkflowExecutionService<InMemoryEngineRepository, MapSource> {
        service_with_callbacks(models, Arc::new(DefaultCallbacks))
    }

    fn service_with_callbacks(
        models: &[(&str, Value)],
        callbacks: Arc<dyn InstanceCallbacks>,
    ) -> WorkflowExecutionService<InMemoryEngineRepository, MapSource> {
        let mut map = HashMap::new();
        for (id, doc) in models {
            map.insert(
                id.to_string(),
                vec![(format!("{id}.json"), serde_json::to_vec(doc).unwrap())],
            );
        }
        WorkflowExecutionService::new(
            InMemoryEngineRepository::default(),
            Arc::new(DefinitionCache::new(MapSource(map))),
            Arc::new(NoopConnector),
            callbacks,
            "worker-test",
            EngineConfig::default(),
        )
    }

    fn approval_model() -> Value {
        json!({
            "identifier": "approval",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["review"]},
                "review": {"kind": "user_task", "display_name": "Review request", "outgoing": ["decide"]},
                "decide": {
                    "kind": "exclusive_gateway",
                    "conditions": {"approved_end": "approved"},
                    "outgoing": ["approved_end", "rejected_end"]
                },
                "approved_end": {"kind": "end_event"},
                "rejected_end": {"kind": "end_event"}
            }
        })
    }

    #[tokio::test]
    async fn instance_runs_to_user_task_then_completes() {
        let engine = service_with(&[("hr/approval", approval_model())]);
        let instance = engine.start_instance("hr/approval", "alice").await.unwrap();
        assert_eq!(instance.status, ProcessInstanceStatus::NotStarted);

        // First cycle stops at the user task.
        let step = engine
            .advance(&instance.id, "greedy", Some(json!({"request": "laptop"})), None, false)
            .await
            .unwrap();
        assert!(!step.completed);
        assert_eq!(step.status, ProcessInstanceStatus::UserInputRequired);
        let review = step
            .pending_tasks
            .iter()
            .find(|t| t.spec == "review")
            .unwrap();
        assert_eq!(review.kind, "user_task");
        assert_eq!(review.display_name.as_deref(), Some("Review request"));

        // Human completes the task; the gateway resolves and the instance
        // finishes.
        let step = engine
            .advance(
                &instance.id,
                "greedy",
                None,
                Some((review.guid, json!({"approved": true}))),
                false,
            )
            .await
            .unwrap();
        assert!(step.completed);
        assert_eq!(step.status, ProcessInstanceStatus::Complete);
        assert_eq!(step.result["approved"], json!(true));
        assert_eq!(step.result["request"], json!("laptop"));

        let stored = engine
            .repo()
            .get_instance(&instance.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ProcessInstanceStatus::Complete);
        assert!(stored.end_at.is_some());
    }

    #[tokio::test]
    async fn state_survives_between_cycles_via_rows() {
        let engine = service_with(&[("hr/approval", approval_model())]);
        let instance = engine.start_instance("hr/approval", "alice").await.unwrap();
        engine
            .advance(&instance.id, "greedy", Some(json!({"request": "chair"})), None, false)
            .await
            .unwrap();

        // A second cycle hydrates from rows; the user task is still there
        // with its data intact.
        let step = engine.advance(&instance.id, "greedy", None, None, false).await.unwrap();
        let review = step.pending_tasks.iter().find(|t| t.spec == "review").unwrap();
        assert_eq!(review.state, TaskState::Ready);

        let rows = engine.repo().list_tasks(&instance.id).await.unwrap();
        assert!(rows.iter().any(|r| r.properties.task_spec == "review"));
        // No speculative rows persisted.
        assert!(rows.iter().all(|r| !r.state.is_predicted()));
    }

    #[tokio::test]
    async fn failing_service_task_does_not_kill_sibling_branch() {
        let model = json!({
            "identifier": "p",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["fork"]},
                "fork": {"kind": "parallel_split", "outgoing": ["call", "manual"]},
                "call": {"kind": "service_task", "operator": "http/Get", "outgoing": ["end"]},
                "manual": {"kind": "user_task", "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        });
        let engine = service_with(&[("p", model)]);
        let instance = engine.start_instance("p", "bob").await.unwrap();
        let step = engine
            .advance(&instance.id, "greedy", Some(json!({})), None, false)
            .await
            .unwrap();

        // The connector failure is a task-level error; the user task is
        // still actionable and the instance is not terminal.
        assert!(!step.completed);
        assert_eq!(step.status, ProcessInstanceStatus::UserInputRequired);
        assert_eq!(step.error_tasks.len(), 1);
        assert_eq!(step.error_tasks[0].spec, "call");
        assert!(step.pending_tasks.iter().any(|t| t.spec == "manual"));

        // The error state made it to storage.
        let rows = engine.repo().list_tasks(&instance.id).await.unwrap();
        let error_row = rows
            .iter()
            .find(|r| r.properties.task_spec == "call")
            .unwrap();
        assert_eq!(error_row.state, TaskState::Error);
    }

    #[tokio::test]
    async fn advance_fails_fast_when_instance_is_locked() {
        let engine = service_with(&[("hr/approval", approval_model())]);
        let instance = engine.start_instance("hr/approval", "alice").await.unwrap();

        // Another worker holds the lock.
        engine
            .repo()
            .try_lock_instance(&instance.id, "other-worker", Utc::now(), 600)
            .await
            .unwrap();

        let err = engine
            .advance(&instance.id, "greedy", Some(json!({})), None, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Lock(LockError::InstanceLocked(id)) if id == instance.id
        ));
    }

    #[tokio::test]
    async fn throw_event_persists_a_ready_send_message() {
        let model = json!({
            "identifier": "p",
            "correlation_properties": [
                {"name": "po_number", "retrieval_expression": "po_number"}
            ],
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["send"]},
                "send": {"kind": "message_throw_event", "message": "invoice", "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        });
        let engine = service_with(&[("p", model)]);
        let instance = engine.start_instance("p", "carol").await.unwrap();
        let step = engine
            .advance(&instance.id, "greedy", Some(json!({"po_number": 7})), None, false)
            .await
            .unwrap();
        assert!(step.completed);

        let messages = engine.repo().list_messages(&instance.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, MessageType::Send);
        assert_eq!(messages[0].status, MessageStatus::Ready);
        assert_eq!(messages[0].correlation_keys["po_number"], json!(7.0));
    }

    #[tokio::test]
    async fn waiting_catch_event_registers_a_receive() {
        let model = json!({
            "identifier": "p",
            "correlation_properties": [
                {"name": "po_number", "retrieval_expression": "po_number"}
            ],
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["wait"]},
                "wait": {"kind": "message_catch_event", "message": "invoice", "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        });
        let engine = service_with(&[("p", model)]);
        let instance = engine.start_instance("p", "dave").await.unwrap();
        let step = engine
            .advance(&instance.id, "greedy", Some(json!({"po_number": 7})), None, false)
            .await
            .unwrap();
        assert!(!step.completed);
        assert_eq!(step.status, ProcessInstanceStatus::Waiting);

        let messages = engine.repo().list_messages(&instance.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, MessageType::Receive);

        // A second cycle does not duplicate the registration.
        engine.advance(&instance.id, "greedy", None, None, false).await.unwrap();
        assert_eq!(engine.repo().list_messages(&instance.id).await.unwrap().len(), 1);

        // Delivery completes the instance.
        let step = engine
            .deliver_message(&instance.id, "invoice", &json!({"amount": 12}))
            .await
            .unwrap();
        assert!(step.completed);
        assert_eq!(step.result["amount"], json!(12));
    }

    #[tokio::test]
    async fn step_result_state_snapshot_rehydrates_the_graph() {
        let engine = service_with(&[("hr/approval", approval_model())]);
        let instance = engine.start_instance("hr/approval", "alice").await.unwrap();
        let step = engine
            .advance(&instance.id, "greedy", Some(json!({"request": "desk"})), None, false)
            .await
            .unwrap();

        // A persistence-free caller can rebuild the graph from the
        // returned snapshot alone.
        let model = engine.definitions().cached("hr/approval").unwrap();
        let hydrated = TaskGraph::hydrate(model.bundle.clone(), &step.state).unwrap();
        assert_eq!(
            hydrated.pending_tasks().iter().map(|t| t.guid).collect::<Vec<_>>(),
            step.pending_tasks.iter().map(|t| t.guid).collect::<Vec<_>>(),
        );
    }

    #[tokio::test]
    async fn save_flag_gates_the_full_state_save_callback() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingCallbacks(AtomicUsize);
        impl InstanceCallbacks for CountingCallbacks {
            fn save(&self, _instance: &ProcessInstance) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let callbacks = Arc::new(CountingCallbacks(AtomicUsize::new(0)));
        let engine =
            service_with_callbacks(&[("hr/approval", approval_model())], callbacks.clone());
        let instance = engine.start_instance("hr/approval", "alice").await.unwrap();

        engine
            .advance(&instance.id, "greedy", Some(json!({})), None, false)
            .await
            .unwrap();
        assert_eq!(callbacks.0.load(Ordering::SeqCst), 0);

        engine
            .advance(&instance.id, "greedy", None, None, true)
            .await
            .unwrap();
        assert_eq!(callbacks.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn call_activity_writes_a_subprocess_scope_row() {
        let parent = json!({
            "identifier": "parent",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["call"]},
                "call": {"kind": "call_activity", "spec": "billing", "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        });
        let child = json!({
            "identifier": "billing",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["check"]},
                "check": {"kind": "user_task", "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        });
        let mut map = HashMap::new();
        map.insert(
            "orders".to_string(),
            vec![
                ("parent.json".to_string(), serde_json::to_vec(&parent).unwrap()),
                ("billing.json".to_string(), serde_json::to_vec(&child).unwrap()),
            ],
        );
        let engine = WorkflowExecutionService::new(
            InMemoryEngineRepository::default(),
            Arc::new(DefinitionCache::new(MapSource(map))),
            Arc::new(NoopConnector),
            Arc::new(DefaultCallbacks),
            "worker-test",
            EngineConfig::default(),
        );
        let instance = engine.start_instance("orders", "erin").await.unwrap();
        let step = engine
            .advance(&instance.id, "greedy", Some(json!({})), None, false)
            .await
            .unwrap();
        assert!(!step.completed);

        let scopes = engine.repo().list_bpmn_processes(&instance.id).await.unwrap();
        assert_eq!(scopes.len(), 2);
        let sub = scopes.iter().find(|s| !s.top_level).unwrap();
        assert_ne!(sub.process_definition_id, instance.process_definition_id);

        // The scope row is keyed by the call-activity task's GUID.
        let rows = engine.repo().list_tasks(&instance.id).await.unwrap();
        let call_row = rows
            .iter()
            .find(|r| r.properties.task_spec == "call")
            .unwrap();
        assert_eq!(sub.guid, call_row.guid);

        // Later cycles do not duplicate the row.
        engine
            .advance(&instance.id, "greedy", None, None, false)
            .await
            .unwrap();
        assert_eq!(
            engine.repo().list_bpmn_processes(&instance.id).await.unwrap().len(),
            2
        );
    }
}
