//! Task persistence mapper.
//!
//! The mapper bridges the live task graph and the normalized task rows.
//! Completion hooks only STAGE dirty GUIDs; nothing touches the database
//! until [`TaskMapper::flush`] writes the whole dirty set as one batch.
//!
//! Speculative (MAYBE/LIKELY) nodes are excluded at flush time: they are
//! never written as rows and never appear in a persisted child list, so the
//! stored children lists always reference real rows in the same batch.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use millrace_types::error::RepositoryError;
use millrace_types::task::{Task, TaskProperties};
use thiserror::Error;
use uuid::Uuid;

use crate::graph::{GraphError, GraphTask, TaskGraph, ROOT_SPEC};
use crate::persist::registry::{SerializationRegistry, SLOT_JSON_DATA, SLOT_SCRIPT_ENV};
use crate::repository::EngineRepository;

/// Errors from the mapper.
#[derive(Debug, Error)]
pub enum MapperError {
    #[error("no task definition for spec '{spec}' in process '{process}'")]
    UnknownSpec { process: String, spec: String },

    #[error("no task definition row with id {0}")]
    UnknownDefinition(Uuid),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Lookup between (process identifier, spec name) and task definition ids,
/// built from the persisted definition rows of a bundle.
#[derive(Debug, Clone, Default)]
pub struct DefinitionIndex {
    forward: HashMap<(String, String), Uuid>,
    reverse: HashMap<Uuid, (String, String)>,
}

impl DefinitionIndex {
    pub fn insert(&mut self, process: &str, spec: &str, task_definition_id: Uuid) {
        self.forward
            .insert((process.to_string(), spec.to_string()), task_definition_id);
        self.reverse
            .insert(task_definition_id, (process.to_string(), spec.to_string()));
    }

    pub fn definition_id(&self, process: &str, spec: &str) -> Option<Uuid> {
        self.forward
            .get(&(process.to_string(), spec.to_string()))
            .copied()
    }

    pub fn spec_for(&self, task_definition_id: &Uuid) -> Option<(&str, &str)> {
        self.reverse
            .get(task_definition_id)
            .map(|(p, s)| (p.as_str(), s.as_str()))
    }
}

/// Wall-clock execution span recorded around a task's completion.
#[derive(Debug, Clone, Copy, Default)]
struct Span {
    start: Option<f64>,
    end: Option<f64>,
}

/// Stages dirty task GUIDs during engine steps and flushes them as one
/// transactional batch.
pub struct TaskMapper {
    process_instance_id: Uuid,
    index: DefinitionIndex,
    staged: HashSet<Uuid>,
    spans: HashMap<Uuid, Span>,
}

impl TaskMapper {
    pub fn new(process_instance_id: Uuid, index: DefinitionIndex) -> Self {
        Self {
            process_instance_id,
            index,
            staged: HashSet::new(),
            spans: HashMap::new(),
        }
    }

    pub fn index(&self) -> &DefinitionIndex {
        &self.index
    }

    /// Number of GUIDs currently staged.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Hook fired before a task's completion effects apply. Forces the
    /// graph to predict descendant shapes and opens the execution span.
    pub fn on_task_will_complete(&mut self, graph: &mut TaskGraph, guid: &Uuid) {
        graph.predict();
        self.spans.entry(*guid).or_default().start =
            Some(Task::now_in_seconds(Utc::now()));
    }

    /// Hook fired after a task's completion effects applied (or the task
    /// failed). Closes the span and stages the task with its ancestors and
    /// current descendants.
    pub fn on_task_did_complete(&mut self, graph: &TaskGraph, guid: &Uuid) {
        self.spans.entry(*guid).or_default().end =
            Some(Task::now_in_seconds(Utc::now()));
        self.staged.insert(*guid);
        self.staged.extend(graph.ancestors(guid));
        self.staged.extend(graph.descendants(guid));
    }

    /// Stage every task in the graph (initial persist of a new instance,
    /// or catch-up after hydration drift).
    pub fn stage_all(&mut self, graph: &TaskGraph) {
        self.staged.extend(
            graph
                .tasks_in_order()
                .filter(|t| t.spec != ROOT_SPEC)
                .map(|t| t.guid),
        );
    }

    /// Write the staged set as one batch.
    ///
    /// Speculative nodes are dropped from the batch and filtered out of
    /// every persisted child list. Payload blobs are content-addressed
    /// through the registry before the row batch goes in, so rows never
    /// reference a hash that is not yet stored.
    pub async fn flush<R: EngineRepository>(
        &mut self,
        graph: &TaskGraph,
        repo: &R,
        registry: &SerializationRegistry,
    ) -> Result<usize, MapperError> {
        let staged = std::mem::take(&mut self.staged);
        let mut rows = Vec::new();

        for guid in &staged {
            // Discarded predictions may have been staged before retraction.
            if !graph.contains(guid) {
                continue;
            }
            let node = graph.task(guid)?;
            if node.spec == ROOT_SPEC || node.state.is_predicted() {
                continue;
            }
            rows.push(self.row_for(graph, node, repo, registry).await?);
        }

        if rows.is_empty() {
            return Ok(0);
        }
        let count = rows.len();
        repo.upsert_tasks(&rows).await?;
        tracing::debug!(
            instance = %self.process_instance_id,
            tasks = count,
            "flushed task batch"
        );
        Ok(count)
    }

    async fn row_for<R: EngineRepository>(
        &self,
        graph: &TaskGraph,
        node: &GraphTask,
        repo: &R,
        registry: &SerializationRegistry,
    ) -> Result<Task, MapperError> {
        let task_definition_id = self
            .index
            .definition_id(&node.process, &node.spec)
            .ok_or_else(|| MapperError::UnknownSpec {
                process: node.process.clone(),
                spec: node.spec.clone(),
            })?;

        let mut json_data_hash = None;
        if let Some(slot) = registry.extract(SLOT_JSON_DATA, &node.data) {
            repo.put_blob(&slot.hash, &slot.payload).await?;
            json_data_hash = Some(slot.hash);
        }
        let mut python_env_data_hash = None;
        if let Some(slot) = registry.extract(SLOT_SCRIPT_ENV, &node.data) {
            repo.put_blob(&slot.hash, &slot.payload).await?;
            python_env_data_hash = Some(slot.hash);
        }

        // Child lists only reference nodes that exist as real rows.
        let children: Vec<Uuid> = node
            .children
            .iter()
            .filter(|c| {
                graph
                    .task(c)
                    .map(|child| !child.state.is_predicted())
                    .unwrap_or(false)
            })
            .copied()
            .collect();
        // The synthetic root is never persisted; its children are stored
        // parentless.
        let parent = node.parent.filter(|p| *p != graph.root());

        let span = self.spans.get(&node.guid).copied().unwrap_or_default();
        Ok(Task {
            guid: node.guid,
            process_instance_id: self.process_instance_id,
            task_definition_id,
            state: node.state,
            properties: TaskProperties {
                parent,
                children,
                task_spec: node.spec.clone(),
                triggered: node.triggered,
                internal_data: node.internal_data.clone(),
            },
            json_data_hash,
            python_env_data_hash,
            start_in_seconds: span.start,
            end_in_seconds: span.end,
        })
    }
}

/// Rebuild a live graph from persisted task rows, fetching data blobs and
/// regenerating the synthetic root.
pub async fn hydrate_graph<R: EngineRepository>(
    bundle: std::sync::Arc<crate::graph::spec::SpecBundle>,
    rows: &[Task],
    index: &DefinitionIndex,
    repo: &R,
    registry: &SerializationRegistry,
) -> Result<TaskGraph, MapperError> {
    let mut nodes = Vec::with_capacity(rows.len());
    for row in rows {
        let (process, spec) = index
            .spec_for(&row.task_definition_id)
            .ok_or(MapperError::UnknownDefinition(row.task_definition_id))?;

        let mut slots = Vec::new();
        if let Some(hash) = &row.json_data_hash {
            slots.push(repo.get_blob(hash).await?);
        }
        if let Some(hash) = &row.python_env_data_hash {
            slots.push(repo.get_blob(hash).await?);
        }
        let data = registry.assemble(&slots);

        nodes.push(GraphTask {
            guid: row.guid,
            process: process.to_string(),
            spec: spec.to_string(),
            state: row.state,
            parent: row.properties.parent,
            children: row.properties.children.clone(),
            data,
            internal_data: row.properties.internal_data.clone(),
            triggered: row.properties.triggered,
        });
    }
    Ok(TaskGraph::from_parts(bundle, nodes, None)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::NoopConnector;
    use crate::expression::ExpressionEvaluator;
    use crate::graph::spec::parse_model;
    use crate::graph::ExecutionServices;
    use crate::repository::memory::InMemoryEngineRepository;
    use millrace_types::task::TaskState;
    use serde_json::json;
    use std::sync::Arc;

    fn bundle() -> Arc<crate::graph::spec::SpecBundle> {
        let doc = serde_json::to_vec(&json!({
            "identifier": "p",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["decide"]},
                "decide": {
                    "kind": "exclusive_gateway",
                    "conditions": {"yes": "go"},
                    "outgoing": ["yes", "no"]
                },
                "yes": {"kind": "user_task", "outgoing": ["end"]},
                "no": {"kind": "user_task", "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        }))
        .unwrap();
        Arc::new(parse_model(&[("p.json".to_string(), doc)]).unwrap())
    }

    fn index_for(bundle: &crate::graph::spec::SpecBundle) -> DefinitionIndex {
        let mut index = DefinitionIndex::default();
        for (process, spec) in &bundle.processes {
            for name in spec.task_specs.keys() {
                index.insert(process, name, Uuid::now_v7());
            }
        }
        index
    }

    fn run_cycle(graph: &mut TaskGraph, mapper: &mut TaskMapper) {
        let evaluator = ExpressionEvaluator::new();
        let services = ExecutionServices {
            connector: &NoopConnector,
            evaluator: &evaluator,
        };
        for _ in 0..50 {
            let ready = graph.ready_engine_tasks();
            if ready.is_empty() {
                break;
            }
            for guid in ready {
                mapper.on_task_will_complete(graph, &guid);
                graph.complete_task(&guid, &services).unwrap();
                mapper.on_task_did_complete(graph, &guid);
            }
        }
    }

    #[tokio::test]
    async fn flush_never_persists_speculative_tasks() {
        let bundle = bundle();
        let repo = InMemoryEngineRepository::default();
        let registry = SerializationRegistry::standard();
        let instance_id = Uuid::now_v7();
        let mut mapper = TaskMapper::new(instance_id, index_for(&bundle));

        let mut graph = TaskGraph::new(bundle, json!({"go": true}));
        run_cycle(&mut graph, &mut mapper);
        mapper.flush(&graph, &repo, &registry).await.unwrap();

        let rows = repo.list_tasks(&instance_id).await.unwrap();
        assert!(!rows.is_empty());
        let stored: std::collections::HashSet<Uuid> =
            rows.iter().map(|r| r.guid).collect();
        for row in &rows {
            assert!(!row.state.is_predicted(), "speculative row persisted");
            for child in &row.properties.children {
                assert!(stored.contains(child), "orphaned child reference");
            }
        }
        // The gateway picked "yes"; "no" never became a row.
        assert!(!rows.iter().any(|r| r.properties.task_spec == "no"));
    }

    #[tokio::test]
    async fn flush_stores_data_blobs_and_hydration_restores_them() {
        let bundle = bundle();
        let repo = InMemoryEngineRepository::default();
        let registry = SerializationRegistry::standard();
        let instance_id = Uuid::now_v7();
        let index = index_for(&bundle);
        let mut mapper = TaskMapper::new(instance_id, index.clone());

        let mut graph = TaskGraph::new(bundle.clone(), json!({"go": true, "_env": 1}));
        run_cycle(&mut graph, &mut mapper);
        mapper.flush(&graph, &repo, &registry).await.unwrap();

        let rows = repo.list_tasks(&instance_id).await.unwrap();
        let hydrated = hydrate_graph(bundle, &rows, &index, &repo, &registry)
            .await
            .unwrap();

        let pending = hydrated.pending_tasks();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].spec, "yes");
        assert_eq!(pending[0].state, TaskState::Ready);
        assert_eq!(pending[0].data["go"], json!(true));
        assert_eq!(pending[0].data["_env"], json!(1));
    }

    #[tokio::test]
    async fn flush_is_incremental_between_cycles() {
        let bundle = bundle();
        let repo = InMemoryEngineRepository::default();
        let registry = SerializationRegistry::standard();
        let instance_id = Uuid::now_v7();
        let mut mapper = TaskMapper::new(instance_id, index_for(&bundle));

        let mut graph = TaskGraph::new(bundle, json!({"go": false}));
        run_cycle(&mut graph, &mut mapper);
        let first = mapper.flush(&graph, &repo, &registry).await.unwrap();
        assert!(first > 0);
        // Nothing staged after a flush with no new completions.
        let second = mapper.flush(&graph, &repo, &registry).await.unwrap();
        assert_eq!(second, 0);
    }
}
