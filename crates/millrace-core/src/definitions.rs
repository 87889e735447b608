//! Process definition cache.
//!
//! Persisting a model is content-addressed at two levels: each process spec
//! has its own hash, and the primary carries a hash over the full
//! process+subprocess bundle. Re-persisting unchanged content reuses the
//! existing rows instead of inserting duplicates.
//!
//! Parsed bundles are cached in-process by model identifier; a cache entry
//! is reused only while its full-bundle hash still matches the files the
//! model source serves.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use millrace_types::definition::{DefinitionRelationship, ProcessDefinition, TaskDefinition};
use millrace_types::error::RepositoryError;
use thiserror::Error;
use uuid::Uuid;

use crate::contracts::{ModelSource, ModelSourceError};
use crate::graph::spec::{parse_model, ProcessSpec, SpecBundle, SpecError};
use crate::hash::content_hash;
use crate::persist::DefinitionIndex;
use crate::repository::EngineRepository;

/// Errors from definition persistence.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error(transparent)]
    Source(#[from] ModelSourceError),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("definition row vanished for hash {0}")]
    MissingDefinition(String),
}

/// A persisted, parsed model: the bundle, its primary definition row, and
/// the task-definition index the mapper needs.
#[derive(Debug)]
pub struct CachedModel {
    pub bundle: Arc<SpecBundle>,
    pub definition: ProcessDefinition,
    pub index: DefinitionIndex,
}

/// Content-addressed definition persistence with an in-process cache.
pub struct DefinitionCache<M: ModelSource> {
    source: M,
    cache: DashMap<String, Arc<CachedModel>>,
}

impl<M: ModelSource> DefinitionCache<M> {
    pub fn new(source: M) -> Self {
        Self {
            source,
            cache: DashMap::new(),
        }
    }

    /// Load, parse, and persist a process model, returning the cached
    /// parse. Unchanged content never inserts new rows.
    pub async fn persist<R: EngineRepository>(
        &self,
        process_model_identifier: &str,
        repo: &R,
    ) -> Result<Arc<CachedModel>, DefinitionError> {
        let files = self.source.load_definition_files(process_model_identifier)?;
        let bundle = Arc::new(parse_model(&files)?);
        let full_hash = content_hash(&serde_json::to_value(bundle.as_ref()).unwrap_or_default());

        if let Some(cached) = self.cache.get(process_model_identifier)
            && cached.definition.full_process_model_hash.as_deref() == Some(&full_hash)
        {
            return Ok(cached.clone());
        }

        let model = self
            .persist_bundle(process_model_identifier, bundle, &full_hash, repo)
            .await?;
        let model = Arc::new(model);
        self.cache
            .insert(process_model_identifier.to_string(), model.clone());
        Ok(model)
    }

    /// Cache lookup without touching the model source or storage. Used on
    /// hot paths that already hold a definition id.
    pub fn cached(&self, process_model_identifier: &str) -> Option<Arc<CachedModel>> {
        self.cache
            .get(process_model_identifier)
            .map(|entry| entry.clone())
    }

    async fn persist_bundle<R: EngineRepository>(
        &self,
        model_identifier: &str,
        bundle: Arc<SpecBundle>,
        full_hash: &str,
        repo: &R,
    ) -> Result<CachedModel, DefinitionError> {
        // Fast path: the exact bundle has been persisted before.
        if let Some(primary) = repo.get_definition_by_full_hash(full_hash).await? {
            tracing::debug!(model = model_identifier, hash = full_hash, "definition bundle reused");
            let index = self.load_index(&primary, &bundle, repo).await?;
            return Ok(CachedModel {
                bundle,
                definition: primary,
                index,
            });
        }

        let mut index = DefinitionIndex::default();
        let mut primary_row = None;
        let mut definition_ids = std::collections::BTreeMap::new();

        for (identifier, spec) in &bundle.processes {
            let is_primary = *identifier == bundle.primary;
            let row = self
                .ensure_definition(spec, is_primary.then_some(full_hash), repo)
                .await?;
            for task_def in repo.list_task_definitions(&row.id).await? {
                index.insert(identifier, &task_def.bpmn_identifier, task_def.id);
            }
            definition_ids.insert(identifier.clone(), row.id);
            if is_primary {
                primary_row = Some(row);
            }
        }
        let primary = primary_row.ok_or_else(|| DefinitionError::MissingDefinition(full_hash.to_string()))?;

        // Explicit parent -> subprocess edges, one per call activity.
        for (identifier, spec) in &bundle.processes {
            let parent_id = definition_ids[identifier];
            for called in spec.called_subprocesses() {
                if let Some(child_id) = definition_ids.get(called) {
                    repo.upsert_definition_relationship(&DefinitionRelationship {
                        parent_id,
                        child_id: *child_id,
                    })
                    .await?;
                }
            }
        }

        for message_name in bundle.primary_process().message_start_names() {
            repo.register_message_triggerable(message_name, model_identifier)
                .await?;
        }

        tracing::info!(
            model = model_identifier,
            definition = %primary.id,
            processes = bundle.processes.len(),
            "definition bundle persisted"
        );
        Ok(CachedModel {
            bundle,
            definition: primary,
            index,
        })
    }

    /// Insert one process definition with its task definitions, or reuse
    /// the row an identical spec already produced. An insert race on the
    /// hash resolves by reading the winner back.
    async fn ensure_definition<R: EngineRepository>(
        &self,
        spec: &ProcessSpec,
        full_hash: Option<&str>,
        repo: &R,
    ) -> Result<ProcessDefinition, DefinitionError> {
        let spec_json = serde_json::to_value(spec).unwrap_or_default();
        let single_hash = content_hash(&spec_json);

        if let Some(existing) = repo.get_definition_by_single_hash(&single_hash).await? {
            return Ok(with_full_hash(existing, full_hash));
        }

        let row = ProcessDefinition {
            id: Uuid::now_v7(),
            bpmn_identifier: spec.identifier.clone(),
            display_name: ProcessDefinition::truncate_display_name(
                spec.display_name.as_deref().unwrap_or(&spec.identifier),
            ),
            single_process_hash: single_hash.clone(),
            full_process_model_hash: full_hash.map(str::to_string),
            spec_json,
            created_at: Utc::now(),
        };
        match repo.insert_definition(&row).await {
            Ok(()) => {
                let task_defs: Vec<TaskDefinition> = spec
                    .task_specs
                    .iter()
                    .map(|(name, task_spec)| TaskDefinition {
                        id: Uuid::now_v7(),
                        process_definition_id: row.id,
                        bpmn_identifier: name.clone(),
                        properties: serde_json::to_value(task_spec).unwrap_or_default(),
                    })
                    .collect();
                repo.insert_task_definitions(&task_defs).await?;
                Ok(row)
            }
            Err(err) if err.is_conflict() => {
                // Another worker inserted the same content first.
                let winner = repo
                    .get_definition_by_single_hash(&single_hash)
                    .await?
                    .ok_or(DefinitionError::MissingDefinition(single_hash))?;
                Ok(with_full_hash(winner, full_hash))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn load_index<R: EngineRepository>(
        &self,
        primary: &ProcessDefinition,
        bundle: &SpecBundle,
        repo: &R,
    ) -> Result<DefinitionIndex, DefinitionError> {
        let mut index = DefinitionIndex::default();
        for task_def in repo.list_task_definitions(&primary.id).await? {
            index.insert(&primary.bpmn_identifier, &task_def.bpmn_identifier, task_def.id);
        }
        for rel in repo.list_definition_relationships(&primary.id).await? {
            let Some(child) = repo.get_definition(&rel.child_id).await? else {
                continue;
            };
            if bundle.process(&child.bpmn_identifier).is_none() {
                continue;
            }
            for task_def in repo.list_task_definitions(&child.id).await? {
                index.insert(&child.bpmn_identifier, &task_def.bpmn_identifier, task_def.id);
            }
        }
        Ok(index)
    }
}

/// A reused row may predate this bundle shape and lack the full-bundle
/// hash the fast path looks up by.
fn with_full_hash(mut row: ProcessDefinition, full_hash: Option<&str>) -> ProcessDefinition {
    if row.full_process_model_hash.is_none()
        && let Some(hash) = full_hash
    {
        row.full_process_model_hash = Some(hash.to_string());
    }
    row
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryEngineRepository;
    use serde_json::json;
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

    fn source_with_model() -> MapSource {
        let parent = serde_json::to_vec(&json!({
            "identifier": "order_process",
            "display_name": "Order Process",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["call"]},
                "msg_start": {"kind": "start_event", "message": "order_received", "outgoing": ["call"]},
                "call": {"kind": "call_activity", "spec": "billing", "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        }))
        .unwrap();
        let child = serde_json::to_vec(&json!({
            "identifier": "billing",
            "task_specs": {
                "start": {"kind": "start_event", "outgoing": ["end"]},
                "end": {"kind": "end_event"}
            }
        }))
        .unwrap();
        let mut models = HashMap::new();
        models.insert(
            "orders/order_process".to_string(),
            vec![
                ("order_process.json".to_string(), parent),
                ("billing.json".to_string(), child),
            ],
        );
        MapSource(models)
    }

    #[tokio::test]
    async fn persist_creates_definitions_tasks_and_relationships() {
        let repo = InMemoryEngineRepository::default();
        let cache = DefinitionCache::new(source_with_model());

        let model = cache.persist("orders/order_process", &repo).await.unwrap();
        assert_eq!(model.definition.bpmn_identifier, "order_process");
        assert!(model.definition.full_process_model_hash.is_some());

        // Task definitions exist for both processes and the index covers them.
        assert!(model.index.definition_id("order_process", "call").is_some());
        assert!(model.index.definition_id("billing", "start").is_some());

        let rels = repo
            .list_definition_relationships(&model.definition.id)
            .await
            .unwrap();
        assert_eq!(rels.len(), 1);

        // Message start registered for correlation-triggered starts.
        let triggerable = repo.find_message_triggerable("order_received").await.unwrap();
        assert_eq!(triggerable.as_deref(), Some("orders/order_process"));
    }

    #[tokio::test]
    async fn unchanged_model_reuses_existing_rows() {
        let repo = InMemoryEngineRepository::default();
        let cache = DefinitionCache::new(source_with_model());

        let first = cache.persist("orders/order_process", &repo).await.unwrap();
        let second = cache.persist("orders/order_process", &repo).await.unwrap();
        assert_eq!(first.definition.id, second.definition.id);

        // A second cache instance (fresh process) also reuses the rows.
        let other_cache = DefinitionCache::new(source_with_model());
        let third = other_cache.persist("orders/order_process", &repo).await.unwrap();
        assert_eq!(first.definition.id, third.definition.id);
        assert!(third.index.definition_id("billing", "end").is_some());
    }

    #[tokio::test]
    async fn missing_model_surfaces_source_error() {
        let repo = InMemoryEngineRepository::default();
        let cache = DefinitionCache::new(source_with_model());
        let err = cache.persist("nope", &repo).await.unwrap_err();
        assert!(matches!(err, DefinitionError::Source(ModelSourceError::NotFound(_))));
    }
}
