//! In-memory implementation of [`EngineRepository`].
//!
//! Backed by `DashMap`, cloneable (shared state behind `Arc`), and used by
//! core tests and by callers that run the engine with
//! persistence_level=none semantics.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use millrace_types::definition::{DefinitionRelationship, ProcessDefinition, TaskDefinition};
use millrace_types::error::RepositoryError;
use millrace_types::message::{MessageInstance, MessageStatus, MessageType};
use millrace_types::process::{BpmnProcess, ProcessInstance};
use millrace_types::queue::QueueEntry;
use millrace_types::task::Task;
use uuid::Uuid;

use super::EngineRepository;

/// Shared in-memory tables.
#[derive(Default)]
struct Tables {
    definitions: DashMap<Uuid, ProcessDefinition>,
    task_definitions: DashMap<Uuid, TaskDefinition>,
    relationships: DashMap<(Uuid, Uuid), DefinitionRelationship>,
    message_triggerables: DashMap<String, String>,
    instances: DashMap<Uuid, ProcessInstance>,
    bpmn_processes: DashMap<Uuid, BpmnProcess>,
    tasks: DashMap<Uuid, Task>,
    blobs: DashMap<String, serde_json::Value>,
    messages: DashMap<Uuid, MessageInstance>,
    queue: DashMap<Uuid, QueueEntry>,
}

/// In-memory engine repository for tests and persistence-free callers.
#[derive(Clone, Default)]
pub struct InMemoryEngineRepository {
    tables: Arc<Tables>,
}

impl InMemoryEngineRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EngineRepository for InMemoryEngineRepository {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    async fn insert_definition(&self, def: &ProcessDefinition) -> Result<(), RepositoryError> {
        let duplicate = self
            .tables
            .definitions
            .iter()
            .any(|d| d.single_process_hash == def.single_process_hash);
        if duplicate {
            return Err(RepositoryError::Conflict(format!(
                "single_process_hash {}",
                def.single_process_hash
            )));
        }
        self.tables.definitions.insert(def.id, def.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<ProcessDefinition>, RepositoryError> {
        Ok(self.tables.definitions.get(id).map(|d| d.clone()))
    }

    async fn get_definition_by_single_hash(
        &self,
        hash: &str,
    ) -> Result<Option<ProcessDefinition>, RepositoryError> {
        Ok(self
            .tables
            .definitions
            .iter()
            .find(|d| d.single_process_hash == hash)
            .map(|d| d.clone()))
    }

    async fn get_definition_by_full_hash(
        &self,
        hash: &str,
    ) -> Result<Option<ProcessDefinition>, RepositoryError> {
        Ok(self
            .tables
            .definitions
            .iter()
            .find(|d| d.full_process_model_hash.as_deref() == Some(hash))
            .map(|d| d.clone()))
    }

    async fn insert_task_definitions(&self, defs: &[TaskDefinition]) -> Result<(), RepositoryError> {
        for def in defs {
            self.tables.task_definitions.insert(def.id, def.clone());
        }
        Ok(())
    }

    async fn list_task_definitions(
        &self,
        process_definition_id: &Uuid,
    ) -> Result<Vec<TaskDefinition>, RepositoryError> {
        Ok(self
            .tables
            .task_definitions
            .iter()
            .filter(|d| d.process_definition_id == *process_definition_id)
            .map(|d| d.clone())
            .collect())
    }

    async fn upsert_definition_relationship(
        &self,
        rel: &DefinitionRelationship,
    ) -> Result<(), RepositoryError> {
        self.tables
            .relationships
            .insert((rel.parent_id, rel.child_id), *rel);
        Ok(())
    }

    async fn list_definition_relationships(
        &self,
        parent_id: &Uuid,
    ) -> Result<Vec<DefinitionRelationship>, RepositoryError> {
        Ok(self
            .tables
            .relationships
            .iter()
            .filter(|r| r.parent_id == *parent_id)
            .map(|r| *r)
            .collect())
    }

    async fn register_message_triggerable(
        &self,
        message_name: &str,
        process_model_identifier: &str,
    ) -> Result<(), RepositoryError> {
        self.tables
            .message_triggerables
            .insert(message_name.to_string(), process_model_identifier.to_string());
        Ok(())
    }

    async fn find_message_triggerable(
        &self,
        message_name: &str,
    ) -> Result<Option<String>, RepositoryError> {
        Ok(self
            .tables
            .message_triggerables
            .get(message_name)
            .map(|m| m.clone()))
    }

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    async fn create_instance(&self, instance: &ProcessInstance) -> Result<(), RepositoryError> {
        self.tables.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<ProcessInstance>, RepositoryError> {
        Ok(self.tables.instances.get(id).map(|i| i.clone()))
    }

    async fn update_instance(&self, instance: &ProcessInstance) -> Result<(), RepositoryError> {
        if !self.tables.instances.contains_key(&instance.id) {
            return Err(RepositoryError::NotFound);
        }
        self.tables.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn create_bpmn_process(&self, process: &BpmnProcess) -> Result<(), RepositoryError> {
        self.tables.bpmn_processes.insert(process.id, process.clone());
        Ok(())
    }

    async fn list_bpmn_processes(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<BpmnProcess>, RepositoryError> {
        Ok(self
            .tables
            .bpmn_processes
            .iter()
            .filter(|p| p.process_instance_id == *instance_id)
            .map(|p| p.clone())
            .collect())
    }

    async fn update_bpmn_process(&self, process: &BpmnProcess) -> Result<(), RepositoryError> {
        if !self.tables.bpmn_processes.contains_key(&process.id) {
            return Err(RepositoryError::NotFound);
        }
        self.tables.bpmn_processes.insert(process.id, process.clone());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    async fn upsert_tasks(&self, tasks: &[Task]) -> Result<(), RepositoryError> {
        for task in tasks {
            self.tables.tasks.insert(task.guid, task.clone());
        }
        Ok(())
    }

    async fn get_task(&self, guid: &Uuid) -> Result<Option<Task>, RepositoryError> {
        Ok(self.tables.tasks.get(guid).map(|t| t.clone()))
    }

    async fn list_tasks(&self, instance_id: &Uuid) -> Result<Vec<Task>, RepositoryError> {
        Ok(self
            .tables
            .tasks
            .iter()
            .filter(|t| t.process_instance_id == *instance_id)
            .map(|t| t.clone())
            .collect())
    }

    // -----------------------------------------------------------------------
    // Data blobs
    // -----------------------------------------------------------------------

    async fn put_blob(&self, hash: &str, payload: &serde_json::Value) -> Result<(), RepositoryError> {
        self.tables
            .blobs
            .entry(hash.to_string())
            .or_insert_with(|| payload.clone());
        Ok(())
    }

    async fn get_blob(&self, hash: &str) -> Result<serde_json::Value, RepositoryError> {
        self.tables
            .blobs
            .get(hash)
            .map(|b| b.clone())
            .ok_or(RepositoryError::NotFound)
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    async fn create_message(&self, message: &MessageInstance) -> Result<(), RepositoryError> {
        self.tables.messages.insert(message.id, message.clone());
        Ok(())
    }

    async fn get_message(&self, id: &Uuid) -> Result<Option<MessageInstance>, RepositoryError> {
        Ok(self.tables.messages.get(id).map(|m| m.clone()))
    }

    async fn list_messages(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<MessageInstance>, RepositoryError> {
        let mut messages: Vec<MessageInstance> = self
            .tables
            .messages
            .iter()
            .filter(|m| m.process_instance_id == *instance_id)
            .map(|m| m.clone())
            .collect();
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    async fn list_ready_messages(
        &self,
        message_type: MessageType,
        name: Option<&str>,
    ) -> Result<Vec<MessageInstance>, RepositoryError> {
        let mut messages: Vec<MessageInstance> = self
            .tables
            .messages
            .iter()
            .filter(|m| {
                m.message_type == message_type
                    && m.status == MessageStatus::Ready
                    && name.is_none_or(|n| m.name == n)
            })
            .map(|m| m.clone())
            .collect();
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    async fn claim_message(
        &self,
        id: &Uuid,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<bool, RepositoryError> {
        match self.tables.messages.get_mut(id) {
            Some(mut message) if message.status == from => {
                message.status = to;
                message.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn update_message(&self, message: &MessageInstance) -> Result<(), RepositoryError> {
        if !self.tables.messages.contains_key(&message.id) {
            return Err(RepositoryError::NotFound);
        }
        self.tables.messages.insert(message.id, message.clone());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queue
    // -----------------------------------------------------------------------

    async fn create_queue_entry(&self, entry: &QueueEntry) -> Result<(), RepositoryError> {
        self.tables
            .queue
            .insert(entry.process_instance_id, entry.clone());
        Ok(())
    }

    async fn get_queue_entry(
        &self,
        instance_id: &Uuid,
    ) -> Result<Option<QueueEntry>, RepositoryError> {
        Ok(self.tables.queue.get(instance_id).map(|e| e.clone()))
    }

    async fn try_lock_instance(
        &self,
        instance_id: &Uuid,
        worker: &str,
        now: DateTime<Utc>,
        confiscation_secs: u64,
    ) -> Result<bool, RepositoryError> {
        let mut entry = self
            .tables
            .queue
            .get_mut(instance_id)
            .ok_or(RepositoryError::NotFound)?;
        let lockable = entry.locked_by.is_none()
            || entry.locked_by.as_deref() == Some(worker)
            || entry.is_stale(now, confiscation_secs);
        if lockable {
            entry.locked_by = Some(worker.to_string());
            entry.locked_at = Some(now);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn unlock_instance(&self, instance_id: &Uuid, worker: &str) -> Result<(), RepositoryError> {
        let mut entry = self
            .tables
            .queue
            .get_mut(instance_id)
            .ok_or(RepositoryError::NotFound)?;
        if entry.locked_by.as_deref() == Some(worker) {
            entry.locked_by = None;
            entry.locked_at = None;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
