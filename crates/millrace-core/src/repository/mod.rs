//! Repository trait for workflow engine persistence.
//!
//! Defines the storage interface the engine drives: process definitions,
//! process instances, task rows, content-addressed data blobs, message
//! instances, and the instance lock queue. The infrastructure layer
//! (millrace-infra) implements this trait with SQLite persistence; an
//! in-memory implementation lives in [`memory`] for tests.

pub mod memory;

use chrono::{DateTime, Utc};
use millrace_types::definition::{DefinitionRelationship, ProcessDefinition, TaskDefinition};
use millrace_types::error::RepositoryError;
use millrace_types::message::{MessageInstance, MessageStatus, MessageType};
use millrace_types::process::{BpmnProcess, ProcessInstance};
use millrace_types::queue::QueueEntry;
use millrace_types::task::Task;
use uuid::Uuid;

/// Repository trait for engine persistence.
///
/// Covers six entity families:
/// - **Definitions:** content-hashed process/task definitions and the
///   parent/subprocess relationship table.
/// - **Instances:** process instances and their BPMN process scopes.
/// - **Tasks:** normalized task-graph rows, upserted in batches.
/// - **Data blobs:** content-addressed JSON payloads.
/// - **Messages:** send/receive message instances with CAS status claims.
/// - **Queue:** per-instance lock records.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait EngineRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Insert a new process definition. Fails with
    /// [`RepositoryError::Conflict`] if a row with the same
    /// `single_process_hash` already exists; callers must read it back.
    fn insert_definition(
        &self,
        def: &ProcessDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a process definition by its UUID.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ProcessDefinition>, RepositoryError>> + Send;

    /// Look up a definition by its single-process content hash.
    fn get_definition_by_single_hash(
        &self,
        hash: &str,
    ) -> impl std::future::Future<Output = Result<Option<ProcessDefinition>, RepositoryError>> + Send;

    /// Look up a definition by its full process+subprocess bundle hash.
    fn get_definition_by_full_hash(
        &self,
        hash: &str,
    ) -> impl std::future::Future<Output = Result<Option<ProcessDefinition>, RepositoryError>> + Send;

    /// Insert the task definitions belonging to a freshly-persisted
    /// process definition.
    fn insert_task_definitions(
        &self,
        defs: &[TaskDefinition],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List the task definitions of a process definition.
    fn list_task_definitions(
        &self,
        process_definition_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<TaskDefinition>, RepositoryError>> + Send;

    /// Record a parent -> subprocess relationship. Idempotent.
    fn upsert_definition_relationship(
        &self,
        rel: &DefinitionRelationship,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List the subprocess relationships of a parent definition.
    fn list_definition_relationships(
        &self,
        parent_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<DefinitionRelationship>, RepositoryError>> + Send;

    /// Record that a process model can be started by a named message.
    /// Idempotent on message name.
    fn register_message_triggerable(
        &self,
        message_name: &str,
        process_model_identifier: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Find the process model identifier triggerable by a message name.
    fn find_message_triggerable(
        &self,
        message_name: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Create a new process instance record.
    fn create_instance(
        &self,
        instance: &ProcessInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a process instance by its UUID.
    fn get_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ProcessInstance>, RepositoryError>> + Send;

    /// Update a process instance (status, timestamps).
    fn update_instance(
        &self,
        instance: &ProcessInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Create a BPMN process scope row.
    fn create_bpmn_process(
        &self,
        process: &BpmnProcess,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List the BPMN process scopes of an instance.
    fn list_bpmn_processes(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<BpmnProcess>, RepositoryError>> + Send;

    /// Update a BPMN process scope (correlation values, data hash).
    fn update_bpmn_process(
        &self,
        process: &BpmnProcess,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Upsert a batch of task rows in a single transaction. Referential
    /// completeness of child GUID lists is the caller's responsibility;
    /// parents and children must arrive in the same batch.
    fn upsert_tasks(
        &self,
        tasks: &[Task],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a task row by GUID.
    fn get_task(
        &self,
        guid: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Task>, RepositoryError>> + Send;

    /// List all task rows of an instance.
    fn list_tasks(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Data blobs
    // -----------------------------------------------------------------------

    /// Store a content-addressed payload. Idempotent: inserting an existing
    /// hash is a no-op, never an error.
    fn put_blob(
        &self,
        hash: &str,
        payload: &serde_json::Value,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Fetch a content-addressed payload. Fails with
    /// [`RepositoryError::NotFound`] for an unknown hash.
    fn get_blob(
        &self,
        hash: &str,
    ) -> impl std::future::Future<Output = Result<serde_json::Value, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Create a message instance row.
    fn create_message(
        &self,
        message: &MessageInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a message instance by id.
    fn get_message(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<MessageInstance>, RepositoryError>> + Send;

    /// List all message instances of a process instance.
    fn list_messages(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<MessageInstance>, RepositoryError>> + Send;

    /// List ready messages of one type, optionally filtered by name,
    /// ordered by ascending id (UUIDv7, so oldest first).
    fn list_ready_messages(
        &self,
        message_type: MessageType,
        name: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<MessageInstance>, RepositoryError>> + Send;

    /// Compare-and-set a message's status. Returns `true` only if the row
    /// was still in `from` status; two workers racing on the same message
    /// see exactly one `true`.
    fn claim_message(
        &self,
        id: &Uuid,
        from: MessageStatus,
        to: MessageStatus,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Update a message instance (status, counterpart, failure cause).
    fn update_message(
        &self,
        message: &MessageInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Queue
    // -----------------------------------------------------------------------

    /// Create the lock record for a new instance.
    fn create_queue_entry(
        &self,
        entry: &QueueEntry,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get the lock record of an instance.
    fn get_queue_entry(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<QueueEntry>, RepositoryError>> + Send;

    /// Try to take the instance lock. Succeeds if the entry is unlocked or
    /// its current lock is older than `confiscation_secs` (holder presumed
    /// crashed). Returns `false` if another worker holds a fresh lock.
    fn try_lock_instance(
        &self,
        instance_id: &Uuid,
        worker: &str,
        now: DateTime<Utc>,
        confiscation_secs: u64,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Release the instance lock if held by `worker`.
    fn unlock_instance(
        &self,
        instance_id: &Uuid,
        worker: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
