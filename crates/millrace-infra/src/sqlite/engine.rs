//! SQLite engine repository implementation.
//!
//! Implements `EngineRepository` from `millrace-core` using sqlx with split
//! read/write pools. UUIDs and timestamps are stored as TEXT (RFC 3339),
//! JSON payloads as serialized TEXT columns. Task batches go through a
//! single transaction so parent/child references commit atomically.

use chrono::{DateTime, Utc};
use millrace_core::repository::EngineRepository;
use millrace_types::definition::{DefinitionRelationship, ProcessDefinition, TaskDefinition};
use millrace_types::error::RepositoryError;
use millrace_types::message::{MessageInstance, MessageStatus, MessageType};
use millrace_types::process::{BpmnProcess, ProcessInstance};
use millrace_types::queue::QueueEntry;
use millrace_types::task::Task;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `EngineRepository`.
#[derive(Clone)]
pub struct SqliteEngineRepository {
    pool: DatabasePool,
}

impl SqliteEngineRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Conversion helpers
// ---------------------------------------------------------------------------

fn map_db_err(e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            RepositoryError::Connection
        }
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        _ => RepositoryError::Query(e.to_string()),
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_json(s: &str) -> Result<serde_json::Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid JSON: {e}")))
}

/// Serialize a unit-style serde enum to its snake_case string form.
fn enum_to_str<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        _ => Err(RepositoryError::Query("enum serialization failed".to_string())),
    }
}

fn enum_from_str<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid enum value: {s}")))
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct DefinitionRow {
    id: String,
    bpmn_identifier: String,
    display_name: String,
    single_process_hash: String,
    full_process_model_hash: Option<String>,
    spec_json: String,
    created_at: String,
}

impl DefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            bpmn_identifier: row.try_get("bpmn_identifier")?,
            display_name: row.try_get("display_name")?,
            single_process_hash: row.try_get("single_process_hash")?,
            full_process_model_hash: row.try_get("full_process_model_hash")?,
            spec_json: row.try_get("spec_json")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_domain(self) -> Result<ProcessDefinition, RepositoryError> {
        Ok(ProcessDefinition {
            id: parse_uuid(&self.id)?,
            bpmn_identifier: self.bpmn_identifier,
            display_name: self.display_name,
            single_process_hash: self.single_process_hash,
            full_process_model_hash: self.full_process_model_hash,
            spec_json: parse_json(&self.spec_json)?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct TaskDefinitionRow {
    id: String,
    process_definition_id: String,
    bpmn_identifier: String,
    properties: String,
}

impl TaskDefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            process_definition_id: row.try_get("process_definition_id")?,
            bpmn_identifier: row.try_get("bpmn_identifier")?,
            properties: row.try_get("properties")?,
        })
    }

    fn into_domain(self) -> Result<TaskDefinition, RepositoryError> {
        Ok(TaskDefinition {
            id: parse_uuid(&self.id)?,
            process_definition_id: parse_uuid(&self.process_definition_id)?,
            bpmn_identifier: self.bpmn_identifier,
            properties: parse_json(&self.properties)?,
        })
    }
}

struct InstanceRow {
    id: String,
    process_model_identifier: String,
    process_definition_id: String,
    status: String,
    initiator: String,
    start_at: Option<String>,
    end_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            process_model_identifier: row.try_get("process_model_identifier")?,
            process_definition_id: row.try_get("process_definition_id")?,
            status: row.try_get("status")?,
            initiator: row.try_get("initiator")?,
            start_at: row.try_get("start_at")?,
            end_at: row.try_get("end_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_domain(self) -> Result<ProcessInstance, RepositoryError> {
        Ok(ProcessInstance {
            id: parse_uuid(&self.id)?,
            process_model_identifier: self.process_model_identifier,
            process_definition_id: parse_uuid(&self.process_definition_id)?,
            status: enum_from_str(&self.status)?,
            initiator: self.initiator,
            start_at: self.start_at.as_deref().map(parse_datetime).transpose()?,
            end_at: self.end_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct BpmnProcessRow {
    id: String,
    process_instance_id: String,
    process_definition_id: String,
    guid: String,
    correlation_values: String,
    top_level: bool,
    data_hash: Option<String>,
}

impl BpmnProcessRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            process_instance_id: row.try_get("process_instance_id")?,
            process_definition_id: row.try_get("process_definition_id")?,
            guid: row.try_get("guid")?,
            correlation_values: row.try_get("correlation_values")?,
            top_level: row.try_get("top_level")?,
            data_hash: row.try_get("data_hash")?,
        })
    }

    fn into_domain(self) -> Result<BpmnProcess, RepositoryError> {
        let correlation_values = serde_json::from_str(&self.correlation_values)
            .map_err(|e| RepositoryError::Query(format!("invalid correlation values: {e}")))?;
        Ok(BpmnProcess {
            id: parse_uuid(&self.id)?,
            process_instance_id: parse_uuid(&self.process_instance_id)?,
            process_definition_id: parse_uuid(&self.process_definition_id)?,
            guid: parse_uuid(&self.guid)?,
            correlation_values,
            top_level: self.top_level,
            data_hash: self.data_hash,
        })
    }
}

struct TaskRow {
    guid: String,
    process_instance_id: String,
    task_definition_id: String,
    state: String,
    properties: String,
    json_data_hash: Option<String>,
    python_env_data_hash: Option<String>,
    start_in_seconds: Option<f64>,
    end_in_seconds: Option<f64>,
}

impl TaskRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            guid: row.try_get("guid")?,
            process_instance_id: row.try_get("process_instance_id")?,
            task_definition_id: row.try_get("task_definition_id")?,
            state: row.try_get("state")?,
            properties: row.try_get("properties")?,
            json_data_hash: row.try_get("json_data_hash")?,
            python_env_data_hash: row.try_get("python_env_data_hash")?,
            start_in_seconds: row.try_get("start_in_seconds")?,
            end_in_seconds: row.try_get("end_in_seconds")?,
        })
    }

    fn into_domain(self) -> Result<Task, RepositoryError> {
        let properties = serde_json::from_str(&self.properties)
            .map_err(|e| RepositoryError::Query(format!("invalid task properties: {e}")))?;
        Ok(Task {
            guid: parse_uuid(&self.guid)?,
            process_instance_id: parse_uuid(&self.process_instance_id)?,
            task_definition_id: parse_uuid(&self.task_definition_id)?,
            state: enum_from_str(&self.state)?,
            properties,
            json_data_hash: self.json_data_hash,
            python_env_data_hash: self.python_env_data_hash,
            start_in_seconds: self.start_in_seconds,
            end_in_seconds: self.end_in_seconds,
        })
    }
}

struct MessageRow {
    id: String,
    process_instance_id: String,
    message_type: String,
    name: String,
    status: String,
    correlation_keys: String,
    payload: Option<String>,
    counterpart_id: Option<String>,
    failure_cause: Option<String>,
    created_at: String,
    updated_at: String,
}

impl MessageRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            process_instance_id: row.try_get("process_instance_id")?,
            message_type: row.try_get("message_type")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            correlation_keys: row.try_get("correlation_keys")?,
            payload: row.try_get("payload")?,
            counterpart_id: row.try_get("counterpart_id")?,
            failure_cause: row.try_get("failure_cause")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_domain(self) -> Result<MessageInstance, RepositoryError> {
        let correlation_keys = serde_json::from_str(&self.correlation_keys)
            .map_err(|e| RepositoryError::Query(format!("invalid correlation keys: {e}")))?;
        Ok(MessageInstance {
            id: parse_uuid(&self.id)?,
            process_instance_id: parse_uuid(&self.process_instance_id)?,
            message_type: enum_from_str(&self.message_type)?,
            name: self.name,
            status: enum_from_str(&self.status)?,
            correlation_keys,
            payload: self.payload.as_deref().map(parse_json).transpose()?,
            counterpart_id: self.counterpart_id.as_deref().map(parse_uuid).transpose()?,
            failure_cause: self.failure_cause,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct QueueRow {
    process_instance_id: String,
    locked_by: Option<String>,
    locked_at: Option<String>,
    run_at: Option<String>,
    priority: i32,
}

impl QueueRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            process_instance_id: row.try_get("process_instance_id")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            run_at: row.try_get("run_at")?,
            priority: row.try_get("priority")?,
        })
    }

    fn into_domain(self) -> Result<QueueEntry, RepositoryError> {
        Ok(QueueEntry {
            process_instance_id: parse_uuid(&self.process_instance_id)?,
            locked_by: self.locked_by,
            locked_at: self.locked_at.as_deref().map(parse_datetime).transpose()?,
            run_at: self.run_at.as_deref().map(parse_datetime).transpose()?,
            priority: self.priority,
        })
    }
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

impl EngineRepository for SqliteEngineRepository {
    // -- Definitions --------------------------------------------------------

    async fn insert_definition(&self, def: &ProcessDefinition) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO process_definitions \
             (id, bpmn_identifier, display_name, single_process_hash, \
              full_process_model_hash, spec_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(def.id.to_string())
        .bind(&def.bpmn_identifier)
        .bind(&def.display_name)
        .bind(&def.single_process_hash)
        .bind(&def.full_process_model_hash)
        .bind(def.spec_json.to_string())
        .bind(format_datetime(&def.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<ProcessDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM process_definitions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_db_err)?;
        row.map(|r| DefinitionRow::from_row(&r).map_err(map_db_err)?.into_domain())
            .transpose()
    }

    async fn get_definition_by_single_hash(
        &self,
        hash: &str,
    ) -> Result<Option<ProcessDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM process_definitions WHERE single_process_hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_db_err)?;
        row.map(|r| DefinitionRow::from_row(&r).map_err(map_db_err)?.into_domain())
            .transpose()
    }

    async fn get_definition_by_full_hash(
        &self,
        hash: &str,
    ) -> Result<Option<ProcessDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM process_definitions WHERE full_process_model_hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_db_err)?;
        row.map(|r| DefinitionRow::from_row(&r).map_err(map_db_err)?.into_domain())
            .transpose()
    }

    async fn insert_task_definitions(&self, defs: &[TaskDefinition]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(map_db_err)?;
        for def in defs {
            sqlx::query(
                "INSERT INTO task_definitions (id, process_definition_id, bpmn_identifier, properties) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(def.id.to_string())
            .bind(def.process_definition_id.to_string())
            .bind(&def.bpmn_identifier)
            .bind(def.properties.to_string())
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        }
        tx.commit().await.map_err(map_db_err)
    }

    async fn list_task_definitions(
        &self,
        process_definition_id: &Uuid,
    ) -> Result<Vec<TaskDefinition>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM task_definitions WHERE process_definition_id = ? ORDER BY bpmn_identifier",
        )
        .bind(process_definition_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_db_err)?;
        rows.iter()
            .map(|r| TaskDefinitionRow::from_row(r).map_err(map_db_err)?.into_domain())
            .collect()
    }

    async fn upsert_definition_relationship(
        &self,
        rel: &DefinitionRelationship,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO definition_relationships (parent_id, child_id) VALUES (?, ?) \
             ON CONFLICT (parent_id, child_id) DO NOTHING",
        )
        .bind(rel.parent_id.to_string())
        .bind(rel.child_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn list_definition_relationships(
        &self,
        parent_id: &Uuid,
    ) -> Result<Vec<DefinitionRelationship>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM definition_relationships WHERE parent_id = ?")
            .bind(parent_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_db_err)?;
        rows.iter()
            .map(|r| {
                let parent: String = r.try_get("parent_id").map_err(map_db_err)?;
                let child: String = r.try_get("child_id").map_err(map_db_err)?;
                Ok(DefinitionRelationship {
                    parent_id: parse_uuid(&parent)?,
                    child_id: parse_uuid(&child)?,
                })
            })
            .collect()
    }

    async fn register_message_triggerable(
        &self,
        message_name: &str,
        process_model_identifier: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO message_triggerable_processes (message_name, process_model_identifier) \
             VALUES (?, ?) \
             ON CONFLICT (message_name) \
             DO UPDATE SET process_model_identifier = excluded.process_model_identifier",
        )
        .bind(message_name)
        .bind(process_model_identifier)
        .execute(&self.pool.writer)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn find_message_triggerable(
        &self,
        message_name: &str,
    ) -> Result<Option<String>, RepositoryError> {
        let row = sqlx::query(
            "SELECT process_model_identifier FROM message_triggerable_processes WHERE message_name = ?",
        )
        .bind(message_name)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(map_db_err)?;
        row.map(|r| r.try_get("process_model_identifier").map_err(map_db_err))
            .transpose()
    }

    // -- Instances ----------------------------------------------------------

    async fn create_instance(&self, instance: &ProcessInstance) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO process_instances \
             (id, process_model_identifier, process_definition_id, status, initiator, \
              start_at, end_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(instance.id.to_string())
        .bind(&instance.process_model_identifier)
        .bind(instance.process_definition_id.to_string())
        .bind(enum_to_str(&instance.status)?)
        .bind(&instance.initiator)
        .bind(instance.start_at.as_ref().map(format_datetime))
        .bind(instance.end_at.as_ref().map(format_datetime))
        .bind(format_datetime(&instance.created_at))
        .bind(format_datetime(&instance.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<ProcessInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM process_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_db_err)?;
        row.map(|r| InstanceRow::from_row(&r).map_err(map_db_err)?.into_domain())
            .transpose()
    }

    async fn update_instance(&self, instance: &ProcessInstance) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE process_instances \
             SET status = ?, start_at = ?, end_at = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(enum_to_str(&instance.status)?)
        .bind(instance.start_at.as_ref().map(format_datetime))
        .bind(instance.end_at.as_ref().map(format_datetime))
        .bind(format_datetime(&instance.updated_at))
        .bind(instance.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(map_db_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn create_bpmn_process(&self, process: &BpmnProcess) -> Result<(), RepositoryError> {
        let correlation_values = serde_json::to_string(&process.correlation_values)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        sqlx::query(
            "INSERT INTO bpmn_processes \
             (id, process_instance_id, process_definition_id, guid, correlation_values, \
              top_level, data_hash) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(process.id.to_string())
        .bind(process.process_instance_id.to_string())
        .bind(process.process_definition_id.to_string())
        .bind(process.guid.to_string())
        .bind(correlation_values)
        .bind(process.top_level)
        .bind(&process.data_hash)
        .execute(&self.pool.writer)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn list_bpmn_processes(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<BpmnProcess>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM bpmn_processes WHERE process_instance_id = ? ORDER BY id")
            .bind(instance_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_db_err)?;
        rows.iter()
            .map(|r| BpmnProcessRow::from_row(r).map_err(map_db_err)?.into_domain())
            .collect()
    }

    async fn update_bpmn_process(&self, process: &BpmnProcess) -> Result<(), RepositoryError> {
        let correlation_values = serde_json::to_string(&process.correlation_values)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE bpmn_processes SET correlation_values = ?, data_hash = ? WHERE id = ?",
        )
        .bind(correlation_values)
        .bind(&process.data_hash)
        .bind(process.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(map_db_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    // -- Tasks --------------------------------------------------------------

    async fn upsert_tasks(&self, tasks: &[Task]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(map_db_err)?;
        for task in tasks {
            let properties = serde_json::to_string(&task.properties)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            sqlx::query(
                "INSERT INTO tasks \
                 (guid, process_instance_id, task_definition_id, state, properties, \
                  json_data_hash, python_env_data_hash, start_in_seconds, end_in_seconds) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (guid) DO UPDATE SET \
                   state = excluded.state, \
                   properties = excluded.properties, \
                   json_data_hash = excluded.json_data_hash, \
                   python_env_data_hash = excluded.python_env_data_hash, \
                   start_in_seconds = excluded.start_in_seconds, \
                   end_in_seconds = excluded.end_in_seconds",
            )
            .bind(task.guid.to_string())
            .bind(task.process_instance_id.to_string())
            .bind(task.task_definition_id.to_string())
            .bind(enum_to_str(&task.state)?)
            .bind(properties)
            .bind(&task.json_data_hash)
            .bind(&task.python_env_data_hash)
            .bind(task.start_in_seconds)
            .bind(task.end_in_seconds)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        }
        tx.commit().await.map_err(map_db_err)
    }

    async fn get_task(&self, guid: &Uuid) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE guid = ?")
            .bind(guid.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_db_err)?;
        row.map(|r| TaskRow::from_row(&r).map_err(map_db_err)?.into_domain())
            .transpose()
    }

    async fn list_tasks(&self, instance_id: &Uuid) -> Result<Vec<Task>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE process_instance_id = ? ORDER BY guid")
            .bind(instance_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_db_err)?;
        rows.iter()
            .map(|r| TaskRow::from_row(r).map_err(map_db_err)?.into_domain())
            .collect()
    }

    // -- Data blobs ---------------------------------------------------------

    async fn put_blob(
        &self,
        hash: &str,
        payload: &serde_json::Value,
    ) -> Result<(), RepositoryError> {
        // Content-addressed: an existing hash means identical content.
        sqlx::query(
            "INSERT INTO json_data_blobs (hash, payload) VALUES (?, ?) \
             ON CONFLICT (hash) DO NOTHING",
        )
        .bind(hash)
        .bind(payload.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn get_blob(&self, hash: &str) -> Result<serde_json::Value, RepositoryError> {
        let row = sqlx::query("SELECT payload FROM json_data_blobs WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_db_err)?
            .ok_or(RepositoryError::NotFound)?;
        let payload: String = row.try_get("payload").map_err(map_db_err)?;
        parse_json(&payload)
    }

    // -- Messages -----------------------------------------------------------

    async fn create_message(&self, message: &MessageInstance) -> Result<(), RepositoryError> {
        let correlation_keys = serde_json::to_string(&message.correlation_keys)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        sqlx::query(
            "INSERT INTO message_instances \
             (id, process_instance_id, message_type, name, status, correlation_keys, \
              payload, counterpart_id, failure_cause, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(message.process_instance_id.to_string())
        .bind(enum_to_str(&message.message_type)?)
        .bind(&message.name)
        .bind(enum_to_str(&message.status)?)
        .bind(correlation_keys)
        .bind(message.payload.as_ref().map(|p| p.to_string()))
        .bind(message.counterpart_id.map(|id| id.to_string()))
        .bind(&message.failure_cause)
        .bind(format_datetime(&message.created_at))
        .bind(format_datetime(&message.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn get_message(&self, id: &Uuid) -> Result<Option<MessageInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM message_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_db_err)?;
        row.map(|r| MessageRow::from_row(&r).map_err(map_db_err)?.into_domain())
            .transpose()
    }

    async fn list_messages(&self, instance_id: &Uuid) -> Result<Vec<MessageInstance>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM message_instances WHERE process_instance_id = ? ORDER BY id",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_db_err)?;
        rows.iter()
            .map(|r| MessageRow::from_row(r).map_err(map_db_err)?.into_domain())
            .collect()
    }

    async fn list_ready_messages(
        &self,
        message_type: MessageType,
        name: Option<&str>,
    ) -> Result<Vec<MessageInstance>, RepositoryError> {
        // Ascending id: UUIDv7 sorts oldest first, so ties break toward
        // the oldest message.
        let rows = match name {
            Some(name) => {
                sqlx::query(
                    "SELECT * FROM message_instances \
                     WHERE status = 'ready' AND message_type = ? AND name = ? \
                     ORDER BY id ASC",
                )
                .bind(enum_to_str(&message_type)?)
                .bind(name)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM message_instances \
                     WHERE status = 'ready' AND message_type = ? \
                     ORDER BY id ASC",
                )
                .bind(enum_to_str(&message_type)?)
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(map_db_err)?;
        rows.iter()
            .map(|r| MessageRow::from_row(r).map_err(map_db_err)?.into_domain())
            .collect()
    }

    async fn claim_message(
        &self,
        id: &Uuid,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<bool, RepositoryError> {
        // Single-statement compare-and-set; the serialized writer pool and
        // SQLite's write lock make this atomic across workers.
        let result = sqlx::query(
            "UPDATE message_instances SET status = ?, updated_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(enum_to_str(&to)?)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .bind(enum_to_str(&from)?)
        .execute(&self.pool.writer)
        .await
        .map_err(map_db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_message(&self, message: &MessageInstance) -> Result<(), RepositoryError> {
        let correlation_keys = serde_json::to_string(&message.correlation_keys)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE message_instances \
             SET status = ?, correlation_keys = ?, payload = ?, counterpart_id = ?, \
                 failure_cause = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(enum_to_str(&message.status)?)
        .bind(correlation_keys)
        .bind(message.payload.as_ref().map(|p| p.to_string()))
        .bind(message.counterpart_id.map(|id| id.to_string()))
        .bind(&message.failure_cause)
        .bind(format_datetime(&message.updated_at))
        .bind(message.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(map_db_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    // -- Queue --------------------------------------------------------------

    async fn create_queue_entry(&self, entry: &QueueEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO instance_queue (process_instance_id, locked_by, locked_at, run_at, priority) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.process_instance_id.to_string())
        .bind(&entry.locked_by)
        .bind(entry.locked_at.as_ref().map(format_datetime))
        .bind(entry.run_at.as_ref().map(format_datetime))
        .bind(entry.priority)
        .execute(&self.pool.writer)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn get_queue_entry(
        &self,
        instance_id: &Uuid,
    ) -> Result<Option<QueueEntry>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM instance_queue WHERE process_instance_id = ?")
            .bind(instance_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_db_err)?;
        row.map(|r| QueueRow::from_row(&r).map_err(map_db_err)?.into_domain())
            .transpose()
    }

    async fn try_lock_instance(
        &self,
        instance_id: &Uuid,
        worker: &str,
        now: DateTime<Utc>,
        confiscation_secs: u64,
    ) -> Result<bool, RepositoryError> {
        // One conditional UPDATE covers every acquisition path: unlocked,
        // re-entrant same-worker, and confiscation of a stale lock.
        let stale_before = now - chrono::Duration::seconds(confiscation_secs as i64);
        let result = sqlx::query(
            "UPDATE instance_queue SET locked_by = ?, locked_at = ? \
             WHERE process_instance_id = ? \
               AND (locked_by IS NULL OR locked_by = ? OR locked_at <= ?)",
        )
        .bind(worker)
        .bind(format_datetime(&now))
        .bind(instance_id.to_string())
        .bind(worker)
        .bind(format_datetime(&stale_before))
        .execute(&self.pool.writer)
        .await
        .map_err(map_db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn unlock_instance(&self, instance_id: &Uuid, worker: &str) -> Result<(), RepositoryError> {
        // A lock lost to confiscation no longer matches and releases as a
        // no-op.
        sqlx::query(
            "UPDATE instance_queue SET locked_by = NULL, locked_at = NULL \
             WHERE process_instance_id = ? AND locked_by = ?",
        )
        .bind(instance_id.to_string())
        .bind(worker)
        .execute(&self.pool.writer)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
