//! Embedded schema DDL, applied idempotently at pool creation.
//!
//! UUIDs, timestamps (RFC 3339), and JSON blobs are stored as TEXT.
//! Content-hashed tables carry UNIQUE constraints so concurrent inserts of
//! identical content surface as conflicts instead of duplicates.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS process_definitions (
    id                      TEXT PRIMARY KEY,
    bpmn_identifier         TEXT NOT NULL,
    display_name            TEXT NOT NULL,
    single_process_hash     TEXT NOT NULL UNIQUE,
    full_process_model_hash TEXT,
    spec_json               TEXT NOT NULL,
    created_at              TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_process_definitions_full_hash
    ON process_definitions(full_process_model_hash);

CREATE TABLE IF NOT EXISTS task_definitions (
    id                    TEXT PRIMARY KEY,
    process_definition_id TEXT NOT NULL REFERENCES process_definitions(id),
    bpmn_identifier       TEXT NOT NULL,
    properties            TEXT NOT NULL,
    UNIQUE (process_definition_id, bpmn_identifier)
);

CREATE TABLE IF NOT EXISTS definition_relationships (
    parent_id TEXT NOT NULL REFERENCES process_definitions(id),
    child_id  TEXT NOT NULL REFERENCES process_definitions(id),
    PRIMARY KEY (parent_id, child_id)
);

CREATE TABLE IF NOT EXISTS message_triggerable_processes (
    message_name             TEXT PRIMARY KEY,
    process_model_identifier TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS process_instances (
    id                       TEXT PRIMARY KEY,
    process_model_identifier TEXT NOT NULL,
    process_definition_id    TEXT NOT NULL REFERENCES process_definitions(id),
    status                   TEXT NOT NULL,
    initiator                TEXT NOT NULL,
    start_at                 TEXT,
    end_at                   TEXT,
    created_at               TEXT NOT NULL,
    updated_at               TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bpmn_processes (
    id                    TEXT PRIMARY KEY,
    process_instance_id   TEXT NOT NULL REFERENCES process_instances(id),
    process_definition_id TEXT NOT NULL REFERENCES process_definitions(id),
    guid                  TEXT NOT NULL,
    correlation_values    TEXT NOT NULL,
    top_level             INTEGER NOT NULL,
    data_hash             TEXT
);

CREATE INDEX IF NOT EXISTS idx_bpmn_processes_instance
    ON bpmn_processes(process_instance_id);

CREATE TABLE IF NOT EXISTS tasks (
    guid                 TEXT PRIMARY KEY,
    process_instance_id  TEXT NOT NULL REFERENCES process_instances(id),
    task_definition_id   TEXT NOT NULL REFERENCES task_definitions(id),
    state                TEXT NOT NULL,
    properties           TEXT NOT NULL,
    json_data_hash       TEXT,
    python_env_data_hash TEXT,
    start_in_seconds     REAL,
    end_in_seconds       REAL
);

CREATE INDEX IF NOT EXISTS idx_tasks_instance
    ON tasks(process_instance_id);

CREATE TABLE IF NOT EXISTS json_data_blobs (
    hash    TEXT PRIMARY KEY,
    payload TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS message_instances (
    id                  TEXT PRIMARY KEY,
    process_instance_id TEXT NOT NULL REFERENCES process_instances(id),
    message_type        TEXT NOT NULL,
    name                TEXT NOT NULL,
    status              TEXT NOT NULL,
    correlation_keys    TEXT NOT NULL,
    payload             TEXT,
    counterpart_id      TEXT,
    failure_cause       TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_message_instances_ready
    ON message_instances(status, message_type, name);

CREATE TABLE IF NOT EXISTS instance_queue (
    process_instance_id TEXT PRIMARY KEY REFERENCES process_instances(id),
    locked_by           TEXT,
    locked_at           TEXT,
    run_at              TEXT,
    priority            INTEGER NOT NULL DEFAULT 0
);
"#;
