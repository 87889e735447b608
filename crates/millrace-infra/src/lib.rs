//! Infrastructure layer for Millrace.
//!
//! Implements the `EngineRepository` trait defined in `millrace-core` with
//! SQLite storage through sqlx, using split read/write pools in WAL mode.

pub mod sqlite;
