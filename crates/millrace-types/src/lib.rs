//! Shared domain types for Millrace.
//!
//! This crate contains the persisted entities of the workflow engine:
//! process definitions, process instances, tasks, message instances, the
//! instance lock queue, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod definition;
pub mod error;
pub mod message;
pub mod process;
pub mod queue;
pub mod task;
