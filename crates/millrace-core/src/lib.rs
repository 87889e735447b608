//! Workflow execution engine for Millrace.
//!
//! This crate holds the engine itself: the in-memory task graph, execution
//! strategies, the persistence mapper, content-addressed definition
//! handling, and message correlation. Storage is reached only through the
//! [`repository::EngineRepository`] trait; the SQLite implementation lives
//! in `millrace-infra`.

pub mod contracts;
pub mod definitions;
pub mod engine;
pub mod expression;
pub mod graph;
pub mod hash;
pub mod messaging;
pub mod persist;
pub mod repository;
pub mod strategy;
