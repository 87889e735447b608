//! SQLite persistence for the workflow engine.

pub mod engine;
pub mod pool;
pub mod schema;

pub use engine::SqliteEngineRepository;
pub use pool::DatabasePool;
