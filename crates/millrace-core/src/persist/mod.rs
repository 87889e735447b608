//! Persistence mapping between the live task graph and storage.

pub mod mapper;
pub mod registry;

pub use mapper::{hydrate_graph, DefinitionIndex, MapperError, TaskMapper};
pub use registry::{SerializationRegistry, SLOT_JSON_DATA, SLOT_SCRIPT_ENV};
