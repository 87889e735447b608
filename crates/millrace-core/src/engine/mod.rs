//! Workflow execution: instance locking and the engine-step service.

pub mod lock;
pub mod service;

pub use lock::{InstanceLock, InstanceLockService, LockError};
pub use service::{EngineError, ErrorTask, PendingTask, StepResult, WorkflowExecutionService};
