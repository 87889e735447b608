//! Execution strategies: policies for how far one engine-step cycle runs.
//!
//! A strategy drives the graph through the mapper's will/did-complete
//! hooks but never touches storage itself; the engine service flushes the
//! mapper after the strategy returns, success or failure.

mod greedy;
mod one_at_a_time;
mod run_until_service_task;

pub use greedy::GreedyStrategy;
pub use one_at_a_time::OneAtATimeStrategy;
pub use run_until_service_task::RunUntilServiceTaskStrategy;

use thiserror::Error;

use crate::graph::{ExecutionServices, GraphError, TaskGraph};
use crate::persist::TaskMapper;

/// Errors raised by strategy execution. Task-level failures are not
/// errors here; they are recorded in the graph and surfaced after flush.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("unknown execution strategy '{0}'")]
    Unknown(String),

    #[error("engine steps exceeded the iteration cap of {cap}")]
    IterationCapExceeded { cap: usize },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// One engine-step policy.
pub trait ExecutionStrategy: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Run engine steps on the graph until this policy's stopping point.
    ///
    /// `iteration_cap` bounds greedy loops; exceeding it is an error, not
    /// a silent truncation.
    fn run(
        &self,
        graph: &mut TaskGraph,
        mapper: &mut TaskMapper,
        services: &ExecutionServices<'_>,
        iteration_cap: usize,
    ) -> Result<(), StrategyError>;
}

/// Look up a strategy by name.
pub fn strategy_named(name: &str) -> Result<Box<dyn ExecutionStrategy>, StrategyError> {
    match name {
        "greedy" => Ok(Box::new(GreedyStrategy)),
        "one_at_a_time" => Ok(Box::new(OneAtATimeStrategy)),
        "run_until_service_task" => Ok(Box::new(RunUntilServiceTaskStrategy)),
        other => Err(StrategyError::Unknown(other.to_string())),
    }
}

/// Complete one task through the mapper hooks.
fn complete_with_hooks(
    graph: &mut TaskGraph,
    mapper: &mut TaskMapper,
    services: &ExecutionServices<'_>,
    guid: &uuid::Uuid,
) -> Result<(), StrategyError> {
    mapper.on_task_will_complete(graph, guid);
    graph.complete_task(guid, services)?;
    mapper.on_task_did_complete(graph, guid);
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
