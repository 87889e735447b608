use crate::graph::{ExecutionServices, TaskGraph};
use crate::persist::TaskMapper;

use super::{complete_with_hooks, ExecutionStrategy, StrategyError};

/// Runs engine tasks until quiescence: keeps completing every READY
/// engine task until none remain or the iteration cap trips.
#[derive(Debug)]
pub struct GreedyStrategy;

impl ExecutionStrategy for GreedyStrategy {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn run(
        &self,
        graph: &mut TaskGraph,
        mapper: &mut TaskMapper,
        services: &ExecutionServices<'_>,
        iteration_cap: usize,
    ) -> Result<(), StrategyError> {
        let mut iterations = 0;
        loop {
            let ready = graph.ready_engine_tasks();
            if ready.is_empty() {
                return Ok(());
            }
            if iterations >= iteration_cap {
                return Err(StrategyError::IterationCapExceeded { cap: iteration_cap });
            }
            iterations += 1;
            for guid in ready {
                complete_with_hooks(graph, mapper, services, &guid)?;
            }
        }
    }
}
