use crate::graph::{ExecutionServices, TaskGraph};
use crate::persist::TaskMapper;

use super::{complete_with_hooks, ExecutionStrategy, StrategyError};

/// Completes at most one READY engine task per cycle. Used by callers
/// that want to observe and persist every intermediate state.
#[derive(Debug)]
pub struct OneAtATimeStrategy;

impl ExecutionStrategy for OneAtATimeStrategy {
    fn name(&self) -> &'static str {
        "one_at_a_time"
    }

    fn run(
        &self,
        graph: &mut TaskGraph,
        mapper: &mut TaskMapper,
        services: &ExecutionServices<'_>,
        _iteration_cap: usize,
    ) -> Result<(), StrategyError> {
        if let Some(guid) = graph.ready_engine_tasks().first().copied() {
            complete_with_hooks(graph, mapper, services, &guid)?;
        }
        Ok(())
    }
}
