use crate::graph::spec::TaskKind;
use crate::graph::{ExecutionServices, TaskGraph};
use crate::persist::TaskMapper;

use super::{complete_with_hooks, ExecutionStrategy, StrategyError};

/// Runs like greedy but halts before invoking any service task, leaving
/// it READY. Callers use this to review or gate external calls.
#[derive(Debug)]
pub struct RunUntilServiceTaskStrategy;

impl ExecutionStrategy for RunUntilServiceTaskStrategy {
    fn name(&self) -> &'static str {
        "run_until_service_task"
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
            let runnable: Vec<uuid::Uuid> = graph
                .ready_engine_tasks()
                .into_iter()
                .filter(|guid| {
                    !matches!(
                        graph.kind_of(guid),
                        Ok(Some(TaskKind::ServiceTask { .. }))
                    )
                })
                .collect();
            if runnable.is_empty() {
                return Ok(());
            }
            if iterations >= iteration_cap {
                return Err(StrategyError::IterationCapExceeded { cap: iteration_cap });
            }
            iterations += 1;
            for guid in runnable {
                complete_with_hooks(graph, mapper, services, &guid)?;
            }
        }
    }
}
