use crate::scheduler::Scheduler;
use felix_core::FelixError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How tasks are dispatched to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Levels in order, one task at a time.
    Sequential,
    /// Levels in order, up to `max_parallel_tasks` tasks of a level at once.
    BoundedParallel,
    /// No level barrier: a task starts as soon as its dependencies completed.
    Hierarchical,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Sequential => write!(f, "sequential"),
            ExecutionMode::BoundedParallel => write!(f, "bounded_parallel"),
            ExecutionMode::Hierarchical => write!(f, "hierarchical"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = FelixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "sequential" => Ok(ExecutionMode::Sequential),
            "bounded_parallel" | "parallel" => Ok(ExecutionMode::BoundedParallel),
            "hierarchical" => Ok(ExecutionMode::Hierarchical),
            other => Err(FelixError::Config(format!("unknown execution mode '{other}'"))),
        }
    }
}

/// Choose the dispatch strategy for a plan. An explicit mode always wins.
pub fn select_mode(
    configured: Option<ExecutionMode>,
    enable_hierarchical: bool,
    max_parallel_tasks: usize,
    scheduler: &Scheduler,
) -> ExecutionMode {
    if let Some(mode) = configured {
        return mode;
    }
    if enable_hierarchical && scheduler.has_fan_out() && scheduler.has_fan_in() {
        return ExecutionMode::Hierarchical;
    }
    if max_parallel_tasks > 1 && scheduler.levels().iter().any(|level| level.len() > 1) {
        return ExecutionMode::BoundedParallel;
    }
    ExecutionMode::Sequential
}

#[cfg(test)]
mod tests {
    use super::*;
    use felix_core::Task;

    fn diamond() -> Scheduler {
        Scheduler::new(&[
            Task::new("A", "a"),
            Task::new("B", "b").with_dependencies(["A"]),
            Task::new("C", "c").with_dependencies(["A"]),
            Task::new("D", "d").with_dependencies(["B", "C"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_diamond_is_hierarchical() {
        assert_eq!(select_mode(None, true, 3, &diamond()), ExecutionMode::Hierarchical);
        assert_eq!(select_mode(None, false, 3, &diamond()), ExecutionMode::BoundedParallel);
        assert_eq!(select_mode(None, false, 1, &diamond()), ExecutionMode::Sequential);
    }

    #[test]
    fn test_chain_is_sequential() {
        let chain = Scheduler::new(&[Task::new("A", "a"), Task::new("B", "b").with_dependencies(["A"])]).unwrap();
        assert_eq!(select_mode(None, true, 3, &chain), ExecutionMode::Sequential);
    }

    #[test]
    fn test_explicit_mode_wins() {
        assert_eq!(
            select_mode(Some(ExecutionMode::Sequential), true, 3, &diamond()),
            ExecutionMode::Sequential
        );
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("bounded-parallel".parse::<ExecutionMode>().unwrap(), ExecutionMode::BoundedParallel);
        assert_eq!("Hierarchical".parse::<ExecutionMode>().unwrap(), ExecutionMode::Hierarchical);
        assert!("swarm".parse::<ExecutionMode>().is_err());
        assert_eq!(ExecutionMode::BoundedParallel.to_string(), "bounded_parallel");
    }
}
