use felix_core::prd::detect_cycle;
use felix_core::{FelixError, FelixResult, OrchestratorState, SkipReason, SkippedTask, Task};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{info, warn};

/// Dependency levels and skip propagation over a plan's task graph.
///
/// `level(t) = 0` for tasks without dependencies, otherwise
/// `1 + max(level(dep))`. No task depends on another in its own level.
/// Dependencies on ids outside the plan are treated as satisfied.
#[derive(Debug, Clone)]
pub struct Scheduler {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    /// Known dependencies only.
    dependencies: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
    levels: Vec<Vec<String>>,
}

impl Scheduler {
    pub fn new(tasks: &[Task]) -> FelixResult<Self> {
        let levels = compute_levels(tasks)?;
        let index: HashMap<String, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();

        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for task in tasks {
            let known: Vec<String> = task
                .dependencies
                .iter()
                .filter(|d| index.contains_key(d.as_str()))
                .cloned()
                .collect();
            for dep in &known {
                dependents.entry(dep.clone()).or_default().push(task.id.clone());
            }
            dependencies.insert(task.id.clone(), known);
        }

        Ok(Self {
            tasks: tasks.to_vec(),
            index,
            dependencies,
            dependents,
            levels,
        })
    }

    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|i| &self.tasks[*i])
    }

    /// Tasks that list `id` as a dependency, in plan order.
    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents.get(id).map_or(&[], Vec::as_slice)
    }

    /// True when some task has two or more dependents.
    pub fn has_fan_out(&self) -> bool {
        self.dependents.values().any(|d| d.len() >= 2)
    }

    /// True when some task has two or more dependencies.
    pub fn has_fan_in(&self) -> bool {
        self.dependencies.values().any(|d| d.len() >= 2)
    }

    /// Why `id` can no longer run, if one of its dependencies failed or was skipped.
    pub fn blocked_by(&self, id: &str, state: &OrchestratorState) -> Option<SkipReason> {
        let deps = self.dependencies.get(id)?;
        if let Some(dep) = deps.iter().find(|d| state.is_failed(d)) {
            return Some(SkipReason::DependencyFailed {
                dependency: dep.clone(),
            });
        }
        deps.iter().find(|d| state.is_skipped(d)).map(|dep| SkipReason::DependencySkipped {
            dependency: dep.clone(),
        })
    }

    /// Drop settled tasks from `level`, skip those whose dependencies failed
    /// or were skipped, and return the runnable remainder in level order.
    ///
    /// Levels must be filtered in order for the skip to cascade transitively.
    pub fn filter_runnable(
        &self,
        level: &[String],
        state: &mut OrchestratorState,
    ) -> (Vec<String>, Vec<SkippedTask>) {
        let mut runnable = Vec::new();
        let mut skipped = Vec::new();
        for id in level {
            if state.is_settled(id) {
                continue;
            }
            match self.blocked_by(id, state) {
                Some(reason) => {
                    info!(task_id = %id, reason = %reason, "Skipping task");
                    state.mark_skipped(id, reason.clone());
                    skipped.push(SkippedTask {
                        task_id: id.clone(),
                        reason,
                    });
                }
                None => runnable.push(id.clone()),
            }
        }
        (runnable, skipped)
    }

    /// Skip every unsettled transitive dependent of `root` right away.
    pub fn cascade_skip(&self, root: &str, state: &mut OrchestratorState) -> Vec<SkippedTask> {
        let mut skipped = Vec::new();
        let mut queue: VecDeque<String> = self.dependents(root).iter().cloned().collect();
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if state.is_settled(&id) {
                continue;
            }
            if let Some(reason) = self.blocked_by(&id, state) {
                info!(task_id = %id, reason = %reason, "Skipping task");
                state.mark_skipped(&id, reason.clone());
                skipped.push(SkippedTask {
                    task_id: id.clone(),
                    reason,
                });
                queue.extend(self.dependents(&id).iter().cloned());
            }
        }
        skipped
    }

    /// Unsettled tasks outside `in_flight` whose dependencies all completed,
    /// ordered by priority then plan order.
    pub fn ready(&self, state: &OrchestratorState, in_flight: &HashSet<String>) -> Vec<String> {
        let mut ready: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| !state.is_settled(&t.id) && !in_flight.contains(&t.id))
            .filter(|t| {
                self.dependencies
                    .get(&t.id)
                    .map_or(true, |deps| deps.iter().all(|d| state.is_completed(d)))
            })
            .collect();
        ready.sort_by_key(|t| (t.priority, self.index[&t.id]));
        ready.into_iter().map(|t| t.id.clone()).collect()
    }

    /// Ids of tasks not yet completed, failed or skipped, in plan order.
    pub fn unsettled(&self, state: &OrchestratorState) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| !state.is_settled(&t.id))
            .map(|t| t.id.clone())
            .collect()
    }
}

/// Group tasks into dependency levels. Within a level, tasks are ordered by
/// priority (critical first) and then by plan order.
pub fn compute_levels(tasks: &[Task]) -> FelixResult<Vec<Vec<String>>> {
    if let Some(cycle) = detect_cycle(tasks) {
        return Err(FelixError::InvalidPlan(vec![format!(
            "dependency cycle: {}",
            cycle.join(" -> ")
        )]));
    }

    let position: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();
    let mut level_of: HashMap<&str, usize> = HashMap::new();

    fn level<'a>(
        task: &'a Task,
        tasks: &'a [Task],
        position: &HashMap<&'a str, usize>,
        level_of: &mut HashMap<&'a str, usize>,
    ) -> usize {
        if let Some(l) = level_of.get(task.id.as_str()) {
            return *l;
        }
        let mut max_dep: Option<usize> = None;
        for dep in &task.dependencies {
            match position.get(dep.as_str()) {
                Some(&i) => {
                    let l = level(&tasks[i], tasks, position, level_of);
                    max_dep = Some(max_dep.map_or(l, |m| m.max(l)));
                }
                None => {
                    warn!(task_id = %task.id, dependency = %dep, "Unknown dependency, treating it as satisfied");
                }
            }
        }
        let l = max_dep.map_or(0, |m| m + 1);
        level_of.insert(task.id.as_str(), l);
        l
    }

    let mut levels: Vec<Vec<&Task>> = Vec::new();
    for task in tasks {
        let l = level(task, tasks, &position, &mut level_of);
        if levels.len() <= l {
            levels.resize_with(l + 1, Vec::new);
        }
        levels[l].push(task);
    }

    Ok(levels
        .into_iter()
        .map(|mut level| {
            level.sort_by_key(|t| (t.priority, position[t.id.as_str()]));
            level.into_iter().map(|t| t.id.clone()).collect()
        })
        .collect())
}
