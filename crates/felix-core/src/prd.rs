use crate::task::Task;
use crate::{FelixError, FelixResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::warn;

/// Execution knobs carried inside the plan document itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrdConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    /// Pins every task to this model, bypassing routing.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_temperature() -> f32 {
    0.2
}

impl Default for PrdConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_cost_usd: None,
            model: None,
            continue_on_failure: false,
            retry_delay_ms: default_retry_delay_ms(),
            temperature: default_temperature(),
        }
    }
}

/// A plan of work: a named project and its tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prd {
    pub version: String,
    pub project: String,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub config: PrdConfig,
}

impl Prd {
    pub fn new(project: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            version: "1.0".to_string(),
            project: project.into(),
            tasks,
            config: PrdConfig::default(),
        }
    }

    /// Parse and validate a plan document.
    pub fn from_json(json: &str) -> FelixResult<Self> {
        let prd: Prd = serde_json::from_str(json)
            .map_err(|e| FelixError::InvalidPlan(vec![format!("malformed plan JSON: {e}")]))?;
        prd.validate()?;
        Ok(prd)
    }

    /// Read, parse and validate a plan file.
    pub fn load(path: &Path) -> FelixResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FelixError::InvalidPlan(vec![format!("cannot read {}: {e}", path.display())])
        })?;
        Self::from_json(&content)
    }

    /// Check the plan and return every problem found, not only the first one.
    ///
    /// A dependency naming a task that is not in the plan is not an error: it
    /// is logged and treated as already satisfied when scheduling.
    pub fn validate(&self) -> FelixResult<()> {
        let mut errors = Vec::new();

        if self.version.trim().is_empty() {
            errors.push("version must not be empty".to_string());
        }
        if self.project.trim().is_empty() {
            errors.push("project must not be empty".to_string());
        }
        if self.tasks.is_empty() {
            errors.push("plan has no tasks".to_string());
        }
        if self.config.max_attempts == 0 {
            errors.push("config.maxAttempts must be at least 1".to_string());
        }
        if let Some(limit) = self.config.max_cost_usd {
            if !limit.is_finite() || limit <= 0.0 {
                errors.push(format!("config.maxCostUsd must be positive, got {limit}"));
            }
        }
        if !(0.0..=2.0).contains(&self.config.temperature) {
            errors.push(format!(
                "config.temperature must be within 0.0..=2.0, got {}",
                self.config.temperature
            ));
        }

        let mut seen = HashSet::new();
        for (index, task) in self.tasks.iter().enumerate() {
            if task.id.trim().is_empty() {
                errors.push(format!("tasks[{index}] has an empty id"));
            } else if !seen.insert(task.id.as_str()) {
                errors.push(format!("duplicate task id '{}'", task.id));
            }
            if task.title.trim().is_empty() {
                errors.push(format!("task '{}' has an empty title", task.id));
            }
            if task.dependencies.iter().any(|d| d == &task.id) {
                errors.push(format!("task '{}' depends on itself", task.id));
            }
        }

        for task in &self.tasks {
            for dep in &task.dependencies {
                if !seen.contains(dep.as_str()) {
                    warn!(
                        task_id = %task.id,
                        dependency = %dep,
                        "Unknown dependency, treating it as satisfied"
                    );
                }
            }
        }

        if let Some(cycle) = detect_cycle(&self.tasks) {
            errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(FelixError::InvalidPlan(errors))
        }
    }

    /// Stable hash of everything that affects scheduling and execution.
    /// A checkpoint is only trusted when its hash equals the current plan's.
    pub fn plan_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.project.as_bytes());
        hasher.update([0u8]);
        for task in &self.tasks {
            // Struct field order is fixed, so serialization is canonical.
            let encoded = serde_json::to_vec(task).unwrap_or_default();
            hasher.update(&encoded);
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

/// Find a dependency cycle, returning the path that closes it.
pub fn detect_cycle(tasks: &[Task]) -> Option<Vec<String>> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    // 1 = on the current path, 2 = fully explored
    let mut marks: HashMap<&str, u8> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a Task>,
        marks: &mut HashMap<&'a str, u8>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(id) {
            Some(1) => {
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(id.to_string());
                return Some(cycle);
            }
            Some(2) => return None,
            _ => {}
        }
        let task: &'a Task = *by_id.get(id)?;
        marks.insert(id, 1);
        path.push(id);
        for dep in &task.dependencies {
            if let Some(cycle) = visit(dep.as_str(), by_id, marks, path) {
                return Some(cycle);
            }
        }
        path.pop();
        marks.insert(id, 2);
        None
    }

    for task in tasks {
        if let Some(cycle) = visit(task.id.as_str(), &by_id, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}
