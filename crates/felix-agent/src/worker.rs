use async_trait::async_trait;
use felix_core::{Backend, FelixResult, Provider, Task, TokenUsage};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Everything a worker needs to attempt one task.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub task: Task,
    /// Fully rendered instructions for the model.
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
    /// Directory the worker operates in.
    pub working_dir: PathBuf,
    /// Ask the worker to plan only, without touching files.
    pub dry_run: bool,
}

/// What a worker reports back. File changes are recorded, never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkOutcome {
    pub success: bool,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    pub file_changes: Vec<String>,
    pub output: String,
    pub error: Option<String>,
}

impl WorkOutcome {
    pub fn succeeded(output: impl Into<String>, tokens: TokenUsage, cost_usd: f64) -> Self {
        Self {
            success: true,
            tokens,
            cost_usd,
            file_changes: Vec::new(),
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, tokens: TokenUsage, cost_usd: f64) -> Self {
        Self {
            success: false,
            tokens,
            cost_usd,
            file_changes: Vec::new(),
            output: String::new(),
            error: Some(error.into()),
        }
    }
}

/// An executable handle on one model through one backend.
///
/// How the worker turns a task into file changes (prompting, tool use) is
/// its own business; the orchestrator only sees the outcome.
#[async_trait]
pub trait Worker: Send + Sync {
    fn provider(&self) -> Provider;

    fn backend(&self) -> Backend;

    fn model(&self) -> &str;

    /// Cheap local check that the worker could be invoked (credentials
    /// present and so on). Does not contact the provider.
    fn ready(&self) -> FelixResult<()> {
        Ok(())
    }

    /// Attempt the task. `Err` means the worker could not be driven at all
    /// (spawn failure, transport error, timeout); `Ok` with
    /// `success == false` means it ran and reported failure.
    async fn execute(&self, request: &WorkRequest) -> FelixResult<WorkOutcome>;
}

/// Render the instructions sent to a worker for a task.
pub fn build_task_prompt(task: &Task, project: &str) -> String {
    let mut prompt = format!(
        "You are working on the project \"{project}\".\n\n## Task {}: {}\n",
        task.id, task.title
    );
    if !task.description.is_empty() {
        prompt.push_str(&format!("\n{}\n", task.description));
    }
    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\n## Acceptance criteria\n");
        for criterion in &task.acceptance_criteria {
            prompt.push_str(&format!("- {criterion}\n"));
        }
    }
    if !task.files_affected.is_empty() {
        prompt.push_str("\n## Files likely affected\n");
        for file in &task.files_affected {
            prompt.push_str(&format!("- {file}\n"));
        }
    }
    prompt.push_str(
        "\nImplement the task completely. Do not stop at a plan. \
         When finished, make sure the project still builds.\n",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_contains_task_details() {
        let task = Task::new("T-7", "Add rate limiting")
            .with_description("Limit login attempts per IP.")
            .with_acceptance_criteria(["5 attempts per minute", "returns 429"])
            .with_files(["src/auth/limiter.rs"]);
        let prompt = build_task_prompt(&task, "shop");
        assert!(prompt.contains("\"shop\""));
        assert!(prompt.contains("Task T-7: Add rate limiting"));
        assert!(prompt.contains("- returns 429"));
        assert!(prompt.contains("src/auth/limiter.rs"));
    }

    #[test]
    fn test_prompt_omits_empty_sections() {
        let prompt = build_task_prompt(&Task::new("A", "Bare"), "p");
        assert!(!prompt.contains("Acceptance criteria"));
        assert!(!prompt.contains("Files likely affected"));
    }
}
