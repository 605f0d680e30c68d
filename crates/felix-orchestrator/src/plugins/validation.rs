use async_trait::async_trait;
use felix_core::Task;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// One shell command whose exit status decides pass or fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationStep {
    pub name: String,
    pub command: String,
}

impl ValidationStep {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

/// `[validation]` section of the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Run after every successful task attempt (e.g. a typecheck).
    #[serde(default)]
    pub post_task: Vec<ValidationStep>,
    /// Run once after all tasks (e.g. the full test suite).
    #[serde(default, rename = "final")]
    pub final_steps: Vec<ValidationStep>,
    /// Synthesise a fix task when the final pass fails.
    #[serde(default = "default_fix_task")]
    pub fix_task: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_fix_task() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            post_task: Vec::new(),
            final_steps: Vec::new(),
            fix_task: default_fix_task(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Result of a validation pass. `errors` holds the raw output of every
/// failing step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            errors: Vec::new(),
        }
    }

    pub fn fail(errors: Vec<String>) -> Self {
        Self {
            passed: false,
            errors,
        }
    }
}

/// Checks the working tree after a task and at the end of a run.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Whether a final pass would do anything.
    fn has_final(&self) -> bool;

    async fn validate_task(&self, task: &Task, working_dir: &Path) -> ValidationReport;

    async fn validate_final(&self, working_dir: &Path) -> ValidationReport;
}

/// Runs configured shell commands with `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct CommandValidator {
    config: ValidationConfig,
}

impl CommandValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Validator for CommandValidator {
    fn has_final(&self) -> bool {
        !self.config.final_steps.is_empty()
    }

    async fn validate_task(&self, task: &Task, working_dir: &Path) -> ValidationReport {
        if self.config.post_task.is_empty() {
            return ValidationReport::pass();
        }
        info!(task_id = %task.id, steps = self.config.post_task.len(), "Running post-task validation");
        run_steps(&self.config.post_task, working_dir, self.config.timeout_secs).await
    }

    async fn validate_final(&self, working_dir: &Path) -> ValidationReport {
        if self.config.final_steps.is_empty() {
            return ValidationReport::pass();
        }
        info!(steps = self.config.final_steps.len(), "Running final validation");
        run_steps(&self.config.final_steps, working_dir, self.config.timeout_secs).await
    }
}

/// Run every step, collecting the failures.
pub async fn run_steps(steps: &[ValidationStep], working_dir: &Path, timeout_secs: u64) -> ValidationReport {
    let mut errors = Vec::new();
    for step in steps {
        if let Err(e) = run_step(step, working_dir, timeout_secs).await {
            warn!(step = %step.name, error = %e, "Validation step failed");
            errors.push(e);
        }
    }
    if errors.is_empty() {
        ValidationReport::pass()
    } else {
        ValidationReport::fail(errors)
    }
}

/// Run one step; `Err` carries the step name and its output.
pub async fn run_step(step: &ValidationStep, working_dir: &Path, timeout_secs: u64) -> Result<(), String> {
    let result = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&step.command)
            .current_dir(working_dir)
            .kill_on_drop(true)
            .output(),
    )
    .await;

    match result {
        Ok(Ok(output)) if output.status.success() => Ok(()),
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output.status.code().unwrap_or(-1);
            Err(format!(
                "{} failed (exit {code}):\n{}{}",
                step.name,
                truncate_output(&stdout, 4_000),
                truncate_output(&stderr, 4_000)
            ))
        }
        Ok(Err(e)) => Err(format!("{}: failed to run '{}': {e}", step.name, step.command)),
        Err(_) => Err(format!("{}: timed out after {timeout_secs}s", step.name)),
    }
}

fn truncate_output(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}... [truncated, {} total bytes]", &s[..idx], s.len()),
        None => s.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passing_step() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_steps(&[ValidationStep::new("true", "true")], dir.path(), 10).await;
        assert!(report.passed);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_failing_step_keeps_raw_output() {
        let dir = tempfile::tempdir().unwrap();
        let steps = [
            ValidationStep::new("typecheck", "echo 'error TS2322: bad type' >&2; exit 2"),
            ValidationStep::new("lint", "true"),
        ];
        let report = run_steps(&steps, dir.path(), 10).await;
        assert!(!report.passed);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("typecheck failed (exit 2)"));
        assert!(report.errors[0].contains("TS2322"));
    }

    #[tokio::test]
    async fn test_step_runs_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();
        let step = ValidationStep::new("marker", "test -f marker");
        assert!(run_step(&step, dir.path(), 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_step(&ValidationStep::new("slow", "sleep 5"), dir.path(), 1)
            .await
            .unwrap_err();
        assert!(err.contains("timed out"));
    }

    #[tokio::test]
    async fn test_validator_without_steps_passes() {
        let dir = tempfile::tempdir().unwrap();
        let v = CommandValidator::default();
        assert!(!v.has_final());
        assert!(v.validate_final(dir.path()).await.passed);
        assert!(v.validate_task(&Task::new("A", "a"), dir.path()).await.passed);
    }

    #[test]
    fn test_config_from_toml_names() {
        let config: ValidationConfig = toml::from_str(
            r#"
            post_task = [{ name = "check", command = "cargo check" }]
            final = [{ name = "test", command = "cargo test" }]
            "#,
        )
        .unwrap();
        assert_eq!(config.post_task[0].command, "cargo check");
        assert_eq!(config.final_steps[0].name, "test");
        assert!(config.fix_task);
        assert_eq!(config.timeout_secs, 300);
    }

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("abc", 10), "abc");
        assert!(truncate_output("abcdef", 3).starts_with("abc... [truncated, 6"));
    }
}
