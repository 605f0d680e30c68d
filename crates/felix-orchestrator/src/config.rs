use crate::modes::ExecutionMode;
use crate::plugins::{QualityGateConfig, RetryConfig, ValidationConfig};
use crate::router::RouterConfig;
use felix_core::{FelixError, FelixResult, PrdConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// `[execution]` section: how a run dispatches and bounds its work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
    /// Explicit dispatch mode; chosen from the plan's shape when unset.
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default = "default_true")]
    pub enable_hierarchical: bool,
    #[serde(default = "default_true")]
    pub enable_checkpoints: bool,
    /// Ask workers not to touch files. Also disables checkpoint writes.
    #[serde(default)]
    pub dry_run: bool,
    /// Execute at most this many tasks; the rest are skipped.
    #[serde(default)]
    pub max_tasks: Option<usize>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    /// Keep going after a task fails or the budget rejects one.
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Pin every task to this model.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
}

fn default_max_parallel_tasks() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_temperature() -> f32 {
    0.2
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: default_max_parallel_tasks(),
            mode: None,
            enable_hierarchical: default_true(),
            enable_checkpoints: default_true(),
            dry_run: false,
            max_tasks: None,
            max_attempts: default_max_attempts(),
            max_cost_usd: None,
            continue_on_failure: false,
            temperature: default_temperature(),
            model: None,
            working_dir: default_working_dir(),
        }
    }
}

/// Everything an [`Orchestrator`](crate::Orchestrator) run is configured by.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub quality_gate: QualityGateConfig,
    /// Set once a plan's `config` block has been layered in.
    #[serde(skip)]
    pub(crate) plan_layered: bool,
}

impl OrchestratorConfig {
    /// Layer the plan's own `config` block over this configuration. Fields
    /// the plan leaves at their defaults do not override.
    pub fn apply_prd(&mut self, prd: &PrdConfig) {
        self.plan_layered = true;
        let defaults = PrdConfig::default();
        if prd.max_attempts != defaults.max_attempts {
            self.execution.max_attempts = prd.max_attempts;
        }
        if prd.max_cost_usd.is_some() {
            self.execution.max_cost_usd = prd.max_cost_usd;
        }
        if prd.model.is_some() {
            self.execution.model.clone_from(&prd.model);
        }
        if prd.continue_on_failure {
            self.execution.continue_on_failure = true;
        }
        if prd.retry_delay_ms != defaults.retry_delay_ms {
            self.retry.base_delay_ms = prd.retry_delay_ms;
        }
        if (prd.temperature - defaults.temperature).abs() > f32::EPSILON {
            self.execution.temperature = prd.temperature;
        }
    }

    pub fn validate(&self) -> FelixResult<()> {
        let mut errors = Vec::new();
        if self.execution.max_parallel_tasks == 0 {
            errors.push("execution.max_parallel_tasks must be at least 1".to_string());
        }
        if self.execution.max_attempts == 0 {
            errors.push("execution.max_attempts must be at least 1".to_string());
        }
        if let Some(limit) = self.execution.max_cost_usd {
            if !limit.is_finite() || limit <= 0.0 {
                errors.push(format!("execution.max_cost_usd must be positive, got {limit}"));
            }
        }
        if !(0.0..=1.0).contains(&self.router.min_success_rate) {
            errors.push("router.min_success_rate must be within 0.0..=1.0".to_string());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push("retry.max_delay_ms must not be below retry.base_delay_ms".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FelixError::Config(errors.join("; ")))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.execution.max_parallel_tasks, 3);
        assert_eq!(config.execution.max_attempts, 3);
        assert!(config.execution.enable_checkpoints);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_prd_layering() {
        let mut config = OrchestratorConfig::default();
        config.execution.max_attempts = 5;
        config.execution.max_cost_usd = Some(10.0);

        // A plan that leaves everything at its defaults changes nothing.
        config.apply_prd(&PrdConfig::default());
        assert_eq!(config.execution.max_attempts, 5);
        assert_eq!(config.execution.max_cost_usd, Some(10.0));

        let prd = PrdConfig {
            max_attempts: 2,
            max_cost_usd: Some(1.0),
            model: Some("sonnet".into()),
            continue_on_failure: true,
            retry_delay_ms: 50,
            temperature: 0.7,
        };
        config.apply_prd(&prd);
        assert_eq!(config.execution.max_attempts, 2);
        assert_eq!(config.execution.max_cost_usd, Some(1.0));
        assert_eq!(config.execution.model.as_deref(), Some("sonnet"));
        assert!(config.execution.continue_on_failure);
        assert_eq!(config.retry.base_delay_ms, 50);
        assert!((config.execution.temperature - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn test_prd_layering_is_remembered() {
        let mut config = OrchestratorConfig::default();
        assert!(!config.plan_layered);
        config.apply_prd(&PrdConfig::default());
        assert!(config.plan_layered);
        // Not part of the file format.
        let text = serde_json::to_string(&config).unwrap();
        assert!(!text.contains("plan_layered"));
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut config = OrchestratorConfig::default();
        config.execution.max_parallel_tasks = 0;
        config.execution.max_cost_usd = Some(-1.0);
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("max_parallel_tasks"));
        assert!(msg.contains("max_cost_usd"));
    }

    #[test]
    fn test_sections_from_toml() {
        let config: OrchestratorConfig = toml::from_str(
            r#"
            [execution]
            max_parallel_tasks = 5
            mode = "sequential"

            [router]
            enable_cascade = true
            max_tier = "high"

            [retry]
            strategy = "linear"
            "#,
        )
        .unwrap();
        assert_eq!(config.execution.max_parallel_tasks, 5);
        assert_eq!(config.execution.mode, Some(ExecutionMode::Sequential));
        assert!(config.router.enable_cascade);
        assert_eq!(config.router.min_history_samples, 3);
        assert_eq!(config.retry.base_delay_ms, 1_000);
    }
}
