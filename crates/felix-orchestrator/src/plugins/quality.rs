use super::validation::{run_step, ValidationStep};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// `[quality_gate]` section of the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Detector commands; each failing command is one issue.
    #[serde(default)]
    pub checks: Vec<ValidationStep>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            checks: Vec::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QualityReport {
    pub passed: bool,
    pub issues: Vec<String>,
}

/// End-of-run code quality check. Its verdict is reported but never
/// changes the run's status.
#[async_trait]
pub trait QualityGate: Send + Sync {
    async fn check(&self, working_dir: &Path) -> QualityReport;
}

/// Runs external detector commands (linters, dead-code finders).
#[derive(Debug, Clone, Default)]
pub struct CommandQualityGate {
    config: QualityGateConfig,
}

impl CommandQualityGate {
    pub fn new(config: QualityGateConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl QualityGate for CommandQualityGate {
    async fn check(&self, working_dir: &Path) -> QualityReport {
        if !self.config.enabled {
            return QualityReport {
                passed: true,
                issues: Vec::new(),
            };
        }
        let mut issues = Vec::new();
        for step in &self.config.checks {
            if let Err(e) = run_step(step, working_dir, self.config.timeout_secs).await {
                issues.push(e);
            }
        }
        tracing::info!(issues = issues.len(), "Quality gate finished");
        QualityReport {
            passed: issues.is_empty(),
            issues,
        }
    }
}
