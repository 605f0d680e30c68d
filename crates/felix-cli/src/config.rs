use felix_agent::{FallbackConfig, HealthConfig, ModelConfig};
use felix_core::{Backend, Provider};
use felix_orchestrator::OrchestratorConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Config file read when `--config` is not given, if present.
pub const DEFAULT_CONFIG_FILE: &str = "felix.toml";

/// Contents of `felix.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct FelixConfig {
    /// Primary provider, backend and worker template.
    #[serde(default = "default_model")]
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// `[execution]`, `[router]`, `[retry]`, `[validation]`, `[quality_gate]`.
    #[serde(flatten)]
    pub orchestrator: OrchestratorConfig,
}

fn default_model() -> ModelConfig {
    ModelConfig::new(Provider::Anthropic, Backend::Cli, "claude-sonnet-4")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./.felix")
}

impl Default for FelixConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            fallback: FallbackConfig::default(),
            health: HealthConfig::default(),
            data_dir: default_data_dir(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl FelixConfig {
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: FelixConfig = toml::from_str(content)?;
        config.orchestrator.validate()?;
        Ok(config)
    }

    /// Read `path`, or `felix.toml` when it exists, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let content = std::fs::read_to_string(&path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        Self::parse(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config file '{}': {}", path.display(), e))
    }

    pub fn primary(&self) -> (Provider, Backend) {
        (self.model.provider, self.model.backend)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use felix_orchestrator::ExecutionMode;
    use std::io::Write;

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config = FelixConfig::parse("").unwrap();
        assert_eq!(config.primary(), (Provider::Anthropic, Backend::Cli));
        assert_eq!(config.data_dir, PathBuf::from("./.felix"));
        assert_eq!(config.orchestrator, OrchestratorConfig::default());
        assert_eq!(config.fallback.max_retries, 2);
    }

    #[test]
    fn test_full_file() {
        let config = FelixConfig::parse(
            r#"
            data_dir = "/var/lib/felix"

            [model]
            provider = "openai"
            backend = "api"
            model_id = "gpt-4.1"

            [fallback]
            max_retries = 4

            [health]
            max_consecutive_failures = 5

            [execution]
            max_parallel_tasks = 2
            mode = "hierarchical"
            max_cost_usd = 12.5

            [router]
            enable_cascade = true

            [validation]
            post_task = [{ name = "check", command = "cargo check" }]
            final = [{ name = "test", command = "cargo test" }]

            [quality_gate]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.primary(), (Provider::OpenAi, Backend::Api));
        assert_eq!(config.fallback.max_retries, 4);
        assert_eq!(config.health.max_consecutive_failures, 5);
        assert_eq!(config.orchestrator.execution.mode, Some(ExecutionMode::Hierarchical));
        assert_eq!(config.orchestrator.execution.max_cost_usd, Some(12.5));
        assert!(config.orchestrator.router.enable_cascade);
        assert_eq!(config.orchestrator.validation.final_steps[0].command, "cargo test");
        assert!(!config.orchestrator.quality_gate.enabled);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = FelixConfig::parse("[execution]\nmax_attempts = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_explicit_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = FelixConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("felix.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[execution]\nmax_tasks = 4").unwrap();
        let config = FelixConfig::load(Some(&path)).unwrap();
        assert_eq!(config.orchestrator.execution.max_tasks, Some(4));
    }
}
