use felix_core::{Backend, Provider};
use serde::{Deserialize, Serialize};

/// Everything needed to build one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: Provider,
    #[serde(default = "default_backend")]
    pub backend: Backend,
    pub model_id: String,
    /// API key for the HTTP backend; falls back to the provider's env var.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
}

fn default_backend() -> Backend {
    Backend::Cli
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_max_turns() -> u32 {
    40
}

impl ModelConfig {
    pub fn new(provider: Provider, backend: Backend, model_id: impl Into<String>) -> Self {
        Self {
            provider,
            backend,
            model_id: model_id.into(),
            api_key: None,
            api_base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_turns: default_max_turns(),
        }
    }

    pub fn base_url(&self) -> &str {
        if let Some(url) = &self.api_base_url {
            url
        } else {
            match self.provider {
                Provider::Anthropic => "https://api.anthropic.com",
                Provider::OpenAi => "https://api.openai.com",
                Provider::Google => "https://generativelanguage.googleapis.com/v1beta/openai",
            }
        }
    }

    /// Explicit key, else the provider's environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var(self.provider.api_key_env()).ok())
            .filter(|k| !k.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_defaults() {
        let c = ModelConfig::new(Provider::Anthropic, Backend::Api, "claude-sonnet-4");
        assert_eq!(c.base_url(), "https://api.anthropic.com");
        let o = ModelConfig::new(Provider::OpenAi, Backend::Api, "gpt-4.1");
        assert_eq!(o.base_url(), "https://api.openai.com");
    }

    #[test]
    fn test_base_url_override() {
        let mut c = ModelConfig::new(Provider::Anthropic, Backend::Api, "x");
        c.api_base_url = Some("http://localhost:8080".into());
        assert_eq!(c.base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let c: ModelConfig = serde_json::from_value(serde_json::json!({
            "provider": "anthropic",
            "model_id": "claude-sonnet-4"
        }))
        .unwrap();
        assert_eq!(c.backend, Backend::Cli);
        assert_eq!(c.max_turns, 40);
        assert!(c.api_key.is_none());
    }

    #[test]
    fn test_explicit_api_key_wins() {
        let mut c = ModelConfig::new(Provider::Google, Backend::Api, "gemini-2.5-pro");
        c.api_key = Some("k-123".into());
        assert_eq!(c.resolve_api_key().as_deref(), Some("k-123"));
    }
}
