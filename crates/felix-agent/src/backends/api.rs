use super::{excerpt, parse_usage};
use crate::catalog::ModelCatalog;
use crate::config::ModelConfig;
use crate::worker::{WorkOutcome, WorkRequest, Worker};
use async_trait::async_trait;
use felix_core::{Backend, FelixError, FelixResult, Provider};
use std::sync::Arc;

/// Worker that calls a provider's HTTP API directly.
///
/// Anthropic uses the Messages API; OpenAI and Google use the OpenAI-compatible
/// chat completions endpoint. The API backend has no file-editing tools, so it
/// returns the model's answer and reports no file changes.
pub struct ApiWorker {
    config: ModelConfig,
    catalog: Arc<ModelCatalog>,
    http: reqwest::Client,
}

impl ApiWorker {
    pub fn new(config: ModelConfig, catalog: Arc<ModelCatalog>) -> Self {
        Self {
            config,
            catalog,
            http: reqwest::Client::new(),
        }
    }

    fn api_key(&self) -> FelixResult<String> {
        self.config.resolve_api_key().ok_or_else(|| {
            FelixError::Config(format!(
                "missing API key for {} (set {})",
                self.config.provider,
                self.config.provider.api_key_env()
            ))
        })
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url().trim_end_matches('/');
        match self.config.provider {
            Provider::Anthropic => format!("{base}/v1/messages"),
            Provider::OpenAi => format!("{base}/v1/chat/completions"),
            Provider::Google => format!("{base}/chat/completions"),
        }
    }

    fn build_body(&self, request: &WorkRequest, model: &str) -> serde_json::Value {
        let system = if request.dry_run {
            "You are a senior software engineer. Describe the changes you would make; do not claim to have applied them."
        } else {
            "You are a senior software engineer. Produce the complete changes needed for the task."
        };
        match self.config.provider {
            Provider::Anthropic => serde_json::json!({
                "model": model,
                "max_tokens": self.config.max_tokens,
                "temperature": request.temperature,
                "system": system,
                "messages": [{"role": "user", "content": request.prompt}],
            }),
            Provider::OpenAi | Provider::Google => serde_json::json!({
                "model": model,
                "max_tokens": self.config.max_tokens,
                "temperature": request.temperature,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": request.prompt},
                ],
            }),
        }
    }

    fn add_auth(&self, builder: reqwest::RequestBuilder, key: &str) -> reqwest::RequestBuilder {
        let builder = builder.header("content-type", "application/json");
        match self.config.provider {
            Provider::Anthropic => builder
                .header("x-api-key", key)
                .header("anthropic-version", "2023-06-01"),
            Provider::OpenAi | Provider::Google => {
                builder.header("Authorization", format!("Bearer {key}"))
            }
        }
    }
}

#[async_trait]
impl Worker for ApiWorker {
    fn provider(&self) -> Provider {
        self.config.provider
    }

    fn backend(&self) -> Backend {
        Backend::Api
    }

    fn model(&self) -> &str {
        &self.config.model_id
    }

    fn ready(&self) -> FelixResult<()> {
        self.api_key().map(|_| ())
    }

    async fn execute(&self, request: &WorkRequest) -> FelixResult<WorkOutcome> {
        let key = self.api_key()?;
        let model = if request.model.is_empty() {
            self.config.model_id.as_str()
        } else {
            request.model.as_str()
        };
        let body = self.build_body(request, model);

        tracing::info!(
            task_id = %request.task.id,
            provider = %self.config.provider,
            model = %model,
            "Calling worker API"
        );

        let send = self
            .add_auth(self.http.post(self.endpoint()), &key)
            .json(&body)
            .send();
        let resp = match tokio::time::timeout(request.timeout, send).await {
            Ok(result) => result.map_err(|e| FelixError::Http(e.to_string()))?,
            Err(_) => return Err(FelixError::Timeout(request.timeout.as_secs())),
        };

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| FelixError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(FelixError::Http(format!(
                "{} API error {}: {}",
                self.config.provider,
                status,
                excerpt(&text, 500)
            )));
        }

        let json: serde_json::Value = serde_json::from_str(&text)?;
        let answer = parse_api_response(self.config.provider, &json)?;
        let tokens = parse_usage(&json["usage"]);
        let cost_usd = self.catalog.cost(model, tokens);

        tracing::info!(
            task_id = %request.task.id,
            cost_usd,
            input_tokens = tokens.input,
            output_tokens = tokens.output,
            "Worker API response received"
        );

        Ok(WorkOutcome::succeeded(answer, tokens, cost_usd))
    }
}

/// Extract the answer text from a provider response body.
pub fn parse_api_response(provider: Provider, body: &serde_json::Value) -> FelixResult<String> {
    match provider {
        Provider::Anthropic => {
            let content = body["content"]
                .as_array()
                .ok_or_else(|| FelixError::Worker("Missing content in Anthropic response".into()))?;
            let parts: Vec<&str> = content
                .iter()
                .filter(|block| block["type"].as_str() == Some("text"))
                .filter_map(|block| block["text"].as_str())
                .collect();
            Ok(parts.join("\n"))
        }
        Provider::OpenAi | Provider::Google => body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| FelixError::Worker("Missing choices in chat completion response".into())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use felix_core::{Task, TokenUsage};
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(model: &str) -> WorkRequest {
        WorkRequest {
            task: Task::new("T1", "Do it"),
            prompt: "implement T1".into(),
            model: model.into(),
            temperature: 0.2,
            timeout: Duration::from_secs(5),
            working_dir: std::env::temp_dir(),
            dry_run: false,
        }
    }

    fn worker(provider: Provider, model: &str, base: &str) -> ApiWorker {
        let mut config = ModelConfig::new(provider, Backend::Api, model);
        config.api_key = Some("test-key".into());
        config.api_base_url = Some(base.to_string());
        ApiWorker::new(config, Arc::new(ModelCatalog::default()))
    }

    #[tokio::test]
    async fn test_anthropic_messages_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "patched"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 1_000_000, "output_tokens": 0}
            })))
            .mount(&server)
            .await;

        let w = worker(Provider::Anthropic, "claude-sonnet-4", &server.uri());
        let outcome = w.execute(&request("claude-sonnet-4")).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output, "patched");
        assert_eq!(outcome.tokens, TokenUsage::new(1_000_000, 0));
        assert!((outcome.cost_usd - 3.0).abs() < 1e-9);
        assert!(outcome.file_changes.is_empty());
    }

    #[tokio::test]
    async fn test_openai_chat_completions_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "ok"}}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5}
            })))
            .mount(&server)
            .await;

        let w = worker(Provider::OpenAi, "gpt-4.1", &server.uri());
        let outcome = w.execute(&request("gpt-4.1")).await.unwrap();
        assert_eq!(outcome.output, "ok");
        assert_eq!(outcome.tokens, TokenUsage::new(10, 5));
    }

    #[tokio::test]
    async fn test_server_error_is_transient_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let w = worker(Provider::Google, "gemini-2.5-pro", &server.uri());
        let err = w.execute(&request("gemini-2.5-pro")).await.unwrap_err();
        assert!(matches!(err, FelixError::Http(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_key_is_config_error() {
        let mut config = ModelConfig::new(Provider::Anthropic, Backend::Api, "claude-sonnet-4");
        config.api_base_url = Some("http://127.0.0.1:9".into());
        config.api_key = Some(String::new());
        let w = ApiWorker::new(config, Arc::new(ModelCatalog::default()));
        if std::env::var("ANTHROPIC_API_KEY").is_ok() {
            return;
        }
        let err = w.execute(&request("claude-sonnet-4")).await.unwrap_err();
        assert!(matches!(err, FelixError::Config(_)));
    }

    #[test]
    fn test_parse_missing_content() {
        let err = parse_api_response(Provider::Anthropic, &serde_json::json!({})).unwrap_err();
        assert!(err.to_string().contains("Missing content"));
    }
}
