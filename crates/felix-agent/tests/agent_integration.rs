//! Integration tests for felix-agent: registry, health and fallback wired together.

use async_trait::async_trait;
use felix_agent::{
    FallbackConfig, FallbackRouter, HealthConfig, HealthMonitor, HealthProbe, ModelCatalog,
    ModelConfig, ModelRegistry, WorkerFactory, WorkerSource, DefaultWorkerFactory, WorkRequest,
};
use felix_core::{Backend, FelixError, Provider, Task};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct NothingInstalled;

#[async_trait]
impl HealthProbe for NothingInstalled {
    async fn probe(&self, provider: Provider, _timeout: Duration) -> Result<(), String> {
        Err(format!("{} not found", provider.executable()))
    }
}

fn request() -> WorkRequest {
    WorkRequest {
        task: Task::new("T1", "Add endpoint"),
        prompt: "Add the endpoint".into(),
        model: "claude-sonnet-4".into(),
        temperature: 0.2,
        timeout: Duration::from_secs(5),
        working_dir: std::env::temp_dir(),
        dry_run: true,
    }
}

#[tokio::test]
async fn test_missing_cli_falls_back_to_api() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "content": [{"type": "text", "text": "planned"}],
            "usage": {"input_tokens": 100, "output_tokens": 10}
        })))
        .mount(&server)
        .await;

    let catalog = Arc::new(ModelCatalog::default());
    let factory: Arc<dyn WorkerFactory> = Arc::new(DefaultWorkerFactory::new(catalog.clone()));
    let mut template = ModelConfig::new(Provider::Anthropic, Backend::Cli, "claude-sonnet-4");
    template.api_key = Some("k".into());
    template.api_base_url = Some(server.uri());
    let registry = Arc::new(ModelRegistry::new(catalog, factory, template));
    let health = Arc::new(HealthMonitor::new(HealthConfig::default(), Arc::new(NothingInstalled)));
    let router = FallbackRouter::new(
        registry,
        health,
        FallbackConfig::default(),
        (Provider::Anthropic, Backend::Cli),
    );

    let dispatch = router.dispatch(&request()).await.unwrap();
    assert_eq!(dispatch.backend, Backend::Api);
    assert!(dispatch.used_fallback);
    assert_eq!(dispatch.outcome.output, "planned");
    assert!(dispatch.outcome.cost_usd > 0.0);
}

#[tokio::test]
async fn test_no_candidates_left_is_fatal_resolution() {
    let catalog = Arc::new(ModelCatalog::default());
    let factory: Arc<dyn WorkerFactory> = Arc::new(DefaultWorkerFactory::new(catalog.clone()));
    let registry = Arc::new(ModelRegistry::new(
        catalog,
        factory,
        ModelConfig::new(Provider::Anthropic, Backend::Cli, "claude-sonnet-4"),
    ));
    let health = Arc::new(HealthMonitor::new(HealthConfig::default(), Arc::new(NothingInstalled)));
    // Only CLI candidates: every one is unhealthy.
    let config = FallbackConfig {
        max_retries: 2,
        providers: vec![Provider::Anthropic],
    };
    let router = FallbackRouter::new(registry, health, config, (Provider::Anthropic, Backend::Cli));
    let candidates = router.candidates();
    assert_eq!(candidates.len(), 2);

    match router.resolve("claude-sonnet-4").await {
        Err(FelixError::FallbackExhausted(report)) => {
            assert_eq!(report.attempts.len(), 2);
            assert!(report.attempts[0].skipped);
            // The API candidate is never healthy-checked, only key-checked.
            assert!(!report.attempts[1].skipped);
        }
        other => {
            // An ANTHROPIC_API_KEY in the environment makes the API candidate usable.
            assert!(std::env::var("ANTHROPIC_API_KEY").is_ok(), "unexpected: {other:?}");
        }
    }
}
