use crate::backends::{ApiWorker, CliWorker};
use crate::catalog::{ModelCatalog, ModelSpec};
use crate::config::ModelConfig;
use crate::worker::Worker;
use felix_core::{Backend, FelixResult, Provider};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds workers for a `(provider, backend, model)` combination.
pub trait WorkerFactory: Send + Sync {
    fn create(&self, config: &ModelConfig) -> FelixResult<Arc<dyn Worker>>;
}

/// Builds [`CliWorker`]s and [`ApiWorker`]s.
pub struct DefaultWorkerFactory {
    catalog: Arc<ModelCatalog>,
}

impl DefaultWorkerFactory {
    pub fn new(catalog: Arc<ModelCatalog>) -> Self {
        Self { catalog }
    }
}

impl WorkerFactory for DefaultWorkerFactory {
    fn create(&self, config: &ModelConfig) -> FelixResult<Arc<dyn Worker>> {
        let worker: Arc<dyn Worker> = match config.backend {
            Backend::Cli => Arc::new(CliWorker::new(config.clone(), self.catalog.clone())),
            Backend::Api => Arc::new(ApiWorker::new(config.clone(), self.catalog.clone())),
        };
        Ok(worker)
    }
}

type WorkerKey = (Provider, Backend, String);

/// Catalog lookups plus a cache of worker instances.
///
/// One worker exists per `(provider, backend, model)`; repeated requests get
/// the same instance.
pub struct ModelRegistry {
    catalog: Arc<ModelCatalog>,
    factory: Arc<dyn WorkerFactory>,
    /// Template for API keys, base URLs and limits applied to every worker.
    template: ModelConfig,
    workers: RwLock<HashMap<WorkerKey, Arc<dyn Worker>>>,
}

impl ModelRegistry {
    pub fn new(catalog: Arc<ModelCatalog>, factory: Arc<dyn WorkerFactory>, template: ModelConfig) -> Self {
        Self {
            catalog,
            factory,
            template,
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the default catalog and factory.
    pub fn with_defaults(template: ModelConfig) -> Self {
        let catalog = Arc::new(ModelCatalog::default());
        let factory = Arc::new(DefaultWorkerFactory::new(catalog.clone()));
        Self::new(catalog, factory, template)
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn resolve(&self, name: &str) -> FelixResult<&ModelSpec> {
        self.catalog.resolve(name)
    }

    /// The model `provider` offers comparable to `model`.
    pub fn equivalent(&self, model: &str, provider: Provider) -> FelixResult<&ModelSpec> {
        self.catalog.equivalent(model, provider)
    }

    /// Get or build the worker for a combination.
    pub fn worker(&self, provider: Provider, backend: Backend, model: &str) -> FelixResult<Arc<dyn Worker>> {
        let key = (provider, backend, model.to_string());
        if let Some(w) = self.workers.read().get(&key) {
            return Ok(w.clone());
        }

        let mut config = self.template.clone();
        if config.provider != provider {
            // Keys and base URLs belong to the template's provider.
            config.api_key = None;
            config.api_base_url = None;
        }
        config.provider = provider;
        config.backend = backend;
        config.model_id = model.to_string();

        let worker = self.factory.create(&config)?;
        tracing::debug!(%provider, %backend, model, "Worker created");
        let mut workers = self.workers.write();
        Ok(workers.entry(key).or_insert(worker).clone())
    }

    pub fn cached_workers(&self) -> usize {
        self.workers.read().len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn registry() -> ModelRegistry {
        ModelRegistry::with_defaults(ModelConfig::new(Provider::Anthropic, Backend::Cli, "claude-sonnet-4"))
    }

    #[test]
    fn test_worker_instances_are_cached() {
        let r = registry();
        let a = r.worker(Provider::Anthropic, Backend::Cli, "claude-sonnet-4").unwrap();
        let b = r.worker(Provider::Anthropic, Backend::Cli, "claude-sonnet-4").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(r.cached_workers(), 1);

        let c = r.worker(Provider::Anthropic, Backend::Api, "claude-sonnet-4").unwrap();
        assert_eq!(c.backend(), Backend::Api);
        assert_eq!(r.cached_workers(), 2);
    }

    #[test]
    fn test_worker_carries_requested_identity() {
        let r = registry();
        let w = r.worker(Provider::Google, Backend::Cli, "gemini-2.5-pro").unwrap();
        assert_eq!(w.provider(), Provider::Google);
        assert_eq!(w.model(), "gemini-2.5-pro");
    }

    #[test]
    fn test_resolve_and_equivalent() {
        let r = registry();
        assert_eq!(r.resolve("opus").unwrap().id, "claude-opus-4");
        assert_eq!(r.equivalent("claude-opus-4", Provider::OpenAi).unwrap().id, "o1");
    }
}
