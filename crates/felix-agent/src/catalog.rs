use felix_core::{FelixError, FelixResult, Provider, TokenUsage};
use serde::{Deserialize, Serialize};

/// Cost/capability bucket of models, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Low,
    Mid,
    High,
    Premium,
}

impl ModelTier {
    pub const ALL: [ModelTier; 4] = [ModelTier::Low, ModelTier::Mid, ModelTier::High, ModelTier::Premium];

    pub fn next_up(&self) -> Option<ModelTier> {
        match self {
            ModelTier::Low => Some(ModelTier::Mid),
            ModelTier::Mid => Some(ModelTier::High),
            ModelTier::High => Some(ModelTier::Premium),
            ModelTier::Premium => None,
        }
    }

    pub fn next_down(&self) -> Option<ModelTier> {
        match self {
            ModelTier::Low => None,
            ModelTier::Mid => Some(ModelTier::Low),
            ModelTier::High => Some(ModelTier::Mid),
            ModelTier::Premium => Some(ModelTier::High),
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelTier::Low => write!(f, "low"),
            ModelTier::Mid => write!(f, "mid"),
            ModelTier::High => write!(f, "high"),
            ModelTier::Premium => write!(f, "premium"),
        }
    }
}

/// One model the orchestrator can route to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub provider: Provider,
    pub tier: ModelTier,
    /// USD per 1M input tokens.
    pub input_per_mtok: f64,
    /// USD per 1M output tokens.
    pub output_per_mtok: f64,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl ModelSpec {
    pub fn cost(&self, usage: TokenUsage) -> f64 {
        (usage.input as f64 * self.input_per_mtok + usage.output as f64 * self.output_per_mtok)
            / 1_000_000.0
    }

    /// Price of a nominal 1M-in / 1M-out workload, used to rank models.
    fn blended_price(&self) -> f64 {
        self.input_per_mtok + self.output_per_mtok
    }

    fn answers_to(&self, name: &str) -> bool {
        self.id.eq_ignore_ascii_case(name) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

/// The model table: tiers and per-1M-token pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCatalog {
    models: Vec<ModelSpec>,
}

fn spec(id: &str, provider: Provider, tier: ModelTier, input: f64, output: f64, aliases: &[&str]) -> ModelSpec {
    ModelSpec {
        id: id.to_string(),
        provider,
        tier,
        input_per_mtok: input,
        output_per_mtok: output,
        aliases: aliases.iter().map(|a| a.to_string()).collect(),
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new(vec![
            spec("claude-3-5-haiku", Provider::Anthropic, ModelTier::Low, 0.80, 4.00, &["haiku"]),
            spec("claude-sonnet-4", Provider::Anthropic, ModelTier::High, 3.00, 15.00, &["sonnet"]),
            spec("claude-opus-4", Provider::Anthropic, ModelTier::Premium, 15.00, 75.00, &["opus"]),
            spec("gpt-4o-mini", Provider::OpenAi, ModelTier::Low, 0.15, 0.60, &["4o-mini"]),
            spec("gpt-4.1", Provider::OpenAi, ModelTier::Mid, 2.00, 8.00, &["gpt4"]),
            spec("o1", Provider::OpenAi, ModelTier::Premium, 15.00, 60.00, &[]),
            spec("gemini-2.0-flash", Provider::Google, ModelTier::Low, 0.10, 0.40, &["flash"]),
            spec("gemini-2.5-flash", Provider::Google, ModelTier::Mid, 0.30, 2.50, &[]),
            spec("gemini-2.5-pro", Provider::Google, ModelTier::High, 1.25, 10.00, &["gemini-pro"]),
        ])
    }
}

impl ModelCatalog {
    pub fn new(models: Vec<ModelSpec>) -> Self {
        Self { models }
    }

    pub fn models(&self) -> &[ModelSpec] {
        &self.models
    }

    /// Look a model up by id or alias (case-insensitive).
    pub fn resolve(&self, name: &str) -> FelixResult<&ModelSpec> {
        self.models
            .iter()
            .find(|m| m.answers_to(name))
            .ok_or_else(|| FelixError::Config(format!("unknown model '{name}'")))
    }

    /// Models of `tier` offered by any of `providers`, cheapest first, ties by id.
    pub fn models_in_tier(&self, tier: ModelTier, providers: &[Provider]) -> Vec<&ModelSpec> {
        let mut models: Vec<&ModelSpec> = self
            .models
            .iter()
            .filter(|m| m.tier == tier && providers.contains(&m.provider))
            .collect();
        models.sort_by(|a, b| {
            a.blended_price()
                .total_cmp(&b.blended_price())
                .then_with(|| a.id.cmp(&b.id))
        });
        models
    }

    pub fn cheapest_in_tier(&self, tier: ModelTier, providers: &[Provider]) -> Option<&ModelSpec> {
        self.models_in_tier(tier, providers).into_iter().next()
    }

    /// Default model for a tier: the cheapest in that tier, else the nearest
    /// tier above it, else the nearest below.
    pub fn default_for_tier(&self, tier: ModelTier, providers: &[Provider]) -> Option<&ModelSpec> {
        let mut up = Some(tier);
        while let Some(t) = up {
            if let Some(m) = self.cheapest_in_tier(t, providers) {
                return Some(m);
            }
            up = t.next_up();
        }
        let mut down = tier.next_down();
        while let Some(t) = down {
            if let Some(m) = self.cheapest_in_tier(t, providers) {
                return Some(m);
            }
            down = t.next_down();
        }
        None
    }

    /// The model `provider` offers in the same tier as `model` (or the
    /// nearest tier, searching upwards first).
    pub fn equivalent(&self, model: &str, provider: Provider) -> FelixResult<&ModelSpec> {
        let source = self.resolve(model)?;
        if source.provider == provider {
            return Ok(source);
        }
        self.default_for_tier(source.tier, &[provider]).ok_or_else(|| {
            FelixError::Config(format!("provider {provider} has no model comparable to '{model}'"))
        })
    }

    /// USD cost of `usage` on `model`; unknown models cost nothing.
    pub fn cost(&self, model: &str, usage: TokenUsage) -> f64 {
        self.resolve(model).map(|m| m.cost(usage)).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_by_alias() {
        let catalog = ModelCatalog::default();
        assert_eq!(catalog.resolve("sonnet").unwrap().id, "claude-sonnet-4");
        assert_eq!(catalog.resolve("CLAUDE-OPUS-4").unwrap().tier, ModelTier::Premium);
        assert!(catalog.resolve("llama").is_err());
    }

    #[test]
    fn test_cheapest_in_tier() {
        let catalog = ModelCatalog::default();
        let low = catalog.cheapest_in_tier(ModelTier::Low, &Provider::ALL).unwrap();
        assert_eq!(low.id, "gemini-2.0-flash");
        let anthropic_low = catalog
            .cheapest_in_tier(ModelTier::Low, &[Provider::Anthropic])
            .unwrap();
        assert_eq!(anthropic_low.id, "claude-3-5-haiku");
    }

    #[test]
    fn test_default_for_tier_walks_up() {
        let catalog = ModelCatalog::default();
        // Anthropic has no mid-tier model, so the next tier up is used.
        let m = catalog.default_for_tier(ModelTier::Mid, &[Provider::Anthropic]).unwrap();
        assert_eq!(m.id, "claude-sonnet-4");
        // Google has no premium model, so the nearest lower tier is used.
        let g = catalog.default_for_tier(ModelTier::Premium, &[Provider::Google]).unwrap();
        assert_eq!(g.id, "gemini-2.5-pro");
    }

    #[test]
    fn test_equivalent_model() {
        let catalog = ModelCatalog::default();
        let eq = catalog.equivalent("claude-sonnet-4", Provider::Google).unwrap();
        assert_eq!(eq.id, "gemini-2.5-pro");
        let same = catalog.equivalent("claude-sonnet-4", Provider::Anthropic).unwrap();
        assert_eq!(same.id, "claude-sonnet-4");
    }

    #[test]
    fn test_cost_per_million() {
        let catalog = ModelCatalog::default();
        let cost = catalog.cost("claude-sonnet-4", TokenUsage::new(1_000_000, 100_000));
        assert!((cost - 4.5).abs() < 1e-9);
        assert_eq!(catalog.cost("unknown", TokenUsage::new(10, 10)), 0.0);
    }

    #[test]
    fn test_tier_steps() {
        assert_eq!(ModelTier::Low.next_up(), Some(ModelTier::Mid));
        assert_eq!(ModelTier::Premium.next_up(), None);
        assert_eq!(ModelTier::Low.next_down(), None);
        assert!(ModelTier::Low < ModelTier::Premium);
    }
}
