use felix_agent::{ModelCatalog, ModelTier};
use felix_core::{Backend, Complexity, FelixError, FelixResult, Provider, Task};
use felix_session::{PatternStore, RoutingPattern};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

static SIGNAL_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(security|migration|authentication|concurrency|database|performance|architecture|distributed)\b",
    )
    .expect("valid signal-word regex")
});

/// `[router]` section of the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Start one tier below the scored tier and escalate on failure.
    #[serde(default)]
    pub enable_cascade: bool,
    /// Highest tier escalation may reach.
    #[serde(default = "default_max_tier")]
    pub max_tier: ModelTier,
    #[serde(default = "default_true")]
    pub enable_history: bool,
    /// Samples a `(signature, model)` pair needs before history is trusted.
    #[serde(default = "default_min_history_samples")]
    pub min_history_samples: u32,
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    /// Escalations allowed per task.
    #[serde(default = "default_max_escalations")]
    pub max_escalations: u32,
    /// Providers whose models may be picked. Empty means the primary provider.
    #[serde(default)]
    pub providers: Vec<Provider>,
}

fn default_max_tier() -> ModelTier {
    ModelTier::Premium
}

fn default_true() -> bool {
    true
}

fn default_min_history_samples() -> u32 {
    3
}

fn default_min_success_rate() -> f64 {
    0.7
}

fn default_max_escalations() -> u32 {
    2
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enable_cascade: false,
            max_tier: default_max_tier(),
            enable_history: default_true(),
            min_history_samples: default_min_history_samples(),
            min_success_rate: default_min_success_rate(),
            max_escalations: default_max_escalations(),
            providers: Vec::new(),
        }
    }
}

/// Where a routing decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingSource {
    Static,
    History,
    Cascade,
}

impl std::fmt::Display for RoutingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingSource::Static => write!(f, "static"),
            RoutingSource::History => write!(f, "history"),
            RoutingSource::Cascade => write!(f, "cascade"),
        }
    }
}

/// Model choice for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub task_id: String,
    pub selected_model: String,
    pub tier: ModelTier,
    pub source: RoutingSource,
    pub score: u32,
    /// Worker backend the task runs on.
    pub execution_mode: Backend,
    pub escalated_from: Option<String>,
    pub signature: String,
}

/// Picks a model per task from its score, the routing history and the
/// cascade settings.
pub struct ModelRouter {
    config: RouterConfig,
    catalog: Arc<ModelCatalog>,
    providers: Vec<Provider>,
    backend: Backend,
    model_override: Option<String>,
    patterns: Option<Arc<dyn PatternStore>>,
    history: RwLock<HashMap<(String, String), RoutingPattern>>,
    decisions: RwLock<HashMap<String, RoutingDecision>>,
}

impl ModelRouter {
    pub fn new(config: RouterConfig, catalog: Arc<ModelCatalog>, primary: (Provider, Backend)) -> Self {
        let providers = if config.providers.is_empty() {
            vec![primary.0]
        } else {
            config.providers.clone()
        };
        Self {
            config,
            catalog,
            providers,
            backend: primary.1,
            model_override: None,
            patterns: None,
            history: RwLock::new(HashMap::new()),
            decisions: RwLock::new(HashMap::new()),
        }
    }

    /// Persist routing history to `store`.
    pub fn with_patterns(mut self, store: Arc<dyn PatternStore>) -> Self {
        self.patterns = Some(store);
        self
    }

    /// Pin every task to `model`.
    pub fn with_model_override(mut self, model: Option<String>) -> Self {
        self.model_override = model.filter(|m| !m.trim().is_empty());
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Pull persisted history into memory. Returns the number of patterns.
    pub async fn load_history(&self) -> FelixResult<usize> {
        let Some(store) = &self.patterns else {
            return Ok(0);
        };
        let patterns = store.load_patterns().await?;
        let count = patterns.len();
        let mut history = self.history.write();
        for p in patterns {
            history.insert((p.signature.clone(), p.model.clone()), p);
        }
        debug!(patterns = count, "Routing history loaded");
        Ok(count)
    }

    /// 0..=100 difficulty estimate.
    pub fn calculate_task_score(task: &Task) -> u32 {
        let mut score: i64 = match task.complexity {
            Complexity::Trivial => 5,
            Complexity::Simple => 15,
            Complexity::Moderate => 35,
            Complexity::Complex => 55,
            Complexity::Epic => 75,
        };

        for tag in normalized_tags(task) {
            score += match tag.as_str() {
                "security" | "architecture" => 10,
                "refactor" => 5,
                "docs" | "documentation" => -10,
                _ => 0,
            };
        }

        let len = task.description.chars().count();
        if len > 500 {
            score += 10;
        } else if len > 200 {
            score += 5;
        }

        score += 5 * signal_words(task).len() as i64;

        let files = task.files_affected.len();
        if files > 10 {
            score += 10;
        } else if files > 5 {
            score += 5;
        } else if files > 2 {
            score += 2;
        }

        score.clamp(0, 100) as u32
    }

    pub fn score_to_tier(score: u32) -> ModelTier {
        match score {
            s if s < 25 => ModelTier::Low,
            s if s < 50 => ModelTier::Mid,
            s if s < 75 => ModelTier::High,
            _ => ModelTier::Premium,
        }
    }

    /// Stable hash of the task's shape: complexity, tag set, file-count
    /// bucket, description length bucket and matched signal words.
    pub fn task_signature(task: &Task) -> String {
        let tags: Vec<String> = normalized_tags(task).into_iter().collect();
        let words: Vec<String> = signal_words(task).into_iter().collect();
        let files = match task.files_affected.len() {
            0 => "none",
            1..=2 => "few",
            3..=5 => "some",
            6..=10 => "many",
            _ => "lots",
        };
        let length = match task.description.chars().count() {
            0..=200 => "short",
            201..=500 => "medium",
            _ => "long",
        };
        let shape = format!(
            "{}|{}|{files}|{length}|{}",
            task.complexity,
            tags.join(","),
            words.join(",")
        );
        let digest = Sha256::digest(shape.as_bytes());
        hex::encode(&digest[..8])
    }

    pub fn default_model(&self, tier: ModelTier) -> Option<String> {
        self.catalog
            .default_for_tier(tier, &self.providers)
            .map(|m| m.id.clone())
    }

    pub fn cheapest_model_in_tier(&self, tier: ModelTier) -> Option<String> {
        self.catalog
            .cheapest_in_tier(tier, &self.providers)
            .map(|m| m.id.clone())
    }

    /// Best-performing model for `signature`, once history is conclusive.
    pub fn analyze_history(&self, signature: &str) -> Option<String> {
        let history = self.history.read();
        let mut candidates: Vec<&RoutingPattern> = history
            .values()
            .filter(|p| p.signature == signature)
            .filter(|p| p.samples() >= self.config.min_history_samples)
            .filter(|p| p.success_rate() >= self.config.min_success_rate)
            .collect();
        candidates.sort_by(|a, b| {
            b.success_rate()
                .total_cmp(&a.success_rate())
                .then_with(|| a.avg_cost_usd.total_cmp(&b.avg_cost_usd))
                .then_with(|| a.model.cmp(&b.model))
        });
        candidates.first().map(|p| p.model.clone())
    }

    fn tier_of(&self, model: &str, fallback: ModelTier) -> ModelTier {
        self.catalog.resolve(model).map(|m| m.tier).unwrap_or(fallback)
    }

    fn model_for_tier(&self, tier: ModelTier) -> FelixResult<String> {
        self.default_model(tier).ok_or_else(|| {
            FelixError::Config(format!("no model available for tier {tier} on the configured providers"))
        })
    }

    /// Route one task without consulting the decision cache.
    pub fn route(&self, task: &Task) -> FelixResult<RoutingDecision> {
        let score = Self::calculate_task_score(task);
        let scored_tier = Self::score_to_tier(score);
        let signature = Self::task_signature(task);

        let (model, tier, source) = if let Some(model) = &self.model_override {
            (model.clone(), self.tier_of(model, scored_tier), RoutingSource::Static)
        } else if let Some(model) = self
            .config
            .enable_history
            .then(|| self.analyze_history(&signature))
            .flatten()
        {
            let tier = self.tier_of(&model, scored_tier);
            (model, tier, RoutingSource::History)
        } else if self.config.enable_cascade {
            let start = scored_tier
                .next_down()
                .unwrap_or(ModelTier::Low)
                .min(self.config.max_tier);
            (self.model_for_tier(start)?, start, RoutingSource::Cascade)
        } else {
            (self.model_for_tier(scored_tier)?, scored_tier, RoutingSource::Static)
        };

        debug!(task_id = %task.id, score, %tier, %source, model = %model, "Task routed");
        Ok(RoutingDecision {
            task_id: task.id.clone(),
            selected_model: model,
            tier,
            source,
            score,
            execution_mode: self.backend,
            escalated_from: None,
            signature,
        })
    }

    /// Route the whole plan up front and cache the decisions.
    pub fn route_all(&self, tasks: &[Task]) -> FelixResult<Vec<RoutingDecision>> {
        let decisions = tasks
            .iter()
            .map(|t| self.route(t))
            .collect::<FelixResult<Vec<_>>>()?;
        let mut cache = self.decisions.write();
        for d in &decisions {
            cache.insert(d.task_id.clone(), d.clone());
        }
        info!(tasks = decisions.len(), "Routing decisions computed");
        Ok(decisions)
    }

    /// The cached decision for `task`, routing it on first use.
    pub fn decision_for(&self, task: &Task) -> FelixResult<RoutingDecision> {
        if let Some(d) = self.decisions.read().get(&task.id) {
            return Ok(d.clone());
        }
        let decision = self.route(task)?;
        self.decisions.write().insert(task.id.clone(), decision.clone());
        Ok(decision)
    }

    /// Move `decision` one tier up, skipping tiers that map to the same
    /// model. `None` once `max_tier` is reached.
    pub fn escalate(&self, decision: &RoutingDecision) -> Option<RoutingDecision> {
        let mut tier = decision.tier;
        loop {
            tier = tier.next_up()?;
            if tier > self.config.max_tier {
                return None;
            }
            let Some(model) = self.default_model(tier) else {
                continue;
            };
            if model == decision.selected_model {
                continue;
            }
            let escalated = RoutingDecision {
                selected_model: model,
                tier,
                source: RoutingSource::Cascade,
                escalated_from: Some(decision.selected_model.clone()),
                ..decision.clone()
            };
            info!(
                task_id = %decision.task_id,
                from = %decision.selected_model,
                to = %escalated.selected_model,
                %tier,
                "Escalating model"
            );
            self.decisions
                .write()
                .insert(decision.task_id.clone(), escalated.clone());
            return Some(escalated);
        }
    }

    /// Fold an attempt outcome into the history and persist it.
    pub async fn record_attempt(&self, decision: &RoutingDecision, model: &str, success: bool, cost_usd: f64) {
        let pattern = {
            let mut history = self.history.write();
            let entry = history
                .entry((decision.signature.clone(), model.to_string()))
                .or_insert_with(|| RoutingPattern::new(&decision.signature, model));
            entry.record(success, cost_usd);
            entry.clone()
        };
        if let Some(store) = &self.patterns {
            if let Err(e) = store.save_pattern(&pattern).await {
                warn!(signature = %pattern.signature, error = %e, "Failed to persist routing pattern");
            }
        }
    }

    pub fn history_snapshot(&self) -> Vec<RoutingPattern> {
        let mut patterns: Vec<RoutingPattern> = self.history.read().values().cloned().collect();
        patterns.sort_by(|a, b| (&a.signature, &a.model).cmp(&(&b.signature, &b.model)));
        patterns
    }
}

fn normalized_tags(task: &Task) -> BTreeSet<String> {
    task.tags
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn signal_words(task: &Task) -> BTreeSet<String> {
    let text = format!("{} {}", task.title, task.description);
    SIGNAL_WORDS
        .find_iter(&text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}
