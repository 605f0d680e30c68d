use chrono::{DateTime, Utc};
use felix_core::OrchestratorStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One orchestrator run of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub project: String,
    pub plan_hash: String,
    pub status: OrchestratorStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

/// Outcome statistics of one model on one task signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingPattern {
    pub signature: String,
    pub model: String,
    pub success_count: u32,
    pub fail_count: u32,
    /// Mean cost over every recorded attempt.
    pub avg_cost_usd: f64,
    pub updated_at: DateTime<Utc>,
}

impl RoutingPattern {
    pub fn new(signature: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            model: model.into(),
            success_count: 0,
            fail_count: 0,
            avg_cost_usd: 0.0,
            updated_at: Utc::now(),
        }
    }

    pub fn samples(&self) -> u32 {
        self.success_count + self.fail_count
    }

    pub fn success_rate(&self) -> f64 {
        match self.samples() {
            0 => 0.0,
            n => f64::from(self.success_count) / f64::from(n),
        }
    }

    /// Fold one attempt into the statistics.
    pub fn record(&mut self, success: bool, cost_usd: f64) {
        let previous = f64::from(self.samples());
        if success {
            self.success_count += 1;
        } else {
            self.fail_count += 1;
        }
        self.avg_cost_usd = (self.avg_cost_usd * previous + cost_usd) / f64::from(self.samples());
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_running_mean() {
        let mut p = RoutingPattern::new("sig", "claude-sonnet-4");
        p.record(true, 0.10);
        p.record(false, 0.30);
        p.record(true, 0.20);
        assert_eq!(p.samples(), 3);
        assert!((p.avg_cost_usd - 0.20).abs() < 1e-9);
        assert!((p.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_pattern_rate() {
        assert_eq!(RoutingPattern::new("s", "m").success_rate(), 0.0);
    }
}
