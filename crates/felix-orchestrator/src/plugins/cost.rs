use felix_agent::ModelCatalog;
use felix_core::{FelixError, FelixResult, Task, TokenUsage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Notify;

/// Usage accumulated for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    pub attempts: u32,
}

#[derive(Debug, Default)]
struct Totals {
    tokens: TokenUsage,
    cost_usd: f64,
    attempts: u32,
    by_model: BTreeMap<String, ModelUsage>,
    /// Estimates held by attempts that are still running.
    reserved: f64,
    outstanding: u32,
}

impl Totals {
    fn add(&mut self, model: &str, tokens: TokenUsage, cost_usd: f64) {
        let cost = if cost_usd.is_finite() && cost_usd > 0.0 { cost_usd } else { 0.0 };
        self.tokens += tokens;
        self.cost_usd += cost;
        self.attempts += 1;
        let entry = self.by_model.entry(model.to_string()).or_default();
        entry.tokens += tokens;
        entry.cost_usd += cost;
        entry.attempts += 1;
    }

    fn release(&mut self, amount: f64) {
        self.reserved = (self.reserved - amount).max(0.0);
        self.outstanding = self.outstanding.saturating_sub(1);
    }
}

/// Running token and cost totals for a session, per model and overall.
///
/// Totals only ever grow. Shared between concurrently running tasks: under a
/// budget every attempt must hold a [`Reservation`] for its estimate, so
/// parallel attempts cannot all pass the ceiling on the same spent total.
#[derive(Debug)]
pub struct CostTracker {
    catalog: Arc<ModelCatalog>,
    max_cost_usd: Option<f64>,
    totals: Mutex<Totals>,
    settled: Notify,
}

/// Budget held for one in-flight attempt.
///
/// [`settle`](Reservation::settle) swaps it for the attempt's real cost;
/// dropping it unsettled gives the estimate back.
#[must_use = "a reservation is released as soon as it is dropped"]
#[derive(Debug)]
pub struct Reservation<'a> {
    tracker: &'a CostTracker,
    amount: f64,
    active: bool,
}

impl Reservation<'_> {
    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Record the attempt's actual usage and release the estimate.
    pub fn settle(mut self, model: &str, tokens: TokenUsage, cost_usd: f64) {
        {
            let mut totals = self.tracker.totals.lock();
            totals.add(model, tokens, cost_usd);
            if self.active {
                totals.release(self.amount);
            }
        }
        self.active = false;
        self.tracker.settled.notify_waiters();
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.active {
            self.tracker.totals.lock().release(self.amount);
            self.tracker.settled.notify_waiters();
        }
    }
}

impl CostTracker {
    pub fn new(catalog: Arc<ModelCatalog>, max_cost_usd: Option<f64>) -> Self {
        Self {
            catalog,
            max_cost_usd,
            totals: Mutex::new(Totals::default()),
            settled: Notify::new(),
        }
    }

    pub fn budget(&self) -> Option<f64> {
        self.max_cost_usd
    }

    /// Add one finished attempt. Negative or NaN costs count as zero.
    pub fn record(&self, model: &str, tokens: TokenUsage, cost_usd: f64) {
        self.totals.lock().add(model, tokens, cost_usd);
        self.settled.notify_waiters();
    }

    /// Seed the totals from a resumed run.
    pub fn restore(&self, tokens: u64, cost_usd: f64, attempts: u32) {
        let mut totals = self.totals.lock();
        totals.tokens = TokenUsage::new(tokens, 0);
        totals.cost_usd = cost_usd;
        totals.attempts = attempts;
    }

    pub fn total_cost(&self) -> f64 {
        self.totals.lock().cost_usd
    }

    /// Estimates currently held by running attempts.
    pub fn reserved(&self) -> f64 {
        self.totals.lock().reserved
    }

    pub fn total_tokens(&self) -> u64 {
        self.totals.lock().tokens.total()
    }

    pub fn by_model(&self) -> BTreeMap<String, ModelUsage> {
        self.totals.lock().by_model.clone()
    }

    /// Expected cost of the next attempt of `task` on `model`: the mean cost
    /// of the session's attempts so far, or a complexity-based token
    /// estimate priced from the catalog before the first attempt.
    pub fn estimate(&self, task: &Task, model: &str) -> f64 {
        let totals = self.totals.lock();
        self.estimate_with(&totals, task, model)
    }

    fn estimate_with(&self, totals: &Totals, task: &Task, model: &str) -> f64 {
        if totals.attempts > 0 {
            return totals.cost_usd / f64::from(totals.attempts);
        }
        let (input, output) = task.complexity.estimated_tokens();
        self.catalog.cost(model, TokenUsage::new(input, output))
    }

    /// Check the ceiling and hold the estimate for one attempt in a single
    /// step. Fails with [`FelixError::BudgetExceeded`] when
    /// `spent + reserved + estimate` would go over the limit.
    ///
    /// Until the session has one priced attempt the estimate is only a
    /// catalog guess, so under a budget a second attempt waits for the
    /// first one in flight to settle before it is sized.
    pub async fn reserve(&self, task: &Task, model: &str) -> FelixResult<Reservation<'_>> {
        loop {
            let settled = self.settled.notified();
            if let Some(reservation) = self.try_reserve(task, model)? {
                return Ok(reservation);
            }
            settled.await;
        }
    }

    /// `Ok(None)` while an unpriced attempt is in flight.
    fn try_reserve(&self, task: &Task, model: &str) -> FelixResult<Option<Reservation<'_>>> {
        let Some(limit) = self.max_cost_usd else {
            return Ok(Some(Reservation {
                tracker: self,
                amount: 0.0,
                active: false,
            }));
        };
        let mut totals = self.totals.lock();
        if totals.attempts == 0 && totals.outstanding > 0 {
            return Ok(None);
        }
        let spent = totals.cost_usd;
        let reserved = totals.reserved;
        let estimated = self.estimate_with(&totals, task, model);
        if spent + reserved + estimated > limit + f64::EPSILON {
            tracing::warn!(
                task_id = %task.id,
                spent,
                reserved,
                estimated,
                limit,
                "Budget would be exceeded"
            );
            return Err(FelixError::BudgetExceeded {
                spent: spent + reserved,
                estimated,
                limit,
            });
        }
        totals.reserved += estimated;
        totals.outstanding += 1;
        Ok(Some(Reservation {
            tracker: self,
            amount: estimated,
            active: true,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use felix_core::Complexity;

    fn tracker(limit: Option<f64>) -> CostTracker {
        CostTracker::new(Arc::new(ModelCatalog::default()), limit)
    }

    #[test]
    fn test_totals_per_model_and_overall() {
        let t = tracker(None);
        t.record("claude-sonnet-4", TokenUsage::new(100, 50), 0.25);
        t.record("gpt-4o-mini", TokenUsage::new(10, 5), 0.01);
        t.record("claude-sonnet-4", TokenUsage::new(1, 1), 0.25);
        assert!((t.total_cost() - 0.51).abs() < 1e-9);
        assert_eq!(t.total_tokens(), 167);
        let by_model = t.by_model();
        assert_eq!(by_model["claude-sonnet-4"].attempts, 2);
        assert!((by_model["claude-sonnet-4"].cost_usd - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_before_any_attempt_uses_complexity() {
        let t = tracker(None);
        let task = Task::new("A", "a").with_complexity(Complexity::Moderate);
        let (input, output) = Complexity::Moderate.estimated_tokens();
        let catalog = ModelCatalog::default();
        let expected = catalog.cost("claude-sonnet-4", TokenUsage::new(input, output));
        assert!((t.estimate(&task, "claude-sonnet-4") - expected).abs() < 1e-12);
    }

    #[test]
    fn test_estimate_is_mean_of_attempts() {
        let t = tracker(None);
        t.record("m", TokenUsage::default(), 0.6);
        t.record("m", TokenUsage::default(), 0.2);
        assert!((t.estimate(&Task::new("A", "a"), "m") - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_budget_breach_detected_before_spending() {
        let t = tracker(Some(1.0));
        t.record("m", TokenUsage::default(), 0.6);
        let err = t.reserve(&Task::new("B", "b"), "m").await.unwrap_err();
        match err {
            FelixError::BudgetExceeded { spent, estimated, limit } => {
                assert!((spent - 0.6).abs() < 1e-9);
                assert!((estimated - 0.6).abs() < 1e-9);
                assert!((limit - 1.0).abs() < 1e-9);
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(t.reserved(), 0.0);
    }

    #[tokio::test]
    async fn test_no_budget_never_blocks() {
        let t = tracker(None);
        t.record("m", TokenUsage::default(), 1_000.0);
        let first = t.reserve(&Task::new("A", "a"), "m").await.unwrap();
        let second = t.reserve(&Task::new("B", "b"), "m").await.unwrap();
        assert_eq!(first.amount(), 0.0);
        second.settle("m", TokenUsage::default(), 1.0);
        drop(first);
        assert!((t.total_cost() - 1_001.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reservations_count_against_the_ceiling() {
        let t = tracker(Some(1.0));
        t.record("m", TokenUsage::default(), 0.3);
        // Spent 0.3, each estimate 0.3: two more fit, the third does not.
        let a = t.reserve(&Task::new("A", "a"), "m").await.unwrap();
        let b = t.reserve(&Task::new("B", "b"), "m").await.unwrap();
        assert!((t.reserved() - 0.6).abs() < 1e-9);
        assert!(matches!(
            t.reserve(&Task::new("C", "c"), "m").await,
            Err(FelixError::BudgetExceeded { .. })
        ));

        a.settle("m", TokenUsage::default(), 0.3);
        drop(b);
        assert_eq!(t.reserved(), 0.0);
        assert!((t.total_cost() - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unpriced_session_sizes_one_attempt_at_a_time() {
        let t = Arc::new(tracker(Some(1.0)));
        let task = Task::new("A", "a").with_complexity(Complexity::Simple);
        let first = t.reserve(&task, "claude-sonnet-4").await.unwrap();

        let waiter = {
            let t = t.clone();
            let task = Task::new("B", "b").with_complexity(Complexity::Simple);
            tokio::spawn(async move { t.reserve(&task, "claude-sonnet-4").await.map(|r| r.amount()) })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        first.settle("claude-sonnet-4", TokenUsage::default(), 0.6);
        // Sized on the real 0.60 the first attempt cost, not the catalog guess.
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, FelixError::BudgetExceeded { .. }));
    }

    #[test]
    fn test_negative_cost_ignored() {
        let t = tracker(None);
        t.record("m", TokenUsage::default(), -3.0);
        t.record("m", TokenUsage::default(), f64::NAN);
        assert_eq!(t.total_cost(), 0.0);
    }

    #[test]
    fn test_restore_seeds_totals() {
        let t = tracker(Some(2.0));
        t.restore(500, 1.5, 3);
        assert!((t.total_cost() - 1.5).abs() < 1e-9);
        assert_eq!(t.total_tokens(), 500);
        assert!((t.estimate(&Task::new("A", "a"), "m") - 0.5).abs() < 1e-9);
    }
}
