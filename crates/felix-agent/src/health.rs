use async_trait::async_trait;
use chrono::{DateTime, Utc};
use felix_core::Provider;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Thresholds for deciding a provider is unhealthy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// How long a probe verdict is trusted.
    #[serde(default = "default_probe_ttl_secs")]
    pub probe_ttl_secs: u64,
    /// Deadline for the `--version` probe.
    #[serde(default = "default_capability_timeout_secs")]
    pub capability_timeout_secs: u64,
    /// Number of recent calls kept for the error rate.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Error rate above which the provider is unhealthy.
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
    /// Calls needed before the error rate counts.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

fn default_probe_ttl_secs() -> u64 {
    60
}

fn default_capability_timeout_secs() -> u64 {
    10
}

fn default_window_size() -> usize {
    100
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_max_error_rate() -> f64 {
    0.5
}

fn default_min_samples() -> usize {
    10
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_ttl_secs: default_probe_ttl_secs(),
            capability_timeout_secs: default_capability_timeout_secs(),
            window_size: default_window_size(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_error_rate: default_max_error_rate(),
            min_samples: default_min_samples(),
        }
    }
}

impl HealthConfig {
    pub fn probe_ttl(&self) -> Duration {
        Duration::from_secs(self.probe_ttl_secs)
    }

    pub fn capability_timeout(&self) -> Duration {
        Duration::from_secs(self.capability_timeout_secs)
    }
}

/// Point-in-time view of one provider's health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: Provider,
    pub available: bool,
    pub consecutive_failures: u32,
    /// Failure ratio over the runtime window.
    pub error_rate: f64,
    pub samples: usize,
    pub last_error: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
}

/// Process/capability check for a provider.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok` when the provider responds; `Err` carries the reason it did not.
    async fn probe(&self, provider: Provider, timeout: Duration) -> Result<(), String>;
}

/// Probes a provider by running its CLI with `--version`.
#[derive(Debug, Default)]
pub struct CliProbe;

#[async_trait]
impl HealthProbe for CliProbe {
    async fn probe(&self, provider: Provider, timeout: Duration) -> Result<(), String> {
        let mut cmd = tokio::process::Command::new(provider.executable());
        cmd.arg("--version").kill_on_drop(true);
        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(out)) if out.status.success() => Ok(()),
            Ok(Ok(out)) => Err(format!(
                "{} --version exited with {}",
                provider.executable(),
                out.status.code().unwrap_or(-1)
            )),
            Ok(Err(e)) => Err(format!("{} not runnable: {e}", provider.executable())),
            Err(_) => Err(format!(
                "{} --version timed out after {}s",
                provider.executable(),
                timeout.as_secs()
            )),
        }
    }
}

#[derive(Debug, Default)]
struct HealthEntry {
    /// Last probe verdict and when it was taken.
    probe: Option<(bool, Instant)>,
    window: VecDeque<bool>,
    consecutive_failures: u32,
    /// Set when the runtime rules trip; cleared by recovery.
    tripped: bool,
    last_error: Option<String>,
    last_check: Option<DateTime<Utc>>,
}

impl HealthEntry {
    fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }

    fn runtime_unhealthy(&self, config: &HealthConfig) -> bool {
        self.consecutive_failures >= config.max_consecutive_failures
            || (self.window.len() >= config.min_samples
                && self.error_rate() > config.max_error_rate)
    }

    fn push(&mut self, ok: bool, config: &HealthConfig) {
        self.window.push_back(ok);
        while self.window.len() > config.window_size {
            self.window.pop_front();
        }
    }

    fn probe_is_fresh(&self, ttl: Duration) -> bool {
        matches!(self.probe, Some((_, at)) if at.elapsed() < ttl)
    }
}

/// Tracks per-provider health from probes and runtime outcomes.
///
/// The only writer of provider health. Probe verdicts are cached for
/// `probe_ttl`; runtime outcomes come from [`record_success`] and
/// [`record_failure`].
///
/// [`record_success`]: HealthMonitor::record_success
/// [`record_failure`]: HealthMonitor::record_failure
pub struct HealthMonitor {
    config: HealthConfig,
    probe: Arc<dyn HealthProbe>,
    entries: Mutex<HashMap<Provider, HealthEntry>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            config,
            probe,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Monitor using [`CliProbe`].
    pub fn with_cli_probe(config: HealthConfig) -> Self {
        Self::new(config, Arc::new(CliProbe))
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Whether `provider` can take work. Re-probes when the cached verdict is
    /// stale, missing, or `force` is set.
    pub async fn is_healthy(&self, provider: Provider, force: bool) -> bool {
        let needs_probe = {
            let entries = self.entries.lock();
            force
                || entries
                    .get(&provider)
                    .map_or(true, |e| !e.probe_is_fresh(self.config.probe_ttl()))
        };

        if needs_probe {
            let verdict = self
                .probe
                .probe(provider, self.config.capability_timeout())
                .await;
            let mut entries = self.entries.lock();
            let entry = entries.entry(provider).or_default();
            entry.last_check = Some(Utc::now());
            match verdict {
                Ok(()) => {
                    entry.probe = Some((true, Instant::now()));
                    if entry.tripped {
                        // Half-open: a passing re-probe gives the provider a clean slate.
                        tracing::info!(%provider, "Provider recovered after re-probe");
                        entry.window.clear();
                        entry.consecutive_failures = 0;
                        entry.tripped = false;
                    }
                }
                Err(reason) => {
                    tracing::warn!(%provider, reason = %reason, "Provider probe failed");
                    entry.probe = Some((false, Instant::now()));
                    entry.last_error = Some(reason);
                }
            }
        }

        let entries = self.entries.lock();
        entries.get(&provider).is_some_and(|e| {
            matches!(e.probe, Some((true, _))) && !e.tripped && !e.runtime_unhealthy(&self.config)
        })
    }

    pub fn record_success(&self, provider: Provider) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(provider).or_default();
        entry.push(true, &self.config);
        entry.consecutive_failures = 0;
        entry.tripped = entry.runtime_unhealthy(&self.config);
    }

    pub fn record_failure(&self, provider: Provider, error: impl Into<String>) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(provider).or_default();
        entry.push(false, &self.config);
        entry.consecutive_failures += 1;
        entry.last_error = Some(error.into());
        if !entry.tripped && entry.runtime_unhealthy(&self.config) {
            tracing::warn!(
                %provider,
                consecutive_failures = entry.consecutive_failures,
                error_rate = entry.error_rate(),
                "Provider marked unhealthy"
            );
            entry.tripped = true;
        }
    }

    pub fn snapshot(&self, provider: Provider) -> ProviderHealth {
        let entries = self.entries.lock();
        let empty = HealthEntry::default();
        let entry = entries.get(&provider).unwrap_or(&empty);
        ProviderHealth {
            provider,
            available: matches!(entry.probe, Some((true, _)))
                && !entry.tripped
                && !entry.runtime_unhealthy(&self.config),
            consecutive_failures: entry.consecutive_failures,
            error_rate: entry.error_rate(),
            samples: entry.window.len(),
            last_error: entry.last_error.clone(),
            last_check: entry.last_check,
        }
    }

    /// Probe every provider (forced) and report.
    pub async fn check_all(&self) -> Vec<ProviderHealth> {
        let mut report = Vec::with_capacity(Provider::ALL.len());
        for provider in Provider::ALL {
            self.is_healthy(provider, true).await;
            report.push(self.snapshot(provider));
        }
        report
    }
}
