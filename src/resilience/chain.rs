use super::error::{ClassifiedError, ErrorKind, classify_error};
use super::health::{HealthStats, ProviderHealth};
use crate::config::FallbackConfig;
use crate::utils::lock_or_recover;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Result of a call routed through the chain.
#[derive(Debug)]
pub enum FallbackOutcome<T> {
    /// Exactly one provider served the call.
    Served { value: T, provider: String },
    /// Every provider and attempt failed. `last_error` is `None` only when
    /// the chain has no providers at all.
    Exhausted { last_error: Option<ClassifiedError> },
}

impl<T> FallbackOutcome<T> {
    pub fn provider(&self) -> &str {
        match self {
            FallbackOutcome::Served { provider, .. } => provider,
            FallbackOutcome::Exhausted { .. } => "failed",
        }
    }
}

/// Whether a failed attempt should be repeated against the same provider.
/// `attempt` is the zero-based index of the attempt that just failed.
pub fn should_retry(kind: ErrorKind, attempt: u32) -> bool {
    match kind {
        ErrorKind::AuthFailed | ErrorKind::InvalidRequest => false,
        ErrorKind::Timeout | ErrorKind::InternalError => attempt < 3,
        ErrorKind::RateLimit => attempt < 2,
        ErrorKind::Unknown => false,
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Spend {
    cost_usd: f64,
    calls: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    #[serde(flatten)]
    pub health: HealthStats,
    pub cost_usd: f64,
    pub calls: u64,
    pub avg_cost_per_call: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainStats {
    pub providers: BTreeMap<String, ProviderStats>,
    pub total_cost_usd: f64,
    pub total_calls: u64,
    pub best_provider: Option<String>,
    pub available_providers: Vec<String>,
}

/// Ordered providers with health-gated, bounded retry-then-fallback.
///
/// Health and spend live behind std mutexes that are only held for counter
/// updates, never across an await, so one chain can be shared by concurrent
/// conversations and the scheduler.
pub struct ProviderFallbackChain {
    order: Vec<String>,
    health: Mutex<HashMap<String, ProviderHealth>>,
    spend: Mutex<HashMap<String, Spend>>,
    max_attempts: u32,
    backoff_base: Duration,
}

impl ProviderFallbackChain {
    pub fn new(order: Vec<String>, cfg: &FallbackConfig) -> Self {
        let health = order
            .iter()
            .map(|p| (p.clone(), ProviderHealth::new()))
            .collect();
        let spend = order.iter().map(|p| (p.clone(), Spend::default())).collect();
        info!(order = %order.join(" -> "), "fallback chain initialized");
        Self {
            order,
            health: Mutex::new(health),
            spend: Mutex::new(spend),
            max_attempts: cfg.max_attempts.max(1),
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
        }
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Providers currently eligible, in preference order. Elapsed cooldowns
    /// are committed here. When nothing is eligible the full order is
    /// returned so the caller still has something to try.
    pub fn available_providers(&self) -> Vec<String> {
        self.available_providers_at(Utc::now())
    }

    pub fn available_providers_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut health = lock_or_recover(&self.health);
        let ready: Vec<String> = self
            .order
            .iter()
            .filter(|p| health.get_mut(*p).is_some_and(|h| h.try_recover_at(now)))
            .cloned()
            .collect();
        if ready.is_empty() && !self.order.is_empty() {
            warn!("no providers available, entering recovery mode with full order");
            return self.order.clone();
        }
        ready
    }

    /// Runs `call` against each eligible provider in turn until one succeeds.
    ///
    /// Each provider gets up to `max_attempts` attempts; whether a failed
    /// attempt is repeated depends on [`should_retry`], with an exponential
    /// backoff sleep between attempts.
    pub async fn execute_with_fallback<T, F, Fut>(&self, mut call: F) -> FallbackOutcome<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut last_error: Option<ClassifiedError> = None;

        for provider in self.available_providers() {
            let mut attempt: u32 = 0;
            loop {
                debug!(provider = %provider, attempt = attempt + 1, "calling provider");
                let started = Instant::now();
                match call(provider.clone()).await {
                    Ok(value) => {
                        self.record_success(&provider);
                        self.count_served(&provider);
                        info!(
                            provider = %provider,
                            attempt = attempt + 1,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "provider call succeeded"
                        );
                        return FallbackOutcome::Served { value, provider };
                    }
                    Err(err) => {
                        let classified = classify_error(&err, &provider);
                        self.record_failure(&provider, &classified);
                        warn!(
                            provider = %provider,
                            kind = %classified.kind,
                            attempt = attempt + 1,
                            error = %classified.message,
                            "provider call failed"
                        );
                        let retry = should_retry(classified.kind, attempt)
                            && attempt + 1 < self.max_attempts;
                        last_error = Some(classified);
                        if !retry {
                            break;
                        }
                        attempt += 1;
                        let wait = self.backoff_base * 2u32.saturating_pow(attempt);
                        debug!(provider = %provider, wait_ms = wait.as_millis() as u64, "backing off");
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        error!(
            last_error = last_error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
            "all providers exhausted"
        );
        FallbackOutcome::Exhausted { last_error }
    }

    pub fn record_success(&self, provider: &str) {
        if let Some(h) = lock_or_recover(&self.health).get_mut(provider) {
            h.record_success();
        }
    }

    pub fn record_failure(&self, provider: &str, err: &ClassifiedError) {
        self.record_failure_at(provider, err, Utc::now());
    }

    pub fn record_failure_at(&self, provider: &str, err: &ClassifiedError, now: DateTime<Utc>) {
        if let Some(h) = lock_or_recover(&self.health).get_mut(provider) {
            h.record_failure_at(&err.message, err.kind, now);
            if h.is_permanently_disabled() {
                error!(provider, "provider disabled after authentication failure");
            }
        }
    }

    /// Served calls only; failed attempts show up in the health counters.
    fn count_served(&self, provider: &str) {
        if let Some(s) = lock_or_recover(&self.spend).get_mut(provider) {
            s.calls += 1;
        }
    }

    pub fn record_cost(&self, provider: &str, usd: f64) {
        if let Some(s) = lock_or_recover(&self.spend).get_mut(provider) {
            s.cost_usd += usd;
        }
    }

    pub fn call_counts(&self) -> BTreeMap<String, u64> {
        lock_or_recover(&self.spend)
            .iter()
            .map(|(p, s)| (p.clone(), s.calls))
            .collect()
    }

    /// Snapshot of one provider's health.
    pub fn health(&self, provider: &str) -> Option<ProviderHealth> {
        lock_or_recover(&self.health).get(provider).cloned()
    }

    /// Re-enables a provider regardless of why it was disabled.
    pub fn reset_provider(&self, provider: &str) -> bool {
        match lock_or_recover(&self.health).get_mut(provider) {
            Some(h) => {
                h.reset();
                info!(provider, "provider health reset");
                true
            }
            None => false,
        }
    }

    /// Read-only snapshot; elapsed cooldowns are reported as available but
    /// not committed.
    pub fn stats(&self) -> ChainStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> ChainStats {
        let health = lock_or_recover(&self.health);
        let spend = lock_or_recover(&self.spend);
        let available_providers: Vec<String> = self
            .order
            .iter()
            .filter(|p| health.get(*p).is_some_and(|h| h.is_ready_at(now)))
            .cloned()
            .collect();

        let mut providers = BTreeMap::new();
        let mut total_cost_usd = 0.0;
        let mut total_calls = 0;
        let mut best: Option<(&String, f64)> = None;
        for name in &self.order {
            let Some(h) = health.get(name) else { continue };
            let s = spend.get(name).copied().unwrap_or_default();
            total_cost_usd += s.cost_usd;
            total_calls += s.calls;
            let rate = h.success_rate();
            if best.is_none_or(|(_, r)| rate > r) {
                best = Some((name, rate));
            }
            providers.insert(
                name.clone(),
                ProviderStats {
                    health: h.stats(),
                    cost_usd: s.cost_usd,
                    calls: s.calls,
                    avg_cost_per_call: s.cost_usd / s.calls.max(1) as f64,
                },
            );
        }

        ChainStats {
            providers,
            total_cost_usd,
            total_calls,
            best_provider: best.map(|(name, _)| name.clone()),
            available_providers,
        }
    }
}
