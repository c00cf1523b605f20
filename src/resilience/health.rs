use super::error::ErrorKind;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

const RATE_LIMIT_STREAK: u32 = 3;
const RATE_LIMIT_COOLDOWN_MINUTES: i64 = 5;
const FAILURE_STREAK: u32 = 10;
const FAILURE_COOLDOWN_MINUTES: i64 = 10;

/// Health counters and availability gate for one provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderHealth {
    pub total_requests: u64,
    pub success_requests: u64,
    pub failed_requests: u64,
    pub consecutive_failures: u32,
    pub is_available: bool,
    pub unavailable_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_type: Option<ErrorKind>,
    pub last_error_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStats {
    pub total_requests: u64,
    pub success_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub is_available: bool,
    pub unavailable_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_type: Option<ErrorKind>,
}

impl ProviderHealth {
    pub fn new() -> Self {
        Self {
            is_available: true,
            ..Default::default()
        }
    }

    pub fn record_success(&mut self) {
        self.total_requests += 1;
        self.success_requests += 1;
        self.consecutive_failures = 0;
        self.is_available = true;
    }

    pub fn record_failure(&mut self, error: &str, kind: ErrorKind) {
        self.record_failure_at(error, kind, Utc::now());
    }

    pub fn record_failure_at(&mut self, error: &str, kind: ErrorKind, now: DateTime<Utc>) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());
        self.last_error_type = Some(kind);
        self.last_error_time = Some(now);

        match kind {
            ErrorKind::RateLimit if self.consecutive_failures > RATE_LIMIT_STREAK => {
                self.disable_for(now, Duration::minutes(RATE_LIMIT_COOLDOWN_MINUTES));
            }
            ErrorKind::AuthFailed => {
                // no expiry: only reset() brings it back
                self.is_available = false;
                self.unavailable_until = None;
            }
            _ => {}
        }

        if self.consecutive_failures > FAILURE_STREAK && kind != ErrorKind::AuthFailed {
            self.disable_for(now, Duration::minutes(FAILURE_COOLDOWN_MINUTES));
        }
    }

    fn disable_for(&mut self, now: DateTime<Utc>, cooldown: Duration) {
        if self.is_permanently_disabled() {
            return;
        }
        self.is_available = false;
        let until = now + cooldown;
        // never shorten an existing longer cooldown
        self.unavailable_until = Some(match self.unavailable_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    pub fn is_permanently_disabled(&self) -> bool {
        !self.is_available && self.unavailable_until.is_none()
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready_at(Utc::now())
    }

    /// Pure eligibility query. A provider whose cooldown has elapsed reads as
    /// ready; call [`try_recover_at`](Self::try_recover_at) to commit it.
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        if let Some(until) = self.unavailable_until
            && now < until
        {
            return false;
        }
        if self.is_available {
            return true;
        }
        // expired cooldown; permanent disables carry no deadline
        self.unavailable_until.is_some()
    }

    pub fn try_recover(&mut self) -> bool {
        self.try_recover_at(Utc::now())
    }

    /// Re-enables the provider once its cooldown has passed, resetting the
    /// failure streak. Returns the resulting eligibility.
    pub fn try_recover_at(&mut self, now: DateTime<Utc>) -> bool {
        if let Some(until) = self.unavailable_until
            && now >= until
        {
            self.is_available = true;
            self.unavailable_until = None;
            self.consecutive_failures = 0;
        }
        self.is_ready_at(now)
    }

    /// External reset; the only way back from an auth failure.
    pub fn reset(&mut self) {
        self.is_available = true;
        self.unavailable_until = None;
        self.consecutive_failures = 0;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.success_requests as f64 / self.total_requests as f64
    }

    pub fn stats(&self) -> HealthStats {
        HealthStats {
            total_requests: self.total_requests,
            success_requests: self.success_requests,
            failed_requests: self.failed_requests,
            success_rate: self.success_rate(),
            consecutive_failures: self.consecutive_failures,
            is_available: self.is_available,
            unavailable_until: self.unavailable_until,
            last_error: self.last_error.clone(),
            last_error_type: self.last_error_type,
        }
    }
}
