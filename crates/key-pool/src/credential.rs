//! Credential entity: a secret plus its usage counters and eligibility state

use common::Secret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::clock::{DAY_MILLIS, MINUTE_MILLIS};
use crate::error::{Error, Result};
use crate::stats::{AttemptOutcome, CredentialStats};
use crate::window::RateWindow;
use transport::QuotaScope;

/// Guard against division by zero in the success rate.
const SUCCESS_RATE_EPSILON: f64 = 1e-9;

/// Per-key request limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub requests_per_minute: u32,
    pub requests_per_day: u32,
}

impl RateLimits {
    pub fn with_overrides(self, overrides: &LimitOverrides) -> Self {
        Self {
            requests_per_minute: overrides.rpm.unwrap_or(self.requests_per_minute),
            requests_per_day: overrides.rpd.unwrap_or(self.requests_per_day),
        }
    }

    /// True when either window admits no requests at all.
    pub fn is_zero(&self) -> bool {
        self.requests_per_minute == 0 || self.requests_per_day == 0
    }
}

/// Optional per-key replacements for the pool-wide limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitOverrides {
    pub rpm: Option<u32>,
    pub rpd: Option<u32>,
}

impl LimitOverrides {
    /// A zero limit would leave the key permanently ineligible, so it is
    /// rejected rather than stored.
    pub fn validate(&self, alias: &str) -> Result<()> {
        for (name, value) in [("rpm", self.rpm), ("rpd", self.rpd)] {
            if value == Some(0) {
                return Err(Error::Config(format!(
                    "{name} for {alias} must be greater than 0"
                )));
            }
        }
        Ok(())
    }
}

/// A credential record as read from a key source, before any usage state.
#[derive(Debug, Clone)]
pub struct CredentialSpec {
    pub secret: Secret<String>,
    pub alias: String,
    pub overrides: LimitOverrides,
}

/// Stable identifier for a secret: first 16 hex chars of its SHA-256.
///
/// Safe to log and persist; the same key always maps to the same id across runs.
pub fn credential_id(secret: &Secret<String>) -> String {
    let digest = Sha256::digest(secret.expose().as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

/// One API key and its live state. Counters are mutated only by the pool
/// (selection, apply) under the pool lock.
#[derive(Debug, Clone)]
pub struct Credential {
    pub(crate) id: String,
    pub(crate) alias: String,
    pub(crate) secret: Secret<String>,
    pub(crate) limits: RateLimits,
    pub(crate) enabled: bool,
    pub(crate) disabled_reason: Option<String>,
    pub(crate) minute: RateWindow,
    pub(crate) day: RateWindow,
    pub(crate) consecutive_failures: u32,
    pub(crate) total_success: u64,
    pub(crate) total_failure: u64,
    pub(crate) rate_limit_hits: u64,
    pub(crate) last_used_at: Option<u64>,
    pub(crate) last_error: Option<String>,
}

impl Credential {
    pub fn new(spec: CredentialSpec, defaults: RateLimits, now: u64) -> Self {
        let limits = defaults.with_overrides(&spec.overrides);
        Self {
            id: credential_id(&spec.secret),
            alias: spec.alias,
            secret: spec.secret,
            limits,
            enabled: true,
            disabled_reason: None,
            minute: RateWindow::new(MINUTE_MILLIS, limits.requests_per_minute, now),
            day: RateWindow::new(DAY_MILLIS, limits.requests_per_day, now),
            consecutive_failures: 0,
            total_success: 0,
            total_failure: 0,
            rate_limit_hits: 0,
            last_used_at: None,
            last_error: None,
        }
    }

    /// Overlay previously persisted counters. The alias from the key source wins.
    pub(crate) fn restore(&mut self, stats: &CredentialStats, now: u64) {
        self.enabled = stats.enabled;
        self.disabled_reason = stats.disabled_reason.clone();
        self.minute = RateWindow::restore(
            MINUTE_MILLIS,
            self.limits.requests_per_minute,
            stats.minute_window_start,
            stats.requests_this_minute,
            now,
        );
        self.day = RateWindow::restore(
            DAY_MILLIS,
            self.limits.requests_per_day,
            stats.day_window_start,
            stats.requests_today,
            now,
        );
        self.consecutive_failures = stats.consecutive_failures;
        self.total_success = stats.total_success;
        self.total_failure = stats.total_failure;
        self.rate_limit_hits = stats.rate_limit_hits;
        self.last_used_at = stats.last_used_at;
        self.last_error = stats.last_error.clone();
    }

    /// Lazily reset expired windows.
    pub(crate) fn roll(&mut self, now: u64) {
        self.minute.roll(now);
        self.day.roll(now);
    }

    /// Enabled and under both limits. Call `roll` first.
    pub fn is_eligible(&self) -> bool {
        self.enabled && self.minute.has_capacity() && self.day.has_capacity()
    }

    /// Earliest time this credential can serve a request, or None when it
    /// never can (disabled or a zero limit).
    /// A full day window dominates a full minute window.
    pub fn eligible_at(&self, now: u64) -> Option<u64> {
        if !self.enabled || self.limits.is_zero() {
            return None;
        }
        if !self.day.has_capacity() {
            Some(self.day.resets_at())
        } else if !self.minute.has_capacity() {
            Some(self.minute.resets_at())
        } else {
            Some(now)
        }
    }

    /// Count a request provisionally against both windows.
    pub(crate) fn reserve(&mut self, now: u64) -> bool {
        if !self.is_eligible() {
            return false;
        }
        self.minute.increment();
        self.day.increment();
        self.last_used_at = Some(now);
        true
    }

    pub(crate) fn disable(&mut self, reason: &str) -> bool {
        if !self.enabled {
            return false;
        }
        self.enabled = false;
        self.disabled_reason = Some(reason.to_string());
        true
    }

    pub(crate) fn enable(&mut self) {
        self.enabled = true;
        self.disabled_reason = None;
        self.consecutive_failures = 0;
    }

    /// Apply a finished attempt to counters and totals.
    ///
    /// `minute_window`/`day_window` identify the windows that received the
    /// provisional increment, so rollbacks never touch a newer window. Returns
    /// true when window capacity was handed back.
    pub(crate) fn apply(
        &mut self,
        outcome: &AttemptOutcome,
        minute_window: u64,
        day_window: u64,
        now: u64,
    ) -> bool {
        self.roll(now);
        match outcome {
            AttemptOutcome::Success => {
                self.total_success += 1;
                self.consecutive_failures = 0;
                self.last_error = None;
                false
            }
            AttemptOutcome::AuthFailure(reason) => {
                let minute = self.minute.rollback(minute_window);
                let day = self.day.rollback(day_window);
                self.total_failure += 1;
                self.last_error = Some(reason.clone());
                if self.disable(reason) {
                    warn!(credential_id = %self.id, alias = %self.alias, "credential disabled (authentication rejected)");
                }
                minute || day
            }
            AttemptOutcome::RateLimited(scope) => {
                self.rate_limit_hits += 1;
                self.minute.saturate();
                match scope {
                    QuotaScope::Minute => self.day.rollback(day_window),
                    QuotaScope::Day => {
                        self.day.saturate();
                        false
                    }
                }
            }
            AttemptOutcome::Transient(message) => {
                self.total_failure += 1;
                self.consecutive_failures += 1;
                self.last_error = Some(message.clone());
                false
            }
            AttemptOutcome::PermanentContent(message) => {
                self.total_failure += 1;
                self.last_error = Some(message.clone());
                false
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn secret(&self) -> &Secret<String> {
        &self.secret
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    pub fn requests_this_minute(&self) -> u32 {
        self.minute.count()
    }

    pub fn requests_today(&self) -> u32 {
        self.day.count()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn total_success(&self) -> u64 {
        self.total_success
    }

    pub fn total_failure(&self) -> u64 {
        self.total_failure
    }

    pub fn last_used_at(&self) -> Option<u64> {
        self.last_used_at
    }

    /// `totalSuccess / (totalSuccess + totalFailure + ε)`
    pub fn success_rate(&self) -> f64 {
        let success = self.total_success as f64;
        success / (success + self.total_failure as f64 + SUCCESS_RATE_EPSILON)
    }

    /// Fraction of today's quota still unused, in `[0, 1]`.
    pub fn remaining_daily_fraction(&self) -> f64 {
        if self.day.limit() == 0 {
            return 0.0;
        }
        f64::from(self.day.remaining()) / f64::from(self.day.limit())
    }

    /// Persistable counters.
    pub fn stats(&self) -> CredentialStats {
        CredentialStats {
            alias: self.alias.clone(),
            enabled: self.enabled,
            disabled_reason: self.disabled_reason.clone(),
            requests_this_minute: self.minute.count(),
            minute_window_start: self.minute.start_millis(),
            requests_today: self.day.count(),
            day_window_start: self.day.start_millis(),
            total_success: self.total_success,
            total_failure: self.total_failure,
            rate_limit_hits: self.rate_limit_hits,
            consecutive_failures: self.consecutive_failures,
            last_used_at: self.last_used_at,
            last_error: self.last_error.clone(),
        }
    }

    /// Live status for listings and health. Never includes the secret.
    pub fn status(&self, now: u64) -> CredentialStatus {
        CredentialStatus {
            id: self.id.clone(),
            alias: self.alias.clone(),
            enabled: self.enabled,
            eligible: self.is_eligible(),
            disabled_reason: self.disabled_reason.clone(),
            requests_this_minute: self.minute.count(),
            limit_rpm: self.limits.requests_per_minute,
            requests_today: self.day.count(),
            limit_rpd: self.limits.requests_per_day,
            total_success: self.total_success,
            total_failure: self.total_failure,
            rate_limit_hits: self.rate_limit_hits,
            consecutive_failures: self.consecutive_failures,
            success_rate: self.success_rate(),
            eligible_at: self.eligible_at(now),
            last_used_at: self.last_used_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Point-in-time view of a credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialStatus {
    pub id: String,
    pub alias: String,
    pub enabled: bool,
    pub eligible: bool,
    pub disabled_reason: Option<String>,
    pub requests_this_minute: u32,
    pub limit_rpm: u32,
    pub requests_today: u32,
    pub limit_rpd: u32,
    pub total_success: u64,
    pub total_failure: u64,
    pub rate_limit_hits: u64,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub eligible_at: Option<u64>,
    pub last_used_at: Option<u64>,
    pub last_error: Option<String>,
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    const NOW: u64 = 1_792_232_130_000;

    #[test]
    fn id_is_stable_and_hides_secret() {
        let a = credential_id(&Secret::from("AIzaSy-one"));
        let b = credential_id(&Secret::from("AIzaSy-one"));
        let c = credential_id(&Secret::from("AIzaSy-two"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(!a.contains("AIza"));
    }

    #[test]
    fn overrides_replace_defaults() {
        let mut s = spec("a");
        s.overrides = LimitOverrides {
            rpm: Some(2),
            rpd: None,
        };
        let c = Credential::new(s, LIMITS, NOW);
        assert_eq!(c.limits().requests_per_minute, 2);
        assert_eq!(c.limits().requests_per_day, 20);
    }

    #[test]
    fn zero_override_is_rejected() {
        let ok = LimitOverrides {
            rpm: Some(1),
            rpd: None,
        };
        assert!(ok.validate("a").is_ok());
        let zero_rpd = LimitOverrides {
            rpm: None,
            rpd: Some(0),
        };
        match zero_rpd.validate("a") {
            Err(Error::Config(msg)) => assert!(msg.contains("rpd for a")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn reserve_counts_both_windows_and_stamps_use() {
        let mut c = credential("a", NOW);
        assert!(c.reserve(NOW));
        assert_eq!(c.requests_this_minute(), 1);
        assert_eq!(c.requests_today(), 1);
        assert_eq!(c.last_used_at(), Some(NOW));
    }

    #[test]
    fn minute_limit_blocks_until_boundary_day_count_kept() {
        let mut c = credential("a", NOW);
        for _ in 0..5 {
            assert!(c.reserve(NOW));
        }
        assert!(!c.is_eligible());
        let boundary = c.minute.resets_at();
        assert_eq!(c.eligible_at(NOW), Some(boundary));

        c.roll(boundary);
        assert!(c.is_eligible());
        assert_eq!(c.requests_this_minute(), 0);
        assert_eq!(c.requests_today(), 5);
    }

    #[test]
    fn full_day_dominates_eligible_at() {
        let mut c = credential("a", NOW);
        c.day.saturate();
        c.minute.saturate();
        assert_eq!(c.eligible_at(NOW), Some(c.day.resets_at()));
    }

    #[test]
    fn disabled_has_no_eligible_time() {
        let mut c = credential("a", NOW);
        assert!(c.disable("bad key"));
        assert!(!c.disable("again"));
        assert_eq!(c.disabled_reason.as_deref(), Some("bad key"));
        assert_eq!(c.eligible_at(NOW), None);
        assert!(!c.reserve(NOW));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut c = credential("a", NOW);
        c.reserve(NOW);
        let (m, d) = (c.minute.start_millis(), c.day.start_millis());
        c.apply(&AttemptOutcome::Transient("timeout".into()), m, d, NOW);
        c.apply(&AttemptOutcome::Transient("timeout".into()), m, d, NOW);
        assert_eq!(c.consecutive_failures(), 2);
        assert_eq!(c.total_failure(), 2);

        c.apply(&AttemptOutcome::Success, m, d, NOW);
        assert_eq!(c.consecutive_failures(), 0);
        assert_eq!(c.total_success(), 1);
        assert!(c.last_error.is_none());
    }

    #[test]
    fn auth_failure_rolls_back_and_disables() {
        let mut c = credential("a", NOW);
        c.reserve(NOW);
        let (m, d) = (c.minute.start_millis(), c.day.start_millis());
        let returned = c.apply(&AttemptOutcome::AuthFailure("401".into()), m, d, NOW);
        assert!(returned);
        assert!(!c.enabled());
        assert_eq!(c.requests_this_minute(), 0);
        assert_eq!(c.requests_today(), 0);
    }

    #[test]
    fn minute_rate_limit_saturates_minute_only() {
        let mut c = credential("a", NOW);
        c.reserve(NOW);
        let (m, d) = (c.minute.start_millis(), c.day.start_millis());
        c.apply(&AttemptOutcome::RateLimited(QuotaScope::Minute), m, d, NOW);
        assert_eq!(c.requests_this_minute(), 5);
        assert_eq!(c.requests_today(), 0);
        assert_eq!(c.rate_limit_hits, 1);
        assert_eq!(c.total_failure(), 0);
        assert!(!c.is_eligible());
    }

    #[test]
    fn day_rate_limit_saturates_both() {
        let mut c = credential("a", NOW);
        c.reserve(NOW);
        let (m, d) = (c.minute.start_millis(), c.day.start_millis());
        c.apply(&AttemptOutcome::RateLimited(QuotaScope::Day), m, d, NOW);
        assert_eq!(c.requests_today(), 20);
        assert_eq!(c.eligible_at(NOW), Some(c.day.resets_at()));
    }

    #[test]
    fn permanent_content_counts_failure_without_streak() {
        let mut c = credential("a", NOW);
        c.reserve(NOW);
        let (m, d) = (c.minute.start_millis(), c.day.start_millis());
        c.apply(&AttemptOutcome::PermanentContent("blocked".into()), m, d, NOW);
        assert_eq!(c.total_failure(), 1);
        assert_eq!(c.consecutive_failures(), 0);
        assert_eq!(c.requests_today(), 1);
    }

    #[test]
    fn success_rate_handles_zero_history() {
        let c = credential("a", NOW);
        assert_eq!(c.success_rate(), 0.0);
        let mut d = credential("b", NOW);
        d.total_success = 3;
        d.total_failure = 1;
        assert!((d.success_rate() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn stats_roundtrip_through_restore() {
        let mut c = credential("a", NOW);
        c.reserve(NOW);
        c.reserve(NOW);
        c.total_success = 7;
        c.consecutive_failures = 1;
        let stats = c.stats();

        let mut restored = credential("a", NOW);
        restored.restore(&stats, NOW + 1_000);
        assert_eq!(restored.stats(), stats);
    }

    #[test]
    fn status_never_contains_secret() {
        let c = credential("a", NOW);
        let json = serde_json::to_string(&c.status(NOW)).unwrap();
        assert!(!json.contains("secret-a"));
        assert!(json.contains("\"alias\":\"a\""));
    }
}
