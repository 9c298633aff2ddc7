//! Rotation strategies: which eligible credential serves the next request
//!
//! Strategies see only the eligible subset, in pool order, and never mutate
//! credentials. The pool calls `select` while holding its lock so that choice
//! and provisional increment happen as one step.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;

use crate::credential::Credential;
use crate::error::{Error, Result};

/// An eligible credential together with its index in pool order.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub position: usize,
    pub credential: &'a Credential,
}

/// Selection policy over eligible credentials.
pub trait RotationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Index into `eligible` of the chosen candidate.
    /// Fails with `NoEligibleCredential` when `eligible` is empty.
    fn select(&self, eligible: &[Candidate<'_>], now: u64) -> Result<usize>;
}

/// Configured strategy name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RoundRobin,
    LoadBalance,
    #[default]
    SmartRotate,
}

impl StrategyKind {
    pub fn build(self, weights: SmartWeights) -> Box<dyn RotationStrategy> {
        match self {
            StrategyKind::RoundRobin => Box::new(RoundRobin::default()),
            StrategyKind::LoadBalance => Box::new(LoadBalance),
            StrategyKind::SmartRotate => Box::new(SmartRotate::new(weights)),
        }
    }
}

/// Cycles through pool order, skipping ineligible credentials.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RotationStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, eligible: &[Candidate<'_>], _now: u64) -> Result<usize> {
        if eligible.is_empty() {
            return Err(Error::NoEligibleCredential);
        }
        let cursor = self.cursor.load(Ordering::Relaxed);
        let chosen = eligible
            .iter()
            .position(|c| c.position >= cursor)
            .unwrap_or(0);
        self.cursor
            .store(eligible[chosen].position + 1, Ordering::Relaxed);
        Ok(chosen)
    }
}

/// Least used today, then least used this minute, then pool order.
#[derive(Debug, Default)]
pub struct LoadBalance;

impl RotationStrategy for LoadBalance {
    fn name(&self) -> &'static str {
        "load_balance"
    }

    fn select(&self, eligible: &[Candidate<'_>], _now: u64) -> Result<usize> {
        eligible
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| {
                (
                    c.credential.requests_today(),
                    c.credential.requests_this_minute(),
                    c.position,
                )
            })
            .map(|(i, _)| i)
            .ok_or(Error::NoEligibleCredential)
    }
}

/// Weights for the smart rotation score.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SmartWeights {
    pub success_rate: f64,
    pub failure_penalty: f64,
    pub remaining_quota: f64,
    pub recency: f64,
    /// Uses older than this carry no recency penalty
    pub recency_window_secs: u64,
}

impl Default for SmartWeights {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            failure_penalty: 2.0,
            remaining_quota: 1.0,
            recency: 0.5,
            recency_window_secs: 60,
        }
    }
}

/// Highest weighted score wins; ties go to pool order.
#[derive(Debug)]
pub struct SmartRotate {
    weights: SmartWeights,
}

impl SmartRotate {
    pub fn new(weights: SmartWeights) -> Self {
        Self { weights }
    }

    /// Score of one credential at `now`.
    ///
    /// `success_rate·rate + failure_penalty/(1+consecutive) +
    /// remaining_quota·fraction − recency·(1 − elapsed/window)`
    pub fn score(&self, credential: &Credential, now: u64) -> f64 {
        let w = &self.weights;
        let health = 1.0 / (1.0 + f64::from(credential.consecutive_failures()));
        let window_millis = w.recency_window_secs.saturating_mul(1000);
        let recent = match credential.last_used_at() {
            Some(used) if window_millis > 0 => {
                let elapsed = now.saturating_sub(used) as f64;
                (1.0 - elapsed / window_millis as f64).max(0.0)
            }
            _ => 0.0,
        };
        w.success_rate * credential.success_rate()
            + w.failure_penalty * health
            + w.remaining_quota * credential.remaining_daily_fraction()
            - w.recency * recent
    }
}

impl RotationStrategy for SmartRotate {
    fn name(&self) -> &'static str {
        "smart_rotate"
    }

    fn select(&self, eligible: &[Candidate<'_>], now: u64) -> Result<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, candidate) in eligible.iter().enumerate() {
            let score = self.score(candidate.credential, now);
            // Strict comparison keeps the earliest on ties
            if best.is_none_or(|(_, top)| score > top) {
                best = Some((i, score));
            }
        }
        best.map(|(i, _)| i).ok_or(Error::NoEligibleCredential)
    }
}
