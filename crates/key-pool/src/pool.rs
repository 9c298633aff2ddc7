//! Credential pool: ordered credentials, eligibility and atomic acquisition
//!
//! All counter mutation happens under one pool-wide tokio Mutex. Acquisition
//! rolls windows, asks the rotation strategy for a choice and provisionally
//! counts the request in a single critical section, so concurrent workers can
//! never both believe the same credential has capacity. The transport call
//! happens after the lock is released.
//!
//! A `Notify` is raised whenever capacity comes back outside the normal window
//! boundaries (rolled-back increments, re-enabled credentials) so waiters can
//! retry selection early.

use std::collections::{BTreeMap, HashMap};

use common::Secret;
use tokio::sync::{Mutex, Notify, futures::Notified};
use tracing::{debug, info, warn};

use crate::credential::{Credential, CredentialSpec, CredentialStatus, RateLimits};
use crate::error::{Error, Result};
use crate::stats::{Attempt, CredentialStats, StatsFile};
use crate::strategy::{Candidate, RotationStrategy};

/// A credential checked out for one dispatch.
///
/// Carries the window starts that received the provisional increment so the
/// outcome can be rolled back against exactly those windows.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: String,
    pub alias: String,
    pub secret: Secret<String>,
    pub minute_window: u64,
    pub day_window: u64,
    pub acquired_at: u64,
}

struct PoolState {
    credentials: Vec<Credential>,
    by_id: HashMap<String, usize>,
}

impl PoolState {
    fn get_mut(&mut self, id: &str) -> Result<&mut Credential> {
        let index = *self
            .by_id
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        Ok(&mut self.credentials[index])
    }

    fn find_mut(&mut self, id_or_alias: &str) -> Result<&mut Credential> {
        if let Some(&index) = self.by_id.get(id_or_alias) {
            return Ok(&mut self.credentials[index]);
        }
        self.credentials
            .iter_mut()
            .find(|c| c.alias == id_or_alias)
            .ok_or_else(|| Error::NotFound(id_or_alias.to_string()))
    }
}

/// Ordered, id-keyed set of credentials shared by all workers.
pub struct CredentialPool {
    state: Mutex<PoolState>,
    capacity_returned: Notify,
}

impl CredentialPool {
    /// Build the pool from credential records and previously persisted counters.
    ///
    /// Records whose secret duplicates an earlier one, or whose effective
    /// limits allow no requests, are skipped. Fails with
    /// `Config` if no usable record remains.
    pub fn load(
        specs: Vec<CredentialSpec>,
        persisted: &StatsFile,
        defaults: RateLimits,
        now: u64,
    ) -> Result<Self> {
        let mut credentials: Vec<Credential> = Vec::with_capacity(specs.len());
        let mut by_id = HashMap::new();

        for spec in specs {
            if spec.secret.is_blank() {
                warn!(alias = %spec.alias, "skipping credential with empty secret");
                continue;
            }
            let mut credential = Credential::new(spec, defaults, now);
            if credential.limits.is_zero() {
                warn!(
                    credential_id = %credential.id,
                    alias = %credential.alias,
                    "skipping credential with a zero request limit"
                );
                continue;
            }
            if by_id.contains_key(&credential.id) {
                warn!(credential_id = %credential.id, alias = %credential.alias, "skipping duplicate credential");
                continue;
            }
            if let Some(stats) = persisted.credentials.get(&credential.id) {
                credential.restore(stats, now);
                if !credential.enabled {
                    info!(
                        credential_id = %credential.id,
                        alias = %credential.alias,
                        reason = credential.disabled_reason.as_deref().unwrap_or("unknown"),
                        "credential disabled by previous run"
                    );
                }
            }
            by_id.insert(credential.id.clone(), credentials.len());
            credentials.push(credential);
        }

        if credentials.is_empty() {
            return Err(Error::Config("no usable credentials configured".into()));
        }
        info!(credentials = credentials.len(), "credential pool loaded");

        Ok(Self {
            state: Mutex::new(PoolState { credentials, by_id }),
            capacity_returned: Notify::new(),
        })
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.credentials.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Credentials that are enabled and under both limits at `now`, in pool order.
    pub async fn eligible(&self, now: u64) -> Vec<CredentialStatus> {
        let mut state = self.state.lock().await;
        state
            .credentials
            .iter_mut()
            .filter_map(|c| {
                c.roll(now);
                c.is_eligible().then(|| c.status(now))
            })
            .collect()
    }

    /// Select an eligible credential with `strategy` and count the request
    /// against it, as one step.
    ///
    /// Returns `NoEligibleCredential` when nothing has capacity.
    pub async fn acquire(&self, strategy: &dyn RotationStrategy, now: u64) -> Result<Lease> {
        let mut state = self.state.lock().await;
        for credential in state.credentials.iter_mut() {
            credential.roll(now);
        }

        let candidates: Vec<Candidate<'_>> = state
            .credentials
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_eligible())
            .map(|(position, credential)| Candidate {
                position,
                credential,
            })
            .collect();
        let chosen = strategy.select(&candidates, now)?;
        let position = candidates[chosen].position;

        let credential = &mut state.credentials[position];
        if !credential.reserve(now) {
            return Err(Error::NoEligibleCredential);
        }
        debug!(
            credential_id = %credential.id,
            alias = %credential.alias,
            strategy = strategy.name(),
            minute = credential.requests_this_minute(),
            day = credential.requests_today(),
            "credential acquired"
        );
        Ok(Lease {
            id: credential.id.clone(),
            alias: credential.alias.clone(),
            secret: credential.secret.clone(),
            minute_window: credential.minute.start_millis(),
            day_window: credential.day.start_millis(),
            acquired_at: now,
        })
    }

    /// Mark a credential unusable. Idempotent; unknown ids are `NotFound`.
    pub async fn disable(&self, id: &str, reason: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let credential = state.get_mut(id)?;
        if credential.disable(reason) {
            warn!(credential_id = %credential.id, alias = %credential.alias, reason, "credential disabled");
        }
        Ok(())
    }

    /// Re-enable a credential (by id or alias) and clear its failure streak.
    pub async fn enable(&self, id_or_alias: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let credential = state.find_mut(id_or_alias)?;
        credential.enable();
        info!(credential_id = %credential.id, alias = %credential.alias, "credential enabled");
        drop(state);
        self.capacity_returned.notify_waiters();
        Ok(())
    }

    /// Earliest time any enabled credential can serve a request.
    ///
    /// `now` if something is already eligible; otherwise the minimum window
    /// boundary over enabled credentials. None only when every credential is
    /// disabled.
    pub async fn next_reset_time(&self, now: u64) -> Option<u64> {
        let mut state = self.state.lock().await;
        state
            .credentials
            .iter_mut()
            .filter_map(|c| {
                c.roll(now);
                c.eligible_at(now)
            })
            .min()
    }

    /// Apply a finished attempt to its credential's counters.
    pub async fn apply(&self, attempt: &Attempt) -> Result<()> {
        let mut state = self.state.lock().await;
        let credential = state.get_mut(&attempt.credential_id)?;
        let returned = credential.apply(
            &attempt.outcome,
            attempt.minute_window,
            attempt.day_window,
            attempt.at,
        );
        drop(state);
        if returned {
            self.capacity_returned.notify_waiters();
        }
        Ok(())
    }

    /// Future resolving the next time capacity is handed back early.
    ///
    /// Create (and `enable`) it before checking eligibility so a notification
    /// between the check and the wait is not lost.
    pub fn capacity_returned(&self) -> Notified<'_> {
        self.capacity_returned.notified()
    }

    /// Live status of every credential, in pool order.
    pub async fn statuses(&self, now: u64) -> Vec<CredentialStatus> {
        let mut state = self.state.lock().await;
        state
            .credentials
            .iter_mut()
            .map(|c| {
                c.roll(now);
                c.status(now)
            })
            .collect()
    }

    /// Persistable counters keyed by credential id.
    pub async fn snapshot(&self) -> BTreeMap<String, CredentialStats> {
        let state = self.state.lock().await;
        state
            .credentials
            .iter()
            .map(|c| (c.id.clone(), c.stats()))
            .collect()
    }

    /// Secret for a credential (by id or alias), for probing.
    pub async fn secret(&self, id_or_alias: &str) -> Result<(String, Secret<String>)> {
        let mut state = self.state.lock().await;
        let credential = state.find_mut(id_or_alias)?;
        Ok((credential.id.clone(), credential.secret.clone()))
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Status mapping: all credentials eligible → healthy, some eligible →
    /// degraded, none eligible → unhealthy.
    pub async fn health(&self, now: u64) -> serde_json::Value {
        let statuses = self.statuses(now).await;
        let total = statuses.len();
        let eligible = statuses.iter().filter(|s| s.eligible).count();
        let disabled = statuses.iter().filter(|s| !s.enabled).count();
        let limited = total - eligible - disabled;

        let pool_status = if eligible == total && total > 0 {
            "healthy"
        } else if eligible > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        let credentials: Vec<_> = statuses
            .iter()
            .map(|s| {
                serde_json::json!({
                    "id": s.id,
                    "alias": s.alias,
                    "status": status_label(s),
                    "requests_this_minute": s.requests_this_minute,
                    "requests_today": s.requests_today,
                    "eligible_at": s.eligible_at,
                })
            })
            .collect();

        serde_json::json!({
            "status": pool_status,
            "credentials_total": total,
            "credentials_eligible": eligible,
            "credentials_rate_limited": limited,
            "credentials_disabled": disabled,
            "credentials": credentials
        })
    }
}

fn status_label(status: &CredentialStatus) -> &'static str {
    if !status.enabled {
        "disabled"
    } else if status.eligible {
        "eligible"
    } else {
        "rate_limited"
    }
}
