//! Administrative commands over the key file and the stats file
//!
//! Every command loads credentials exactly as `run` does, so `list` and
//! `stats` show what the next batch will see. Output goes to the supplied
//! writer; logs stay on stderr.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use common::Secret;
use key_pool::{
    Clock, CredentialPool, CredentialStatus, KeyFile, LimitOverrides, RateLimits, StatsFile,
    StatsRecorder, load_specs, specs_from_vars,
};
use transport::{Outcome, Transport};

use crate::config::Config;

pub struct Admin {
    key_file: PathBuf,
    env_prefix: String,
    recorder: StatsRecorder,
    limits: RateLimits,
    clock: Clock,
}

impl Admin {
    pub fn new(config: &Config, clock: Clock) -> Self {
        Self {
            key_file: config.keys.file.clone(),
            env_prefix: config.keys.env_prefix.clone(),
            recorder: StatsRecorder::new(config.keys.stats_file.clone(), None),
            limits: config.rate_limits(),
            clock,
        }
    }

    async fn open_pool(&self) -> Result<CredentialPool> {
        let specs = load_specs(&self.key_file, &self.env_prefix).await?;
        let persisted = self.recorder.load().await;
        let pool = CredentialPool::load(specs, &persisted, self.limits, self.clock.now_millis())?;
        Ok(pool)
    }

    /// One line per credential: usage against limits, health, eligibility.
    pub async fn list(&self, out: &mut impl Write) -> Result<()> {
        let pool = self.open_pool().await?;
        let statuses = pool.statuses(self.clock.now_millis()).await;
        writeln!(out, "{} key(s)", statuses.len())?;
        for status in &statuses {
            writeln!(out, "{}", format_status(status))?;
        }
        Ok(())
    }

    pub async fn add(
        &self,
        key: &str,
        alias: Option<String>,
        overrides: LimitOverrides,
        out: &mut impl Write,
    ) -> Result<()> {
        let mut file = KeyFile::load(&self.key_file).await?;
        let shadows_env = file.is_empty()
            && !specs_from_vars(&self.env_prefix, std::env::vars()).is_empty();

        let entry = file.add(Secret::new(key.trim().to_string()), alias, overrides)?;
        let id = key_pool::credential_id(&entry.key);
        writeln!(out, "added {} ({id})", entry.alias)?;
        file.save()
            .await
            .with_context(|| format!("failed to save {}", self.key_file.display()))?;

        if shadows_env {
            writeln!(
                out,
                "note: {} now takes precedence over {}* environment variables",
                self.key_file.display(),
                self.env_prefix
            )?;
        }
        Ok(())
    }

    pub async fn remove(&self, alias: &str, out: &mut impl Write) -> Result<()> {
        let mut file = KeyFile::load(&self.key_file).await?;
        let entry = file.remove(alias)?;
        file.save()
            .await
            .with_context(|| format!("failed to save {}", self.key_file.display()))?;
        writeln!(
            out,
            "removed {} ({})",
            entry.alias,
            key_pool::credential_id(&entry.key)
        )?;
        Ok(())
    }

    /// Re-enable a credential and clear its failure streak.
    pub async fn reset(&self, alias: &str, out: &mut impl Write) -> Result<()> {
        let pool = self.open_pool().await?;
        pool.enable(alias).await?;
        self.recorder.persist(&pool).await?;
        writeln!(out, "reset {alias}")?;
        Ok(())
    }

    /// Probe each credential (or only `alias`). Auth failures disable the
    /// credential, passing probes re-enable it. Fails when any probe was
    /// rejected.
    pub async fn test(
        &self,
        transport: &dyn Transport,
        alias: Option<&str>,
        out: &mut impl Write,
    ) -> Result<()> {
        let pool = self.open_pool().await?;
        let statuses = pool.statuses(self.clock.now_millis()).await;
        let targets: Vec<&CredentialStatus> = match alias {
            Some(alias) => {
                let found: Vec<_> = statuses
                    .iter()
                    .filter(|s| s.alias == alias || s.id == alias)
                    .collect();
                if found.is_empty() {
                    bail!("credential not found: {alias}");
                }
                found
            }
            None => statuses.iter().collect(),
        };

        let mut rejected = 0usize;
        for status in targets {
            let (id, secret) = pool.secret(&status.id).await?;
            let verdict = match transport.probe(&secret).await {
                Outcome::Success(_) => {
                    if !status.enabled {
                        pool.enable(&id).await?;
                    }
                    "ok".to_string()
                }
                Outcome::AuthFailure(reason) => {
                    rejected += 1;
                    pool.disable(&id, &reason).await?;
                    format!("invalid: {reason}")
                }
                Outcome::RateLimited { message, .. } => format!("valid, rate limited: {message}"),
                Outcome::Transient(reason) => format!("unreachable: {reason}"),
                Outcome::PermanentContent(reason) => format!("error: {reason}"),
            };
            writeln!(out, "{:<16} {id}  {verdict}", status.alias)?;
        }
        self.recorder.persist(&pool).await?;

        if rejected > 0 {
            bail!("{rejected} key(s) rejected");
        }
        Ok(())
    }

    /// Aggregate totals plus per-key counters.
    pub async fn stats(&self, out: &mut impl Write) -> Result<()> {
        let persisted = self.recorder.load().await;
        let pool = self.open_pool().await?;
        let current = StatsFile::new(persisted.run_id.clone(), pool.snapshot().await);
        let totals = current.totals;

        let updated = persisted
            .last_updated
            .map(|t: DateTime<Utc>| t.to_rfc3339())
            .unwrap_or_else(|| "never".into());
        writeln!(
            out,
            "stats file {} (last updated {updated}, run {})",
            self.recorder.path().display(),
            persisted.run_id.as_deref().unwrap_or("-")
        )?;
        writeln!(
            out,
            "requests {}  success {}  failure {}  rate-limit hits {}",
            totals.requests, totals.success, totals.failure, totals.rate_limit_hits
        )?;
        for status in pool.statuses(self.clock.now_millis()).await {
            writeln!(out, "{}", format_status(&status))?;
            if let Some(error) = &status.last_error {
                writeln!(out, "    last error: {error}")?;
            }
        }
        Ok(())
    }
}

fn format_status(status: &CredentialStatus) -> String {
    let state = if !status.enabled {
        format!(
            "disabled ({})",
            status.disabled_reason.as_deref().unwrap_or("unknown")
        )
    } else if status.eligible {
        "eligible".to_string()
    } else {
        "rate limited".to_string()
    };
    format!(
        "{:<16} {}  minute {}/{}  day {}/{}  ok {} fail {} 429 {}  success {:.1}%  {state}",
        status.alias,
        status.id,
        status.requests_this_minute,
        status.limit_rpm,
        status.requests_today,
        status.limit_rpd,
        status.total_success,
        status.total_failure,
        status.rate_limit_hits,
        status.success_rate * 100.0,
    )
}
