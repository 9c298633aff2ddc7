//! Usage statistics persistence
//!
//! The stats file is a small transactional store: each record applies one
//! attempt to the pool and writes the whole snapshot via temp file + rename,
//! serialized by a single write lock so snapshots land on disk in order.
//! Loading is best-effort; a missing or corrupt file starts from zero.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use transport::{Outcome, QuotaScope};

use crate::error::{Error, Result};
use crate::pool::{CredentialPool, Lease};

/// Effect of one dispatch on the credential that served it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    AuthFailure(String),
    RateLimited(QuotaScope),
    Transient(String),
    PermanentContent(String),
}

impl From<&Outcome> for AttemptOutcome {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Success(_) => AttemptOutcome::Success,
            Outcome::AuthFailure(m) => AttemptOutcome::AuthFailure(m.clone()),
            Outcome::RateLimited { scope, .. } => AttemptOutcome::RateLimited(*scope),
            Outcome::Transient(m) => AttemptOutcome::Transient(m.clone()),
            Outcome::PermanentContent(m) => AttemptOutcome::PermanentContent(m.clone()),
        }
    }
}

/// One dispatch, discarded after it has been applied and persisted.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub item: String,
    pub credential_id: String,
    pub outcome: AttemptOutcome,
    /// Unix milliseconds when the outcome was observed
    pub at: u64,
    /// Zero-based dispatch index for this item
    pub retry: u32,
    /// Windows that received the provisional increment
    pub minute_window: u64,
    pub day_window: u64,
}

impl Attempt {
    pub fn from_lease(
        lease: &Lease,
        item: impl Into<String>,
        outcome: AttemptOutcome,
        at: u64,
        retry: u32,
    ) -> Self {
        Self {
            item: item.into(),
            credential_id: lease.id.clone(),
            outcome,
            at,
            retry,
            minute_window: lease.minute_window,
            day_window: lease.day_window,
        }
    }
}

/// Persisted counters for one credential.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CredentialStats {
    pub alias: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub disabled_reason: Option<String>,
    pub requests_this_minute: u32,
    pub minute_window_start: u64,
    pub requests_today: u32,
    pub day_window_start: u64,
    pub total_success: u64,
    pub total_failure: u64,
    pub rate_limit_hits: u64,
    pub consecutive_failures: u32,
    pub last_used_at: Option<u64>,
    pub last_error: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Aggregates over all credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Totals {
    pub requests: u64,
    pub success: u64,
    pub failure: u64,
    pub rate_limit_hits: u64,
}

impl Totals {
    pub fn from_credentials<'a>(stats: impl IntoIterator<Item = &'a CredentialStats>) -> Self {
        stats.into_iter().fold(Totals::default(), |mut t, s| {
            t.success += s.total_success;
            t.failure += s.total_failure;
            t.rate_limit_hits += s.rate_limit_hits;
            t.requests += s.total_success + s.total_failure + s.rate_limit_hits;
            t
        })
    }
}

/// On-disk stats document, keyed by credential id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsFile {
    pub last_updated: Option<DateTime<Utc>>,
    pub run_id: Option<String>,
    pub totals: Totals,
    pub credentials: BTreeMap<String, CredentialStats>,
}

impl StatsFile {
    pub fn new(run_id: Option<String>, credentials: BTreeMap<String, CredentialStats>) -> Self {
        Self {
            last_updated: Some(Utc::now()),
            run_id,
            totals: Totals::from_credentials(credentials.values()),
            credentials,
        }
    }
}

/// Serialized writer for the stats file.
pub struct StatsRecorder {
    path: PathBuf,
    run_id: Option<String>,
    write_lock: Mutex<()>,
}

impl StatsRecorder {
    pub fn new(path: PathBuf, run_id: Option<String>) -> Self {
        Self {
            path,
            run_id,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted snapshot. Missing or unreadable files yield an empty
    /// snapshot; prior history never blocks a run.
    pub async fn load(&self) -> StatsFile {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "stats file not found, starting from zero");
                return StatsFile::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "stats file unreadable, starting from zero");
                return StatsFile::default();
            }
        };
        match serde_json::from_str::<StatsFile>(&contents) {
            Ok(stats) => {
                info!(path = %self.path.display(), credentials = stats.credentials.len(), "loaded stats");
                stats
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "stats file corrupt, starting from zero");
                StatsFile::default()
            }
        }
    }

    /// Apply `attempt` to the pool and persist the resulting snapshot.
    pub async fn record(&self, pool: &CredentialPool, attempt: &Attempt) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        pool.apply(attempt).await?;
        let snapshot = StatsFile::new(self.run_id.clone(), pool.snapshot().await);
        write_json_atomic(&self.path, &snapshot).await
    }

    /// Persist the pool as it stands (admin changes, shutdown).
    pub async fn persist(&self, pool: &CredentialPool) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = StatsFile::new(self.run_id.clone(), pool.snapshot().await);
        write_json_atomic(&self.path, &snapshot).await
    }
}

/// Write `value` as pretty JSON atomically.
///
/// Writes to a temporary file in the same directory, restricts it to 0600,
/// then renames it over the target.
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Parse(format!("serializing {}: {e}", path.display())))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io(format!("{} has no parent directory", path.display())))?;
    let name = path
        .file_name()
        .ok_or_else(|| Error::Io(format!("{} has no file name", path.display())))?;
    let tmp_path = dir.join(format!(
        ".{}.tmp.{}",
        name.to_string_lossy(),
        std::process::id()
    ));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing {}: {e}", tmp_path.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting permissions on {}: {e}", tmp_path.display())))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming into {}: {e}", path.display())))?;

    debug!(path = %path.display(), "persisted");
    Ok(())
}
