//! Multi-key pool and rate-limited request scheduler
//!
//! Owns a pool of API keys for a rate-limited extraction service, tracks each
//! key's per-minute and per-day usage, picks the key for the next request, and
//! absorbs quota, auth and transient failures without losing the item.
//!
//! Request lifecycle:
//! 1. Scheduler asks the pool for an eligible key, selected by the configured
//!    rotation strategy, and provisionally counts the request against it
//! 2. Inside configured quiet hours → wait for them to end, bounded by the
//!    caller's deadline
//! 3. No key eligible → wait for the earliest window reset (cancellable, bounded
//!    by the caller's deadline) or return `Exhausted`
//! 4. Transport dispatches outside the pool lock and classifies the outcome
//! 5. StatsRecorder applies the outcome to the key and persists a snapshot
//! 6. Auth failure disables the key, a 429 saturates its window, transient
//!    errors back off exponentially; each case retries with a fresh selection

pub mod clock;
pub mod credential;
pub mod error;
pub mod pool;
pub mod quiet;
pub mod scheduler;
pub mod source;
pub mod stats;
pub mod strategy;
pub mod window;

pub use clock::Clock;
pub use credential::{
    Credential, CredentialSpec, CredentialStatus, LimitOverrides, RateLimits, credential_id,
};
pub use error::{Error, Result};
pub use pool::{CredentialPool, Lease};
pub use quiet::QuietHours;
pub use scheduler::{Completion, RequestScheduler, RetryPolicy};
pub use source::{KeyEntry, KeyFile, load_specs, specs_from_vars};
pub use stats::{Attempt, AttemptOutcome, CredentialStats, StatsFile, StatsRecorder, Totals};
pub use strategy::{
    Candidate, LoadBalance, RoundRobin, RotationStrategy, SmartRotate, SmartWeights, StrategyKind,
};
pub use window::RateWindow;
