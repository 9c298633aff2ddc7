//! Outcome classification for extraction service responses
//!
//! Maps HTTP status and error body to the scheduler's outcome classes. The
//! service reports invalid keys as 400 with an `API_KEY_INVALID` reason, so the
//! body has to be inspected as well as the status.

use crate::{Outcome, QuotaScope, excerpt};

/// Body fragments that mark a rejected or expired API key.
const AUTH_PATTERNS: &[&str] = &[
    "api_key_invalid",
    "api key not valid",
    "api key expired",
    "api_key_expired",
];

/// Body fragments that mark a daily quota (rather than per-minute) 429.
const DAY_QUOTA_PATTERNS: &[&str] = &["perday", "per day", "per_day", "daily"];

/// Maximum characters of the upstream body carried into an outcome message.
const MESSAGE_LIMIT: usize = 200;

/// Classify a 429 body as a per-minute or per-day exhaustion.
///
/// Quota ids such as `GenerateRequestsPerDayPerProjectPerModel` identify the
/// daily window; anything else is treated as the minute window.
pub fn classify_429(body: &str) -> QuotaScope {
    let lower = body.to_lowercase();
    if DAY_QUOTA_PATTERNS.iter().any(|p| lower.contains(p)) {
        QuotaScope::Day
    } else {
        QuotaScope::Minute
    }
}

/// Classify a non-success HTTP response.
///
/// 401/403 and key-rejection 400s are AuthFailure, 429 is RateLimited, 408/5xx
/// are Transient, remaining 4xx are PermanentContent (the request itself is bad).
pub fn classify_status(status: u16, body: &str) -> Outcome {
    let message = format!("status {status}: {}", excerpt(body, MESSAGE_LIMIT));
    match status {
        429 => Outcome::RateLimited {
            scope: classify_429(body),
            message,
        },
        401 | 403 => Outcome::AuthFailure(message),
        400 if mentions_rejected_key(body) => Outcome::AuthFailure(message),
        408 => Outcome::Transient(message),
        500..=599 => Outcome::Transient(message),
        400..=499 => Outcome::PermanentContent(message),
        _ => Outcome::Transient(message),
    }
}

fn mentions_rejected_key(body: &str) -> bool {
    let lower = body.to_lowercase();
    AUTH_PATTERNS.iter().any(|p| lower.contains(p))
}
