//! Transport abstraction for the text-extraction service
//!
//! Defines the `Transport` capability that the request scheduler dispatches
//! through. The scheduler never sees the wire protocol: it hands over a key and
//! a document and receives an `Outcome` that tells it whether to commit, rotate,
//! back off, or give up on the item.

pub mod classify;
pub mod gemini;

pub use classify::{classify_429, classify_status};
pub use gemini::{GeminiSettings, GeminiTransport};

use common::Secret;
use std::future::Future;
use std::pin::Pin;

/// Which rate window the service reported as exhausted on a 429.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    /// Per-minute limit, clears at the next minute boundary
    Minute,
    /// Per-day limit, clears at the next day boundary
    Day,
}

/// Text returned by a successful extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub text: String,
}

/// Classified result of one dispatch.
///
/// - Success commits usage and returns the text to the caller
/// - AuthFailure disables the key and rotates
/// - RateLimited forces the key's window to its cap and rotates
/// - Transient backs off and retries
/// - PermanentContent fails the item without retry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(Extraction),
    AuthFailure(String),
    RateLimited { scope: QuotaScope, message: String },
    Transient(String),
    PermanentContent(String),
}

impl Outcome {
    /// Label for metrics and structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::AuthFailure(_) => "auth_failure",
            Outcome::RateLimited { .. } => "rate_limited",
            Outcome::Transient(_) => "transient",
            Outcome::PermanentContent(_) => "permanent_content",
        }
    }
}

/// A single item submitted for extraction.
#[derive(Debug, Clone)]
pub struct Document {
    /// Stable identifier for logs and stats (usually the file name)
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl Document {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }
}

/// MIME type for a supported image extension (case-insensitive).
pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}

/// Errors constructing a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid transport settings: {0}")]
    InvalidSettings(String),
}

/// Abstraction over the external extraction service.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    /// Identifier for logging (e.g. "gemini")
    fn id(&self) -> &str;

    /// Submit `document` authenticated with `key` and classify the result.
    fn dispatch<'a>(
        &'a self,
        key: &'a Secret<String>,
        document: &'a Document,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>>;

    /// Cheap validity check for `key` that consumes no extraction quota.
    /// A passing probe returns `Outcome::Success` with empty text.
    fn probe<'a>(
        &'a self,
        key: &'a Secret<String>,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>>;
}

/// First `max` characters of `body`, for error messages.
pub(crate) fn excerpt(body: &str, max: usize) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= max {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max).collect();
    out.push_str("...");
    out
}
