//! Gemini `generateContent` transport
//!
//! Sends the document as base64 inline data alongside an extraction prompt and
//! classifies the response. The key travels in the `x-goog-api-key` header,
//! never in the URL.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::Secret;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::{
    Document, Extraction, Outcome, Transport, TransportError, classify_status, excerpt,
};

/// Header carrying the API key.
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Finish reasons that mean the service refused this content.
const BLOCKED_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
];

/// Settings for the Gemini transport, built from the `[transport]` config section.
#[derive(Debug, Clone)]
pub struct GeminiSettings {
    /// API base, e.g. `https://generativelanguage.googleapis.com/v1beta`
    pub endpoint: String,
    pub model: String,
    pub timeout: Duration,
    /// Language of the scanned documents, woven into the prompt
    pub language_hint: String,
}

/// Transport that calls the Gemini REST API.
pub struct GeminiTransport {
    client: reqwest::Client,
    settings: GeminiSettings,
    prompt: String,
}

impl GeminiTransport {
    pub fn new(client: reqwest::Client, settings: GeminiSettings) -> Result<Self, TransportError> {
        if !settings.endpoint.starts_with("http://") && !settings.endpoint.starts_with("https://")
        {
            return Err(TransportError::InvalidSettings(format!(
                "endpoint must start with http:// or https://, got: {}",
                settings.endpoint
            )));
        }
        if settings.model.trim().is_empty() {
            return Err(TransportError::InvalidSettings("model must not be empty".into()));
        }
        let prompt = extraction_prompt(&settings.language_hint);
        Ok(Self {
            client,
            settings,
            prompt,
        })
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    fn model_url(&self) -> String {
        format!(
            "{}/models/{}",
            self.settings.endpoint.trim_end_matches('/'),
            self.settings.model
        )
    }

    fn generate_url(&self) -> String {
        format!("{}:generateContent", self.model_url())
    }

    #[instrument(skip_all, fields(document = %document.name, bytes = document.bytes.len()))]
    async fn generate(&self, key: &Secret<String>, document: &Document) -> Outcome {
        let body = serde_json::json!({
            "contents": [{
                "parts": [
                    { "text": self.prompt },
                    {
                        "inlineData": {
                            "mimeType": document.mime_type,
                            "data": STANDARD.encode(&document.bytes),
                        }
                    }
                ]
            }]
        });

        let response = self
            .client
            .post(self.generate_url())
            .header(API_KEY_HEADER, key.expose().as_str())
            .timeout(self.settings.timeout)
            .json(&body)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return classify_send_error(&e),
        };

        let status = response.status().as_u16();
        let text = match response.text().await {
            Ok(t) => t,
            Err(e) => return Outcome::Transient(format!("reading response body: {e}")),
        };

        if (200..300).contains(&status) {
            interpret_generate_response(&text)
        } else {
            debug!(status, "extraction request rejected");
            classify_status(status, &text)
        }
    }

    async fn fetch_model(&self, key: &Secret<String>) -> Outcome {
        let response = self
            .client
            .get(self.model_url())
            .header(API_KEY_HEADER, key.expose().as_str())
            .timeout(self.settings.timeout)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return classify_send_error(&e),
        };
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Outcome::Success(Extraction {
                text: String::new(),
            });
        }
        let body = response.text().await.unwrap_or_default();
        classify_status(status, &body)
    }
}

impl Transport for GeminiTransport {
    fn id(&self) -> &str {
        "gemini"
    }

    fn dispatch<'a>(
        &'a self,
        key: &'a Secret<String>,
        document: &'a Document,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(self.generate(key, document))
    }

    fn probe<'a>(
        &'a self,
        key: &'a Secret<String>,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(self.fetch_model(key))
    }
}

/// Network-level failures are always transient: the request may not even have
/// reached the service.
fn classify_send_error(e: &reqwest::Error) -> Outcome {
    if e.is_timeout() {
        Outcome::Transient(format!("request timed out: {e}"))
    } else if e.is_connect() {
        Outcome::Transient(format!("connection failed: {e}"))
    } else {
        Outcome::Transient(format!("request failed: {e}"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// Turn a 2xx `generateContent` body into an outcome.
///
/// Blocked prompts and refused candidates are PermanentContent; an empty or
/// malformed answer is Transient.
fn interpret_generate_response(body: &str) -> Outcome {
    let parsed: GenerateResponse = match serde_json::from_str(body) {
        Ok(p) => p,
        Err(e) => {
            return Outcome::Transient(format!(
                "undecodable response ({e}): {}",
                excerpt(body, 120)
            ));
        }
    };

    if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
        return Outcome::PermanentContent(format!("prompt blocked: {reason}"));
    }

    let Some(candidate) = parsed.candidates.into_iter().next() else {
        return Outcome::Transient("response contained no candidates".into());
    };

    let text: String = candidate
        .content
        .map(|c| {
            c.parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    let text = text.trim().to_string();

    if text.is_empty() {
        if let Some(reason) = candidate
            .finish_reason
            .as_deref()
            .filter(|r| BLOCKED_FINISH_REASONS.contains(r))
        {
            return Outcome::PermanentContent(format!("candidate refused: {reason}"));
        }
        return Outcome::Transient("empty response".into());
    }

    Outcome::Success(Extraction { text })
}

fn extraction_prompt(language_hint: &str) -> String {
    format!(
        "Extract all text from this scanned {language_hint} document image exactly as written.\n\
         Keep the original script, line breaks, spacing and paragraph structure.\n\
         Do not translate, summarise or correct the text.\n\
         Mark illegible passages as [UNREADABLE].\n\
         Reproduce tables and lists in plain text, preserving their layout.\n\
         Return only the extracted text."
    )
}
