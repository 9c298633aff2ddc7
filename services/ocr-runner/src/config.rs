//! Configuration types and loading
//!
//! Config precedence: `--config` flag > `CONFIG_PATH` env var > `ocr-runner.toml`.
//! Every section is optional and falls back to its defaults. API keys never
//! live in this file; they come from the key file or the environment.

use key_pool::{QuietHours, RateLimits, RetryPolicy, SmartWeights, StrategyKind};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use transport::GeminiSettings;

const DEFAULT_CONFIG_PATH: &str = "ocr-runner.toml";

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub input: InputConfig,
    pub keys: KeysConfig,
    pub limits: LimitsConfig,
    pub rotation: RotationConfig,
    pub retry: RetryConfig,
    pub transport: TransportConfig,
    pub batch: BatchConfig,
    pub schedule: ScheduleConfig,
    pub server: Option<ServerConfig>,
}

/// Where images come from and where annotations go
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub image_dir: PathBuf,
    pub annotation_dir: PathBuf,
    /// Matched case-insensitively, without the leading dot
    pub extensions: Vec<String>,
    pub max_image_mb: u64,
    pub skip_existing: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("images"),
            annotation_dir: PathBuf::from("annotations"),
            extensions: vec!["jpg".into(), "jpeg".into(), "png".into()],
            max_image_mb: 10,
            skip_existing: true,
        }
    }
}

/// Credential sources and the stats file
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    pub file: PathBuf,
    pub env_prefix: String,
    pub stats_file: PathBuf,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("api_keys.json"),
            env_prefix: "GEMINI_API_KEY_".into(),
            stats_file: PathBuf::from("api_key_stats.json"),
        }
    }
}

/// Pool-wide per-key limits; individual keys may override them
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub requests_per_minute: u32,
    pub requests_per_day: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 5,
            requests_per_day: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub strategy: StrategyKind,
    pub weights: SmartWeights,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub max_dispatches: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 4_000,
            max_delay_ms: 10_000,
            max_attempts: 3,
            max_dispatches: 24,
        }
    }
}

/// Extraction service settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
    pub language_hint: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".into(),
            model: "gemini-2.5-flash".into(),
            timeout_secs: 120,
            language_hint: "nepali".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub workers: usize,
    /// Pause between consecutive items of one worker
    pub request_delay_ms: u64,
    /// Longest an item may wait for a credential before the batch stops
    pub max_wait_secs: u64,
    pub report_every: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            request_delay_ms: 0,
            max_wait_secs: 90,
            report_every: 5,
        }
    }
}

/// Daily UTC quiet hours during which nothing is dispatched
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub quiet_hours: bool,
    pub quiet_start_hour: u8,
    /// Exclusive; below `quiet_start_hour` the range wraps past midnight
    pub quiet_end_hour: u8,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            quiet_hours: false,
            quiet_start_hour: 0,
            quiet_end_hour: 6,
        }
    }
}

/// Optional `/health` + `/metrics` listener
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_connections() -> usize {
    64
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Load `path`, or fall back to defaults when it is the implicit default
    /// path and does not exist. An explicitly named file must exist.
    pub fn load_or_default(path: &Path, explicit: bool) -> common::Result<Self> {
        if !explicit && !path.exists() {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        Self::load(path)
    }

    pub fn parse(contents: &str) -> common::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.limits.requests_per_minute == 0 {
            return Err(common::Error::config(
                "requests_per_minute must be greater than 0",
            ));
        }
        if self.limits.requests_per_day == 0 {
            return Err(common::Error::config(
                "requests_per_day must be greater than 0",
            ));
        }

        let retry = &self.retry;
        if retry.base_delay_ms == 0 || retry.max_delay_ms == 0 {
            return Err(common::Error::config(
                "retry delays must be greater than 0",
            ));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(common::Error::Config(format!(
                "base_delay_ms ({}) must not exceed max_delay_ms ({})",
                retry.base_delay_ms, retry.max_delay_ms
            )));
        }
        if retry.max_attempts == 0 || retry.max_dispatches == 0 {
            return Err(common::Error::config(
                "max_attempts and max_dispatches must be greater than 0",
            ));
        }

        // Validate endpoint is a URL with http(s) scheme
        if !self.transport.endpoint.starts_with("http://")
            && !self.transport.endpoint.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "endpoint must start with http:// or https://, got: {}",
                self.transport.endpoint
            )));
        }
        if self.transport.model.trim().is_empty() {
            return Err(common::Error::config("model must not be empty"));
        }
        if self.transport.timeout_secs == 0 {
            return Err(common::Error::config(
                "timeout_secs must be greater than 0",
            ));
        }

        if self.batch.workers == 0 {
            return Err(common::Error::config("workers must be greater than 0"));
        }
        if self.batch.report_every == 0 {
            return Err(common::Error::config(
                "report_every must be greater than 0",
            ));
        }
        if self.input.extensions.is_empty() {
            return Err(common::Error::config(
                "at least one image extension is required",
            ));
        }
        if self.input.max_image_mb == 0 {
            return Err(common::Error::config(
                "max_image_mb must be greater than 0",
            ));
        }
        let schedule = &self.schedule;
        if schedule.quiet_hours {
            if schedule.quiet_start_hour > 23 || schedule.quiet_end_hour > 23 {
                return Err(common::Error::config(
                    "quiet_start_hour and quiet_end_hour must be between 0 and 23",
                ));
            }
            if schedule.quiet_start_hour == schedule.quiet_end_hour {
                return Err(common::Error::config(
                    "quiet_start_hour and quiet_end_hour must differ",
                ));
            }
        }
        if let Some(server) = &self.server
            && server.max_connections == 0
        {
            return Err(common::Error::config(
                "max_connections must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    /// The flag reports whether the path was named explicitly.
    pub fn resolve_path(cli_path: Option<&Path>) -> (PathBuf, bool) {
        if let Some(p) = cli_path {
            return (p.to_path_buf(), true);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return (PathBuf::from(p), true);
        }
        (PathBuf::from(DEFAULT_CONFIG_PATH), false)
    }

    pub fn rate_limits(&self) -> RateLimits {
        RateLimits {
            requests_per_minute: self.limits.requests_per_minute,
            requests_per_day: self.limits.requests_per_day,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            max_attempts: self.retry.max_attempts,
            max_dispatches: self.retry.max_dispatches,
        }
    }

    pub fn gemini_settings(&self) -> GeminiSettings {
        GeminiSettings {
            endpoint: self.transport.endpoint.trim_end_matches('/').to_string(),
            model: self.transport.model.clone(),
            timeout: Duration::from_secs(self.transport.timeout_secs),
            language_hint: self.transport.language_hint.clone(),
        }
    }

    /// Quiet hours to hand the scheduler, when enabled.
    pub fn quiet_hours(&self) -> Option<QuietHours> {
        if !self.schedule.quiet_hours {
            return None;
        }
        QuietHours::new(self.schedule.quiet_start_hour, self.schedule.quiet_end_hour).ok()
    }

    pub fn max_image_bytes(&self) -> u64 {
        self.input.max_image_mb.saturating_mul(1024 * 1024)
    }
}
