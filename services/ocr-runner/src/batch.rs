//! Batch driver: every pending image in a directory through the scheduler
//!
//! Workers pull paths from one shared queue and submit them in order. A
//! success writes `<stem>.txt` plus `<stem>.key_meta.json`; item failures are
//! counted and the batch moves on. Exhaustion cancels the batch token so every
//! worker stops, and the report carries the time the pool next has capacity.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use key_pool::{Clock, Completion, CredentialStatus, Error as PoolError, RequestScheduler};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use transport::{Document, mime_for_extension};

use crate::config::Config;
use crate::metrics;

pub const REPORT_FILE: &str = "processing_report.json";

/// Batch inputs derived from the config.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub image_dir: PathBuf,
    pub annotation_dir: PathBuf,
    pub extensions: Vec<String>,
    pub max_image_bytes: u64,
    pub skip_existing: bool,
    pub workers: usize,
    pub request_delay: Duration,
    pub max_wait: Duration,
    pub report_every: usize,
    pub model: String,
    pub requests_per_minute: u32,
    pub requests_per_day: u32,
}

impl BatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            image_dir: config.input.image_dir.clone(),
            annotation_dir: config.input.annotation_dir.clone(),
            extensions: config
                .input
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            max_image_bytes: config.max_image_bytes(),
            skip_existing: config.input.skip_existing,
            workers: config.batch.workers,
            request_delay: Duration::from_millis(config.batch.request_delay_ms),
            max_wait: Duration::from_secs(config.batch.max_wait_secs),
            report_every: config.batch.report_every,
            model: config.transport.model.clone(),
            requests_per_minute: config.limits.requests_per_minute,
            requests_per_day: config.limits.requests_per_day,
        }
    }
}

/// Why the batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    Exhausted,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub item: String,
    pub reason: String,
}

/// Settings echoed into the report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportConfig {
    pub model: String,
    pub rpm: u32,
    pub rpd: u32,
    pub rotation_strategy: String,
    pub request_delay_ms: u64,
    pub workers: usize,
}

/// Written to `processing_report.json` when the batch ends.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: String,
    pub stop_reason: StopReason,
    /// Earliest time the pool has capacity again, when exhausted
    pub retry_at: Option<DateTime<Utc>>,
    pub total_images: usize,
    pub skipped_existing: usize,
    pub processed: usize,
    pub failed: usize,
    pub remaining: usize,
    pub success_rate: f64,
    pub keys_used: Vec<String>,
    pub total_keys_available: usize,
    pub total_processing_time_seconds: f64,
    pub average_processing_time: f64,
    pub rate_limit_hits: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub images_per_hour: f64,
    pub failures: Vec<ItemFailure>,
    pub config: ReportConfig,
    pub api_key_stats: Vec<CredentialStatus>,
}

impl BatchReport {
    /// 0 when nothing failed, 1 otherwise, 2 when stopped by exhaustion.
    pub fn exit_code(&self) -> u8 {
        match self.stop_reason {
            StopReason::Exhausted => 2,
            _ if self.failed > 0 => 1,
            _ => 0,
        }
    }
}

/// Per-item annotation metadata.
#[derive(Debug, Serialize)]
struct KeyMeta<'a> {
    api_key_alias: &'a str,
    processing_time_seconds: f64,
    model_used: &'a str,
    processing_date: String,
}

enum Stop {
    Exhausted(Option<u64>),
    Cancelled,
}

enum ItemResult {
    Done(Completion),
    Failed(String),
    Stopped(Stop),
}

#[derive(Default)]
struct Tally {
    processed: usize,
    failed: usize,
    finished: usize,
    keys_used: BTreeSet<String>,
    processing_secs: f64,
    failures: Vec<ItemFailure>,
    stop: Option<Stop>,
}

struct Shared {
    scheduler: Arc<RequestScheduler>,
    settings: BatchSettings,
    queue: Mutex<VecDeque<PathBuf>>,
    tally: Mutex<Tally>,
    stop: CancellationToken,
}

/// Image files in `dir` with one of `extensions` (lowercase, no dot), sorted.
pub async fn list_images(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read image directory {}", dir.display()))?;

    let mut images = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)));
        if matches {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// `<annotation_dir>/<stem>.<suffix>`
fn annotation_path(annotation_dir: &Path, image: &Path, suffix: &str) -> PathBuf {
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    annotation_dir.join(format!("{stem}.{suffix}"))
}

fn millis_to_datetime(millis: u64) -> DateTime<Utc> {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_default()
}

/// Run every pending image through `scheduler`.
///
/// `stop` must be the token the scheduler was built with: cancelling it
/// interrupts waits inside the scheduler as well as the workers.
pub async fn run_batch(
    scheduler: Arc<RequestScheduler>,
    settings: BatchSettings,
    stop: CancellationToken,
    run_id: &str,
) -> Result<BatchReport> {
    let clock = scheduler.clock();
    let started = Instant::now();
    let start_time = millis_to_datetime(clock.now_millis());

    tokio::fs::create_dir_all(&settings.annotation_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create annotation directory {}",
                settings.annotation_dir.display()
            )
        })?;

    let images = list_images(&settings.image_dir, &settings.extensions).await?;
    let total_images = images.len();
    let mut pending = VecDeque::with_capacity(total_images);
    for image in images {
        let annotation = annotation_path(&settings.annotation_dir, &image, "txt");
        if settings.skip_existing && tokio::fs::try_exists(&annotation).await.unwrap_or(false) {
            continue;
        }
        pending.push_back(image);
    }
    let pending_count = pending.len();
    let skipped_existing = total_images - pending_count;
    info!(
        total_images,
        pending = pending_count,
        skipped_existing,
        workers = settings.workers,
        "batch starting"
    );

    let workers = settings.workers.min(pending_count.max(1));
    let shared = Arc::new(Shared {
        scheduler,
        settings,
        queue: Mutex::new(pending),
        tally: Mutex::new(Tally::default()),
        stop,
    });

    let mut tasks = JoinSet::new();
    for worker in 0..workers {
        tasks.spawn(run_worker(worker, Arc::clone(&shared)));
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "batch worker panicked");
        }
    }

    let end_time = millis_to_datetime(clock.now_millis());
    let duration = started.elapsed().as_secs_f64();
    let statuses = shared.scheduler.pool().statuses(clock.now_millis()).await;
    let mut tally = shared.tally.lock().await;

    let (stop_reason, retry_at) = match tally.stop.take() {
        None if shared.stop.is_cancelled() => (StopReason::Cancelled, None),
        None => (StopReason::Completed, None),
        Some(Stop::Exhausted(at)) => (StopReason::Exhausted, at.map(millis_to_datetime)),
        Some(Stop::Cancelled) => (StopReason::Cancelled, None),
    };
    let attempted = tally.processed + tally.failed;
    let settings = &shared.settings;

    let report = BatchReport {
        run_id: run_id.to_string(),
        stop_reason,
        retry_at,
        total_images,
        skipped_existing,
        processed: tally.processed,
        failed: tally.failed,
        remaining: pending_count - attempted,
        success_rate: if attempted > 0 {
            tally.processed as f64 / attempted as f64 * 100.0
        } else {
            0.0
        },
        keys_used: tally.keys_used.iter().cloned().collect(),
        total_keys_available: statuses.len(),
        total_processing_time_seconds: tally.processing_secs,
        average_processing_time: if tally.processed > 0 {
            tally.processing_secs / tally.processed as f64
        } else {
            0.0
        },
        rate_limit_hits: statuses.iter().map(|s| s.rate_limit_hits).sum(),
        start_time,
        end_time,
        duration_seconds: duration,
        images_per_hour: if duration > 0.0 {
            tally.processed as f64 / duration * 3600.0
        } else {
            0.0
        },
        failures: std::mem::take(&mut tally.failures),
        config: ReportConfig {
            model: settings.model.clone(),
            rpm: settings.requests_per_minute,
            rpd: settings.requests_per_day,
            rotation_strategy: shared.scheduler.strategy_name().to_string(),
            request_delay_ms: u64::try_from(settings.request_delay.as_millis()).unwrap_or(u64::MAX),
            workers: settings.workers,
        },
        api_key_stats: statuses,
    };

    let path = settings.annotation_dir.join(REPORT_FILE);
    write_report(&path, &report)
        .await
        .with_context(|| format!("failed to write report {}", path.display()))?;

    info!(
        processed = report.processed,
        failed = report.failed,
        remaining = report.remaining,
        stop_reason = ?report.stop_reason,
        retry_at = ?report.retry_at,
        duration_secs = report.duration_seconds,
        "batch finished"
    );
    Ok(report)
}

async fn write_report(path: &Path, report: &BatchReport) -> common::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

async fn run_worker(worker: usize, shared: Arc<Shared>) {
    let clock = shared.scheduler.clock();
    loop {
        if shared.stop.is_cancelled() {
            break;
        }
        let Some(path) = shared.queue.lock().await.pop_front() else {
            break;
        };
        let item = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let result = process_item(&shared, &path, &item, clock).await;

        let mut tally = shared.tally.lock().await;
        match result {
            ItemResult::Done(completion) => {
                let secs = completion.elapsed.as_secs_f64();
                info!(
                    worker,
                    item = %item,
                    alias = %completion.alias,
                    dispatches = completion.dispatches,
                    elapsed_ms = completion.elapsed.as_millis() as u64,
                    "item processed"
                );
                metrics::record_item("success", secs);
                tally.processed += 1;
                tally.processing_secs += secs;
                tally.keys_used.insert(completion.alias);
            }
            ItemResult::Failed(reason) => {
                warn!(worker, item = %item, reason = %reason, "item failed");
                tally.failed += 1;
                tally.failures.push(ItemFailure { item, reason });
            }
            ItemResult::Stopped(stop) => {
                if let Stop::Exhausted(retry_at) = &stop {
                    warn!(
                        worker,
                        item = %item,
                        retry_at = ?retry_at.map(millis_to_datetime),
                        "credentials exhausted, stopping batch"
                    );
                    shared.stop.cancel();
                }
                // Exhaustion wins over the cancellations it causes
                if tally.stop.is_none() {
                    tally.stop = Some(stop);
                }
                break;
            }
        }

        tally.finished += 1;
        if tally.finished % shared.settings.report_every == 0 {
            let (processed, failed) = (tally.processed, tally.failed);
            drop(tally);
            report_progress(&shared, processed, failed, clock).await;
        } else {
            drop(tally);
        }

        if !shared.settings.request_delay.is_zero() {
            tokio::select! {
                _ = shared.stop.cancelled() => break,
                _ = tokio::time::sleep(shared.settings.request_delay) => {}
            }
        }
    }
}

async fn process_item(shared: &Shared, path: &Path, item: &str, clock: Clock) -> ItemResult {
    let settings = &shared.settings;
    let started = Instant::now();

    let size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) => return failed("failed", started, format!("reading metadata: {e}")),
    };
    if size > settings.max_image_bytes {
        return failed(
            "too_large",
            started,
            format!("image is {size} bytes, limit is {}", settings.max_image_bytes),
        );
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let Some(mime) = mime_for_extension(extension) else {
        return failed("failed", started, format!("unsupported image type: {extension}"));
    };
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) => return failed("failed", started, format!("reading image: {e}")),
    };
    let document = Document::new(item, mime, bytes);

    let max_wait = u64::try_from(settings.max_wait.as_millis()).unwrap_or(u64::MAX);
    let deadline = clock.now_millis().saturating_add(max_wait);

    let completion = match shared.scheduler.submit(&document, Some(deadline)).await {
        Ok(c) => c,
        Err(PoolError::Exhausted { retry_at }) => {
            metrics::record_item("exhausted", started.elapsed().as_secs_f64());
            return ItemResult::Stopped(Stop::Exhausted(retry_at));
        }
        Err(PoolError::Cancelled) => return ItemResult::Stopped(Stop::Cancelled),
        Err(e) => {
            let status = match e {
                PoolError::PermanentContent { .. } => "permanent_content",
                _ => "failed",
            };
            return failed(status, started, e.to_string());
        }
    };

    if let Err(e) = write_annotation(settings, path, &completion, clock).await {
        return failed("failed", started, format!("writing annotation: {e:#}"));
    }
    ItemResult::Done(completion)
}

/// Every failed item is counted under `status`, whichever step rejected it.
fn failed(status: &str, started: Instant, reason: String) -> ItemResult {
    metrics::record_item(status, started.elapsed().as_secs_f64());
    ItemResult::Failed(reason)
}

async fn write_annotation(
    settings: &BatchSettings,
    image: &Path,
    completion: &Completion,
    clock: Clock,
) -> Result<()> {
    let text_path = annotation_path(&settings.annotation_dir, image, "txt");
    tokio::fs::write(&text_path, &completion.text)
        .await
        .with_context(|| format!("writing {}", text_path.display()))?;

    let meta = KeyMeta {
        api_key_alias: &completion.alias,
        processing_time_seconds: completion.elapsed.as_secs_f64(),
        model_used: &settings.model,
        processing_date: millis_to_datetime(clock.now_millis()).to_rfc3339(),
    };
    let meta_path = annotation_path(&settings.annotation_dir, image, "key_meta.json");
    tokio::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)
        .await
        .with_context(|| format!("writing {}", meta_path.display()))?;
    Ok(())
}

async fn report_progress(shared: &Shared, processed: usize, failed: usize, clock: Clock) {
    let queued = shared.queue.lock().await.len();
    let statuses = shared.scheduler.pool().statuses(clock.now_millis()).await;
    let eligible = statuses.iter().filter(|s| s.eligible).count();
    let requests_today: u32 = statuses.iter().map(|s| s.requests_today).sum();
    info!(
        processed,
        failed,
        queued,
        credentials_eligible = eligible,
        credentials_total = statuses.len(),
        requests_today,
        "batch progress"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Secret;
    use key_pool::{
        CredentialPool, CredentialSpec, LimitOverrides, RateLimits, RetryPolicy, RoundRobin,
        StatsFile, StatsRecorder,
    };
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;
    use transport::{Extraction, Outcome, Transport};

    const NOW: u64 = 1_792_232_130_000;

    /// Extracts "text of <name>"; names containing "blocked" are refused and
    /// `rejected` secrets fail authentication.
    #[derive(Default)]
    struct FakeTransport {
        calls: StdMutex<Vec<String>>,
        rejected: Vec<String>,
    }

    impl FakeTransport {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Transport for FakeTransport {
        fn id(&self) -> &str {
            "fake"
        }

        fn dispatch<'a>(
            &'a self,
            key: &'a Secret<String>,
            document: &'a Document,
        ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(document.name.clone());
                if self.rejected.contains(key.expose()) {
                    Outcome::AuthFailure("API key not valid".into())
                } else if document.name.contains("blocked") {
                    Outcome::PermanentContent("blocked: SAFETY".into())
                } else {
                    Outcome::Success(Extraction {
                        text: format!("text of {}", document.name),
                    })
                }
            })
        }

        fn probe<'a>(
            &'a self,
            _key: &'a Secret<String>,
        ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
            Box::pin(async { Outcome::Success(Extraction { text: String::new() }) })
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        settings: BatchSettings,
        transport: Arc<FakeTransport>,
        scheduler: Arc<RequestScheduler>,
        stop: CancellationToken,
    }

    impl Harness {
        fn new(aliases: &[&str], limits: RateLimits, transport: FakeTransport) -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("images")).unwrap();

            let specs = aliases
                .iter()
                .map(|alias| CredentialSpec {
                    secret: Secret::from(format!("secret-{alias}")),
                    alias: alias.to_string(),
                    overrides: LimitOverrides::default(),
                })
                .collect();
            let pool = Arc::new(
                CredentialPool::load(specs, &StatsFile::default(), limits, NOW).unwrap(),
            );
            let recorder = Arc::new(StatsRecorder::new(
                dir.path().join("stats.json"),
                Some("run-test".into()),
            ));
            let transport = Arc::new(transport);
            let stop = CancellationToken::new();
            let scheduler = Arc::new(RequestScheduler::new(
                pool,
                Box::new(RoundRobin::default()),
                transport.clone(),
                recorder,
                RetryPolicy::default(),
                Clock::starting_at(NOW),
                stop.clone(),
            ));

            let mut config = Config::default();
            config.input.image_dir = dir.path().join("images");
            config.input.annotation_dir = dir.path().join("annotations");
            let settings = BatchSettings::from_config(&config);

            Self {
                dir,
                settings,
                transport,
                scheduler,
                stop,
            }
        }

        fn image(&self, name: &str, bytes: usize) {
            std::fs::write(self.dir.path().join("images").join(name), vec![0u8; bytes]).unwrap();
        }

        fn annotations(&self) -> PathBuf {
            self.dir.path().join("annotations")
        }

        async fn run(&self) -> BatchReport {
            run_batch(
                self.scheduler.clone(),
                self.settings.clone(),
                self.stop.clone(),
                "run-test",
            )
            .await
            .unwrap()
        }
    }

    fn limits(rpm: u32, rpd: u32) -> RateLimits {
        RateLimits {
            requests_per_minute: rpm,
            requests_per_day: rpd,
        }
    }

    #[tokio::test]
    async fn list_images_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.PNG", "a.jpg", "c.jpeg", "notes.txt", "d.gif"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.jpg")).unwrap();

        let extensions = vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()];
        let images = list_images(dir.path(), &extensions).await.unwrap();
        let names: Vec<_> = images
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.jpg", "b.PNG", "c.jpeg"]);
    }

    #[tokio::test]
    async fn list_images_missing_dir_is_an_error() {
        let err = list_images(Path::new("/nonexistent/images"), &["jpg".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("image directory"), "got: {err}");
    }

    #[test]
    fn annotation_path_uses_stem() {
        let path = annotation_path(Path::new("out"), Path::new("in/page_01.jpg"), "key_meta.json");
        assert_eq!(path, PathBuf::from("out/page_01.key_meta.json"));
    }

    #[test]
    fn exit_codes() {
        let mut report = BatchReport {
            run_id: "r".into(),
            stop_reason: StopReason::Completed,
            retry_at: None,
            total_images: 2,
            skipped_existing: 0,
            processed: 2,
            failed: 0,
            remaining: 0,
            success_rate: 100.0,
            keys_used: vec![],
            total_keys_available: 1,
            total_processing_time_seconds: 0.0,
            average_processing_time: 0.0,
            rate_limit_hits: 0,
            start_time: DateTime::default(),
            end_time: DateTime::default(),
            duration_seconds: 0.0,
            images_per_hour: 0.0,
            failures: vec![],
            config: ReportConfig {
                model: "m".into(),
                rpm: 5,
                rpd: 20,
                rotation_strategy: "round_robin".into(),
                request_delay_ms: 0,
                workers: 1,
            },
            api_key_stats: vec![],
        };
        assert_eq!(report.exit_code(), 0);
        report.failed = 1;
        assert_eq!(report.exit_code(), 1);
        report.stop_reason = StopReason::Exhausted;
        assert_eq!(report.exit_code(), 2);
        report.stop_reason = StopReason::Cancelled;
        report.failed = 0;
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_annotations_and_report() {
        let h = Harness::new(&["a", "b"], limits(5, 20), FakeTransport::default());
        h.image("p1.jpg", 10);
        h.image("p2.png", 10);

        let report = h.run().await;
        assert_eq!(report.stop_reason, StopReason::Completed);
        assert_eq!(report.total_images, 2);
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.remaining, 0);
        assert_eq!(report.success_rate, 100.0);
        assert_eq!(report.keys_used, ["a", "b"]);
        assert_eq!(report.config.rotation_strategy, "round_robin");
        assert_eq!(report.exit_code(), 0);

        let out = h.annotations();
        assert_eq!(
            std::fs::read_to_string(out.join("p1.txt")).unwrap(),
            "text of p1.jpg"
        );
        let meta: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.join("p2.key_meta.json")).unwrap())
                .unwrap();
        assert_eq!(meta["api_key_alias"], "b");
        assert_eq!(meta["model_used"], "gemini-2.5-flash");
        assert!(meta["processing_date"].as_str().unwrap().starts_with("2026-10-17"));

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.join(REPORT_FILE)).unwrap())
                .unwrap();
        assert_eq!(written["processed"], 2);
        assert_eq!(written["stop_reason"], "completed");
        assert_eq!(written["api_key_stats"].as_array().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn skips_images_with_existing_annotations() {
        let h = Harness::new(&["a"], limits(5, 20), FakeTransport::default());
        h.image("done.jpg", 10);
        h.image("todo.jpg", 10);
        std::fs::create_dir_all(h.annotations()).unwrap();
        std::fs::write(h.annotations().join("done.txt"), "old").unwrap();

        let report = h.run().await;
        assert_eq!(report.skipped_existing, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(h.transport.calls(), ["todo.jpg"]);
        assert_eq!(
            std::fs::read_to_string(h.annotations().join("done.txt")).unwrap(),
            "old"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_image_fails_without_dispatch() {
        let mut h = Harness::new(&["a"], limits(5, 20), FakeTransport::default());
        h.settings.max_image_bytes = 100;
        h.image("big.jpg", 101);
        h.image("small.jpg", 100);

        let report = h.run().await;
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].item, "big.jpg");
        assert!(report.failures[0].reason.contains("limit"));
        assert_eq!(h.transport.calls(), ["small.jpg"]);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_image_counts_as_failed_metric() {
        let recorder = crate::metrics::builder().build_recorder();
        let handle = recorder.handle();
        let _guard = ::metrics::set_default_local_recorder(&recorder);

        let mut h = Harness::new(&["a"], limits(5, 20), FakeTransport::default());
        h.settings.extensions.push("gif".into());
        h.image("scan.gif", 10);
        h.image("scan.jpg", 10);

        let report = h.run().await;
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);
        assert!(report.failures[0].reason.contains("unsupported image type"));
        assert_eq!(h.transport.calls(), ["scan.jpg"]);

        let output = handle.render();
        assert!(
            output.contains(r#"ocr_items_total{status="failed"} 1"#),
            "got: {output}"
        );
        assert!(output.contains(r#"ocr_items_total{status="success"} 1"#));
    }

    #[tokio::test(start_paused = true)]
    async fn refused_content_is_counted_and_batch_continues() {
        let h = Harness::new(&["a"], limits(5, 20), FakeTransport::default());
        h.image("1_blocked.jpg", 10);
        h.image("2_fine.jpg", 10);

        let report = h.run().await;
        assert_eq!(report.stop_reason, StopReason::Completed);
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);
        assert!(!h.annotations().join("1_blocked.txt").exists());
        assert!(h.annotations().join("2_fine.txt").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn daily_exhaustion_stops_the_batch() {
        let h = Harness::new(&["a"], limits(5, 1), FakeTransport::default());
        for name in ["1.jpg", "2.jpg", "3.jpg"] {
            h.image(name, 10);
        }

        let report = h.run().await;
        assert_eq!(report.stop_reason, StopReason::Exhausted);
        assert_eq!(report.processed, 1);
        assert_eq!(report.remaining, 2);
        assert_eq!(
            report.retry_at.unwrap().to_rfc3339(),
            "2026-10-18T00:00:00+00:00"
        );
        assert_eq!(report.exit_code(), 2);
        assert!(h.stop.is_cancelled());
        assert_eq!(h.transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn minute_limit_waits_within_max_wait() {
        let mut h = Harness::new(&["a"], limits(1, 20), FakeTransport::default());
        h.settings.max_wait = Duration::from_secs(90);
        h.image("1.jpg", 10);
        h.image("2.jpg", 10);

        let started = Instant::now();
        let report = h.run().await;
        assert_eq!(report.stop_reason, StopReason::Completed);
        assert_eq!(report.processed, 2);
        // Second item waited for the next minute boundary
        assert!(started.elapsed() >= Duration::from_secs(29));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_key_is_disabled_and_skipped() {
        let transport = FakeTransport {
            rejected: vec!["secret-a".into()],
            ..FakeTransport::default()
        };
        let h = Harness::new(&["a", "b"], limits(5, 20), transport);
        h.image("1.jpg", 10);
        h.image("2.jpg", 10);

        let report = h.run().await;
        assert_eq!(report.processed, 2);
        assert_eq!(report.keys_used, ["b"]);
        let a = &report.api_key_stats[0];
        assert!(!a.enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn all_keys_rejected_stops_as_exhausted() {
        let transport = FakeTransport {
            rejected: vec!["secret-a".into()],
            ..FakeTransport::default()
        };
        let h = Harness::new(&["a"], limits(5, 20), transport);
        h.image("1.jpg", 10);

        let report = h.run().await;
        assert_eq!(report.stop_reason, StopReason::Exhausted);
        assert!(report.retry_at.is_none());
        assert_eq!(report.exit_code(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_workers_process_everything() {
        let mut h = Harness::new(&["a", "b", "c"], limits(5, 20), FakeTransport::default());
        h.settings.workers = 3;
        h.settings.request_delay = Duration::from_millis(500);
        for i in 0..9 {
            h.image(&format!("{i}.jpg"), 10);
        }

        let report = h.run().await;
        assert_eq!(report.processed, 9);
        assert_eq!(report.keys_used.len(), 3);
        let mut calls = h.transport.calls();
        calls.sort();
        calls.dedup();
        assert_eq!(calls.len(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_batch_leaves_items_remaining() {
        let h = Harness::new(&["a"], limits(5, 20), FakeTransport::default());
        h.image("1.jpg", 10);
        h.image("2.jpg", 10);
        h.stop.cancel();

        let report = h.run().await;
        assert_eq!(report.stop_reason, StopReason::Cancelled);
        assert_eq!(report.processed, 0);
        assert_eq!(report.remaining, 2);
        assert_eq!(report.exit_code(), 0);
        assert!(h.transport.calls().is_empty());
    }
}
