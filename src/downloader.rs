//! Multi-connection HTTP download engine.
//!
//! The segmented engine plans contiguous byte-range chunks, drives a pool
//! of parallel range workers writing to per-chunk part files, watches for
//! server-side degradation, and assembles the parts into the final
//! artifact with size and checksum verification. When the server turns
//! out not to cooperate with ranges, the single-stream engine takes over.

use crate::control::{self, ControlHandle, ControlRx};
use crate::error::{classify_reqwest, DownloadError};
use crate::options::{DownloadOptions, DownloadRequest, SourceKind};
use crate::probe::{self, ProbeResult};
use crate::status::{DownloadStatus, Reporter, StatusEvent, StatusRecord, VerifyStatus};
use crate::store::{HttpResumeRecord, StateStore};
use crate::verify;
use futures::StreamExt;
use reqwest::Client;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

/// Ceiling on parallel range workers regardless of requested concurrency.
const MAX_CHUNKS: usize = 8;

/// Consecutive read timeouts a worker tolerates before failing its chunk.
const MAX_CONSECUTIVE_READ_TIMEOUTS: u32 = 10;

/// Classified connection failures before the download auto-pauses.
const MAX_CONNECTION_FAILURES: u32 = 10;

/// The failure counter resets after this much quiet time.
const FAILURE_RESET_WINDOW: Duration = Duration::from_secs(30);

/// Minimum interval between status records and resume-record writes.
const EMIT_INTERVAL_MS: u64 = 200;

/// Write buffer per worker.
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Payloads up to this size get sniffed for error-page markers when the
/// response carried no Content-Length.
const ERROR_PAGE_SNIFF_LIMIT: u64 = 16 * 1024;

/// A shared token-bucket rate limiter coordinating the download workers.
///
/// Workers consume from a central pool instead of throttling themselves,
/// so the aggregate rate stays at the limit without bursty traffic.
pub struct SharedRateLimiter {
    limit: u64,
    tokens: AtomicU64,
    last_update: Mutex<Instant>,
}

impl SharedRateLimiter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            tokens: AtomicU64::new(limit),
            last_update: Mutex::new(Instant::now()),
        }
    }

    /// Consume `amount` tokens, sleeping in small increments while the
    /// bucket refills. Acquisition is incremental so one oversized network
    /// read cannot deadlock against the 1-second burst cap.
    pub async fn acquire(&self, amount: u64, control: &ControlRx) {
        if self.limit == 0 {
            return;
        }
        let mut remaining = amount;
        while remaining > 0 {
            if control.check().is_err() {
                return;
            }
            {
                let mut last_update = self.last_update.lock().unwrap();
                let elapsed = last_update.elapsed().as_secs_f64();
                if elapsed >= 0.01 {
                    let refill = (self.limit as f64 * elapsed) as u64;
                    if refill > 0 {
                        let current = self.tokens.load(Ordering::Relaxed);
                        self.tokens
                            .store((current + refill).min(self.limit), Ordering::Relaxed);
                        *last_update = Instant::now();
                    }
                }
            }
            let current = self.tokens.load(Ordering::Relaxed);
            if current > 0 {
                let take = remaining.min(current);
                if self
                    .tokens
                    .compare_exchange(current, current - take, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    remaining -= take;
                    if remaining == 0 {
                        break;
                    }
                }
            }
            if remaining > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// One contiguous byte range, downloaded by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    /// Inclusive start offset.
    pub start: u64,
    /// Inclusive end offset.
    pub end: u64,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Plan the chunk list: `min(concurrency, 8)` chunks of at least
/// `configured_chunk_size` bytes, contiguous and sorted by start; the last
/// chunk may be short.
pub fn plan_chunks(total: u64, concurrency: usize, configured_chunk_size: u64) -> Vec<Chunk> {
    let chunks = concurrency.clamp(1, MAX_CHUNKS) as u64;
    let chunk_size = total.div_ceil(chunks).max(configured_chunk_size.max(1));
    let mut plan = Vec::new();
    let mut start = 0u64;
    while start < total {
        let end = (start + chunk_size - 1).min(total - 1);
        plan.push(Chunk {
            index: plan.len(),
            start,
            end,
        });
        start = end + 1;
    }
    plan
}

/// The server's observed willingness to serve concurrent range requests,
/// collapsed from every degradation signal into one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerPosture {
    /// Ranges work; keep the worker pool running.
    Full,
    /// Throttling or rejection statuses observed; fall back after the pool
    /// joins if any chunk failed.
    Degraded,
    /// The server answered 200 to a ranged request.
    ForbidsRanges,
}

impl ServerPosture {
    pub fn escalate(&mut self, to: ServerPosture) {
        if to > *self {
            *self = to;
        }
    }
}

/// Hidden directory holding part files and the merged temp file.
pub fn temp_dir_for(output: &Path) -> PathBuf {
    let basename = output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    let parent = output.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".accelara-temp-{basename}"))
}

pub fn part_file_path(temp_dir: &Path, output: &Path, chunk: &Chunk) -> PathBuf {
    let basename = output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    temp_dir.join(format!("{basename}.part.{}.{}", chunk.start, chunk.end))
}

/// Heuristic check for servers that answer 200 with an HTML or JSON error
/// document instead of the file.
pub fn looks_like_error_page(head: &[u8]) -> bool {
    let head = &head[..head.len().min(512)];
    let text = String::from_utf8_lossy(head).to_ascii_lowercase();
    let trimmed = text.trim_start();
    trimmed.contains("<html")
        || trimmed.starts_with("<!doctype")
        || trimmed.starts_with("{\"error")
        || trimmed.starts_with("{ \"error")
}

/// Sliding-window connection-failure tracker.
#[derive(Debug, Default)]
pub struct FailureTracker {
    count: u32,
    last_at: Option<Instant>,
}

impl FailureTracker {
    /// Record one classified failure at `now`. Returns the new count and the
    /// backoff to sleep before the next attempt.
    pub fn record(&mut self, now: Instant) -> (u32, Duration) {
        if let Some(last) = self.last_at {
            if now.duration_since(last) >= FAILURE_RESET_WINDOW {
                self.count = 0;
            }
        }
        self.count += 1;
        self.last_at = Some(now);
        let backoff = Duration::from_secs(2u64.pow(self.count.saturating_sub(1)).min(30));
        (self.count, backoff)
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Everything the workers share, behind a single lock.
struct EngineState {
    total: u64,
    chunk_progress: Vec<u64>,
    downloaded: u64,
    /// Speed tracker: aggregate delta across the whole download.
    last_downloaded: u64,
    last_reported_at: Instant,
    speed: u64,
    posture: ServerPosture,
    failed_chunks: usize,
    failures: FailureTracker,
    /// True once any byte has been written; commits the chunk plan.
    committed: bool,
    /// Last 20 non-terminal error messages, newest last.
    messages: VecDeque<String>,
}

impl EngineState {
    fn push_message(&mut self, message: String) {
        if self.messages.len() == 20 {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    fn progress(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.downloaded as f64 / self.total as f64).clamp(0.0, 1.0)
        }
    }
}

struct Shared {
    state: Mutex<EngineState>,
    started: Instant,
    last_emit_ms: AtomicU64,
}

impl Shared {
    fn with_state<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

/// Outcome a chunk worker hands back to the pool.
enum ChunkOutcome {
    Done,
    /// The remote announced a different total before any byte was written;
    /// adopt it and rebuild the plan.
    Replan(u64),
}

/// Multi-connection HTTP download engine (see module docs).
pub struct HttpEngine {
    id: String,
    url: String,
    output: PathBuf,
    opts: DownloadOptions,
    client: Client,
    reporter: Arc<Reporter>,
    store: Option<StateStore>,
    limiter: Option<Arc<SharedRateLimiter>>,
}

impl HttpEngine {
    pub fn new(
        request: &DownloadRequest,
        reporter: Arc<Reporter>,
        store: Option<StateStore>,
    ) -> Result<Self, DownloadError> {
        let client = probe::build_client(&request.options)?;
        let limiter = if request.options.limit > 0 {
            Some(Arc::new(SharedRateLimiter::new(request.options.limit)))
        } else {
            None
        };
        Ok(Self {
            id: request.id.clone(),
            url: request.source.clone(),
            output: request.output.clone(),
            opts: request.options.clone(),
            client,
            reporter,
            store,
            limiter,
        })
    }

    /// Run the download to completion, pause, or failure.
    pub async fn run(&mut self, control: ControlRx) -> Result<(), DownloadError> {
        let result = self.run_inner(control).await;
        if let Err(DownloadError::Paused(reason)) = &result {
            // Resume state was persisted by the ticks; the next run picks up
            // the part files from disk.
            let mut record = self.base_record(DownloadStatus::Paused);
            record.pause_reason = Some(reason.clone());
            self.reporter.report(StatusEvent::Transition(record));
            if let Some(store) = &self.store {
                let metadata = serde_json::json!({
                    "pause_reason": reason,
                    "auto_paused": reason.contains("Paused after"),
                })
                .to_string();
                let _ = store.update_status(&self.id, DownloadStatus::Paused, Some(&metadata));
            }
        }
        result
    }

    async fn run_inner(&mut self, control: ControlRx) -> Result<(), DownloadError> {
        self.transition(DownloadStatus::Initializing, |_| {});

        // Preflight 1: a matching checksum means there is nothing to do,
        // without a single network request.
        if self.output.exists() {
            if let Some(expected) = self.opts.sha256.clone() {
                self.transition(DownloadStatus::Verifying, |r| {
                    r.verify_status = Some(VerifyStatus::CheckingExistingFile);
                });
                self.transition(DownloadStatus::Verifying, |r| {
                    r.verify_status = Some(VerifyStatus::ChecksumVerifying);
                });
                if verify::verify_sha256(&self.output, &expected).await? {
                    let size = std::fs::metadata(&self.output).map(|m| m.len()).unwrap_or(0);
                    let mut record = self.base_record(DownloadStatus::Completed);
                    record.progress = 1.0;
                    record.downloaded = size;
                    record.total = size;
                    record.verify_status = Some(VerifyStatus::ChecksumVerified);
                    record.verified = Some(true);
                    record.sha256 = Some(expected);
                    self.reporter.report(StatusEvent::Transition(record));
                    self.persist_terminal(DownloadStatus::Completed, size);
                    return Ok(());
                }
                tokio::fs::remove_file(&self.output).await.ok();
            }
        }

        self.transition(DownloadStatus::Probing, |_| {});
        let probed = self.probe_with_retry(&control).await?;
        self.url = probed.resolved_url.clone();

        // Preflight 2: without a checksum, an existing file of exactly the
        // right size counts as done.
        if self.output.exists() {
            if probed.total_size > 0 && verify::verify_size(&self.output, probed.total_size)? {
                let mut record = self.base_record(DownloadStatus::Completed);
                record.progress = 1.0;
                record.downloaded = probed.total_size;
                record.total = probed.total_size;
                record.verify_status = Some(VerifyStatus::SizeVerified);
                self.reporter.report(StatusEvent::Transition(record));
                self.persist_terminal(DownloadStatus::Completed, probed.total_size);
                return Ok(());
            }
            tokio::fs::remove_file(&self.output).await?;
        }

        if probed.total_size == 0 || !probed.supports_ranges {
            tracing::debug!(id = %self.id, "single-stream path (no ranges or unknown size)");
            return self.run_single(control, probed.total_size).await;
        }

        self.run_segmented(control, probed.total_size).await
    }

    async fn probe_with_retry(&self, control: &ControlRx) -> Result<ProbeResult, DownloadError> {
        let mut control = control.clone();
        let mut last = None;
        for attempt in 0..=self.opts.retries {
            control.check()?;
            match probe::probe(&self.client, &self.url).await {
                Ok(result) => return Ok(result),
                Err(e @ DownloadError::SourceInvalid(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(id = %self.id, attempt, error = %e, "probe failed");
                    last = Some(e);
                    control
                        .sleep(Duration::from_millis(500 * (attempt as u64 + 1)))
                        .await?;
                }
            }
        }
        Err(last.unwrap_or(DownloadError::Unreachable("probe failed".into())))
    }

    // --- segmented path -------------------------------------------------

    async fn run_segmented(
        &mut self,
        external: ControlRx,
        mut total: u64,
    ) -> Result<(), DownloadError> {
        // Size adoption before the first byte may rebuild the plan once.
        for _ in 0..2 {
            let plan = plan_chunks(total, self.opts.concurrency(), self.opts.chunk_size);
            match self.run_pool(&external, total, &plan).await? {
                Some(new_total) => {
                    tracing::info!(id = %self.id, old = total, new = new_total,
                        "remote announced a different size before any write; replanning");
                    total = new_total;
                }
                None => return Ok(()),
            }
        }
        Err(DownloadError::Integrity(
            "remote size kept changing during planning".to_string(),
        ))
    }

    /// Drive one worker pool over `plan`. Returns `Some(new_total)` when the
    /// plan must be rebuilt, `None` when the download finished.
    async fn run_pool(
        &mut self,
        external: &ControlRx,
        total: u64,
        plan: &[Chunk],
    ) -> Result<Option<u64>, DownloadError> {
        let temp_dir = temp_dir_for(&self.output);
        tokio::fs::create_dir_all(&temp_dir).await?;

        // Restore progress from part files already on disk.
        let mut chunk_progress = vec![0u64; plan.len()];
        for chunk in plan {
            let part = part_file_path(&temp_dir, &self.output, chunk);
            if let Ok(meta) = std::fs::metadata(&part) {
                chunk_progress[chunk.index] = meta.len().min(chunk.len());
            }
        }
        let restored: u64 = chunk_progress.iter().sum();

        let shared = Arc::new(Shared {
            state: Mutex::new(EngineState {
                total,
                chunk_progress,
                downloaded: restored,
                last_downloaded: restored,
                last_reported_at: Instant::now(),
                speed: 0,
                posture: ServerPosture::Full,
                failed_chunks: 0,
                failures: FailureTracker::default(),
                committed: restored > 0,
                messages: VecDeque::new(),
            }),
            started: Instant::now(),
            last_emit_ms: AtomicU64::new(0),
        });

        self.transition(DownloadStatus::Downloading, |r| {
            r.total = total;
            r.downloaded = restored;
            r.progress = if total > 0 {
                restored as f64 / total as f64
            } else {
                0.0
            };
            r.chunk_count = Some(plan.len());
        });

        // Internal control channel: forwards external pause/cancel, and lets
        // the failure handler pause every worker at once.
        let (inner_handle, inner_rx) = control::channel();
        let forwarder = {
            let mut external = external.clone();
            let inner_handle = inner_handle.clone();
            tokio::spawn(async move {
                match external.interrupted().await {
                    DownloadError::Paused(reason) => inner_handle.pause(reason),
                    _ => inner_handle.cancel(),
                }
            })
        };

        let semaphore = Arc::new(Semaphore::new(self.opts.concurrency()));
        let replan = Arc::new(Mutex::new(None::<u64>));
        let mut handles = Vec::with_capacity(plan.len());

        for chunk in plan.iter().copied() {
            let worker = ChunkWorker {
                id: self.id.clone(),
                url: self.url.clone(),
                client: self.client.clone(),
                opts: self.opts.clone(),
                part_path: part_file_path(&temp_dir, &self.output, &chunk),
                chunk,
                chunk_count: plan.len(),
                shared: shared.clone(),
                reporter: self.reporter.clone(),
                store: self.store.clone(),
                resume_template: self.resume_template(total, plan.len()),
                limiter: self.limiter.clone(),
                inner_handle: inner_handle.clone(),
            };
            let semaphore = semaphore.clone();
            let control = inner_rx.clone();
            let replan = replan.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| DownloadError::Cancelled)?;
                match worker.run(control).await {
                    Ok(ChunkOutcome::Done) => Ok(()),
                    Ok(ChunkOutcome::Replan(new_total)) => {
                        *replan.lock().unwrap() = Some(new_total);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }));
        }

        let mut first_error: Option<DownloadError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if prefer_error(&first_error, &e) {
                        first_error = Some(e);
                    }
                }
                Err(join_err) => {
                    first_error
                        .get_or_insert(DownloadError::Io(format!("worker panicked: {join_err}")));
                }
            }
        }
        forwarder.abort();

        if let Some(DownloadError::Paused(_) | DownloadError::Cancelled) = first_error {
            self.persist_resume(&shared, total, plan.len());
            return Err(first_error.unwrap());
        }

        if let Some(new_total) = *replan.lock().unwrap() {
            let committed = shared.with_state(|s| s.committed);
            if !committed {
                return Ok(Some(new_total));
            }
            return Err(DownloadError::Integrity(format!(
                "remote size changed to {new_total} after data was written"
            )));
        }

        let (posture, failed) =
            shared.with_state(|s| (s.posture, s.failed_chunks > 0 || first_error.is_some()));
        if posture > ServerPosture::Full && failed {
            tracing::info!(id = %self.id, ?posture,
                "server degraded under concurrent ranges; falling back to single stream");
            for chunk in plan {
                tokio::fs::remove_file(part_file_path(&temp_dir, &self.output, chunk))
                    .await
                    .ok();
            }
            let mut record = self.base_record(DownloadStatus::Downloading);
            record.total = total;
            record.message =
                Some("Server refused concurrent ranges; retrying with a single connection".into());
            self.reporter.report(StatusEvent::Progress(record));
            return self.run_single(external.clone(), total).await.map(|_| None);
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        self.assemble(&shared, total, plan, &temp_dir).await?;
        self.finish_verified(total, Some(plan.len())).await?;
        Ok(None)
    }

    fn resume_template(&self, total: u64, chunk_count: usize) -> HttpResumeRecord {
        HttpResumeRecord {
            download_id: self.id.clone(),
            source_url: self.url.clone(),
            file_path: self.output.to_string_lossy().to_string(),
            total_size: total,
            chunk_count,
            chunk_progress: Vec::new(),
            sha256: self.opts.sha256.clone(),
            verified_at: None,
        }
    }

    fn persist_resume(&self, shared: &Shared, total: u64, chunk_count: usize) {
        if let Some(store) = &self.store {
            let mut record = self.resume_template(total, chunk_count);
            record.chunk_progress = shared.with_state(|s| s.chunk_progress.clone());
            if let Err(e) = store.save_http_resume(&record) {
                tracing::warn!(id = %self.id, error = %e, "failed to persist resume record");
            }
        }
    }

    fn persist_terminal(&self, status: DownloadStatus, total: u64) {
        if let Some(store) = &self.store {
            let _ = store.update_progress(&self.id, status, 1.0, total, total, 0, None);
            let _ = store.clear_resume(&self.id);
        }
    }

    // --- assembly -------------------------------------------------------

    async fn assemble(
        &self,
        shared: &Shared,
        total: u64,
        plan: &[Chunk],
        temp_dir: &Path,
    ) -> Result<(), DownloadError> {
        // Reconcile: the part files are the ground truth after the join.
        let mut shorts = Vec::new();
        let mut on_disk_total = 0u64;
        for chunk in plan {
            let part = part_file_path(temp_dir, &self.output, chunk);
            let size = std::fs::metadata(&part).map(|m| m.len()).unwrap_or(0);
            shared.with_state(|s| {
                if size > s.chunk_progress[chunk.index] {
                    let delta = size - s.chunk_progress[chunk.index];
                    s.chunk_progress[chunk.index] = size.min(chunk.len());
                    s.downloaded = (s.downloaded + delta).min(s.total);
                }
            });
            on_disk_total += size.min(chunk.len());
            if size < chunk.len() {
                shorts.push(chunk.index);
            }
        }
        if !shorts.is_empty() {
            return Err(DownloadError::Incomplete {
                indices: shorts,
                downloaded: on_disk_total,
                total,
            });
        }

        self.transition(DownloadStatus::Merging, |r| {
            r.total = total;
            r.downloaded = total;
            r.progress = 1.0;
            r.merge_total = Some(plan.len());
        });

        let basename = self
            .output
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());
        let merged_path = temp_dir.join(&basename);
        let mut merged = tokio::fs::File::create(&merged_path).await?;

        for chunk in plan {
            let part = part_file_path(temp_dir, &self.output, chunk);
            let size = std::fs::metadata(&part).map(|m| m.len()).unwrap_or(0);
            if size != chunk.len() {
                return Err(DownloadError::Incomplete {
                    indices: vec![chunk.index],
                    downloaded: size,
                    total,
                });
            }
            let mut reader = tokio::fs::File::open(&part).await?;
            tokio::io::copy(&mut reader, &mut merged).await?;
            tokio::fs::remove_file(&part).await.ok();

            let mut record = self.base_record(DownloadStatus::Merging);
            record.total = total;
            record.downloaded = total;
            record.progress = 1.0;
            record.merge_chunk = Some(chunk.index);
            record.merge_total = Some(plan.len());
            record.merge_progress = Some((chunk.index + 1) as f64 / plan.len() as f64);
            self.reporter.report(StatusEvent::Progress(record));
        }
        merged.flush().await?;
        merged.sync_all().await?;
        drop(merged);

        let merged_size = std::fs::metadata(&merged_path).map(|m| m.len()).unwrap_or(0);
        if merged_size != total {
            return Err(DownloadError::Integrity(format!(
                "assembled file is {merged_size} bytes, expected {total}"
            )));
        }

        self.transition(DownloadStatus::Merging, |r| {
            r.total = total;
            r.downloaded = total;
            r.progress = 1.0;
            r.verify_status = Some(VerifyStatus::ChunksVerified);
        });

        // Same filesystem: the temp dir lives next to the output.
        tokio::fs::rename(&merged_path, &self.output).await?;
        tokio::fs::remove_dir_all(temp_dir).await.ok();
        Ok(())
    }

    /// Post-assembly verification and the terminal completed record.
    async fn finish_verified(
        &self,
        total: u64,
        chunk_count: Option<usize>,
    ) -> Result<(), DownloadError> {
        let mut verify_status = VerifyStatus::SizeVerified;
        let mut verified = None;
        if let Some(expected) = self.opts.sha256.clone() {
            self.transition(DownloadStatus::Verifying, |r| {
                r.total = total;
                r.downloaded = total;
                r.progress = 1.0;
                r.verify_status = Some(VerifyStatus::ChecksumVerifying);
            });
            if !verify::verify_sha256(&self.output, &expected).await? {
                tokio::fs::remove_file(&self.output).await.ok();
                return Err(DownloadError::Integrity("sha256 mismatch".to_string()));
            }
            verify_status = VerifyStatus::ChecksumVerified;
            verified = Some(true);
        }

        let mut record = self.base_record(DownloadStatus::Completed);
        record.total = total;
        record.downloaded = total;
        record.progress = 1.0;
        record.verify_status = Some(verify_status);
        record.verified = verified;
        record.sha256 = self.opts.sha256.clone();
        record.chunk_count = chunk_count;
        self.reporter.report(StatusEvent::Transition(record));
        self.persist_terminal(DownloadStatus::Completed, total);
        Ok(())
    }

    // --- single-stream path ---------------------------------------------

    async fn run_single(
        &mut self,
        control: ControlRx,
        expected_total: u64,
    ) -> Result<(), DownloadError> {
        let mut control = control;
        let temp_dir = temp_dir_for(&self.output);
        tokio::fs::create_dir_all(&temp_dir).await?;
        let basename = self
            .output
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());
        let temp_path = temp_dir.join(&basename);

        self.transition(DownloadStatus::Downloading, |r| {
            r.total = expected_total;
        });

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e))?;
        if !response.status().is_success() {
            return Err(DownloadError::BadStatus(response.status().as_u16()));
        }
        let total = if expected_total > 0 {
            expected_total
        } else {
            response.content_length().unwrap_or(0)
        };

        let file = tokio::fs::File::create(&temp_path).await?;
        let mut writer = tokio::io::BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        let mut stream = response.bytes_stream();

        let read_timeout = self.opts.read_timeout();
        let mut deadline = read_timeout * 2;
        let mut iterations = 0u64;
        let mut consecutive_timeouts = 0u32;
        let mut last_progress_at = Instant::now();
        let mut written = 0u64;
        let mut last_emit = Instant::now() - Duration::from_secs(1);
        let mut speed_anchor = (Instant::now(), 0u64);
        let mut speed = 0u64;

        loop {
            let next = tokio::select! {
                next = tokio::time::timeout(deadline, stream.next()) => next,
                err = control.interrupted() => {
                    writer.flush().await.ok();
                    return Err(err);
                }
            };
            let item = match next {
                Err(_elapsed) => {
                    consecutive_timeouts += 1;
                    if consecutive_timeouts >= MAX_CONSECUTIVE_READ_TIMEOUTS
                        || last_progress_at.elapsed() >= read_timeout * 3
                    {
                        return Err(DownloadError::Timeout(format!(
                            "no data for {:?}",
                            last_progress_at.elapsed()
                        )));
                    }
                    control.sleep(Duration::from_millis(200)).await?;
                    deadline = read_timeout * 3;
                    continue;
                }
                Ok(item) => item,
            };
            let bytes = match item {
                None => break,
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    writer.flush().await.ok();
                    let classified = classify_reqwest(&e);
                    if classified.is_transient() {
                        // No mid-stream resume on the single path: pause with
                        // a reason instead of retrying.
                        return Err(DownloadError::Paused(format!(
                            "Connection lost: {classified}"
                        )));
                    }
                    return Err(classified);
                }
            };

            consecutive_timeouts = 0;
            last_progress_at = Instant::now();
            iterations += 1;
            if iterations % 100 == 0 {
                deadline = read_timeout * 2;
            }

            writer.write_all(&bytes).await?;
            written += bytes.len() as u64;
            if let Some(limiter) = &self.limiter {
                limiter.acquire(bytes.len() as u64, &control).await;
            }

            if last_emit.elapsed().as_millis() as u64 >= EMIT_INTERVAL_MS {
                last_emit = Instant::now();
                let elapsed = speed_anchor.0.elapsed().as_secs_f64();
                if elapsed >= 0.5 {
                    speed = ((written - speed_anchor.1) as f64 / elapsed) as u64;
                    speed_anchor = (Instant::now(), written);
                }
                let progress = if total > 0 {
                    (written as f64 / total as f64).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let mut record = self.base_record(DownloadStatus::Downloading);
                record.total = total;
                record.downloaded = written;
                record.progress = progress;
                record.speed = Some(speed);
                if speed > 0 && total > written {
                    record.eta = Some((total - written) / speed);
                }
                self.reporter.report(StatusEvent::Progress(record));
                if let Some(store) = &self.store {
                    let _ = store.update_progress(
                        &self.id,
                        DownloadStatus::Downloading,
                        progress,
                        written,
                        total,
                        speed,
                        None,
                    );
                }
            }
        }
        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        if total > 0 && written != total {
            return Err(DownloadError::Integrity(format!(
                "stream ended at {written} bytes, expected {total}"
            )));
        }
        if total == 0 && written <= ERROR_PAGE_SNIFF_LIMIT {
            let head = std::fs::read(&temp_path)?;
            if looks_like_error_page(&head) {
                return Err(DownloadError::ErrorPage);
            }
        }

        tokio::fs::rename(&temp_path, &self.output).await?;
        tokio::fs::remove_dir_all(&temp_dir).await.ok();

        let final_total = if total > 0 { total } else { written };
        self.finish_verified(final_total, None).await
    }

    // --- helpers --------------------------------------------------------

    fn base_record(&self, status: DownloadStatus) -> StatusRecord {
        StatusRecord::new(SourceKind::Http, status)
    }

    fn transition(&self, status: DownloadStatus, fill: impl FnOnce(&mut StatusRecord)) {
        let mut record = self.base_record(status);
        fill(&mut record);
        self.reporter.report(StatusEvent::Transition(record));
    }
}

/// Pause and cancel outrank chunk-level failures when picking the error
/// the pool reports.
fn prefer_error(current: &Option<DownloadError>, candidate: &DownloadError) -> bool {
    match (current, candidate) {
        (None, _) => true,
        (Some(DownloadError::Paused(_)), _) => false,
        (Some(DownloadError::Cancelled), DownloadError::Paused(_)) => true,
        (Some(DownloadError::Cancelled), _) => false,
        (Some(_), DownloadError::Paused(_) | DownloadError::Cancelled) => true,
        _ => false,
    }
}

/// State and configuration for one chunk worker.
struct ChunkWorker {
    id: String,
    url: String,
    client: Client,
    opts: DownloadOptions,
    part_path: PathBuf,
    chunk: Chunk,
    chunk_count: usize,
    shared: Arc<Shared>,
    reporter: Arc<Reporter>,
    store: Option<StateStore>,
    resume_template: HttpResumeRecord,
    limiter: Option<Arc<SharedRateLimiter>>,
    inner_handle: ControlHandle,
}

impl ChunkWorker {
    /// Outer retry loop: up to `retries` attempts with linear backoff, a
    /// total client-side safety net per attempt, and the shared
    /// connection-failure handler for transient errors.
    async fn run(&self, mut control: ControlRx) -> Result<ChunkOutcome, DownloadError> {
        let safety_net = self.opts.read_timeout() * 100;
        let mut last = None;
        for attempt in 0..=self.opts.retries {
            control.check()?;
            if attempt > 0 {
                control
                    .sleep(Duration::from_millis(500 * (attempt as u64 + 1)))
                    .await?;
            }
            let attempt_control = control.clone();
            let attempt_result = tokio::select! {
                res = tokio::time::timeout(safety_net, self.attempt(&attempt_control)) => match res {
                    Ok(res) => res,
                    Err(_) => Err(DownloadError::Timeout("attempt exceeded safety net".into())),
                },
                err = control.interrupted() => Err(err),
            };
            match attempt_result {
                Ok(outcome) => return Ok(outcome),
                Err(
                    e @ (DownloadError::Paused(_)
                    | DownloadError::Cancelled
                    | DownloadError::Integrity(_)
                    | DownloadError::RangeUnsupported),
                ) => return Err(e),
                Err(e) => {
                    tracing::warn!(id = %self.id, chunk = self.chunk.index, attempt,
                        error = %e, "chunk attempt failed");
                    let message = e.to_string();
                    if e.is_transient() {
                        let (count, backoff) = self.shared.with_state(|s| {
                            let (count, backoff) = s.failures.record(Instant::now());
                            s.push_message(message.clone());
                            let threshold = (self.chunk_count / 2).max(1) as u32;
                            if count >= threshold {
                                s.posture.escalate(ServerPosture::Degraded);
                            }
                            (count, backoff)
                        });
                        if count >= MAX_CONNECTION_FAILURES {
                            let reason = format!(
                                "Connection lost: {message}. Paused after {count} failures."
                            );
                            self.reporter.set_auto_paused();
                            self.inner_handle.pause(reason.clone());
                            return Err(DownloadError::Paused(reason));
                        }
                        control.sleep(backoff).await?;
                    } else {
                        self.shared.with_state(|s| s.push_message(message));
                    }
                    last = Some(e);
                }
            }
        }
        self.shared.with_state(|s| s.failed_chunks += 1);
        Err(last.unwrap_or_else(|| DownloadError::ConnectionLost("chunk retries exhausted".into())))
    }

    async fn attempt(&self, control: &ControlRx) -> Result<ChunkOutcome, DownloadError> {
        let mut control = control.clone();
        let existing = std::fs::metadata(&self.part_path)
            .map(|m| m.len())
            .unwrap_or(0);
        if existing >= self.chunk.len() {
            self.shared.with_state(|s| {
                let tracked = s.chunk_progress[self.chunk.index];
                if tracked < self.chunk.len() {
                    s.downloaded += self.chunk.len() - tracked;
                    s.chunk_progress[self.chunk.index] = self.chunk.len();
                }
            });
            return Ok(ChunkOutcome::Done);
        }
        self.shared.with_state(|s| {
            // Trust the disk: a previous run may have written more than the
            // tracked progress before it stopped.
            let tracked = s.chunk_progress[self.chunk.index];
            if existing != tracked {
                s.downloaded = s.downloaded.saturating_sub(tracked) + existing;
                s.chunk_progress[self.chunk.index] = existing;
            }
        });

        let range_start = self.chunk.start + existing;
        let response = self
            .client
            .get(&self.url)
            .header(
                reqwest::header::RANGE,
                format!("bytes={range_start}-{}", self.chunk.end),
            )
            .send()
            .await
            .map_err(|e| classify_reqwest(&e))?;

        let status = response.status().as_u16();
        match status {
            206 => {}
            200 => {
                // The server ignored the range header entirely.
                self.shared
                    .with_state(|s| s.posture.escalate(ServerPosture::ForbidsRanges));
                return Err(DownloadError::RangeUnsupported);
            }
            s if DownloadError::is_range_hostile_status(s) => {
                self.shared
                    .with_state(|s| s.posture.escalate(ServerPosture::Degraded));
                return Err(DownloadError::BadStatus(s));
            }
            s => return Err(DownloadError::BadStatus(s)),
        }

        // A diverging total on the range response means the remote changed
        // underneath us (commonly a redirect to a different file).
        if let Some(announced) = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(probe::parse_content_range_total)
        {
            enum SizeVerdict {
                Unchanged,
                Adopt(u64),
                Fail(u64),
            }
            let verdict = self.shared.with_state(|s| {
                if announced == s.total {
                    SizeVerdict::Unchanged
                } else if s.committed {
                    SizeVerdict::Fail(s.total)
                } else {
                    SizeVerdict::Adopt(announced)
                }
            });
            match verdict {
                SizeVerdict::Unchanged => {}
                SizeVerdict::Adopt(new_total) => return Ok(ChunkOutcome::Replan(new_total)),
                SizeVerdict::Fail(old) => {
                    return Err(DownloadError::Integrity(format!(
                        "remote size changed from {old} to {announced} mid-download"
                    )))
                }
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.part_path)
            .await?;
        let mut writer = tokio::io::BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        let mut stream = response.bytes_stream();

        let read_timeout = self.opts.read_timeout();
        let mut deadline = read_timeout * 2;
        let mut iterations = 0u64;
        let mut consecutive_timeouts = 0u32;
        let mut last_progress_at = Instant::now();
        let mut local = existing;

        loop {
            let next = tokio::select! {
                next = tokio::time::timeout(deadline, stream.next()) => next,
                err = control.interrupted() => {
                    writer.flush().await.ok();
                    return Err(err);
                }
            };
            let item = match next {
                Err(_elapsed) => {
                    consecutive_timeouts += 1;
                    if consecutive_timeouts >= MAX_CONSECUTIVE_READ_TIMEOUTS
                        || last_progress_at.elapsed() >= read_timeout * 3
                    {
                        writer.flush().await.ok();
                        return Err(DownloadError::Timeout(format!(
                            "chunk {} stalled for {:?}",
                            self.chunk.index,
                            last_progress_at.elapsed()
                        )));
                    }
                    control.sleep(Duration::from_millis(200)).await?;
                    deadline = read_timeout * 3;
                    continue;
                }
                Ok(item) => item,
            };
            let bytes = match item {
                None => break,
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    writer.flush().await.ok();
                    return Err(classify_reqwest(&e));
                }
            };

            consecutive_timeouts = 0;
            last_progress_at = Instant::now();
            iterations += 1;
            if iterations % 100 == 0 {
                deadline = read_timeout * 2;
            }

            writer.write_all(&bytes).await?;
            let len = bytes.len() as u64;
            local += len;
            self.shared.with_state(|s| {
                s.chunk_progress[self.chunk.index] = local.min(self.chunk.len());
                s.downloaded = (s.downloaded + len).min(s.total);
                s.committed = true;
            });
            if let Some(limiter) = &self.limiter {
                limiter.acquire(len, &control).await;
            }
            self.maybe_emit();
        }
        writer.flush().await?;

        if local < self.chunk.len() {
            // Short body on a clean EOF: the connection was cut. The retry
            // picks up from the part file.
            return Err(DownloadError::ConnectionLost(format!(
                "chunk {} ended early at {local} of {} bytes",
                self.chunk.index,
                self.chunk.len()
            )));
        }
        Ok(ChunkOutcome::Done)
    }

    /// Throttled status tick: at most one record per 200 ms across all
    /// workers, with per-chunk snapshots, aggregate speed, and ETA. The
    /// resume record is persisted on the same cadence.
    fn maybe_emit(&self) {
        let now_ms = self.shared.started.elapsed().as_millis() as u64;
        let last = self.shared.last_emit_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < EMIT_INTERVAL_MS {
            return;
        }
        if self
            .shared
            .last_emit_ms
            .compare_exchange(last, now_ms, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let (record, metadata) = self.shared.with_state(|s| {
            let elapsed = s.last_reported_at.elapsed().as_secs_f64();
            if elapsed >= 0.5 {
                let delta = s.downloaded.saturating_sub(s.last_downloaded);
                s.speed = (delta as f64 / elapsed) as u64;
                s.last_downloaded = s.downloaded;
                s.last_reported_at = Instant::now();
            }
            let mut record = StatusRecord::new(SourceKind::Http, DownloadStatus::Downloading);
            record.progress = s.progress();
            record.downloaded = s.downloaded;
            record.total = s.total;
            record.speed = Some(s.speed);
            record.chunk_progress = Some(s.chunk_progress.clone());
            record.chunk_count = Some(s.chunk_progress.len());
            record.message = s.messages.back().cloned();
            if s.speed > 0 && s.total > s.downloaded {
                record.eta = Some((s.total - s.downloaded) / s.speed);
            }
            let metadata = serde_json::json!({ "messages": s.messages }).to_string();
            (record, metadata)
        });

        if let Some(store) = &self.store {
            let mut resume = self.resume_template.clone();
            resume.chunk_progress = record.chunk_progress.clone().unwrap_or_default();
            if let Err(e) = store.save_http_resume(&resume) {
                tracing::warn!(id = %self.id, error = %e, "resume record write failed");
            }
            let _ = store.update_progress(
                &self.id,
                DownloadStatus::Downloading,
                record.progress,
                record.downloaded,
                record.total,
                record.speed.unwrap_or(0),
                Some(&metadata),
            );
        }
        self.reporter.report(StatusEvent::Progress(record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_matches_four_way_split() {
        // 10 MiB at concurrency 4: four chunks of 2,621,440 bytes.
        let plan = plan_chunks(10_485_760, 4, 1024 * 1024);
        assert_eq!(plan.len(), 4);
        for chunk in &plan {
            assert_eq!(chunk.len(), 2_621_440);
        }
        assert_eq!(plan[0].start, 0);
        assert_eq!(plan[3].end, 10_485_759);
    }

    #[test]
    fn plan_partitions_exactly() {
        for (total, concurrency, chunk_size) in [
            (10_485_760u64, 4usize, 1_048_576u64),
            (1_000_003, 8, 65_536),
            (1, 8, 1_048_576),
            (999, 3, 100),
            (4 * 1024 * 1024 + 17, 5, 4 * 1024 * 1024),
        ] {
            let plan = plan_chunks(total, concurrency, chunk_size);
            assert_eq!(plan[0].start, 0);
            assert_eq!(plan.last().unwrap().end, total - 1);
            for pair in plan.windows(2) {
                assert_eq!(pair[0].end + 1, pair[1].start, "chunks must be contiguous");
            }
            let sum: u64 = plan.iter().map(|c| c.len()).sum();
            assert_eq!(sum, total);
        }
    }

    #[test]
    fn plan_respects_configured_chunk_size() {
        // A large configured chunk size wins over the concurrency split.
        let plan = plan_chunks(10_485_760, 4, 4 * 1024 * 1024);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].len(), 4 * 1024 * 1024);
        assert_eq!(plan[2].len(), 10_485_760 - 2 * 4 * 1024 * 1024);
    }

    #[test]
    fn plan_caps_worker_count_at_eight() {
        let plan = plan_chunks(80 * 1024 * 1024, 64, 1);
        assert_eq!(plan.len(), 8);
    }

    #[test]
    fn posture_only_escalates() {
        let mut posture = ServerPosture::Full;
        posture.escalate(ServerPosture::Degraded);
        assert_eq!(posture, ServerPosture::Degraded);
        posture.escalate(ServerPosture::Full);
        assert_eq!(posture, ServerPosture::Degraded);
        posture.escalate(ServerPosture::ForbidsRanges);
        assert_eq!(posture, ServerPosture::ForbidsRanges);
        posture.escalate(ServerPosture::Degraded);
        assert_eq!(posture, ServerPosture::ForbidsRanges);
    }

    #[test]
    fn failure_tracker_backoff_and_window() {
        let mut tracker = FailureTracker::default();
        let t0 = Instant::now();
        let (count, backoff) = tracker.record(t0);
        assert_eq!(count, 1);
        assert_eq!(backoff, Duration::from_secs(1));
        let (count, backoff) = tracker.record(t0 + Duration::from_secs(1));
        assert_eq!(count, 2);
        assert_eq!(backoff, Duration::from_secs(2));
        for i in 3..=9 {
            tracker.record(t0 + Duration::from_secs(i));
        }
        let (count, backoff) = tracker.record(t0 + Duration::from_secs(10));
        assert_eq!(count, 10);
        // 2^9 capped at 30 seconds.
        assert_eq!(backoff, Duration::from_secs(30));
    }

    #[test]
    fn failure_counter_resets_after_quiet_window() {
        let mut tracker = FailureTracker::default();
        let t0 = Instant::now();
        for i in 0..9 {
            tracker.record(t0 + Duration::from_secs(i));
        }
        assert_eq!(tracker.count(), 9);
        // A 31-second idle clears the streak.
        let (count, _) = tracker.record(t0 + Duration::from_secs(8 + 31));
        assert_eq!(count, 1);
    }

    #[test]
    fn error_page_markers() {
        assert!(looks_like_error_page(b"<html><body>403</body></html>"));
        assert!(looks_like_error_page(b"  <!DOCTYPE html><html>"));
        assert!(looks_like_error_page(br#"{"error": "quota exceeded"}"#));
        assert!(!looks_like_error_page(&[0u8, 1, 2, 3, 4]));
        assert!(!looks_like_error_page(b"PK\x03\x04binary zip data"));
        // Only the first 512 bytes count.
        let mut body = vec![b'x'; 600];
        body.extend_from_slice(b"<html>");
        assert!(!looks_like_error_page(&body));
    }

    #[test]
    fn part_file_naming_matches_layout() {
        let output = Path::new("/downloads/movie.mkv");
        let temp = temp_dir_for(output);
        assert_eq!(temp, Path::new("/downloads/.accelara-temp-movie.mkv"));
        let chunk = Chunk {
            index: 1,
            start: 2_621_440,
            end: 5_242_879,
        };
        let part = part_file_path(&temp, output, &chunk);
        assert_eq!(
            part,
            Path::new("/downloads/.accelara-temp-movie.mkv/movie.mkv.part.2621440.5242879")
        );
    }

    #[test]
    fn pool_error_preference() {
        let paused = DownloadError::Paused("p".into());
        let cancelled = DownloadError::Cancelled;
        let lost = DownloadError::ConnectionLost("x".into());
        assert!(prefer_error(&None, &lost));
        assert!(prefer_error(&Some(lost.clone()), &paused));
        assert!(prefer_error(&Some(lost.clone()), &cancelled));
        assert!(!prefer_error(&Some(paused.clone()), &lost));
        assert!(prefer_error(&Some(cancelled.clone()), &paused));
        assert!(!prefer_error(&Some(paused), &cancelled));
    }

    #[tokio::test]
    async fn rate_limiter_paces_acquisition() {
        let limiter = SharedRateLimiter::new(100 * 1024);
        let (_handle, rx) = crate::control::channel();
        let start = Instant::now();
        // Twice the bucket: must wait roughly a second for the refill.
        limiter.acquire(200 * 1024, &rx).await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn rate_limiter_unlimited_is_free() {
        let limiter = SharedRateLimiter::new(0);
        let (_handle, rx) = crate::control::channel();
        let start = Instant::now();
        limiter.acquire(u64::MAX / 2, &rx).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
