//! BitTorrent adapter over a `librqbit` session.
//!
//! The underlying engine owns peers, piece scheduling, and hashing; this
//! adapter ingests the source (magnet, `.torrent` URL, or file), waits
//! for metadata, surfaces piece-level state on the status stream, applies
//! rate limits, and manages the seeding lifecycle.

use crate::control::ControlRx;
use crate::error::DownloadError;
use crate::options::{DownloadRequest, SourceKind};
use crate::status::{
    DownloadStatus, FileProgress, Reporter, StatusEvent, StatusRecord, VerifyStatus,
};
use crate::store::{StateStore, TorrentResumeRecord};
use librqbit::limits::LimitsConfig;
use librqbit::{
    AddTorrent, AddTorrentOptions, ManagedTorrent, Session, SessionOptions, TorrentStatsState,
};
use std::collections::{HashSet, VecDeque};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Status emission cadence during metadata, verification, and download.
const TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Resume records are written at least this often.
const RESUME_INTERVAL: Duration = Duration::from_secs(5);

/// Graceful engine shutdown budget before the session is dropped outright.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Moving average of instantaneous rates; zero samples hold the last
/// positive value so the UI does not flap when the transport briefly
/// idles.
#[derive(Debug, Default)]
pub struct SpeedEstimator {
    samples: VecDeque<u64>,
    display: u64,
    last_bytes: u64,
    last_at: Option<Instant>,
}

impl SpeedEstimator {
    /// Feed the cumulative byte counter; returns the smoothed rate.
    pub fn sample(&mut self, cumulative: u64, now: Instant) -> u64 {
        let Some(last_at) = self.last_at else {
            self.last_at = Some(now);
            self.last_bytes = cumulative;
            return self.display;
        };
        let dt = now.duration_since(last_at).as_secs_f64();
        if dt < 0.05 {
            return self.display;
        }
        let delta = cumulative.saturating_sub(self.last_bytes);
        self.last_bytes = cumulative;
        self.last_at = Some(now);

        let instantaneous = (delta as f64 / dt) as u64;
        if instantaneous == 0 {
            // Hold the last positive value.
            return self.display;
        }
        if self.samples.len() == 10 {
            self.samples.pop_front();
        }
        self.samples.push_back(instantaneous);
        self.display = self.samples.iter().sum::<u64>() / self.samples.len() as u64;
        self.display
    }

    pub fn current(&self) -> u64 {
        self.display
    }
}

/// Extract the btih info hash from a magnet link, normalizing base32 to
/// hex. Returns `None` when the link carries no recognizable hash.
pub fn extract_info_hash_from_magnet(magnet: &str) -> Option<String> {
    let lower = magnet.to_ascii_lowercase();
    let start = lower.find("btih:")? + 5;
    let rest = &lower[start..];
    let end = rest.find('&').unwrap_or(rest.len());
    let hash = &rest[..end];
    if hash.len() == 40 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Some(hash.to_string());
    }
    if hash.len() == 32 {
        let decoded = data_encoding::BASE32
            .decode(hash.to_ascii_uppercase().as_bytes())
            .ok()?;
        return Some(hex::encode(decoded));
    }
    None
}

/// Metadata extracted once the engine has the info dictionary.
#[derive(Debug, Clone)]
struct TorrentMeta {
    name: String,
    files: Vec<(String, u64)>,
    piece_count: usize,
    total: u64,
}

/// BitTorrent download adapter (see module docs).
pub struct TorrentAdapter {
    id: String,
    source: String,
    output: PathBuf,
    opts: crate::options::DownloadOptions,
    session_dir: PathBuf,
    reporter: Arc<Reporter>,
    store: Option<StateStore>,
}

impl TorrentAdapter {
    pub fn new(
        request: &DownloadRequest,
        reporter: Arc<Reporter>,
        store: Option<StateStore>,
        session_dir: PathBuf,
    ) -> Self {
        Self {
            id: request.id.clone(),
            source: request.source.clone(),
            output: request.output.clone(),
            opts: request.options.clone(),
            session_dir,
            reporter,
            store,
        }
    }

    /// The engine names the top-level artifact itself, so the data
    /// directory is the output when it already is a directory, else its
    /// parent.
    fn data_dir(&self) -> PathBuf {
        if self.output.is_dir() {
            self.output.clone()
        } else {
            self.output
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."))
        }
    }

    async fn ingest(&self) -> Result<AddTorrent<'static>, DownloadError> {
        if self.source.starts_with("magnet:") {
            extract_info_hash_from_magnet(&self.source)
                .ok_or_else(|| DownloadError::SourceInvalid("magnet link has no info hash".into()))?;
            return Ok(AddTorrent::from_url(self.source.clone()));
        }
        if self.source.starts_with("http://") || self.source.starts_with("https://") {
            let bytes = reqwest::get(&self.source)
                .await
                .map_err(|e| DownloadError::Unreachable(e.to_string()))?
                .bytes()
                .await
                .map_err(|e| DownloadError::Unreachable(e.to_string()))?;
            return Ok(AddTorrent::from_bytes(bytes.to_vec()));
        }
        let bytes = tokio::fs::read(&self.source)
            .await
            .map_err(|e| DownloadError::SourceInvalid(format!("{}: {e}", self.source)))?;
        Ok(AddTorrent::from_bytes(bytes))
    }

    async fn open_session(&self) -> Result<Arc<Session>, DownloadError> {
        tokio::fs::create_dir_all(&self.session_dir)
            .await
            .map_err(|e| DownloadError::TorrentEngine(e.to_string()))?;
        let ratelimits = LimitsConfig {
            upload_bps: NonZeroU32::new(self.opts.bt_upload_limit.min(u32::MAX as u64) as u32),
            download_bps: NonZeroU32::new(self.opts.limit.min(u32::MAX as u64) as u32),
        };
        let options = SessionOptions {
            disable_dht: false,
            disable_dht_persistence: false,
            persistence: None,
            ratelimits,
            ..Default::default()
        };
        // The per-download data dir is supplied on add; the session itself
        // anchors at the state directory.
        Session::new_with_opts(self.session_dir.clone(), options)
            .await
            .map_err(|e| DownloadError::TorrentEngine(e.to_string()))
    }

    /// Run the torrent to seeding, pause, cancel, or failure.
    pub async fn run(&mut self, mut control: ControlRx) -> Result<(), DownloadError> {
        let session = self.open_session().await?;
        let result = self.run_with_session(&session, &mut control).await;
        self.stop_session(&session).await;
        if let Err(DownloadError::Paused(reason)) = &result {
            let mut record = self.base_record(DownloadStatus::Paused);
            record.pause_reason = Some(reason.clone());
            self.reporter.report(StatusEvent::Transition(record));
            if let Some(store) = &self.store {
                let _ = store.update_status(&self.id, DownloadStatus::Paused, None);
            }
        }
        result
    }

    async fn run_with_session(
        &mut self,
        session: &Arc<Session>,
        control: &mut ControlRx,
    ) -> Result<(), DownloadError> {
        let source = self.ingest().await?;
        let add_options = AddTorrentOptions {
            output_folder: Some(self.data_dir().to_string_lossy().to_string()),
            overwrite: true,
            ..Default::default()
        };
        let response = session
            .add_torrent(source, Some(add_options))
            .await
            .map_err(|e| DownloadError::BadMetainfo(e.to_string()))?;
        let handle = response
            .into_handle()
            .ok_or_else(|| DownloadError::TorrentEngine("no torrent handle".into()))?;

        // Metadata phase. Magnets block here until the swarm supplies the
        // info dictionary.
        self.transition(DownloadStatus::GettingMetadata, |_| {});
        let meta = loop {
            control.check()?;
            let result = handle.with_metadata(|m| TorrentMeta {
                name: m.name.clone().unwrap_or_else(|| "torrent".to_string()),
                files: m
                    .file_infos
                    .iter()
                    .map(|f| (f.relative_filename.to_string_lossy().to_string(), f.len))
                    .collect(),
                piece_count: m.info.pieces.as_ref().len() / 20,
                total: m.file_infos.iter().map(|f| f.len).sum(),
            });
            match result {
                Ok(meta) => break meta,
                Err(_) => control.sleep(Duration::from_millis(250)).await?,
            }
        };
        let info_hash = hex::encode(handle.info_hash().0);
        tracing::info!(id = %self.id, info_hash = %info_hash, name = %meta.name,
            pieces = meta.piece_count, "torrent metadata resolved");

        // One pass over file selection: every file is wanted. The engine
        // exposes selection but no per-file priority levels, so the
        // `bt_sequential` option cannot change piece ordering here; the
        // scheduler keeps its own (rarest-first) order either way.
        let all: HashSet<usize> = (0..meta.files.len()).collect();
        if let Err(e) = session.update_only_files(&handle, &all).await {
            tracing::warn!(id = %self.id, error = %e, "file selection failed");
        }
        if self.opts.bt_sequential {
            tracing::debug!(id = %self.id,
                "bt_sequential recorded; the engine has no priority knob, piece order is its own");
        }

        // Preflight: when files matching the torrent layout are already on
        // disk, the engine hash-checks them during initialization; surface
        // the verification state for at least one tick. With nothing on
        // disk there is nothing to verify, so just wait initialization out.
        let data_dir = self.data_dir();
        let local_files_present = meta
            .files
            .iter()
            .any(|(path, _)| data_dir.join(path).exists());
        if local_files_present {
            loop {
                control.check()?;
                let stats = handle.stats();
                let mut record = self.base_record(DownloadStatus::Verifying);
                record.total = meta.total;
                record.downloaded = stats.progress_bytes.min(meta.total);
                record.progress = ratio(stats.progress_bytes, meta.total);
                record.verify_status = Some(VerifyStatus::VerifyingPieces);
                record.info_hash = Some(info_hash.clone());
                record.torrent_name = Some(meta.name.clone());
                self.reporter.report(StatusEvent::Progress(record));
                if !matches!(handle.stats().state, TorrentStatsState::Initializing) {
                    break;
                }
                control.sleep(TICK_INTERVAL).await?;
            }
        } else {
            while matches!(handle.stats().state, TorrentStatsState::Initializing) {
                control.check()?;
                control.sleep(TICK_INTERVAL).await?;
            }
        }

        self.download_phase(session, &handle, control, &meta, &info_hash)
            .await?;
        self.seeding_phase(&handle, control, &meta, &info_hash).await
    }

    async fn download_phase(
        &self,
        session: &Arc<Session>,
        handle: &Arc<ManagedTorrent>,
        control: &mut ControlRx,
        meta: &TorrentMeta,
        info_hash: &str,
    ) -> Result<(), DownloadError> {
        let mut down = SpeedEstimator::default();
        let mut up = SpeedEstimator::default();
        let mut last_resume = Instant::now() - RESUME_INTERVAL;

        loop {
            if let Err(e) = control.check() {
                if matches!(e, DownloadError::Paused(_)) {
                    // Park the engine so peers stop; piece state persists
                    // and re-verifies on resume.
                    if let Err(pause_err) = session.pause(handle).await {
                        let msg = pause_err.to_string();
                        if !msg.contains("already paused") {
                            tracing::warn!(id = %self.id, error = %msg, "engine pause failed");
                        }
                    }
                    self.save_resume(handle, meta, info_hash, false);
                }
                return Err(e);
            }

            let stats = handle.stats();
            if matches!(stats.state, TorrentStatsState::Error) {
                return Err(DownloadError::TorrentEngine(
                    stats.error.unwrap_or_else(|| "engine error".to_string()),
                ));
            }

            let total = if stats.total_bytes > 0 {
                stats.total_bytes
            } else {
                meta.total
            };
            let downloaded = stats.progress_bytes.min(total);
            let now = Instant::now();
            let speed = down.sample(downloaded, now);
            let upload_rate = up.sample(stats.uploaded_bytes, now);
            let states = piece_states(handle, meta.piece_count, stats.finished);
            let completed = states.iter().filter(|have| **have).count();

            let (peers, seeds) = stats
                .live
                .as_ref()
                .map(|l| {
                    (
                        l.snapshot.peer_stats.live as u64,
                        l.snapshot.peer_stats.seen as u64,
                    )
                })
                .unwrap_or((0, 0));

            let mut record = self.base_record(DownloadStatus::Downloading);
            record.total = total;
            record.downloaded = downloaded;
            record.progress = ratio(downloaded, total);
            record.speed = Some(speed);
            record.upload_rate = Some(upload_rate);
            record.peers = Some(peers);
            record.seeds = Some(seeds);
            record.piece_count = Some(meta.piece_count);
            record.completed_pieces = Some(completed);
            record.piece_states = Some(states.clone());
            record.info_hash = Some(info_hash.to_string());
            record.torrent_name = Some(meta.name.clone());
            if speed > 0 && total > downloaded {
                record.eta = Some((total - downloaded) / speed);
            }
            if meta.files.len() > 1 {
                record.file_progress = Some(file_progress(meta, &stats.file_progress));
            }
            self.reporter.report(StatusEvent::Progress(record));

            if let Some(store) = &self.store {
                let _ = store.update_progress(
                    &self.id,
                    DownloadStatus::Downloading,
                    ratio(downloaded, total),
                    downloaded,
                    total,
                    speed,
                    None,
                );
            }
            if last_resume.elapsed() >= RESUME_INTERVAL {
                last_resume = Instant::now();
                self.save_resume_states(&states, meta, info_hash, false);
            }

            if total > 0 && downloaded >= total {
                return Ok(());
            }
            control.sleep(TICK_INTERVAL).await?;
        }
    }

    async fn seeding_phase(
        &self,
        handle: &Arc<ManagedTorrent>,
        control: &mut ControlRx,
        meta: &TorrentMeta,
        info_hash: &str,
    ) -> Result<(), DownloadError> {
        let states = vec![true; meta.piece_count];
        self.save_resume_states(&states, meta, info_hash, true);

        let mut record = self.base_record(DownloadStatus::Seeding);
        record.total = meta.total;
        record.downloaded = meta.total;
        record.progress = 1.0;
        record.piece_count = Some(meta.piece_count);
        record.completed_pieces = Some(meta.piece_count);
        record.piece_states = Some(states.clone());
        record.verify_status = Some(VerifyStatus::Verified);
        record.info_hash = Some(info_hash.to_string());
        record.torrent_name = Some(meta.name.clone());
        self.reporter.report(StatusEvent::Transition(record));

        if let Some(store) = &self.store {
            let _ = store.update_progress(
                &self.id,
                DownloadStatus::Seeding,
                1.0,
                meta.total,
                meta.total,
                0,
                None,
            );
        }

        if !self.opts.bt_keep_seeding {
            return Ok(());
        }

        // Seeding ticks until the host stops the adapter.
        let mut up = SpeedEstimator::default();
        loop {
            if control.check().is_err() {
                // Stopping a seeder is a normal shutdown, not a failure.
                return Ok(());
            }
            let stats = handle.stats();
            let upload_rate = up.sample(stats.uploaded_bytes, Instant::now());
            let peers = stats
                .live
                .as_ref()
                .map(|l| l.snapshot.peer_stats.live as u64)
                .unwrap_or(0);

            let mut record = self.base_record(DownloadStatus::Seeding);
            record.total = meta.total;
            record.downloaded = meta.total;
            record.progress = 1.0;
            record.upload_rate = Some(upload_rate);
            record.peers = Some(peers);
            record.piece_count = Some(meta.piece_count);
            record.completed_pieces = Some(meta.piece_count);
            record.info_hash = Some(info_hash.to_string());
            record.torrent_name = Some(meta.name.clone());
            self.reporter.report(StatusEvent::Progress(record));

            if control.sleep(Duration::from_secs(1)).await.is_err() {
                return Ok(());
            }
        }
    }

    fn save_resume(&self, handle: &Arc<ManagedTorrent>, meta: &TorrentMeta, info_hash: &str, verified: bool) {
        let states = piece_states(handle, meta.piece_count, false);
        self.save_resume_states(&states, meta, info_hash, verified);
    }

    fn save_resume_states(
        &self,
        states: &[bool],
        meta: &TorrentMeta,
        info_hash: &str,
        verified: bool,
    ) {
        if let Some(store) = &self.store {
            let record = TorrentResumeRecord {
                download_id: self.id.clone(),
                info_hash: info_hash.to_string(),
                piece_count: meta.piece_count,
                piece_states: states.to_vec(),
                verified_at: verified.then(|| chrono::Utc::now().to_rfc3339()),
            };
            if let Err(e) = store.save_torrent_resume(&record) {
                tracing::warn!(id = %self.id, error = %e, "torrent resume write failed");
            }
        }
    }

    /// Graceful stop with a hard deadline, the in-process analogue of
    /// SIGTERM followed by a kill.
    async fn stop_session(&self, session: &Arc<Session>) {
        if tokio::time::timeout(STOP_TIMEOUT, session.stop())
            .await
            .is_err()
        {
            tracing::warn!(id = %self.id, "torrent session did not stop in time; dropping it");
        }
    }

    fn base_record(&self, status: DownloadStatus) -> StatusRecord {
        StatusRecord::new(SourceKind::Torrent, status)
    }

    fn transition(&self, status: DownloadStatus, fill: impl FnOnce(&mut StatusRecord)) {
        let mut record = self.base_record(status);
        fill(&mut record);
        self.reporter.report(StatusEvent::Transition(record));
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64).clamp(0.0, 1.0)
    }
}

/// Full boolean have-vector from the engine's chunk tracker. Outside the
/// live state (still initializing, or paused) the tracker is unavailable;
/// fall back to all-false, or all-true once finished.
fn piece_states(handle: &Arc<ManagedTorrent>, piece_count: usize, finished: bool) -> Vec<bool> {
    let from_tracker = handle.with_chunk_tracker(|ct| {
        let have = ct.get_have_pieces();
        (0..piece_count)
            .map(|i| have.get(i).map(|bit| *bit).unwrap_or(false))
            .collect::<Vec<bool>>()
    });
    match from_tracker {
        Ok(states) => states,
        Err(_) if finished => vec![true; piece_count],
        Err(_) => vec![false; piece_count],
    }
}

fn file_progress(meta: &TorrentMeta, per_file: &[u64]) -> Vec<FileProgress> {
    meta.files
        .iter()
        .enumerate()
        .map(|(index, (path, total))| {
            let downloaded = per_file.get(index).copied().unwrap_or(0).min(*total);
            let name = std::path::Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.clone());
            FileProgress {
                index,
                path: path.clone(),
                name,
                progress: ratio(downloaded, *total),
                downloaded,
                total: *total,
            }
        })
        .collect()
}
