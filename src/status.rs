use crate::options::SourceKind;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Mutex;

/// Lifecycle state carried by every status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Initializing,
    Probing,
    GettingMetadata,
    Downloading,
    Paused,
    Verifying,
    Merging,
    Seeding,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Initializing => "initializing",
            DownloadStatus::Probing => "probing",
            DownloadStatus::GettingMetadata => "getting_metadata",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Verifying => "verifying",
            DownloadStatus::Merging => "merging",
            DownloadStatus::Seeding => "seeding",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "initializing" => DownloadStatus::Initializing,
            "probing" => DownloadStatus::Probing,
            "getting_metadata" => DownloadStatus::GettingMetadata,
            "downloading" => DownloadStatus::Downloading,
            "verifying" => DownloadStatus::Verifying,
            "merging" => DownloadStatus::Merging,
            "seeding" => DownloadStatus::Seeding,
            "completed" => DownloadStatus::Completed,
            "failed" => DownloadStatus::Failed,
            "cancelled" => DownloadStatus::Cancelled,
            _ => DownloadStatus::Paused,
        }
    }

    /// Terminal records are never dropped by the reporter.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed
                | DownloadStatus::Failed
                | DownloadStatus::Cancelled
                | DownloadStatus::Seeding
        )
    }
}

/// Verification sub-status surfaced alongside the main state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    CheckingExistingFile,
    ChecksumVerifying,
    ChecksumVerified,
    SizeVerified,
    ChunksVerified,
    VerifyingPieces,
    Verified,
}

/// Per-file progress for multi-file torrents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProgress {
    pub index: usize,
    pub path: String,
    pub name: String,
    pub progress: f64,
    pub downloaded: u64,
    pub total: u64,
}

/// One line of the progress stream. Required fields are always present;
/// everything else is populated as applicable and omitted from the JSON
/// otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub status: DownloadStatus,
    pub progress: f64,
    pub downloaded: u64,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_rate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_progress: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub piece_states: Option<Vec<bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub piece_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_pieces: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peers: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seeds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub torrent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_progress: Option<Vec<FileProgress>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_status: Option<VerifyStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_chunk: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_total: Option<usize>,
}

impl StatusRecord {
    pub fn new(kind: SourceKind, status: DownloadStatus) -> Self {
        Self {
            kind,
            status,
            progress: 0.0,
            downloaded: 0,
            total: 0,
            speed: None,
            upload_rate: None,
            eta: None,
            chunk_progress: None,
            chunk_count: None,
            piece_states: None,
            piece_count: None,
            completed_pieces: None,
            peers: None,
            seeds: None,
            message: None,
            pause_reason: None,
            info_hash: None,
            torrent_name: None,
            file_progress: None,
            verify_status: None,
            verified: None,
            sha256: None,
            merge_progress: None,
            merge_chunk: None,
            merge_total: None,
        }
    }
}

/// The stream intermixes two kinds of record: throttled progress snapshots
/// that may coalesce, and state transitions that must always reach the
/// consumer. Both share the same wire shape.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    Progress(StatusRecord),
    Transition(StatusRecord),
}

impl StatusEvent {
    pub fn record(&self) -> &StatusRecord {
        match self {
            StatusEvent::Progress(r) | StatusEvent::Transition(r) => r,
        }
    }
}

struct ReporterInner {
    writer: Box<dyn Write + Send>,
    /// Latched once a write fails: the consumer is gone, stop trying.
    closed: bool,
    /// A completed record is emitted at most once per download lifetime.
    completed_emitted: bool,
    /// Sticky auto-pause: progress claiming an active state is suppressed
    /// until an explicit resume clears the latch.
    auto_paused: bool,
}

/// Serializes status events to the consumer, one JSON object per line.
///
/// Delivery is at-most-once and in submission order; terminal transitions
/// are never dropped; a vanished consumer never blocks the producers.
pub struct Reporter {
    inner: Mutex<ReporterInner>,
}

impl Reporter {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Mutex::new(ReporterInner {
                writer,
                closed: false,
                completed_emitted: false,
                auto_paused: false,
            }),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Mark the download auto-paused. While latched, records observing an
    /// active state (downloading, seeding, verifying) are dropped so a
    /// straggling worker cannot override the pause.
    pub fn set_auto_paused(&self) {
        self.inner.lock().unwrap().auto_paused = true;
    }

    /// Explicit user resume clears the latch.
    pub fn clear_auto_paused(&self) {
        self.inner.lock().unwrap().auto_paused = false;
    }

    pub fn report(&self, event: StatusEvent) {
        let mut inner = self.inner.lock().unwrap();
        let record = event.record();
        // Once a write failed the consumer is likely gone; stop pushing
        // progress, but still attempt terminal records.
        if inner.closed && !record.status.is_terminal() {
            return;
        }

        if inner.auto_paused
            && matches!(
                record.status,
                DownloadStatus::Downloading | DownloadStatus::Seeding | DownloadStatus::Verifying
            )
        {
            return;
        }
        if record.status == DownloadStatus::Completed {
            if inner.completed_emitted {
                return;
            }
            inner.completed_emitted = true;
        }

        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize status record");
                return;
            }
        };
        let wrote = writeln!(inner.writer, "{line}").and_then(|_| inner.writer.flush());
        if wrote.is_err() {
            inner.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn lines(buf: &SharedBuf) -> Vec<serde_json::Value> {
        String::from_utf8(buf.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn required_fields_always_present_and_optionals_omitted() {
        let buf = SharedBuf::default();
        let reporter = Reporter::new(Box::new(buf.clone()));
        reporter.report(StatusEvent::Progress(StatusRecord::new(
            SourceKind::Http,
            DownloadStatus::Downloading,
        )));
        let lines = lines(&buf);
        assert_eq!(lines.len(), 1);
        let obj = lines[0].as_object().unwrap();
        assert_eq!(obj["type"], "http");
        assert_eq!(obj["status"], "downloading");
        assert!(obj.contains_key("progress"));
        assert!(obj.contains_key("downloaded"));
        assert!(obj.contains_key("total"));
        assert!(!obj.contains_key("chunk_count"));
        assert!(!obj.contains_key("piece_states"));
    }

    #[test]
    fn completed_is_emitted_at_most_once() {
        let buf = SharedBuf::default();
        let reporter = Reporter::new(Box::new(buf.clone()));
        let mut record = StatusRecord::new(SourceKind::Http, DownloadStatus::Completed);
        record.progress = 1.0;
        reporter.report(StatusEvent::Transition(record.clone()));
        reporter.report(StatusEvent::Transition(record));
        assert_eq!(lines(&buf).len(), 1);
    }

    #[test]
    fn auto_pause_latch_suppresses_active_observations() {
        let buf = SharedBuf::default();
        let reporter = Reporter::new(Box::new(buf.clone()));
        reporter.set_auto_paused();
        reporter.report(StatusEvent::Progress(StatusRecord::new(
            SourceKind::Http,
            DownloadStatus::Downloading,
        )));
        assert_eq!(lines(&buf).len(), 0);

        // The pause record itself still flows.
        let mut paused = StatusRecord::new(SourceKind::Http, DownloadStatus::Paused);
        paused.pause_reason = Some("Connection lost".into());
        reporter.report(StatusEvent::Transition(paused));
        assert_eq!(lines(&buf).len(), 1);

        reporter.clear_auto_paused();
        reporter.report(StatusEvent::Progress(StatusRecord::new(
            SourceKind::Http,
            DownloadStatus::Downloading,
        )));
        assert_eq!(lines(&buf).len(), 2);
    }

    #[test]
    fn torrent_terminal_shape_matches_consumer_expectations() {
        let mut record = StatusRecord::new(SourceKind::Torrent, DownloadStatus::Seeding);
        record.progress = 1.0;
        record.downloaded = 1_048_576;
        record.total = 1_048_576;
        record.piece_count = Some(4);
        record.completed_pieces = Some(4);
        record.piece_states = Some(vec![true; 4]);
        record.verify_status = Some(VerifyStatus::Verified);
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&record).unwrap()).unwrap();
        assert_eq!(value["type"], "torrent");
        assert_eq!(value["status"], "seeding");
        assert_eq!(value["piece_states"], serde_json::json!([true, true, true, true]));
        assert_eq!(value["verify_status"], "verified");
    }
}
