//! Top-level download orchestration: source dispatch, lifecycle, and
//! failure surfacing.

use crate::control::ControlRx;
use crate::downloader::HttpEngine;
use crate::error::DownloadError;
use crate::options::{detect_kind, DownloadOptions, DownloadRequest, SourceKind};
use crate::status::{DownloadStatus, Reporter, StatusEvent, StatusRecord};
use crate::store::{DownloadRow, StateStore};
use crate::torrent::TorrentAdapter;
use std::path::PathBuf;
use std::sync::Arc;

/// Reason recorded on a freshly created download; nothing starts until an
/// explicit resume.
pub const INITIAL_PAUSE_REASON: &str = "Paused - click resume to start";

/// Dispatches a download to the right engine and owns its lifecycle in
/// the state store.
pub struct Supervisor {
    store: Option<StateStore>,
    reporter: Arc<Reporter>,
    session_dir: PathBuf,
}

impl Supervisor {
    pub fn new(store: Option<StateStore>, reporter: Arc<Reporter>, session_dir: PathBuf) -> Self {
        Self {
            store,
            reporter,
            session_dir,
        }
    }

    /// Create (or refresh) the download record in the paused state. Never
    /// auto-starts.
    pub fn create(
        &self,
        id: &str,
        source: &str,
        output: &PathBuf,
        options: &DownloadOptions,
    ) -> Result<DownloadRequest, DownloadError> {
        let kind = detect_kind(source);
        let request = DownloadRequest {
            id: id.to_string(),
            source: source.to_string(),
            output: output.clone(),
            kind,
            options: options.clone(),
        };
        if let Some(store) = &self.store {
            let existing = store.load(id)?;
            let row = DownloadRow {
                id: id.to_string(),
                source: source.to_string(),
                output: output.to_string_lossy().to_string(),
                kind,
                status: DownloadStatus::Paused,
                progress: existing.as_ref().map(|r| r.progress).unwrap_or(0.0),
                downloaded: existing.as_ref().map(|r| r.downloaded).unwrap_or(0),
                total: existing.as_ref().map(|r| r.total).unwrap_or(0),
                speed: 0,
                options: serde_json::to_string(options).ok(),
                metadata: Some(
                    serde_json::json!({ "pause_reason": INITIAL_PAUSE_REASON }).to_string(),
                ),
                created_at: existing
                    .map(|r| r.created_at)
                    .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
                completed_at: None,
            };
            store.upsert_download(&row)?;
        }
        Ok(request)
    }

    /// Merge options persisted in the settings table under the CLI-provided
    /// values. The CLI wins; the table fills gaps the shell configured
    /// globally.
    pub fn effective_options(&self, mut options: DownloadOptions) -> DownloadOptions {
        let Some(store) = &self.store else {
            return options;
        };
        let setting = |key: &str| store.get_setting(key).ok().flatten();
        if let Some(v) = setting("concurrency").and_then(|v| v.parse().ok()) {
            if options.concurrency == DownloadOptions::default().concurrency {
                options.concurrency = v;
            }
        }
        if let Some(v) = setting("limit").and_then(|v| v.parse().ok()) {
            if options.limit == 0 {
                options.limit = v;
            }
        }
        if let Some(v) = setting("bt_upload_limit").and_then(|v| v.parse().ok()) {
            if options.bt_upload_limit == 0 {
                options.bt_upload_limit = v;
            }
        }
        options
    }

    /// Explicit resume: clears any auto-pause latch, dispatches on the
    /// source kind, and translates the outcome into the terminal record
    /// and store state.
    pub async fn resume(
        &self,
        request: &DownloadRequest,
        control: ControlRx,
    ) -> Result<(), DownloadError> {
        self.reporter.clear_auto_paused();
        if let Some(store) = &self.store {
            let _ = store.update_status(&request.id, DownloadStatus::Downloading, None);
        }

        let result = match request.kind {
            SourceKind::Http => {
                let mut engine =
                    HttpEngine::new(request, self.reporter.clone(), self.store.clone())?;
                engine.run(control).await
            }
            SourceKind::Torrent => {
                let mut adapter = TorrentAdapter::new(
                    request,
                    self.reporter.clone(),
                    self.store.clone(),
                    self.session_dir.clone(),
                );
                adapter.run(control).await
            }
        };

        match &result {
            Ok(()) => {}
            // Control-flow exits already emitted their pause transition.
            Err(DownloadError::Paused(_)) => {}
            Err(DownloadError::Cancelled) => {
                let mut record =
                    StatusRecord::new(request.kind, DownloadStatus::Cancelled);
                self.fill_counters(&request.id, &mut record);
                record.message = Some("Cancelled".to_string());
                self.reporter.report(StatusEvent::Transition(record));
                if let Some(store) = &self.store {
                    let _ = store.update_status(&request.id, DownloadStatus::Cancelled, None);
                    // Temp files stay on disk for a later restart.
                }
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!(id = %request.id, error = %message, "download failed");
                let mut record = StatusRecord::new(request.kind, DownloadStatus::Failed);
                self.fill_counters(&request.id, &mut record);
                record.message = Some(message.clone());
                self.reporter.report(StatusEvent::Transition(record));
                if let Some(store) = &self.store {
                    let metadata =
                        serde_json::json!({ "last_error": message }).to_string();
                    let _ =
                        store.update_status(&request.id, DownloadStatus::Failed, Some(&metadata));
                    if request.kind == SourceKind::Http {
                        // Chunk records are cleared; a restart replans from
                        // the part files still on disk. Torrent piece state
                        // stays so the engine can re-verify.
                        let _ = store.clear_resume(&request.id);
                    }
                }
            }
        }
        result
    }

    /// Carry the last persisted counters into a terminal record so the
    /// consumer sees where the download stood.
    fn fill_counters(&self, id: &str, record: &mut StatusRecord) {
        if let Some(store) = &self.store {
            if let Ok(Some(row)) = store.load(id) {
                record.downloaded = row.downloaded.max(0) as u64;
                record.total = row.total.max(0) as u64;
                record.progress = row.progress.clamp(0.0, 1.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, Supervisor, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("accelara.db")).unwrap();
        let reporter = Arc::new(Reporter::new(Box::new(std::io::sink())));
        let supervisor = Supervisor::new(
            Some(store.clone()),
            reporter,
            dir.path().join("session"),
        );
        (dir, supervisor, store)
    }

    #[test]
    fn created_downloads_start_paused_with_reason() {
        let (dir, supervisor, store) = fixture();
        let request = supervisor
            .create(
                "d1",
                "https://example.com/file.iso",
                &dir.path().join("file.iso"),
                &DownloadOptions::default(),
            )
            .unwrap();
        assert_eq!(request.kind, SourceKind::Http);

        let row = store.load("d1").unwrap().unwrap();
        assert_eq!(row.status, DownloadStatus::Paused);
        let metadata: serde_json::Value =
            serde_json::from_str(row.metadata.as_deref().unwrap()).unwrap();
        assert_eq!(metadata["pause_reason"], INITIAL_PAUSE_REASON);
    }

    #[test]
    fn create_preserves_restored_progress_floor() {
        let (dir, supervisor, store) = fixture();
        supervisor
            .create(
                "d1",
                "https://example.com/file.iso",
                &dir.path().join("file.iso"),
                &DownloadOptions::default(),
            )
            .unwrap();
        store
            .update_progress("d1", DownloadStatus::Downloading, 0.5, 500, 1000, 10, None)
            .unwrap();

        // Re-creating the same download keeps the persisted floor.
        supervisor
            .create(
                "d1",
                "https://example.com/file.iso",
                &dir.path().join("file.iso"),
                &DownloadOptions::default(),
            )
            .unwrap();
        let row = store.load("d1").unwrap().unwrap();
        assert_eq!(row.downloaded, 500);
        assert_eq!(row.total, 1000);
        assert_eq!(row.status, DownloadStatus::Paused);
    }

    #[test]
    fn torrent_sources_dispatch_to_the_adapter() {
        let (dir, supervisor, _store) = fixture();
        let request = supervisor
            .create(
                "t1",
                "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a",
                &dir.path().join("data"),
                &DownloadOptions::default(),
            )
            .unwrap();
        assert_eq!(request.kind, SourceKind::Torrent);
    }

    #[test]
    fn settings_fill_unset_options_only() {
        let (_dir, supervisor, store) = fixture();
        store.set_setting("concurrency", "6").unwrap();
        store.set_setting("limit", "1000").unwrap();

        let effective = supervisor.effective_options(DownloadOptions::default());
        assert_eq!(effective.concurrency, 6);
        assert_eq!(effective.limit, 1000);

        // Explicit CLI values win over the table.
        let mut explicit = DownloadOptions::default();
        explicit.limit = 2000;
        let effective = supervisor.effective_options(explicit);
        assert_eq!(effective.limit, 2000);
    }
}
