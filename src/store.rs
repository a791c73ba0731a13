//! Persistence layer for resumable download state.
//!
//! A thin SQLite store the engines reach through a narrow interface:
//! per-download rows, HTTP/torrent resume records, and a key-value
//! settings table. Writes are single-statement upserts so a crash can
//! never leave a row reporting more progress than was persisted.

use crate::error::DownloadError;
use crate::options::SourceKind;
use crate::status::DownloadStatus;
use rusqlite::{Connection, Result as SqliteResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Centralized accessor with a busy timeout to prevent contention hangs.
fn open_db<P: AsRef<Path>>(path: P) -> SqliteResult<Connection> {
    let conn = Connection::open(path)?;
    // Wait up to 5 seconds if the database is locked by another process.
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    // WAL allows the shell to read while a download is writing.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    Ok(conn)
}

/// One row of the downloads table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRow {
    pub id: String,
    pub source: String,
    pub output: String,
    pub kind: SourceKind,
    pub status: DownloadStatus,
    pub progress: f64,
    pub downloaded: i64,
    pub total: i64,
    pub speed: i64,
    /// Serialized `DownloadOptions`.
    pub options: Option<String>,
    /// Per-kind extras: pause reason, auto_paused flag, recent messages.
    pub metadata: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Resumable state for a segmented HTTP download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResumeRecord {
    pub download_id: String,
    pub source_url: String,
    pub file_path: String,
    pub total_size: u64,
    pub chunk_count: usize,
    pub chunk_progress: Vec<u64>,
    pub sha256: Option<String>,
    pub verified_at: Option<String>,
}

/// Resumable state for a torrent download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentResumeRecord {
    pub download_id: String,
    pub info_hash: String,
    pub piece_count: usize,
    pub piece_states: Vec<bool>,
    pub verified_at: Option<String>,
}

/// Handle to the SQLite store. Cheap to clone; a connection is opened per
/// operation so the engines can call from any task.
#[derive(Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Open (creating if necessary) the store at `path` and apply the
    /// schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DownloadError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| DownloadError::Store(e.to_string()))?;
        }
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init(&self) -> Result<(), DownloadError> {
        let conn = open_db(&self.path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                output TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'http',
                status TEXT NOT NULL DEFAULT 'paused',
                progress REAL NOT NULL DEFAULT 0,
                downloaded INTEGER NOT NULL DEFAULT 0,
                total INTEGER NOT NULL DEFAULT 0,
                speed INTEGER NOT NULL DEFAULT 0,
                options TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS http_resume (
                download_id TEXT PRIMARY KEY,
                source_url TEXT NOT NULL,
                file_path TEXT NOT NULL,
                total_size INTEGER NOT NULL,
                chunk_count INTEGER NOT NULL,
                chunk_progress TEXT NOT NULL,
                sha256 TEXT,
                verified_at TEXT
            );

            CREATE TABLE IF NOT EXISTS torrent_resume (
                download_id TEXT PRIMARY KEY,
                info_hash TEXT NOT NULL,
                piece_count INTEGER NOT NULL,
                piece_states TEXT NOT NULL,
                verified_at TEXT
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
            ",
        )?;
        Ok(())
    }

    fn row_to_download(row: &rusqlite::Row) -> SqliteResult<DownloadRow> {
        let kind: String = row.get(3)?;
        let status: String = row.get(4)?;
        Ok(DownloadRow {
            id: row.get(0)?,
            source: row.get(1)?,
            output: row.get(2)?,
            kind: if kind == "torrent" {
                SourceKind::Torrent
            } else {
                SourceKind::Http
            },
            status: DownloadStatus::from_str(&status),
            progress: row.get(5)?,
            downloaded: row.get(6)?,
            total: row.get(7)?,
            speed: row.get(8)?,
            options: row.get(9)?,
            metadata: row.get(10)?,
            created_at: row.get(11)?,
            completed_at: row.get(12)?,
        })
    }

    pub fn load(&self, id: &str) -> Result<Option<DownloadRow>, DownloadError> {
        let conn = open_db(&self.path)?;
        let mut stmt = conn.prepare(
            "SELECT id, source, output, kind, status, progress, downloaded, total, speed,
                    options, metadata, created_at, completed_at
             FROM downloads WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_download(row)?)),
            None => Ok(None),
        }
    }

    /// Insert or replace the download row. Used at creation and on resume
    /// when the source or options changed.
    pub fn upsert_download(&self, row: &DownloadRow) -> Result<(), DownloadError> {
        let conn = open_db(&self.path)?;
        conn.execute(
            "INSERT INTO downloads (id, source, output, kind, status, progress, downloaded,
                                    total, speed, options, metadata, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                source = excluded.source,
                output = excluded.output,
                kind = excluded.kind,
                status = excluded.status,
                progress = excluded.progress,
                downloaded = excluded.downloaded,
                total = excluded.total,
                speed = excluded.speed,
                options = excluded.options,
                metadata = excluded.metadata,
                completed_at = excluded.completed_at",
            rusqlite::params![
                &row.id,
                &row.source,
                &row.output,
                row.kind.as_str(),
                row.status.as_str(),
                row.progress,
                row.downloaded,
                row.total,
                row.speed,
                &row.options,
                &row.metadata,
                &row.created_at,
                &row.completed_at,
            ],
        )?;
        Ok(())
    }

    /// Periodic progress update from a running engine.
    pub fn update_progress(
        &self,
        id: &str,
        status: DownloadStatus,
        progress: f64,
        downloaded: u64,
        total: u64,
        speed: u64,
        metadata: Option<&str>,
    ) -> Result<(), DownloadError> {
        let conn = open_db(&self.path)?;
        let completed_at = if status == DownloadStatus::Completed {
            Some(chrono::Utc::now().to_rfc3339())
        } else {
            None
        };
        conn.execute(
            "UPDATE downloads
             SET status = ?1, progress = ?2, downloaded = ?3, total = ?4, speed = ?5,
                 metadata = COALESCE(?6, metadata),
                 completed_at = COALESCE(?7, completed_at)
             WHERE id = ?8",
            rusqlite::params![
                status.as_str(),
                progress,
                downloaded as i64,
                total as i64,
                speed as i64,
                metadata,
                completed_at,
                id,
            ],
        )?;
        Ok(())
    }

    /// Status-only update that leaves the progress counters untouched, for
    /// pause and cancel where the byte counts were already persisted.
    pub fn update_status(
        &self,
        id: &str,
        status: DownloadStatus,
        metadata: Option<&str>,
    ) -> Result<(), DownloadError> {
        let conn = open_db(&self.path)?;
        conn.execute(
            "UPDATE downloads
             SET status = ?1, metadata = COALESCE(?2, metadata)
             WHERE id = ?3",
            rusqlite::params![status.as_str(), metadata, id],
        )?;
        Ok(())
    }

    pub fn save_http_resume(&self, record: &HttpResumeRecord) -> Result<(), DownloadError> {
        let conn = open_db(&self.path)?;
        let progress_json = serde_json::to_string(&record.chunk_progress)
            .map_err(|e| DownloadError::Store(e.to_string()))?;
        conn.execute(
            "INSERT INTO http_resume (download_id, source_url, file_path, total_size,
                                      chunk_count, chunk_progress, sha256, verified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(download_id) DO UPDATE SET
                source_url = excluded.source_url,
                file_path = excluded.file_path,
                total_size = excluded.total_size,
                chunk_count = excluded.chunk_count,
                chunk_progress = excluded.chunk_progress,
                sha256 = excluded.sha256,
                verified_at = excluded.verified_at",
            rusqlite::params![
                &record.download_id,
                &record.source_url,
                &record.file_path,
                record.total_size as i64,
                record.chunk_count as i64,
                progress_json,
                &record.sha256,
                &record.verified_at,
            ],
        )?;
        Ok(())
    }

    pub fn load_http_resume(&self, id: &str) -> Result<Option<HttpResumeRecord>, DownloadError> {
        let conn = open_db(&self.path)?;
        let mut stmt = conn.prepare(
            "SELECT download_id, source_url, file_path, total_size, chunk_count,
                    chunk_progress, sha256, verified_at
             FROM http_resume WHERE download_id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => {
                let progress_json: String = row.get(5)?;
                Ok(Some(HttpResumeRecord {
                    download_id: row.get(0)?,
                    source_url: row.get(1)?,
                    file_path: row.get(2)?,
                    total_size: row.get::<_, i64>(3)? as u64,
                    chunk_count: row.get::<_, i64>(4)? as usize,
                    chunk_progress: serde_json::from_str(&progress_json).unwrap_or_default(),
                    sha256: row.get(6)?,
                    verified_at: row.get(7)?,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn save_torrent_resume(&self, record: &TorrentResumeRecord) -> Result<(), DownloadError> {
        let conn = open_db(&self.path)?;
        let states_json = serde_json::to_string(&record.piece_states)
            .map_err(|e| DownloadError::Store(e.to_string()))?;
        conn.execute(
            "INSERT INTO torrent_resume (download_id, info_hash, piece_count, piece_states,
                                         verified_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(download_id) DO UPDATE SET
                info_hash = excluded.info_hash,
                piece_count = excluded.piece_count,
                piece_states = excluded.piece_states,
                verified_at = excluded.verified_at",
            rusqlite::params![
                &record.download_id,
                &record.info_hash,
                record.piece_count as i64,
                states_json,
                &record.verified_at,
            ],
        )?;
        Ok(())
    }

    pub fn load_torrent_resume(
        &self,
        id: &str,
    ) -> Result<Option<TorrentResumeRecord>, DownloadError> {
        let conn = open_db(&self.path)?;
        let mut stmt = conn.prepare(
            "SELECT download_id, info_hash, piece_count, piece_states, verified_at
             FROM torrent_resume WHERE download_id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => {
                let states_json: String = row.get(3)?;
                Ok(Some(TorrentResumeRecord {
                    download_id: row.get(0)?,
                    info_hash: row.get(1)?,
                    piece_count: row.get::<_, i64>(2)? as usize,
                    piece_states: serde_json::from_str(&states_json).unwrap_or_default(),
                    verified_at: row.get(4)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Drop both resume records for a download. Called on completion and on
    /// terminal HTTP failure.
    pub fn clear_resume(&self, id: &str) -> Result<(), DownloadError> {
        let conn = open_db(&self.path)?;
        conn.execute("DELETE FROM http_resume WHERE download_id = ?1", [id])?;
        conn.execute("DELETE FROM torrent_resume WHERE download_id = ?1", [id])?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, DownloadError> {
        let conn = open_db(&self.path)?;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
        Ok(stmt.query_row([key], |row| row.get(0)).ok())
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), DownloadError> {
        let conn = open_db(&self.path)?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            (key, value),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("accelara.db")).unwrap();
        (dir, store)
    }

    fn sample_row(id: &str) -> DownloadRow {
        DownloadRow {
            id: id.to_string(),
            source: "https://example.com/file.iso".to_string(),
            output: "/tmp/file.iso".to_string(),
            kind: SourceKind::Http,
            status: DownloadStatus::Paused,
            progress: 0.0,
            downloaded: 0,
            total: 0,
            speed: 0,
            options: None,
            metadata: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            completed_at: None,
        }
    }

    #[test]
    fn download_row_round_trips() {
        let (_dir, store) = temp_store();
        store.upsert_download(&sample_row("d1")).unwrap();
        let loaded = store.load("d1").unwrap().unwrap();
        assert_eq!(loaded.source, "https://example.com/file.iso");
        assert_eq!(loaded.kind, SourceKind::Http);
        assert_eq!(loaded.status, DownloadStatus::Paused);
        assert!(store.load("missing").unwrap().is_none());
    }

    #[test]
    fn progress_updates_are_observable_in_order() {
        let (_dir, store) = temp_store();
        store.upsert_download(&sample_row("d1")).unwrap();
        store
            .update_progress("d1", DownloadStatus::Downloading, 0.25, 250, 1000, 50, None)
            .unwrap();
        store
            .update_progress("d1", DownloadStatus::Downloading, 0.5, 500, 1000, 60, None)
            .unwrap();
        let row = store.load("d1").unwrap().unwrap();
        assert_eq!(row.downloaded, 500);
        assert_eq!(row.status, DownloadStatus::Downloading);
        assert!((row.progress - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn http_resume_round_trips_and_upserts() {
        let (_dir, store) = temp_store();
        let mut record = HttpResumeRecord {
            download_id: "d1".to_string(),
            source_url: "https://example.com/file.iso".to_string(),
            file_path: "/tmp/file.iso".to_string(),
            total_size: 10_485_760,
            chunk_count: 4,
            chunk_progress: vec![0, 0, 0, 0],
            sha256: None,
            verified_at: None,
        };
        store.save_http_resume(&record).unwrap();
        record.chunk_progress = vec![2_621_440, 1_000, 0, 0];
        store.save_http_resume(&record).unwrap();

        let loaded = store.load_http_resume("d1").unwrap().unwrap();
        assert_eq!(loaded.chunk_progress, vec![2_621_440, 1_000, 0, 0]);
        assert_eq!(loaded.total_size, 10_485_760);

        store.clear_resume("d1").unwrap();
        assert!(store.load_http_resume("d1").unwrap().is_none());
    }

    #[test]
    fn torrent_resume_round_trips() {
        let (_dir, store) = temp_store();
        let record = TorrentResumeRecord {
            download_id: "t1".to_string(),
            info_hash: "aabbccdd".to_string(),
            piece_count: 4,
            piece_states: vec![true, false, true, false],
            verified_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        store.save_torrent_resume(&record).unwrap();
        let loaded = store.load_torrent_resume("t1").unwrap().unwrap();
        assert_eq!(loaded.piece_states, vec![true, false, true, false]);
        assert_eq!(loaded.piece_count, 4);
    }

    #[test]
    fn settings_store() {
        let (_dir, store) = temp_store();
        assert!(store.get_setting("concurrency").unwrap().is_none());
        store.set_setting("concurrency", "6").unwrap();
        assert_eq!(store.get_setting("concurrency").unwrap().unwrap(), "6");
        store.set_setting("concurrency", "8").unwrap();
        assert_eq!(store.get_setting("concurrency").unwrap().unwrap(), "8");
    }
}
