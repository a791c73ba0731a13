//! Accelara download engine - library root.
//!
//! A dual-protocol download engine that materializes a remote resource
//! (HTTP/HTTPS URL, magnet link, or `.torrent` file) on local disk with
//! resume, integrity verification, and bounded concurrency.
//!
//! Subsystems:
//! - **Supervisor (`supervisor`)**: dispatches on the source kind and owns
//!   the download lifecycle.
//! - **Downloader (`downloader`)**: multi-connection segmented HTTP engine
//!   with single-stream fallback.
//! - **Prober (`probe`)**: HEAD/ranged-GET discovery of size, range
//!   support, and the resolved URL.
//! - **Torrent (`torrent`)**: BitTorrent support via `librqbit`.
//! - **Status (`status`)**: the JSON-lines progress stream.
//! - **Store (`store`)**: SQLite persistence for resumable state.

pub mod cli;
pub mod control;
pub mod downloader;
pub mod error;
pub mod inspect;
pub mod logging;
pub mod options;
pub mod probe;
pub mod speedtest;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod torrent;
pub mod verify;

pub use error::DownloadError;
pub use options::{DownloadOptions, DownloadRequest, SourceKind};
pub use status::{DownloadStatus, Reporter, StatusEvent, StatusRecord};
pub use store::StateStore;
pub use supervisor::Supervisor;
