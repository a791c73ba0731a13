use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Protocol family of a download source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Http,
    Torrent,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Http => "http",
            SourceKind::Torrent => "torrent",
        }
    }
}

/// Decide the protocol family from the source string: magnet URIs and
/// `.torrent` paths/URLs go to the torrent adapter, everything else to the
/// HTTP engine.
pub fn detect_kind(source: &str) -> SourceKind {
    if source.starts_with("magnet:") || source.to_ascii_lowercase().ends_with(".torrent") {
        SourceKind::Torrent
    } else {
        SourceKind::Http
    }
}

/// Immutable per-download configuration, assembled from the CLI and the
/// state store's settings table. Field names are the snake_case keys used
/// when the record is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Maximum concurrent range workers (clamped to 1..=8).
    pub concurrency: usize,
    /// Lower bound on the size of one chunk, in bytes.
    pub chunk_size: u64,
    /// Download rate cap in bytes/sec; 0 means unlimited.
    pub limit: u64,
    /// Torrent upload rate cap in bytes/sec; 0 means unlimited.
    pub bt_upload_limit: u64,
    /// Advisory request for in-order torrent delivery; recorded but the
    /// engine owns piece scheduling.
    pub bt_sequential: bool,
    /// Keep seeding after the torrent completes.
    pub bt_keep_seeding: bool,
    /// TCP connect timeout in seconds.
    pub connect_timeout: u64,
    /// Socket read timeout in seconds; the worker deadline budget derives
    /// from this.
    pub read_timeout: u64,
    /// Per-chunk retry budget.
    pub retries: u32,
    /// Expected SHA-256 of the final artifact, hex, case-insensitive.
    pub sha256: Option<String>,
    /// Proxy URL applied to the HTTP client.
    pub proxy: Option<String>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            chunk_size: 1024 * 1024,
            limit: 0,
            bt_upload_limit: 0,
            bt_sequential: false,
            bt_keep_seeding: false,
            connect_timeout: 10,
            read_timeout: 30,
            retries: 5,
            sha256: None,
            proxy: None,
        }
    }
}

impl DownloadOptions {
    pub fn concurrency(&self) -> usize {
        self.concurrency.clamp(1, 8)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout.max(1))
    }
}

/// Identity and placement of one download, as handed to the engines.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub id: String,
    pub source: String,
    pub output: PathBuf,
    pub kind: SourceKind,
    pub options: DownloadOptions,
}

/// Parse a human byte size such as `4MB`, `512k`, `1.5GiB`, or a bare byte
/// count. Decimal and binary suffixes are both treated as powers of 1024,
/// matching what download tools conventionally mean by "4MB chunks".
pub fn parse_byte_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size".to_string());
    }
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| format!("invalid size number: {s:?}"))?;
    let multiplier: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        "t" | "tb" | "tib" => 1024u64.pow(4),
        other => return Err(format!("unknown size suffix: {other:?}")),
    };
    if value < 0.0 {
        return Err(format!("negative size: {s:?}"));
    }
    Ok((value * multiplier as f64).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_torrent_sources() {
        assert_eq!(detect_kind("magnet:?xt=urn:btih:abcd"), SourceKind::Torrent);
        assert_eq!(detect_kind("/tmp/ubuntu.torrent"), SourceKind::Torrent);
        assert_eq!(
            detect_kind("https://example.com/file.TORRENT"),
            SourceKind::Torrent
        );
        assert_eq!(detect_kind("https://example.com/file.iso"), SourceKind::Http);
    }

    #[test]
    fn parses_human_sizes() {
        assert_eq!(parse_byte_size("1048576").unwrap(), 1048576);
        assert_eq!(parse_byte_size("4MB").unwrap(), 4 * 1024 * 1024);
        assert_eq!(parse_byte_size("512k").unwrap(), 512 * 1024);
        assert_eq!(parse_byte_size("1.5GiB").unwrap(), 1610612736);
        assert_eq!(parse_byte_size(" 2 mb ").unwrap(), 2 * 1024 * 1024);
        assert!(parse_byte_size("abc").is_err());
        assert!(parse_byte_size("4XB").is_err());
        assert!(parse_byte_size("").is_err());
    }

    #[test]
    fn concurrency_is_clamped() {
        let mut opts = DownloadOptions::default();
        opts.concurrency = 0;
        assert_eq!(opts.concurrency(), 1);
        opts.concurrency = 64;
        assert_eq!(opts.concurrency(), 8);
    }
}
