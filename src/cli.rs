use crate::options::{parse_byte_size, DownloadOptions};
use crate::speedtest::TestType;
use clap::Parser;
use std::path::PathBuf;

/// Command-line surface of the sidecar. Exactly one mode runs per
/// invocation: `--inspect`, `--http-info`, `--speedtest`, or (with none of
/// those flags) a download.
#[derive(Debug, Parser)]
#[command(name = "accelara")]
#[command(about = "Dual-protocol download engine: segmented HTTP plus BitTorrent", long_about = None)]
pub struct Cli {
    /// Inspect a torrent source and print its metadata as one JSON line.
    #[arg(long, conflicts_with_all = ["http_info", "speedtest"])]
    pub inspect: bool,

    /// Probe an HTTP URL and print header facts as one JSON line.
    #[arg(long, conflicts_with_all = ["inspect", "speedtest"])]
    pub http_info: bool,

    /// Run a network speed test, streaming JSON progress lines.
    #[arg(long, conflicts_with_all = ["inspect", "http_info"])]
    pub speedtest: bool,

    /// Which speed test to run.
    #[arg(long, value_enum, default_value = "full")]
    pub test_type: TestType,

    /// Download source: HTTP(S) URL, magnet URI, or path to a .torrent.
    #[arg(long)]
    pub source: Option<String>,

    /// Destination path (file for HTTP, directory root for torrents).
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Stable download identifier; generated when omitted.
    #[arg(long)]
    pub download_id: Option<String>,

    /// Parallel range connections (1-8).
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Minimum chunk size, human-readable (e.g. 4MB).
    #[arg(long, value_parser = parse_byte_size, default_value = "1MB")]
    pub chunk_size: u64,

    /// Download rate limit in bytes/sec (e.g. 2MB); unlimited when omitted.
    #[arg(long, value_parser = parse_byte_size)]
    pub limit: Option<u64>,

    /// Torrent upload rate limit in bytes/sec.
    #[arg(long, value_parser = parse_byte_size)]
    pub bt_upload_limit: Option<u64>,

    /// Request in-order delivery for torrent files. Advisory: the engine
    /// owns piece scheduling and exposes no priority levels.
    #[arg(long)]
    pub bt_sequential: bool,

    /// Keep seeding after the torrent completes.
    #[arg(long)]
    pub bt_keep_seeding: bool,

    /// TCP connect timeout in seconds.
    #[arg(long, default_value_t = 10)]
    pub connect_timeout: u64,

    /// Socket read timeout in seconds.
    #[arg(long, default_value_t = 30)]
    pub read_timeout: u64,

    /// Per-chunk retry budget.
    #[arg(long, default_value_t = 5)]
    pub retries: u32,

    /// Expected SHA-256 of the final artifact (hex, case-insensitive).
    #[arg(long)]
    pub sha256: Option<String>,

    /// Proxy URL for HTTP transfers.
    #[arg(long)]
    pub proxy: Option<String>,

    /// State database path; defaults to the per-user data directory.
    #[arg(long)]
    pub state_db: Option<PathBuf>,
}

impl Cli {
    pub fn to_options(&self) -> DownloadOptions {
        DownloadOptions {
            concurrency: self.concurrency,
            chunk_size: self.chunk_size,
            limit: self.limit.unwrap_or(0),
            bt_upload_limit: self.bt_upload_limit.unwrap_or(0),
            bt_sequential: self.bt_sequential,
            bt_keep_seeding: self.bt_keep_seeding,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            retries: self.retries,
            sha256: self.sha256.clone(),
            proxy: self.proxy.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_mode_flags_parse() {
        let cli = Cli::parse_from([
            "accelara",
            "--source",
            "https://example.com/file.iso",
            "--output",
            "/tmp/file.iso",
            "--download-id",
            "d1",
            "--concurrency",
            "6",
            "--chunk-size",
            "4MB",
            "--limit",
            "2MB",
            "--bt-sequential",
            "--retries",
            "3",
        ]);
        assert_eq!(cli.source.as_deref(), Some("https://example.com/file.iso"));
        assert_eq!(cli.download_id.as_deref(), Some("d1"));
        let opts = cli.to_options();
        assert_eq!(opts.concurrency, 6);
        assert_eq!(opts.chunk_size, 4 * 1024 * 1024);
        assert_eq!(opts.limit, 2 * 1024 * 1024);
        assert!(opts.bt_sequential);
        assert_eq!(opts.retries, 3);
    }

    #[test]
    fn inspect_mode_parses() {
        let cli = Cli::parse_from(["accelara", "--inspect", "--source", "/tmp/a.torrent"]);
        assert!(cli.inspect);
        assert!(!cli.http_info);
    }

    #[test]
    fn mode_flags_conflict() {
        assert!(Cli::try_parse_from(["accelara", "--inspect", "--speedtest"]).is_err());
    }

    #[test]
    fn speedtest_type_parses() {
        let cli = Cli::parse_from(["accelara", "--speedtest", "--test-type", "latency"]);
        assert_eq!(cli.test_type, TestType::Latency);
    }
}
