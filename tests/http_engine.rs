//! End-to-end tests for the HTTP engine against a minimal in-process
//! server: a segmented run assembling byte-identical output, the
//! single-stream fallback when the server ignores ranges, and the
//! checksum preflight short-circuit.

use accelara::downloader::HttpEngine;
use accelara::options::{DownloadOptions, DownloadRequest, SourceKind};
use accelara::status::Reporter;
use sha2::{Digest, Sha256};
use std::io::Write as _;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Writer handing every status line to a shared buffer for assertions.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn records(buf: &SharedBuf) -> Vec<serde_json::Value> {
    String::from_utf8(buf.0.lock().unwrap().clone())
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn test_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Serve `data` over bare HTTP/1.1. `honor_ranges` controls whether a
/// `Range` header gets a 206 slice or the full body with a 200.
async fn spawn_server(data: Vec<u8>, honor_ranges: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let data = Arc::new(data);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let data = data.clone();
            tokio::spawn(async move {
                let _ = handle_conn(stream, &data, honor_ranges).await;
            });
        }
    });
    format!("http://{addr}/file.bin")
}

async fn handle_conn(
    mut stream: tokio::net::TcpStream,
    data: &[u8],
    honor_ranges: bool,
) -> std::io::Result<()> {
    let mut request = Vec::new();
    let mut byte = [0u8; 1];
    while !request.ends_with(b"\r\n\r\n") {
        if stream.read_exact(&mut byte).await.is_err() {
            return Ok(());
        }
        request.push(byte[0]);
        if request.len() > 16 * 1024 {
            return Ok(());
        }
    }
    let request = String::from_utf8_lossy(&request).to_string();
    let method = request.split_whitespace().next().unwrap_or("").to_string();
    let range = request
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("range:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| parse_range(v.trim(), data.len() as u64));

    let total = data.len();
    match (method.as_str(), range, honor_ranges) {
        ("HEAD", _, _) => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n"
            );
            stream.write_all(head.as_bytes()).await?;
        }
        ("GET", Some((start, end)), true) => {
            let body = &data[start as usize..=end as usize];
            let head = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {start}-{end}/{total}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(body).await?;
        }
        ("GET", _, _) => {
            // Either no range was asked, or the server ignores ranges.
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nConnection: close\r\n\r\n"
            );
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(data).await?;
        }
        _ => {
            stream
                .write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await?;
        }
    }
    stream.shutdown().await.ok();
    Ok(())
}

fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let expr = value.strip_prefix("bytes=")?;
    let (start, end) = expr.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        total - 1
    } else {
        end.parse().ok()?
    };
    (start <= end && end < total).then_some((start, end))
}

fn request_for(url: String, output: std::path::PathBuf, options: DownloadOptions) -> DownloadRequest {
    DownloadRequest {
        id: "test".to_string(),
        source: url,
        output,
        kind: SourceKind::Http,
        options,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn segmented_download_assembles_identical_bytes() {
    let payload = test_payload(256 * 1024);
    let url = spawn_server(payload.clone(), true).await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("file.bin");
    let mut options = DownloadOptions::default();
    options.concurrency = 4;
    options.chunk_size = 32 * 1024;

    let buf = SharedBuf::default();
    let reporter = Arc::new(Reporter::new(Box::new(buf.clone())));
    let (_handle, control) = accelara::control::channel();
    let mut engine = HttpEngine::new(&request_for(url, output.clone(), options), reporter, None)
        .unwrap();
    engine.run(control).await.unwrap();

    let downloaded = std::fs::read(&output).unwrap();
    assert_eq!(sha256_hex(&downloaded), sha256_hex(&payload));

    let events = records(&buf);
    let terminal = events.last().unwrap();
    assert_eq!(terminal["type"], "http");
    assert_eq!(terminal["status"], "completed");
    assert_eq!(terminal["progress"], 1.0);
    assert_eq!(terminal["downloaded"], 256 * 1024);
    assert_eq!(terminal["total"], 256 * 1024);
    assert_eq!(terminal["verify_status"], "size_verified");
    assert_eq!(terminal["chunk_count"], 4);

    // The temp directory is gone on success.
    assert!(!dir.path().join(".accelara-temp-file.bin").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn range_ignoring_server_falls_back_to_single_stream() {
    let payload = test_payload(200 * 1024);
    let url = spawn_server(payload.clone(), false).await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("file.bin");
    let mut options = DownloadOptions::default();
    options.concurrency = 4;
    options.chunk_size = 32 * 1024;

    let buf = SharedBuf::default();
    let reporter = Arc::new(Reporter::new(Box::new(buf.clone())));
    let (_handle, control) = accelara::control::channel();
    let mut engine = HttpEngine::new(&request_for(url, output.clone(), options), reporter, None)
        .unwrap();
    engine.run(control).await.unwrap();

    assert_eq!(std::fs::read(&output).unwrap(), payload);

    let events = records(&buf);
    let terminal = events.last().unwrap();
    assert_eq!(terminal["status"], "completed");
    assert_eq!(terminal["total"], 200 * 1024);
    // Single-stream terminal records carry no chunk plan.
    assert!(terminal.get("chunk_count").is_none());
}

#[tokio::test]
async fn matching_checksum_short_circuits_without_network() {
    let payload = test_payload(64 * 1024);
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("file.bin");
    std::fs::File::create(&output)
        .unwrap()
        .write_all(&payload)
        .unwrap();

    let mut options = DownloadOptions::default();
    options.sha256 = Some(sha256_hex(&payload).to_uppercase());

    // A dead endpoint: the preflight must finish before any probe.
    let url = "http://127.0.0.1:9/file.bin".to_string();
    let buf = SharedBuf::default();
    let reporter = Arc::new(Reporter::new(Box::new(buf.clone())));
    let (_handle, control) = accelara::control::channel();
    let mut engine =
        HttpEngine::new(&request_for(url, output.clone(), options), reporter, None).unwrap();
    engine.run(control).await.unwrap();

    let events = records(&buf);
    let terminal = events.last().unwrap();
    assert_eq!(terminal["status"], "completed");
    assert_eq!(terminal["verify_status"], "checksum_verified");
    assert_eq!(terminal["verified"], true);
    assert_eq!(terminal["progress"], 1.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interrupted_download_resumes_byte_identical() {
    let payload = test_payload(256 * 1024);
    let url = spawn_server(payload.clone(), true).await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("file.bin");
    let mut options = DownloadOptions::default();
    options.concurrency = 4;
    options.chunk_size = 32 * 1024;

    // Simulate an interrupted prior run: one part file already holds the
    // first half of chunk 0 (chunk size is 64 KiB for this plan).
    let temp = dir.path().join(".accelara-temp-file.bin");
    std::fs::create_dir_all(&temp).unwrap();
    std::fs::write(
        temp.join("file.bin.part.0.65535"),
        &payload[..32 * 1024],
    )
    .unwrap();

    let buf = SharedBuf::default();
    let reporter = Arc::new(Reporter::new(Box::new(buf.clone())));
    let (_handle, control) = accelara::control::channel();
    let mut engine = HttpEngine::new(&request_for(url, output.clone(), options), reporter, None)
        .unwrap();
    engine.run(control).await.unwrap();

    // Byte-identical to an uninterrupted run of the same source.
    let downloaded = std::fs::read(&output).unwrap();
    assert_eq!(sha256_hex(&downloaded), sha256_hex(&payload));
}
