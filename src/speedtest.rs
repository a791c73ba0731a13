//! Network speed measurement against a public endpoint, streamed as JSON
//! progress lines for the shell's speed-test panel.

use crate::error::{classify_reqwest, DownloadError};
use futures::StreamExt;
use serde::Serialize;
use std::time::{Duration, Instant};

const ENDPOINT_DOWN: &str = "https://speed.cloudflare.com/__down";
const ENDPOINT_UP: &str = "https://speed.cloudflare.com/__up";

const LATENCY_SAMPLES: usize = 5;
const DOWNLOAD_BYTES: u64 = 25 * 1024 * 1024;
const UPLOAD_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TestType {
    Full,
    Latency,
    Download,
    Upload,
}

#[derive(Debug, Serialize)]
struct SpeedtestRecord {
    #[serde(rename = "type")]
    kind: &'static str,
    test: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<f64>,
}

impl SpeedtestRecord {
    fn new(test: &'static str, status: &'static str) -> Self {
        Self {
            kind: "speedtest",
            test,
            status,
            latency_ms: None,
            bytes: None,
            speed: None,
            progress: None,
        }
    }
}

fn emit(record: &SpeedtestRecord) {
    if let Ok(line) = serde_json::to_string(record) {
        println!("{line}");
    }
}

/// Run the requested measurement and stream progress lines on stdout.
pub async fn run(test_type: TestType) -> Result<(), DownloadError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| DownloadError::Unreachable(e.to_string()))?;

    match test_type {
        TestType::Latency => latency(&client).await.map(|_| ()),
        TestType::Download => download(&client).await.map(|_| ()),
        TestType::Upload => upload(&client).await.map(|_| ()),
        TestType::Full => {
            latency(&client).await?;
            download(&client).await?;
            upload(&client).await?;
            Ok(())
        }
    }
}

async fn latency(client: &reqwest::Client) -> Result<f64, DownloadError> {
    let mut samples = Vec::with_capacity(LATENCY_SAMPLES);
    for _ in 0..LATENCY_SAMPLES {
        let started = Instant::now();
        client
            .get(format!("{ENDPOINT_DOWN}?bytes=0"))
            .send()
            .await
            .map_err(|e| classify_reqwest(&e))?
            .error_for_status()
            .map_err(|e| DownloadError::BadStatus(e.status().map(|s| s.as_u16()).unwrap_or(0)))?;
        let sample = started.elapsed().as_secs_f64() * 1000.0;
        samples.push(sample);

        let mut record = SpeedtestRecord::new("latency", "running");
        record.latency_ms = Some(sample);
        emit(&record);
    }
    samples.sort_by(|a, b| a.total_cmp(b));
    let median = samples[samples.len() / 2];
    let mut record = SpeedtestRecord::new("latency", "done");
    record.latency_ms = Some(median);
    emit(&record);
    Ok(median)
}

async fn download(client: &reqwest::Client) -> Result<u64, DownloadError> {
    let response = client
        .get(format!("{ENDPOINT_DOWN}?bytes={DOWNLOAD_BYTES}"))
        .send()
        .await
        .map_err(|e| classify_reqwest(&e))?;
    if !response.status().is_success() {
        return Err(DownloadError::BadStatus(response.status().as_u16()));
    }

    let started = Instant::now();
    let mut received = 0u64;
    let mut last_emit = Instant::now();
    let mut stream = response.bytes_stream();
    while let Some(item) = stream.next().await {
        let bytes = item.map_err(|e| classify_reqwest(&e))?;
        received += bytes.len() as u64;
        if last_emit.elapsed() >= Duration::from_millis(200) {
            last_emit = Instant::now();
            let elapsed = started.elapsed().as_secs_f64();
            let mut record = SpeedtestRecord::new("download", "running");
            record.bytes = Some(received);
            record.speed = Some((received as f64 / elapsed.max(0.001)) as u64);
            record.progress = Some((received as f64 / DOWNLOAD_BYTES as f64).clamp(0.0, 1.0));
            emit(&record);
        }
    }
    let elapsed = started.elapsed().as_secs_f64();
    let speed = (received as f64 / elapsed.max(0.001)) as u64;
    let mut record = SpeedtestRecord::new("download", "done");
    record.bytes = Some(received);
    record.speed = Some(speed);
    record.progress = Some(1.0);
    emit(&record);
    Ok(speed)
}

async fn upload(client: &reqwest::Client) -> Result<u64, DownloadError> {
    let payload = vec![0u8; UPLOAD_BYTES];
    let started = Instant::now();
    client
        .post(ENDPOINT_UP)
        .body(payload)
        .send()
        .await
        .map_err(|e| classify_reqwest(&e))?
        .error_for_status()
        .map_err(|e| DownloadError::BadStatus(e.status().map(|s| s.as_u16()).unwrap_or(0)))?;
    let elapsed = started.elapsed().as_secs_f64();
    let speed = (UPLOAD_BYTES as f64 / elapsed.max(0.001)) as u64;
    let mut record = SpeedtestRecord::new("upload", "done");
    record.bytes = Some(UPLOAD_BYTES as u64);
    record.speed = Some(speed);
    emit(&record);
    Ok(speed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_shape() {
        let mut record = SpeedtestRecord::new("download", "running");
        record.bytes = Some(1024);
        record.speed = Some(2048);
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&record).unwrap()).unwrap();
        assert_eq!(value["type"], "speedtest");
        assert_eq!(value["test"], "download");
        assert_eq!(value["status"], "running");
        assert_eq!(value["speed"], 2048);
        assert!(value.get("latency_ms").is_none());
    }
}
