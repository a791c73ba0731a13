//! One-shot inspection modes: torrent metadata (`--inspect`) and HTTP
//! header discovery (`--http-info`). Each prints a single JSON object on
//! stdout.

use crate::error::DownloadError;
use crate::options::DownloadOptions;
use crate::probe;
use librqbit::api::TorrentIdOrHash;
use librqbit::{AddTorrent, AddTorrentOptions, Session};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Metadata wait budget for magnet inspection.
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
pub struct InspectFile {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectReport {
    pub name: String,
    pub total_size: u64,
    pub file_count: usize,
    pub files: Vec<InspectFile>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpInfoReport {
    pub file_name: String,
    pub total_size: u64,
    pub content_type: Option<String>,
    pub accept_ranges: bool,
}

/// Inspect a torrent source without downloading payload data.
///
/// Magnets briefly join the swarm with every file deselected, wait for the
/// info dictionary, and leave again; `.torrent` files and URLs are parsed
/// in list-only mode.
pub async fn inspect(source: &str) -> Result<InspectReport, DownloadError> {
    let session_dir = std::env::temp_dir().join("accelara-inspect");
    tokio::fs::create_dir_all(&session_dir)
        .await
        .map_err(|e| DownloadError::TorrentEngine(e.to_string()))?;
    let session = Session::new(session_dir)
        .await
        .map_err(|e| DownloadError::TorrentEngine(e.to_string()))?;

    let report = if source.starts_with("magnet:") {
        inspect_magnet(&session, source).await
    } else {
        let bytes = if source.starts_with("http://") || source.starts_with("https://") {
            reqwest::get(source)
                .await
                .map_err(|e| DownloadError::Unreachable(e.to_string()))?
                .bytes()
                .await
                .map_err(|e| DownloadError::Unreachable(e.to_string()))?
                .to_vec()
        } else {
            tokio::fs::read(source)
                .await
                .map_err(|e| DownloadError::SourceInvalid(format!("{source}: {e}")))?
        };
        inspect_bytes(&session, bytes).await
    };

    let _ = tokio::time::timeout(Duration::from_secs(2), session.stop()).await;
    report
}

async fn inspect_magnet(
    session: &Arc<Session>,
    magnet: &str,
) -> Result<InspectReport, DownloadError> {
    let options = AddTorrentOptions {
        output_folder: Some(std::env::temp_dir().to_string_lossy().to_string()),
        only_files: Some(vec![]),
        overwrite: true,
        ..Default::default()
    };
    let response = session
        .add_torrent(AddTorrent::from_url(magnet.to_string()), Some(options))
        .await
        .map_err(|e| DownloadError::BadMetainfo(e.to_string()))?;
    let handle = response
        .into_handle()
        .ok_or_else(|| DownloadError::TorrentEngine("no torrent handle".into()))?;

    let start = Instant::now();
    loop {
        let result = handle.with_metadata(|m| {
            let files: Vec<InspectFile> = m
                .file_infos
                .iter()
                .map(|f| InspectFile {
                    path: f.relative_filename.to_string_lossy().to_string(),
                    size: f.len,
                })
                .collect();
            InspectReport {
                name: m.name.clone().unwrap_or_default(),
                total_size: files.iter().map(|f| f.size).sum(),
                file_count: files.len(),
                files,
            }
        });
        match result {
            Ok(report) => {
                let _ = session
                    .delete(TorrentIdOrHash::Hash(handle.info_hash()), false)
                    .await;
                return Ok(report);
            }
            Err(_) => {
                if start.elapsed() > METADATA_TIMEOUT {
                    return Err(DownloadError::Timeout(
                        "timed out waiting for magnet metadata".into(),
                    ));
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

async fn inspect_bytes(
    session: &Arc<Session>,
    bytes: Vec<u8>,
) -> Result<InspectReport, DownloadError> {
    let options = AddTorrentOptions {
        list_only: true,
        ..Default::default()
    };
    let response = session
        .add_torrent(AddTorrent::from_bytes(bytes), Some(options))
        .await
        .map_err(|e| DownloadError::BadMetainfo(e.to_string()))?;
    match response {
        librqbit::AddTorrentResponse::ListOnly(list) => {
            let info = &list.info;
            let name = info
                .name
                .as_ref()
                .map(|n| String::from_utf8_lossy(n.as_ref()).to_string())
                .unwrap_or_default();
            let files: Vec<InspectFile> = match &info.files {
                Some(files) => files
                    .iter()
                    .map(|f| InspectFile {
                        path: f
                            .path
                            .iter()
                            .map(|seg| String::from_utf8_lossy(seg.as_ref()).to_string())
                            .collect::<Vec<_>>()
                            .join("/"),
                        size: f.length,
                    })
                    .collect(),
                None => vec![InspectFile {
                    path: name.clone(),
                    size: info.length.unwrap_or(0),
                }],
            };
            Ok(InspectReport {
                name,
                total_size: files.iter().map(|f| f.size).sum(),
                file_count: files.len(),
                files,
            })
        }
        _ => Err(DownloadError::TorrentEngine(
            "expected a list-only response".into(),
        )),
    }
}

/// Probe a URL and report the header-level facts the shell needs before
/// queueing a download.
pub async fn http_info(url: &str) -> Result<HttpInfoReport, DownloadError> {
    let options = DownloadOptions::default();
    let client = probe::build_client(&options)?;
    let probed = probe::probe(&client, url).await?;
    Ok(HttpInfoReport {
        file_name: probed.file_name.unwrap_or_else(|| "download".to_string()),
        total_size: probed.total_size,
        content_type: probed.content_type,
        accept_ranges: probed.supports_ranges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspect_report_uses_camel_case_keys() {
        let report = InspectReport {
            name: "pack".into(),
            total_size: 400,
            file_count: 2,
            files: vec![
                InspectFile {
                    path: "pack/a.bin".into(),
                    size: 100,
                },
                InspectFile {
                    path: "pack/b.bin".into(),
                    size: 300,
                },
            ],
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&report).unwrap()).unwrap();
        assert_eq!(value["totalSize"], 400);
        assert_eq!(value["fileCount"], 2);
        assert_eq!(value["files"][1]["path"], "pack/b.bin");
    }

    #[test]
    fn http_info_report_uses_camel_case_keys() {
        let report = HttpInfoReport {
            file_name: "file.iso".into(),
            total_size: 10_485_760,
            content_type: Some("application/octet-stream".into()),
            accept_ranges: true,
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&report).unwrap()).unwrap();
        assert_eq!(value["fileName"], "file.iso");
        assert_eq!(value["totalSize"], 10_485_760);
        assert_eq!(value["acceptRanges"], true);
    }
}
