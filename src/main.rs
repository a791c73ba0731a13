use accelara::cli::Cli;
use accelara::control;
use accelara::error::DownloadError;
use accelara::status::Reporter;
use accelara::store::StateStore;
use accelara::supervisor::Supervisor;
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    accelara::logging::init();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            // Clean pause and user cancellation are not failures.
            match e.downcast_ref::<DownloadError>() {
                Some(DownloadError::Paused(_)) | Some(DownloadError::Cancelled) => 0,
                _ => {
                    eprintln!("error: {e:#}");
                    1
                }
            }
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    if cli.inspect {
        let source = cli.source.as_deref().context("--inspect requires --source")?;
        let report = accelara::inspect::inspect(source).await?;
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }
    if cli.http_info {
        let source = cli
            .source
            .as_deref()
            .context("--http-info requires --source")?;
        let report = accelara::inspect::http_info(source).await?;
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }
    if cli.speedtest {
        accelara::speedtest::run(cli.test_type).await?;
        return Ok(());
    }

    // Download mode.
    let Some(source) = cli.source.clone() else {
        bail!("--source is required");
    };
    let Some(output) = cli.output.clone() else {
        bail!("--output is required");
    };
    let id = cli
        .download_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let state_db = cli.state_db.clone().or_else(default_state_db);
    let store = match &state_db {
        Some(path) => match StateStore::open(path) {
            Ok(store) => Some(store),
            Err(e) => {
                tracing::warn!(error = %e, "state store unavailable; running without resume persistence");
                None
            }
        },
        None => None,
    };
    let session_dir = state_db
        .as_deref()
        .and_then(|p| p.parent())
        .map(|p| p.join("torrent-session"))
        .unwrap_or_else(|| std::env::temp_dir().join("accelara-session"));

    let reporter = Arc::new(Reporter::stdout());
    let supervisor = Supervisor::new(store, reporter, session_dir);

    let options = supervisor.effective_options(cli.to_options());
    let request = supervisor.create(&id, &source, &output, &options)?;

    // The invocation itself is the explicit resume; cancel on Ctrl-C (the
    // second signal kills the process outright).
    let (handle, control_rx) = control::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            handle.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });

    supervisor.resume(&request, control_rx).await?;
    Ok(())
}

fn default_state_db() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "accelara")
        .map(|dirs| dirs.data_dir().join("accelara.db"))
}
