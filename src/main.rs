// src/main.rs

use anyhow::{bail, Context, Result};
use clap::Parser;
use partfetch::prelude::*;
use partfetch::saver::temporary_path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Resumable multi-part HTTP downloader.
#[derive(Parser, Debug)]
#[command(name = "partfetch", version, about)]
struct Cli {
    /// URL of the resource to download.
    url: String,

    /// Destination file. Defaults to the last path segment of the URL.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of parts downloaded in parallel.
    #[arg(short = 'n', long, default_value_t = 4)]
    parts: usize,

    /// Largest chunk handed to observers, in bytes.
    #[arg(long, default_value_t = 4096)]
    buffer_size: usize,

    /// Milliseconds without data before an attempt counts as stalled.
    #[arg(long, default_value_t = 3000)]
    heartbeat_ms: u64,

    /// Milliseconds to wait before retrying a failed attempt.
    #[arg(long, default_value_t = 5000)]
    retry_delay_ms: u64,

    /// Retries per part before the part is restarted.
    #[arg(long, default_value_t = 5)]
    max_retries: u32,

    /// Restarts per part before the whole download stops.
    #[arg(long, default_value_t = 2)]
    max_part_restarts: u32,

    /// Speed limit in bytes per second.
    #[arg(long)]
    limit: Option<u64>,

    /// Where resume state is kept.
    #[arg(long, default_value = "partfetch.db")]
    state_db: PathBuf,

    /// Ignore any saved progress and start over.
    #[arg(long)]
    fresh: bool,
}

impl Cli {
    fn options(&self) -> DownloadOptions {
        DownloadOptions {
            number_of_parts: self.parts,
            buffer_size: self.buffer_size,
            heartbeat_timeout: Duration::from_millis(self.heartbeat_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_retries: self.max_retries,
            max_retry_download_parts: self.max_part_restarts,
            max_bytes_per_second: self.limit,
            ..Default::default()
        }
    }

    fn destination(&self) -> Result<PathBuf> {
        if let Some(output) = &self.output {
            return Ok(output.clone());
        }
        let name = reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|url| {
                url.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_owned))
            })
            .filter(|name| !name.is_empty())
            .context("cannot derive a file name from the URL, pass --output")?;
        Ok(PathBuf::from(name))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("partfetch=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = cli.options();
    let destination = cli.destination()?;

    let store = ResumeStore::new(&cli.state_db)
        .await
        .with_context(|| format!("opening state database {}", cli.state_db.display()))?;
    if cli.fresh && store.delete(&cli.url).await? {
        info!(url = %cli.url, "discarded saved progress");
    }

    let issuer: Arc<dyn RequestIssuer> = Arc::new(HttpRequestIssuer::new()?);
    let checker = ProbeRangeChecker::new(issuer.clone());
    let builder = ResumingDownloaderBuilder::new(options.retry_policy(), issuer);

    let previous = match store.load(&cli.url).await? {
        Some(record) if record.destination == destination => Some(record),
        Some(record) => {
            warn!(
                saved = %record.destination.display(),
                "saved progress belongs to another destination, starting over"
            );
            None
        }
        None => None,
    };
    let previous_total = previous.as_ref().map(|record| record.total_size);
    let previous_ranges = previous
        .map(|record| record.ranges)
        .filter(|_| temporary_path(&destination).exists());

    let download =
        MultiPartDownload::new(cli.url.clone(), &options, &builder, &checker, previous_ranges)
            .await?;

    // Saved ranges only describe the file they were saved for.
    let download = match previous_total {
        Some(total) if total != download.total_size() => {
            warn!(saved = total, actual = download.total_size(), "resource size changed, starting over");
            store.delete(&cli.url).await?;
            MultiPartDownload::new(cli.url.clone(), &options, &builder, &checker, None).await?
        }
        _ => download,
    };

    // A download without usable saved ranges must not inherit stale bytes.
    if download.downloaded_ranges().is_empty() {
        let _ = tokio::fs::remove_file(temporary_path(&destination)).await;
    }

    let total = download.total_size();
    let file = Arc::new(
        FileSaver::create(&destination, total)
            .await
            .with_context(|| format!("creating {}", destination.display()))?,
    );
    let speed = Arc::new(SpeedMonitor::new(options.sample_count));
    let progress = Arc::new(ProgressMonitor::new());
    let throttle = options
        .max_bytes_per_second
        .map(|rate| Arc::new(Throttling::with_window(rate, options.throttle_window)));

    download.attach(&file);
    download.attach(&speed);
    download.attach(&progress);
    if let Some(throttle) = &throttle {
        download.attach(throttle);
    }

    let store = Arc::new(store);

    // --- Periodic resume state saver ---
    let stop_saver = CancellationToken::new();
    let saver_handle = {
        let store = store.clone();
        let download = download.clone();
        let token = stop_saver.clone();
        let file = file.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {
                        if let Err(e) = store.checkpoint(&download, &file).await {
                            warn!("failed to save resume state: {}", e);
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        })
    };

    {
        let download = download.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                download.cancel();
            }
        });
    }

    info!(url = %cli.url, destination = %destination.display(), total, "starting download");
    download.start()?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let event = loop {
        tokio::select! {
            event = download.wait() => break event,
            _ = ticker.tick() => {
                let rate = speed.current_bytes_per_second();
                let remaining = total.saturating_sub(progress.progress_bytes());
                let eta = if rate > 0.0 {
                    format!("{:.0}s", remaining as f64 / rate)
                } else {
                    "-".to_string()
                };
                eprintln!(
                    "{:6.2}%  {}/{} KiB  {:.1} KiB/s  eta {}",
                    progress.progress_percentage(),
                    progress.progress_bytes() / 1024,
                    total / 1024,
                    rate / 1024.0,
                    eta
                );
            }
        }
    };

    stop_saver.cancel();
    let _ = saver_handle.await;
    download.detach_all();

    match event {
        DownloadEvent::Completed(_) => {
            let path = file.finish().await?;
            store.delete(&cli.url).await?;
            info!(path = %path.display(), "download complete");
            Ok(())
        }
        DownloadEvent::Cancelled(_) => {
            store.checkpoint(&download, &file).await?;
            info!("download cancelled, progress saved");
            Ok(())
        }
        DownloadEvent::Stopped { reason, .. } => {
            store.checkpoint(&download, &file).await?;
            bail!("download stopped: {}", reason)
        }
    }
}
