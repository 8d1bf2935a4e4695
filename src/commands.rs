use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use tokio::fs;
use tracing::info;

use crate::cli::ResumeMode;
use crate::downloader::{part_path_for, Engine, EngineConfig};
use crate::error::DownloadError;
use crate::protocol::{strategy_for, Probe};
use crate::source::DownloadSource;
use crate::state::StateLedger;
use crate::utils::sanitize_filename;

const MAX_REDIRECTS: usize = 5;

pub struct RunOptions {
    pub url: String,
    pub output_dir: PathBuf,
    pub file_name: Option<String>,
    pub connections: usize,
    pub resume: ResumeMode,
    pub rate_limit: Option<u32>,
    pub timeout: Duration,
    pub retries: u32,
    pub proxy: Option<SocketAddr>,
    pub user: Option<String>,
    pub password: Option<String>,
}

pub async fn run(opts: RunOptions) -> Result<()> {
    let (source, file_length) = resolve_and_discover(&opts).await?;

    if !opts.output_dir.exists() {
        fs::create_dir_all(&opts.output_dir)
            .await
            .context("Failed to create output directory")?;
    }

    let name = opts
        .file_name
        .clone()
        .unwrap_or_else(|| sanitize_filename(&source.file_name));
    let output = opts.output_dir.join(&name);
    if output.exists() {
        println!("Skipping    {name} (already exists)");
        return Ok(());
    }

    let ledger = StateLedger::for_output(&part_path_for(&output));
    let resume = match opts.resume {
        ResumeMode::Auto => ledger.available(),
        ResumeMode::Always => {
            if !ledger.available() {
                bail!("No resumable state found for {name}");
            }
            true
        }
        ResumeMode::Never => {
            ledger.remove().await.ok();
            false
        }
    };

    info!(
        url = %source.url,
        size = file_length,
        connections = opts.connections,
        resume,
        "starting download"
    );
    println!(
        "File size: {} ({file_length} bytes){}",
        HumanBytes(file_length),
        if resume { ", resuming" } else { "" }
    );

    let pb = ProgressBar::new(file_length);
    pb.set_style(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}")
        .unwrap()
        .progress_chars("=>-"));
    pb.set_message(format!("Downloading {name}"));

    let config = EngineConfig {
        connections: opts.connections,
        resume,
        rate_limit: opts.rate_limit.and_then(NonZeroU32::new),
        timeout: opts.timeout,
        retry_limit: opts.retries,
        ..Default::default()
    };
    let mut engine = Engine::new(source, file_length, &output, config);
    {
        let pb = pb.clone();
        engine.on_progress(move |total, _speed| {
            pb.set_position(total.min(file_length));
        });
    }

    let mut handle = engine.start();
    tokio::select! {
        result = handle.join() => match result {
            Ok(()) => {
                pb.finish_with_message(format!("Completed   {name}"));
                Ok(())
            }
            Err(e @ DownloadError::CorruptState(_)) => {
                pb.abandon_with_message(format!("Failed      {name}"));
                Err(e).context("Stored state is unusable; rerun with --resume never to start over")
            }
            Err(e) => {
                pb.abandon_with_message(format!("Failed      {name}"));
                Err(e).context("Download failed; progress was kept for a later resume")
            }
        },
        _ = tokio::signal::ctrl_c() => {
            handle.abort();
            pb.abandon_with_message(format!("Interrupted {name} (resumable)"));
            Ok(())
        }
    }
}

/// Resolve the URL and probe the remote for its size, following redirects.
async fn resolve_and_discover(opts: &RunOptions) -> Result<(DownloadSource, u64)> {
    let mut url = opts.url.clone();
    for _ in 0..MAX_REDIRECTS {
        let mut source = DownloadSource::resolve(&url).await?;
        source.proxy = opts.proxy;
        if let Some(user) = &opts.user {
            source.username = user.clone();
        }
        if let Some(password) = &opts.password {
            source.password = password.clone();
        }

        let strategy = strategy_for(source.protocol);
        match strategy.discover(&source).await? {
            Probe::Size(len) => return Ok((source, len)),
            Probe::Redirect(next) => {
                info!(from = %url, to = %next, "following redirect");
                url = next;
            }
        }
    }
    Err(DownloadError::RedirectLoop.into())
}
