//! channel-mirror: mirror media attachments from a channel feed into a
//! durable storage tree.
//!
//! Items are transferred strictly one at a time: downloaded into a local
//! staging area with rate-limit and timeout resilience, then relocated into
//! the destination with size and checksum verification. Runs are resumable:
//! files already present in the destination are skipped.

#![warn(clippy::all)]

mod cli;
mod config;
mod download;
mod feed;
mod media;
mod mirror;
mod progress;
mod relocate;
mod render;
mod resume;
mod retry;
mod shutdown;
mod storage;
#[cfg(test)]
mod testutil;
mod types;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

use feed::http::HttpFeedClient;
use feed::FeedClient;
use mirror::{Mirror, RunOutcome, RunReport, TransferOutcome};
use progress::{format_duration, format_size, ChannelSink};
use render::Renderer;
use storage::LocalStorage;

/// Print the channels the token can read.
async fn run_list_channels(feed: Arc<HttpFeedClient>) -> anyhow::Result<()> {
    let channels = tokio::task::spawn_blocking(move || feed.list_channels())
        .await
        .context("channel listing task panicked")?
        .context("failed to list channels")?;

    if channels.is_empty() {
        println!("No accessible channels.");
        return Ok(());
    }
    println!("Channels:");
    for channel in channels {
        println!(
            "  {:>16}  {}  {}",
            channel.id,
            channel.title,
            channel.username.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// Remove leftover regular files from the staging directory.
fn cleanup_staging(dir: &Path) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            tracing::warn!("Could not read staging directory {}: {}", dir.display(), e);
            return 0;
        }
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        if !entry.file_type().is_ok_and(|t| t.is_file()) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!("Could not remove {}: {}", entry.path().display(), e),
        }
    }
    if removed > 0 {
        tracing::info!("Removed {} leftover files from {}", removed, dir.display());
    }
    removed
}

fn print_summary(report: &RunReport) {
    let stats = &report.stats;
    println!();
    match report.outcome {
        RunOutcome::Finished => println!("Mirror complete: {}", report.channel.title),
        RunOutcome::Cancelled => println!("Mirror cancelled: {}", report.channel.title),
    }
    println!("  Downloaded: {}", stats.downloaded);
    println!("  Skipped:    {}", stats.skipped);
    println!("  Failed:     {}", stats.failed);
    println!("  Total size: {}", format_size(Some(stats.total_bytes)));
    println!("  Elapsed:    {}", format_duration(stats.elapsed()));

    for item in &report.items {
        match &item.outcome {
            TransferOutcome::Completed { bytes, path } => {
                tracing::debug!("{} -> {} ({} bytes)", item.filename, path.display(), bytes)
            }
            TransferOutcome::Skipped { existing_size } => {
                tracing::debug!("{} kept ({})", item.filename, format_size(*existing_size))
            }
            TransferOutcome::Failed { .. } => {}
        }
    }

    let failures: Vec<_> = report
        .items
        .iter()
        .filter_map(|item| match &item.outcome {
            TransferOutcome::Failed { stage, reason } => Some((item, stage, reason)),
            _ => None,
        })
        .collect();
    if !failures.is_empty() {
        println!();
        println!("Failed items:");
        for (item, stage, reason) in failures {
            println!("  - {} [{}] ({}): {}", item.filename, item.id, stage, reason);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    let config = config::Config::from_cli(cli)?;
    tracing::debug!(?config, "Starting channel-mirror");

    let feed = Arc::new(
        HttpFeedClient::new(&config.feed_url, config.api_token.clone(), Handle::current())
            .context("failed to set up feed client")?,
    );

    if config.list_channels {
        return run_list_channels(feed).await;
    }

    let (identity, mirror_config) = config.mirror_target()?;
    let shutdown_token = shutdown::install_signal_handler()?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let renderer = Renderer::new(config.no_progress_bar);
    let render_task = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            renderer.apply(&update);
        }
    });

    tracing::info!(
        "Mirroring {} into {}",
        identity,
        mirror_config.destination_dir.display()
    );
    let worker = {
        let feed = Arc::clone(&feed);
        let token = shutdown_token.clone();
        tokio::task::spawn_blocking(move || {
            let sink = ChannelSink::new(tx);
            Mirror::new(&*feed, &LocalStorage, &mirror_config, &sink, &token).run(&identity)
        })
    };
    let result = worker.await.context("mirror worker panicked")?;
    // The sink is dropped with the worker, which closes the channel
    if let Err(e) = render_task.await {
        tracing::warn!("Progress renderer stopped: {}", e);
    }

    if !config.keep_staging {
        cleanup_staging(&config.staging_dir);
    }

    let report = result.context("mirror run failed")?;
    print_summary(&report);

    if report.outcome == RunOutcome::Cancelled {
        tracing::info!("Shutdown requested, exiting...");
    }
    if report.stats.failed > 0 {
        anyhow::bail!("{} items failed", report.stats.failed);
    }
    Ok(())
}
