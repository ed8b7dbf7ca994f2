use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::{print_json, spinner, spinner_hook, OutputFormat, Workspace};
use codeatlas::indexer::watcher::{BatchSink, WatchQueue};
use codeatlas::indexer::RunStats;

pub async fn init(workspace: &Workspace, format: OutputFormat) -> Result<()> {
    let pb = spinner("Scanning project...");
    let (coordinator, _) = workspace.coordinator(Some(spinner_hook(&pb)))?;
    let stats = coordinator.full().await.context("Indexing failed")?;
    pb.finish_and_clear();
    report(&stats, format)
}

pub async fn update(
    workspace: &Workspace,
    paths: Vec<String>,
    full: bool,
    format: OutputFormat,
) -> Result<()> {
    let pb = spinner("Checking for changes...");
    let (coordinator, _) = workspace.coordinator(Some(spinner_hook(&pb)))?;
    let stats = if !paths.is_empty() {
        coordinator.run_paths(&paths).await
    } else if full {
        coordinator.full().await
    } else {
        coordinator.incremental().await
    }
    .context("Update failed")?;
    pb.finish_and_clear();
    report(&stats, format)
}

pub async fn optimize(workspace: &Workspace) -> Result<()> {
    let pb = spinner("Optimizing index...");
    let (coordinator, _) = workspace.coordinator(None)?;
    let before = workspace.store.stats()?.db_size_bytes;
    coordinator.optimize().await.context("Optimize failed")?;
    let after = workspace.store.stats()?.db_size_bytes;
    pb.finish_and_clear();

    println!(
        "Optimized {}: {:.2} MB -> {:.2} MB",
        workspace.paths.db_path.display(),
        megabytes(before),
        megabytes(after)
    );
    Ok(())
}

pub async fn watch(workspace: &Workspace) -> Result<()> {
    let (coordinator, tree) = workspace.coordinator(None)?;

    let stats = coordinator.incremental().await.context("Initial update failed")?;
    report(&stats, OutputFormat::Text)?;

    let sink: Arc<dyn BatchSink> = coordinator.clone();
    let queue = WatchQueue::watch(sink, &workspace.config.watch, tree)?;
    let mut updates = queue.subscribe();

    println!("Watching {} (Ctrl+C to stop)", workspace.paths.root.display());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping watcher");
                queue.flush().await?;
                break;
            }
            update = updates.recv() => match update {
                Ok(update) => match (update.stats, update.error) {
                    (Some(stats), _) => println!(
                        "Updated {} path(s): {} indexed, {} deleted, {} failed",
                        update.paths.len(),
                        stats.indexed,
                        stats.deleted,
                        stats.failed
                    ),
                    (None, Some(error)) => warn!("Update of {} path(s) failed: {}", update.paths.len(), error),
                    (None, None) => {}
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} watch updates", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    queue.shutdown().await;
    Ok(())
}

fn report(stats: &RunStats, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(stats);
    }

    println!(
        "Scanned {} files in {} ms: {} indexed, {} unchanged, {} deleted",
        stats.scanned, stats.elapsed_ms, stats.indexed, stats.unchanged, stats.deleted
    );
    println!(
        "  {} symbols, {} relationships",
        stats.symbols, stats.relationships
    );
    if stats.skipped_oversize > 0 {
        println!("  {} files skipped (too large)", stats.skipped_oversize);
    }
    if stats.skipped_unclaimed > 0 {
        println!(
            "  {} files skipped (no template syntax or unsupported content)",
            stats.skipped_unclaimed
        );
    }
    if stats.partial > 0 {
        println!("  {} files indexed from partial parses", stats.partial);
    }
    if stats.failed > 0 {
        println!("  {} files failed, previous entries kept:", stats.failed);
        for failure in &stats.failures {
            println!("    - {}", failure);
        }
    }
    Ok(())
}

fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
