//! mindmap-syncd: headless sync daemon for local mind-map stores.
//!
//! Runs the same engine as the editor against a file-backed store, syncing
//! with the document API on a fixed interval.

use anyhow::Result;
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use mindmap_sync_daemon::{Command, DaemonConfig, DaemonEngine, open_engine};
use mindmap_sync_core::{SyncEvent, SyncOutcome};

async fn run(engine: DaemonEngine) -> Result<()> {
    let _events = engine.subscribe(|event| match event {
        SyncEvent::OperationFailed {
            kind,
            document_id,
            node_id,
            error,
            ..
        } => warn!("{} on {} (node {:?}) needs attention: {}", kind, document_id, node_id, error),
        SyncEvent::PullDeferred { document_id } => debug!("Pull of {} deferred", document_id),
        _ => {}
    });

    let mut ticker = tokio::time::interval(engine.config().sync_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.flush_saves().await {
                    error!("Failed to flush pending saves: {}", e);
                }
                match engine.sync().await {
                    Ok(SyncOutcome::Completed(report)) => {
                        if report.pushed + report.pulled + report.removed + report.failed > 0 {
                            info!(
                                "Sync: {} pushed, {} pulled, {} removed, {} failed",
                                report.pushed, report.pulled, report.removed, report.failed
                            );
                        }
                    }
                    Ok(SyncOutcome::AlreadyRunning) => debug!("Previous sync still running"),
                    Ok(SyncOutcome::Unauthenticated) => warn!("No API token configured, skipping sync"),
                    Err(e) => error!("Sync failed: {}", e),
                }
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // Saves still inside their debounce window are written before exit.
    let flushed = engine.flush_saves().await?;
    if flushed > 0 {
        info!("Flushed {} pending saves", flushed);
    }
    info!("Shutting down");
    Ok(())
}

async fn status(engine: &DaemonEngine) -> Result<()> {
    let operations = engine.queue().all().await?;
    println!("Queued operations: {}", operations.len());
    for op in &operations {
        println!(
            "  {} {:<12} doc={} node={} status={:?} retries={}{}",
            op.id,
            op.kind().to_string(),
            op.document_id,
            op.node_id().unwrap_or("-"),
            op.status,
            op.retry_count,
            op.last_error
                .as_deref()
                .map(|e| format!(" error={}", e))
                .unwrap_or_default()
        );
    }

    let documents = engine.store().list(None).await?;
    println!("Documents: {}", documents.len());
    for document in &documents {
        println!(
            "  {} {:?} status={:?} local={} cloud={:?}",
            document.id, document.title, document.sync_status, document.local_version, document.cloud_version
        );
    }

    match engine.last_sync_at().await? {
        Some(at) => println!("Last sync: {} ms since epoch", at),
        None => println!("Last sync: never"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = DaemonConfig::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if config.verbose {
        "debug,mindmap_sync_core=debug,mindmap_sync_daemon=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting mindmap-syncd");
    info!("Data directory: {:?}", config.data_dir);
    info!("Remote: {}", config.remote_url);

    let engine = open_engine(&config).await?;

    match config.command() {
        Command::Run => run(engine).await,
        Command::Status => status(&engine).await,
        Command::RetryFailed => {
            let rearmed = engine.retry_failed().await?;
            println!("Re-armed {} parked operations", rearmed);
            Ok(())
        }
    }
}
