use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use queuectl::config::Settings;
use queuectl::jobs::JobManager;
use queuectl::store::LibSqlBackend;
use queuectl::worker::WorkerPool;

/// Install the stderr logger, plus a daily rolling file when
/// `QUEUECTL_LOG_DIR` is set. The returned guard flushes the file writer.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match std::env::var("QUEUECTL_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "queuectl.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let db_path =
        std::env::var("QUEUECTL_DB_PATH").unwrap_or_else(|_| "./data/queuectl.db".to_string());

    let worker_count: usize = std::env::var("QUEUECTL_WORKERS")
        .unwrap_or_else(|_| "1".to_string())
        .parse()
        .unwrap_or(1);

    let drain_timeout_ms: u64 = std::env::var("QUEUECTL_DRAIN_TIMEOUT_MS")
        .unwrap_or_else(|_| "30000".to_string())
        .parse()
        .unwrap_or(30_000);

    eprintln!("queuectl v{}", env!("CARGO_PKG_VERSION"));

    // ── Database ─────────────────────────────────────────────────────────
    let backend = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", db_path, e);
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", db_path);

    let settings = Arc::new(Settings::new(backend.clone()));

    let stats = JobManager::new(backend.clone(), Arc::clone(&settings))
        .stats()
        .await
        .context("Failed to read queue stats")?;
    eprintln!(
        "   Queue: {} pending, {} failed, {} processing, {} dead",
        stats.pending, stats.failed, stats.processing, stats.dead
    );

    // ── Workers ──────────────────────────────────────────────────────────
    let pool = WorkerPool::new(backend, settings)
        .with_drain_timeout(Duration::from_millis(drain_timeout_ms));
    let ids = pool.start(worker_count).await;
    eprintln!("   Workers: {}", ids.join(", "));
    eprintln!("   Press Ctrl-C to stop.\n");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    eprintln!("Shutting down...");
    pool.stop().await;
    Ok(())
}
