//! stashd -- crash-safe backup execution engine.
//!
//! Runs native dump tools for databases and object storage on a schedule or on
//! demand, fans each artifact out to local and S3-compatible destinations and
//! tracks every run durably enough to survive the process being killed.

pub mod catalog;
pub mod config;
pub mod credentials;
pub mod destinations;
pub mod engine;
pub mod error;
pub mod notify;
pub mod process;
pub mod queue;
pub mod scheduler;
pub mod sources;
pub mod storage;
pub mod tracker;

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::config::StashConfig;
use crate::engine::Engine;
use crate::queue::JobQueue;
use crate::scheduler::Scheduler;

/// Start the daemon: crash recovery, job queue and scheduler.
///
/// Runs until Ctrl-C or SIGTERM, then stops the scheduler and waits for
/// in-flight runs. SIGHUP re-reads the scheduled jobs from the catalog.
pub async fn serve(config: StashConfig) -> Result<()> {
    // 1. Initialize storage and credentials
    tracing::info!(db = %config.storage.db_path.display(), "Initializing database");
    let engine = Engine::open(config)?;

    // 2. Reclaim runs orphaned by a previous crash
    let reclaimed = tracker::recover_interrupted_runs(
        &engine.pool,
        engine.config.execution.stale_threshold(),
        Utc::now(),
    )?;
    if reclaimed > 0 {
        tracing::warn!(entries = reclaimed, "failed entries orphaned by a previous run");
    }

    // 3. Start the queue and register schedules
    let queue = JobQueue::start(engine.clone());
    let scheduler = Scheduler::new();
    scheduler.register_all(&engine.pool)?;

    // 4. Scheduler loop (background task)
    let shutdown = CancellationToken::new();
    let tick = Duration::from_millis(engine.config.queue.scheduler_tick_ms.max(10));
    let scheduler_task = tokio::spawn(scheduler::run_scheduler_loop(
        scheduler.clone(),
        engine.pool.clone(),
        queue.clone(),
        tick,
        shutdown.clone(),
    ));

    tracing::info!("stashd running");
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = hangup.recv() => {
                if let Err(e) = scheduler.register_all(&engine.pool) {
                    tracing::error!(error = %e, "failed to reload schedules");
                }
            }
        }
    }

    tracing::info!("shutting down");
    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        tracing::error!(error = %e, "scheduler task panicked");
    }
    queue.shutdown().await;
    Ok(())
}
