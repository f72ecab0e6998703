use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::queue::JobQueue;
use crate::scheduler::Scheduler;
use crate::storage::Pool;
use crate::tracker::Trigger;

/// Main scheduler loop: every `tick`, enqueue a scheduled run for each due job
/// that is still present and enabled in the catalog.
pub async fn run_scheduler_loop(
    scheduler: Scheduler,
    pool: Pool,
    queue: JobQueue,
    tick: Duration,
    shutdown: CancellationToken,
) {
    info!(tick_ms = tick.as_millis() as u64, "Scheduler engine started");

    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        for due in scheduler.due(Utc::now()) {
            match scheduler.confirm_due(&pool, &due) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!(job_id = due.job_id, job = %due.job_name, error = %e, "failed to reload due job");
                    continue;
                }
            }
            match queue.enqueue(due.job_id, Trigger::Scheduled) {
                Ok(run_id) => info!(
                    job_id = due.job_id,
                    job = %due.job_name,
                    fire_time = %due.fire_time,
                    run_id = %run_id,
                    "scheduled run queued"
                ),
                Err(e) => error!(job_id = due.job_id, job = %due.job_name, error = %e, "failed to queue scheduled run"),
            }
        }
    }
    info!("Scheduler engine stopped");
}
