//! Background heartbeat bound to one run.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::storage::Pool;

/// Stops the heartbeat when [`HeartbeatHandle::stop`] is awaited or the handle is dropped.
pub struct HeartbeatHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Write `heartbeat_at` for the run's running entries every `every`.
pub fn spawn_heartbeat(pool: Pool, run_id: String, every: Duration) -> HeartbeatHandle {
    let token = CancellationToken::new();
    let child = token.clone();
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; mark_running already stamped the row.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = child.cancelled() => break,
                _ = interval.tick() => {
                    match super::record_heartbeat(&pool, &run_id, Utc::now()) {
                        Ok(n) => debug!(run_id = %run_id, entries = n, "heartbeat"),
                        Err(e) => warn!(run_id = %run_id, error = %e, "heartbeat write failed"),
                    }
                }
            }
        }
    });
    HeartbeatHandle {
        token,
        task: Some(task),
    }
}
