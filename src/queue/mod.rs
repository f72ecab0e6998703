//! Job Queue -- in-process run queue with bounded worker concurrency.
//!
//! `enqueue` creates the run's history entries up front, then hands the run to
//! a dispatcher that starts one worker task per run, at most `workers` at a
//! time. Scheduled and manual runs share the same limit.

pub mod worker;

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog;
use crate::engine::Engine;
use crate::error::{BackupError, ExecutionLog};
use crate::notify::RunOutcome;
use crate::tracker::{self, Trigger};

pub use worker::retry_delay;

/// Message written to runs still queued when the queue shuts down.
pub const SHUTDOWN_MESSAGE: &str = "Backup cancelled: service stopped before the run started";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("job {0} is disabled")]
    JobDisabled(i64),

    #[error(transparent)]
    Configuration(BackupError),

    #[error("job queue is shutting down")]
    ShuttingDown,

    #[error("run {0} finished without reporting an outcome")]
    Lost(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// A run handed from `enqueue` to a worker.
#[derive(Debug)]
pub struct RunRequest {
    pub run_id: String,
    pub job_id: i64,
    pub trigger: Trigger,
    done: Option<oneshot::Sender<RunOutcome>>,
}

#[derive(Clone)]
pub struct JobQueue {
    engine: Engine,
    tx: mpsc::UnboundedSender<RunRequest>,
    shutdown: CancellationToken,
    dispatcher: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl JobQueue {
    /// Start the dispatcher with `engine.config.queue.workers` concurrent workers.
    pub fn start(engine: Engine) -> Self {
        let workers = engine.config.queue.workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch(engine.clone(), rx, workers, shutdown.clone()));
        info!(workers, "job queue started");
        Self {
            engine,
            tx,
            shutdown,
            dispatcher: Arc::new(tokio::sync::Mutex::new(Some(dispatcher))),
        }
    }

    fn prepare(&self, job_id: i64, trigger: Trigger) -> Result<String, QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }
        let pool = &self.engine.pool;
        let job = catalog::load_job(pool, job_id)?.ok_or(QueueError::JobNotFound(job_id))?;
        // Manual runs of a disabled job are still allowed.
        if trigger == Trigger::Scheduled && !job.enabled {
            return Err(QueueError::JobDisabled(job_id));
        }
        let destinations = catalog::destinations_for_job(pool, job_id)?;
        if destinations.is_empty() {
            return Err(QueueError::Configuration(BackupError::configuration(format!(
                "job '{}' has no destinations",
                job.name
            ))));
        }
        let ids: Vec<i64> = destinations.iter().map(|d| d.id).collect();
        Ok(tracker::create_run(pool, job_id, &ids, trigger, Utc::now())?)
    }

    fn submit(&self, request: RunRequest) -> Result<(), QueueError> {
        let run_id = request.run_id.clone();
        if self.tx.send(request).is_err() {
            let _ = tracker::fail_run(
                &self.engine.pool,
                &run_id,
                SHUTDOWN_MESSAGE,
                &ExecutionLog::new(),
                Utc::now(),
            );
            return Err(QueueError::ShuttingDown);
        }
        Ok(())
    }

    /// Create the run's pending entries and queue it; returns the run id.
    pub fn enqueue(&self, job_id: i64, trigger: Trigger) -> Result<String, QueueError> {
        let run_id = self.prepare(job_id, trigger)?;
        self.submit(RunRequest {
            run_id: run_id.clone(),
            job_id,
            trigger,
            done: None,
        })?;
        debug!(run_id = %run_id, job_id, "run queued");
        Ok(run_id)
    }

    /// Like [`JobQueue::enqueue`], but resolves once the run has finished.
    pub async fn enqueue_and_wait(&self, job_id: i64, trigger: Trigger) -> Result<RunOutcome, QueueError> {
        let run_id = self.prepare(job_id, trigger)?;
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(RunRequest {
            run_id: run_id.clone(),
            job_id,
            trigger,
            done: Some(done_tx),
        })?;
        done_rx.await.map_err(|_| QueueError::Lost(run_id))
    }

    /// Stop accepting runs and wait for in-flight workers to finish.
    ///
    /// Runs still waiting for a worker are failed with [`SHUTDOWN_MESSAGE`].
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "job queue dispatcher panicked");
            }
        }
        info!("job queue stopped");
    }
}

async fn dispatch(
    engine: Engine,
    mut rx: mpsc::UnboundedReceiver<RunRequest>,
    workers: usize,
    shutdown: CancellationToken,
) {
    let limit = Arc::new(Semaphore::new(workers));
    let mut running = JoinSet::new();

    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            req = rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };
        let permit = tokio::select! {
            _ = shutdown.cancelled() => {
                cancel(&engine, request);
                break;
            }
            permit = limit.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let engine = engine.clone();
        running.spawn(async move {
            let RunRequest {
                run_id,
                job_id,
                trigger,
                done,
            } = request;
            let outcome = worker::execute_run(&engine, &run_id, job_id, trigger).await;
            drop(permit);
            if let Some(done) = done {
                let _ = done.send(outcome);
            }
        });
        // Reap finished workers so the set does not grow without bound.
        while running.try_join_next().is_some() {}
    }

    rx.close();
    while let Ok(request) = rx.try_recv() {
        cancel(&engine, request);
    }
    while let Some(result) = running.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "backup worker panicked");
        }
    }
}

fn cancel(engine: &Engine, request: RunRequest) {
    warn!(run_id = %request.run_id, job_id = request.job_id, "cancelling queued run");
    if let Err(e) = tracker::fail_run(
        &engine.pool,
        &request.run_id,
        SHUTDOWN_MESSAGE,
        &ExecutionLog::new(),
        Utc::now(),
    ) {
        error!(run_id = %request.run_id, error = %e, "failed to record cancelled run");
    }
}
