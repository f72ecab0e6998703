//! One run, start to finish: source with retries, fan-out, bookkeeping.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::catalog::{self, Destination, Job};
use crate::credentials::ConfigKind;
use crate::destinations::Delivery;
use crate::engine::Engine;
use crate::error::{BackupError, ExecutionLog};
use crate::notify::{DestinationOutcome, RunOutcome};
use crate::sources::{self, Artifact, ArtifactBody, Source, StrategyContext};
use crate::tracker::{self, RunStatus, Trigger};

/// Removes the per-run working directory on every exit path.
struct Workdir {
    path: PathBuf,
}

impl Workdir {
    fn create(temp_dir: &Path, run_id: &str) -> Result<Self, BackupError> {
        let path = temp_dir.join(run_id);
        std::fs::create_dir_all(&path).map_err(|e| {
            BackupError::execution(format!("cannot create work directory {}: {e}", path.display()))
        })?;
        Ok(Self { path })
    }
}

impl Drop for Workdir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove work directory");
            }
        }
    }
}

/// Exponential backoff for `attempt` (1-based) with up to 25% random jitter.
pub fn retry_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
    let capped = exp.min(max_ms);
    let jitter = if capped >= 4 {
        rand::thread_rng().gen_range(0..=capped / 4)
    } else {
        0
    };
    Duration::from_millis(capped.saturating_add(jitter).min(max_ms.max(capped)))
}

struct Finished {
    status: RunStatus,
    attempts: u32,
    size_bytes: Option<u64>,
    error: Option<String>,
    destinations: Vec<DestinationOutcome>,
}

fn failed(attempts: u32, error: &BackupError) -> Finished {
    Finished {
        status: RunStatus::Failed,
        attempts,
        size_bytes: None,
        error: Some(error.to_string()),
        destinations: Vec::new(),
    }
}

/// Execute a queued run and record every outcome; never returns an error.
pub async fn execute_run(engine: &Engine, run_id: &str, job_id: i64, trigger: Trigger) -> RunOutcome {
    info!(run_id, job_id, trigger = %trigger, "run starting");
    let job = match catalog::load_job(&engine.pool, job_id) {
        Ok(Some(job)) => Some(job),
        Ok(None) => None,
        Err(e) => {
            error!(run_id, job_id, error = %e, "failed to load job");
            None
        }
    };

    let finished = match &job {
        Some(job) => run_job(engine, run_id, job).await,
        None => {
            let err = BackupError::configuration(format!("job {job_id} no longer exists"));
            record_source_failure(engine, run_id, &err);
            failed(0, &err)
        }
    };

    // Re-derive from storage so the outcome matches what was recorded.
    let status = match tracker::get_run_status(&engine.pool, run_id) {
        Ok(Some(report)) => report.status,
        _ => finished.status,
    };
    let outcome = RunOutcome {
        run_id: run_id.to_string(),
        trigger,
        status,
        attempts: finished.attempts,
        size_bytes: finished.size_bytes,
        error: finished.error,
        destinations: finished.destinations,
    };
    if let Some(job) = &job {
        engine.notifier.notify(job, &outcome).await;
    }
    info!(run_id, job_id, status = %outcome.status, "run finished");
    outcome
}

fn record_source_failure(engine: &Engine, run_id: &str, err: &BackupError) {
    if let Err(e) = tracker::fail_run(&engine.pool, run_id, &err.to_string(), err.log(), Utc::now()) {
        error!(run_id, error = %e, "failed to record run failure");
    }
}

async fn run_job(engine: &Engine, run_id: &str, job: &Job) -> Finished {
    let pool = &engine.pool;
    let config = &engine.config;

    let entries = match tracker::entries_for_run(pool, run_id) {
        Ok(entries) => entries,
        Err(e) => {
            let err = BackupError::execution(format!("cannot load run entries: {e:#}"));
            record_source_failure(engine, run_id, &err);
            return failed(0, &err);
        }
    };
    let attached: HashMap<i64, Destination> = match catalog::destinations_for_job(pool, job.id) {
        Ok(list) => list.into_iter().map(|d| (d.id, d)).collect(),
        Err(e) => {
            let err = BackupError::execution(format!("cannot load destinations: {e:#}"));
            record_source_failure(engine, run_id, &err);
            return failed(0, &err);
        }
    };
    let mut destinations = Vec::new();
    for entry in &entries {
        let Some(dest_id) = entry.destination_id else { continue };
        match attached.get(&dest_id) {
            Some(dest) => destinations.push(dest.clone()),
            None => {
                let msg = format!("destination {dest_id} is no longer attached to job '{}'", job.name);
                warn!(run_id, destination_id = dest_id, "destination detached since the run was queued");
                if let Err(e) =
                    tracker::fail_entry(pool, run_id, dest_id, &msg, &ExecutionLog::new(), &Map::new(), Utc::now())
                {
                    error!(run_id, destination_id = dest_id, error = %e, "failed to record detached destination");
                }
            }
        }
    }
    if destinations.is_empty() {
        let err = BackupError::configuration(format!("job '{}' has no destinations", job.name));
        record_source_failure(engine, run_id, &err);
        return failed(0, &err);
    }

    let decrypted = engine
        .credentials
        .decrypt(ConfigKind::Source(job.source_type), &job.source_config);
    let source = match Source::from_job(job, decrypted) {
        Ok(source) => source,
        Err(err) => {
            warn!(run_id, job = %job.name, error = %err, "invalid source configuration");
            record_source_failure(engine, run_id, &err);
            return failed(0, &err);
        }
    };

    let workdir = match Workdir::create(&config.paths.temp_dir, run_id) {
        Ok(w) => w,
        Err(err) => {
            record_source_failure(engine, run_id, &err);
            return failed(0, &err);
        }
    };

    if let Err(e) = tracker::mark_running(pool, run_id, 1, Utc::now()) {
        error!(run_id, error = %e, "failed to mark run as running");
    }
    let heartbeat = tracker::spawn_heartbeat(
        pool.clone(),
        run_id.to_string(),
        config.execution.heartbeat_interval(),
    );

    let (artifact, attempts) = match produce_artifact(engine, run_id, job, &source, &workdir.path).await {
        Ok(done) => done,
        Err((err, attempts)) => {
            heartbeat.stop().await;
            record_source_failure(engine, run_id, &err);
            return failed(attempts, &err);
        }
    };

    let deliveries = engine.distributor.distribute(&artifact, &destinations).await;
    if let ArtifactBody::File(path) = &artifact.body {
        let _ = tokio::fs::remove_file(path).await;
    }
    let outcomes = record_deliveries(engine, run_id, &artifact, &deliveries);
    heartbeat.stop().await;

    prune_expired(engine, job, &source, &destinations, &deliveries).await;

    Finished {
        status: RunStatus::Pending,
        attempts,
        size_bytes: Some(artifact.size_bytes),
        error: None,
        destinations: outcomes,
    }
}

/// Run the source strategy, retrying attempt-level failures with backoff.
async fn produce_artifact(
    engine: &Engine,
    run_id: &str,
    job: &Job,
    source: &Source,
    workdir: &Path,
) -> Result<(Artifact, u32), (BackupError, u32)> {
    let pool = &engine.pool;
    let config = &engine.config;
    let max_attempts = job.retry_count.saturating_add(1);
    let mut attempt = 1;
    loop {
        if attempt > 1 {
            if let Err(e) = tracker::mark_running(pool, run_id, attempt, Utc::now()) {
                error!(run_id, error = %e, "failed to record attempt");
            }
        }
        let ctx = StrategyContext {
            workdir,
            runner: &engine.runner,
            tools: &config.tools,
            execution: &config.execution,
            credentials: &engine.credentials,
            stem: sources::artifact_stem(source.source_type(), &source.identifier(), Utc::now()),
        };
        match source.execute(&ctx).await {
            Ok(artifact) => {
                info!(run_id, attempt, artifact = %artifact.name, size = artifact.size_bytes, "artifact ready");
                return Ok((artifact, attempt));
            }
            Err(err) => {
                if let Err(e) = tracker::record_failed_attempt(pool, run_id, attempt, &err, Utc::now()) {
                    error!(run_id, error = %e, "failed to record failed attempt");
                }
                if !err.is_retryable() || attempt >= max_attempts {
                    warn!(run_id, attempt, kind = err.kind(), error = %err, "source failed, giving up");
                    return Err((err, attempt));
                }
                let delay = retry_delay(attempt, config.queue.retry_backoff_ms, config.queue.max_backoff_ms);
                warn!(
                    run_id,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "source attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

fn record_deliveries(
    engine: &Engine,
    run_id: &str,
    artifact: &Artifact,
    deliveries: &[Delivery],
) -> Vec<DestinationOutcome> {
    let now = Utc::now();
    deliveries
        .iter()
        .map(|d| {
            let mut log = artifact.log.clone();
            let mut own = d.log.clone();
            log.append(&mut own);
            let recorded = match &d.result {
                Ok(delivered) => {
                    let mut metadata = artifact.metadata.clone();
                    metadata.insert("artifact".into(), Value::String(artifact.name.clone()));
                    tracker::complete_entry(
                        &engine.pool,
                        run_id,
                        d.destination_id,
                        delivered.size_bytes,
                        &delivered.location,
                        &log,
                        &metadata,
                        now,
                    )
                }
                Err(err) => {
                    let mut metadata = artifact.metadata.clone();
                    metadata.insert("error_kind".into(), json!(err.kind()));
                    tracker::fail_entry(&engine.pool, run_id, d.destination_id, &err.to_string(), &log, &metadata, now)
                }
            };
            if let Err(e) = recorded {
                error!(run_id, destination = %d.destination_name, error = %e, "failed to record delivery");
            }
            DestinationOutcome {
                destination_id: d.destination_id,
                name: d.destination_name.clone(),
                succeeded: d.succeeded(),
                location: d.result.as_ref().ok().map(|r| r.location.clone()),
                error: d.result.as_ref().err().map(|e| e.to_string()),
            }
        })
        .collect()
}

async fn prune_expired(
    engine: &Engine,
    job: &Job,
    source: &Source,
    destinations: &[Destination],
    deliveries: &[Delivery],
) {
    let prefix = sources::artifact_prefix(source.source_type(), &source.identifier());
    let now = Utc::now();
    for delivery in deliveries.iter().filter(|d| d.succeeded()) {
        let Some(dest) = destinations.iter().find(|d| d.id == delivery.destination_id) else {
            continue;
        };
        match engine.distributor.prune(dest, &prefix, job.retention_days, now).await {
            Ok(0) => {}
            Ok(n) => info!(job = %job.name, destination = %dest.name, removed = n, "pruned expired artifacts"),
            Err(e) => warn!(job = %job.name, destination = %dest.name, error = %e, "retention pruning failed"),
        }
    }
}
