//! Execution Tracker -- per-destination history rows and derived run status.
//!
//! A run is the set of `backup_history` rows sharing one `run_id`, one row per
//! destination. Rows are created together before any work starts; the
//! run-level status is never stored, only derived from the rows.

pub mod heartbeat;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::error::{BackupError, ExecutionLog};
use crate::storage::{parse_ts, ts, Pool};

pub use heartbeat::{spawn_heartbeat, HeartbeatHandle};

/// Error message written by the startup sweep.
pub const INTERRUPTED_MESSAGE: &str =
    "Backup interrupted: process terminated while the backup was running";

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => bail!("unknown {} '{other}'", stringify!($name)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Scheduled,
    Manual,
}

string_enum!(Trigger { Scheduled => "scheduled", Manual => "manual" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

string_enum!(EntryStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

/// Derived status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
}

string_enum!(RunStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Partial => "partial",
    Failed => "failed",
});

/// One row of `backup_history`.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub run_id: String,
    pub job_id: i64,
    pub destination_id: Option<i64>,
    pub trigger: Trigger,
    pub status: EntryStatus,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub file_size: Option<u64>,
    pub file_path: Option<String>,
    pub error_message: Option<String>,
    pub execution_log: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub job_id: i64,
    pub status: RunStatus,
    pub entries: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub job_id: i64,
    pub trigger: Trigger,
    pub status: RunStatus,
    pub destinations: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub job_id: i64,
    pub total_runs: u64,
    pub completed: u64,
    pub partial: u64,
    pub failed: u64,
    pub running: u64,
    pub pending: u64,
    /// Sum of `file_size` over completed entries.
    pub total_bytes: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

const ENTRY_COLUMNS: &str = "id, run_id, job_id, destination_id, trigger, status, attempt, created_at,
     started_at, completed_at, heartbeat_at, file_size, file_path, error_message,
     execution_log, metadata_json";

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<String>>(idx)?.as_deref().and_then(parse_ts))
}

fn enum_col<T: FromStr<Err = anyhow::Error>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let metadata: String = row.get(15)?;
    Ok(HistoryEntry {
        id: row.get(0)?,
        run_id: row.get(1)?,
        job_id: row.get(2)?,
        destination_id: row.get(3)?,
        trigger: enum_col(row, 4)?,
        status: enum_col(row, 5)?,
        attempt: row.get(6)?,
        created_at: opt_ts(row, 7)?.unwrap_or_default(),
        started_at: opt_ts(row, 8)?,
        completed_at: opt_ts(row, 9)?,
        heartbeat_at: opt_ts(row, 10)?,
        file_size: row.get::<_, Option<i64>>(11)?.map(|s| s.max(0) as u64),
        file_path: row.get(12)?,
        error_message: row.get(13)?,
        execution_log: row.get(14)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| json!({})),
    })
}

/// Aggregate entry statuses into the run status.
///
/// running > all failed > some failed (partial) > some pending > completed.
pub fn aggregate(statuses: &[EntryStatus]) -> RunStatus {
    if statuses.is_empty() {
        return RunStatus::Pending;
    }
    if statuses.contains(&EntryStatus::Running) {
        return RunStatus::Running;
    }
    let failed = statuses.iter().filter(|s| **s == EntryStatus::Failed).count();
    if failed == statuses.len() {
        RunStatus::Failed
    } else if failed > 0 {
        RunStatus::Partial
    } else if statuses.contains(&EntryStatus::Pending) {
        RunStatus::Pending
    } else {
        RunStatus::Completed
    }
}

/// Create one `pending` entry per destination in a single transaction.
pub fn create_run(
    pool: &Pool,
    job_id: i64,
    destination_ids: &[i64],
    trigger: Trigger,
    now: DateTime<Utc>,
) -> Result<String> {
    if destination_ids.is_empty() {
        bail!("job {job_id} has no destinations");
    }
    let run_id = uuid::Uuid::new_v4().to_string();
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO backup_history (run_id, job_id, destination_id, trigger, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
        )?;
        for dest in destination_ids {
            stmt.execute(params![run_id, job_id, dest, trigger.as_str(), ts(now)])?;
        }
    }
    tx.commit().context("failed to create run")?;
    info!(run_id = %run_id, job_id, destinations = destination_ids.len(), trigger = %trigger, "run created");
    Ok(run_id)
}

/// Claim the run's open entries for `attempt`; starts the heartbeat clock.
pub fn mark_running(pool: &Pool, run_id: &str, attempt: u32, now: DateTime<Utc>) -> Result<usize> {
    let conn = pool.get()?;
    let n = conn.execute(
        "UPDATE backup_history
         SET status = 'running', attempt = ?2,
             started_at = COALESCE(started_at, ?3),
             heartbeat_at = MAX(COALESCE(heartbeat_at, ''), ?3)
         WHERE run_id = ?1 AND status IN ('pending', 'running')",
        params![run_id, attempt, ts(now)],
    )?;
    Ok(n)
}

/// Monotonic heartbeat for every running entry of the run.
pub fn record_heartbeat(pool: &Pool, run_id: &str, at: DateTime<Utc>) -> Result<usize> {
    let conn = pool.get()?;
    let n = conn.execute(
        "UPDATE backup_history
         SET heartbeat_at = MAX(COALESCE(heartbeat_at, ''), ?2)
         WHERE run_id = ?1 AND status = 'running'",
        params![run_id, ts(at)],
    )?;
    Ok(n)
}

fn merged_metadata(existing: &str, extra: &Map<String, Value>) -> String {
    let mut base = match serde_json::from_str::<Value>(existing) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    for (k, v) in extra {
        base.insert(k.clone(), v.clone());
    }
    Value::Object(base).to_string()
}

fn update_metadata(
    tx: &rusqlite::Transaction<'_>,
    id: i64,
    extra: &Map<String, Value>,
) -> Result<()> {
    let existing: String = tx.query_row(
        "SELECT metadata_json FROM backup_history WHERE id = ?1",
        [id],
        |r| r.get(0),
    )?;
    tx.execute(
        "UPDATE backup_history SET metadata_json = ?2 WHERE id = ?1",
        params![id, merged_metadata(&existing, extra)],
    )?;
    Ok(())
}

fn entry_id(tx: &rusqlite::Transaction<'_>, run_id: &str, destination_id: i64) -> Result<i64> {
    tx.query_row(
        "SELECT id FROM backup_history WHERE run_id = ?1 AND destination_id = ?2",
        params![run_id, destination_id],
        |r| r.get(0),
    )
    .optional()?
    .with_context(|| format!("no history entry for run {run_id} destination {destination_id}"))
}

/// Terminal success for one destination.
#[allow(clippy::too_many_arguments)]
pub fn complete_entry(
    pool: &Pool,
    run_id: &str,
    destination_id: i64,
    file_size: u64,
    file_path: &str,
    log: &ExecutionLog,
    metadata: &Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let id = entry_id(&tx, run_id, destination_id)?;
    tx.execute(
        "UPDATE backup_history
         SET status = 'completed', completed_at = ?2, file_size = ?3, file_path = ?4,
             error_message = NULL, execution_log = ?5
         WHERE id = ?1",
        params![id, ts(now), file_size as i64, file_path, log.to_string()],
    )?;
    update_metadata(&tx, id, metadata)?;
    tx.commit()?;
    Ok(())
}

/// Terminal failure for one destination.
pub fn fail_entry(
    pool: &Pool,
    run_id: &str,
    destination_id: i64,
    message: &str,
    log: &ExecutionLog,
    metadata: &Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let id = entry_id(&tx, run_id, destination_id)?;
    tx.execute(
        "UPDATE backup_history
         SET status = 'failed', completed_at = ?2, error_message = ?3, execution_log = ?4
         WHERE id = ?1",
        params![id, ts(now), message, log.to_string()],
    )?;
    update_metadata(&tx, id, metadata)?;
    tx.commit()?;
    Ok(())
}

/// Fail every still-open entry of the run with the same error (source failure).
pub fn fail_run(
    pool: &Pool,
    run_id: &str,
    message: &str,
    log: &ExecutionLog,
    now: DateTime<Utc>,
) -> Result<usize> {
    let conn = pool.get()?;
    let n = conn.execute(
        "UPDATE backup_history
         SET status = 'failed', completed_at = ?2, error_message = ?3, execution_log = ?4
         WHERE run_id = ?1 AND status IN ('pending', 'running')",
        params![run_id, ts(now), message, log.to_string()],
    )?;
    Ok(n)
}

/// Append a failed attempt to `metadata.attempts` of every entry in the run.
pub fn record_failed_attempt(
    pool: &Pool,
    run_id: &str,
    attempt: u32,
    error: &BackupError,
    at: DateTime<Utc>,
) -> Result<()> {
    let record = json!({
        "attempt": attempt,
        "kind": error.kind(),
        "error": error.to_string(),
        "at": ts(at),
    });
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let rows: Vec<(i64, String)> = {
        let mut stmt =
            tx.prepare("SELECT id, metadata_json FROM backup_history WHERE run_id = ?1")?;
        let rows = stmt.query_map([run_id], |r| Ok((r.get(0)?, r.get(1)?)))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    for (id, raw) in rows {
        let mut meta = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let attempts = meta
            .entry("attempts")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = attempts {
            list.push(record.clone());
        } else {
            *attempts = Value::Array(vec![record.clone()]);
        }
        tx.execute(
            "UPDATE backup_history SET metadata_json = ?2 WHERE id = ?1",
            params![id, Value::Object(meta).to_string()],
        )?;
    }
    tx.commit()?;
    Ok(())
}

pub fn entries_for_run(pool: &Pool, run_id: &str) -> Result<Vec<HistoryEntry>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM backup_history WHERE run_id = ?1 ORDER BY id"
    ))?;
    let rows = stmt.query_map([run_id], row_to_entry)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Aggregate status plus all entries; `None` for an unknown run.
pub fn get_run_status(pool: &Pool, run_id: &str) -> Result<Option<RunReport>> {
    let entries = entries_for_run(pool, run_id)?;
    let Some(first) = entries.first() else {
        return Ok(None);
    };
    let statuses: Vec<EntryStatus> = entries.iter().map(|e| e.status).collect();
    Ok(Some(RunReport {
        run_id: run_id.to_string(),
        job_id: first.job_id,
        status: aggregate(&statuses),
        entries,
    }))
}

struct RunAcc {
    job_id: i64,
    trigger: Trigger,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    statuses: Vec<EntryStatus>,
}

fn runs(pool: &Pool, job_id: Option<i64>) -> Result<Vec<(String, RunAcc, u64)>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT run_id, job_id, trigger, status, created_at, completed_at, file_size
         FROM backup_history
         WHERE ?1 IS NULL OR job_id = ?1
         ORDER BY created_at, id",
    )?;
    let rows = stmt.query_map([job_id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, i64>(1)?,
            enum_col::<Trigger>(r, 2)?,
            enum_col::<EntryStatus>(r, 3)?,
            opt_ts(r, 4)?.unwrap_or_default(),
            opt_ts(r, 5)?,
            r.get::<_, Option<i64>>(6)?,
        ))
    })?;

    let mut order: Vec<String> = Vec::new();
    let mut by_run: BTreeMap<String, (RunAcc, u64)> = BTreeMap::new();
    for row in rows {
        let (run_id, job, trigger, status, created_at, completed_at, size) = row?;
        let (acc, bytes) = by_run.entry(run_id.clone()).or_insert_with(|| {
            order.push(run_id.clone());
            (
                RunAcc {
                    job_id: job,
                    trigger,
                    created_at,
                    completed_at: None,
                    statuses: Vec::new(),
                },
                0,
            )
        });
        acc.statuses.push(status);
        acc.completed_at = acc.completed_at.max(completed_at);
        if status == EntryStatus::Completed {
            *bytes += size.unwrap_or(0).max(0) as u64;
        }
    }
    Ok(order
        .into_iter()
        .filter_map(|id| by_run.remove(&id).map(|(acc, bytes)| (id, acc, bytes)))
        .collect())
}

/// Most recent runs first, optionally for one job.
pub fn recent_runs(pool: &Pool, job_id: Option<i64>, limit: usize) -> Result<Vec<RunSummary>> {
    Ok(runs(pool, job_id)?
        .into_iter()
        .rev()
        .take(limit)
        .map(|(run_id, acc, _)| RunSummary {
            run_id,
            job_id: acc.job_id,
            trigger: acc.trigger,
            status: aggregate(&acc.statuses),
            destinations: acc.statuses.len(),
            created_at: acc.created_at,
        })
        .collect())
}

pub fn get_job_stats(pool: &Pool, job_id: i64) -> Result<JobStats> {
    let mut stats = JobStats {
        job_id,
        ..JobStats::default()
    };
    for (_, acc, bytes) in runs(pool, Some(job_id))? {
        stats.total_runs += 1;
        stats.total_bytes += bytes;
        stats.last_run_at = stats.last_run_at.max(Some(acc.created_at));
        match aggregate(&acc.statuses) {
            RunStatus::Completed => {
                stats.completed += 1;
                stats.last_success_at = stats.last_success_at.max(acc.completed_at);
            }
            RunStatus::Partial => stats.partial += 1,
            RunStatus::Failed => stats.failed += 1,
            RunStatus::Running => stats.running += 1,
            RunStatus::Pending => stats.pending += 1,
        }
    }
    Ok(stats)
}

/// Fail entries orphaned by a crash.
///
/// `running` entries whose heartbeat is missing or older than `threshold`, and
/// `pending` entries created before it, become `failed` with
/// [`INTERRUPTED_MESSAGE`]. Pending entries younger than `threshold` may still
/// belong to a live queue and are left alone.
pub fn cleanup_stale_running_jobs(pool: &Pool, threshold: Duration, now: DateTime<Utc>) -> Result<usize> {
    sweep_interrupted(pool, threshold, now, false)
}

/// Startup sweep before the queue starts.
///
/// The queue is in memory, so every `pending` entry left in the database is
/// orphaned regardless of age. `running` entries still use the heartbeat
/// threshold.
pub fn recover_interrupted_runs(pool: &Pool, threshold: Duration, now: DateTime<Utc>) -> Result<usize> {
    sweep_interrupted(pool, threshold, now, true)
}

fn sweep_interrupted(pool: &Pool, threshold: Duration, now: DateTime<Utc>, all_pending: bool) -> Result<usize> {
    let threshold = chrono::Duration::from_std(threshold).context("stale threshold out of range")?;
    let cutoff = ts(now - threshold);
    let conn = pool.get()?;
    let n = conn.execute(
        "UPDATE backup_history
         SET status = 'failed', completed_at = ?2, error_message = ?3
         WHERE (status = 'running' AND (heartbeat_at IS NULL OR heartbeat_at < ?1))
            OR (status = 'pending' AND (?4 OR created_at < ?1))",
        params![cutoff, ts(now), INTERRUPTED_MESSAGE, all_pending],
    )?;
    if n > 0 {
        warn!(entries = n, all_pending, "marked interrupted backups as failed");
    }
    Ok(n)
}
