use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{self, Job};
use crate::storage::Pool;

/// Parse a cron expression. Five-field (minute resolution) expressions get a
/// leading `0` seconds field.
pub fn parse_schedule(expr: &str) -> Result<CronSchedule> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    CronSchedule::from_str(&normalized)
        .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expr, e))
}

struct Registration {
    job_name: String,
    expression: String,
    schedule: CronSchedule,
    next_fire: Option<DateTime<Utc>>,
}

/// Snapshot of one registration.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    pub job_id: i64,
    pub job_name: String,
    pub expression: String,
    pub next_fire: Option<DateTime<Utc>>,
}

/// A job that is due now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueJob {
    pub job_id: i64,
    pub job_name: String,
    pub fire_time: DateTime<Utc>,
}

/// In-memory registration table keyed by job id.
///
/// Every change is a single operation under one lock, so a disabled or
/// deleted job can never fire from a stale entry.
#[derive(Clone, Default)]
pub struct Scheduler {
    registrations: Arc<Mutex<HashMap<i64, Registration>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<i64, Registration>> {
        // A poisoned table still holds consistent entries; every write is a
        // single insert/remove/replace.
        self.registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn registration(job: &Job, now: DateTime<Utc>) -> Option<Registration> {
        if !job.enabled {
            return None;
        }
        let expr = job.schedule.as_deref().filter(|s| !s.trim().is_empty())?;
        match parse_schedule(expr) {
            Ok(schedule) => Some(Registration {
                job_name: job.name.clone(),
                expression: expr.to_string(),
                next_fire: schedule.after(&now).next(),
                schedule,
            }),
            Err(e) => {
                warn!(job_id = job.id, job = %job.name, error = %e, "not scheduling job");
                None
            }
        }
    }

    /// Replace the whole table with the enabled, scheduled jobs in the catalog.
    pub fn register_all(&self, pool: &Pool) -> Result<usize> {
        let jobs = catalog::scheduled_jobs(pool).context("Failed to load scheduled jobs")?;
        let now = Utc::now();
        let fresh: HashMap<i64, Registration> = jobs
            .iter()
            .filter_map(|job| Self::registration(job, now).map(|r| (job.id, r)))
            .collect();
        let count = fresh.len();
        *self.table() = fresh;
        info!(count, "registered scheduled jobs");
        Ok(count)
    }

    /// Apply a create, update or enable toggle. Disabled, unscheduled and
    /// invalid jobs end up unregistered.
    pub fn job_changed(&self, job: &Job) {
        let reg = Self::registration(job, Utc::now());
        let mut table = self.table();
        match reg {
            Some(reg) => {
                debug!(job_id = job.id, next_fire = ?reg.next_fire, "job schedule registered");
                table.insert(job.id, reg);
            }
            None => {
                if table.remove(&job.id).is_some() {
                    debug!(job_id = job.id, "job schedule removed");
                }
            }
        }
    }

    pub fn job_removed(&self, job_id: i64) {
        if self.table().remove(&job_id).is_some() {
            debug!(job_id, "job schedule removed");
        }
    }

    /// Jobs whose next fire time is at or before `now`. Each is advanced to
    /// its first fire time after `now`, so missed fires collapse into one.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<DueJob> {
        let mut table = self.table();
        let mut due = Vec::new();
        for (job_id, reg) in table.iter_mut() {
            let Some(fire_time) = reg.next_fire else { continue };
            if fire_time <= now {
                due.push(DueJob {
                    job_id: *job_id,
                    job_name: reg.job_name.clone(),
                    fire_time,
                });
                reg.next_fire = reg.schedule.after(&now).next();
            }
        }
        due.sort_by_key(|d| (d.fire_time, d.job_id));
        due
    }

    /// Re-read a due job from the catalog before it is queued. A job that was
    /// deleted, disabled or rescheduled since registration is re-synced and
    /// skipped.
    pub fn confirm_due(&self, pool: &Pool, due: &DueJob) -> Result<bool> {
        let Some(job) = catalog::load_job(pool, due.job_id)? else {
            info!(job_id = due.job_id, job = %due.job_name, "skipping fire for deleted job");
            self.job_removed(due.job_id);
            return Ok(false);
        };
        let registered = self.table().get(&job.id).map(|r| r.expression.clone());
        if job.enabled && registered.is_some() && job.schedule == registered {
            return Ok(true);
        }
        info!(job_id = job.id, job = %job.name, enabled = job.enabled, "skipping fire for changed job");
        self.job_changed(&job);
        Ok(false)
    }

    pub fn list(&self) -> Vec<ScheduleInfo> {
        let mut list: Vec<ScheduleInfo> = self
            .table()
            .iter()
            .map(|(job_id, reg)| ScheduleInfo {
                job_id: *job_id,
                job_name: reg.job_name.clone(),
                expression: reg.expression.clone(),
                next_fire: reg.next_fire,
            })
            .collect();
        list.sort_by_key(|s| s.job_id);
        list
    }

    /// Every fire time within the next `hours`, sorted by time.
    /// This is strictly a preview; nothing is advanced.
    pub fn preview_next_runs(&self, hours: u64, now: DateTime<Utc>) -> Vec<DueJob> {
        let end = now + chrono::Duration::hours(hours as i64);
        let table = self.table();
        let mut preview = Vec::new();
        for (job_id, reg) in table.iter() {
            for next_time in reg.schedule.after(&now) {
                if next_time > end {
                    break;
                }
                preview.push(DueJob {
                    job_id: *job_id,
                    job_name: reg.job_name.clone(),
                    fire_time: next_time,
                });
            }
        }
        preview.sort_by_key(|d| (d.fire_time, d.job_id));
        preview
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ConfigMap, SourceType};
    use chrono::TimeZone;

    fn job(id: i64, schedule: Option<&str>, enabled: bool) -> Job {
        Job {
            id,
            name: format!("job-{id}"),
            source_type: SourceType::Postgres,
            source_config: ConfigMap::new(),
            schedule: schedule.map(String::from),
            retention_days: 7,
            retry_count: 0,
            enabled,
            credential_provider_id: None,
        }
    }

    #[test]
    fn test_five_field_expressions_are_normalized() {
        let s = parse_schedule("30 2 * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();
        let next = s.after(&from).next().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 5, 2, 30, 0).unwrap());

        assert!(parse_schedule("0 */15 * * * *").is_ok());
        assert!(parse_schedule("every tuesday").is_err());
    }

    #[test]
    fn test_job_changed_replaces_and_removes() {
        let sched = Scheduler::new();
        sched.job_changed(&job(1, Some("0 3 * * *"), true));
        sched.job_changed(&job(2, Some("*/5 * * * *"), true));
        assert_eq!(sched.list().len(), 2);

        sched.job_changed(&job(1, Some("0 4 * * *"), true));
        let list = sched.list();
        assert_eq!(list[0].expression, "0 4 * * *");

        // Disabling, clearing the schedule or an invalid expression unregisters.
        sched.job_changed(&job(1, Some("0 4 * * *"), false));
        assert_eq!(sched.list().len(), 1);
        sched.job_changed(&job(2, Some("not cron"), true));
        assert!(sched.list().is_empty());

        sched.job_changed(&job(3, Some("0 1 * * *"), true));
        sched.job_removed(3);
        sched.job_removed(3);
        assert!(sched.list().is_empty());
    }

    #[test]
    fn test_due_collapses_missed_fires() {
        let sched = Scheduler::new();
        sched.job_changed(&job(1, Some("* * * * *"), true));
        let next = sched.list()[0].next_fire.unwrap();

        assert!(sched.due(next - chrono::Duration::seconds(1)).is_empty());

        // Ten minutes late: still a single run.
        let late = next + chrono::Duration::minutes(10);
        let due = sched.due(late);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].fire_time, next);
        assert!(sched.list()[0].next_fire.unwrap() > late);
        assert!(sched.due(late).is_empty());
    }

    #[test]
    fn test_preview_lists_fire_times_in_window() {
        let sched = Scheduler::new();
        sched.job_changed(&job(1, Some("0 * * * *"), true));
        sched.job_changed(&job(2, Some("30 0 * * *"), true));
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 30).unwrap();
        let preview = sched.preview_next_runs(3, now);
        let times: Vec<_> = preview.iter().map(|d| (d.fire_time.format("%H:%M").to_string(), d.job_id)).collect();
        assert_eq!(
            times,
            vec![
                ("00:30".to_string(), 2),
                ("01:00".to_string(), 1),
                ("02:00".to_string(), 1),
                ("03:00".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_disabled_or_deleted_job_stops_firing() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::storage::open_pool(&dir.path().join("s.db")).unwrap();
        catalog::upsert_job(&pool, &job(1, Some("* * * * *"), true), &[]).unwrap();
        catalog::upsert_job(&pool, &job(2, Some("* * * * *"), true), &[]).unwrap();
        catalog::upsert_job(&pool, &job(3, Some("* * * * *"), true), &[]).unwrap();

        let sched = Scheduler::new();
        assert_eq!(sched.register_all(&pool).unwrap(), 3);
        catalog::set_job_enabled(&pool, 1, false).unwrap();
        catalog::delete_job(&pool, 2).unwrap();

        let late = Utc::now() + chrono::Duration::minutes(2);
        let due = sched.due(late);
        assert_eq!(due.len(), 3);
        let confirmed: Vec<i64> = due
            .iter()
            .filter(|d| sched.confirm_due(&pool, d).unwrap())
            .map(|d| d.job_id)
            .collect();
        assert_eq!(confirmed, vec![3]);

        let ids: Vec<i64> = sched.list().iter().map(|s| s.job_id).collect();
        assert_eq!(ids, vec![3]);
        let later = late + chrono::Duration::minutes(2);
        let due: Vec<i64> = sched.due(later).iter().map(|d| d.job_id).collect();
        assert_eq!(due, vec![3]);
    }

    #[test]
    fn test_rescheduled_job_skips_stale_fire() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::storage::open_pool(&dir.path().join("s.db")).unwrap();
        catalog::upsert_job(&pool, &job(1, Some("* * * * *"), true), &[]).unwrap();
        let sched = Scheduler::new();
        sched.register_all(&pool).unwrap();
        catalog::upsert_job(&pool, &job(1, Some("0 3 * * *"), true), &[]).unwrap();

        let due = sched.due(Utc::now() + chrono::Duration::minutes(2));
        assert_eq!(due.len(), 1);
        assert!(!sched.confirm_due(&pool, &due[0]).unwrap());
        assert_eq!(sched.list()[0].expression, "0 3 * * *");
    }

    #[test]
    fn test_register_all_reads_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::storage::open_pool(&dir.path().join("s.db")).unwrap();
        catalog::upsert_job(&pool, &job(1, Some("0 3 * * *"), true), &[]).unwrap();
        catalog::upsert_job(&pool, &job(2, Some("0 3 * * *"), false), &[]).unwrap();
        catalog::upsert_job(&pool, &job(3, None, true), &[]).unwrap();

        let sched = Scheduler::new();
        sched.job_changed(&job(9, Some("0 1 * * *"), true));
        assert_eq!(sched.register_all(&pool).unwrap(), 1);
        let ids: Vec<i64> = sched.list().iter().map(|s| s.job_id).collect();
        assert_eq!(ids, vec![1]);
    }
}
