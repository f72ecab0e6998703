//! Job, destination and credential-provider records.
//!
//! The core only reads these. The write functions exist for the catalog
//! import command and for tests; the full CRUD surface lives elsewhere.

pub mod import;

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::storage::Pool;

/// Raw (possibly encrypted) configuration object as stored.
pub type ConfigMap = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Postgres,
    Mysql,
    Mongodb,
    Redis,
    S3,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Postgres => "postgres",
            SourceType::Mysql => "mysql",
            SourceType::Mongodb => "mongodb",
            SourceType::Redis => "redis",
            SourceType::S3 => "s3",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "postgres" | "postgresql" => Ok(SourceType::Postgres),
            "mysql" | "mariadb" => Ok(SourceType::Mysql),
            "mongodb" | "mongo" => Ok(SourceType::Mongodb),
            "redis" => Ok(SourceType::Redis),
            "s3" => Ok(SourceType::S3),
            other => anyhow::bail!("unknown source type '{other}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Local,
    S3,
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::Local => "local",
            DestinationKind::S3 => "s3",
        }
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DestinationKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(DestinationKind::Local),
            "s3" | "object-storage" => Ok(DestinationKind::S3),
            other => anyhow::bail!("unknown destination kind '{other}'"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub source_type: SourceType,
    /// Stored form; secret fields are encrypted.
    pub source_config: ConfigMap,
    pub schedule: Option<String>,
    pub retention_days: u32,
    pub retry_count: u32,
    pub enabled: bool,
    pub credential_provider_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Destination {
    pub id: i64,
    pub name: String,
    pub kind: DestinationKind,
    pub config: ConfigMap,
    pub credential_provider_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CredentialProvider {
    pub id: i64,
    pub name: String,
    /// Stored form; key pair encrypted.
    pub config: ConfigMap,
}

fn parse_config(json: &str) -> rusqlite::Result<ConfigMap> {
    serde_json::from_str(json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_enum<T: FromStr<Err = anyhow::Error>>(idx: usize, s: &str) -> rusqlite::Result<T> {
    s.parse().map_err(|e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

const JOB_COLUMNS: &str = "id, name, source_type, source_config_json, schedule, retention_days,
     retry_count, enabled, credential_provider_id";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let source_type: String = row.get(2)?;
    let config: String = row.get(3)?;
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        source_type: parse_enum(2, &source_type)?,
        source_config: parse_config(&config)?,
        schedule: row.get(4)?,
        retention_days: row.get(5)?,
        retry_count: row.get(6)?,
        enabled: row.get::<_, i64>(7)? != 0,
        credential_provider_id: row.get(8)?,
    })
}

fn destination_from_row(row: &Row<'_>) -> rusqlite::Result<Destination> {
    let kind: String = row.get(2)?;
    let config: String = row.get(3)?;
    Ok(Destination {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: parse_enum(2, &kind)?,
        config: parse_config(&config)?,
        credential_provider_id: row.get(4)?,
    })
}

pub fn load_job(pool: &Pool, job_id: i64) -> Result<Option<Job>> {
    let conn = pool.get()?;
    let job = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![job_id],
            job_from_row,
        )
        .optional()
        .with_context(|| format!("failed to load job {job_id}"))?;
    Ok(job)
}

pub fn list_jobs(pool: &Pool) -> Result<Vec<Job>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id"))?;
    let jobs = stmt
        .query_map([], job_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(jobs)
}

/// Jobs the scheduler has to register: enabled and carrying a schedule.
pub fn scheduled_jobs(pool: &Pool) -> Result<Vec<Job>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs
         WHERE enabled = 1 AND schedule IS NOT NULL AND schedule != ''
         ORDER BY id"
    ))?;
    let jobs = stmt
        .query_map([], job_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(jobs)
}

pub fn destinations_for_job(pool: &Pool, job_id: i64) -> Result<Vec<Destination>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT d.id, d.name, d.kind, d.config_json, d.credential_provider_id
         FROM destinations d
         JOIN job_destinations jd ON jd.destination_id = d.id
         WHERE jd.job_id = ?1
         ORDER BY d.id",
    )?;
    let dests = stmt
        .query_map(params![job_id], destination_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(dests)
}

pub fn load_provider(pool: &Pool, provider_id: i64) -> Result<Option<CredentialProvider>> {
    let conn = pool.get()?;
    let provider = conn
        .query_row(
            "SELECT id, name, config_json FROM credential_providers WHERE id = ?1",
            params![provider_id],
            |row| {
                let config: String = row.get(2)?;
                Ok(CredentialProvider {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    config: parse_config(&config)?,
                })
            },
        )
        .optional()
        .with_context(|| format!("failed to load credential provider {provider_id}"))?;
    Ok(provider)
}

pub fn upsert_provider(pool: &Pool, provider: &CredentialProvider) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO credential_providers (id, name, config_json) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            config_json = excluded.config_json,
            updated_at = datetime('now')",
        params![
            provider.id,
            provider.name,
            Value::Object(provider.config.clone()).to_string()
        ],
    )
    .context("Failed to upsert credential provider")?;
    Ok(())
}

pub fn upsert_destination(pool: &Pool, dest: &Destination) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO destinations (id, name, kind, config_json, credential_provider_id)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            kind = excluded.kind,
            config_json = excluded.config_json,
            credential_provider_id = excluded.credential_provider_id,
            updated_at = datetime('now')",
        params![
            dest.id,
            dest.name,
            dest.kind.as_str(),
            Value::Object(dest.config.clone()).to_string(),
            dest.credential_provider_id
        ],
    )
    .context("Failed to upsert destination")?;
    Ok(())
}

/// Insert or replace a job together with its destination set.
pub fn upsert_job(pool: &Pool, job: &Job, destination_ids: &[i64]) -> Result<()> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO jobs (id, name, source_type, source_config_json, schedule, retention_days,
                           retry_count, enabled, credential_provider_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            source_type = excluded.source_type,
            source_config_json = excluded.source_config_json,
            schedule = excluded.schedule,
            retention_days = excluded.retention_days,
            retry_count = excluded.retry_count,
            enabled = excluded.enabled,
            credential_provider_id = excluded.credential_provider_id,
            updated_at = datetime('now')",
        params![
            job.id,
            job.name,
            job.source_type.as_str(),
            Value::Object(job.source_config.clone()).to_string(),
            job.schedule,
            job.retention_days,
            job.retry_count,
            job.enabled as i64,
            job.credential_provider_id
        ],
    )
    .context("Failed to upsert job")?;
    tx.execute("DELETE FROM job_destinations WHERE job_id = ?1", params![job.id])?;
    for dest_id in destination_ids {
        tx.execute(
            "INSERT INTO job_destinations (job_id, destination_id) VALUES (?1, ?2)",
            params![job.id, dest_id],
        )
        .with_context(|| format!("Failed to link job {} to destination {dest_id}", job.id))?;
    }
    tx.commit()?;
    Ok(())
}

pub fn set_job_enabled(pool: &Pool, job_id: i64, enabled: bool) -> Result<()> {
    let conn = pool.get()?;
    let changed = conn.execute(
        "UPDATE jobs SET enabled = ?2, updated_at = datetime('now') WHERE id = ?1",
        params![job_id, enabled as i64],
    )?;
    if changed == 0 {
        anyhow::bail!("Job {} not found", job_id);
    }
    Ok(())
}

pub fn delete_job(pool: &Pool, job_id: i64) -> Result<()> {
    let conn = pool.get()?;
    let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![job_id])?;
    if changed == 0 {
        anyhow::bail!("Job {} not found", job_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;
    use serde_json::json;

    fn pool() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("catalog.db")).unwrap();
        (dir, pool)
    }

    fn obj(v: Value) -> ConfigMap {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_source_type_round_trips_through_str() {
        for t in [
            SourceType::Postgres,
            SourceType::Mysql,
            SourceType::Mongodb,
            SourceType::Redis,
            SourceType::S3,
        ] {
            assert_eq!(t.as_str().parse::<SourceType>().unwrap(), t);
        }
        assert!("oracle".parse::<SourceType>().is_err());
    }

    #[test]
    fn test_job_with_destinations() {
        let (_dir, pool) = pool();
        for (id, name) in [(1, "nas"), (2, "archive")] {
            upsert_destination(
                &pool,
                &Destination {
                    id,
                    name: name.into(),
                    kind: DestinationKind::Local,
                    config: obj(json!({ "path": format!("/backups/{name}") })),
                    credential_provider_id: None,
                },
            )
            .unwrap();
        }

        let job = Job {
            id: 10,
            name: "orders-db".into(),
            source_type: SourceType::Postgres,
            source_config: obj(json!({ "host": "db", "database": "orders" })),
            schedule: Some("0 3 * * *".into()),
            retention_days: 7,
            retry_count: 2,
            enabled: true,
            credential_provider_id: None,
        };
        upsert_job(&pool, &job, &[1, 2]).unwrap();

        let loaded = load_job(&pool, 10).unwrap().unwrap();
        assert_eq!(loaded.source_type, SourceType::Postgres);
        assert_eq!(loaded.source_config["database"], "orders");
        assert_eq!(destinations_for_job(&pool, 10).unwrap().len(), 2);
        assert_eq!(scheduled_jobs(&pool).unwrap().len(), 1);

        // Re-upserting replaces the destination set.
        upsert_job(&pool, &job, &[2]).unwrap();
        let dests = destinations_for_job(&pool, 10).unwrap();
        assert_eq!(dests.len(), 1);
        assert_eq!(dests[0].name, "archive");

        set_job_enabled(&pool, 10, false).unwrap();
        assert!(scheduled_jobs(&pool).unwrap().is_empty());

        delete_job(&pool, 10).unwrap();
        assert!(load_job(&pool, 10).unwrap().is_none());
        assert!(delete_job(&pool, 10).is_err());
    }
}
