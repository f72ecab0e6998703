//! Source Strategies -- one per source type, selected once per run.
//!
//! Every strategy turns decrypted source configuration into a single
//! [`Artifact`]: a compressed file in the run's working directory, or, for
//! object-storage sources, a listing the distributor syncs directly.

pub mod compress;
pub mod mongodb;
pub mod mysql;
pub mod object_storage;
pub mod postgres;
pub mod redis;
pub mod validate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use object_store::{ObjectMeta, ObjectStore};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::catalog::{ConfigMap, Job, SourceType};
use crate::config::{ExecutionConfig, ToolsConfig};
use crate::credentials::CredentialResolver;
use crate::error::{BackupError, ExecutionLog};
use crate::process::ProcessRunner;

pub use mongodb::MongoSource;
pub use mysql::MysqlSource;
pub use object_storage::ObjectStorageSource;
pub use postgres::PostgresSource;
pub use redis::RedisSource;

/// Objects found under a source bucket/prefix, still remote.
#[derive(Clone)]
pub struct ObjectListing {
    pub store: Arc<dyn ObjectStore>,
    pub bucket: String,
    /// Normalised source prefix without trailing slash; empty for the whole bucket.
    pub prefix: String,
    pub objects: Vec<ObjectMeta>,
}

impl std::fmt::Debug for ObjectListing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectListing")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("objects", &self.objects.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum ArtifactBody {
    File(PathBuf),
    Listing(ObjectListing),
}

/// The single output of a source strategy.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// File name, or folder name for listings.
    pub name: String,
    pub body: ArtifactBody,
    /// Compressed size for files, sum of object sizes for listings.
    pub size_bytes: u64,
    pub metadata: Map<String, Value>,
    pub log: ExecutionLog,
}

/// Everything a strategy needs besides its own configuration.
pub struct StrategyContext<'a> {
    pub workdir: &'a Path,
    pub runner: &'a ProcessRunner,
    pub tools: &'a ToolsConfig,
    pub execution: &'a ExecutionConfig,
    pub credentials: &'a CredentialResolver,
    /// Artifact base name without extension.
    pub stem: String,
}

/// Closed set of source kinds.
#[derive(Debug, Clone)]
pub enum Source {
    Postgres(PostgresSource),
    Mysql(MysqlSource),
    Mongodb(MongoSource),
    Redis(RedisSource),
    ObjectStorage(ObjectStorageSource),
}

pub(crate) fn parse_config<T: DeserializeOwned>(
    source_type: SourceType,
    config: ConfigMap,
) -> Result<T, BackupError> {
    serde_json::from_value(Value::Object(config)).map_err(|e| {
        BackupError::configuration(format!("invalid {source_type} source configuration: {e}"))
    })
}

impl Source {
    /// Build and validate the strategy for `job` from its decrypted configuration.
    pub fn from_job(job: &Job, decrypted: ConfigMap) -> Result<Self, BackupError> {
        let source = match job.source_type {
            SourceType::Postgres => Source::Postgres(parse_config(job.source_type, decrypted)?),
            SourceType::Mysql => Source::Mysql(parse_config(job.source_type, decrypted)?),
            SourceType::Mongodb => Source::Mongodb(parse_config(job.source_type, decrypted)?),
            SourceType::Redis => Source::Redis(parse_config(job.source_type, decrypted)?),
            SourceType::S3 => {
                Source::ObjectStorage(ObjectStorageSource::from_config(decrypted, job.credential_provider_id)?)
            }
        };
        source.validate()?;
        Ok(source)
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            Source::Postgres(_) => SourceType::Postgres,
            Source::Mysql(_) => SourceType::Mysql,
            Source::Mongodb(_) => SourceType::Mongodb,
            Source::Redis(_) => SourceType::Redis,
            Source::ObjectStorage(_) => SourceType::S3,
        }
    }

    /// Human-meaningful part of the artifact name.
    pub fn identifier(&self) -> String {
        match self {
            Source::Postgres(s) => s.database.clone(),
            Source::Mysql(s) => s.database.clone(),
            Source::Mongodb(s) => s.identifier(),
            Source::Redis(s) => s.host.clone(),
            Source::ObjectStorage(s) => s.bucket.clone(),
        }
    }

    /// Reject unsafe or missing fields before any process is spawned.
    pub fn validate(&self) -> Result<(), BackupError> {
        match self {
            Source::Postgres(s) => s.validate(),
            Source::Mysql(s) => s.validate(),
            Source::Mongodb(s) => s.validate(),
            Source::Redis(s) => s.validate(),
            Source::ObjectStorage(s) => s.validate(),
        }
    }

    pub async fn execute(&self, ctx: &StrategyContext<'_>) -> Result<Artifact, BackupError> {
        match self {
            Source::Postgres(s) => s.execute(ctx).await,
            Source::Mysql(s) => s.execute(ctx).await,
            Source::Mongodb(s) => s.execute(ctx).await,
            Source::Redis(s) => s.execute(ctx).await,
            Source::ObjectStorage(s) => s.execute(ctx).await,
        }
    }
}

/// `{sourcetype}_{identifier}_`, shared by every artifact of one source.
pub fn artifact_prefix(source_type: SourceType, identifier: &str) -> String {
    let ident: String = identifier
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let ident = if ident.is_empty() { "default".to_string() } else { ident };
    format!("{source_type}_{ident}_")
}

/// `{sourcetype}_{identifier}_{timestamp}` with a filesystem- and key-safe timestamp.
pub fn artifact_stem(source_type: SourceType, identifier: &str, at: DateTime<Utc>) -> String {
    let stamp = at
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("{}{stamp}", artifact_prefix(source_type, identifier))
}

/// Build a file artifact from a compressed output file.
pub(crate) async fn file_artifact(
    path: PathBuf,
    metadata: Map<String, Value>,
    log: ExecutionLog,
) -> Result<Artifact, BackupError> {
    let size_bytes = tokio::fs::metadata(&path)
        .await
        .map_err(|e| BackupError::execution(format!("cannot stat {}: {e}", path.display())).with_log(log.clone()))?
        .len();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Artifact {
        name,
        body: ArtifactBody::File(path),
        size_bytes,
        metadata,
        log,
    })
}

#[cfg(test)]
pub(crate) mod harness {
    use super::*;
    use crate::credentials::Cipher;

    /// Owns everything a [`StrategyContext`] borrows.
    pub struct Harness {
        pub dir: tempfile::TempDir,
        pub runner: ProcessRunner,
        pub tools: ToolsConfig,
        pub execution: ExecutionConfig,
        pub credentials: CredentialResolver,
    }

    impl Harness {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let pool = crate::storage::open_pool(&dir.path().join("harness.db")).unwrap();
            let credentials = CredentialResolver::new(Arc::new(Cipher::from_key(&[1u8; 32])), pool);
            Self {
                dir,
                runner: ProcessRunner::new(std::time::Duration::from_secs(1)),
                tools: ToolsConfig::default(),
                execution: ExecutionConfig::default(),
                credentials,
            }
        }

        pub fn ctx(&self, stem: &str) -> StrategyContext<'_> {
            StrategyContext {
                workdir: self.dir.path(),
                runner: &self.runner,
                tools: &self.tools,
                execution: &self.execution,
                credentials: &self.credentials,
                stem: stem.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn job(source_type: SourceType) -> Job {
        Job {
            id: 1,
            name: "j".into(),
            source_type,
            source_config: ConfigMap::new(),
            schedule: None,
            retention_days: 7,
            retry_count: 0,
            enabled: true,
            credential_provider_id: None,
        }
    }

    fn obj(v: Value) -> ConfigMap {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_artifact_stem_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        assert_eq!(
            artifact_stem(SourceType::Postgres, "orders", at),
            "postgres_orders_2024-03-05T14-07-09-000Z"
        );
        assert_eq!(
            artifact_stem(SourceType::Redis, "cache.internal", at),
            "redis_cache-internal_2024-03-05T14-07-09-000Z"
        );
    }

    #[test]
    fn test_from_job_dispatches_by_type() {
        let pg = Source::from_job(
            &job(SourceType::Postgres),
            obj(json!({ "host": "db", "username": "app", "database": "orders" })),
        )
        .unwrap();
        assert_eq!(pg.source_type(), SourceType::Postgres);
        assert_eq!(pg.identifier(), "orders");

        let redis = Source::from_job(&job(SourceType::Redis), obj(json!({ "host": "cache" }))).unwrap();
        assert_eq!(redis.identifier(), "cache");
    }

    #[test]
    fn test_from_job_rejects_missing_fields() {
        let err = Source::from_job(&job(SourceType::Postgres), obj(json!({ "host": "db" }))).unwrap_err();
        assert!(matches!(err, BackupError::Configuration { .. }));
    }

    #[test]
    fn test_shell_metacharacters_are_rejected_before_execution() {
        for (field, value) in [
            ("host", "db; rm -rf /"),
            ("username", "app$(id)"),
            ("database", "orders`reboot`"),
        ] {
            let mut cfg = obj(json!({ "host": "db", "username": "app", "database": "orders" }));
            cfg.insert(field.into(), json!(value));
            for t in [SourceType::Postgres, SourceType::Mysql] {
                let err = Source::from_job(&job(t), cfg.clone()).unwrap_err();
                assert!(
                    matches!(err, BackupError::Configuration { .. }),
                    "{t} accepted {field}={value}"
                );
            }
        }
    }
}
