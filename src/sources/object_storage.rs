use serde::Deserialize;
use serde_json::{json, Map};
use tracing::info;

use super::{parse_config, Artifact, ArtifactBody, ObjectListing, StrategyContext};
use crate::catalog::{ConfigMap, SourceType};
use crate::credentials::{CredentialSource, S3Credentials};
use crate::destinations::s3;
use crate::error::{BackupError, ExecutionLog};

#[derive(Deserialize)]
struct RawConfig {
    bucket: String,
    #[serde(default)]
    prefix: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    access_key_id: Option<String>,
    #[serde(default)]
    secret_access_key: Option<String>,
}

/// Bucket/prefix to mirror, plus where its credentials come from.
#[derive(Debug, Clone)]
pub struct ObjectStorageSource {
    pub bucket: String,
    pub prefix: Option<String>,
    pub credentials: CredentialSource,
}

impl ObjectStorageSource {
    /// A job-level provider reference wins over inline keys.
    pub fn from_config(config: ConfigMap, provider_id: Option<i64>) -> Result<Self, BackupError> {
        let raw: RawConfig = parse_config(SourceType::S3, config)?;
        let credentials = match provider_id {
            Some(id) => CredentialSource::Provider(id),
            None => {
                let (Some(access_key_id), Some(secret_access_key)) = (
                    raw.access_key_id.filter(|v| !v.is_empty()),
                    raw.secret_access_key.filter(|v| !v.is_empty()),
                ) else {
                    return Err(BackupError::configuration(
                        "s3 source needs a credential provider or access_key_id and secret_access_key",
                    ));
                };
                CredentialSource::Inline(S3Credentials {
                    endpoint: raw.endpoint,
                    region: raw.region,
                    access_key_id,
                    secret_access_key,
                })
            }
        };
        Ok(Self {
            bucket: raw.bucket,
            prefix: raw.prefix,
            credentials,
        })
    }

    pub fn validate(&self) -> Result<(), BackupError> {
        let valid_bucket = (3..=63).contains(&self.bucket.len())
            && self
                .bucket
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-');
        if !valid_bucket {
            return Err(BackupError::configuration(format!(
                "invalid bucket name '{}'",
                self.bucket
            )));
        }
        if let Some(prefix) = &self.prefix {
            if prefix.split('/').any(|part| part == "..") {
                return Err(BackupError::configuration("prefix must not contain '..'"));
            }
        }
        Ok(())
    }

    pub async fn execute(&self, ctx: &StrategyContext<'_>) -> Result<Artifact, BackupError> {
        let mut log = ExecutionLog::new();
        let prefix = s3::normalize_prefix(self.prefix.as_deref());
        log.push(format!("listing s3://{}/{prefix}", self.bucket));

        let creds = ctx
            .credentials
            .resolve(&self.credentials)
            .map_err(|e| e.with_log(log.clone()))?;
        let store = s3::build_store(&creds, &self.bucket).map_err(|e| e.with_log(log.clone()))?;
        let objects = s3::list_objects(store.as_ref(), &prefix).await.map_err(|e| {
            BackupError::execution(format!("cannot list s3://{}/{prefix}: {e}", self.bucket))
                .with_log(log.clone())
        })?;
        if objects.is_empty() {
            return Err(BackupError::execution(format!(
                "no objects found under s3://{}/{prefix}",
                self.bucket
            ))
            .with_log(log));
        }

        let size_bytes: u64 = objects.iter().map(|o| o.size as u64).sum();
        log.push(format!("found {} objects, {size_bytes} bytes", objects.len()));
        info!(bucket = %self.bucket, objects = objects.len(), size_bytes, "source listing complete");

        let mut metadata = Map::new();
        metadata.insert("bucket".into(), json!(self.bucket));
        metadata.insert("prefix".into(), json!(prefix));
        metadata.insert("object_count".into(), json!(objects.len()));
        Ok(Artifact {
            name: ctx.stem.clone(),
            body: ArtifactBody::Listing(ObjectListing {
                store,
                bucket: self.bucket.clone(),
                prefix: prefix.trim_end_matches('/').to_string(),
                objects,
            }),
            size_bytes,
            metadata,
            log,
        })
    }
}

/// Path of `key` below `prefix`, refusing anything that could escape a target.
pub fn relative_key(prefix: &str, key: &str) -> Result<String, BackupError> {
    let rest = if prefix.is_empty() {
        key
    } else {
        key.strip_prefix(prefix)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| BackupError::copy(format!("object '{key}' is outside prefix '{prefix}'")))?
    };
    if rest.is_empty() {
        return Err(BackupError::copy(format!("object '{key}' has an empty relative path")));
    }
    if rest
        .split(['/', '\\'])
        .any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(BackupError::copy(format!(
            "object '{key}' has an unsafe relative path"
        )));
    }
    Ok(rest.to_string())
}
