//! Destination Distributor -- concurrent fan-out of one artifact.
//!
//! Every destination gets its own outcome; a failing destination never stops
//! the others. Object-storage destinations resolve credentials through their
//! credential provider at delivery time.

pub mod local;
pub mod retention;
pub mod s3;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{info, warn};

use crate::catalog::{Destination, DestinationKind};
use crate::credentials::CredentialResolver;
use crate::error::{BackupError, ExecutionLog};
use crate::sources::{Artifact, ArtifactBody};

pub use local::LocalTarget;
pub use s3::S3Target;

/// Where an artifact ended up.
#[derive(Debug, Clone)]
pub struct Delivered {
    /// Local path, or `s3://bucket/key` (folder key for listings).
    pub location: String,
    pub size_bytes: u64,
}

/// Outcome of delivering to one destination.
#[derive(Debug)]
pub struct Delivery {
    pub destination_id: i64,
    pub destination_name: String,
    pub result: Result<Delivered, BackupError>,
    /// Destination-local log; also attached to the error on failure.
    pub log: ExecutionLog,
}

impl Delivery {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// A destination ready to receive artifacts.
#[derive(Debug, Clone)]
pub enum Target {
    Local(LocalTarget),
    S3(S3Target),
}

#[derive(Debug, Clone)]
pub struct Distributor {
    backup_dir: PathBuf,
    credentials: CredentialResolver,
}

impl Distributor {
    pub fn new(backup_dir: PathBuf, credentials: CredentialResolver) -> Self {
        Self {
            backup_dir,
            credentials,
        }
    }

    /// Build the target for `dest`, resolving provider credentials for object storage.
    pub fn target(&self, dest: &Destination) -> Result<Target, BackupError> {
        match dest.kind {
            DestinationKind::Local => Ok(Target::Local(LocalTarget::from_config(
                &dest.config,
                &self.backup_dir,
            )?)),
            DestinationKind::S3 => {
                let provider_id = dest.credential_provider_id.ok_or_else(|| {
                    BackupError::configuration(format!(
                        "object storage destination '{}' has no credential provider",
                        dest.name
                    ))
                })?;
                let creds = self.credentials.provider_credentials(provider_id)?;
                Ok(Target::S3(S3Target::from_config(&dest.config, &creds)?))
            }
        }
    }

    async fn deliver_to(
        &self,
        target: &Target,
        artifact: &Artifact,
        log: &mut ExecutionLog,
    ) -> Result<Delivered, BackupError> {
        match (&artifact.body, target) {
            (ArtifactBody::File(path), Target::Local(t)) => {
                t.store_file(path, &artifact.name, artifact.size_bytes, log).await
            }
            (ArtifactBody::File(path), Target::S3(t)) => t.store_file(path, &artifact.name, log).await,
            (ArtifactBody::Listing(listing), Target::Local(t)) => {
                t.store_listing(listing, &artifact.name, log).await
            }
            (ArtifactBody::Listing(listing), Target::S3(t)) => {
                t.store_listing(listing, &artifact.name, log).await
            }
        }
    }

    async fn deliver(&self, artifact: &Artifact, dest: &Destination) -> Delivery {
        self.deliver_with(artifact, dest, self.target(dest)).await
    }

    async fn deliver_with(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        target: Result<Target, BackupError>,
    ) -> Delivery {
        let mut log = ExecutionLog::new();
        log.push(format!("destination '{}' ({})", dest.name, dest.kind));
        let result = match target {
            Ok(target) => self.deliver_to(&target, artifact, &mut log).await,
            Err(e) => Err(e),
        };
        let result = match result {
            Ok(delivered) => {
                log.push(format!(
                    "delivered {} bytes to {}",
                    delivered.size_bytes, delivered.location
                ));
                Ok(delivered)
            }
            Err(e) => {
                warn!(destination = %dest.name, error = %e, "delivery failed");
                let e = e.with_log(log.clone());
                log = e.log().clone();
                Err(e)
            }
        };
        Delivery {
            destination_id: dest.id,
            destination_name: dest.name.clone(),
            result,
            log,
        }
    }

    /// Deliver `artifact` to every destination concurrently.
    pub async fn distribute(&self, artifact: &Artifact, destinations: &[Destination]) -> Vec<Delivery> {
        let deliveries = join_all(destinations.iter().map(|d| self.deliver(artifact, d))).await;
        let ok = deliveries.iter().filter(|d| d.succeeded()).count();
        info!(
            artifact = %artifact.name,
            succeeded = ok,
            failed = deliveries.len() - ok,
            "fan-out finished"
        );
        deliveries
    }

    /// Remove artifacts named `{prefix}...` older than `retention_days` from `dest`.
    pub async fn prune(
        &self,
        dest: &Destination,
        prefix: &str,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> Result<usize, BackupError> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = now - chrono::Duration::days(i64::from(retention_days));
        match self.target(dest)? {
            Target::Local(t) => retention::prune_local(&t.dir, prefix, cutoff).await,
            Target::S3(t) => retention::prune_object_store(t.store.as_ref(), &t.prefix, prefix, cutoff).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ConfigMap;
    use crate::credentials::Cipher;
    use serde_json::{json, Map};
    use std::sync::Arc;

    fn distributor(dir: &std::path::Path) -> Distributor {
        let pool = crate::storage::open_pool(&dir.join("d.db")).unwrap();
        let resolver = CredentialResolver::new(Arc::new(Cipher::from_key(&[9u8; 32])), pool);
        Distributor::new(dir.join("backups"), resolver)
    }

    fn local(id: i64, path: &str) -> Destination {
        Destination {
            id,
            name: format!("local-{id}"),
            kind: DestinationKind::Local,
            config: json!({ "path": path }).as_object().cloned().unwrap(),
            credential_provider_id: None,
        }
    }

    fn artifact(dir: &std::path::Path) -> Artifact {
        let path = dir.join("postgres_orders_2024-01-01T00-00-00-000Z.sql.gz");
        std::fs::write(&path, b"payload").unwrap();
        Artifact {
            name: "postgres_orders_2024-01-01T00-00-00-000Z.sql.gz".into(),
            body: ArtifactBody::File(path),
            size_bytes: 7,
            metadata: Map::new(),
            log: ExecutionLog::new(),
        }
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let d = distributor(dir.path());
        let art = artifact(dir.path());
        // A file where a directory is expected makes the second copy fail.
        std::fs::write(dir.path().join("blocked"), b"").unwrap();
        let s3_without_provider = Destination {
            id: 3,
            name: "offsite".into(),
            kind: DestinationKind::S3,
            config: json!({ "bucket": "backups" }).as_object().cloned().unwrap(),
            credential_provider_id: None,
        };
        let dests = vec![
            local(1, "primary"),
            local(2, dir.path().join("blocked").to_str().unwrap()),
            s3_without_provider,
        ];

        let out = d.distribute(&art, &dests).await;
        assert_eq!(out.len(), 3);
        assert!(out[0].succeeded());
        assert_eq!(out[0].result.as_ref().unwrap().size_bytes, 7);
        assert!(dir.path().join("backups/primary").join(&art.name).exists());

        assert!(matches!(out[1].result, Err(BackupError::Copy { .. })));
        assert!(matches!(out[2].result, Err(BackupError::Configuration { .. })));
        assert!(out[2].log.to_string().contains("no credential provider"));
    }

    #[tokio::test]
    async fn test_listing_fan_out_with_failing_local_copy_is_partial() {
        use crate::sources::ObjectListing;
        use crate::tracker::{aggregate, EntryStatus, RunStatus};
        use object_store::memory::InMemory;
        use object_store::path::Path as ObjectPath;
        use object_store::{ObjectStore, PutPayload};

        let dir = tempfile::tempdir().unwrap();
        let d = distributor(dir.path());

        let source = Arc::new(InMemory::new());
        for (key, body) in [("data/a.csv", "alpha"), ("data/sub/b.csv", "beta!")] {
            source
                .put(&ObjectPath::from(key), PutPayload::from_static(body.as_bytes()))
                .await
                .unwrap();
        }
        let objects = s3::list_objects(source.as_ref(), "data").await.unwrap();
        let name = "s3_exports_2024-01-01T00-00-00-000Z";
        let artifact = Artifact {
            name: name.into(),
            body: ArtifactBody::Listing(ObjectListing {
                store: source.clone(),
                bucket: "exports".into(),
                prefix: "data".into(),
                objects,
            }),
            size_bytes: 10,
            metadata: Map::new(),
            log: ExecutionLog::new(),
        };

        let mirror = Arc::new(InMemory::new());
        let offsite = Destination {
            id: 1,
            name: "offsite".into(),
            kind: DestinationKind::S3,
            config: json!({ "bucket": "mirror", "prefix": "copies" }).as_object().cloned().unwrap(),
            credential_provider_id: Some(1),
        };
        // A file where the download directory should go.
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();
        let nas = local(2, blocked.to_str().unwrap());

        let deliveries = join_all([
            d.deliver_with(
                &artifact,
                &offsite,
                Ok(Target::S3(S3Target::with_store("mirror", Some("copies"), mirror.clone()))),
            ),
            d.deliver_with(&artifact, &nas, Ok(Target::Local(LocalTarget { dir: blocked.clone() }))),
        ])
        .await;

        let uploaded = deliveries[0].result.as_ref().unwrap();
        assert_eq!(uploaded.size_bytes, 10);
        assert_eq!(uploaded.location, format!("s3://mirror/copies/{name}/"));
        for (rel, len) in [("a.csv", 5), ("sub/b.csv", 5)] {
            let meta = mirror
                .head(&ObjectPath::from(format!("copies/{name}/{rel}")))
                .await
                .unwrap();
            assert_eq!(meta.size, len);
        }

        assert!(matches!(deliveries[1].result, Err(BackupError::Copy { .. })));
        assert!(blocked.is_file());

        let statuses: Vec<EntryStatus> = deliveries
            .iter()
            .map(|d| if d.succeeded() { EntryStatus::Completed } else { EntryStatus::Failed })
            .collect();
        assert_eq!(aggregate(&statuses), RunStatus::Partial);
    }

    #[tokio::test]
    async fn test_missing_provider_is_credential_error() {
        let dir = tempfile::tempdir().unwrap();
        let d = distributor(dir.path());
        let dest = Destination {
            id: 1,
            name: "offsite".into(),
            kind: DestinationKind::S3,
            config: ConfigMap::new(),
            credential_provider_id: Some(42),
        };
        assert!(matches!(d.target(&dest), Err(BackupError::Credential { .. })));
    }

    #[tokio::test]
    async fn test_prune_skips_zero_retention() {
        let dir = tempfile::tempdir().unwrap();
        let d = distributor(dir.path());
        let dest = local(1, "primary");
        let removed = d.prune(&dest, "postgres_orders_", 0, Utc::now()).await.unwrap();
        assert_eq!(removed, 0);
    }
}
