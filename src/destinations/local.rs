//! Local filesystem destination.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use super::{s3, Delivered};
use crate::catalog::ConfigMap;
use crate::error::{BackupError, ExecutionLog};
use crate::sources::object_storage::relative_key;
use crate::sources::ObjectListing;

#[derive(Deserialize)]
struct LocalConfig {
    path: String,
}

#[derive(Debug, Clone)]
pub struct LocalTarget {
    pub dir: PathBuf,
}

impl LocalTarget {
    /// Relative paths resolve under `base`.
    pub fn from_config(config: &ConfigMap, base: &Path) -> Result<Self, BackupError> {
        let cfg: LocalConfig = serde_json::from_value(serde_json::Value::Object(config.clone()))
            .map_err(|e| BackupError::configuration(format!("invalid local destination: {e}")))?;
        if cfg.path.trim().is_empty() {
            return Err(BackupError::configuration("local destination path is empty"));
        }
        let path = PathBuf::from(cfg.path.trim());
        let dir = if path.is_absolute() { path } else { base.join(path) };
        Ok(Self { dir })
    }

    async fn ensure_dir(&self) -> Result<(), BackupError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            BackupError::copy(format!("cannot create {}: {e}", self.dir.display()))
        })
    }

    /// Copy a finished artifact and confirm the copy's size.
    pub async fn store_file(
        &self,
        src: &Path,
        name: &str,
        expected: u64,
        log: &mut ExecutionLog,
    ) -> Result<Delivered, BackupError> {
        self.ensure_dir().await?;
        let dst = self.dir.join(name);
        log.push(format!("copying to {}", dst.display()));
        if let Err(e) = tokio::fs::copy(src, &dst).await {
            let _ = tokio::fs::remove_file(&dst).await;
            return Err(BackupError::copy(format!("copy to {} failed: {e}", dst.display())));
        }
        let size = tokio::fs::metadata(&dst)
            .await
            .map_err(|e| BackupError::copy(format!("cannot stat {}: {e}", dst.display())))?
            .len();
        if size != expected {
            let _ = tokio::fs::remove_file(&dst).await;
            return Err(BackupError::copy(format!(
                "size mismatch for {}: expected {expected} bytes, found {size}",
                dst.display()
            )));
        }
        info!(path = %dst.display(), size, "artifact stored locally");
        Ok(Delivered {
            location: dst.display().to_string(),
            size_bytes: size,
        })
    }

    async fn download_all(&self, listing: &ObjectListing, root: &Path) -> Result<u64, BackupError> {
        let mut total = 0u64;
        for object in &listing.objects {
            let rel = relative_key(&listing.prefix, object.location.as_ref())?;
            total += s3::download_object(listing.store.as_ref(), object, &root.join(&rel)).await?;
        }
        Ok(total)
    }

    /// Download every listed object under `{dir}/{name}/`, keeping relative paths.
    pub async fn store_listing(
        &self,
        listing: &ObjectListing,
        name: &str,
        log: &mut ExecutionLog,
    ) -> Result<Delivered, BackupError> {
        let root = self.dir.join(name);
        log.push(format!(
            "downloading {} objects to {}",
            listing.objects.len(),
            root.display()
        ));
        let total = match self.download_all(listing, &root).await {
            Ok(total) => total,
            Err(e) => {
                // Leave no half-mirrored folder behind.
                if let Err(rm) = tokio::fs::remove_dir_all(&root).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %root.display(), error = %rm, "failed to remove partial listing");
                    }
                }
                return Err(e);
            }
        };
        info!(path = %root.display(), objects = listing.objects.len(), total, "listing mirrored locally");
        Ok(Delivered {
            location: root.display().to_string(),
            size_bytes: total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_relative_path_resolves_under_base() {
        let cfg = json!({ "path": "nightly/pg" }).as_object().cloned().unwrap();
        let target = LocalTarget::from_config(&cfg, Path::new("/var/lib/stashd/backups")).unwrap();
        assert_eq!(target.dir, PathBuf::from("/var/lib/stashd/backups/nightly/pg"));

        let cfg = json!({ "path": "/mnt/nas" }).as_object().cloned().unwrap();
        let target = LocalTarget::from_config(&cfg, Path::new("/ignored")).unwrap();
        assert_eq!(target.dir, PathBuf::from("/mnt/nas"));

        let cfg = json!({}).as_object().cloned().unwrap();
        assert!(matches!(
            LocalTarget::from_config(&cfg, Path::new("/")),
            Err(BackupError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_store_file_creates_directory_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.sql.gz");
        std::fs::write(&src, b"0123456789").unwrap();
        let target = LocalTarget {
            dir: dir.path().join("out").join("deep"),
        };
        let mut log = ExecutionLog::new();
        let delivered = target.store_file(&src, "a.sql.gz", 10, &mut log).await.unwrap();
        assert_eq!(delivered.size_bytes, 10);
        assert!(target.dir.join("a.sql.gz").exists());
        assert!(src.exists());

        let err = target.store_file(&src, "b.sql.gz", 11, &mut log).await.unwrap_err();
        assert!(matches!(err, BackupError::Copy { .. }));
        assert!(!target.dir.join("b.sql.gz").exists());
    }

    #[tokio::test]
    async fn test_failed_copy_removes_destination_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = LocalTarget {
            dir: dir.path().join("out"),
        };
        std::fs::create_dir_all(&target.dir).unwrap();
        // Left over from an earlier interrupted copy.
        std::fs::write(target.dir.join("a.sql.gz"), b"partial").unwrap();

        let mut log = ExecutionLog::new();
        let err = target
            .store_file(&dir.path().join("missing.sql.gz"), "a.sql.gz", 10, &mut log)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Copy { .. }));
        assert!(!target.dir.join("a.sql.gz").exists());
    }

    #[tokio::test]
    async fn test_failed_listing_download_leaves_no_partial_folder() {
        use object_store::memory::InMemory;
        use object_store::path::Path as ObjectPath;
        use object_store::{ObjectStore, PutPayload};
        use std::sync::Arc;

        let store = Arc::new(InMemory::new());
        for key in ["data/a.csv", "data/b.csv"] {
            store
                .put(&ObjectPath::from(key), PutPayload::from_static(b"rows"))
                .await
                .unwrap();
        }
        let objects = s3::list_objects(store.as_ref(), "data").await.unwrap();
        // Vanishes between listing and download.
        store.delete(&ObjectPath::from("data/b.csv")).await.unwrap();
        let listing = ObjectListing {
            store: store.clone(),
            bucket: "exports".into(),
            prefix: "data".into(),
            objects,
        };

        let dir = tempfile::tempdir().unwrap();
        let target = LocalTarget {
            dir: dir.path().to_path_buf(),
        };
        let mut log = ExecutionLog::new();
        let err = target.store_listing(&listing, "s3_exports", &mut log).await.unwrap_err();
        assert!(matches!(err, BackupError::Copy { .. }));
        assert!(!dir.path().join("s3_exports").exists());
    }
}
