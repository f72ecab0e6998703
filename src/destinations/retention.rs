//! Retention pruning: remove a job's artifacts older than its retention period.
//!
//! Artifacts are recognised by name: `{sourcetype}_{identifier}_` followed by
//! the `YYYY-MM-DDT` start of the artifact timestamp.

use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use object_store::ObjectStore;
use tracing::{debug, warn};

use super::s3;
use crate::error::BackupError;

/// True when `name` is an artifact (file or folder) produced under `prefix`.
pub fn is_artifact_of(name: &str, prefix: &str) -> bool {
    let Some(rest) = name.strip_prefix(prefix) else {
        return false;
    };
    let b = rest.as_bytes();
    b.len() > 11
        && b[..4].iter().all(u8::is_ascii_digit)
        && b[4] == b'-'
        && b[5..7].iter().all(u8::is_ascii_digit)
        && b[7] == b'-'
        && b[8..10].iter().all(u8::is_ascii_digit)
        && b[10] == b'T'
}

/// Delete expired artifacts directly inside `dir`.
pub async fn prune_local(dir: &Path, prefix: &str, cutoff: DateTime<Utc>) -> Result<usize, BackupError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(BackupError::copy(format!("cannot read {}: {e}", dir.display())));
        }
    };
    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| BackupError::copy(format!("cannot read {}: {e}", dir.display())))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_artifact_of(&name, prefix) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let modified: DateTime<Utc> = meta.modified().unwrap_or(SystemTime::now()).into();
        if modified >= cutoff {
            continue;
        }
        let path = entry.path();
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => {
                debug!(path = %path.display(), "pruned expired artifact");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to prune artifact"),
        }
    }
    Ok(removed)
}

/// Delete expired artifact objects (files and mirrored folders) under `prefix_root`.
pub async fn prune_object_store(
    store: &dyn ObjectStore,
    prefix_root: &str,
    prefix: &str,
    cutoff: DateTime<Utc>,
) -> Result<usize, BackupError> {
    let objects = s3::list_objects(store, prefix_root)
        .await
        .map_err(|e| BackupError::upload(format!("cannot list {prefix_root}: {e}")))?;
    let mut removed = 0;
    for object in objects {
        let key = object.location.as_ref();
        let rel = key.strip_prefix(prefix_root).unwrap_or(key);
        let top = rel.split('/').next().unwrap_or(rel);
        if !is_artifact_of(top, prefix) || object.last_modified >= cutoff {
            continue;
        }
        match store.delete(&object.location).await {
            Ok(()) => {
                debug!(key, "pruned expired object");
                removed += 1;
            }
            Err(e) => warn!(key, error = %e, "failed to prune object"),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use object_store::PutPayload;

    #[test]
    fn test_artifact_name_matching() {
        let p = "postgres_orders_";
        assert!(is_artifact_of("postgres_orders_2024-03-05T14-07-09-000Z.sql.gz", p));
        assert!(is_artifact_of("postgres_orders_2024-03-05T14-07-09-000Z", p));
        assert!(!is_artifact_of("postgres_orders_v2_2024-03-05T14-07-09-000Z.sql.gz", p));
        assert!(!is_artifact_of("notes.txt", p));
    }

    #[tokio::test]
    async fn test_prune_local_removes_only_expired_matches() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("redis_cache_2020-01-01T00-00-00-000Z.rdb.gz");
        let other = dir.path().join("redis_other_2020-01-01T00-00-00-000Z.rdb.gz");
        std::fs::write(&old, b"x").unwrap();
        std::fs::write(&other, b"x").unwrap();

        // Nothing is older than a cutoff in the past.
        let past = Utc::now() - chrono::Duration::days(1);
        assert_eq!(prune_local(dir.path(), "redis_cache_", past).await.unwrap(), 0);

        let future = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(prune_local(dir.path(), "redis_cache_", future).await.unwrap(), 1);
        assert!(!old.exists());
        assert!(other.exists());

        assert_eq!(
            prune_local(&dir.path().join("missing"), "redis_cache_", future).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_prune_object_store_handles_files_and_folders() {
        let store = InMemory::new();
        for key in [
            "nightly/s3_media_2020-01-01T00-00-00-000Z/a.png",
            "nightly/s3_media_2020-01-01T00-00-00-000Z/b/c.png",
            "nightly/mysql_shop_2020-01-01T00-00-00-000Z.sql.gz",
            "elsewhere/s3_media_2020-01-01T00-00-00-000Z/a.png",
        ] {
            store
                .put(&ObjectPath::from(key), PutPayload::from_static(b"x"))
                .await
                .unwrap();
        }
        let future = Utc::now() + chrono::Duration::seconds(5);
        let removed = prune_object_store(&store, "nightly/", "s3_media_", future).await.unwrap();
        assert_eq!(removed, 2);
        let left = s3::list_objects(&store, "").await.unwrap();
        assert_eq!(left.len(), 2);
    }
}
