//! S3-compatible object storage: client construction and transfers.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use futures::{Stream, StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore, WriteMultipart};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::Delivered;
use crate::catalog::ConfigMap;
use crate::credentials::S3Credentials;
use crate::error::{BackupError, ExecutionLog};
use crate::sources::object_storage::relative_key;
use crate::sources::ObjectListing;

pub const DEFAULT_REGION: &str = "us-east-1";
const PART_SIZE: usize = 8 * 1024 * 1024;
const MAX_PARTS_IN_FLIGHT: usize = 4;

/// Build a client for `bucket` from resolved credentials.
pub fn build_store(creds: &S3Credentials, bucket: &str) -> Result<Arc<dyn ObjectStore>, BackupError> {
    let region = creds
        .region
        .as_deref()
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_REGION);
    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_region(region)
        .with_access_key_id(&creds.access_key_id)
        .with_secret_access_key(&creds.secret_access_key);

    if let Some(endpoint) = creds.endpoint.as_deref().filter(|e| !e.is_empty()) {
        let endpoint = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("https://{endpoint}")
        };
        builder = builder
            .with_allow_http(endpoint.starts_with("http://"))
            .with_virtual_hosted_style_request(false)
            .with_endpoint(endpoint);
    }

    let store = builder
        .build()
        .map_err(|e| BackupError::configuration(format!("invalid object storage settings: {e}")))?;
    debug!(bucket, region, "object storage client ready");
    Ok(Arc::new(store))
}

/// Normalise a user-supplied prefix to `""` or `"a/b/"`.
pub fn normalize_prefix(prefix: Option<&str>) -> String {
    let trimmed = prefix.unwrap_or("").trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// Destination prefix (normalised) + artifact file name.
pub fn object_key(prefix: Option<&str>, name: &str) -> String {
    format!("{}{name}", normalize_prefix(prefix))
}

pub fn parse_key(key: &str) -> Result<ObjectPath, BackupError> {
    ObjectPath::parse(key)
        .map_err(|e| BackupError::configuration(format!("invalid object key '{key}': {e}")))
}

async fn write_multipart<S, E>(
    store: &dyn ObjectStore,
    path: &ObjectPath,
    mut chunks: S,
    wrap: fn(String) -> BackupError,
) -> Result<(), BackupError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let upload = store
        .put_multipart(path)
        .await
        .map_err(|e| wrap(format!("cannot start upload of {path}: {e}")))?;
    let mut writer = WriteMultipart::new_with_chunk_size(upload, PART_SIZE);
    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = writer.abort().await;
                return Err(wrap(format!("read failed while uploading {path}: {e}")));
            }
        };
        if let Err(e) = writer.wait_for_capacity(MAX_PARTS_IN_FLIGHT).await {
            let _ = writer.abort().await;
            return Err(wrap(format!("upload of {path} failed: {e}")));
        }
        writer.write(&chunk);
    }
    writer
        .finish()
        .await
        .map_err(|e| wrap(format!("cannot complete upload of {path}: {e}")))?;
    Ok(())
}

fn file_chunks(file: tokio::fs::File) -> impl Stream<Item = std::io::Result<Bytes>> + Unpin {
    Box::pin(futures::stream::try_unfold(file, |mut file| async move {
        let mut buf = vec![0u8; PART_SIZE];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        buf.truncate(n);
        Ok(Some((Bytes::from(buf), file)))
    }))
}

async fn confirm_size(
    store: &dyn ObjectStore,
    path: &ObjectPath,
    expected: u64,
    wrap: fn(String) -> BackupError,
) -> Result<u64, BackupError> {
    let meta = store
        .head(path)
        .await
        .map_err(|e| wrap(format!("cannot verify {path}: {e}")))?;
    let size = meta.size as u64;
    if size != expected {
        return Err(wrap(format!(
            "size mismatch for {path}: expected {expected} bytes, found {size}"
        )));
    }
    Ok(size)
}

/// Multipart-upload a local file and confirm its size with HEAD.
pub async fn upload_file(
    store: &dyn ObjectStore,
    key: &str,
    local: &Path,
) -> Result<u64, BackupError> {
    let path = parse_key(key)?;
    let file = tokio::fs::File::open(local)
        .await
        .map_err(|e| BackupError::upload(format!("cannot open {}: {e}", local.display())))?;
    let expected = file
        .metadata()
        .await
        .map_err(|e| BackupError::upload(format!("cannot stat {}: {e}", local.display())))?
        .len();
    write_multipart(store, &path, file_chunks(file), BackupError::upload).await?;
    let size = confirm_size(store, &path, expected, BackupError::upload).await?;
    info!(key, size, "uploaded artifact");
    Ok(size)
}

/// Stream one object from `src` into `dst` under `to`.
pub async fn copy_object(
    src: &dyn ObjectStore,
    object: &ObjectMeta,
    dst: &dyn ObjectStore,
    to: &ObjectPath,
) -> Result<u64, BackupError> {
    let body = src
        .get(&object.location)
        .await
        .map_err(|e| BackupError::copy(format!("cannot read {}: {e}", object.location)))?
        .into_stream();
    write_multipart(dst, to, body, BackupError::copy).await?;
    confirm_size(dst, to, object.size as u64, BackupError::copy).await
}

/// Stream one object into a local file, creating parent directories.
pub async fn download_object(
    src: &dyn ObjectStore,
    object: &ObjectMeta,
    local: &Path,
) -> Result<u64, BackupError> {
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BackupError::copy(format!("cannot create {}: {e}", parent.display())))?;
    }
    let mut body = src
        .get(&object.location)
        .await
        .map_err(|e| BackupError::copy(format!("cannot read {}: {e}", object.location)))?
        .into_stream();
    let mut file = tokio::fs::File::create(local)
        .await
        .map_err(|e| BackupError::copy(format!("cannot create {}: {e}", local.display())))?;
    let mut written = 0u64;
    while let Some(chunk) = body
        .try_next()
        .await
        .map_err(|e| BackupError::copy(format!("download of {} failed: {e}", object.location)))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|e| BackupError::copy(format!("write to {} failed: {e}", local.display())))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| BackupError::copy(format!("write to {} failed: {e}", local.display())))?;
    if written != object.size as u64 {
        return Err(BackupError::copy(format!(
            "size mismatch for {}: expected {} bytes, wrote {written}",
            object.location, object.size
        )));
    }
    Ok(written)
}

/// All objects under `prefix`; leading and trailing slashes are ignored.
pub async fn list_objects(store: &dyn ObjectStore, prefix: &str) -> Result<Vec<ObjectMeta>, object_store::Error> {
    let trimmed = prefix.trim_matches('/');
    let prefix_path = (!trimmed.is_empty()).then(|| ObjectPath::from(trimmed));
    store.list(prefix_path.as_ref()).try_collect().await
}

/// Bucket/prefix of an object-storage destination with a ready client.
#[derive(Clone)]
pub struct S3Target {
    pub bucket: String,
    pub prefix: String,
    pub store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for S3Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Target")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct S3Config {
    bucket: String,
    #[serde(default)]
    prefix: Option<String>,
}

impl S3Target {
    pub fn from_config(config: &ConfigMap, creds: &S3Credentials) -> Result<Self, BackupError> {
        let cfg: S3Config = serde_json::from_value(serde_json::Value::Object(config.clone()))
            .map_err(|e| BackupError::configuration(format!("invalid s3 destination: {e}")))?;
        if cfg.bucket.trim().is_empty() {
            return Err(BackupError::configuration("s3 destination bucket is empty"));
        }
        let store = build_store(creds, &cfg.bucket)?;
        Ok(Self {
            prefix: normalize_prefix(cfg.prefix.as_deref()),
            bucket: cfg.bucket,
            store,
        })
    }

    /// Bucket config without touching credentials, for tests and dry runs.
    pub fn with_store(bucket: &str, prefix: Option<&str>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            store,
        }
    }

    fn url(&self, key: &str) -> String {
        format!("s3://{}/{key}", self.bucket)
    }

    pub async fn store_file(
        &self,
        src: &Path,
        name: &str,
        log: &mut ExecutionLog,
    ) -> Result<Delivered, BackupError> {
        let key = format!("{}{name}", self.prefix);
        log.push(format!("uploading to {}", self.url(&key)));
        let size = upload_file(self.store.as_ref(), &key, src).await?;
        Ok(Delivered {
            location: self.url(&key),
            size_bytes: size,
        })
    }

    /// Copy every listed object under `{prefix}{name}/`, keeping relative paths.
    pub async fn store_listing(
        &self,
        listing: &ObjectListing,
        name: &str,
        log: &mut ExecutionLog,
    ) -> Result<Delivered, BackupError> {
        let root = format!("{}{name}/", self.prefix);
        log.push(format!(
            "copying {} objects from s3://{}/{} to {}",
            listing.objects.len(),
            listing.bucket,
            listing.prefix,
            self.url(&root)
        ));
        let mut total = 0u64;
        for object in &listing.objects {
            let rel = relative_key(&listing.prefix, object.location.as_ref())?;
            let to = parse_key(&format!("{root}{rel}"))?;
            total += copy_object(listing.store.as_ref(), object, self.store.as_ref(), &to).await?;
        }
        info!(dest = %self.url(&root), objects = listing.objects.len(), total, "listing mirrored");
        Ok(Delivered {
            location: self.url(&root),
            size_bytes: total,
        })
    }
}
