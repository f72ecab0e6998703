//! Artifact compression: gzip for files, tar+gzip for directories.
//!
//! The uncompressed original is removed once the compressed file is complete.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::BackupError;

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn gzip_blocking(src: &Path, dst: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(src)?);
    let out = BufWriter::new(OpenOptions::new().write(true).create_new(true).open(dst)?);
    let mut encoder = GzEncoder::new(out, Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    fs::remove_file(src)
}

fn tar_gz_blocking(src: &Path, dst: &Path) -> io::Result<()> {
    let out = BufWriter::new(OpenOptions::new().write(true).create_new(true).open(dst)?);
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let root = src
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("dump"));
    builder.append_dir_all(&root, src)?;
    let encoder = builder.into_inner()?;
    encoder.finish()?.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    fs::remove_dir_all(src)
}

async fn blocking(
    label: &'static str,
    src: PathBuf,
    dst: PathBuf,
    f: fn(&Path, &Path) -> io::Result<()>,
) -> Result<PathBuf, BackupError> {
    let task_dst = dst.clone();
    let task_src = src.clone();
    let result = tokio::task::spawn_blocking(move || f(&task_src, &task_dst))
        .await
        .map_err(|e| BackupError::execution(format!("{label} task failed: {e}")))?;
    match result {
        Ok(()) => Ok(dst),
        Err(e) => {
            let _ = fs::remove_file(&dst);
            Err(BackupError::execution(format!(
                "{label} of {} failed: {e}",
                src.display()
            )))
        }
    }
}

/// Gzip `path` into `path.gz` and delete `path`.
pub async fn gzip_file(path: &Path) -> Result<PathBuf, BackupError> {
    let dst = with_suffix(path, ".gz");
    blocking("gzip", path.to_path_buf(), dst, gzip_blocking).await
}

/// Archive directory `dir` into `dir.tar.gz` and delete `dir`.
pub async fn tar_gz_dir(dir: &Path) -> Result<PathBuf, BackupError> {
    let dst = with_suffix(dir, ".tar.gz");
    blocking("tar.gz", dir.to_path_buf(), dst, tar_gz_blocking).await
}
