use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Map};
use tracing::{debug, info};

use super::{compress, file_artifact, validate, Artifact, StrategyContext};
use crate::error::{BackupError, ExecutionLog};
use crate::process::CommandSpec;

const VERSION_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const SSL_MODES: &[&str] = &["disable", "allow", "prefer", "require", "verify-ca", "verify-full"];

fn default_port() -> u16 {
    5432
}

#[derive(Clone, Deserialize)]
pub struct PostgresSource {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    pub database: String,
    #[serde(default)]
    pub ssl_mode: Option<String>,
}

impl std::fmt::Debug for PostgresSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresSource")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .finish_non_exhaustive()
    }
}

/// `SHOW server_version_num` output, e.g. `160002` or `90624`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerVersion {
    pub num: u32,
}

impl ServerVersion {
    pub fn parse(raw: &str) -> Option<Self> {
        raw.trim().parse().ok().filter(|n| *n > 0).map(|num| Self { num })
    }

    /// 9.6 is treated as major 9; install roots use the same naming.
    pub fn major(&self) -> u32 {
        self.num / 10_000
    }

    /// Human form: `16.2`, `9.6.24`.
    pub fn display(&self) -> String {
        if self.num >= 100_000 {
            format!("{}.{}", self.num / 10_000, self.num % 10_000)
        } else {
            format!(
                "{}.{}.{}",
                self.num / 10_000,
                (self.num / 100) % 100,
                self.num % 100
            )
        }
    }
}

/// Highest `<root>/<major>/bin/pg_dump` with major >= `server_major`.
pub fn select_pg_dump(roots: &[PathBuf], server_major: u32) -> Option<(u32, PathBuf)> {
    let mut best: Option<(u32, PathBuf)> = None;
    for root in roots {
        let Ok(entries) = std::fs::read_dir(root) else {
            continue;
        };
        for entry in entries.flatten() {
            let Some(major) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            if major < server_major {
                continue;
            }
            let candidate = entry.path().join("bin").join("pg_dump");
            if !candidate.is_file() {
                continue;
            }
            if best.as_ref().map_or(true, |(m, _)| major > *m) {
                best = Some((major, candidate));
            }
        }
    }
    best
}

impl PostgresSource {
    pub fn validate(&self) -> Result<(), BackupError> {
        validate::host(&self.host)?;
        validate::port(self.port)?;
        validate::username(&self.username)?;
        validate::database(&self.database)?;
        if let Some(mode) = &self.ssl_mode {
            if !SSL_MODES.contains(&mode.as_str()) {
                return Err(BackupError::configuration(format!(
                    "unsupported ssl_mode '{mode}'"
                )));
            }
        }
        Ok(())
    }

    fn connection_args(&self) -> Vec<String> {
        vec![
            "-h".into(),
            self.host.clone(),
            "-p".into(),
            self.port.to_string(),
            "-U".into(),
            self.username.clone(),
            "-d".into(),
            self.database.clone(),
            "--no-password".into(),
        ]
    }

    fn with_env(&self, mut spec: CommandSpec) -> CommandSpec {
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            spec = spec.env("PGPASSWORD", password);
        }
        if let Some(mode) = &self.ssl_mode {
            spec = spec.env("PGSSLMODE", mode);
        }
        spec
    }

    async fn detect_version(
        &self,
        ctx: &StrategyContext<'_>,
        log: &mut ExecutionLog,
    ) -> Result<ServerVersion, BackupError> {
        let spec = self.with_env(
            CommandSpec::new(&ctx.tools.psql, VERSION_QUERY_TIMEOUT)
                .args(self.connection_args())
                .args(["-tAc", "SHOW server_version_num"]),
        );
        let output = ctx.runner.run(&spec, log).await?;
        ServerVersion::parse(&output.stdout).ok_or_else(|| {
            BackupError::execution(format!(
                "unexpected server_version_num output: {:?}",
                output.stdout.trim()
            ))
        })
    }

    async fn choose_binary(
        &self,
        ctx: &StrategyContext<'_>,
        log: &mut ExecutionLog,
        metadata: &mut Map<String, serde_json::Value>,
    ) -> String {
        match self.detect_version(ctx, log).await {
            Ok(version) => {
                let major = version.major();
                metadata.insert("server_version".into(), json!(version.display()));
                metadata.insert("server_major".into(), json!(major));
                log.push(format!("server version {} (major {major})", version.display()));
                match select_pg_dump(&ctx.tools.pg_install_roots, major) {
                    Some((tool_major, path)) => {
                        log.push(format!("using pg_dump {tool_major} at {}", path.display()));
                        path.display().to_string()
                    }
                    None => {
                        log.push(format!(
                            "no pg_dump >= {major} under install roots, using {}",
                            ctx.tools.pg_dump
                        ));
                        ctx.tools.pg_dump.clone()
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "postgres version detection failed");
                log.push(format!(
                    "server version detection failed ({e}), using {}",
                    ctx.tools.pg_dump
                ));
                ctx.tools.pg_dump.clone()
            }
        }
    }

    pub async fn execute(&self, ctx: &StrategyContext<'_>) -> Result<Artifact, BackupError> {
        let mut log = ExecutionLog::new();
        let mut metadata = Map::new();
        log.push(format!(
            "postgres backup of {}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        ));

        let pg_dump = self.choose_binary(ctx, &mut log, &mut metadata).await;
        metadata.insert("pg_dump".into(), json!(pg_dump));

        let out = ctx.workdir.join(format!("{}.sql", ctx.stem));
        let spec = self.with_env(
            CommandSpec::new(&pg_dump, ctx.execution.command_timeout())
                .args(self.connection_args())
                .args(["--format=plain", "--no-owner", "-f"])
                .arg(out.display().to_string()),
        );
        ctx.runner.run(&spec, &mut log).await?;
        ensure_non_empty(&out, &log).await?;

        let gz = compress::gzip_file(&out)
            .await
            .map_err(|e| e.with_log(log.clone()))?;
        info!(database = %self.database, artifact = %gz.display(), "postgres dump complete");
        log.push(format!("compressed to {}", gz.display()));
        file_artifact(gz, metadata, log).await
    }
}

pub(crate) async fn ensure_non_empty(path: &Path, log: &ExecutionLog) -> Result<u64, BackupError> {
    let size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        let _ = tokio::fs::remove_file(path).await;
        return Err(BackupError::execution(format!(
            "dump output {} is missing or empty",
            path.display()
        ))
        .with_log(log.clone()));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_version_parsing() {
        let v = ServerVersion::parse("160002\n").unwrap();
        assert_eq!(v.major(), 16);
        assert_eq!(v.display(), "16.2");

        let old = ServerVersion::parse(" 90624 ").unwrap();
        assert_eq!(old.major(), 9);
        assert_eq!(old.display(), "9.6.24");

        assert!(ServerVersion::parse("").is_none());
        assert!(ServerVersion::parse("PostgreSQL 16").is_none());
    }

    fn fake_install(root: &Path, major: u32) {
        let bin = root.join(major.to_string()).join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("pg_dump"), "#!/bin/sh\n").unwrap();
    }

    #[test]
    fn test_select_pg_dump_picks_highest_compatible() {
        let dir = tempfile::tempdir().unwrap();
        fake_install(dir.path(), 13);
        fake_install(dir.path(), 15);
        fake_install(dir.path(), 17);
        std::fs::create_dir_all(dir.path().join("16")).unwrap(); // no binary
        std::fs::create_dir_all(dir.path().join("main")).unwrap();

        let roots = vec![dir.path().to_path_buf(), dir.path().join("missing")];
        let (major, path) = select_pg_dump(&roots, 14).unwrap();
        assert_eq!(major, 17);
        assert_eq!(path, dir.path().join("17").join("bin").join("pg_dump"));

        assert!(select_pg_dump(&roots, 18).is_none());
    }

    #[test]
    fn test_password_never_in_arguments() {
        let src = PostgresSource {
            host: "db".into(),
            port: 5432,
            username: "app".into(),
            password: Some("hunter2".into()),
            database: "orders".into(),
            ssl_mode: None,
        };
        let spec = src.with_env(CommandSpec::new("pg_dump", Duration::from_secs(1)).args(src.connection_args()));
        assert!(!spec.argv().iter().any(|a| a.contains("hunter2")));
        assert!(!spec.display().contains("hunter2"));
        assert!(spec.display().contains("PGPASSWORD"));
        assert!(!format!("{src:?}").contains("hunter2"));
    }

    #[test]
    fn test_rejects_unknown_ssl_mode() {
        let src = PostgresSource {
            host: "db".into(),
            port: 5432,
            username: "app".into(),
            password: None,
            database: "orders".into(),
            ssl_mode: Some("require; true".into()),
        };
        assert!(matches!(src.validate(), Err(BackupError::Configuration { .. })));
    }
}
