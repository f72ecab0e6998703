use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{json, Map};
use tracing::{info, warn};

use super::postgres::ensure_non_empty;
use super::{compress, file_artifact, validate, Artifact, StrategyContext};
use crate::error::{BackupError, ExecutionLog};
use crate::process::CommandSpec;

fn default_port() -> u16 {
    3306
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Deserialize)]
pub struct MysqlSource {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    pub database: String,
    #[serde(default = "default_true")]
    pub require_ssl: bool,
}

impl std::fmt::Debug for MysqlSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MysqlSource")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("database", &self.database)
            .field("require_ssl", &self.require_ssl)
            .finish_non_exhaustive()
    }
}

/// Client options file holding the password; removed when dropped.
struct OptionsFile {
    path: PathBuf,
}

impl OptionsFile {
    fn create(dir: &Path, password: &str) -> std::io::Result<Self> {
        let path = dir.join(format!(".my-{}.cnf", uuid::Uuid::new_v4()));
        let mut opts = OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(&path)?;
        let guard = Self { path };
        writeln!(file, "[client]")?;
        writeln!(file, "password=\"{}\"", escape_option(password))?;
        file.sync_all()?;
        Ok(guard)
    }
}

impl Drop for OptionsFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove mysql options file");
            }
        }
    }
}

/// Escape a value for a double-quoted option file entry.
fn escape_option(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

impl MysqlSource {
    pub fn validate(&self) -> Result<(), BackupError> {
        validate::host(&self.host)?;
        validate::port(self.port)?;
        validate::username(&self.username)?;
        validate::database(&self.database)
    }

    fn ssl_mode(&self) -> &'static str {
        if self.require_ssl {
            "REQUIRED"
        } else {
            "PREFERRED"
        }
    }

    fn command(&self, program: &str, ctx: &StrategyContext<'_>, options: Option<&Path>, out: &Path) -> CommandSpec {
        let mut spec = CommandSpec::new(program, ctx.execution.command_timeout());
        // --defaults-extra-file must come first.
        if let Some(path) = options {
            spec = spec.arg(format!("--defaults-extra-file={}", path.display()));
        }
        spec.args([
            format!("--host={}", self.host),
            format!("--port={}", self.port),
            format!("--user={}", self.username),
            format!("--ssl-mode={}", self.ssl_mode()),
            "--single-transaction".into(),
            "--routines".into(),
            "--triggers".into(),
            format!("--result-file={}", out.display()),
            self.database.clone(),
        ])
    }

    pub async fn execute(&self, ctx: &StrategyContext<'_>) -> Result<Artifact, BackupError> {
        let mut log = ExecutionLog::new();
        log.push(format!(
            "mysql backup of {}@{}:{}/{} (ssl-mode {})",
            self.username,
            self.host,
            self.port,
            self.database,
            self.ssl_mode()
        ));

        let out = ctx.workdir.join(format!("{}.sql", ctx.stem));
        {
            let options = match self.password.as_deref().filter(|p| !p.is_empty()) {
                Some(password) => Some(OptionsFile::create(ctx.workdir, password).map_err(|e| {
                    BackupError::execution(format!("cannot write mysql options file: {e}"))
                        .with_log(log.clone())
                })?),
                None => None,
            };
            let spec = self.command(
                &ctx.tools.mysqldump,
                ctx,
                options.as_ref().map(|o| o.path.as_path()),
                &out,
            );
            ctx.runner.run(&spec, &mut log).await?;
        }
        ensure_non_empty(&out, &log).await?;

        let gz = compress::gzip_file(&out)
            .await
            .map_err(|e| e.with_log(log.clone()))?;
        info!(database = %self.database, artifact = %gz.display(), "mysql dump complete");
        log.push(format!("compressed to {}", gz.display()));
        let mut metadata = Map::new();
        metadata.insert("ssl_mode".into(), json!(self.ssl_mode()));
        file_artifact(gz, metadata, log).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_option_value() {
        assert_eq!(escape_option(r#"pa"ss\word"#), r#"pa\"ss\\word"#);
        assert_eq!(escape_option("plain"), "plain");
    }

    #[cfg(unix)]
    #[test]
    fn test_options_file_is_private_and_removed_on_drop() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = {
            let file = OptionsFile::create(dir.path(), "s3cr\"et").unwrap();
            let mode = std::fs::metadata(&file.path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
            let text = std::fs::read_to_string(&file.path).unwrap();
            assert!(text.starts_with("[client]\n"));
            assert!(text.contains(r#"password="s3cr\"et""#));
            file.path.clone()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_defaults_file_comes_first_and_password_stays_out() {
        let src = MysqlSource {
            host: "db".into(),
            port: 3306,
            username: "app".into(),
            password: Some("hunter2".into()),
            database: "shop".into(),
            require_ssl: true,
        };
        let harness = crate::sources::harness::Harness::new();
        let ctx = harness.ctx("mysql_shop");
        let dir = &harness.dir;
        let opts = dir.path().join("opts.cnf");
        let spec = src.command("mysqldump", &ctx, Some(&opts), &dir.path().join("out.sql"));
        let argv = spec.argv();
        assert!(argv[0].starts_with("--defaults-extra-file="));
        assert!(argv.contains(&"--ssl-mode=REQUIRED"));
        assert_eq!(*argv.last().unwrap(), "shop");
        assert!(!spec.display().contains("hunter2"));

        let relaxed = MysqlSource { require_ssl: false, ..src };
        let spec = relaxed.command("mysqldump", &ctx, None, &dir.path().join("out.sql"));
        assert!(spec.argv().contains(&"--ssl-mode=PREFERRED"));
    }
}
