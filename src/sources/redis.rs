use serde::Deserialize;
use serde_json::{json, Map};
use tracing::{info, warn};

use super::{compress, file_artifact, validate, Artifact, StrategyContext};
use crate::error::{BackupError, ExecutionLog};
use crate::process::CommandSpec;

fn default_port() -> u16 {
    6379
}

#[derive(Clone, Deserialize)]
pub struct RedisSource {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: bool,
}

impl std::fmt::Debug for RedisSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSource")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

impl RedisSource {
    pub fn validate(&self) -> Result<(), BackupError> {
        validate::host(&self.host)?;
        validate::port(self.port)?;
        if let Some(user) = self.username.as_deref().filter(|u| !u.is_empty()) {
            validate::username(user)?;
        }
        Ok(())
    }

    /// Connection URL without the password.
    pub fn url(&self) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.username.as_deref().filter(|u| !u.is_empty()) {
            Some(user) => format!(
                "{scheme}://{}@{host}:{}",
                urlencoding::encode(user),
                self.port
            ),
            None => format!("{scheme}://{host}:{}", self.port),
        }
    }

    pub fn command(&self, program: &str, ctx: &StrategyContext<'_>, out: &std::path::Path) -> CommandSpec {
        let mut spec = CommandSpec::new(program, ctx.execution.snapshot_timeout())
            .args(["-u".to_string(), self.url()]);
        if self.tls {
            spec = spec.arg("--tls");
        }
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            spec = spec.env("REDISCLI_AUTH", password);
        }
        spec.arg("--rdb").arg(out.display().to_string())
    }

    pub async fn execute(&self, ctx: &StrategyContext<'_>) -> Result<Artifact, BackupError> {
        let mut log = ExecutionLog::new();
        log.push(format!("redis snapshot of {}", self.url()));

        let out = ctx.workdir.join(format!("{}.rdb", ctx.stem));
        let spec = self.command(&ctx.tools.redis_cli, ctx, &out);
        let run = ctx.runner.run(&spec, &mut log).await;
        if let Err(e) = run {
            let _ = tokio::fs::remove_file(&out).await;
            return Err(e);
        }

        let size = tokio::fs::metadata(&out).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            warn!(host = %self.host, "redis-cli exited cleanly but the snapshot is empty");
            let _ = tokio::fs::remove_file(&out).await;
            return Err(BackupError::execution("redis snapshot is missing or empty").with_log(log));
        }
        log.push(format!("snapshot size {size} bytes"));

        let gz = compress::gzip_file(&out)
            .await
            .map_err(|e| e.with_log(log.clone()))?;
        info!(host = %self.host, artifact = %gz.display(), "redis snapshot complete");
        log.push(format!("compressed to {}", gz.display()));
        let mut metadata = Map::new();
        metadata.insert("snapshot_bytes".into(), json!(size));
        file_artifact(gz, metadata, log).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::harness::Harness;

    fn source() -> RedisSource {
        RedisSource {
            host: "cache".into(),
            port: 6380,
            username: Some("ops user".into()),
            password: Some("hunter2".into()),
            tls: true,
        }
    }

    #[test]
    fn test_url_carries_encoded_username_only() {
        assert_eq!(source().url(), "rediss://ops%20user@cache:6380");
        let plain = RedisSource {
            host: "::1".into(),
            port: 6379,
            username: None,
            password: None,
            tls: false,
        };
        assert_eq!(plain.url(), "redis://[::1]:6379");
    }

    #[test]
    fn test_password_goes_through_environment() {
        let harness = Harness::new();
        let out = harness.dir.path().join("dump.rdb");
        let spec = source().command("redis-cli", &harness.ctx("redis_cache"), &out);
        assert!(!spec.argv().iter().any(|a| a.contains("hunter2")));
        assert!(spec.argv().contains(&"--tls"));
        assert_eq!(*spec.argv().last().unwrap(), out.display().to_string());
        assert!(spec.display().ends_with("[env: REDISCLI_AUTH]"));
        assert_eq!(spec.timeout(), harness.execution.snapshot_timeout());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_snapshot_fails_and_is_removed() {
        use std::os::unix::fs::PermissionsExt;

        let mut harness = Harness::new();
        let tool = harness.dir.path().join("fake-redis-cli");
        // Touch the path after --rdb, exit 0.
        std::fs::write(
            &tool,
            "#!/bin/sh\nfor last; do :; done\n: > \"$last\"\necho 'Transfer finished with success.' >&2\n",
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        harness.tools.redis_cli = tool.display().to_string();

        let ctx = harness.ctx("redis_cache");
        let err = source().execute(&ctx).await.unwrap_err();
        assert!(matches!(err, BackupError::Execution { .. }));
        assert!(err.to_string().contains("empty"));
        assert!(!harness.dir.path().join("redis_cache.rdb").exists());
        assert!(err.log().to_string().contains("Transfer finished"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_snapshot_is_gzipped() {
        use std::os::unix::fs::PermissionsExt;

        let mut harness = Harness::new();
        let tool = harness.dir.path().join("fake-redis-cli");
        std::fs::write(
            &tool,
            "#!/bin/sh\nfor last; do :; done\nprintf 'REDIS0011payload' > \"$last\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        harness.tools.redis_cli = tool.display().to_string();

        let ctx = harness.ctx("redis_cache");
        let artifact = source().execute(&ctx).await.unwrap();
        assert_eq!(artifact.name, "redis_cache.rdb.gz");
        assert!(artifact.size_bytes > 0);
        assert_eq!(artifact.metadata["snapshot_bytes"], json!(16));
        assert!(!harness.dir.path().join("redis_cache.rdb").exists());
    }
}
