use serde::Deserialize;
use serde_json::{json, Map};
use tracing::info;

use super::{compress, file_artifact, validate, Artifact, StrategyContext};
use crate::credentials::mask_connection_string;
use crate::error::{BackupError, ExecutionLog};
use crate::process::CommandSpec;

fn default_port() -> u16 {
    27017
}

#[derive(Clone, Deserialize)]
pub struct MongoSource {
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub auth_source: Option<String>,
}

impl std::fmt::Debug for MongoSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoSource")
            .field(
                "connection_string",
                &self.connection_string.as_deref().map(mask_connection_string),
            )
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.is_empty())
}

impl MongoSource {
    pub fn validate(&self) -> Result<(), BackupError> {
        if let Some(uri) = non_empty(&self.connection_string) {
            if !(uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://")) {
                return Err(BackupError::configuration(
                    "connection_string must start with mongodb:// or mongodb+srv://",
                ));
            }
            if uri.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(BackupError::configuration(
                    "connection_string must not contain whitespace",
                ));
            }
        } else {
            let host = non_empty(&self.host).ok_or_else(|| {
                BackupError::configuration("either connection_string or host is required")
            })?;
            validate::host(host)?;
            validate::port(self.port)?;
            if let Some(user) = non_empty(&self.username) {
                validate::username(user)?;
            }
        }
        if let Some(db) = non_empty(&self.database) {
            validate::database(db)?;
        }
        if let Some(src) = non_empty(&self.auth_source) {
            validate::database(src)?;
        }
        Ok(())
    }

    pub fn identifier(&self) -> String {
        if let Some(db) = non_empty(&self.database) {
            return db.to_string();
        }
        if let Some(host) = non_empty(&self.host) {
            return host.to_string();
        }
        "mongodb".to_string()
    }

    /// The connection string handed to mongodump, credentials included.
    pub fn uri(&self) -> String {
        if let Some(uri) = non_empty(&self.connection_string) {
            return uri.to_string();
        }
        let host = non_empty(&self.host).unwrap_or("localhost");
        let mut uri = String::from("mongodb://");
        if let Some(user) = non_empty(&self.username) {
            uri.push_str(&urlencoding::encode(user));
            if let Some(password) = non_empty(&self.password) {
                uri.push(':');
                uri.push_str(&urlencoding::encode(password));
            }
            uri.push('@');
        }
        uri.push_str(&format!("{host}:{}/", self.port));
        if let Some(db) = non_empty(&self.database) {
            uri.push_str(db);
        }
        if let Some(src) = non_empty(&self.auth_source) {
            uri.push_str(&format!("?authSource={src}"));
        }
        uri
    }

    pub fn command(&self, program: &str, ctx: &StrategyContext<'_>, out_dir: &std::path::Path) -> CommandSpec {
        let uri = self.uri();
        let display = format!("--uri={}", mask_connection_string(&uri));
        let mut spec = CommandSpec::new(program, ctx.execution.command_timeout())
            .secret_arg(format!("--uri={uri}"), display)
            .arg(format!("--out={}", out_dir.display()));
        if non_empty(&self.connection_string).is_some() {
            if let Some(db) = non_empty(&self.database) {
                spec = spec.arg(format!("--db={db}"));
            }
        }
        spec
    }

    pub async fn execute(&self, ctx: &StrategyContext<'_>) -> Result<Artifact, BackupError> {
        let mut log = ExecutionLog::new();
        log.push(format!("mongodb backup of {}", self.identifier()));

        let out_dir = ctx.workdir.join(&ctx.stem);
        tokio::fs::create_dir_all(&out_dir).await.map_err(|e| {
            BackupError::execution(format!("cannot create dump directory: {e}")).with_log(log.clone())
        })?;
        let spec = self.command(&ctx.tools.mongodump, ctx, &out_dir);
        ctx.runner.run(&spec, &mut log).await?;

        let mut entries = tokio::fs::read_dir(&out_dir).await.map_err(|e| {
            BackupError::execution(format!("cannot read dump directory: {e}")).with_log(log.clone())
        })?;
        let produced = entries.next_entry().await.ok().flatten().is_some();
        if !produced {
            let _ = tokio::fs::remove_dir_all(&out_dir).await;
            return Err(BackupError::execution("mongodump produced no output").with_log(log));
        }

        let archive = compress::tar_gz_dir(&out_dir)
            .await
            .map_err(|e| e.with_log(log.clone()))?;
        info!(source = %self.identifier(), artifact = %archive.display(), "mongodb dump complete");
        log.push(format!("archived to {}", archive.display()));
        let mut metadata = Map::new();
        if let Some(db) = non_empty(&self.database) {
            metadata.insert("database".into(), json!(db));
        }
        file_artifact(archive, metadata, log).await
    }
}
