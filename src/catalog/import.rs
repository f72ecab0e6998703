//! TOML catalog import: the minimal write path for jobs, destinations and
//! credential providers. Secret fields are encrypted on the way in.
//!
//! ```toml
//! [[credential_providers]]
//! id = 1
//! name = "minio"
//! endpoint = "http://minio:9000"
//! access_key_id = "AKIA..."
//! secret_access_key = "..."
//!
//! [[destinations]]
//! id = 1
//! name = "nas"
//! kind = "local"
//! config = { path = "/srv/backups" }
//!
//! [[jobs]]
//! id = 1
//! name = "orders"
//! source_type = "postgres"
//! schedule = "0 3 * * *"
//! destinations = [1]
//! source = { host = "db", username = "backup", password = "...", database = "orders" }
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::{ConfigMap, CredentialProvider, Destination, DestinationKind, Job, SourceType};
use crate::credentials::{ConfigKind, CredentialResolver};
use crate::scheduler::parse_schedule;
use crate::storage::Pool;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogFile {
    #[serde(default)]
    pub credential_providers: Vec<ProviderEntry>,
    #[serde(default)]
    pub destinations: Vec<DestinationEntry>,
    #[serde(default)]
    pub jobs: Vec<JobEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderEntry {
    pub id: i64,
    pub name: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationEntry {
    pub id: i64,
    pub name: String,
    pub kind: DestinationKind,
    #[serde(default)]
    pub config: ConfigMap,
    pub credential_provider_id: Option<i64>,
}

fn default_retention() -> u32 {
    30
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobEntry {
    pub id: i64,
    pub name: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub source: ConfigMap,
    pub schedule: Option<String>,
    #[serde(default = "default_retention")]
    pub retention_days: u32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub credential_provider_id: Option<i64>,
    #[serde(default)]
    pub destinations: Vec<i64>,
}

/// Counts of imported records.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub providers: usize,
    pub destinations: usize,
    pub jobs: usize,
}

impl CatalogFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid catalog file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(raw)?;
        file.validate()?;
        Ok(file)
    }

    /// Cross-record checks that the database constraints would only report
    /// halfway through an import.
    fn validate(&self) -> Result<()> {
        let provider_ids: HashSet<i64> = self.credential_providers.iter().map(|p| p.id).collect();
        let dest_ids: HashSet<i64> = self.destinations.iter().map(|d| d.id).collect();

        for dest in &self.destinations {
            if dest.kind == DestinationKind::S3 {
                for field in ["access_key_id", "secret_access_key"] {
                    if dest.config.contains_key(field) {
                        anyhow::bail!(
                            "destination '{}' embeds '{field}'; reference a credential provider instead",
                            dest.name
                        );
                    }
                }
            }
            if let Some(p) = dest.credential_provider_id {
                if !provider_ids.contains(&p) {
                    anyhow::bail!("destination '{}' references unknown credential provider {p}", dest.name);
                }
            }
        }
        for job in &self.jobs {
            if let Some(expr) = job.schedule.as_deref().filter(|s| !s.trim().is_empty()) {
                parse_schedule(expr).with_context(|| format!("job '{}'", job.name))?;
            }
            if let Some(p) = job.credential_provider_id {
                if !provider_ids.contains(&p) {
                    anyhow::bail!("job '{}' references unknown credential provider {p}", job.name);
                }
            }
            if job.destinations.is_empty() {
                anyhow::bail!("job '{}' has no destinations", job.name);
            }
            for d in &job.destinations {
                if !dest_ids.contains(d) {
                    anyhow::bail!("job '{}' references unknown destination {d}", job.name);
                }
            }
        }
        Ok(())
    }

    /// Encrypt secrets and upsert every record. Providers first, then
    /// destinations, then jobs, so references resolve.
    pub fn apply(&self, pool: &Pool, resolver: &CredentialResolver) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();

        for p in &self.credential_providers {
            let mut config = ConfigMap::new();
            if let Some(endpoint) = &p.endpoint {
                config.insert("endpoint".into(), Value::String(endpoint.clone()));
            }
            if let Some(region) = &p.region {
                config.insert("region".into(), Value::String(region.clone()));
            }
            config.insert("access_key_id".into(), Value::String(p.access_key_id.clone()));
            config.insert("secret_access_key".into(), Value::String(p.secret_access_key.clone()));
            let config = resolver.encrypt(ConfigKind::CredentialProvider, &config)?;
            super::upsert_provider(
                pool,
                &CredentialProvider {
                    id: p.id,
                    name: p.name.clone(),
                    config,
                },
            )?;
            summary.providers += 1;
        }

        for d in &self.destinations {
            super::upsert_destination(
                pool,
                &Destination {
                    id: d.id,
                    name: d.name.clone(),
                    kind: d.kind,
                    config: resolver.encrypt(ConfigKind::Destination(d.kind), &d.config)?,
                    credential_provider_id: d.credential_provider_id,
                },
            )?;
            summary.destinations += 1;
        }

        for j in &self.jobs {
            let job = Job {
                id: j.id,
                name: j.name.clone(),
                source_type: j.source_type,
                source_config: resolver.encrypt(ConfigKind::Source(j.source_type), &j.source)?,
                schedule: j.schedule.clone().filter(|s| !s.trim().is_empty()),
                retention_days: j.retention_days,
                retry_count: j.retry_count,
                enabled: j.enabled,
                credential_provider_id: j.credential_provider_id,
            };
            super::upsert_job(pool, &job, &j.destinations)?;
            summary.jobs += 1;
        }

        info!(
            providers = summary.providers,
            destinations = summary.destinations,
            jobs = summary.jobs,
            "catalog imported"
        );
        Ok(summary)
    }
}
