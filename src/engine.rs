//! Shared handles used by the queue workers and the CLI.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::StashConfig;
use crate::credentials::{Cipher, CredentialResolver};
use crate::destinations::Distributor;
use crate::notify::{LogNotifier, Notifier};
use crate::process::ProcessRunner;
use crate::storage::{self, Pool};

#[derive(Clone)]
pub struct Engine {
    pub pool: Pool,
    pub config: Arc<StashConfig>,
    pub credentials: CredentialResolver,
    pub runner: ProcessRunner,
    pub distributor: Distributor,
    pub notifier: Arc<dyn Notifier>,
}

impl Engine {
    /// Open the database and load the encryption key described by `config`.
    pub fn open(config: StashConfig) -> Result<Self> {
        let pool = storage::open_pool(&config.storage.db_path).with_context(|| {
            format!("failed to open database {}", config.storage.db_path.display())
        })?;
        let cipher = Cipher::load(&config.security).context("failed to load encryption key")?;
        Ok(Self::new(config, pool, Arc::new(cipher)))
    }

    pub fn new(config: StashConfig, pool: Pool, cipher: Arc<Cipher>) -> Self {
        let credentials = CredentialResolver::new(cipher, pool.clone());
        let runner = ProcessRunner::new(config.execution.kill_grace());
        let distributor = Distributor::new(config.paths.backup_dir.clone(), credentials.clone());
        Self {
            pool,
            config: Arc::new(config),
            credentials,
            runner,
            distributor,
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}
