//! Run outcome notifications.

use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::Job;
use crate::tracker::{RunStatus, Trigger};

/// Per-destination line of a [`RunOutcome`].
#[derive(Debug, Clone, Serialize)]
pub struct DestinationOutcome {
    pub destination_id: i64,
    pub name: String,
    pub succeeded: bool,
    pub location: Option<String>,
    pub error: Option<String>,
}

/// What happened to one run, handed to every [`Notifier`].
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub trigger: Trigger,
    pub status: RunStatus,
    pub attempts: u32,
    pub size_bytes: Option<u64>,
    /// Source failure, when no artifact was produced.
    pub error: Option<String>,
    pub destinations: Vec<DestinationOutcome>,
}

/// Receives the outcome of every finished run.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, job: &Job, outcome: &RunOutcome);
}

/// Writes outcomes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, job: &Job, outcome: &RunOutcome) {
        let failed: Vec<&str> = outcome
            .destinations
            .iter()
            .filter(|d| !d.succeeded)
            .map(|d| d.name.as_str())
            .collect();
        match outcome.status {
            RunStatus::Completed => info!(
                job = %job.name,
                run_id = %outcome.run_id,
                attempts = outcome.attempts,
                size_bytes = outcome.size_bytes.unwrap_or(0),
                "backup completed"
            ),
            status => warn!(
                job = %job.name,
                run_id = %outcome.run_id,
                status = %status,
                attempts = outcome.attempts,
                failed_destinations = ?failed,
                error = outcome.error.as_deref().unwrap_or(""),
                "backup did not complete"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ConfigMap, SourceType};
    use std::sync::{Arc, Mutex};

    /// Collects outcomes so tests can assert on them.
    #[derive(Default)]
    struct Recording(Mutex<Vec<(String, RunStatus)>>);

    #[async_trait::async_trait]
    impl Notifier for Recording {
        async fn notify(&self, job: &Job, outcome: &RunOutcome) {
            self.0.lock().unwrap().push((job.name.clone(), outcome.status));
        }
    }

    #[tokio::test]
    async fn test_notifier_is_object_safe() {
        let rec = Arc::new(Recording::default());
        let notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier), rec.clone()];
        let job = Job {
            id: 1,
            name: "nightly".into(),
            source_type: SourceType::Redis,
            source_config: ConfigMap::new(),
            schedule: None,
            retention_days: 7,
            retry_count: 0,
            enabled: true,
            credential_provider_id: None,
        };
        let outcome = RunOutcome {
            run_id: "r".into(),
            trigger: Trigger::Manual,
            status: RunStatus::Partial,
            attempts: 1,
            size_bytes: Some(3),
            error: None,
            destinations: vec![],
        };
        for n in &notifiers {
            n.notify(&job, &outcome).await;
        }
        assert_eq!(rec.0.lock().unwrap().as_slice(), &[("nightly".to_string(), RunStatus::Partial)]);
    }
}
