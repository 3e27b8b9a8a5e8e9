//! Background import runs started from the HTTP surface.
//!
//! Each job owns its uploaded file, a progress channel and a cancellation
//! token. Jobs live in an in-memory registry; finished jobs are evicted once
//! they are older than the registry's retention window.

use crate::import::coordinator::{ImportError, ImportRequest, LeadImporter};
use crate::import::stats::ImportResult;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub state: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ImportResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct JobOutcome {
    status: JobStatus,
    result: Option<ImportResult>,
    error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

pub struct ImportJob {
    id: Uuid,
    started_at: DateTime<Utc>,
    progress: watch::Receiver<u8>,
    cancel: CancellationToken,
    outcome: Mutex<JobOutcome>,
}

impl ImportJob {
    fn new(id: Uuid, progress: watch::Receiver<u8>) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            progress,
            cancel: CancellationToken::new(),
            outcome: Mutex::new(JobOutcome {
                status: JobStatus::Running,
                result: None,
                error: None,
                finished_at: None,
            }),
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let outcome = self.outcome.lock();
        JobSnapshot {
            job_id: self.id.to_string(),
            state: outcome.status,
            progress: *self.progress.borrow(),
            result: outcome.result.clone(),
            error: outcome.error.clone(),
            started_at: self.started_at,
            finished_at: outcome.finished_at,
        }
    }

    /// Request cancellation; takes effect before the next batch.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.outcome.lock().status == JobStatus::Running
    }

    /// Finished for at least `retention` as of `now`.
    fn expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        self.outcome
            .lock()
            .finished_at
            .and_then(|finished| (now - finished).to_std().ok())
            .is_some_and(|age| age >= retention)
    }

    fn finish(&self, result: Result<ImportResult, ImportError>) {
        let mut outcome = self.outcome.lock();
        outcome.finished_at = Some(Utc::now());
        match result {
            Ok(result) => {
                outcome.status = JobStatus::Completed;
                outcome.result = Some(result);
            }
            Err(err @ ImportError::Cancelled { .. }) => {
                outcome.status = JobStatus::Cancelled;
                outcome.error = Some(err.to_string());
                if let ImportError::Cancelled { partial, .. } = err {
                    outcome.result = Some(partial);
                }
            }
            Err(err) => {
                log::error!("import job {} failed: {}", self.id, err);
                outcome.status = JobStatus::Failed;
                outcome.error = Some(err.to_string());
            }
        }
    }
}

/// Retention used by [`JobRegistry::new`].
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(60 * 60);

/// In-memory registry of import jobs.
#[derive(Clone)]
pub struct JobRegistry {
    jobs: Arc<DashMap<Uuid, Arc<ImportJob>>>,
    retention: Duration,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::with_retention(DEFAULT_JOB_RETENTION)
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            retention,
        }
    }

    /// Drop finished jobs older than the retention window. Running jobs stay.
    pub fn prune(&self) -> usize {
        let now = Utc::now();
        let before = self.jobs.len();
        self.jobs.retain(|_, job| !job.expired(now, self.retention));
        let evicted = before.saturating_sub(self.jobs.len());
        if evicted > 0 {
            log::debug!("evicted {} finished import jobs", evicted);
        }
        evicted
    }

    /// Spawn a background run over `file`. The file is removed when the run ends.
    pub fn start(&self, importer: LeadImporter, request: ImportRequest, file: TempPath) -> Uuid {
        self.prune();

        let id = Uuid::new_v4();
        let (progress_tx, progress_rx) = watch::channel(0u8);
        let job = Arc::new(ImportJob::new(id, progress_rx));
        self.jobs.insert(id, Arc::clone(&job));

        log::info!("import job {} queued ({})", id, request.source_kind);

        let cancel = job.cancel.clone();
        tokio::spawn(async move {
            let result = importer.run(&request, &file, &progress_tx, cancel).await;
            job.finish(result);
            if let Err(err) = file.close() {
                log::warn!("import job {}: failed to remove upload: {}", id, err);
            }
        });

        id
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<ImportJob>> {
        self.jobs.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImportConfig;
    use crate::import::rules::RuleRegistry;
    use crate::test_support::memory::MemoryLeadRepository;
    use std::io::Write;
    use std::time::Duration;

    async fn wait_for_finish(job: &ImportJob) -> JobSnapshot {
        for _ in 0..200 {
            if !job.is_running() {
                return job.snapshot();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("import job did not finish");
    }

    #[tokio::test]
    async fn test_job_runs_to_completion() {
        let repository = Arc::new(MemoryLeadRepository::new());
        let importer = LeadImporter::new(
            repository.clone(),
            Arc::new(RuleRegistry::builtin().unwrap()),
            ImportConfig::default(),
        );

        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "Nome,Celular\nAna,(11) 98888-7777\nBia,11977776666").unwrap();
        let path = file.into_temp_path();

        let registry = JobRegistry::new();
        let id = registry.start(
            importer,
            ImportRequest {
                campaign_id: 1,
                stage_id: 1,
                fixed_assignee_id: None,
                auto_distribute: false,
                member_ids: Vec::new(),
                source_kind: "crm".into(),
                import_label: "Teste".into(),
                format: None,
            },
            path,
        );

        let job = registry.get(&id).expect("job registered");
        let snapshot = wait_for_finish(&job).await;

        assert_eq!(snapshot.state, JobStatus::Completed);
        assert_eq!(snapshot.progress, 100);
        assert_eq!(snapshot.result.map(|r| r.imported), Some(2));
        assert_eq!(repository.lead_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_job_reports_error() {
        let importer = LeadImporter::new(
            Arc::new(MemoryLeadRepository::new()),
            Arc::new(RuleRegistry::builtin().unwrap()),
            ImportConfig::default(),
        );
        let file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();

        let registry = JobRegistry::new();
        let id = registry.start(
            importer,
            ImportRequest {
                campaign_id: 1,
                stage_id: 1,
                fixed_assignee_id: None,
                auto_distribute: false,
                member_ids: Vec::new(),
                source_kind: "crm".into(),
                import_label: "Vazio".into(),
                format: None,
            },
            file.into_temp_path(),
        );

        let snapshot = wait_for_finish(&registry.get(&id).unwrap()).await;
        assert_eq!(snapshot.state, JobStatus::Failed);
        assert!(snapshot.error.is_some());
        assert!(registry.get(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_cancelled_job_keeps_partial_counts() {
        let (_tx, rx) = watch::channel(40u8);
        let job = ImportJob::new(Uuid::new_v4(), rx);
        job.finish(Err(ImportError::Cancelled {
            processed: 2,
            total: 5,
            partial: ImportResult {
                total: 5,
                imported: 2,
                ..Default::default()
            },
        }));

        let snapshot = job.snapshot();
        assert_eq!(snapshot.state, JobStatus::Cancelled);
        assert_eq!(snapshot.progress, 40);
        assert_eq!(snapshot.result.map(|r| r.imported), Some(2));
        assert!(snapshot.error.unwrap().contains("2 of 5"));
    }

    #[tokio::test]
    async fn test_prune_evicts_only_expired_finished_jobs() {
        let registry = JobRegistry::with_retention(Duration::ZERO);

        let (_running_tx, running_rx) = watch::channel(0u8);
        let running = Arc::new(ImportJob::new(Uuid::new_v4(), running_rx));
        registry.jobs.insert(running.id, Arc::clone(&running));

        let (_done_tx, done_rx) = watch::channel(100u8);
        let done = Arc::new(ImportJob::new(Uuid::new_v4(), done_rx));
        done.finish(Ok(ImportResult::default()));
        registry.jobs.insert(done.id, Arc::clone(&done));

        assert_eq!(registry.prune(), 1);
        assert!(registry.get(&running.id).is_some());
        assert!(registry.get(&done.id).is_none());

        let kept = JobRegistry::new();
        kept.jobs.insert(done.id, Arc::clone(&done));
        assert_eq!(kept.prune(), 0);
        assert_eq!(kept.len(), 1);
    }
}
