//! Upload orchestration: one session per job, files in listing order, a
//! bounded retry loop per file and an aggregate result at the end.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendSession, TransferBackend};
use crate::job::{job_name, list_job_files, UploadTarget};

pub const DEFAULT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Success,
    PartialFailure,
    Failure,
}

impl UploadStatus {
    pub fn from_counts(attempted: usize, succeeded: usize) -> Self {
        if attempted > 0 && succeeded == attempted {
            UploadStatus::Success
        } else if succeeded > 0 {
            UploadStatus::PartialFailure
        } else {
            UploadStatus::Failure
        }
    }

    pub fn is_success(self) -> bool {
        self == UploadStatus::Success
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub name: String,
    pub remote_key: String,
    pub size: u64,
    pub attempts: u32,
    pub uploaded: bool,
    pub elapsed: Duration,
    pub error: Option<String>,
}

/// Aggregate of one job, built once every file has been attempted.
#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub job: String,
    pub target: UploadTarget,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub bytes: u64,
    pub elapsed: Duration,
    pub status: UploadStatus,
    pub files: Vec<FileOutcome>,
    /// Connect or destination failure that aborted the job.
    pub error: Option<String>,
}

impl UploadResult {
    fn from_files(job: String, target: UploadTarget, files: Vec<FileOutcome>, elapsed: Duration) -> Self {
        let attempted = files.len();
        let succeeded = files.iter().filter(|file| file.uploaded).count();
        let bytes = files
            .iter()
            .filter(|file| file.uploaded)
            .map(|file| file.size)
            .sum();
        Self {
            job,
            target,
            attempted,
            succeeded,
            failed: attempted - succeeded,
            bytes,
            elapsed,
            status: UploadStatus::from_counts(attempted, succeeded),
            files,
            error: None,
        }
    }

    fn aborted(job: String, target: UploadTarget, error: String, elapsed: Duration) -> Self {
        Self {
            job,
            target,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            bytes: 0,
            elapsed,
            status: UploadStatus::Failure,
            files: Vec::new(),
            error: Some(error),
        }
    }
}

/// Progress callbacks for a presentation layer. Every hook defaults to a
/// no-op.
pub trait UploadObserver: Send + Sync {
    fn job_started(&self, _job: &str, _total_files: usize) {}
    fn file_attempt(&self, _file: &str, _attempt: u32, _max_attempts: u32) {}
    fn file_finished(&self, _outcome: &FileOutcome, _index: usize, _total: usize) {}
    fn job_finished(&self, _result: &UploadResult) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl UploadObserver for NoopObserver {}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
        }
    }
}

#[derive(Clone)]
pub struct Uploader {
    retry_policy: RetryPolicy,
    retry_sleep_cap: Duration,
    observer: Arc<dyn UploadObserver>,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("retry_policy", &self.retry_policy)
            .field("retry_sleep_cap", &self.retry_sleep_cap)
            .finish()
    }
}

impl Default for Uploader {
    fn default() -> Self {
        Self::new()
    }
}

impl Uploader {
    pub fn new() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            retry_sleep_cap: Duration::from_secs(60),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_retry_sleep_cap(mut self, cap: Duration) -> Self {
        self.retry_sleep_cap = cap;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn UploadObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Uploads every eligible file of `job_dir`. Never fails: connection
    /// and destination problems end up in [`UploadResult::error`].
    pub async fn upload_job(&self, job_dir: &Path, backend: &dyn TransferBackend) -> UploadResult {
        let started = Instant::now();
        let job = job_name(job_dir);
        let target = backend.target_for(&job);
        info!(job = %job, backend = %backend.kind(), target = %target.as_str(), "starting upload");

        let mut session = match backend.connect().await {
            Ok(session) => session,
            Err(err) => {
                error!(job = %job, error = %err, "connection failed");
                return self.finish(UploadResult::aborted(job, target, err.to_string(), started.elapsed()));
            }
        };

        let transferred = self
            .transfer_job(session.as_mut(), job_dir, &job, &target)
            .await;
        session.close().await;

        let result = match transferred {
            Ok(files) => UploadResult::from_files(job, target, files, started.elapsed()),
            Err(message) => {
                error!(job = %job, error = %message, "upload aborted");
                UploadResult::aborted(job, target, message, started.elapsed())
            }
        };
        self.finish(result)
    }

    fn finish(&self, result: UploadResult) -> UploadResult {
        match result.status {
            UploadStatus::Success => info!(
                job = %result.job,
                files = result.succeeded,
                bytes = result.bytes,
                elapsed_ms = result.elapsed.as_millis() as u64,
                "upload finished"
            ),
            _ => warn!(
                job = %result.job,
                status = ?result.status,
                succeeded = result.succeeded,
                attempted = result.attempted,
                "upload incomplete"
            ),
        }
        self.observer.job_finished(&result);
        result
    }

    async fn transfer_job(
        &self,
        session: &mut dyn BackendSession,
        job_dir: &Path,
        job: &str,
        target: &UploadTarget,
    ) -> Result<Vec<FileOutcome>, String> {
        session
            .ensure_destination(target)
            .await
            .map_err(|err| err.to_string())?;
        let files = list_job_files(job_dir)
            .map_err(|err| format!("cannot list {}: {}", job_dir.display(), err))?;

        let total = files.len();
        info!(job = %job, files = total, "uploading job files");
        self.observer.job_started(job, total);

        let mut outcomes = Vec::with_capacity(total);
        for (index, file) in files.iter().enumerate() {
            let remote_key = target.remote_key(&file.name);
            let outcome = self
                .transfer_file(session, &file.path, &remote_key, Some(target))
                .await;
            if outcome.uploaded {
                info!(job = %job, progress = %format!("{}/{}", index + 1, total), file = %file.name, "file uploaded");
            }
            self.observer.file_finished(&outcome, index, total);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Puts one file with the retry policy. `resync` names the destination
    /// to re-walk after a permanent failure.
    pub async fn transfer_file(
        &self,
        session: &mut dyn BackendSession,
        local: &Path,
        remote_key: &str,
        resync: Option<&UploadTarget>,
    ) -> FileOutcome {
        let name = local
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| remote_key.to_string());
        let size = tokio::fs::metadata(local)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        let started = Instant::now();
        let attempts = self.retry_policy.attempts.max(1);
        let mut outcome = FileOutcome {
            name,
            remote_key: remote_key.to_string(),
            size,
            attempts: 0,
            uploaded: false,
            elapsed: Duration::ZERO,
            error: None,
        };

        for attempt in 1..=attempts {
            outcome.attempts = attempt;
            self.observer.file_attempt(&outcome.name, attempt, attempts);
            debug!(
                file = %outcome.name,
                attempt,
                size_mb = size as f64 / 1024.0 / 1024.0,
                "putting file"
            );
            match session.put_file(local, remote_key).await {
                Ok(stats) => {
                    match stats.throughput_mbps() {
                        Some(rate) => info!(
                            file = %outcome.name,
                            elapsed_ms = stats.elapsed.as_millis() as u64,
                            mb_per_sec = rate,
                            "transfer complete"
                        ),
                        None => info!(
                            file = %outcome.name,
                            elapsed_ms = stats.elapsed.as_millis() as u64,
                            "transfer complete"
                        ),
                    }
                    outcome.uploaded = true;
                    outcome.error = None;
                    break;
                }
                Err(err) if err.is_transient() => {
                    outcome.error = Some(err.to_string());
                    if attempt == attempts {
                        error!(file = %outcome.name, attempts, error = %err, "retries exhausted");
                        break;
                    }
                    let wait = err.retry_after().min(self.retry_sleep_cap);
                    warn!(file = %outcome.name, attempt, wait = ?wait, error = %err, "retrying transfer");
                    if !wait.is_zero() {
                        sleep(wait).await;
                    }
                }
                Err(err) => {
                    error!(file = %outcome.name, attempt, error = %err, "transfer rejected");
                    outcome.error = Some(err.to_string());
                    if let Some(target) = resync {
                        session.resync_destination(target).await;
                    }
                    break;
                }
            }
        }
        outcome.elapsed = started.elapsed();
        outcome
    }
}
