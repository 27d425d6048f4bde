//! Single-worker job execution.
//!
//! At most one job runs at a time. [`JobState`] carries the processing and
//! stop flags; [`ProcessingGuard`] clears the processing flag when the
//! worker finishes, whether it returns, errors or panics.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{self, ConnectError, ObjectStorageBackend, TransferBackend};
use crate::cache::{validate_job_dir, CacheError, CacheManager};
use crate::config::{Settings, StorageKind};
use crate::error::ConfigError;
use crate::job::{job_name, Job};
use crate::producer::{expected_segment_count, EncodeError, SegmentProducer};
use crate::upload::{FileOutcome, UploadResult, Uploader};

pub const UPLOADS_PREFIX: &str = "uploads";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("another job is already running")]
    Busy,
    #[error("stopped before upload; segments kept in {0}")]
    Stopped(PathBuf),
    #[error("{0} is not an uploadable job directory (needs segments and one manifest)")]
    NotEligible(PathBuf),
    #[error("{0}")]
    Unsupported(String),
    #[error("encoding failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("settings error: {0}")]
    Config(#[from] ConfigError),
    #[error("connection failed: {0}")]
    Connect(#[from] ConnectError),
}

pub type RunnerResult<T> = Result<T, RunnerError>;

#[derive(Debug, Default)]
pub struct JobState {
    processing: AtomicBool,
    stop: AtomicBool,
}

impl JobState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Asks the running job to stop at the next job boundary.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Marks the worker busy. Fails with [`RunnerError::Busy`] while another
    /// guard is alive.
    pub fn try_begin(self: &Arc<Self>) -> RunnerResult<ProcessingGuard> {
        self.processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RunnerError::Busy)?;
        self.stop.store(false, Ordering::Release);
        Ok(ProcessingGuard {
            state: Arc::clone(self),
        })
    }
}

#[derive(Debug)]
pub struct ProcessingGuard {
    state: Arc<JobState>,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.state.processing.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: String,
    pub dir: PathBuf,
    pub upload: UploadResult,
    pub cleaned: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub jobs: Vec<JobReport>,
    pub stopped: bool,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| job.upload.status.is_success())
            .count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadedFile {
    pub name: String,
    pub key: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilesReport {
    pub uploaded: Vec<UploadedFile>,
    pub failed: Vec<FileOutcome>,
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub storage: StorageKind,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub enum RunnerCommand {
    ProcessVideo(PathBuf),
    ReuploadCached,
    UploadDirectory(PathBuf),
    UploadFiles(Vec<PathBuf>),
    TestConnection,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunnerOutcome {
    Job(JobReport),
    Batch(BatchReport),
    Files(FilesReport),
    Connection(ConnectionReport),
}

/// The collaborators a job needs. Holds no run state of its own.
#[derive(Clone)]
pub struct Pipeline {
    settings: Settings,
    cache: CacheManager,
    producer: SegmentProducer,
    backend: Arc<dyn TransferBackend>,
    uploader: Uploader,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("cache", &self.cache)
            .field("producer", &self.producer)
            .field("backend", &self.backend.kind())
            .field("uploader", &self.uploader)
            .finish()
    }
}

impl Pipeline {
    pub fn from_settings(settings: Settings) -> Self {
        let cache = CacheManager::from_setting(settings.cache_path.as_deref());
        let producer = SegmentProducer::new(
            settings
                .ffmpeg_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("ffmpeg")),
        );
        let backend = backend::from_settings(&settings);
        Self {
            settings,
            cache,
            producer,
            backend,
            uploader: Uploader::new(),
        }
    }

    pub fn with_cache(mut self, cache: CacheManager) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_producer(mut self, producer: SegmentProducer) -> Self {
        self.producer = producer;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn TransferBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_uploader(mut self, uploader: Uploader) -> Self {
        self.uploader = uploader;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub async fn run(&self, command: RunnerCommand, state: &JobState) -> RunnerResult<RunnerOutcome> {
        match command {
            RunnerCommand::ProcessVideo(source) => {
                self.process_video(&source, state).await.map(RunnerOutcome::Job)
            }
            RunnerCommand::ReuploadCached => Ok(RunnerOutcome::Batch(self.reupload_cached(state).await)),
            RunnerCommand::UploadDirectory(dir) => self.upload_directory(&dir).await.map(RunnerOutcome::Job),
            RunnerCommand::UploadFiles(files) => {
                self.upload_files(&files, state).await.map(RunnerOutcome::Files)
            }
            RunnerCommand::TestConnection => self.test_connection().await.map(RunnerOutcome::Connection),
        }
    }

    /// Segments `source` into a new cache directory, uploads it and removes
    /// it after a fully successful upload.
    pub async fn process_video(&self, source: &Path, state: &JobState) -> RunnerResult<JobReport> {
        if !source.is_file() {
            return Err(EncodeError::SourceMissing(source.to_path_buf()).into());
        }
        let job = Job::new(
            self.cache.root(),
            source,
            self.settings.segment_seconds,
            self.settings.quality_crf,
            Local::now(),
        );
        self.cache.create_job_dir(&job)?;
        match self.producer.probe_duration(source).await {
            Ok(duration) => info!(
                job = %job.name,
                duration_secs = duration,
                expected_segments = expected_segment_count(duration, job.segment_seconds),
                "segmenting video"
            ),
            Err(err) => debug!(job = %job.name, error = %err, "duration probe failed"),
        }
        self.producer
            .produce(source, &job.dir, job.segment_seconds, job.quality)
            .await?;

        if state.stop_requested() {
            info!(job = %job.name, "stop requested, upload skipped");
            return Err(RunnerError::Stopped(job.dir));
        }
        Ok(self.upload_and_clean(&job.dir).await)
    }

    /// Uploads every complete cached job, oldest name first.
    pub async fn reupload_cached(&self, state: &JobState) -> BatchReport {
        let mut report = BatchReport {
            jobs: Vec::new(),
            stopped: false,
        };
        for cached in self.cache.scan() {
            if state.stop_requested() {
                info!(remaining = %cached.name, "stop requested, leaving remaining jobs cached");
                report.stopped = true;
                break;
            }
            report.jobs.push(self.upload_and_clean(&cached.dir).await);
        }
        info!(
            jobs = report.jobs.len(),
            succeeded = report.succeeded(),
            "cached upload pass finished"
        );
        report
    }

    pub async fn upload_directory(&self, dir: &Path) -> RunnerResult<JobReport> {
        if !validate_job_dir(dir) {
            return Err(RunnerError::NotEligible(dir.to_path_buf()));
        }
        Ok(self.upload_and_clean(dir).await)
    }

    /// Sends arbitrary files to the object-storage bucket under `uploads/`
    /// and returns their public addresses.
    pub async fn upload_files(&self, files: &[PathBuf], state: &JobState) -> RunnerResult<FilesReport> {
        if self.settings.storage != StorageKind::ObjectStorage {
            return Err(RunnerError::Unsupported(
                "file uploads require object storage".to_string(),
            ));
        }
        let backend = ObjectStorageBackend::new(
            self.settings.object_storage.clone(),
            self.settings.upload_host.clone(),
        );
        let mut session = backend.connect().await?;
        let mut report = FilesReport {
            uploaded: Vec::new(),
            failed: Vec::new(),
            stopped: false,
        };
        for path in files {
            if state.stop_requested() {
                report.stopped = true;
                break;
            }
            let name = job_name(path);
            let key = format!("{}/{}", UPLOADS_PREFIX, name);
            let outcome = self
                .uploader
                .transfer_file(session.as_mut(), path, &key, None)
                .await;
            if outcome.uploaded {
                let url = backend.public_url(&key);
                info!(file = %name, url = %url, "file published");
                report.uploaded.push(UploadedFile { name, key, url });
            } else {
                report.failed.push(outcome);
            }
        }
        session.close().await;
        Ok(report)
    }

    pub async fn test_connection(&self) -> RunnerResult<ConnectionReport> {
        let started = Instant::now();
        let session = self.backend.connect().await?;
        session.close().await;
        let report = ConnectionReport {
            storage: self.backend.kind(),
            elapsed: started.elapsed(),
        };
        info!(storage = %report.storage, elapsed_ms = report.elapsed.as_millis() as u64, "connection test passed");
        Ok(report)
    }

    async fn upload_and_clean(&self, dir: &Path) -> JobReport {
        let upload = self.uploader.upload_job(dir, self.backend.as_ref()).await;
        let cleaned = upload.status.is_success() && self.clean(dir);
        JobReport {
            job: upload.job.clone(),
            dir: dir.to_path_buf(),
            upload,
            cleaned,
        }
    }

    fn clean(&self, dir: &Path) -> bool {
        match self.cache.cleanup_job(dir) {
            Ok(()) => {
                info!(path = %dir.display(), "cached job removed");
                true
            }
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "failed to remove cached job");
                false
            }
        }
    }
}

/// Front door for callers: enforces the single active job and runs work
/// either inline or on a background task.
#[derive(Debug, Clone)]
pub struct JobRunner {
    pipeline: Arc<Pipeline>,
    state: Arc<JobState>,
}

impl JobRunner {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            state: JobState::new(),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn state(&self) -> Arc<JobState> {
        Arc::clone(&self.state)
    }

    pub fn is_processing(&self) -> bool {
        self.state.is_processing()
    }

    pub fn stop(&self) {
        info!("stop requested");
        self.state.request_stop();
    }

    pub async fn execute(&self, command: RunnerCommand) -> RunnerResult<RunnerOutcome> {
        let _guard = self.state.try_begin()?;
        self.pipeline.run(command, &self.state).await
    }

    /// Starts `command` on a background task. The busy check happens here,
    /// so a rejected start never spawns anything.
    pub fn spawn(&self, command: RunnerCommand) -> RunnerResult<JoinHandle<RunnerResult<RunnerOutcome>>> {
        let guard = self.state.try_begin()?;
        let pipeline = Arc::clone(&self.pipeline);
        let state = Arc::clone(&self.state);
        Ok(tokio::spawn(async move {
            let _guard = guard;
            pipeline.run(command, &state).await
        }))
    }

    pub async fn process_video(&self, source: &Path) -> RunnerResult<JobReport> {
        match self.execute(RunnerCommand::ProcessVideo(source.to_path_buf())).await? {
            RunnerOutcome::Job(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    pub async fn reupload_cached(&self) -> RunnerResult<BatchReport> {
        match self.execute(RunnerCommand::ReuploadCached).await? {
            RunnerOutcome::Batch(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    pub async fn upload_directory(&self, dir: &Path) -> RunnerResult<JobReport> {
        match self.execute(RunnerCommand::UploadDirectory(dir.to_path_buf())).await? {
            RunnerOutcome::Job(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    pub async fn upload_files(&self, files: Vec<PathBuf>) -> RunnerResult<FilesReport> {
        match self.execute(RunnerCommand::UploadFiles(files)).await? {
            RunnerOutcome::Files(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    pub async fn test_connection(&self) -> RunnerResult<ConnectionReport> {
        match self.execute(RunnerCommand::TestConnection).await? {
            RunnerOutcome::Connection(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(outcome: RunnerOutcome) -> RunnerError {
    RunnerError::Unsupported(format!("unexpected runner outcome: {outcome:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_processing_flag() {
        let state = JobState::new();
        let guard = state.try_begin().unwrap();
        assert!(state.is_processing());
        assert!(matches!(state.try_begin(), Err(RunnerError::Busy)));
        drop(guard);
        assert!(!state.is_processing());
        assert!(state.try_begin().is_ok());
    }

    #[test]
    fn begin_clears_previous_stop() {
        let state = JobState::new();
        state.request_stop();
        assert!(state.stop_requested());
        let _guard = state.try_begin().unwrap();
        assert!(!state.stop_requested());
    }

    #[tokio::test]
    async fn file_uploads_need_object_storage() {
        let dir = tempfile::tempdir().unwrap();
        let runner = JobRunner::new(
            Pipeline::from_settings(Settings::default()).with_cache(CacheManager::new(dir.path())),
        );
        let err = runner
            .upload_files(vec![dir.path().join("a.png")])
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Unsupported(_)));
        assert!(!runner.is_processing());
    }

    #[tokio::test]
    async fn ineligible_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("segment_000.ts"), b"x").unwrap();
        let runner = JobRunner::new(
            Pipeline::from_settings(Settings::default()).with_cache(CacheManager::new(dir.path())),
        );
        let err = runner.upload_directory(dir.path()).await.unwrap_err();
        assert!(matches!(err, RunnerError::NotEligible(_)));
    }
}
