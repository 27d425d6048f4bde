pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod job;
pub mod producer;
pub mod runner;
pub mod upload;

pub use backend::{
    BackendSession, ConnectError, FtpBackend, ObjectStorageBackend, TransferBackend,
    TransferError, TransferStats,
};
pub use cache::{default_root, validate_job_dir, CacheError, CacheManager, CacheSummary, CachedJob};
pub use config::{
    load_settings, BackendCredentials, FtpCredentials, ObjectStorageCredentials, Settings,
    SettingsDocument, StorageKind,
};
pub use error::{ConfigError, Result};
pub use job::{FileKind, Job, SegmentFile, UploadTarget};
pub use producer::{locate_ffmpeg, EncodeError, SegmentProducer};
pub use runner::{
    BatchReport, FilesReport, JobReport, JobRunner, JobState, Pipeline, ProcessingGuard,
    RunnerCommand, RunnerError, RunnerOutcome, UploadedFile,
};
pub use upload::{FileOutcome, RetryPolicy, UploadObserver, UploadResult, UploadStatus, Uploader};
