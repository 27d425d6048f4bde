//! Remote storage clients.
//!
//! A [`TransferBackend`] describes where a job goes and how to open a
//! connection; the [`BackendSession`] it returns performs the transfers
//! and must be closed by whoever opened it.

mod error;
pub mod ftp;
pub mod object_store;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{BackendCredentials, Settings, StorageKind};
use crate::job::UploadTarget;

pub use error::{ConnectError, ConnectResult, TransferError, TransferResult};
pub use ftp::FtpBackend;
pub use object_store::ObjectStorageBackend;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(100);
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TransferStats {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl TransferStats {
    /// Megabytes per second, `None` for empty files or instant transfers.
    pub fn throughput_mbps(&self) -> Option<f64> {
        let seconds = self.elapsed.as_secs_f64();
        if self.bytes == 0 || seconds <= f64::EPSILON {
            return None;
        }
        Some(self.bytes as f64 / seconds / 1024.0 / 1024.0)
    }
}

#[async_trait]
pub trait TransferBackend: Send + Sync {
    fn kind(&self) -> StorageKind;

    /// Remote location for the job with the given directory base name.
    fn target_for(&self, job_name: &str) -> UploadTarget;

    async fn connect(&self) -> ConnectResult<Box<dyn BackendSession>>;
}

#[async_trait]
pub trait BackendSession: Send {
    /// Makes `target` exist and become the working location. Idempotent.
    async fn ensure_destination(&mut self, target: &UploadTarget) -> ConnectResult<()>;

    async fn put_file(&mut self, local: &Path, remote_key: &str) -> TransferResult<TransferStats>;

    /// Diagnostic pass after a permanent failure. Only logs.
    async fn resync_destination(&mut self, _target: &UploadTarget) {}

    /// Releases the connection. Best effort; failures are logged.
    async fn close(self: Box<Self>);
}

/// Backend for the storage kind currently selected in `settings`.
pub fn from_settings(settings: &Settings) -> Arc<dyn TransferBackend> {
    match settings.credentials() {
        BackendCredentials::Ftp(credentials) => Arc::new(FtpBackend::new(credentials)),
        BackendCredentials::ObjectStorage(credentials) => Arc::new(ObjectStorageBackend::new(
            credentials,
            settings.upload_host.clone(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_is_reported_in_megabytes() {
        let stats = TransferStats {
            bytes: 2 * 1024 * 1024,
            elapsed: Duration::from_secs(2),
        };
        assert_eq!(stats.throughput_mbps(), Some(1.0));
        let empty = TransferStats {
            bytes: 0,
            elapsed: Duration::from_secs(1),
        };
        assert_eq!(empty.throughput_mbps(), None);
    }

    #[test]
    fn selects_backend_by_storage_kind() {
        let mut settings = Settings::default();
        settings.storage = StorageKind::Ftp;
        settings.ftp.base_dir = "hls".into();
        let backend = from_settings(&settings);
        assert_eq!(backend.kind(), StorageKind::Ftp);
        assert_eq!(
            backend.target_for("movie"),
            UploadTarget::Directory("hls/movie".into())
        );

        settings.storage = StorageKind::ObjectStorage;
        let backend = from_settings(&settings);
        assert_eq!(backend.kind(), StorageKind::ObjectStorage);
        assert_eq!(
            backend.target_for("movie"),
            UploadTarget::KeyPrefix("movie".into())
        );
    }

    #[tokio::test]
    async fn incomplete_credentials_fail_before_connecting() {
        let settings = Settings::default();
        let err = match from_settings(&settings).connect().await {
            Ok(_) => panic!("connect should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, ConnectError::InvalidCredentials { .. }));
    }
}
