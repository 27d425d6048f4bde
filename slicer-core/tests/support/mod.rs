#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use slicer_core::backend::ConnectResult;
use slicer_core::{
    BackendSession, ConnectError, StorageKind, TransferBackend, TransferError, TransferStats,
    UploadTarget,
};

pub const JOB: &str = "movie_20240101_120000";
pub const JOB_FILES: [&str; 3] = ["segment_000.ts", "segment_001.ts", "playlist.m3u8"];

pub fn write_job(root: &Path, name: &str, files: &[&str]) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    for file in files {
        std::fs::write(dir.join(file), format!("data for {file}")).unwrap();
    }
    dir
}

/// Everything the scripted backend saw.
#[derive(Debug, Default)]
pub struct Journal {
    pub connects: usize,
    pub closes: usize,
    pub ensures: usize,
    pub resyncs: usize,
    pub puts: Vec<String>,
    pub remote_dirs: BTreeSet<String>,
    pub stored: BTreeSet<String>,
}

#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

#[derive(Default)]
struct Scripts {
    queued: HashMap<String, VecDeque<Result<(), TransferError>>>,
    fallback: HashMap<String, TransferError>,
}

impl Scripts {
    fn next_result(&mut self, file: &str) -> Result<(), TransferError> {
        if let Some(result) = self.queued.get_mut(file).and_then(|queue| queue.pop_front()) {
            return result;
        }
        match self.fallback.get(file) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// In-memory backend driven by per-file scripts of put results.
#[derive(Default)]
pub struct ScriptedBackend {
    base_dir: String,
    connect_error: bool,
    connect_panics: bool,
    ensure_error: bool,
    scripts: Arc<Mutex<Scripts>>,
    gate: Mutex<Option<Arc<Gate>>>,
    pub journal: Arc<Mutex<Journal>>,
}

impl ScriptedBackend {
    pub fn new(base_dir: &str) -> Self {
        Self {
            base_dir: base_dir.to_string(),
            ..Self::default()
        }
    }

    pub fn failing_connect(mut self) -> Self {
        self.connect_error = true;
        self
    }

    pub fn panicking_connect(mut self) -> Self {
        self.connect_panics = true;
        self
    }

    pub fn failing_destination(mut self) -> Self {
        self.ensure_error = true;
        self
    }

    /// Results for the next puts of `file`, in order.
    pub fn script(self, file: &str, results: Vec<Result<(), TransferError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .queued
            .insert(file.to_string(), results.into());
        self
    }

    /// Result for every put of `file` once its script is used up.
    pub fn always(self, file: &str, error: TransferError) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .fallback
            .insert(file.to_string(), error);
        self
    }

    /// Holds the first `connect` until the returned gate is released.
    pub fn gated(self) -> (Self, Arc<Gate>) {
        let gate = Arc::new(Gate::default());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn journal(&self) -> Arc<Mutex<Journal>> {
        Arc::clone(&self.journal)
    }
}

#[async_trait]
impl TransferBackend for ScriptedBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Ftp
    }

    fn target_for(&self, job_name: &str) -> UploadTarget {
        UploadTarget::directory(&self.base_dir, job_name)
    }

    async fn connect(&self) -> ConnectResult<Box<dyn BackendSession>> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.connect_panics {
            panic!("backend exploded");
        }
        self.journal.lock().unwrap().connects += 1;
        if self.connect_error {
            return Err(ConnectError::Auth("530 Login incorrect".into()));
        }
        Ok(Box::new(ScriptedSession {
            scripts: Arc::clone(&self.scripts),
            ensure_error: self.ensure_error,
            journal: Arc::clone(&self.journal),
        }))
    }
}

struct ScriptedSession {
    scripts: Arc<Mutex<Scripts>>,
    ensure_error: bool,
    journal: Arc<Mutex<Journal>>,
}

#[async_trait]
impl BackendSession for ScriptedSession {
    async fn ensure_destination(&mut self, target: &UploadTarget) -> ConnectResult<()> {
        let mut journal = self.journal.lock().unwrap();
        journal.ensures += 1;
        if self.ensure_error {
            return Err(ConnectError::Destination {
                path: target.as_str().to_string(),
                message: "553 permission denied".into(),
            });
        }
        let mut current = String::new();
        for part in target.as_str().split('/').filter(|part| !part.is_empty()) {
            current.push('/');
            current.push_str(part);
            // Creating an existing directory is not an error.
            journal.remote_dirs.insert(current.clone());
        }
        Ok(())
    }

    async fn put_file(&mut self, local: &Path, remote_key: &str) -> Result<TransferStats, TransferError> {
        let file = local.file_name().unwrap().to_string_lossy().into_owned();
        self.journal.lock().unwrap().puts.push(file.clone());
        let scripted = self.scripts.lock().unwrap().next_result(&file);
        scripted?;
        let bytes = std::fs::metadata(local).map(|meta| meta.len()).unwrap_or(0);
        self.journal.lock().unwrap().stored.insert(remote_key.to_string());
        Ok(TransferStats {
            bytes,
            elapsed: Duration::from_millis(1),
        })
    }

    async fn resync_destination(&mut self, _target: &UploadTarget) {
        self.journal.lock().unwrap().resyncs += 1;
    }

    async fn close(self: Box<Self>) {
        self.journal.lock().unwrap().closes += 1;
    }
}

pub fn transient(retry_after: Duration) -> TransferError {
    TransferError::transient("timed out", retry_after)
}

pub fn permanent() -> TransferError {
    TransferError::permanent("553 Could not create file")
}
