use std::fs;
use std::path::{Path, PathBuf};
use std::vec;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::job::{is_upload_eligible, list_job_files, FileKind, Job, SegmentFile};

const APP_DIR: &str = "slicer";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("directory {0} is not empty after cleanup")]
    NotEmpty(PathBuf),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// A job directory holding a complete, re-uploadable segment set.
#[derive(Debug, Clone, Serialize)]
pub struct CachedJob {
    pub name: String,
    pub dir: PathBuf,
    pub files: Vec<SegmentFile>,
}

impl CachedJob {
    pub fn segment_count(&self) -> usize {
        self.count(FileKind::Segment)
    }

    pub fn manifest_count(&self) -> usize {
        self.count(FileKind::Manifest)
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }

    fn count(&self, kind: FileKind) -> usize {
        self.files.iter().filter(|file| file.kind == kind).count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheSummary {
    pub root: PathBuf,
    pub jobs: usize,
    pub files: u64,
    pub bytes: u64,
}

/// Lazy listing of cached jobs. Subdirectories are only inspected as the
/// iterator advances; a new call to [`CacheManager::scan`] starts over.
#[derive(Debug)]
pub struct CacheScan {
    dirs: vec::IntoIter<PathBuf>,
}

impl Iterator for CacheScan {
    type Item = CachedJob;

    fn next(&mut self) -> Option<Self::Item> {
        for dir in self.dirs.by_ref() {
            let files = match list_job_files(&dir) {
                Ok(files) => files,
                Err(err) => {
                    warn!(path = %dir.display(), error = %err, "failed to read cache directory");
                    continue;
                }
            };
            if is_upload_eligible(&files) {
                return Some(CachedJob {
                    name: crate::job::job_name(&dir),
                    dir,
                    files,
                });
            }
            debug!(path = %dir.display(), "skipping incomplete cache directory");
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct CacheManager {
    root: PathBuf,
}

impl CacheManager {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Manager rooted at the configured path, or at [`default_root`].
    pub fn from_setting(path: Option<&Path>) -> Self {
        match path {
            Some(path) if !path.as_os_str().is_empty() => Self::new(path),
            _ => Self::new(default_root()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scan(&self) -> CacheScan {
        let mut dirs = Vec::new();
        match fs::read_dir(&self.root) {
            Ok(entries) => {
                for entry in entries.filter_map(Result::ok) {
                    if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                        dirs.push(entry.path());
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %self.root.display(), error = %err, "failed to scan cache root");
            }
        }
        dirs.sort();
        CacheScan {
            dirs: dirs.into_iter(),
        }
    }

    pub fn summary(&self) -> CacheSummary {
        let mut summary = CacheSummary {
            root: self.root.clone(),
            ..CacheSummary::default()
        };
        for job in self.scan() {
            summary.jobs += 1;
            for entry in WalkDir::new(&job.dir)
                .min_depth(1)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|entry| entry.file_type().is_file())
            {
                summary.files += 1;
                summary.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        summary
    }

    pub fn create_job_dir(&self, job: &Job) -> CacheResult<()> {
        fs::create_dir_all(&job.dir).map_err(|source| CacheError::Io {
            source,
            path: job.dir.clone(),
        })?;
        debug!(path = %job.dir.display(), "created job directory");
        Ok(())
    }

    /// Removes everything under the root. Stops at the first failure;
    /// entries removed before it stay removed.
    pub fn clear(&self) -> CacheResult<usize> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(CacheError::Io {
                    source,
                    path: self.root.clone(),
                })
            }
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|source| CacheError::Io {
                source,
                path: self.root.clone(),
            })?;
            let path = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let result = if is_dir {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|source| CacheError::Io {
                source,
                path: path.clone(),
            })?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Removes the files of a job directory, then the directory itself.
    pub fn cleanup_job(&self, dir: &Path) -> CacheResult<()> {
        let entries = fs::read_dir(dir).map_err(|source| CacheError::Io {
            source,
            path: dir.to_path_buf(),
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| CacheError::Io {
                source,
                path: dir.to_path_buf(),
            })?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                let path = entry.path();
                fs::remove_file(&path).map_err(|source| CacheError::Io { source, path })?;
            }
        }
        let leftover = fs::read_dir(dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if leftover {
            return Err(CacheError::NotEmpty(dir.to_path_buf()));
        }
        fs::remove_dir(dir).map_err(|source| CacheError::Io {
            source,
            path: dir.to_path_buf(),
        })
    }
}

/// Whether `dir` holds at least one segment and exactly one manifest.
pub fn validate_job_dir(dir: &Path) -> bool {
    match list_job_files(dir) {
        Ok(files) => is_upload_eligible(&files),
        Err(err) => {
            debug!(path = %dir.display(), error = %err, "job directory unreadable");
            false
        }
    }
}

/// Per-user cache root, falling back to `./cache`. Never fails; creation
/// problems are logged and the fallback path is returned anyway.
pub fn default_root() -> PathBuf {
    if let Some(data_dir) = user_data_dir(|key| std::env::var(key).ok()) {
        let candidate = data_dir.join(APP_DIR).join("cache");
        match fs::create_dir_all(&candidate) {
            Ok(()) => return candidate,
            Err(err) => {
                warn!(path = %candidate.display(), error = %err, "user cache directory unavailable")
            }
        }
    }
    let fallback = std::env::current_dir()
        .map(|dir| dir.join("cache"))
        .unwrap_or_else(|_| PathBuf::from("cache"));
    if let Err(err) = fs::create_dir_all(&fallback) {
        warn!(path = %fallback.display(), error = %err, "failed to create fallback cache directory");
    }
    fallback
}

fn user_data_dir<F>(lookup: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
    if cfg!(windows) {
        return non_empty("LOCALAPPDATA").map(PathBuf::from);
    }
    if let Some(xdg) = non_empty("XDG_DATA_HOME") {
        return Some(PathBuf::from(xdg));
    }
    let home = PathBuf::from(non_empty("HOME")?);
    if cfg!(target_os = "macos") {
        Some(home.join("Library").join("Application Support"))
    } else {
        Some(home.join(".local").join("share"))
    }
}
