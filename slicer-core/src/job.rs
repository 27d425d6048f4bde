use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;

pub const SEGMENT_EXTENSION: &str = "ts";
pub const MANIFEST_EXTENSION: &str = "m3u8";
pub const DEFAULT_MANIFEST_NAME: &str = "playlist.m3u8";
pub const SEGMENT_FILENAME_PATTERN: &str = "segment_%03d.ts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Segment,
    Manifest,
}

impl FileKind {
    /// Media-type tag for a file name; `None` for files that are never uploaded.
    pub fn classify(name: &str) -> Option<Self> {
        let extension = Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())?
            .to_ascii_lowercase();
        match extension.as_str() {
            SEGMENT_EXTENSION => Some(FileKind::Segment),
            MANIFEST_EXTENSION => Some(FileKind::Manifest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub kind: FileKind,
}

/// Segment and manifest files directly inside `dir`, ordered by name.
pub fn list_job_files(dir: &Path) -> io::Result<Vec<SegmentFile>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(kind) = FileKind::classify(&name) {
            files.push(SegmentFile {
                name,
                path: entry.path(),
                size: metadata.len(),
                kind,
            });
        }
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// At least one segment and exactly one manifest.
pub fn is_upload_eligible(files: &[SegmentFile]) -> bool {
    let segments = files
        .iter()
        .filter(|file| file.kind == FileKind::Segment)
        .count();
    let manifests = files
        .iter()
        .filter(|file| file.kind == FileKind::Manifest)
        .count();
    segments >= 1 && manifests == 1
}

/// Base name of a job directory, used for remote naming.
pub fn job_name(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.to_string_lossy().into_owned())
}

/// `{video stem}_{YYYYmmdd_HHMMSS}`.
pub fn job_dir_name(source: &Path, at: DateTime<Local>) -> String {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "video".to_string());
    format!("{}_{}", stem, at.format("%Y%m%d_%H%M%S"))
}

/// One transcoding + upload unit, identified by its cache subdirectory.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub name: String,
    pub dir: PathBuf,
    pub source: Option<PathBuf>,
    pub segment_seconds: u32,
    pub quality: u32,
    pub manifest_name: String,
    pub created_at: DateTime<Local>,
}

impl Job {
    pub fn new(
        cache_root: &Path,
        source: &Path,
        segment_seconds: u32,
        quality: u32,
        created_at: DateTime<Local>,
    ) -> Self {
        let name = job_dir_name(source, created_at);
        Self {
            dir: cache_root.join(&name),
            name,
            source: Some(source.to_path_buf()),
            segment_seconds,
            quality,
            manifest_name: DEFAULT_MANIFEST_NAME.to_string(),
            created_at,
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(&self.manifest_name)
    }
}

/// Remote location of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum UploadTarget {
    Directory(String),
    KeyPrefix(String),
}

impl UploadTarget {
    /// `base/job`, except that an empty, `.` or single-letter base collapses
    /// to just the job name.
    pub fn directory(base_dir: &str, job_name: &str) -> Self {
        let base = base_dir.trim().trim_matches('/');
        let placeholder = base.is_empty()
            || base == "."
            || (base.chars().count() == 1 && base.chars().all(char::is_alphanumeric));
        if placeholder {
            UploadTarget::Directory(job_name.to_string())
        } else {
            UploadTarget::Directory(format!("{}/{}", base, job_name))
        }
    }

    pub fn key_prefix(job_name: &str) -> Self {
        UploadTarget::KeyPrefix(job_name.trim_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            UploadTarget::Directory(path) | UploadTarget::KeyPrefix(path) => path,
        }
    }

    /// Remote key for `file_name`: absolute for directories, prefixed for keys.
    pub fn remote_key(&self, file_name: &str) -> String {
        match self {
            UploadTarget::Directory(path) => format!("/{}/{}", path, file_name),
            UploadTarget::KeyPrefix(prefix) if prefix.is_empty() => file_name.to_string(),
            UploadTarget::KeyPrefix(prefix) => format!("{}/{}", prefix, file_name),
        }
    }
}
