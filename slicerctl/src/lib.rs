use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use slicer_core::producer::{expected_segment_count, locate_ffmpeg};
use slicer_core::runner::{ConnectionReport, FilesReport};
use slicer_core::{
    BatchReport, CacheManager, CacheSummary, JobReport, JobRunner, Pipeline, RunnerCommand,
    RunnerOutcome, SegmentProducer, Settings, SettingsDocument, StorageKind, UploadStatus,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] slicer_core::ConfigError),
    #[error("{0}")]
    Runner(#[from] slicer_core::RunnerError),
    #[error("cache error: {0}")]
    Cache(#[from] slicer_core::CacheError),
    #[error("encoder error: {0}")]
    Encode(#[from] slicer_core::EncodeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("worker task failed: {0}")]
    Worker(String),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("upload incomplete: {0}")]
    Incomplete(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Slice videos into HLS segments and upload them", long_about = None)]
pub struct Cli {
    /// Settings document
    #[arg(long, default_value = "slicer.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Segment a video and upload the result
    Slice(SliceArgs),
    /// Upload every complete job left in the cache
    Reupload,
    /// Upload one job directory
    UploadDir(UploadDirArgs),
    /// Publish arbitrary files to object storage
    UploadFiles(UploadFilesArgs),
    /// Cache maintenance
    #[command(subcommand)]
    Cache(CacheCommands),
    /// Settings inspection and editing
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Open and close a session with the configured backend
    TestConnection,
    /// Locate the transcoder and read a video's duration
    Probe(ProbeArgs),
}

#[derive(Args, Debug)]
pub struct SliceArgs {
    /// Source video
    pub video: PathBuf,
    /// Segment length in seconds
    #[arg(long)]
    pub segment_seconds: Option<u32>,
    /// x264 CRF quality
    #[arg(long)]
    pub quality: Option<u32>,
}

#[derive(Args, Debug)]
pub struct UploadDirArgs {
    /// Directory holding segments and one manifest
    pub dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct UploadFilesArgs {
    /// Files or folders; folders contribute their regular files
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    pub video: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// List cached jobs ready for upload
    List,
    /// Job and file counts
    Status,
    /// Remove everything under the cache root
    Clear,
    /// Print the cache root
    Path,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the effective settings with secrets hidden
    Show,
    /// Check that the active storage settings are complete
    Check,
    /// Update fields and save the document
    Set(ConfigSetArgs),
}

#[derive(Args, Debug, Default)]
pub struct ConfigSetArgs {
    #[arg(long, value_enum)]
    pub storage: Option<StorageArg>,
    #[arg(long)]
    pub segment_duration: Option<u32>,
    #[arg(long)]
    pub quality_crf: Option<u32>,
    #[arg(long)]
    pub cache_path: Option<PathBuf>,
    #[arg(long)]
    pub ffmpeg_path: Option<PathBuf>,
    #[arg(long)]
    pub upload_host: Option<String>,
    #[arg(long)]
    pub server_ip: Option<String>,
    #[arg(long)]
    pub server_port: Option<u16>,
    #[arg(long)]
    pub username: Option<String>,
    #[arg(long)]
    pub password: Option<String>,
    #[arg(long)]
    pub upload_path: Option<String>,
    #[arg(long)]
    pub use_ssl: Option<bool>,
    #[arg(long)]
    pub access_key: Option<String>,
    #[arg(long)]
    pub secret_key: Option<String>,
    #[arg(long)]
    pub bucket_name: Option<String>,
    #[arg(long)]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageArg {
    Ftp,
    ObjectStorage,
}

impl From<StorageArg> for StorageKind {
    fn from(value: StorageArg) -> Self {
        match value {
            StorageArg::Ftp => StorageKind::Ftp,
            StorageArg::ObjectStorage => StorageKind::ObjectStorage,
        }
    }
}

impl ConfigSetArgs {
    fn into_document(self) -> SettingsDocument {
        SettingsDocument {
            storage_type: self.storage.map(StorageKind::from),
            segment_duration: self.segment_duration,
            quality_crf: self.quality_crf,
            cache_path: self.cache_path,
            ffmpeg_path: self.ffmpeg_path,
            upload_host: self.upload_host,
            server_ip: self.server_ip,
            server_port: self.server_port,
            username: self.username,
            password: self.password,
            upload_path: self.upload_path,
            use_ssl: self.use_ssl,
            access_key: self.access_key,
            secret_key: self.secret_key,
            bucket_name: self.bucket_name,
            domain: self.domain,
            ..SettingsDocument::default()
        }
    }
}

pub fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run(cli: Cli) -> Result<()> {
    let mut settings = load_or_default(&cli.config)?;

    match cli.command {
        Commands::Slice(args) => {
            if let Some(seconds) = args.segment_seconds {
                settings.segment_seconds = seconds;
            }
            if let Some(quality) = args.quality {
                settings.quality_crf = quality;
            }
            let runner = build_runner(settings);
            let outcome = drive(&runner, RunnerCommand::ProcessVideo(args.video)).await?;
            finish(&outcome, cli.format)?;
        }
        Commands::Reupload => {
            let runner = build_runner(settings);
            let outcome = drive(&runner, RunnerCommand::ReuploadCached).await?;
            finish(&outcome, cli.format)?;
        }
        Commands::UploadDir(args) => {
            let runner = build_runner(settings);
            let outcome = drive(&runner, RunnerCommand::UploadDirectory(args.dir)).await?;
            finish(&outcome, cli.format)?;
        }
        Commands::UploadFiles(args) => {
            let files = expand_paths(&args.paths)?;
            if files.is_empty() {
                return Err(AppError::MissingResource("no files selected".to_string()));
            }
            let runner = build_runner(settings);
            let outcome = drive(&runner, RunnerCommand::UploadFiles(files)).await?;
            finish(&outcome, cli.format)?;
        }
        Commands::TestConnection => {
            let runner = build_runner(settings);
            let outcome = drive(&runner, RunnerCommand::TestConnection).await?;
            finish(&outcome, cli.format)?;
        }
        Commands::Cache(command) => {
            let cache = CacheManager::from_setting(settings.cache_path.as_deref());
            run_cache(&cache, command, cli.format)?;
        }
        Commands::Config(ConfigCommands::Show) => {
            render(&SettingsView::new(&settings, &cli.config), cli.format)?;
        }
        Commands::Config(ConfigCommands::Check) => {
            settings.validate()?;
            render(
                &Message(format!("{} settings are complete", settings.storage)),
                cli.format,
            )?;
        }
        Commands::Config(ConfigCommands::Set(args)) => {
            settings.apply_document(args.into_document());
            settings.save(&cli.config)?;
            info!(path = %cli.config.display(), "settings saved");
            render(&SettingsView::new(&settings, &cli.config), cli.format)?;
        }
        Commands::Probe(args) => {
            let report = probe(&settings, &args.video).await?;
            render(&report, cli.format)?;
        }
    }

    Ok(())
}

/// A missing document means first run: defaults apply. A broken one is an
/// error the caller reports.
pub fn load_or_default(path: &Path) -> Result<Settings> {
    if path.exists() {
        Ok(Settings::load(path)?)
    } else {
        debug!(path = %path.display(), "settings document not found, using defaults");
        Ok(Settings::default())
    }
}

fn build_runner(settings: Settings) -> JobRunner {
    JobRunner::new(Pipeline::from_settings(settings))
}

/// Runs `command` in the background; Ctrl-C requests a cooperative stop
/// and waits for the worker to reach a job boundary.
async fn drive(runner: &JobRunner, command: RunnerCommand) -> Result<RunnerOutcome> {
    let mut handle = runner.spawn(command)?;
    let finished = tokio::select! {
        joined = &mut handle => Some(joined),
        _ = tokio::signal::ctrl_c() => None,
    };
    let joined = match finished {
        Some(joined) => joined,
        None => {
            warn!("interrupt received, stopping at the next job boundary");
            runner.stop();
            handle.await
        }
    };
    let outcome = joined.map_err(|err| AppError::Worker(err.to_string()))??;
    Ok(outcome)
}

fn finish(outcome: &RunnerOutcome, format: OutputFormat) -> Result<()> {
    render(outcome, format)?;
    match incomplete_reason(outcome) {
        Some(reason) => Err(AppError::Incomplete(reason)),
        None => Ok(()),
    }
}

fn incomplete_reason(outcome: &RunnerOutcome) -> Option<String> {
    match outcome {
        RunnerOutcome::Job(report) if !report.upload.status.is_success() => Some(format!(
            "{} uploaded {}/{} files",
            report.job, report.upload.succeeded, report.upload.attempted
        )),
        RunnerOutcome::Batch(batch) if batch.succeeded() < batch.jobs.len() => Some(format!(
            "{}/{} cached jobs uploaded",
            batch.succeeded(),
            batch.jobs.len()
        )),
        RunnerOutcome::Files(files) if !files.failed.is_empty() => {
            Some(format!("{} files failed", files.failed.len()))
        }
        _ => None,
    }
}

fn run_cache(cache: &CacheManager, command: CacheCommands, format: OutputFormat) -> Result<()> {
    match command {
        CacheCommands::List => {
            let jobs = cache
                .scan()
                .map(|job| CachedJobRow {
                    segments: job.segment_count(),
                    bytes: job.total_bytes(),
                    name: job.name,
                    dir: job.dir,
                })
                .collect();
            render(
                &CacheListing {
                    root: cache.root().to_path_buf(),
                    jobs,
                },
                format,
            )
        }
        CacheCommands::Status => render(&cache.summary(), format),
        CacheCommands::Clear => {
            let removed = cache.clear()?;
            render(
                &Message(format!(
                    "removed {removed} entries from {}",
                    cache.root().display()
                )),
                format,
            )
        }
        CacheCommands::Path => render(&Message(cache.root().display().to_string()), format),
    }
}

/// Regular files named directly, plus the regular files inside named
/// folders (not recursive), sorted per folder.
pub fn expand_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut inside = Vec::new();
            for entry in fs::read_dir(path)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    inside.push(entry.path());
                }
            }
            inside.sort();
            files.extend(inside);
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            return Err(AppError::MissingResource(path.display().to_string()));
        }
    }
    Ok(files)
}

async fn probe(settings: &Settings, video: &Path) -> Result<ProbeReport> {
    let ffmpeg = locate_ffmpeg(settings.ffmpeg_path.as_deref())
        .await
        .ok_or_else(|| AppError::MissingResource("ffmpeg".to_string()))?;
    let duration = SegmentProducer::new(&ffmpeg).probe_duration(video).await?;
    Ok(ProbeReport {
        ffmpeg,
        video: video.to_path_buf(),
        duration_secs: duration,
        segment_seconds: settings.segment_seconds,
        expected_segments: expected_segment_count(duration, settings.segment_seconds),
    })
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
struct Message(String);

impl DisplayFallback for Message {
    fn display(&self) -> String {
        self.0.clone()
    }
}

#[derive(Debug, Serialize)]
struct CachedJobRow {
    name: String,
    dir: PathBuf,
    segments: usize,
    bytes: u64,
}

#[derive(Debug, Serialize)]
struct CacheListing {
    root: PathBuf,
    jobs: Vec<CachedJobRow>,
}

impl DisplayFallback for CacheListing {
    fn display(&self) -> String {
        if self.jobs.is_empty() {
            return format!("No cached jobs in {}", self.root.display());
        }
        let mut lines = vec![format!("Cached jobs in {}:", self.root.display())];
        for job in &self.jobs {
            lines.push(format!(
                "  - {} ({} segments, {:.2} MB)",
                job.name,
                job.segments,
                megabytes(job.bytes)
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for CacheSummary {
    fn display(&self) -> String {
        format!(
            "Cache {}: {} jobs, {} files, {:.2} MB",
            self.root.display(),
            self.jobs,
            self.files,
            megabytes(self.bytes)
        )
    }
}

#[derive(Debug, Serialize)]
struct SettingsView {
    path: PathBuf,
    settings: Value,
}

impl SettingsView {
    fn new(settings: &Settings, path: &Path) -> Self {
        let mut document = settings.to_document();
        if document.password.as_deref().is_some_and(|p| !p.is_empty()) {
            document.password = Some("***".to_string());
        }
        if document.secret_key.as_deref().is_some_and(|s| !s.is_empty()) {
            document.secret_key = Some("***".to_string());
        }
        Self {
            path: path.to_path_buf(),
            settings: serde_json::to_value(document).unwrap_or(Value::Null),
        }
    }
}

impl DisplayFallback for SettingsView {
    fn display(&self) -> String {
        let mut lines = vec![format!("Settings ({})", self.path.display())];
        if let Value::Object(fields) = &self.settings {
            for (key, value) in fields {
                let rendered = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                lines.push(format!("  {key} = {rendered}"));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct ProbeReport {
    ffmpeg: PathBuf,
    video: PathBuf,
    duration_secs: f64,
    segment_seconds: u32,
    expected_segments: u64,
}

impl DisplayFallback for ProbeReport {
    fn display(&self) -> String {
        format!(
            "{}: {:.2}s, about {} segments of {}s (ffmpeg: {})",
            self.video.display(),
            self.duration_secs,
            self.expected_segments,
            self.segment_seconds,
            self.ffmpeg.display()
        )
    }
}

impl DisplayFallback for RunnerOutcome {
    fn display(&self) -> String {
        match self {
            RunnerOutcome::Job(report) => report.display(),
            RunnerOutcome::Batch(report) => report.display(),
            RunnerOutcome::Files(report) => report.display(),
            RunnerOutcome::Connection(report) => report.display(),
        }
    }
}

impl DisplayFallback for JobReport {
    fn display(&self) -> String {
        let upload = &self.upload;
        let mut lines = vec![format!(
            "{}: {} ({}/{} files, {:.2} MB in {:.1}s)",
            self.job,
            status_label(upload.status),
            upload.succeeded,
            upload.attempted,
            megabytes(upload.bytes),
            upload.elapsed.as_secs_f64()
        )];
        if let Some(error) = &upload.error {
            lines.push(format!("  error: {error}"));
        }
        for file in upload.files.iter().filter(|file| !file.uploaded) {
            lines.push(format!(
                "  failed {} after {} attempt(s): {}",
                file.name,
                file.attempts,
                file.error.as_deref().unwrap_or("unknown error")
            ));
        }
        if self.cleaned {
            lines.push(format!("  removed {}", self.dir.display()));
        } else {
            lines.push(format!("  kept {} for re-upload", self.dir.display()));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for BatchReport {
    fn display(&self) -> String {
        if self.jobs.is_empty() && !self.stopped {
            return "No cached jobs to upload".to_string();
        }
        let mut lines: Vec<String> = self.jobs.iter().map(JobReport::display).collect();
        lines.push(format!(
            "{}/{} jobs uploaded{}",
            self.succeeded(),
            self.jobs.len(),
            if self.stopped { " (stopped)" } else { "" }
        ));
        lines.join("\n")
    }
}

impl DisplayFallback for FilesReport {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for file in &self.uploaded {
            lines.push(format!("{} -> {}", file.name, file.url));
        }
        for file in &self.failed {
            lines.push(format!(
                "{} failed: {}",
                file.name,
                file.error.as_deref().unwrap_or("unknown error")
            ));
        }
        if lines.is_empty() {
            lines.push("Nothing uploaded".to_string());
        }
        lines.join("\n")
    }
}

impl DisplayFallback for ConnectionReport {
    fn display(&self) -> String {
        format!(
            "{} connection ok ({} ms)",
            self.storage,
            self.elapsed.as_millis()
        )
    }
}

fn status_label(status: UploadStatus) -> &'static str {
    match status {
        UploadStatus::Success => "success",
        UploadStatus::PartialFailure => "partial failure",
        UploadStatus::Failure => "failure",
    }
}

fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}
