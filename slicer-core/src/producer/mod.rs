mod error;

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::job::{DEFAULT_MANIFEST_NAME, SEGMENT_FILENAME_PATTERN};

pub use error::{EncodeError, ProducerResult};

pub const DIAGNOSTIC_SOURCE: &str = "ffmpeg";
const AUDIO_BITRATE: &str = "128k";
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

const WELL_KNOWN_LOCATIONS: &[&str] = &[
    "/usr/bin/ffmpeg",
    "/usr/local/bin/ffmpeg",
    "/opt/homebrew/bin/ffmpeg",
    "C:/Program Files/ffmpeg/bin/ffmpeg.exe",
    "C:/Program Files (x86)/ffmpeg/bin/ffmpeg.exe",
    "D:/ffmpeg/bin/ffmpeg.exe",
];

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
        command.output().await
    }
}

/// Runs the external transcoder that cuts a source video into HLS segments.
#[derive(Clone)]
pub struct SegmentProducer {
    ffmpeg: PathBuf,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for SegmentProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentProducer")
            .field("ffmpeg", &self.ffmpeg)
            .finish()
    }
}

impl SegmentProducer {
    pub fn new<P: Into<PathBuf>>(ffmpeg: P) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            executor: Arc::new(SystemCommandExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn program(&self) -> &Path {
        &self.ffmpeg
    }

    pub async fn produce(
        &self,
        source: &Path,
        output_dir: &Path,
        segment_seconds: u32,
        quality: u32,
    ) -> ProducerResult<PathBuf> {
        self.produce_with(source, output_dir, segment_seconds, quality, |_| {})
            .await
    }

    /// Like [`produce`](Self::produce), additionally handing every
    /// diagnostic line to `on_line` as it is read.
    pub async fn produce_with<F>(
        &self,
        source: &Path,
        output_dir: &Path,
        segment_seconds: u32,
        quality: u32,
        mut on_line: F,
    ) -> ProducerResult<PathBuf>
    where
        F: FnMut(&str) + Send,
    {
        if !source.is_file() {
            return Err(EncodeError::SourceMissing(source.to_path_buf()));
        }
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|source| EncodeError::Io {
                source,
                path: output_dir.to_path_buf(),
            })?;

        let manifest = output_dir.join(DEFAULT_MANIFEST_NAME);
        let args = hls_arguments(source, output_dir, &manifest, segment_seconds, quality);
        info!(
            program = %self.ffmpeg.display(),
            args = %render_args(&args),
            "starting transcoder"
        );

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EncodeError::ToolUnavailable {
                program: self.ffmpeg.clone(),
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            let lines = stream_diagnostics(stderr, DIAGNOSTIC_SOURCE, &mut on_line).await;
            debug!(lines, "transcoder diagnostics finished");
        }

        let status = child.wait().await.map_err(|source| EncodeError::Io {
            source,
            path: self.ffmpeg.clone(),
        })?;
        if status.success() {
            info!(manifest = %manifest.display(), "transcoder finished");
            Ok(manifest)
        } else {
            let code = status.code().unwrap_or(-1);
            warn!(code, "transcoder failed");
            Err(EncodeError::ToolFailed(code))
        }
    }

    /// Media duration in seconds, read from the transcoder's input banner.
    pub async fn probe_duration(&self, source: &Path) -> ProducerResult<f64> {
        if !source.is_file() {
            return Err(EncodeError::SourceMissing(source.to_path_buf()));
        }
        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-hide_banner")
            .arg("-i")
            .arg(source)
            .stdin(Stdio::null());
        let output = self
            .executor
            .run(&mut command)
            .await
            .map_err(|source| EncodeError::ToolUnavailable {
                program: self.ffmpeg.clone(),
                source,
            })?;
        // Without an output file the tool exits non-zero; only the banner matters.
        let stderr = String::from_utf8_lossy(&output.stderr);
        parse_duration(&stderr).ok_or_else(|| EncodeError::DurationUnavailable(source.to_path_buf()))
    }
}

/// The fixed HLS argument template.
pub fn hls_arguments(
    source: &Path,
    output_dir: &Path,
    manifest: &Path,
    segment_seconds: u32,
    quality: u32,
) -> Vec<OsString> {
    let seconds = segment_seconds.to_string();
    let key_frames = format!("expr:gte(t,n_forced*{})", seconds);
    let crf = quality.to_string();
    let mut args: Vec<OsString> = vec!["-i".into(), source.as_os_str().to_owned()];
    args.extend(
        [
            "-force_key_frames",
            key_frames.as_str(),
            "-c:v",
            "libx264",
            "-preset",
            "fast",
            "-crf",
            crf.as_str(),
            "-c:a",
            "aac",
            "-b:a",
            AUDIO_BITRATE,
            "-hls_time",
            seconds.as_str(),
            "-hls_list_size",
            "0",
            "-hls_segment_filename",
        ]
        .iter()
        .map(OsString::from),
    );
    args.push(output_dir.join(SEGMENT_FILENAME_PATTERN).into_os_string());
    args.extend(["-f", "hls"].iter().map(OsString::from));
    args.push(manifest.as_os_str().to_owned());
    args
}

fn render_args(args: &[OsString]) -> String {
    args.iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reads `reader` until EOF, splitting on `\n` and `\r` so progress lines
/// show up as they are printed. Undecodable bytes are replaced.
async fn stream_diagnostics<R, F>(reader: R, label: &str, on_line: &mut F) -> usize
where
    R: AsyncRead + Unpin,
    F: FnMut(&str) + Send,
{
    let mut segments = BufReader::new(reader).split(b'\n');
    let mut count = 0;
    loop {
        match segments.next_segment().await {
            Ok(Some(raw)) => {
                for piece in raw.split(|byte| *byte == b'\r') {
                    let text = String::from_utf8_lossy(piece);
                    let line = text.trim();
                    if line.is_empty() {
                        continue;
                    }
                    debug!(source = label, "{}", line);
                    on_line(line);
                    count += 1;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(source = label, error = %err, "failed to read diagnostics");
                break;
            }
        }
    }
    count
}

fn duration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid duration regex")
    })
}

pub fn parse_duration(banner: &str) -> Option<f64> {
    let captures = duration_pattern().captures(banner)?;
    let hours: f64 = captures.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = captures.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = captures.get(3)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

pub fn expected_segment_count(duration_seconds: f64, segment_seconds: u32) -> u64 {
    if segment_seconds == 0 || duration_seconds <= 0.0 {
        return 0;
    }
    (duration_seconds / segment_seconds as f64).ceil() as u64
}

/// First candidate answering `-version` successfully: `preferred`, then the
/// names on `PATH`, then well-known install locations.
pub async fn locate_ffmpeg(preferred: Option<&Path>) -> Option<PathBuf> {
    locate_with(&SystemCommandExecutor, &ffmpeg_candidates(preferred)).await
}

fn ffmpeg_candidates(preferred: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = preferred {
        candidates.push(path.to_path_buf());
    }
    candidates.push(PathBuf::from("ffmpeg"));
    candidates.push(PathBuf::from("ffmpeg.exe"));
    candidates.extend(WELL_KNOWN_LOCATIONS.iter().map(PathBuf::from));
    candidates.push(std::env::temp_dir().join("ffmpeg").join("bin").join("ffmpeg.exe"));
    candidates
}

async fn locate_with(executor: &dyn CommandExecutor, candidates: &[PathBuf]) -> Option<PathBuf> {
    for candidate in candidates {
        let mut command = Command::new(candidate);
        command
            .arg("-version")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        match timeout(VERSION_CHECK_TIMEOUT, executor.run(&mut command)).await {
            Ok(Ok(output)) if output.status.success() => {
                debug!(program = %candidate.display(), "transcoder found");
                return Some(candidate.clone());
            }
            Ok(Ok(_)) | Ok(Err(_)) => continue,
            Err(_) => {
                warn!(program = %candidate.display(), "transcoder version check timed out");
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_template_is_fixed() {
        let args = hls_arguments(
            Path::new("/in/movie.mp4"),
            Path::new("/cache/job"),
            Path::new("/cache/job/playlist.m3u8"),
            3,
            23,
        );
        let rendered = render_args(&args);
        assert_eq!(
            rendered,
            "-i /in/movie.mp4 -force_key_frames expr:gte(t,n_forced*3) -c:v libx264 -preset fast \
             -crf 23 -c:a aac -b:a 128k -hls_time 3 -hls_list_size 0 -hls_segment_filename \
             /cache/job/segment_%03d.ts -f hls /cache/job/playlist.m3u8"
        );
    }

    #[test]
    fn parses_banner_duration() {
        let banner = "Input #0, mov,mp4\n  Duration: 01:02:03.50, start: 0.000000, bitrate: 1 kb/s";
        assert_eq!(parse_duration(banner), Some(3723.5));
        assert_eq!(parse_duration("Duration: N/A"), None);
    }

    #[test]
    fn segment_count_rounds_up() {
        assert_eq!(expected_segment_count(10.0, 3), 4);
        assert_eq!(expected_segment_count(9.0, 3), 3);
        assert_eq!(expected_segment_count(9.0, 0), 0);
    }

    #[tokio::test]
    async fn diagnostics_survive_invalid_bytes() {
        let data: &[u8] = b"frame=1\rframe=2\nbad \xff\xfe bytes\n\n";
        let mut seen = Vec::new();
        let count = stream_diagnostics(data, "test", &mut |line: &str| seen.push(line.to_string())).await;
        assert_eq!(count, 3);
        assert_eq!(seen[0], "frame=1");
        assert_eq!(seen[1], "frame=2");
        assert!(seen[2].starts_with("bad "));
        assert!(seen[2].contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn missing_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let producer = SegmentProducer::new("ffmpeg");
        let err = producer
            .produce(&dir.path().join("absent.mp4"), &dir.path().join("out"), 3, 23)
            .await
            .unwrap_err();
        assert!(matches!(err, EncodeError::SourceMissing(_)));
    }

    #[tokio::test]
    async fn unavailable_tool_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("movie.mp4");
        std::fs::write(&source, b"not really a video").unwrap();
        let producer = SegmentProducer::new(dir.path().join("no-such-ffmpeg"));
        let err = producer
            .produce(&source, &dir.path().join("out"), 3, 23)
            .await
            .unwrap_err();
        assert!(matches!(err, EncodeError::ToolUnavailable { .. }));
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::os::unix::process::ExitStatusExt;
        use std::sync::Mutex;

        fn write_script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-ffmpeg.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        #[tokio::test]
        async fn successful_run_returns_manifest_and_streams_lines() {
            let dir = tempfile::tempdir().unwrap();
            let source = dir.path().join("movie.mp4");
            std::fs::write(&source, b"video").unwrap();
            let script = write_script(
                dir.path(),
                "printf 'Input #0\\n' >&2\nprintf 'bad \\377 byte\\n' >&2\nprintf 'stdout noise\\n'\nexit 0",
            );
            let out = dir.path().join("out");
            let mut lines = Vec::new();
            let manifest = SegmentProducer::new(&script)
                .produce_with(&source, &out, 3, 23, |line| lines.push(line.to_string()))
                .await
                .unwrap();
            assert_eq!(manifest, out.join("playlist.m3u8"));
            assert!(out.is_dir());
            assert_eq!(lines.len(), 2);
            assert_eq!(lines[0], "Input #0");
        }

        #[tokio::test]
        async fn nonzero_exit_is_tool_failure() {
            let dir = tempfile::tempdir().unwrap();
            let source = dir.path().join("movie.mp4");
            std::fs::write(&source, b"video").unwrap();
            let script = write_script(dir.path(), "echo 'Invalid data found' >&2\nexit 3");
            let err = SegmentProducer::new(&script)
                .produce(&source, &dir.path().join("out"), 3, 23)
                .await
                .unwrap_err();
            assert!(matches!(err, EncodeError::ToolFailed(3)));
        }

        struct ScriptedExecutor {
            outputs: Mutex<Vec<std::io::Result<std::process::Output>>>,
        }

        #[async_trait]
        impl CommandExecutor for ScriptedExecutor {
            async fn run(&self, _command: &mut Command) -> std::io::Result<std::process::Output> {
                self.outputs
                    .lock()
                    .unwrap()
                    .pop()
                    .unwrap_or_else(|| Err(std::io::Error::other("no output")))
            }
        }

        fn output(code: i32, stderr: &str) -> std::process::Output {
            std::process::Output {
                status: std::process::ExitStatus::from_raw(code << 8),
                stdout: Vec::new(),
                stderr: stderr.as_bytes().to_vec(),
            }
        }

        #[tokio::test]
        async fn probe_reads_duration_from_failing_run() {
            let dir = tempfile::tempdir().unwrap();
            let source = dir.path().join("movie.mp4");
            std::fs::write(&source, b"video").unwrap();
            let executor = Arc::new(ScriptedExecutor {
                outputs: Mutex::new(vec![Ok(output(
                    1,
                    "  Duration: 00:00:10.00, start: 0.0\nAt least one output file must be specified",
                ))]),
            });
            let producer = SegmentProducer::new("ffmpeg").with_executor(executor);
            assert_eq!(producer.probe_duration(&source).await.unwrap(), 10.0);
        }

        #[tokio::test]
        async fn locate_skips_broken_candidates() {
            let executor = ScriptedExecutor {
                outputs: Mutex::new(vec![
                    Ok(output(0, "")),
                    Ok(output(1, "")),
                    Err(std::io::Error::from(std::io::ErrorKind::NotFound)),
                ]),
            };
            let candidates = vec![
                PathBuf::from("first"),
                PathBuf::from("second"),
                PathBuf::from("third"),
            ];
            let found = locate_with(&executor, &candidates).await;
            assert_eq!(found, Some(PathBuf::from("third")));
        }
    }
}
