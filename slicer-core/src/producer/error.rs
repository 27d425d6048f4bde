use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("transcoder {program} could not be started: {source}")]
    ToolUnavailable {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("transcoder exited with status {0}")]
    ToolFailed(i32),
    #[error("source video {0} does not exist")]
    SourceMissing(PathBuf),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("no duration found in transcoder output for {0}")]
    DurationUnavailable(PathBuf),
}

pub type ProducerResult<T> = Result<T, EncodeError>;
