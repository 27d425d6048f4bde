use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse settings {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("incomplete {storage} settings, missing: {missing}")]
    Incomplete { storage: String, missing: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
