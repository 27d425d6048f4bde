use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

pub const DEFAULT_SEGMENT_SECONDS: u32 = 3;
pub const DEFAULT_QUALITY_CRF: u32 = 23;
pub const DEFAULT_FTP_PORT: u16 = 21;
pub const DEFAULT_UPLOAD_HOST: &str = "https://upload.qiniup.com";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Ftp,
    #[serde(alias = "qiniu")]
    ObjectStorage,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Ftp => f.write_str("ftp"),
            StorageKind::ObjectStorage => f.write_str("object_storage"),
        }
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct FtpCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub base_dir: String,
    pub use_tls: bool,
}

impl FtpCredentials {
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.host.trim().is_empty() {
            missing.push("server_ip");
        }
        if self.port == 0 {
            missing.push("server_port");
        }
        if self.username.trim().is_empty() {
            missing.push("username");
        }
        if self.password.is_empty() {
            missing.push("password");
        }
        if self.base_dir.trim().is_empty() {
            missing.push("upload_path");
        }
        missing
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host.trim(), self.port)
    }
}

impl fmt::Debug for FtpCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("base_dir", &self.base_dir)
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct ObjectStorageCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    /// Public domain override; the bucket's default host is used when unset.
    pub domain: Option<String>,
}

impl ObjectStorageCredentials {
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.access_key.trim().is_empty() {
            missing.push("access_key");
        }
        if self.secret_key.trim().is_empty() {
            missing.push("secret_key");
        }
        if self.bucket.trim().is_empty() {
            missing.push("bucket_name");
        }
        missing
    }
}

impl fmt::Debug for ObjectStorageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStorageCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"***")
            .field("bucket", &self.bucket)
            .field("domain", &self.domain)
            .finish()
    }
}

/// The active credential shape for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCredentials {
    Ftp(FtpCredentials),
    ObjectStorage(ObjectStorageCredentials),
}

impl BackendCredentials {
    pub fn kind(&self) -> StorageKind {
        match self {
            BackendCredentials::Ftp(_) => StorageKind::Ftp,
            BackendCredentials::ObjectStorage(_) => StorageKind::ObjectStorage,
        }
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        match self {
            BackendCredentials::Ftp(creds) => creds.missing_fields(),
            BackendCredentials::ObjectStorage(creds) => creds.missing_fields(),
        }
    }
}

/// In-memory settings. Both credential shapes are kept so switching the
/// storage type does not lose what was typed for the other one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub storage: StorageKind,
    pub segment_seconds: u32,
    pub quality_crf: u32,
    pub cache_path: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
    pub upload_host: String,
    pub ftp: FtpCredentials,
    pub object_storage: ObjectStorageCredentials,
    pub saved_time: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage: StorageKind::Ftp,
            segment_seconds: DEFAULT_SEGMENT_SECONDS,
            quality_crf: DEFAULT_QUALITY_CRF,
            cache_path: None,
            ffmpeg_path: None,
            upload_host: DEFAULT_UPLOAD_HOST.to_string(),
            ftp: FtpCredentials {
                port: DEFAULT_FTP_PORT,
                ..FtpCredentials::default()
            },
            object_storage: ObjectStorageCredentials::default(),
            saved_time: None,
        }
    }
}

impl Settings {
    /// Defaults overlaid with the document at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut settings = Settings::default();
        settings.merge_from_path(path)?;
        Ok(settings)
    }

    /// Reads the document at `path` and applies it on top of the current
    /// values. Nothing is changed when the document cannot be read.
    pub fn merge_from_path<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let document: SettingsDocument = load_toml(path)?;
        self.apply_document(document);
        Ok(())
    }

    /// Fields absent from the document keep their current value. Only the
    /// credential shape selected by the document's storage type is applied.
    pub fn apply_document(&mut self, document: SettingsDocument) {
        if let Some(storage) = document.storage_type {
            self.storage = storage;
        }
        if let Some(seconds) = document.segment_duration {
            self.segment_seconds = seconds;
        }
        if let Some(crf) = document.quality_crf {
            self.quality_crf = crf;
        }
        if document.cache_path.is_some() {
            self.cache_path = document.cache_path;
        }
        if document.ffmpeg_path.is_some() {
            self.ffmpeg_path = document.ffmpeg_path;
        }
        if let Some(host) = document.upload_host {
            self.upload_host = host;
        }
        if document.saved_time.is_some() {
            self.saved_time = document.saved_time;
        }

        match self.storage {
            StorageKind::Ftp => {
                let ftp = &mut self.ftp;
                if let Some(host) = document.server_ip {
                    ftp.host = host;
                }
                if let Some(port) = document.server_port {
                    ftp.port = port;
                }
                if let Some(username) = document.username {
                    ftp.username = username;
                }
                if let Some(password) = document.password {
                    ftp.password = password;
                }
                if let Some(base_dir) = document.upload_path {
                    ftp.base_dir = base_dir;
                }
                if let Some(use_tls) = document.use_ssl {
                    ftp.use_tls = use_tls;
                }
            }
            StorageKind::ObjectStorage => {
                let store = &mut self.object_storage;
                if let Some(access_key) = document.access_key {
                    store.access_key = access_key;
                }
                if let Some(secret_key) = document.secret_key {
                    store.secret_key = secret_key;
                }
                if let Some(bucket) = document.bucket_name {
                    store.bucket = bucket;
                }
                if let Some(domain) = document.domain {
                    let domain = domain.trim().to_string();
                    store.domain = (!domain.is_empty()).then_some(domain);
                }
            }
        }
    }

    pub fn credentials(&self) -> BackendCredentials {
        match self.storage {
            StorageKind::Ftp => BackendCredentials::Ftp(self.ftp.clone()),
            StorageKind::ObjectStorage => {
                BackendCredentials::ObjectStorage(self.object_storage.clone())
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let missing = self.credentials().missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Incomplete {
                storage: self.storage.to_string(),
                missing: missing.join(", "),
            })
        }
    }

    /// Flat document holding the base fields and the active credential shape.
    pub fn to_document(&self) -> SettingsDocument {
        let mut document = SettingsDocument {
            storage_type: Some(self.storage),
            segment_duration: Some(self.segment_seconds),
            quality_crf: Some(self.quality_crf),
            cache_path: self.cache_path.clone(),
            saved_time: self.saved_time.clone(),
            ffmpeg_path: self.ffmpeg_path.clone(),
            upload_host: Some(self.upload_host.clone()),
            ..SettingsDocument::default()
        };
        match self.storage {
            StorageKind::Ftp => {
                document.server_ip = Some(self.ftp.host.trim().to_string());
                document.server_port = Some(self.ftp.port);
                document.username = Some(self.ftp.username.trim().to_string());
                document.password = Some(self.ftp.password.clone());
                document.upload_path = Some(self.ftp.base_dir.trim().to_string());
                document.use_ssl = Some(self.ftp.use_tls);
            }
            StorageKind::ObjectStorage => {
                let store = &self.object_storage;
                document.access_key = Some(store.access_key.trim().to_string());
                document.secret_key = Some(store.secret_key.trim().to_string());
                document.bucket_name = Some(store.bucket.trim().to_string());
                document.domain = Some(store.domain.clone().unwrap_or_default());
            }
        }
        document
    }

    /// Validates the active shape, stamps the save time and writes the
    /// document to `path`.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.validate()?;
        self.saved_time = Some(Local::now().format("%Y-%m-%d %H:%M:%S").to_string());
        let path = path.as_ref();
        let content = toml::to_string_pretty(&self.to_document())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                source,
                path: parent.to_path_buf(),
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            source,
            path: path.to_path_buf(),
        })
    }
}

/// On-disk settings record. Every field is optional so older or partial
/// documents still load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<StorageKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_crf: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ffmpeg_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_ssl: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings> {
    Settings::load(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
