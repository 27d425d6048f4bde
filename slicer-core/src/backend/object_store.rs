use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use serde::Deserialize;
use serde_json::json;
use sha1::Sha1;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use url::Url;

use super::{
    BackendSession, ConnectError, ConnectResult, TransferBackend, TransferError, TransferResult,
    TransferStats, CONNECT_TIMEOUT, TRANSFER_TIMEOUT,
};
use crate::config::{ObjectStorageCredentials, StorageKind};
use crate::job::UploadTarget;

type HmacSha1 = Hmac<Sha1>;

pub const TOKEN_LIFETIME: Duration = Duration::from_secs(3600);
const RETRY_BACKOFF: Duration = Duration::from_secs(2);
const DEFAULT_PUBLIC_HOST_SUFFIX: &str = "s3-cn-north-1.qiniucs.com";

/// Token-authenticated bucket reached through form uploads.
#[derive(Debug, Clone)]
pub struct ObjectStorageBackend {
    credentials: ObjectStorageCredentials,
    upload_host: String,
}

impl ObjectStorageBackend {
    pub fn new(credentials: ObjectStorageCredentials, upload_host: String) -> Self {
        Self {
            credentials,
            upload_host,
        }
    }

    pub fn credentials(&self) -> &ObjectStorageCredentials {
        &self.credentials
    }

    /// Public download address of `key`. A configured domain wins; a bare
    /// domain gets `https://`.
    pub fn public_url(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        let domain = self
            .credentials
            .domain
            .as_deref()
            .map(str::trim)
            .filter(|domain| !domain.is_empty());
        match domain {
            Some(domain) if domain.starts_with("http") => {
                format!("{}/{}", domain.trim_end_matches('/'), key)
            }
            Some(domain) => format!("https://{}/{}", domain.trim_end_matches('/'), key),
            None => format!(
                "https://{}.{}/{}",
                self.credentials.bucket.trim(),
                DEFAULT_PUBLIC_HOST_SUFFIX,
                key
            ),
        }
    }

    fn endpoint(&self) -> ConnectResult<Url> {
        Url::parse(self.upload_host.trim()).map_err(|err| ConnectError::InvalidEndpoint {
            endpoint: self.upload_host.clone(),
            message: err.to_string(),
        })
    }
}

#[async_trait]
impl TransferBackend for ObjectStorageBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::ObjectStorage
    }

    fn target_for(&self, job_name: &str) -> UploadTarget {
        UploadTarget::key_prefix(job_name)
    }

    async fn connect(&self) -> ConnectResult<Box<dyn BackendSession>> {
        let missing = self.credentials.missing_fields();
        if !missing.is_empty() {
            return Err(ConnectError::InvalidCredentials {
                storage: StorageKind::ObjectStorage,
                missing: missing.join(", "),
            });
        }
        let endpoint = self.endpoint()?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TRANSFER_TIMEOUT)
            .build()
            .map_err(|err| ConnectError::Protocol(err.to_string()))?;
        info!(bucket = %self.credentials.bucket, endpoint = %endpoint, "object storage session ready");
        Ok(Box::new(ObjectStorageSession {
            client,
            endpoint,
            signer: UploadSigner::new(&self.credentials),
        }))
    }
}

/// Mints per-key upload tokens: `access_key:sign:encoded_policy`.
#[derive(Clone)]
pub struct UploadSigner {
    access_key: String,
    secret_key: String,
    bucket: String,
}

impl UploadSigner {
    pub fn new(credentials: &ObjectStorageCredentials) -> Self {
        Self {
            access_key: credentials.access_key.trim().to_string(),
            secret_key: credentials.secret_key.trim().to_string(),
            bucket: credentials.bucket.trim().to_string(),
        }
    }

    pub fn token(&self, key: &str, deadline: i64) -> TransferResult<String> {
        let policy = json!({
            "scope": format!("{}:{}", self.bucket, key),
            "deadline": deadline,
        });
        let encoded_policy = URL_SAFE.encode(policy.to_string());
        let mut mac = HmacSha1::new_from_slice(self.secret_key.as_bytes())
            .map_err(|err| TransferError::permanent(format!("invalid secret key: {err}")))?;
        mac.update(encoded_policy.as_bytes());
        let sign = URL_SAFE.encode(mac.finalize().into_bytes());
        Ok(format!("{}:{}:{}", self.access_key, sign, encoded_policy))
    }
}

pub struct ObjectStorageSession {
    client: Client,
    endpoint: Url,
    signer: UploadSigner,
}

#[derive(Debug, Deserialize)]
struct UploadReply {
    key: Option<String>,
    error: Option<String>,
}

#[async_trait]
impl BackendSession for ObjectStorageSession {
    async fn ensure_destination(&mut self, _target: &UploadTarget) -> ConnectResult<()> {
        Ok(())
    }

    async fn put_file(&mut self, local: &Path, remote_key: &str) -> TransferResult<TransferStats> {
        let unreadable =
            |err: std::io::Error| TransferError::permanent(format!("cannot read {}: {}", local.display(), err));
        let file = tokio::fs::File::open(local).await.map_err(unreadable)?;
        let size = file.metadata().await.map_err(unreadable)?.len();
        let file_name = local
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| remote_key.to_string());
        let deadline = Utc::now().timestamp() + TOKEN_LIFETIME.as_secs() as i64;
        let token = self.signer.token(remote_key, deadline)?;
        let form = Form::new()
            .text("token", token)
            .text("key", remote_key.to_string())
            .part(
                "file",
                Part::stream_with_length(Body::wrap_stream(ReaderStream::new(file)), size)
                    .file_name(file_name),
            );

        let started = Instant::now();
        let response = self
            .client
            .post(self.endpoint.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|err| TransferError::transient(format!("request failed: {err}"), RETRY_BACKOFF))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| TransferError::transient(format!("response unreadable: {err}"), RETRY_BACKOFF))?;
        check_reply(status, &body, remote_key)?;
        Ok(TransferStats {
            bytes: size,
            elapsed: started.elapsed(),
        })
    }

    async fn close(self: Box<Self>) {
        debug!(endpoint = %self.endpoint, "object storage session closed");
    }
}

/// Success only when the service echoes the requested key.
fn check_reply(status: u16, body: &str, expected_key: &str) -> TransferResult<()> {
    let reply: Option<UploadReply> = serde_json::from_str(body).ok();
    let detail = reply
        .as_ref()
        .and_then(|reply| reply.error.clone())
        .unwrap_or_else(|| body.trim().to_string());
    match status {
        200..=299 => match reply.and_then(|reply| reply.key) {
            Some(key) if key == expected_key => Ok(()),
            Some(key) => Err(TransferError::transient(
                format!("service stored {key} instead of {expected_key}"),
                RETRY_BACKOFF,
            )),
            None => Err(TransferError::transient(
                format!("service did not confirm {expected_key}"),
                RETRY_BACKOFF,
            )),
        },
        400..=499 => Err(TransferError::permanent(format!("{status} {detail}"))),
        _ => Err(TransferError::transient(
            format!("{status} {detail}"),
            RETRY_BACKOFF,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use tempfile::tempdir;

    fn credentials(domain: Option<&str>) -> ObjectStorageCredentials {
        ObjectStorageCredentials {
            access_key: "ak".into(),
            secret_key: "sk".into(),
            bucket: "videos".into(),
            domain: domain.map(str::to_string),
        }
    }

    #[test]
    fn token_carries_scope_and_valid_signature() {
        let signer = UploadSigner::new(&credentials(None));
        let token = signer.token("movie/segment_000.ts", 1_700_000_000).unwrap();
        let parts: Vec<_> = token.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ak");

        let policy: serde_json::Value =
            serde_json::from_slice(&URL_SAFE.decode(parts[2]).unwrap()).unwrap();
        assert_eq!(policy["scope"], "videos:movie/segment_000.ts");
        assert_eq!(policy["deadline"], 1_700_000_000);

        let mut mac = HmacSha1::new_from_slice(b"sk").unwrap();
        mac.update(parts[2].as_bytes());
        mac.verify_slice(&URL_SAFE.decode(parts[1]).unwrap()).unwrap();
    }

    #[test]
    fn public_urls() {
        let default = ObjectStorageBackend::new(credentials(None), String::new());
        assert_eq!(
            default.public_url("uploads/a.png"),
            "https://videos.s3-cn-north-1.qiniucs.com/uploads/a.png"
        );
        let bare = ObjectStorageBackend::new(credentials(Some("cdn.example.com")), String::new());
        assert_eq!(bare.public_url("uploads/a.png"), "https://cdn.example.com/uploads/a.png");
        let full = ObjectStorageBackend::new(
            credentials(Some("http://cdn.example.com/")),
            String::new(),
        );
        assert_eq!(full.public_url("/uploads/a.png"), "http://cdn.example.com/uploads/a.png");
    }

    #[test]
    fn replies_are_classified() {
        assert!(check_reply(200, r#"{"key":"m/p.m3u8","hash":"x"}"#, "m/p.m3u8").is_ok());

        let mismatch = check_reply(200, r#"{"key":"other"}"#, "m/p.m3u8").unwrap_err();
        assert!(mismatch.is_transient());
        assert_eq!(mismatch.retry_after(), RETRY_BACKOFF);

        let denied = check_reply(401, r#"{"error":"bad token"}"#, "m/p.m3u8").unwrap_err();
        assert!(!denied.is_transient());
        assert!(denied.message().contains("bad token"));

        let overloaded = check_reply(503, "busy", "m/p.m3u8").unwrap_err();
        assert!(overloaded.is_transient());
    }

    #[tokio::test]
    async fn connect_validates_endpoint() {
        let backend = ObjectStorageBackend::new(credentials(None), "not a url".into());
        let err = match backend.connect().await {
            Ok(_) => panic!("connect should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, ConnectError::InvalidEndpoint { .. }));
    }

    #[tokio::test]
    async fn put_file_posts_token_key_and_file() {
        let mut server = mockito::Server::new_async().await;
        let upload = server
            .mock("POST", "/")
            .match_header(
                "content-type",
                Matcher::Regex("^multipart/form-data; boundary=".into()),
            )
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#"name="token"\r\n\r\nak:[A-Za-z0-9_=-]+:[A-Za-z0-9_=-]+\r\n"#.into()),
                Matcher::Regex(r#"name="key"\r\n\r\nmovie/segment_000\.ts\r\n"#.into()),
                Matcher::Regex(r#"name="file"; filename="segment_000\.ts""#.into()),
                Matcher::Regex("segment bytes".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"key":"movie/segment_000.ts","hash":"Fh8xVqod2MQ1mocfI4S4KpRL6D98"}"#)
            .expect(1)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let local = dir.path().join("segment_000.ts");
        std::fs::write(&local, b"segment bytes").unwrap();

        let backend = ObjectStorageBackend::new(credentials(None), server.url());
        let mut session = backend.connect().await.unwrap();
        let stats = session.put_file(&local, "movie/segment_000.ts").await.unwrap();

        assert_eq!(stats.bytes, 13);
        upload.assert_async().await;
        session.close().await;
    }

    #[tokio::test]
    async fn put_file_classifies_service_replies() {
        let mut server = mockito::Server::new_async().await;
        let wrong_key = server
            .mock("POST", "/")
            .match_body(Matcher::Regex(r#"name="key"\r\n\r\nmovie/a\.ts\r\n"#.into()))
            .with_status(200)
            .with_body(r#"{"key":"movie/other.ts"}"#)
            .create_async()
            .await;
        let denied = server
            .mock("POST", "/")
            .match_body(Matcher::Regex(r#"name="key"\r\n\r\nmovie/b\.ts\r\n"#.into()))
            .with_status(403)
            .with_body(r#"{"error":"token out of scope"}"#)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        for name in ["a.ts", "b.ts"] {
            std::fs::write(dir.path().join(name), b"data").unwrap();
        }

        let backend = ObjectStorageBackend::new(credentials(None), server.url());
        let mut session = backend.connect().await.unwrap();

        let err = session
            .put_file(&dir.path().join("a.ts"), "movie/a.ts")
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(err.message().contains("movie/other.ts"));

        let err = session
            .put_file(&dir.path().join("b.ts"), "movie/b.ts")
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message().contains("403"));

        let err = session
            .put_file(&dir.path().join("missing.ts"), "movie/missing.ts")
            .await
            .unwrap_err();
        assert!(!err.is_transient());

        wrong_key.assert_async().await;
        denied.assert_async().await;
        session.close().await;
    }

    #[tokio::test]
    async fn session_destination_is_a_no_op() {
        let backend = ObjectStorageBackend::new(
            credentials(None),
            crate::config::DEFAULT_UPLOAD_HOST.to_string(),
        );
        let mut session = backend.connect().await.unwrap();
        let target = backend.target_for("movie");
        session.ensure_destination(&target).await.unwrap();
        session.ensure_destination(&target).await.unwrap();
        session.close().await;
    }
}
