use std::fs::File;
use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use suppaftp::types::FileType;
use suppaftp::{FtpError, Mode, NativeTlsConnector, NativeTlsFtpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    BackendSession, ConnectError, ConnectResult, TransferBackend, TransferError, TransferResult,
    TransferStats, CONNECT_TIMEOUT, TRANSFER_TIMEOUT,
};
use crate::config::{FtpCredentials, StorageKind};
use crate::job::UploadTarget;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const TIMEOUT_BACKOFF: Duration = Duration::from_secs(5);

type SharedStream = Arc<Mutex<NativeTlsFtpStream>>;

/// FTP/FTPS directory server with password login.
#[derive(Debug, Clone)]
pub struct FtpBackend {
    credentials: FtpCredentials,
    transfer_timeout: Duration,
    keepalive_interval: Duration,
}

impl FtpBackend {
    pub fn new(credentials: FtpCredentials) -> Self {
        Self {
            credentials,
            transfer_timeout: TRANSFER_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
        }
    }

    /// Read/write bound for the control and data sockets.
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn credentials(&self) -> &FtpCredentials {
        &self.credentials
    }

    async fn open(&self) -> ConnectResult<FtpSession> {
        let missing = self.credentials.missing_fields();
        if !missing.is_empty() {
            return Err(ConnectError::InvalidCredentials {
                storage: StorageKind::Ftp,
                missing: missing.join(", "),
            });
        }
        let credentials = self.credentials.clone();
        let transfer_timeout = self.transfer_timeout;
        let address = credentials.address();
        info!(address = %address, tls = credentials.use_tls, "connecting to ftp server");
        let stream = tokio::task::spawn_blocking(move || open_stream(&credentials, transfer_timeout))
            .await
            .map_err(|err| ConnectError::Protocol(err.to_string()))??;

        let stream = Arc::new(Mutex::new(stream));
        let keepalive = KeepAlive::spawn(Arc::clone(&stream), self.keepalive_interval);
        info!(address = %address, "ftp session established");
        Ok(FtpSession {
            address,
            stream,
            keepalive: Some(keepalive),
        })
    }
}

#[async_trait]
impl TransferBackend for FtpBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Ftp
    }

    fn target_for(&self, job_name: &str) -> UploadTarget {
        UploadTarget::directory(&self.credentials.base_dir, job_name)
    }

    async fn connect(&self) -> ConnectResult<Box<dyn BackendSession>> {
        let session = self.open().await?;
        Ok(Box::new(session))
    }
}

fn open_stream(
    credentials: &FtpCredentials,
    transfer_timeout: Duration,
) -> ConnectResult<NativeTlsFtpStream> {
    let address = credentials.address();
    let socket = resolve(&address)?;
    let unreachable = |err: FtpError| ConnectError::Unreachable {
        address: address.clone(),
        message: err.to_string(),
    };
    let mut stream = NativeTlsFtpStream::connect_timeout(socket, CONNECT_TIMEOUT)
        .map_err(unreachable)?
        .passive_stream_builder(move |addr| open_data_stream(addr, transfer_timeout));
    if credentials.use_tls {
        let connector = suppaftp::native_tls::TlsConnector::new()
            .map_err(|err| ConnectError::Tls(err.to_string()))?;
        stream = stream
            .into_secure(NativeTlsConnector::from(connector), credentials.host.trim())
            .map_err(|err| ConnectError::Tls(err.to_string()))?;
    }
    stream
        .login(credentials.username.as_str(), credentials.password.as_str())
        .map_err(|err| ConnectError::Auth(err.to_string()))?;
    stream.set_mode(Mode::Passive);
    stream
        .transfer_type(FileType::Binary)
        .map_err(|err| ConnectError::Protocol(err.to_string()))?;
    let socket = stream.get_ref();
    socket
        .set_read_timeout(Some(transfer_timeout))
        .and_then(|_| socket.set_write_timeout(Some(transfer_timeout)))
        .map_err(|err| ConnectError::Protocol(err.to_string()))?;
    Ok(stream)
}

/// Passive data connection carrying the same bounds as the control socket.
fn open_data_stream(addr: SocketAddr, transfer_timeout: Duration) -> Result<TcpStream, FtpError> {
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(FtpError::ConnectionError)?;
    stream
        .set_read_timeout(Some(transfer_timeout))
        .and_then(|_| stream.set_write_timeout(Some(transfer_timeout)))
        .map_err(FtpError::ConnectionError)?;
    Ok(stream)
}

fn resolve(address: &str) -> ConnectResult<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|err| ConnectError::Unreachable {
            address: address.to_string(),
            message: err.to_string(),
        })?
        .next()
        .ok_or_else(|| ConnectError::Unreachable {
            address: address.to_string(),
            message: "no address resolved".to_string(),
        })
}

/// Periodic `NOOP` on the control connection. Owned by exactly one session
/// and stopped when that session closes.
struct KeepAlive {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl KeepAlive {
    fn spawn(stream: SharedStream, period: Duration) -> Self {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        let stream = Arc::clone(&stream);
                        // A running transfer holds the lock; skip this round.
                        let sent = tokio::task::spawn_blocking(move || {
                            let reply = match stream.try_lock() {
                                Ok(mut ftp) => Some(ftp.noop()),
                                Err(_) => None,
                            };
                            reply
                        })
                        .await;
                        match sent {
                            Ok(Some(Ok(()))) => debug!("ftp keep-alive sent"),
                            Ok(Some(Err(err))) => debug!(error = %err, "ftp keep-alive failed"),
                            Ok(None) => debug!("ftp keep-alive skipped, connection busy"),
                            Err(err) => debug!(error = %err, "ftp keep-alive task failed"),
                        }
                    }
                }
            }
        });
        Self { stop, handle }
    }

    async fn shutdown(self) {
        let _ = self.stop.send(());
        if let Err(err) = self.handle.await {
            warn!(error = %err, "ftp keep-alive task ended abnormally");
        }
    }
}

pub struct FtpSession {
    address: String,
    stream: SharedStream,
    keepalive: Option<KeepAlive>,
}

impl FtpSession {
    async fn with_stream<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<FtpError> + Send + 'static,
        F: FnOnce(&mut NativeTlsFtpStream) -> Result<T, E> + Send + 'static,
    {
        let stream = Arc::clone(&self.stream);
        tokio::task::spawn_blocking(move || {
            let mut guard = stream.lock().unwrap_or_else(PoisonError::into_inner);
            operation(&mut guard)
        })
        .await
        .map_err(|err| E::from(FtpError::ConnectionError(io::Error::new(io::ErrorKind::Other, err))))?
    }
}

#[async_trait]
impl BackendSession for FtpSession {
    async fn ensure_destination(&mut self, target: &UploadTarget) -> ConnectResult<()> {
        let path = normalize(target.as_str());
        let walk = path.clone();
        let cwd = self
            .with_stream(move |ftp| {
                if let Err(err) = ftp.cwd("/") {
                    debug!(error = %err, "cannot enter remote root, walking from login directory");
                }
                let mut current = String::new();
                for part in walk.split('/').filter(|part| !part.is_empty()) {
                    current.push('/');
                    current.push_str(part);
                    if ftp.cwd(current.as_str()).is_ok() {
                        continue;
                    }
                    match ftp.mkdir(current.as_str()) {
                        Ok(()) => {}
                        Err(err) if is_already_exists(&err) => {}
                        Err(err) => return Err(err),
                    }
                    ftp.cwd(current.as_str())?;
                }
                ftp.pwd()
            })
            .await
            .map_err(|err| ConnectError::Destination {
                path: path.clone(),
                message: err.to_string(),
            })?;
        info!(target = %path, cwd = %cwd, "remote directory ready");
        Ok(())
    }

    async fn put_file(&mut self, local: &Path, remote_key: &str) -> TransferResult<TransferStats> {
        let local_path = local.to_path_buf();
        let remote = remote_key.to_string();
        let started = Instant::now();
        let bytes = self
            .with_stream(move |ftp| -> TransferResult<u64> {
                let file = File::open(&local_path).map_err(|err| {
                    TransferError::permanent(format!("cannot open {}: {}", local_path.display(), err))
                })?;
                let mut reader = BufReader::new(file);
                Ok(ftp.put_file(remote.as_str(), &mut reader)?)
            })
            .await?;
        Ok(TransferStats {
            bytes,
            elapsed: started.elapsed(),
        })
    }

    async fn resync_destination(&mut self, target: &UploadTarget) {
        let path = normalize(target.as_str());
        let walk = path.clone();
        let steps = self
            .with_stream(move |ftp| {
                let mut steps = Vec::new();
                let root = ftp.cwd("/").map(|_| "ok".to_string());
                steps.push(("/".to_string(), render_step(root)));
                let mut current = String::new();
                for part in walk.split('/').filter(|part| !part.is_empty()) {
                    current.push('/');
                    current.push_str(part);
                    let outcome = match ftp.cwd(current.as_str()) {
                        Ok(()) => Ok("exists".to_string()),
                        Err(_) => ftp
                            .mkdir(current.as_str())
                            .and_then(|_| ftp.cwd(current.as_str()))
                            .map(|_| "created".to_string()),
                    };
                    steps.push((current.clone(), render_step(outcome)));
                }
                steps.push(("pwd".to_string(), render_step(ftp.pwd())));
                Ok::<_, FtpError>(steps)
            })
            .await;
        match steps {
            Ok(steps) => {
                for (step, outcome) in steps {
                    info!(target = %path, step = %step, outcome = %outcome, "remote directory resync");
                }
            }
            Err(err) => warn!(target = %path, error = %err, "remote directory resync failed"),
        }
    }

    async fn close(self: Box<Self>) {
        let mut session = self;
        if let Some(keepalive) = session.keepalive.take() {
            keepalive.shutdown().await;
        }
        let address = session.address.clone();
        match session.with_stream(|ftp| ftp.quit()).await {
            Ok(()) => debug!(address = %address, "ftp session closed"),
            Err(err) => warn!(address = %address, error = %err, "ftp quit failed"),
        }
    }
}

impl Drop for FtpSession {
    fn drop(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.handle.abort();
        }
    }
}

fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn render_step<T: std::fmt::Display>(result: Result<T, FtpError>) -> String {
    match result {
        Ok(value) => value.to_string(),
        Err(err) => format!("failed: {err}"),
    }
}

fn is_already_exists(err: &FtpError) -> bool {
    match err {
        FtpError::UnexpectedResponse(response) => {
            let body = String::from_utf8_lossy(&response.body).to_ascii_lowercase();
            response.status.code() == 550 || body.contains("exist")
        }
        _ => false,
    }
}

impl From<FtpError> for TransferError {
    fn from(err: FtpError) -> Self {
        classify(err)
    }
}

fn classify(err: FtpError) -> TransferError {
    match err {
        FtpError::ConnectionError(io) => classify_io(&io),
        FtpError::UnexpectedResponse(response) => classify_reply(
            response.status.code(),
            String::from_utf8_lossy(&response.body).trim(),
        ),
        other => TransferError::permanent(other.to_string()),
    }
}

fn classify_io(err: &io::Error) -> TransferError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            TransferError::transient(format!("timed out: {err}"), TIMEOUT_BACKOFF)
        }
        _ => TransferError::transient(format!("connection error: {err}"), Duration::ZERO),
    }
}

fn classify_reply(code: u32, text: &str) -> TransferError {
    match code {
        400..=499 => TransferError::transient(format!("{code} {text}"), Duration::ZERO),
        _ => TransferError::permanent(format!("{code} {text}")),
    }
}
