//! SFTP endpoint over libssh2
//!
//! libssh2 is blocking, so every call runs on tokio's blocking pool.

use super::{Credentials, RemoteEndpoint, RemoteEntry, RemoteSession, join_remote};
use crate::config::{RemoteAuth, RemoteConfig};
use crate::error::FetchError;
use async_trait::async_trait;
use ssh2::{CheckResult, ErrorCode, KnownHostFileKind, Session, Sftp};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// libssh2 status codes
const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;
const FX_NO_SUCH_PATH: i32 = 10;
const ERROR_AUTHENTICATION_FAILED: i32 = -18;
const ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;

/// SFTP server endpoint
#[derive(Debug, Clone)]
pub struct SftpEndpoint {
    host: String,
    port: u16,
    connect_timeout: Duration,
    io_timeout: Duration,
    known_hosts: Option<PathBuf>,
}

impl SftpEndpoint {
    /// Endpoint for the configured host
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout,
            io_timeout: config.io_timeout,
            known_hosts: config.known_hosts.clone(),
        }
    }

    fn open(&self, credentials: &Credentials) -> Result<SftpHandle, FetchError> {
        let address = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| FetchError::Connection(format!("resolve {}: {e}", self.host)))?
            .next()
            .ok_or_else(|| FetchError::Connection(format!("no address for {}", self.host)))?;
        let tcp = TcpStream::connect_timeout(&address, self.connect_timeout)
            .map_err(|e| FetchError::Connection(format!("{address}: {e}")))?;

        let mut session = Session::new().map_err(connection)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(self.io_timeout.as_millis()).unwrap_or(u32::MAX));
        session.handshake().map_err(connection)?;

        if let Some(path) = &self.known_hosts {
            self.check_host_key(&session, path)?;
        }

        match &credentials.auth {
            RemoteAuth::Password { password } => {
                session.userauth_password(&credentials.username, password)
            }
            RemoteAuth::PrivateKey { path, passphrase } => session.userauth_pubkey_file(
                &credentials.username,
                None,
                path,
                passphrase.as_deref(),
            ),
        }
        .map_err(|e| match e.code() {
            ErrorCode::Session(ERROR_AUTHENTICATION_FAILED | ERROR_PUBLICKEY_UNVERIFIED) => {
                FetchError::Auth(e.message().to_string())
            }
            _ => connection(e),
        })?;
        if !session.authenticated() {
            return Err(FetchError::Auth(format!(
                "server did not accept credentials for {}",
                credentials.username
            )));
        }

        let sftp = session.sftp().map_err(connection)?;
        Ok(SftpHandle {
            sftp,
            _session: session,
        })
    }

    fn check_host_key(&self, session: &Session, known_hosts: &Path) -> Result<(), FetchError> {
        let mut hosts = session.known_hosts().map_err(connection)?;
        hosts
            .read_file(known_hosts, KnownHostFileKind::OpenSSH)
            .map_err(|e| FetchError::Auth(format!("{}: {e}", known_hosts.display())))?;
        let (key, _) = session
            .host_key()
            .ok_or_else(|| FetchError::Auth("server sent no host key".into()))?;

        match hosts.check_port(&self.host, self.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound => Err(FetchError::Auth(format!(
                "host key for {} not in {}",
                self.host,
                known_hosts.display()
            ))),
            CheckResult::Mismatch => Err(FetchError::Auth(format!(
                "host key for {} does not match known_hosts",
                self.host
            ))),
            CheckResult::Failure => Err(FetchError::Auth("host key check failed".into())),
        }
    }
}

#[async_trait]
impl RemoteEndpoint for SftpEndpoint {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn RemoteSession>, FetchError> {
        let endpoint = self.clone();
        let credentials = credentials.clone();
        let handle = blocking(move || endpoint.open(&credentials)).await?;
        Ok(Box::new(SftpSession {
            handle: Arc::new(handle),
        }))
    }

    fn describe(&self) -> String {
        format!("sftp://{}:{}", self.host, self.port)
    }
}

struct SftpHandle {
    sftp: Sftp,
    // The SFTP channel needs its session alive
    _session: Session,
}

struct SftpSession {
    handle: Arc<SftpHandle>,
}

#[async_trait]
impl RemoteSession for SftpSession {
    async fn list(&mut self, remote_dir: &str) -> Result<Vec<RemoteEntry>, FetchError> {
        let handle = Arc::clone(&self.handle);
        let dir = remote_dir.to_string();
        blocking(move || {
            let listing = handle.sftp.readdir(Path::new(&dir)).map_err(|e| match e.code() {
                ErrorCode::SFTP(FX_NO_SUCH_FILE | FX_NO_SUCH_PATH) => {
                    FetchError::RemoteDirMissing(dir.clone())
                }
                ErrorCode::SFTP(FX_PERMISSION_DENIED) => {
                    FetchError::Auth(format!("permission denied listing {dir}"))
                }
                _ => transient(e),
            })?;

            Ok(listing
                .into_iter()
                .filter(|(_, stat)| !stat.is_dir())
                .filter_map(|(path, stat)| {
                    let name = path.file_name()?.to_str()?.to_string();
                    Some(RemoteEntry {
                        path: join_remote(&dir, &name),
                        name,
                        size: stat.size.unwrap_or(0),
                        modification_token: stat.mtime.map(|t| t.to_string()),
                    })
                })
                .collect())
        })
        .await
    }

    async fn fetch(&mut self, remote_path: &str, dest: &Path) -> Result<u64, FetchError> {
        let handle = Arc::clone(&self.handle);
        let remote_path = remote_path.to_string();
        let dest = dest.to_path_buf();
        blocking(move || {
            let mut remote = handle
                .sftp
                .open(Path::new(&remote_path))
                .map_err(|e| match e.code() {
                    ErrorCode::SFTP(FX_NO_SUCH_FILE | FX_NO_SUCH_PATH) => {
                        FetchError::NotFound(remote_path.clone())
                    }
                    _ => transient(e),
                })?;
            let mut local = std::fs::File::create(&dest)
                .map_err(|e| FetchError::TransientIo(format!("{}: {e}", dest.display())))?;
            std::io::copy(&mut remote, &mut local)
                .map_err(|e| FetchError::TransientIo(format!("{remote_path}: {e}")))
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, FetchError>
where
    F: FnOnce() -> Result<T, FetchError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FetchError::Connection(format!("sftp worker failed: {e}")))?
}

fn connection(e: ssh2::Error) -> FetchError {
    FetchError::Connection(e.to_string())
}

fn transient(e: ssh2::Error) -> FetchError {
    FetchError::TransientIo(e.to_string())
}
