//! Remote fetcher
//!
//! The orchestrator talks to the counterparty's drop directory through two
//! object-safe traits: a [`RemoteEndpoint`] knows how to open sessions, and a
//! [`RemoteSession`] lists and downloads files. Downloads always go through
//! [`Stager`], which promotes a transfer to its final path only once it is
//! complete and its length matches the listing.
//!
//! Two endpoints are provided:
//! - [`MemoryEndpoint`]: an in-process endpoint with fault injection
//! - `SftpEndpoint` (feature `sftp`): libssh2 over TCP

use crate::config::{RemoteAuth, RemoteConfig};
use crate::error::FetchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

mod memory;
mod pool;
#[cfg(feature = "sftp")]
mod sftp;
mod staging;

pub use memory::{Fault, MemoryEndpoint};
pub use pool::{PooledSession, SessionPool};
#[cfg(feature = "sftp")]
pub use sftp::SftpEndpoint;
pub use staging::{StagedFile, Stager, local_name};

/// A regular file found by listing the remote directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// File name without directory
    pub name: String,
    /// Full remote path (`remote_dir/name`)
    pub path: String,
    /// Size reported by the endpoint
    pub size: u64,
    /// Opaque token that changes when the file is re-uploaded (usually mtime)
    pub modification_token: Option<String>,
}

/// Login material for [`RemoteEndpoint::connect`]
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Login name
    pub username: String,
    /// Password or key file
    pub auth: RemoteAuth,
}

impl Credentials {
    /// Build credentials from the remote section of the configuration
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            username: config.username.clone(),
            auth: config.auth.clone(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let method = match &self.auth {
            RemoteAuth::Password { .. } => "password",
            RemoteAuth::PrivateKey { .. } => "private_key",
        };
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("auth", &method)
            .finish()
    }
}

/// Something that can open sessions to the remote drop directory
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Open and authenticate a new session
    ///
    /// Unreachable hosts return [`FetchError::Connection`]; rejected
    /// credentials return [`FetchError::Auth`].
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn RemoteSession>, FetchError>;

    /// Human-readable endpoint address for logs
    fn describe(&self) -> String;
}

/// An authenticated session
#[async_trait]
pub trait RemoteSession: Send {
    /// List regular files in `remote_dir`
    ///
    /// Directories, `.`/`..` and other hidden entries are never returned. A directory
    /// that does not exist is [`FetchError::RemoteDirMissing`].
    async fn list(&mut self, remote_dir: &str) -> Result<Vec<RemoteEntry>, FetchError>;

    /// Download `remote_path` into the local file `dest`, returning the byte count
    ///
    /// `dest` is created or truncated. Callers never pass a final path here;
    /// see [`Stager`].
    async fn fetch(&mut self, remote_path: &str, dest: &Path) -> Result<u64, FetchError>;
}

/// Join a remote directory and file name with `/`
pub fn join_remote(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() || dir == "." {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Keep only entries worth ingesting
///
/// Hidden names (including `.` and `..`) are dropped; uploaders commonly use
/// them for transfers still in progress.
pub(crate) fn filter_listing(entries: Vec<RemoteEntry>, suffix: Option<&str>) -> Vec<RemoteEntry> {
    entries
        .into_iter()
        .filter(|e| !e.name.is_empty() && !e.name.starts_with('.'))
        .filter(|e| suffix.is_none_or(|s| e.name.ends_with(s)))
        .collect()
}
