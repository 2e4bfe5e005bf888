//! In-process remote endpoint with fault injection

use super::{Credentials, RemoteEndpoint, RemoteEntry, RemoteSession, join_remote};
use crate::error::FetchError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Failure the [`MemoryEndpoint`] should simulate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Connecting fails as if the host were unreachable
    ConnectionRefused,
    /// Connecting fails as if the credentials were rejected
    AuthRejected,
    /// Every listing reports the directory as missing
    DirectoryMissing,
    /// Transfers of `path` deliver only the first `bytes` bytes
    Truncate {
        /// Remote path
        path: String,
        /// Bytes delivered before the transfer ends
        bytes: usize,
    },
    /// Transfers of `path` break off with an I/O error after writing half the file
    DropTransfer {
        /// Remote path
        path: String,
    },
    /// Transfers of `path` write half the file and then never finish
    Stall {
        /// Remote path
        path: String,
    },
}

impl Fault {
    fn applies_to_transfer(&self, remote_path: &str) -> bool {
        match self {
            Fault::Truncate { path, .. } | Fault::DropTransfer { path } | Fault::Stall { path } => {
                path == remote_path
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    token: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, MemoryFile>,
    // (fault, remaining triggers); `None` never runs out
    faults: Vec<(Fault, Option<u32>)>,
    version: u64,
    connects: usize,
    fetches: HashMap<String, usize>,
}

impl State {
    fn take_fault(&mut self, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let index = self.faults.iter().position(|(f, _)| matches(f))?;
        let fault = self.faults[index].0.clone();
        if let Some(remaining) = &mut self.faults[index].1 {
            *remaining -= 1;
            if *remaining == 0 {
                self.faults.remove(index);
            }
        }
        Some(fault)
    }
}

/// A remote directory tree held in memory
///
/// Cloning shares the tree, so a test can keep a handle for adding files and
/// injecting faults while the orchestrator owns another.
///
/// ```
/// use secure_ingest::remote::{Credentials, Fault, MemoryEndpoint, RemoteEndpoint};
/// # use secure_ingest::config::RemoteAuth;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let endpoint = MemoryEndpoint::new();
/// endpoint.put("inbox/report.csv.pgp", b"ciphertext".to_vec());
///
/// let credentials = Credentials { username: "ingest".into(), auth: RemoteAuth::default() };
/// let mut session = endpoint.connect(&credentials).await?;
/// assert_eq!(session.list("inbox").await?.len(), 1);
///
/// endpoint.inject(Fault::AuthRejected);
/// assert!(endpoint.connect(&credentials).await.is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryEndpoint {
    state: Arc<Mutex<State>>,
    expected: Option<Credentials>,
}

impl MemoryEndpoint {
    /// Empty endpoint whose root directory `.` exists
    pub fn new() -> Self {
        let endpoint = Self::default();
        endpoint.add_dir(".");
        endpoint
    }

    /// Reject connections whose credentials differ from `credentials`
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.expected = Some(credentials);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a directory (and its parents)
    pub fn add_dir(&self, dir: &str) {
        let mut state = self.lock();
        let mut current = normalize_dir(dir);
        loop {
            let parent = parent_dir(&current);
            state.dirs.insert(current.clone());
            match parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
    }

    /// Store a file, creating its directory; each upload gets a new modification token
    pub fn put(&self, path: &str, data: impl Into<Vec<u8>>) {
        let token = {
            let mut state = self.lock();
            state.version += 1;
            format!("v{}", state.version)
        };
        self.put_with_token(path, data, Some(&token));
    }

    /// Store a file with an explicit modification token
    pub fn put_with_token(&self, path: &str, data: impl Into<Vec<u8>>, token: Option<&str>) {
        let (dir, _) = split_path(path);
        self.add_dir(&dir);
        self.lock().files.insert(
            normalize_path(path),
            MemoryFile {
                data: data.into(),
                token: token.map(str::to_string),
            },
        );
    }

    /// Delete a file
    pub fn remove(&self, path: &str) {
        self.lock().files.remove(&normalize_path(path));
    }

    /// Simulate `fault` until [`clear_faults`](Self::clear_faults)
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push((fault, None));
    }

    /// Simulate `fault` for the next `times` matching operations
    pub fn inject_times(&self, fault: Fault, times: u32) {
        if times > 0 {
            self.lock().faults.push((fault, Some(times)));
        }
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Successful and failed connection attempts so far
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// Transfer attempts of `path` so far
    pub fn fetch_count(&self, path: &str) -> usize {
        self.lock()
            .fetches
            .get(&normalize_path(path))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl RemoteEndpoint for MemoryEndpoint {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn RemoteSession>, FetchError> {
        let mut state = self.lock();
        state.connects += 1;

        match state.take_fault(|f| matches!(f, Fault::ConnectionRefused | Fault::AuthRejected)) {
            Some(Fault::ConnectionRefused) => {
                return Err(FetchError::Connection("connection refused".into()));
            }
            Some(_) => {
                return Err(FetchError::Auth(format!(
                    "credentials for {} rejected",
                    credentials.username
                )));
            }
            None => {}
        }
        if let Some(expected) = &self.expected
            && expected != credentials
        {
            return Err(FetchError::Auth(format!(
                "credentials for {} rejected",
                credentials.username
            )));
        }

        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemorySession {
    state: Arc<Mutex<State>>,
}

impl MemorySession {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RemoteSession for MemorySession {
    async fn list(&mut self, remote_dir: &str) -> Result<Vec<RemoteEntry>, FetchError> {
        let mut state = self.lock();
        let dir = normalize_dir(remote_dir);

        if state
            .take_fault(|f| matches!(f, Fault::DirectoryMissing))
            .is_some()
            || !state.dirs.contains(&dir)
        {
            return Err(FetchError::RemoteDirMissing(remote_dir.to_string()));
        }

        let entries = state
            .files
            .iter()
            .filter_map(|(path, file)| {
                let (parent, name) = split_path(path);
                (parent == dir).then(|| RemoteEntry {
                    name: name.to_string(),
                    path: join_remote(remote_dir, name),
                    size: file.data.len() as u64,
                    modification_token: file.token.clone(),
                })
            })
            .collect();
        Ok(entries)
    }

    async fn fetch(&mut self, remote_path: &str, dest: &Path) -> Result<u64, FetchError> {
        let (data, fault) = {
            let mut state = self.lock();
            let key = normalize_path(remote_path);
            *state.fetches.entry(key.clone()).or_default() += 1;
            let data = match state.files.get(&key) {
                Some(file) => file.data.clone(),
                None => return Err(FetchError::NotFound(remote_path.to_string())),
            };
            (data, state.take_fault(|f| f.applies_to_transfer(remote_path)))
        };

        let write = |bytes: &[u8]| {
            let bytes = bytes.to_vec();
            async move {
                tokio::fs::write(dest, &bytes)
                    .await
                    .map_err(|e| FetchError::TransientIo(e.to_string()))?;
                Ok::<u64, FetchError>(bytes.len() as u64)
            }
        };

        match fault {
            Some(Fault::Truncate { bytes, .. }) => write(&data[..bytes.min(data.len())]).await,
            Some(Fault::DropTransfer { .. }) => {
                write(&data[..data.len() / 2]).await?;
                Err(FetchError::TransientIo(format!(
                    "transfer of {remote_path} interrupted"
                )))
            }
            Some(Fault::Stall { .. }) => {
                write(&data[..data.len() / 2]).await?;
                std::future::pending::<()>().await;
                Err(FetchError::TransientIo(format!("transfer of {remote_path} stalled")))
            }
            _ => write(&data).await,
        }
    }
}

fn normalize_dir(dir: &str) -> String {
    let trimmed = dir.trim_start_matches("./").trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        ".".to_string()
    } else {
        trimmed.to_string()
    }
}

fn normalize_path(path: &str) -> String {
    let (dir, name) = split_path(path);
    join_remote(&dir, name)
}

fn split_path(path: &str) -> (String, &str) {
    let path = path.trim_start_matches("./");
    match path.rsplit_once('/') {
        Some((dir, name)) => (normalize_dir(dir), name),
        None => (".".to_string(), path),
    }
}

fn parent_dir(dir: &str) -> Option<String> {
    if dir == "." {
        return None;
    }
    Some(match dir.rsplit_once('/') {
        Some((parent, _)) => normalize_dir(parent),
        None => ".".to_string(),
    })
}
