//! Bounded pool of remote sessions

use super::{Credentials, RemoteEndpoint, RemoteSession};
use crate::config::RetryConfig;
use crate::error::FetchError;
use crate::retry::with_retry;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

type IdleSessions = Arc<Mutex<Vec<Box<dyn RemoteSession>>>>;

/// Limits concurrent sessions to the endpoint and reuses healthy ones
///
/// Sessions are opened lazily. A [`PooledSession`] goes back to the pool only
/// through [`PooledSession::release`]; dropping it closes the session, which
/// is what callers do after a failed transfer.
pub struct SessionPool {
    endpoint: Arc<dyn RemoteEndpoint>,
    credentials: Credentials,
    permits: Arc<Semaphore>,
    idle: IdleSessions,
    connect_timeout: Duration,
}

impl SessionPool {
    /// Pool of at most `size` concurrent sessions
    pub fn new(
        endpoint: Arc<dyn RemoteEndpoint>,
        credentials: Credentials,
        size: usize,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            credentials,
            permits: Arc::new(Semaphore::new(size.max(1))),
            idle: Arc::new(Mutex::new(Vec::new())),
            connect_timeout,
        }
    }

    /// The endpoint sessions are opened against
    pub fn endpoint(&self) -> &Arc<dyn RemoteEndpoint> {
        &self.endpoint
    }

    /// Sessions currently parked in the pool
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Take a session, waiting for a free slot and connecting if none is idle
    pub async fn get(&self) -> Result<PooledSession, FetchError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Connection("session pool closed".into()))?;

        let parked = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let session = match parked {
            Some(session) => session,
            None => self.connect().await?,
        };

        Ok(PooledSession {
            session,
            idle: Arc::clone(&self.idle),
            _permit: permit,
        })
    }

    /// Like [`get`](Self::get), retrying retryable connection failures
    pub async fn get_with_retry(&self, retry: &RetryConfig) -> Result<PooledSession, FetchError> {
        with_retry(retry, || self.get()).await
    }

    /// Drop every idle session
    pub fn clear(&self) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    async fn connect(&self) -> Result<Box<dyn RemoteSession>, FetchError> {
        let endpoint = self.endpoint.describe();
        match tokio::time::timeout(
            self.connect_timeout,
            self.endpoint.connect(&self.credentials),
        )
        .await
        {
            Ok(Ok(session)) => {
                tracing::debug!(endpoint = %endpoint, "opened remote session");
                Ok(session)
            }
            Ok(Err(e)) => {
                tracing::warn!(endpoint = %endpoint, error = %e, "failed to open remote session");
                Err(e)
            }
            Err(_) => Err(FetchError::Timeout {
                operation: format!("connect to {endpoint}"),
                seconds: self.connect_timeout.as_secs(),
            }),
        }
    }
}

/// A session checked out of a [`SessionPool`]
pub struct PooledSession {
    session: Box<dyn RemoteSession>,
    idle: IdleSessions,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    /// The underlying session
    pub fn session(&mut self) -> &mut dyn RemoteSession {
        self.session.as_mut()
    }

    /// Return a healthy session to the pool
    pub fn release(self) {
        let PooledSession {
            session,
            idle,
            _permit,
        } = self;
        idle.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(session);
    }
}
