//! Cluster-wide mutual exclusion on top of PostgreSQL session-level
//! advisory locks.
//!
//! Holding the lock means holding the database session that took it. If
//! that session dies, PostgreSQL releases the lock on its own, so a holder
//! that wants to keep going must [`DbLocker::check`] before each unit of
//! protected work.

use std::time::Duration;

use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Result, SupervisorError};

/// Key serializing schema migrations across every supervisor of a cluster
pub const MIGRATIONS_LOCK_KEY: i64 = 10001;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct LockState {
    conn: Option<PgConnection>,
    options: Option<PgConnectOptions>,
}

/// An advisory lock identified by a small integer key.
///
/// One `DbLocker` holds at most one session. A second caller of
/// [`DbLocker::lock`] in the same process keeps retrying until the first
/// one unlocks.
#[derive(Debug)]
pub struct DbLocker {
    key: i64,
    retry_delay: Duration,
    state: Mutex<LockState>,
}

impl DbLocker {
    pub fn new(key: i64) -> Self {
        Self {
            key,
            retry_delay: DEFAULT_RETRY_DELAY,
            state: Mutex::new(LockState::default()),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub async fn is_held(&self) -> bool {
        self.state.lock().await.conn.is_some()
    }

    /// Block until the lock is held on a fresh session, or `cancel` fires.
    ///
    /// Contention and connection errors are retried every `retry_delay`.
    pub async fn lock(&self, cancel: &CancellationToken, options: &PgConnectOptions) -> Result<()> {
        let mut first = true;
        loop {
            if !first {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SupervisorError::Cancelled),
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
            first = false;

            let mut state = tokio::select! {
                _ = cancel.cancelled() => return Err(SupervisorError::Cancelled),
                state = self.state.lock() => state,
            };
            if state.conn.is_some() {
                debug!(key = self.key, "lock is held by this process; waiting");
                continue;
            }

            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Err(SupervisorError::Cancelled),
                attempt = try_lock(options, self.key) => attempt,
            };
            match attempt {
                Ok(Some(conn)) => {
                    state.conn = Some(conn);
                    state.options = Some(options.clone());
                    info!(key = self.key, "acquired advisory lock");
                    return Ok(());
                }
                Ok(None) => {
                    debug!(key = self.key, "lock is held by another session; waiting");
                }
                Err(err) => {
                    warn!(key = self.key, error = %err, "error acquiring advisory lock; will retry");
                }
            }
        }
    }

    /// Confirm the session holding the lock is still alive.
    ///
    /// If it is not, the dead session is discarded and the lock is taken
    /// again, so on success the lock is held, possibly on a new session.
    /// Fails if the lock was never taken.
    pub async fn check(&self, cancel: &CancellationToken) -> Result<()> {
        let options = {
            let mut state = self.state.lock().await;
            let Some(conn) = state.conn.as_mut() else {
                return Err(SupervisorError::Internal(format!(
                    "advisory lock {} is not held",
                    self.key
                )));
            };
            match conn.ping().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(key = self.key, error = %err, "advisory lock session lost; reacquiring")
                }
            }
            if let Some(conn) = state.conn.take() {
                let _ = conn.close().await;
            }
            state
                .options
                .clone()
                .ok_or_else(|| SupervisorError::Internal("advisory lock has no database".to_string()))?
        };
        self.lock(cancel, &options).await
    }

    /// Release the lock and close its session. Does nothing if not held.
    pub async fn unlock(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(mut conn) = state.conn.take() else {
            return Ok(());
        };
        let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut conn)
            .await;
        let _ = conn.close().await;
        if !released? {
            warn!(key = self.key, "advisory lock was not held by its session");
        }
        info!(key = self.key, "released advisory lock");
        Ok(())
    }
}

/// Open a session and try the lock once. `Ok(None)` means someone else has it.
async fn try_lock(options: &PgConnectOptions, key: i64) -> Result<Option<PgConnection>> {
    let mut conn = PgConnection::connect_with(options).await?;
    let locked = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
        .bind(key)
        .fetch_one(&mut conn)
        .await;
    match locked {
        Ok(true) => Ok(Some(conn)),
        Ok(false) => {
            let _ = conn.close().await;
            Ok(None)
        }
        Err(err) => {
            let _ = conn.close().await;
            Err(err.into())
        }
    }
}
