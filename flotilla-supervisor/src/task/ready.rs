use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::{Result, SupervisorError};

/// How often `wait` repeats its "still waiting..." line for a slow dependency
pub const STILL_WAITING_INTERVAL: Duration = Duration::from_secs(15);

/// Per-task readiness flags, fixed at construction.
///
/// Each flag only ever goes from `false` to `true`. Once a task has been
/// observed ready it stays ready for the rest of the run.
#[derive(Debug, Clone, Default)]
pub struct ReadyRegistry {
    flags: Arc<HashMap<String, watch::Sender<bool>>>,
}

impl ReadyRegistry {
    /// Register `names`. A repeated name refers to the same flag.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut flags = HashMap::new();
        for name in names {
            flags
                .entry(name.into())
                .or_insert_with(|| watch::channel(false).0);
        }
        Self {
            flags: Arc::new(flags),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.flags.keys().map(String::as_str)
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.flags.get(name).is_some_and(|tx| *tx.borrow())
    }

    /// Mark `name` ready. Idempotent.
    pub fn mark_ready(&self, name: &str) -> Result<()> {
        let tx = self
            .flags
            .get(name)
            .ok_or_else(|| SupervisorError::NoSuchTask(name.to_string()))?;
        tx.send_replace(true);
        Ok(())
    }

    /// Block until every task in `names` is ready, in order.
    ///
    /// An unregistered name fails before anything is awaited. Returns
    /// `Cancelled` if `cancel` fires first.
    pub async fn wait<S: AsRef<str>>(&self, cancel: &CancellationToken, names: &[S]) -> Result<()> {
        let mut receivers = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let tx = self
                .flags
                .get(name)
                .ok_or_else(|| SupervisorError::NoSuchTask(name.to_string()))?;
            receivers.push((name, tx.subscribe()));
        }

        for (name, mut rx) in receivers {
            if *rx.borrow() {
                continue;
            }
            info!(task = name, "waiting");
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + STILL_WAITING_INTERVAL,
                STILL_WAITING_INTERVAL,
            );
            loop {
                tokio::select! {
                    res = rx.wait_for(|ready| *ready) => {
                        if res.is_err() {
                            return Err(SupervisorError::Internal(format!("readiness of {} dropped", name)));
                        }
                        info!(task = name, "ready");
                        break;
                    }
                    _ = cancel.cancelled() => {
                        info!(task = name, "task was never ready");
                        return Err(SupervisorError::Cancelled);
                    }
                    _ = ticker.tick() => {
                        info!(task = name, "still waiting...");
                    }
                }
            }
        }
        Ok(())
    }
}
