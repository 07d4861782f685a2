//! Async utilities to wait for state transitions

use flotilla_supervisor::{ShutdownCause, Supervisor, SupervisorState};
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Error type for wait operations
#[derive(Debug)]
pub enum WaitError {
    Timeout,
    NotStarted,
    /// The supervisor stopped before the awaited condition held
    Stopped(ShutdownCause),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "Wait operation timed out"),
            WaitError::NotStarted => write!(f, "Supervisor not started"),
            WaitError::Stopped(cause) => write!(f, "Supervisor stopped: {}", cause),
        }
    }
}

impl std::error::Error for WaitError {}

/// Poll `condition` every 50ms until it holds
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> Result<(), WaitError>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return Ok(());
        }
        sleep(Duration::from_millis(50)).await;
    }
    if condition() {
        Ok(())
    } else {
        Err(WaitError::Timeout)
    }
}

/// Wait until the supervisor reaches `state` (or any later one)
pub async fn wait_for_state(
    supervisor: &Supervisor,
    state: SupervisorState,
    timeout: Duration,
) -> Result<(), WaitError> {
    let mut rx = supervisor.subscribe_state();
    let reached = rx.wait_for(|s| *s >= state);
    match tokio::time::timeout(timeout, reached).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(WaitError::Stopped(
            supervisor
                .shutdown_handle()
                .cause()
                .unwrap_or(ShutdownCause::Cancelled),
        )),
        Err(_) => Err(WaitError::Timeout),
    }
}
