use std::time::Duration;
use thiserror::Error;

use flotilla_supervisor::ShutdownCause;
use flotilla_supervisor::config::format_duration;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("timed out after {} waiting for the cluster to be ready", format_duration(.0))]
    ReadyTimeout(Duration),

    #[error("cluster startup failed: {0}")]
    StartupFailed(ShutdownCause),

    #[error(transparent)]
    Shutdown(#[from] ShutdownCause),
}
