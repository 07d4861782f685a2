use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Format a YAML error for user-friendly display, including the field path
fn format_yaml_error(e: &serde_path_to_error::Error<serde_yaml::Error>) -> String {
    let path = e.path().to_string();
    let inner = e.inner();
    let msg = inner.to_string();

    let located = if let Some(loc) = inner.location() {
        format!("Line {}, Column {}: {}", loc.line(), loc.column(), msg)
    } else {
        msg
    };

    if path.is_empty() || path == "." {
        located
    } else {
        format!("{}: {}", path, located)
    }
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse config '{path}':\n  {}", format_yaml_error(.source))]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_path_to_error::Error<serde_yaml::Error>,
    },

    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Failed to assign a free port on {host}: {reason}")]
    PortAssignment { host: String, reason: String },

    #[error("{command}: failed to start: {source}")]
    ChildStart {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command}: error: {status}")]
    ChildFailed { command: String, status: ExitStatus },

    #[error("{command}: exited")]
    ChildExited { command: String },

    #[error("context canceled")]
    Cancelled,

    #[error("no such task: {0}")]
    NoSuchTask(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("Health check error: {0}")]
    Health(String),

    #[error("File watcher error: {0}")]
    Watcher(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SupervisorError {
    /// True if this error only reports that the surrounding context was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SupervisorError::Cancelled)
    }
}

impl From<flotilla_unix::users::LookupError> for SupervisorError {
    fn from(e: flotilla_unix::users::LookupError) -> Self {
        use flotilla_unix::users::LookupError;
        match e {
            LookupError::UserNotFound(u) => SupervisorError::UserNotFound(u),
            LookupError::GroupNotFound(g) => SupervisorError::GroupNotFound(g),
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// The first recorded reason the supervisor shut down.
///
/// Unlike [`SupervisorError`] this is cheap to clone, because every caller of
/// `Supervisor::wait` gets its own copy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    #[error("caught signal {0}")]
    Signal(String),

    #[error("need config reload")]
    NeedReload,

    #[error("task {task} failed: {message}")]
    TaskFailed { task: String, message: String },

    #[error("{0}")]
    Startup(String),

    #[error("context canceled")]
    Cancelled,
}

impl ShutdownCause {
    /// The exact message an orchestrator matches to decide on a restart
    pub const RELOAD_SENTINEL: &'static str = "need config reload";

    pub fn is_reload(&self) -> bool {
        matches!(self, ShutdownCause::NeedReload)
    }
}
