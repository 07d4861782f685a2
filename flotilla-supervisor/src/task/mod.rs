//! The task graph: named units of work started together, each waiting on
//! its dependencies' readiness before doing anything observable.
//!
//! A task is one of two shapes:
//! - [`OneShot`] - ready once its `run` returns successfully
//! - [`Service`] - `prepare` returns the children to launch; the task is
//!   ready once they have been handed to the background, any
//!   `ready_probe` address accepts connections, and `started` has
//!   returned. A service child exiting at any later point fails the
//!   whole run.

mod graph;
mod ready;
mod shutdown;

pub use graph::{CONNECT_RETRY, CONNECT_TIMEOUT, TaskGraph, wait_for_connect};
pub use ready::{ReadyRegistry, STILL_WAITING_INTERVAL};
pub use shutdown::ShutdownHandle;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::error;

use crate::config::{Cluster, ClusterType};
use crate::env::Environ;
use crate::errors::{Result, ShutdownCause, SupervisorError};
use crate::logs::LogSink;
use crate::process::{DEFAULT_GRACE, ProgramRunner, RunOptions};

/// Binaries preinstalled by a production install
pub const PRODUCTION_BIN_DIR: &str = "/var/lib/flotilla/bin";

/// Operator switches that change which tasks a plan builds
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    pub no_workbench1: bool,
    pub no_workbench2: bool,
    pub workbench2_source: Option<PathBuf>,
    pub own_temporary_database: bool,
}

/// Everything fixed about a run before the first task starts: the resolved
/// cluster, the directories, and the environment children inherit.
#[derive(Debug, Clone)]
pub struct RunSetup {
    pub cluster: Cluster,
    pub cluster_type: ClusterType,
    pub source_path: PathBuf,
    pub source_version: String,
    pub bin_dir: PathBuf,
    pub temp_dir: PathBuf,
    /// Same as `temp_dir` outside production
    pub www_temp_dir: PathBuf,
    pub config_file: PathBuf,
    pub listen_host: String,
    pub environ: Environ,
    pub log_sink: LogSink,
    pub options: PlanOptions,
    /// SIGTERM-to-SIGKILL delay for every child
    pub grace: Duration,
}

impl RunSetup {
    pub fn new(cluster: Cluster, log_sink: LogSink) -> Self {
        Self {
            cluster,
            cluster_type: ClusterType::default(),
            source_path: PathBuf::from("."),
            source_version: String::new(),
            bin_dir: PathBuf::from(PRODUCTION_BIN_DIR),
            temp_dir: std::env::temp_dir(),
            www_temp_dir: std::env::temp_dir(),
            config_file: PathBuf::new(),
            listen_host: "0.0.0.0".to_string(),
            environ: Environ::default(),
            log_sink,
            options: PlanOptions::default(),
            grace: DEFAULT_GRACE,
        }
    }

    /// Directories searched first on PATH, and stripped from log tags
    pub fn bin_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.bin_dir.clone()];
        if self.bin_dir != Path::new(PRODUCTION_BIN_DIR) {
            dirs.push(PathBuf::from(PRODUCTION_BIN_DIR));
        }
        dirs
    }

    /// A runner over the current environment
    pub fn runner(&self) -> ProgramRunner {
        ProgramRunner::new(&self.source_path, self.environ.clone(), self.log_sink.clone())
            .with_bin_dirs(self.bin_dirs())
            .with_grace(self.grace)
    }
}

/// A child a service task wants kept running
#[derive(Debug, Clone)]
pub struct ServiceLaunch {
    pub dir: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    pub options: RunOptions,
    /// `host:port` that must accept a TCP connection before the task is ready
    pub ready_probe: Option<String>,
}

impl ServiceLaunch {
    pub fn new<I, S>(dir: impl Into<PathBuf>, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dir: dir.into(),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            options: RunOptions::default(),
            ready_probe: None,
        }
    }

    pub fn options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn ready_probe(mut self, addr: impl Into<String>) -> Self {
        self.ready_probe = Some(addr.into());
        self
    }

    fn cmdline(&self) -> String {
        let mut parts = vec![self.program.as_str()];
        parts.extend(self.args.iter().map(String::as_str));
        format!("[{}]", parts.join(" "))
    }
}

#[async_trait]
pub trait OneShot: Send + Sync {
    fn name(&self) -> String;

    fn depends(&self) -> Vec<String> {
        Vec::new()
    }

    async fn run(&self, ctx: &RunContext) -> Result<()>;
}

#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> String;

    fn depends(&self) -> Vec<String> {
        Vec::new()
    }

    /// Do any synchronous preparation and describe the children to launch
    async fn prepare(&self, ctx: &RunContext) -> Result<Vec<ServiceLaunch>>;

    /// Runs after every launch is up and probed, before the task is ready
    async fn started(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub enum Task {
    OneShot(Arc<dyn OneShot>),
    Service(Arc<dyn Service>),
}

impl Task {
    pub fn one_shot(task: impl OneShot + 'static) -> Self {
        Task::OneShot(Arc::new(task))
    }

    pub fn service(task: impl Service + 'static) -> Self {
        Task::Service(Arc::new(task))
    }

    pub fn name(&self) -> String {
        match self {
            Task::OneShot(t) => t.name(),
            Task::Service(t) => t.name(),
        }
    }

    pub fn depends(&self) -> Vec<String> {
        match self {
            Task::OneShot(t) => t.depends(),
            Task::Service(t) => t.depends(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Task::OneShot(_) => "OneShot",
            Task::Service(_) => "Service",
        };
        f.debug_struct(kind)
            .field("name", &self.name())
            .field("depends", &self.depends())
            .finish()
    }
}

/// What a running task sees of the supervisor.
///
/// Cheap to clone; clones share the readiness registry, the shutdown handle
/// and the tracker that `Supervisor` drains on the way out.
#[derive(Debug, Clone)]
pub struct RunContext {
    setup: Arc<RunSetup>,
    runner: ProgramRunner,
    ready: ReadyRegistry,
    shutdown: ShutdownHandle,
    tracker: TaskTracker,
}

impl RunContext {
    pub fn new(
        setup: Arc<RunSetup>,
        ready: ReadyRegistry,
        shutdown: ShutdownHandle,
        tracker: TaskTracker,
    ) -> Self {
        let runner = setup.runner();
        Self {
            setup,
            runner,
            ready,
            shutdown,
            tracker,
        }
    }

    pub fn setup(&self) -> &RunSetup {
        &self.setup
    }

    pub fn cluster(&self) -> &Cluster {
        &self.setup.cluster
    }

    pub fn runner(&self) -> &ProgramRunner {
        &self.runner
    }

    pub fn ready(&self) -> &ReadyRegistry {
        &self.ready
    }

    pub fn shutdown_handle(&self) -> &ShutdownHandle {
        &self.shutdown
    }

    pub fn token(&self) -> &CancellationToken {
        self.shutdown.token()
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Block until every named task is ready
    pub async fn wait<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        self.ready.wait(self.token(), names).await
    }

    /// Run a child to completion under this run's cancellation
    pub async fn run_program<S: AsRef<str>>(
        &self,
        dir: impl AsRef<Path>,
        opts: RunOptions,
        program: &str,
        args: &[S],
    ) -> Result<()> {
        self.runner.run(self.token(), dir, opts, program, args).await
    }

    /// Report that `task` failed and stop the run.
    ///
    /// Ignored once the run is already stopping, and for errors that only
    /// report cancellation.
    pub fn fail(&self, task: &str, err: SupervisorError) {
        if err.is_cancelled() || self.shutdown.is_shutting_down() {
            return;
        }
        error!(task, error = %err, "task failed");
        self.shutdown.shutdown(ShutdownCause::TaskFailed {
            task: task.to_string(),
            message: err.to_string(),
        });
    }

    /// Keep `launch` running in the background for the rest of the run.
    ///
    /// Any exit that was not requested, clean or not, fails `task`.
    pub fn spawn_service(&self, task: &str, launch: ServiceLaunch) {
        let ctx = self.clone();
        let task = task.to_string();
        self.tracker.spawn(async move {
            let command = launch.cmdline();
            let result = ctx
                .run_program(&launch.dir, launch.options, &launch.program, &launch.args)
                .await;
            match result {
                Err(err) if err.is_cancelled() => {}
                Err(err) => ctx.fail(&task, err),
                Ok(()) => ctx.fail(&task, SupervisorError::ChildExited { command }),
            }
        });
    }
}
