//! The top-level state machine of a run.
//!
//! [`Supervisor::start`] loads the config, fills it in, starts every task of
//! the plan and then waits for a shutdown cause: a signal, a config change,
//! a failed task or an explicit [`Supervisor::stop`]. A config with more
//! than one cluster is run as a federation of child supervisors, one per
//! cluster.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flotilla_unix::process::{UnixSignal, signal_name};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, info, info_span, warn};

use crate::config::{
    AutofillOptions, Cluster, ClusterType, ConfigDocument, ConfigSource, ServiceUrl, autofill,
};
use crate::env::{CONFIG_ENV, Environ, RESERVED_PREFIX};
use crate::errors::{Result, ShutdownCause, SupervisorError};
use crate::health::{self, HealthAggregator, HealthReport};
use crate::logs::LogSink;
use crate::plan::{PlatformPlan, TaskPlan};
use crate::process::DEFAULT_GRACE;
use crate::task::{PRODUCTION_BIN_DIR, PlanOptions, RunSetup, ShutdownHandle, TaskGraph};
use crate::watcher::ConfigWatcher;

/// Fixed working directories of a production install
pub const PRODUCTION_TEMP_DIR: &str = "/var/lib/flotilla/tmp";
pub const PRODUCTION_WWW_TEMP_DIR: &str = "/var/lib/flotilla/wwwtmp";

/// Name of the resolved config handed to children
pub const CONFIG_FILE_NAME: &str = "config.yml";

const TEMP_DIR_PREFIX: &str = "flotilla-boot-";

/// Where a run is in its life. Transitions only go forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SupervisorState {
    Starting,
    Running,
    Stopping,
    Done,
}

/// How to run a cluster (or a federation of them)
#[derive(Clone)]
pub struct SupervisorOptions {
    pub config: ConfigSource,
    pub cluster_type: ClusterType,
    /// Source tree; `None` means `.`, or the enclosing git checkout in test mode
    pub source_path: Option<PathBuf>,
    /// Empty means the controller's ExternalURL host, else `0.0.0.0`
    pub listen_host: String,
    pub controller_address: String,
    pub plan_options: PlanOptions,
    pub requested_version: String,
    /// Destination for child output
    pub log_sink: LogSink,
    /// Task set to run; the full platform when unset
    pub plan: Option<Arc<dyn TaskPlan>>,
    pub grace: Duration,
    pub health_interval: Duration,
    /// Install SIGINT/SIGTERM/SIGHUP handlers for this run
    pub handle_signals: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            config: ConfigSource::Stdin,
            cluster_type: ClusterType::default(),
            source_path: None,
            listen_host: String::new(),
            controller_address: String::new(),
            plan_options: PlanOptions::default(),
            requested_version: String::new(),
            log_sink: LogSink::stderr(),
            plan: None,
            grace: DEFAULT_GRACE,
            health_interval: health::DEFAULT_INTERVAL,
            handle_signals: true,
        }
    }
}

impl SupervisorOptions {
    pub fn new(config: ConfigSource) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Run from literal YAML text instead of a file
    pub fn config_yaml(yaml: impl Into<String>) -> Self {
        Self::new(ConfigSource::Literal(yaml.into()))
    }

    pub fn plan(mut self, plan: impl TaskPlan + 'static) -> Self {
        self.plan = Some(Arc::new(plan));
        self
    }

    fn task_plan(&self) -> Arc<dyn TaskPlan> {
        match &self.plan {
            Some(plan) => plan.clone(),
            None => Arc::new(PlatformPlan {
                requested_version: self.requested_version.clone(),
            }),
        }
    }
}

/// What `wait_ready` needs once every task is ready
#[derive(Debug, Clone)]
struct Started {
    controller: Option<ServiceUrl>,
    reports: watch::Receiver<HealthReport>,
}

struct Shared {
    shutdown: ShutdownHandle,
    state: watch::Sender<SupervisorState>,
    started: watch::Sender<Option<Started>>,
    done: watch::Sender<Option<std::result::Result<(), ShutdownCause>>>,
    children: Mutex<BTreeMap<String, Supervisor>>,
    cluster: Mutex<Option<Cluster>>,
}

/// Handle on a running supervisor. Clones refer to the same run.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Start a run in the background. Cancelling `parent` stops it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(opts: SupervisorOptions, parent: &CancellationToken) -> Self {
        let shutdown = ShutdownHandle::child_of(parent);
        let supervisor = Self {
            shared: Arc::new(Shared {
                shutdown: shutdown.clone(),
                state: watch::Sender::new(SupervisorState::Starting),
                started: watch::Sender::new(None),
                done: watch::Sender::new(None),
                children: Mutex::new(BTreeMap::new()),
                cluster: Mutex::new(None),
            }),
        };

        if opts.handle_signals {
            match SignalListener::install() {
                Ok(listener) => {
                    tokio::spawn(listener.run(shutdown));
                }
                Err(err) => warn!(error = %err, "failed to install signal handlers"),
            }
        }

        let this = supervisor.clone();
        tokio::spawn(async move { this.supervise(opts).await });
        supervisor
    }

    pub fn state(&self) -> SupervisorState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.shared.state.subscribe()
    }

    /// The run's shutdown handle; recording a cause through it stops the run
    pub fn shutdown_handle(&self) -> &ShutdownHandle {
        &self.shared.shutdown
    }

    /// The resolved config of a single-cluster run, once autofill is done
    pub fn cluster(&self) -> Option<Cluster> {
        self.shared.cluster.lock().clone()
    }

    /// Child supervisors of a federated run, by cluster id
    pub fn children(&self) -> BTreeMap<String, Supervisor> {
        self.shared.children.lock().clone()
    }

    /// Block until every child process and background task has exited.
    ///
    /// Always an error: the first recorded shutdown cause.
    pub async fn wait(&self) -> std::result::Result<(), ShutdownCause> {
        let mut rx = self.shared.done.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(done) => done.clone().unwrap_or(Err(ShutdownCause::Cancelled)),
            Err(_) => Err(ShutdownCause::Cancelled),
        }
    }

    /// Shut everything down and wait for it. A run stopped this way (and
    /// not already stopping for another reason) returns `Ok`.
    pub async fn stop(&self) -> std::result::Result<(), ShutdownCause> {
        self.shared.shutdown.shutdown(ShutdownCause::Cancelled);
        match self.wait().await {
            Err(ShutdownCause::Cancelled) => Ok(()),
            other => other,
        }
    }

    /// Wait until the cluster is ready to handle requests and return the
    /// controller's external URL. `None` means startup failed or the run
    /// was stopped first.
    pub async fn wait_ready(&self) -> Option<ServiceUrl> {
        let token = self.shared.shutdown.token().clone();
        let mut state = self.subscribe_state();
        tokio::select! {
            _ = token.cancelled() => return None,
            running = state.wait_for(|s| *s >= SupervisorState::Running) => {
                running.ok()?;
            }
        }

        if !self.shared.children.lock().is_empty() {
            return self.wait_children_ready().await;
        }
        let started = self.shared.started.borrow().clone()?;
        if health::wait_healthy(started.reports, &token).await {
            started.controller
        } else {
            None
        }
    }

    async fn wait_children_ready(&self) -> Option<ServiceUrl> {
        let children = self.children();
        let mut first = None;
        for (id, child) in &children {
            info!(cluster = %id, "waiting for cluster to be ready");
            match Box::pin(child.wait_ready()).await {
                Some(url) => {
                    info!(cluster = %id, "cluster is ready");
                    first.get_or_insert(url);
                }
                None => {
                    info!(cluster = %id, "cluster startup failed");
                    return None;
                }
            }
        }
        info!("all clusters are ready");
        first
    }

    fn set_state(&self, state: SupervisorState) {
        self.shared.state.send_if_modified(|current| {
            if *current < state {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    /// Record `err` as the shutdown cause unless it only reports
    /// cancellation, then make sure the run is cancelled
    fn abort(&self, err: &SupervisorError) {
        let cause = if err.is_cancelled() {
            ShutdownCause::Cancelled
        } else {
            ShutdownCause::Startup(err.to_string())
        };
        self.shared.shutdown.shutdown(cause);
    }

    async fn supervise(self, opts: SupervisorOptions) {
        if let Err(err) = self.run(&opts).await {
            self.abort(&err);
        }
        self.shared.shutdown.shutdown(ShutdownCause::Cancelled);
        let cause = self
            .shared
            .shutdown
            .cause()
            .unwrap_or(ShutdownCause::Cancelled);
        info!(cause = %cause, "supervisor shut down");
        self.set_state(SupervisorState::Done);
        self.shared.done.send_replace(Some(Err(cause)));
    }

    async fn run(&self, opts: &SupervisorOptions) -> Result<()> {
        let source = opts.config.clone();
        let doc = tokio::task::spawn_blocking(move || ConfigDocument::load(&source))
            .await
            .map_err(|e| SupervisorError::Internal(format!("config loader panicked: {}", e)))??;

        if let Some(path) = opts.config.path()
            && doc.auto_reload_config
            && path.is_file()
        {
            self.watch_config(path, doc.clone());
        }

        if doc.clusters.len() > 1 {
            return self.run_federation(opts, &doc).await;
        }
        let cluster = doc
            .single_cluster()
            .cloned()
            .ok_or_else(|| SupervisorError::Config("no cluster to run".to_string()))?;
        let span = info_span!("cluster", id = %cluster.cluster_id);
        self.run_cluster(opts, cluster).instrument(span).await
    }

    fn watch_config(&self, path: &Path, doc: ConfigDocument) {
        let shutdown = self.shared.shutdown.clone();
        let watcher = ConfigWatcher::new(path, doc).and_then(|w| {
            w.spawn(shutdown.token().clone(), move |_| {
                shutdown.shutdown(ShutdownCause::NeedReload);
            })
        });
        if let Err(err) = watcher {
            warn!(path = %path.display(), error = %err, "not watching config file");
        }
    }

    /// One child supervisor per cluster, each given a single-cluster
    /// literal config. The first child to stop takes the rest down with it.
    async fn run_federation(&self, opts: &SupervisorOptions, doc: &ConfigDocument) -> Result<()> {
        let token = self.shared.shutdown.token().clone();
        let mut children = BTreeMap::new();
        for id in doc.clusters.keys() {
            let single = doc
                .for_cluster(id)
                .ok_or_else(|| SupervisorError::Internal(format!("cluster {} vanished", id)))?;
            let mut child_opts = opts.clone();
            child_opts.config = ConfigSource::Literal(single.to_yaml()?);
            child_opts.handle_signals = false;
            if opts.cluster_type == ClusterType::Test {
                child_opts.log_sink = LogSink::new(opts.log_sink.prefixed(format!("[{}] ", id)));
            }
            info!(cluster = %id, "starting cluster supervisor");
            children.insert(id.clone(), Supervisor::start(child_opts, &token));
        }
        *self.shared.children.lock() = children.clone();
        self.set_state(SupervisorState::Running);

        let mut waits: FuturesUnordered<_> = children
            .iter()
            .map(|(id, child)| async move { (id.clone(), child.wait().await) })
            .collect();
        while let Some((id, result)) = waits.next().await {
            self.set_state(SupervisorState::Stopping);
            if let Err(cause) = result {
                if !cause.is_reload() && cause != ShutdownCause::Cancelled {
                    warn!(cluster = %id, cause = %cause, "cluster stopped");
                }
                self.shared.shutdown.shutdown(cause);
            }
        }
        Ok(())
    }

    async fn run_cluster(&self, opts: &SupervisorOptions, mut cluster: Cluster) -> Result<()> {
        let cancel = self.shared.shutdown.token().clone();
        let source_path = resolve_source_path(opts, &cancel).await?;
        let listen_host = default_listen_host(&opts.listen_host, &cluster);
        let dirs = RunDirs::create(opts.cluster_type)?;

        autofill(
            &mut cluster,
            &AutofillOptions {
                cluster_type: opts.cluster_type,
                listen_host: listen_host.clone(),
                controller_address: opts.controller_address.clone(),
                own_temporary_database: opts.plan_options.own_temporary_database,
                no_workbench1: opts.plan_options.no_workbench1,
                no_workbench2: opts.plan_options.no_workbench2,
                source_path: source_path.clone(),
                temp_dir: dirs.temp_dir.clone(),
            },
        )?;
        let config_file = write_config(&dirs.www_temp_dir, &cluster)?;
        *self.shared.cluster.lock() = Some(cluster.clone());

        let mut setup = RunSetup::new(cluster, opts.log_sink.clone());
        setup.cluster_type = opts.cluster_type;
        setup.source_path = source_path;
        setup.bin_dir = dirs.bin_dir.clone();
        setup.temp_dir = dirs.temp_dir.clone();
        setup.www_temp_dir = dirs.www_temp_dir.clone();
        setup.environ = child_environ(Environ::inherit(), &config_file, opts.cluster_type, &dirs);
        setup.config_file = config_file;
        setup.listen_host = listen_host;
        setup.options = opts.plan_options.clone();
        setup.grace = opts.grace;

        let plan = opts.task_plan();
        plan.prepare(&mut setup, &cancel).await?;
        let graph = TaskGraph::new(plan.tasks(&setup))?;
        let targets = plan.health_targets(&setup.cluster);
        let controller = setup.cluster.controller_url().cloned();
        let token = setup.cluster.management_token.clone();
        let insecure = setup.cluster.tls.insecure;

        let tracker = TaskTracker::new();
        let started = graph
            .start(Arc::new(setup), self.shared.shutdown.clone(), tracker.clone())
            .await;
        let result = match started {
            Ok(_ctx) => {
                info!("all startup tasks are complete; starting health checks");
                match HealthAggregator::with_targets(targets, &token, insecure) {
                    Ok(aggregator) => {
                        let monitor = aggregator
                            .with_interval(opts.health_interval)
                            .spawn(cancel.clone());
                        self.shared.started.send_replace(Some(Started {
                            controller,
                            reports: monitor.subscribe(),
                        }));
                        self.set_state(SupervisorState::Running);
                        cancel.cancelled().await;
                        drop(monitor);
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            self.abort(err);
        }

        self.set_state(SupervisorState::Stopping);
        info!("shutting down");
        tracker.close();
        tracker.wait().await;
        drop(dirs);
        result
    }
}

/// SIGINT/SIGTERM stop the run; SIGHUP stops it asking for a reload
struct SignalListener {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
}

impl SignalListener {
    /// Registered synchronously so no signal sent after `start` returns is
    /// missed
    fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    async fn run(mut self, shutdown: ShutdownHandle) {
        let token = shutdown.token().clone();
        loop {
            let caught = tokio::select! {
                _ = token.cancelled() => break,
                Some(()) = self.interrupt.recv() => UnixSignal::SIGINT,
                Some(()) = self.terminate.recv() => UnixSignal::SIGTERM,
                Some(()) = self.hangup.recv() => UnixSignal::SIGHUP,
                else => break,
            };
            let name = signal_name(caught);
            info!(signal = name, "caught signal");
            shutdown.shutdown(match caught {
                UnixSignal::SIGHUP => ShutdownCause::NeedReload,
                _ => ShutdownCause::Signal(name.to_string()),
            });
        }
    }
}

/// bin, temp and www-temp directories of one run
#[derive(Debug)]
struct RunDirs {
    bin_dir: PathBuf,
    temp_dir: PathBuf,
    www_temp_dir: PathBuf,
    production: bool,
    /// Removes the ephemeral root when the run ends
    _guard: Option<tempfile::TempDir>,
}

impl RunDirs {
    fn create(cluster_type: ClusterType) -> Result<Self> {
        if cluster_type.is_production() {
            // Created by the installer
            return Ok(Self {
                bin_dir: PathBuf::from(PRODUCTION_BIN_DIR),
                temp_dir: PathBuf::from(PRODUCTION_TEMP_DIR),
                www_temp_dir: PathBuf::from(PRODUCTION_WWW_TEMP_DIR),
                production: true,
                _guard: None,
            });
        }
        let guard = tempfile::Builder::new().prefix(TEMP_DIR_PREFIX).tempdir()?;
        let temp_dir = guard.path().to_path_buf();
        let bin_dir = temp_dir.join("bin");
        std::fs::create_dir(&bin_dir)?;
        Ok(Self {
            bin_dir,
            www_temp_dir: temp_dir.clone(),
            temp_dir,
            production: false,
            _guard: Some(guard),
        })
    }
}

/// Source tree the run builds from, absolute and free of symlinks
async fn resolve_source_path(opts: &SupervisorOptions, cancel: &CancellationToken) -> Result<PathBuf> {
    let path = match &opts.source_path {
        Some(path) => path.clone(),
        None if opts.cluster_type == ClusterType::Test => git_toplevel(cancel).await?,
        None => PathBuf::from("."),
    };
    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()?.join(path)
    };
    path.canonicalize().map_err(|e| {
        SupervisorError::Config(format!("source path {}: {}", path.display(), e))
    })
}

async fn git_toplevel(cancel: &CancellationToken) -> Result<PathBuf> {
    let mut cmd = tokio::process::Command::new("git");
    cmd.args(["rev-parse", "--show-toplevel"]).kill_on_drop(true);
    let output = tokio::select! {
        _ = cancel.cancelled() => return Err(SupervisorError::Cancelled),
        output = cmd.output() => output?,
    };
    if !output.status.success() {
        return Err(SupervisorError::Config(format!(
            "git rev-parse: {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(PathBuf::from(
        String::from_utf8_lossy(&output.stdout).trim_end_matches('\n'),
    ))
}

/// `requested` if set, else the controller's ExternalURL host, else all
/// addresses
pub fn default_listen_host(requested: &str, cluster: &Cluster) -> String {
    if !requested.is_empty() {
        return requested.to_string();
    }
    match cluster.controller_url().map(ServiceUrl::hostname) {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => "0.0.0.0".to_string(),
    }
}

/// Write the single-cluster document children read through [`CONFIG_ENV`]
fn write_config(dir: &Path, cluster: &Cluster) -> Result<PathBuf> {
    let doc = ConfigDocument {
        clusters: BTreeMap::from([(cluster.cluster_id.clone(), cluster.clone())]),
        ..Default::default()
    };
    let path = dir.join(CONFIG_FILE_NAME);
    std::fs::write(&path, doc.to_yaml()?)?;
    Ok(path)
}

/// The environment every child starts from: the supervisor's own, minus
/// anything a parent run set, plus where to find config and binaries.
fn child_environ(
    mut environ: Environ,
    config_file: &Path,
    cluster_type: ClusterType,
    dirs: &RunDirs,
) -> Environ {
    environ.clean(&[RESERVED_PREFIX]);
    environ.set(CONFIG_ENV, &config_file.display().to_string());
    environ.set("RAILS_ENV", cluster_type.as_str());
    environ.set("TMPDIR", &dirs.temp_dir.display().to_string());
    environ.prepend("PATH", &format!("{}:", PRODUCTION_BIN_DIR));
    if !dirs.production {
        environ.prepend("PATH", &format!("{}:", dirs.bin_dir.display()));
    }
    environ
}

#[cfg(test)]
mod tests;
