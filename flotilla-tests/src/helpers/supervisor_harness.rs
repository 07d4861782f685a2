//! Test harness that runs a supervisor in-process against a small plan

use crate::helpers::config_builder::TestConfigBuilder;
use crate::helpers::marker_files::MarkerFileHelper;
use crate::helpers::wait_utils::WaitError;
use flotilla_supervisor::config::{ClusterType, ConfigSource, ServiceUrl};
use flotilla_supervisor::logs::{LogSink, SharedBuffer};
use flotilla_supervisor::plan::TaskPlan;
use flotilla_supervisor::{ShutdownCause, Supervisor, SupervisorOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Owns the directories a test run needs and the supervisor running in them.
///
/// `work_dir` holds the config file and marker files; `source_dir` stands in
/// for the source tree. Both are removed when the harness is dropped.
pub struct TestSupervisor {
    work_dir: TempDir,
    source_dir: TempDir,
    logs: SharedBuffer,
    log_sink: LogSink,
    cancel: CancellationToken,
    supervisor: Option<Supervisor>,
}

impl TestSupervisor {
    pub fn new() -> std::io::Result<Self> {
        let (log_sink, logs) = LogSink::capture();
        Ok(Self {
            work_dir: tempfile::tempdir()?,
            source_dir: tempfile::tempdir()?,
            logs,
            log_sink,
            cancel: CancellationToken::new(),
            supervisor: None,
        })
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    pub fn source_dir(&self) -> &Path {
        self.source_dir.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.work_dir.path().join("config.yml")
    }

    pub fn markers(&self) -> MarkerFileHelper {
        MarkerFileHelper::new(self.work_dir.path())
    }

    /// Everything children wrote, with their log prefixes
    pub fn logs(&self) -> String {
        self.logs.contents()
    }

    /// Test-mode options: loopback listen host, ephemeral controller port,
    /// captured child output, fast health polling and no signal handling
    pub fn options(&self, config: ConfigSource, plan: impl TaskPlan + 'static) -> SupervisorOptions {
        let mut opts = SupervisorOptions::new(config).plan(plan);
        opts.cluster_type = ClusterType::Test;
        opts.source_path = Some(self.source_dir.path().to_path_buf());
        opts.listen_host = "127.0.0.1".to_string();
        opts.controller_address = ":0".to_string();
        opts.log_sink = self.log_sink.clone();
        opts.health_interval = Duration::from_millis(100);
        opts.handle_signals = false;
        opts
    }

    /// Write `config` to the work dir and start a supervisor on it
    pub fn start(
        &mut self,
        config: &TestConfigBuilder,
        plan: impl TaskPlan + 'static,
    ) -> std::io::Result<&Supervisor> {
        let path = config.write_to_file(self.work_dir.path())?;
        let opts = self.options(ConfigSource::Path(path), plan);
        Ok(self.start_with(opts))
    }

    pub fn start_with(&mut self, opts: SupervisorOptions) -> &Supervisor {
        self.supervisor
            .insert(Supervisor::start(opts, &self.cancel))
    }

    pub fn supervisor(&self) -> Result<&Supervisor, WaitError> {
        self.supervisor.as_ref().ok_or(WaitError::NotStarted)
    }

    /// Wait until the cluster is up and healthy; returns the controller URL
    pub async fn wait_ready(&self, timeout: Duration) -> Result<ServiceUrl, WaitError> {
        let supervisor = self.supervisor()?;
        match tokio::time::timeout(timeout, supervisor.wait_ready()).await {
            Ok(Some(url)) => Ok(url),
            Ok(None) => Err(WaitError::Stopped(
                supervisor
                    .shutdown_handle()
                    .cause()
                    .unwrap_or(ShutdownCause::Cancelled),
            )),
            Err(_) => Err(WaitError::Timeout),
        }
    }

    /// Wait for the run to end on its own and return why it ended
    pub async fn wait(&self, timeout: Duration) -> Result<ShutdownCause, WaitError> {
        let supervisor = self.supervisor()?;
        match tokio::time::timeout(timeout, supervisor.wait()).await {
            Ok(Err(cause)) => Ok(cause),
            Ok(Ok(())) => Ok(ShutdownCause::Cancelled),
            Err(_) => Err(WaitError::Timeout),
        }
    }

    pub async fn stop(&self) -> Result<(), WaitError> {
        let supervisor = self.supervisor()?;
        supervisor.stop().await.map_err(WaitError::Stopped)
    }
}

impl Drop for TestSupervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
