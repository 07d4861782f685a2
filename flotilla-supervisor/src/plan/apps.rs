//! Rails apps served by passenger, the seed step, and the workbench2 dev
//! server.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::{ClusterType, services};
use crate::env::debug_requested;
use crate::errors::{Result, SupervisorError};
use crate::process::RunOptions;
use crate::task::{OneShot, RunContext, RunSetup, Service, ServiceLaunch};

pub const SEED_TASK: &str = "seed database";
pub const WORKBENCH2_TASK: &str = "workbench2";

/// Production installs of the apps live under here, by `varlib` name
pub const PRODUCTION_APP_ROOT: &str = "/var/lib/flotilla";

/// Account passenger runs as when the supervisor is root
pub const WWW_USER: &str = "www-data";

/// A Rails app in the source tree, e.g. `services/api`
#[derive(Debug, Clone)]
pub struct App {
    pub src: &'static str,
    /// Directory name of the production install
    pub varlib: &'static str,
}

pub const API: App = App {
    src: "services/api",
    varlib: "railsapi",
};

pub const WORKBENCH1: App = App {
    src: "apps/workbench",
    varlib: "workbench1",
};

impl App {
    pub fn install_task(&self) -> String {
        format!("install {}", self.src)
    }

    pub fn run_task(&self) -> String {
        format!("passenger {}", self.src)
    }

    /// Where the app's code is for this cluster type
    pub fn dir(&self, cluster_type: ClusterType) -> PathBuf {
        if cluster_type.is_production() {
            PathBuf::from(PRODUCTION_APP_ROOT).join(self.varlib)
        } else {
            PathBuf::from(self.src)
        }
    }
}

fn www_options() -> RunOptions {
    if nix::unistd::Uid::effective().is_root() {
        RunOptions::new().user(WWW_USER)
    } else {
        RunOptions::new()
    }
}

/// Bundle the app's gems and passenger's native runtime.
///
/// Installs share one lock; concurrent bundler runs step on each other's
/// gem directories.
#[derive(Debug, Clone)]
pub struct InstallPassenger {
    pub app: App,
    pub depends: Vec<String>,
    pub lock: Arc<Mutex<()>>,
}

const INSTALL_STEPS: &[&[&str]] = &[
    &["bundle", "install", "--jobs", "4"],
    &["bundle", "exec", "passenger-config", "build-native-support"],
    &["bundle", "exec", "passenger-config", "install-standalone-runtime"],
    &["bundle", "exec", "passenger-config", "validate-install"],
];

#[async_trait]
impl OneShot for InstallPassenger {
    fn name(&self) -> String {
        self.app.install_task()
    }

    fn depends(&self) -> Vec<String> {
        self.depends.clone()
    }

    async fn run(&self, ctx: &RunContext) -> Result<()> {
        if ctx.setup().cluster_type.is_production() {
            return Ok(());
        }
        let _guard = tokio::select! {
            _ = ctx.token().cancelled() => return Err(SupervisorError::Cancelled),
            guard = self.lock.lock() => guard,
        };
        let dir = self.app.dir(ctx.setup().cluster_type);
        for step in INSTALL_STEPS {
            let (program, args) = step
                .split_first()
                .ok_or_else(|| SupervisorError::Internal("empty install step".to_string()))?;
            ctx.run_program(&dir, RunOptions::new(), program, args).await?;
        }
        Ok(())
    }
}

/// The app server for one app, listening on its service's InternalURL
#[derive(Debug, Clone)]
pub struct RunPassenger {
    pub app: App,
    pub service: &'static str,
    pub depends: Vec<String>,
}

/// Pid file name unique to the app directory
fn pid_file_name(dir: &std::path::Path) -> String {
    format!("passenger.{}.pid", dir.display().to_string().replace('/', "_"))
}

#[async_trait]
impl Service for RunPassenger {
    fn name(&self) -> String {
        self.app.run_task()
    }

    fn depends(&self) -> Vec<String> {
        self.depends.clone()
    }

    async fn prepare(&self, ctx: &RunContext) -> Result<Vec<ServiceLaunch>> {
        let setup = ctx.setup();
        let dir = self.app.dir(setup.cluster_type);
        let loglevel = if debug_requested() { "3" } else { "1" };
        let pid_file = setup.www_temp_dir.join(pid_file_name(&dir));

        let mut launches = Vec::new();
        for url in ctx.cluster().internal_urls(self.service) {
            let port = url.port_or_default().to_string();
            let args = vec![
                "exec".to_string(),
                "passenger".to_string(),
                "start".to_string(),
                "--address".to_string(),
                url.hostname().to_string(),
                "--port".to_string(),
                port,
                "--log-level".to_string(),
                loglevel.to_string(),
                "--no-friendly-error-pages".to_string(),
                "--disable-anonymous-telemetry".to_string(),
                "--disable-security-update-check".to_string(),
                "--no-compile-runtime".to_string(),
                "--no-install-runtime".to_string(),
                "--pid-file".to_string(),
                pid_file.display().to_string(),
            ];
            launches.push(ServiceLaunch::new(&dir, "bundle", args).options(www_options()));
        }
        Ok(launches)
    }
}

/// Load the API's seed data once the schema is current
#[derive(Debug, Clone)]
pub struct SeedDatabase {
    pub depends: Vec<String>,
}

#[async_trait]
impl OneShot for SeedDatabase {
    fn name(&self) -> String {
        SEED_TASK.to_string()
    }

    fn depends(&self) -> Vec<String> {
        self.depends.clone()
    }

    async fn run(&self, ctx: &RunContext) -> Result<()> {
        if ctx.setup().cluster_type.is_production() {
            return Ok(());
        }
        ctx.run_program(
            API.dir(ctx.setup().cluster_type),
            RunOptions::new().env("RAILS_LOG_TO_STDOUT", "1"),
            "bundle",
            &["exec", "rake", "db:seed"],
        )
        .await
    }
}

/// The workbench2 dev server, run from a separate checkout
#[derive(Debug, Clone)]
pub struct Workbench2 {
    pub source: PathBuf,
}

/// Environment the dev server needs to find the API
pub fn workbench2_env(setup: &RunSetup, port: u16) -> RunOptions {
    let api_host = setup
        .cluster
        .controller_url()
        .map(|u| u.authority())
        .unwrap_or_default();
    RunOptions::new()
        .env("BROWSER", "none")
        .env("HOST", &setup.listen_host)
        .env("PORT", port.to_string())
        .env("REACT_APP_FLOTILLA_API_HOST", api_host)
}

#[async_trait]
impl Service for Workbench2 {
    fn name(&self) -> String {
        WORKBENCH2_TASK.to_string()
    }

    async fn prepare(&self, ctx: &RunContext) -> Result<Vec<ServiceLaunch>> {
        let urls = ctx.cluster().internal_urls(services::WORKBENCH2);
        let Some(url) = urls.first() else {
            info!("workbench2 has no InternalURLs; not starting");
            return Ok(Vec::new());
        };
        let source = ctx.runner().resolve_dir(&self.source);
        ctx.run_program(&source, RunOptions::new(), "yarn", &["install"])
            .await?;
        let opts = workbench2_env(ctx.setup(), url.port_or_default());
        Ok(vec![
            ServiceLaunch::new(source, "yarn", ["start"]).options(opts),
        ])
    }
}
