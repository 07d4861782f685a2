//! Which tasks a run starts, and the setup they need first.
//!
//! [`PlatformPlan`] is the full cluster. Tests and embedders supply their
//! own [`TaskPlan`] to run a smaller graph under the same supervisor.

mod apps;
mod command;
mod nginx;
mod postgres;
pub mod prepare;

pub use apps::{
    API, App, InstallPassenger, RunPassenger, SEED_TASK, SeedDatabase, WORKBENCH1, WORKBENCH2_TASK,
    Workbench2, workbench2_env,
};
pub use command::ServiceCommand;
pub use nginx::{Nginx, TEMPLATE_PATH as NGINX_TEMPLATE_PATH, render as render_nginx_template, template_vars};
pub use postgres::PostgreSql;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::certs::{self, CreateCertificates};
use crate::config::{Cluster, ClusterType, services};
use crate::errors::Result;
use crate::health::{self, HealthTarget};
use crate::migrate::{self, Migrations};
use crate::task::{RunSetup, Task};

#[async_trait]
pub trait TaskPlan: Send + Sync {
    /// Adjust the run (usually its environment) before any task starts
    async fn prepare(&self, _setup: &mut RunSetup, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    fn tasks(&self, setup: &RunSetup) -> Vec<Task>;

    /// Endpoints polled once every task is ready
    fn health_targets(&self, cluster: &Cluster) -> Vec<HealthTarget> {
        health::targets(cluster)
    }
}

/// Every service of a cluster, built from the source tree (or preinstalled
/// in production)
#[derive(Debug, Clone, Default)]
pub struct PlatformPlan {
    /// Version to run; empty means the checked-out tree
    pub requested_version: String,
}

#[async_trait]
impl TaskPlan for PlatformPlan {
    async fn prepare(&self, setup: &mut RunSetup, cancel: &CancellationToken) -> Result<()> {
        prepare::resolve_source_version(setup, cancel, &self.requested_version).await?;
        prepare::install_root_server(setup, cancel).await?;
        prepare::setup_ruby_env(setup, cancel).await
    }

    fn tasks(&self, setup: &RunSetup) -> Vec<Task> {
        platform_tasks(setup)
    }
}

/// The platform task set, with its dependency edges
pub fn platform_tasks(setup: &RunSetup) -> Vec<Task> {
    let install_lock = Arc::new(Mutex::new(()));
    let postgres = postgres::TASK_NAME.to_string();

    let mut tasks = vec![
        Task::one_shot(CreateCertificates),
        Task::service(PostgreSql),
        Task::service(Nginx),
        Task::service(ServiceCommand::new("controller", services::CONTROLLER).after(SEED_TASK)),
        Task::service(ServiceCommand::new("git-httpd", services::GIT_HTTP)),
        Task::service(ServiceCommand::new("health", services::HEALTH)),
        Task::service(ServiceCommand::new("keepproxy", services::KEEPPROXY).after(API.run_task())),
        Task::service(ServiceCommand::new("keepstore", services::KEEPSTORE)),
        Task::service(ServiceCommand::new("keep-web", services::WEBDAV)),
        Task::service(ServiceCommand::new("ws", services::WEBSOCKET).after(SEED_TASK)),
        Task::one_shot(InstallPassenger {
            app: API,
            depends: Vec::new(),
            lock: install_lock.clone(),
        }),
        Task::service(RunPassenger {
            app: API,
            service: services::RAILS_API,
            depends: vec![
                certs::TASK_NAME.to_string(),
                SEED_TASK.to_string(),
                API.install_task(),
            ],
        }),
        Task::one_shot(Migrations::new(
            API.dir(setup.cluster_type),
            vec![postgres.clone(), API.install_task()],
        )),
        Task::one_shot(SeedDatabase {
            depends: vec![postgres, migrate::TASK_NAME.to_string()],
        }),
    ];

    if !setup.options.no_workbench1 {
        tasks.push(Task::one_shot(InstallPassenger {
            app: WORKBENCH1,
            // Installed only after the API is seeded
            depends: vec![SEED_TASK.to_string()],
            lock: install_lock,
        }));
        tasks.push(Task::service(RunPassenger {
            app: WORKBENCH1,
            service: services::WORKBENCH1,
            depends: vec![WORKBENCH1.install_task()],
        }));
    }
    if !setup.options.no_workbench2
        && let Some(source) = &setup.options.workbench2_source
    {
        tasks.push(Task::service(Workbench2 {
            source: source.clone(),
        }));
    }
    if setup.cluster_type != ClusterType::Test {
        tasks.push(Task::service(ServiceCommand::new(
            "keep-balance",
            services::KEEPBALANCE,
        )));
    }
    if setup.cluster.containers.cloud_vms.enable {
        tasks.push(Task::service(ServiceCommand::new(
            "dispatch-cloud",
            services::DISPATCH_CLOUD,
        )));
    }
    tasks
}
