//! Task plans built from shell scripts

use async_trait::async_trait;
use flotilla_supervisor::config::Cluster;
use flotilla_supervisor::errors::Result;
use flotilla_supervisor::health::HealthTarget;
use flotilla_supervisor::plan::TaskPlan;
use flotilla_supervisor::process::RunOptions;
use flotilla_supervisor::task::{OneShot, RunContext, RunSetup, Service, ServiceLaunch, Task};
use std::path::{Path, PathBuf};

/// One-shot task that runs `sh -c <script>` to completion
pub struct ScriptTask {
    name: String,
    depends: Vec<String>,
    dir: PathBuf,
    script: String,
}

impl ScriptTask {
    pub fn new(name: &str, dir: &Path, script: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            depends: Vec::new(),
            dir: dir.to_path_buf(),
            script: script.into(),
        }
    }

    pub fn after(mut self, task: &str) -> Self {
        self.depends.push(task.to_string());
        self
    }
}

#[async_trait]
impl OneShot for ScriptTask {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn depends(&self) -> Vec<String> {
        self.depends.clone()
    }

    async fn run(&self, ctx: &RunContext) -> Result<()> {
        ctx.run_program(&self.dir, RunOptions::new(), "sh", &["-c", self.script.as_str()])
            .await
    }
}

/// Service task keeping `sh -c <script>` running
pub struct ScriptService {
    name: String,
    depends: Vec<String>,
    dir: PathBuf,
    script: String,
    probe: Option<String>,
}

impl ScriptService {
    pub fn new(name: &str, dir: &Path, script: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            depends: Vec::new(),
            dir: dir.to_path_buf(),
            script: script.into(),
            probe: None,
        }
    }

    pub fn after(mut self, task: &str) -> Self {
        self.depends.push(task.to_string());
        self
    }

    /// Only ready once `addr` accepts connections
    pub fn ready_probe(mut self, addr: &str) -> Self {
        self.probe = Some(addr.to_string());
        self
    }
}

#[async_trait]
impl Service for ScriptService {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn depends(&self) -> Vec<String> {
        self.depends.clone()
    }

    async fn prepare(&self, _ctx: &RunContext) -> Result<Vec<ServiceLaunch>> {
        let mut launch = ServiceLaunch::new(&self.dir, "sh", ["-c", self.script.as_str()]);
        if let Some(addr) = &self.probe {
            launch = launch.ready_probe(addr.clone());
        }
        Ok(vec![launch])
    }
}

/// A [`TaskPlan`] with a fixed task list and fixed health targets
#[derive(Clone, Default)]
pub struct ScriptPlan {
    tasks: Vec<Task>,
    targets: Vec<HealthTarget>,
}

impl ScriptPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn one_shot(mut self, task: ScriptTask) -> Self {
        self.tasks.push(Task::one_shot(task));
        self
    }

    pub fn service(mut self, service: ScriptService) -> Self {
        self.tasks.push(Task::service(service));
        self
    }

    /// Add any task, scripted or not
    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn health_target(mut self, target: HealthTarget) -> Self {
        self.targets.push(target);
        self
    }
}

#[async_trait]
impl TaskPlan for ScriptPlan {
    fn tasks(&self, _setup: &RunSetup) -> Vec<Task> {
        self.tasks.clone()
    }

    fn health_targets(&self, _cluster: &Cluster) -> Vec<HealthTarget> {
        self.targets.clone()
    }
}
