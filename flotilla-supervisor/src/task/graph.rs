use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::{ReadyRegistry, RunContext, RunSetup, ShutdownHandle, Task};
use crate::errors::{Result, SupervisorError};

/// Delay between connection attempts in [`wait_for_connect`]
pub const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Dial timeout for each attempt in [`wait_for_connect`]
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// A fixed set of tasks, validated before anything runs
#[derive(Debug)]
pub struct TaskGraph {
    tasks: Vec<Task>,
}

impl TaskGraph {
    /// Build the graph. A task whose name was already seen is the same task
    /// and is dropped. A dependency on an unregistered name is an error.
    pub fn new(tasks: Vec<Task>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(tasks.len());
        for task in tasks {
            if seen.insert(task.name()) {
                unique.push(task);
            } else {
                debug!(task = %task.name(), "ignoring repeated task");
            }
        }
        for task in &unique {
            for dep in task.depends() {
                if !seen.contains(&dep) {
                    return Err(SupervisorError::NoSuchTask(dep));
                }
            }
        }
        Ok(Self { tasks: unique })
    }

    pub fn names(&self) -> Vec<String> {
        self.tasks.iter().map(Task::name).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Start every task and return once all of them are ready.
    ///
    /// All tasks start at once; each waits for its own dependencies. Task
    /// futures and service children are spawned on `tracker`, which the
    /// caller must drain after cancelling. Returns `Cancelled` if the run
    /// stops before every task is ready.
    pub async fn start(
        self,
        setup: Arc<RunSetup>,
        shutdown: ShutdownHandle,
        tracker: TaskTracker,
    ) -> Result<RunContext> {
        let names = self.names();
        let ready = ReadyRegistry::new(names.iter().cloned());
        let ctx = RunContext::new(setup, ready, shutdown, tracker);

        for task in self.tasks {
            let ctx = ctx.clone();
            ctx.tracker().clone().spawn(drive(ctx, task));
        }

        ctx.wait(&names).await?;
        Ok(ctx)
    }
}

async fn drive(ctx: RunContext, task: Task) {
    let name = task.name();
    info!(task = %name, "starting");
    match execute(&ctx, &task, &name).await {
        Ok(()) => {
            if let Err(err) = ctx.ready().mark_ready(&name) {
                ctx.fail(&name, err);
            }
        }
        Err(err) => ctx.fail(&name, err),
    }
}

async fn execute(ctx: &RunContext, task: &Task, name: &str) -> Result<()> {
    ctx.wait(&task.depends()).await?;
    match task {
        Task::OneShot(t) => t.run(ctx).await,
        Task::Service(t) => {
            let launches = t.prepare(ctx).await?;
            for launch in launches {
                let probe = launch.ready_probe.clone();
                ctx.spawn_service(name, launch);
                if let Some(addr) = probe {
                    wait_for_connect(ctx.token(), &addr).await?;
                }
            }
            t.started(ctx).await
        }
    }
}

/// Retry connecting to `addr` until it accepts or `cancel` fires
pub async fn wait_for_connect(cancel: &CancellationToken, addr: &str) -> Result<()> {
    info!(addr, "waiting for connect");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(SupervisorError::Cancelled),
            attempt = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)) => {
                if let Ok(Ok(_stream)) = attempt {
                    return Ok(());
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(SupervisorError::Cancelled),
            _ = tokio::time::sleep(CONNECT_RETRY) => {}
        }
    }
}
