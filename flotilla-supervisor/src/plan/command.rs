use async_trait::async_trait;

use crate::env::SERVICE_URL_ENV;
use crate::errors::Result;
use crate::process::{ROOT_SERVER, RunOptions};
use crate::task::{RunContext, Service, ServiceLaunch};

/// One `cluster-server <command>` child per InternalURL of `service`.
///
/// Each child finds its own listen address in [`SERVICE_URL_ENV`]. A
/// service with no InternalURLs starts nothing and is ready at once.
#[derive(Debug, Clone)]
pub struct ServiceCommand {
    pub command: &'static str,
    pub service: &'static str,
    pub depends: Vec<String>,
}

impl ServiceCommand {
    pub fn new(command: &'static str, service: &'static str) -> Self {
        Self {
            command,
            service,
            depends: Vec::new(),
        }
    }

    pub fn after(mut self, task: impl Into<String>) -> Self {
        self.depends.push(task.into());
        self
    }
}

#[async_trait]
impl Service for ServiceCommand {
    fn name(&self) -> String {
        self.command.to_string()
    }

    fn depends(&self) -> Vec<String> {
        self.depends.clone()
    }

    async fn prepare(&self, ctx: &RunContext) -> Result<Vec<ServiceLaunch>> {
        let setup = ctx.setup();
        let config = setup.config_file.display().to_string();
        Ok(ctx
            .cluster()
            .internal_urls(self.service)
            .into_iter()
            .map(|url| {
                ServiceLaunch::new(
                    &setup.temp_dir,
                    ROOT_SERVER,
                    [self.command, "-config", config.as_str()],
                )
                .options(RunOptions::new().env(SERVICE_URL_ENV, url.to_string()))
            })
            .collect())
    }
}
