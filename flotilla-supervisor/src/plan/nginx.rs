//! TLS terminator in front of every externally exposed service.
//!
//! The config is rendered from a template in the source tree. `{{NAME}}`
//! placeholders are replaced from a fixed variable table; unknown names
//! render as the empty string.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::certs;
use crate::config::{Cluster, services};
use crate::errors::{Result, SupervisorError};
use crate::task::{RunContext, RunSetup, Service, ServiceLaunch};

pub const TASK_NAME: &str = "nginx";

/// Relative to the source tree
pub const TEMPLATE_PATH: &str = "sdk/python/tests/nginx.conf";

/// Searched after PATH, since nginx usually lives in an sbin directory
const SBIN_DIRS: &[&str] = &["/sbin", "/usr/sbin", "/usr/local/sbin"];

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{(.*?)\}\}").unwrap());

/// Template variable prefix for each proxied service
const PROXIED: &[(&str, &str)] = &[
    ("CONTROLLER", services::CONTROLLER),
    ("GIT", services::GIT_HTTP),
    ("HEALTH", services::HEALTH),
    ("KEEPPROXY", services::KEEPPROXY),
    ("KEEPWEB", services::WEBDAV),
    ("KEEPWEBDL", services::WEBDAV_DOWNLOAD),
    ("WORKBENCH1", services::WORKBENCH1),
    ("WORKBENCH2", services::WORKBENCH2),
    ("WS", services::WEBSOCKET),
];

#[derive(Debug, Clone, Default)]
pub struct Nginx;

/// Values available to the template
pub fn template_vars(setup: &RunSetup) -> Result<BTreeMap<String, String>> {
    let paths = certs::CertPaths::in_dir(&setup.temp_dir);
    let mut vars = BTreeMap::from([
        ("LISTENHOST".to_string(), setup.listen_host.clone()),
        ("SSLCERT".to_string(), paths.server_cert.display().to_string()),
        ("SSLKEY".to_string(), paths.server_key.display().to_string()),
        (
            "ACCESSLOG".to_string(),
            setup.temp_dir.join("nginx_access.log").display().to_string(),
        ),
        (
            "ERRORLOG".to_string(),
            setup.temp_dir.join("nginx_error.log").display().to_string(),
        ),
        ("TMPDIR".to_string(), setup.www_temp_dir.display().to_string()),
    ]);
    for (var, service) in PROXIED {
        if let Some(port) = internal_port(&setup.cluster, service)? {
            vars.insert(format!("{var}PORT"), port.to_string());
        }
        if let Some(entry) = setup.cluster.service(service)
            && !entry.external_url.is_empty()
        {
            vars.insert(
                format!("{var}SSLPORT"),
                entry.external_url.port_or_default().to_string(),
            );
        }
    }
    Ok(vars)
}

/// Port of the service's only InternalURL. A disabled service has none.
fn internal_port(cluster: &Cluster, service: &str) -> Result<Option<u16>> {
    let urls = cluster.internal_urls(service);
    match urls.as_slice() {
        [] => Ok(None),
        [url] => Ok(Some(url.port_or_default())),
        _ => Err(SupervisorError::Config(format!(
            "{service}: cannot proxy more than one InternalURL"
        ))),
    }
}

pub fn render(template: &str, vars: &BTreeMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

fn find_nginx(ctx: &RunContext) -> PathBuf {
    if let Some(found) = ctx
        .runner()
        .environ()
        .look_path("nginx", ctx.runner().source_root())
    {
        return found;
    }
    SBIN_DIRS
        .iter()
        .map(|dir| Path::new(dir).join("nginx"))
        .find(|p| p.is_file())
        .unwrap_or_else(|| PathBuf::from("nginx"))
}

#[async_trait]
impl Service for Nginx {
    fn name(&self) -> String {
        TASK_NAME.to_string()
    }

    fn depends(&self) -> Vec<String> {
        vec![certs::TASK_NAME.to_string()]
    }

    async fn prepare(&self, ctx: &RunContext) -> Result<Vec<ServiceLaunch>> {
        let setup = ctx.setup();
        let template = std::fs::read_to_string(setup.source_path.join(TEMPLATE_PATH))?;
        let conf = render(&template, &template_vars(setup)?);
        let conf_file = setup.temp_dir.join("nginx.conf");
        std::fs::write(&conf_file, conf)?;

        let pid_file = setup.www_temp_dir.join("nginx.pid");
        let mut args = vec![
            "-g".to_string(),
            "error_log stderr info;".to_string(),
            "-g".to_string(),
            format!("pid {};", pid_file.display()),
            "-c".to_string(),
            conf_file.display().to_string(),
        ];
        if nix::unistd::Uid::effective().is_root() {
            args.extend(["-g".to_string(), "user www-data;".to_string()]);
        }

        let mut launch =
            ServiceLaunch::new(&setup.temp_dir, find_nginx(ctx).display().to_string(), args);
        if let Some(url) = ctx.cluster().controller_url() {
            launch = launch.ready_probe(url.dial_address());
        }
        Ok(vec![launch])
    }
}
