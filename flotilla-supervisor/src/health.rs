//! Cluster health aggregation.
//!
//! Every tick, each health-checked service is probed at each of its
//! InternalURLs. The cluster is considered ready once every target that is
//! configured reports OK; services a deployment does not run are simply not
//! targets, so they never hold readiness back.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Cluster, ServiceUrl, services};
use crate::errors::{Result, SupervisorError};

pub const HEALTH_PATH: &str = "/_health/ping";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// `cluster_health` before the first tick
pub const NOT_YET_CHECKED: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetHealth {
    pub health: Health,
    pub response_time: Duration,
    pub error: Option<String>,
}

/// Latest result of probing every target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checks: BTreeMap<String, TargetHealth>,
    /// Space-separated names of targets not currently OK; empty when the
    /// whole cluster is healthy
    pub cluster_health: String,
}

impl HealthReport {
    fn initial() -> Self {
        Self {
            checks: BTreeMap::new(),
            cluster_health: NOT_YET_CHECKED.to_string(),
        }
    }

    fn from_checks(checks: BTreeMap<String, TargetHealth>) -> Self {
        let waiting: Vec<&str> = checks
            .iter()
            .filter(|(_, check)| check.health != Health::Ok)
            .map(|(name, _)| name.as_str())
            .collect();
        let cluster_health = waiting.join(" ");
        Self {
            checks,
            cluster_health,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.cluster_health.is_empty()
    }
}

/// One probe address, named `<Service>+<InternalURL>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTarget {
    pub name: String,
    pub url: ServiceUrl,
}

/// Every (service, InternalURL) pair the aggregator probes. The cloud
/// dispatcher only runs with cloud VMs enabled, so only then is it a target.
pub fn targets(cluster: &Cluster) -> Vec<HealthTarget> {
    let mut out = Vec::new();
    for known in services::KNOWN_SERVICES.iter().filter(|s| s.health_checked) {
        if known.name == services::DISPATCH_CLOUD && !cluster.containers.cloud_vms.enable {
            continue;
        }
        for url in cluster.internal_urls(known.name) {
            out.push(HealthTarget {
                name: format!("{}+{}", known.name, url),
                url,
            });
        }
    }
    out
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    health: Health,
    #[serde(default)]
    error: Option<String>,
}

/// Probes a fixed set of targets with the management token
#[derive(Debug, Clone)]
pub struct HealthAggregator {
    targets: Vec<HealthTarget>,
    token: String,
    client: reqwest::Client,
    interval: Duration,
    timeout: Duration,
}

impl HealthAggregator {
    pub fn new(cluster: &Cluster) -> Result<Self> {
        Self::with_targets(
            targets(cluster),
            &cluster.management_token,
            cluster.tls.insecure,
        )
    }

    pub fn with_targets(targets: Vec<HealthTarget>, token: &str, insecure: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(|e| SupervisorError::Health(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            targets,
            token: token.to_string(),
            client,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn targets(&self) -> &[HealthTarget] {
        &self.targets
    }

    async fn check(&self, target: &HealthTarget) -> TargetHealth {
        let started = Instant::now();
        let url = target.url.with_path(HEALTH_PATH).to_string();
        let result = async {
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            let status = resp.status();
            if !status.is_success() {
                return Err(format!("HTTP {}", status));
            }
            resp.json::<HealthBody>().await.map_err(|e| e.to_string())
        }
        .await;

        let response_time = started.elapsed();
        match result {
            Ok(body) => TargetHealth {
                health: body.health,
                response_time,
                error: body.error,
            },
            Err(error) => TargetHealth {
                health: Health::Error,
                response_time,
                error: Some(error),
            },
        }
    }

    /// Probe every target once, concurrently
    pub async fn tick(&self) -> HealthReport {
        let results = join_all(self.targets.iter().map(|t| self.check(t))).await;
        let checks = self
            .targets
            .iter()
            .map(|t| t.name.clone())
            .zip(results)
            .collect();
        HealthReport::from_checks(checks)
    }

    /// Poll every `interval` until `cancel` fires, publishing each report
    pub fn spawn(self, cancel: CancellationToken) -> HealthMonitor {
        let (tx, rx) = watch::channel(HealthReport::initial());
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let report = tokio::select! {
                    _ = cancel.cancelled() => break,
                    report = self.tick() => report,
                };
                debug!(cluster_health = %report.cluster_health, "health tick");
                if tx.send(report).is_err() {
                    break;
                }
            }
        });
        HealthMonitor { rx, task }
    }
}

/// Handle on a running aggregator
#[derive(Debug)]
pub struct HealthMonitor {
    rx: watch::Receiver<HealthReport>,
    task: JoinHandle<()>,
}

impl HealthMonitor {
    pub fn report(&self) -> HealthReport {
        self.rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthReport> {
        self.rx.clone()
    }

    /// Wait until every target is OK. Returns false if `cancel` fires or the
    /// aggregator stops first.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> bool {
        wait_healthy(self.rx.clone(), cancel).await
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Wait on a report stream until it is healthy
pub async fn wait_healthy(
    mut rx: watch::Receiver<HealthReport>,
    cancel: &CancellationToken,
) -> bool {
    loop {
        {
            let report = rx.borrow_and_update();
            if report.is_healthy() {
                return true;
            }
            if report.cluster_health != NOT_YET_CHECKED {
                info!(targets = %report.cluster_health, "waiting");
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            changed = rx.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
