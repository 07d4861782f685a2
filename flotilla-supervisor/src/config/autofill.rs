//! Pre-launch pass that fills in whatever the operator left unset:
//! endpoints, secrets, test volumes and the owned database coordinates.

use rand::RngCore;
use rand::rngs::OsRng;
use std::collections::{BTreeMap, HashSet};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::services::{self, KNOWN_SERVICES};
use super::{
    Cluster, ClusterType, DatabaseConnection, ServiceInstance, ServiceUrl, StorageClass, Volume,
    VolumeAccess, join_host_port, split_host_port,
};
use crate::errors::{Result, SupervisorError};

/// Length of generated secrets, in hex characters
pub const SECRET_LENGTH: usize = 64;

/// Credentials written into the config when the supervisor owns the database
pub const OWNED_DB_NAME: &str = "flotilla_test";
pub const OWNED_DB_USER: &str = "flotilla";
pub const OWNED_DB_PASSWORD: &str = "insecure_flotilla_test";

const MAX_PORT_ATTEMPTS: usize = 100;

/// Operator inputs that steer autofill
#[derive(Debug, Clone, Default)]
pub struct AutofillOptions {
    pub cluster_type: ClusterType,
    pub listen_host: String,
    /// `[host]:[port]`; empty host means listen host, port `0` means assign
    pub controller_address: String,
    pub own_temporary_database: bool,
    pub no_workbench1: bool,
    pub no_workbench2: bool,
    pub source_path: PathBuf,
    /// Ephemeral working directory; volume data and certificates live here
    pub temp_dir: PathBuf,
}

/// Hands out OS-assigned TCP ports, never the same one twice per pass.
///
/// A port is found by listening on `host:0` and closing the socket again.
/// Another process may grab the port between the close and the moment the
/// child binds it; that race is accepted. Holding the socket open would stop
/// the children from binding the port themselves.
#[derive(Debug)]
pub struct PortAllocator {
    used: HashSet<u16>,
    fallback_host: String,
}

impl PortAllocator {
    pub fn new(fallback_host: &str) -> Self {
        Self {
            used: HashSet::new(),
            fallback_host: fallback_host.to_string(),
        }
    }

    /// Mark a port as taken. Returns false if it already was.
    pub fn claim(&mut self, port: u16) -> bool {
        self.used.insert(port)
    }

    /// Claim every port already written in the cluster's service URLs
    pub fn seed_from(&mut self, cluster: &Cluster) {
        for entry in cluster.services.values() {
            if let Some(p) = entry.external_url.port() {
                self.claim(p);
            }
            for url in entry.internal_urls.keys() {
                if let Some(p) = url.port() {
                    self.claim(p);
                }
            }
        }
    }

    pub fn is_used(&self, port: u16) -> bool {
        self.used.contains(&port)
    }

    /// Find a free port on `host`, falling back to the listen host when
    /// `host` cannot be bound.
    pub fn next_port(&mut self, host: &str) -> Result<u16> {
        let mut last_err = String::from("no attempts made");
        for _ in 0..MAX_PORT_ATTEMPTS {
            let port = match available_port(host) {
                Ok(p) => p,
                Err(_) => match available_port(&self.fallback_host) {
                    Ok(p) => p,
                    Err(e) => {
                        return Err(SupervisorError::PortAssignment {
                            host: host.to_string(),
                            reason: e.to_string(),
                        });
                    }
                },
            };
            if self.claim(port) {
                return Ok(port);
            }
            last_err = format!("port {} already assigned", port);
        }
        Err(SupervisorError::PortAssignment {
            host: host.to_string(),
            reason: format!("gave up after {} attempts: {}", MAX_PORT_ATTEMPTS, last_err),
        })
    }
}

fn available_port(host: &str) -> std::io::Result<u16> {
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    let listener = TcpListener::bind(join_host_port(host, "0"))?;
    Ok(listener.local_addr()?.port())
}

/// `len` hex characters from the OS CSPRNG
pub fn random_hex_string(len: usize) -> String {
    let mut buf = vec![0u8; len.div_ceil(2)];
    OsRng.fill_bytes(&mut buf);
    let mut s = hex::encode(buf);
    s.truncate(len);
    s
}

/// Fill in unset endpoints, secrets, volumes and database coordinates.
///
/// Runs once, before any child is started; a failure aborts startup.
pub fn autofill(cluster: &mut Cluster, opts: &AutofillOptions) -> Result<()> {
    let mut ports = PortAllocator::new(&opts.listen_host);
    ports.seed_from(cluster);
    autofill_with(cluster, opts, &mut ports)
}

pub fn autofill_with(
    cluster: &mut Cluster,
    opts: &AutofillOptions,
    ports: &mut PortAllocator,
) -> Result<()> {
    fill_controller(cluster, opts, ports)?;

    let default_ext_host = cluster
        .controller_url()
        .map(|u| u.hostname().to_string())
        .unwrap_or_else(|| opts.listen_host.clone());

    for known in KNOWN_SERVICES.iter().filter(|k| k.autofill) {
        let entry = cluster.service_mut(known.name);
        if entry.external_url.is_empty()
            && let Some(scheme) = known.exposure.scheme()
        {
            let port = ports.next_port(&default_ext_host)?;
            entry.external_url =
                service_url(scheme, &default_ext_host, port, known.exposure.path())?;
        }

        // A disabled workbench keeps its ExternalURL so the TLS terminator
        // still has a port to render, but gets no instances to health check.
        if (opts.no_workbench1 && known.name == services::WORKBENCH1)
            || (opts.no_workbench2 && known.name == services::WORKBENCH2)
        {
            continue;
        }
        if entry.internal_urls.is_empty() {
            let port = ports.next_port(&opts.listen_host)?;
            entry.internal_urls.insert(
                service_url("http", &opts.listen_host, port, "/")?,
                ServiceInstance::default(),
            );
        }
    }

    if !opts.cluster_type.is_production() {
        fill_secrets(cluster, &opts.source_path)?;
        cluster.tls.insecure = true;
        if cluster.tls.key.is_empty() {
            cluster.tls.key = opts.temp_dir.join("server.key").display().to_string();
        }
        if cluster.tls.certificate.is_empty() {
            cluster.tls.certificate = opts.temp_dir.join("server.crt").display().to_string();
        }
    }

    if opts.cluster_type == ClusterType::Test {
        add_test_volumes(cluster, opts, ports)?;
    }

    if opts.own_temporary_database {
        let port = ports.next_port("localhost")?;
        cluster.postgresql.connection = DatabaseConnection {
            host: "localhost".to_string(),
            port: port.to_string(),
            user: OWNED_DB_USER.to_string(),
            password: OWNED_DB_PASSWORD.to_string(),
            dbname: OWNED_DB_NAME.to_string(),
            client_encoding: "utf8".to_string(),
            extra: Default::default(),
        };
    }
    Ok(())
}

fn fill_controller(
    cluster: &mut Cluster,
    opts: &AutofillOptions,
    ports: &mut PortAllocator,
) -> Result<()> {
    let controller = cluster.service_mut(services::CONTROLLER);
    if !controller.external_url.is_empty() {
        return Ok(());
    }
    let (mut host, port) = if opts.controller_address.is_empty() {
        (String::new(), String::new())
    } else {
        split_host_port(&opts.controller_address).map_err(|e| {
            SupervisorError::Config(format!("invalid controller address: {}", e))
        })?
    };
    if host.is_empty() {
        host = opts.listen_host.clone();
    }
    let port = if port.is_empty() || port == "0" {
        ports.next_port(&host)?
    } else {
        let p: u16 = port.parse().map_err(|_| {
            SupervisorError::Config(format!("invalid controller port {:?}", port))
        })?;
        if !ports.claim(p) {
            return Err(SupervisorError::PortAssignment {
                host,
                reason: format!("controller port {} is already used by another service", p),
            });
        }
        p
    };
    controller.external_url = service_url("https", &host, port, "/")?;
    debug!(url = %controller.external_url, "assigned controller URL");
    Ok(())
}

fn service_url(scheme: &str, host: &str, port: u16, path: &str) -> Result<ServiceUrl> {
    ServiceUrl::new(scheme, host, Some(port), path).map_err(SupervisorError::Config)
}

fn fill_secrets(cluster: &mut Cluster, source_path: &Path) -> Result<()> {
    for (name, value) in cluster.secrets_mut() {
        if value.is_empty() {
            *value = random_hex_string(SECRET_LENGTH);
            debug!(secret = name, "generated secret");
        }
    }
    if cluster.containers.dispatch_private_key.is_empty() {
        let key_path = source_path
            .join("lib")
            .join("dispatchcloud")
            .join("test")
            .join("sshkey_dispatch");
        match std::fs::read_to_string(&key_path) {
            Ok(key) => cluster.containers.dispatch_private_key = key,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %key_path.display(), "dispatch private key not found; leaving it unset");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Second blob-store instance plus one directory-backed volume per instance
fn add_test_volumes(
    cluster: &mut Cluster,
    opts: &AutofillOptions,
    ports: &mut PortAllocator,
) -> Result<()> {
    let port = ports.next_port(&opts.listen_host)?;
    let keepstore = cluster.service_mut(services::KEEPSTORE);
    keepstore.internal_urls.insert(
        service_url("http", &opts.listen_host, port, "/")?,
        ServiceInstance::default(),
    );
    let urls: Vec<ServiceUrl> = keepstore.internal_urls.keys().cloned().collect();

    let classes: BTreeMap<String, bool> = ["default", "foo", "bar"]
        .into_iter()
        .map(|c| (c.to_string(), true))
        .collect();

    cluster.volumes.clear();
    for (volnum, url) in urls.into_iter().enumerate() {
        let datadir = opts.temp_dir.join(format!("keep{}.data", volnum));
        if !datadir.is_dir() {
            std::fs::create_dir(&datadir)?;
        }
        let mut params = BTreeMap::new();
        params.insert(
            "Root".to_string(),
            serde_yaml::Value::String(datadir.display().to_string()),
        );
        cluster.volumes.insert(
            format!("{}-nyw5e-{:015}", cluster.cluster_id, volnum),
            Volume {
                driver: "Directory".to_string(),
                driver_parameters: params,
                access_via_hosts: BTreeMap::from([(url, VolumeAccess::default())]),
                storage_classes: classes.clone(),
                extra: Default::default(),
            },
        );
    }

    cluster.storage_classes = BTreeMap::from([
        (
            "default".to_string(),
            StorageClass {
                default: true,
                ..Default::default()
            },
        ),
        ("foo".to_string(), StorageClass::default()),
        ("bar".to_string(), StorageClass::default()),
    ]);
    Ok(())
}
