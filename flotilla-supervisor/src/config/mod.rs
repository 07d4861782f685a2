//! Configuration module for the cluster supervisor
//!
//! This module provides:
//! - `ConfigDocument` - the whole config file (one or more clusters)
//! - `Cluster` - one cluster's settings, as consumed by the supervisor
//! - `ServiceUrl` and the known-service table used by autofill and health
//!
//! Only the fields the supervisor reads or writes are typed. Everything else
//! is carried through untouched in `extra` maps so that the config handed to
//! child processes loses nothing.

pub mod autofill;
mod duration;
pub mod services;
mod url;

pub use autofill::{AutofillOptions, PortAllocator, autofill};
pub use duration::{format_duration, parse_duration};
pub use url::{ServiceUrl, join_host_port, split_host_port};

use serde::{Deserialize, Deserializer, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::errors::{Result, SupervisorError};

const DEFAULT_POSTGRES_PORT: u16 = 5432;

/// Untyped remainder of a config mapping
pub type Extra = BTreeMap<String, serde_yaml::Value>;

/// Deployment profile of a run. Gates temp dirs, secret generation,
/// extra tasks and volume synthesis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ClusterType {
    #[default]
    Development,
    Test,
    Production,
}

impl ClusterType {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterType::Development => "development",
            ClusterType::Test => "test",
            ClusterType::Production => "production",
        }
    }

    pub fn is_production(self) -> bool {
        self == ClusterType::Production
    }
}

impl std::fmt::Display for ClusterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClusterType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "development" => Ok(ClusterType::Development),
            "test" => Ok(ClusterType::Test),
            "production" => Ok(ClusterType::Production),
            other => Err(format!(
                "cluster type must be 'development', 'test', or 'production', not {:?}",
                other
            )),
        }
    }
}

/// Where the config document comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// A file on disk; the only kind the config watcher can follow
    Path(PathBuf),
    /// Read once from standard input (`-config -`)
    Stdin,
    /// YAML text supplied directly by the caller
    Literal(String),
}

impl ConfigSource {
    /// Interpret a `-config` command line value
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" {
            ConfigSource::Stdin
        } else {
            ConfigSource::Path(PathBuf::from(arg))
        }
    }

    /// The file backing this source, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigSource::Path(p) => Some(p),
            _ => None,
        }
    }

    fn origin(&self) -> PathBuf {
        match self {
            ConfigSource::Path(p) => p.clone(),
            ConfigSource::Stdin => PathBuf::from("<stdin>"),
            ConfigSource::Literal(_) => PathBuf::from("<literal>"),
        }
    }
}

/// Top level of the config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(rename = "AutoReloadConfig", default)]
    pub auto_reload_config: bool,

    #[serde(rename = "Clusters", default)]
    pub clusters: BTreeMap<String, Cluster>,

    #[serde(flatten)]
    pub extra: Extra,
}

impl ConfigDocument {
    /// Load and validate a document from `source`
    pub fn load(source: &ConfigSource) -> Result<Self> {
        let contents = match source {
            ConfigSource::Path(path) => std::fs::read_to_string(path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SupervisorError::ConfigNotFound(path.clone())
                } else {
                    SupervisorError::Config(format!(
                        "Failed to read config '{}': {}",
                        path.display(),
                        e
                    ))
                }
            })?,
            ConfigSource::Stdin => {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            }
            ConfigSource::Literal(text) => text.clone(),
        };
        Self::parse(&contents, &source.origin())
    }

    /// Parse YAML (or JSON) text. `origin` is only used in error messages.
    pub fn parse(contents: &str, origin: &Path) -> Result<Self> {
        let de = serde_yaml::Deserializer::from_str(contents);
        let mut doc: ConfigDocument =
            serde_path_to_error::deserialize(de).map_err(|e| SupervisorError::ConfigParse {
                path: origin.to_path_buf(),
                source: e,
            })?;

        if doc.clusters.is_empty() {
            return Err(SupervisorError::Config(format!(
                "'{}' does not define any clusters",
                origin.display()
            )));
        }
        for (id, cluster) in doc.clusters.iter_mut() {
            validate_cluster_id(id)?;
            cluster.cluster_id = id.clone();
        }
        Ok(doc)
    }

    /// The only cluster, when the document defines exactly one
    pub fn single_cluster(&self) -> Option<&Cluster> {
        if self.clusters.len() == 1 {
            self.clusters.values().next()
        } else {
            None
        }
    }

    pub fn single_cluster_mut(&mut self) -> Option<&mut Cluster> {
        if self.clusters.len() == 1 {
            self.clusters.values_mut().next()
        } else {
            None
        }
    }

    /// A copy of this document restricted to one cluster
    pub fn for_cluster(&self, id: &str) -> Option<ConfigDocument> {
        let cluster = self.clusters.get(id)?;
        Some(ConfigDocument {
            auto_reload_config: self.auto_reload_config,
            clusters: BTreeMap::from([(id.to_string(), cluster.clone())]),
            extra: self.extra.clone(),
        })
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| SupervisorError::Internal(format!("Failed to serialize config: {}", e)))
    }

    /// Order-independent form used to decide whether two loads differ
    pub fn comparable(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self)
            .map_err(|e| SupervisorError::Internal(format!("Failed to compare config: {}", e)))
    }

    /// True if both documents would produce the same `config.yml`
    pub fn same_as(&self, other: &ConfigDocument) -> bool {
        match (self.comparable(), other.comparable()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

fn validate_cluster_id(id: &str) -> Result<()> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(SupervisorError::Config(format!(
            "invalid cluster id {:?}: must be non-empty and alphanumeric",
            id
        )));
    }
    Ok(())
}

/// One cluster's configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Cluster {
    /// Filled from the `Clusters` map key
    #[serde(skip)]
    pub cluster_id: String,

    #[serde(default)]
    pub services: BTreeMap<String, ServiceEntry>,

    #[serde(rename = "PostgreSQL", default)]
    pub postgresql: PostgreSql,

    #[serde(default)]
    pub system_root_token: String,

    #[serde(default)]
    pub management_token: String,

    #[serde(default)]
    pub collections: Collections,

    #[serde(default)]
    pub users: Users,

    #[serde(default)]
    pub containers: Containers,

    #[serde(rename = "TLS", default)]
    pub tls: Tls,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Volume>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub storage_classes: BTreeMap<String, StorageClass>,

    #[serde(flatten)]
    pub extra: Extra,
}

impl Cluster {
    pub fn service(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    /// Mutable access, creating an empty entry if the service is absent
    pub fn service_mut(&mut self, name: &str) -> &mut ServiceEntry {
        self.services.entry(name.to_string()).or_default()
    }

    /// Every InternalURL configured for `name`
    pub fn internal_urls(&self, name: &str) -> Vec<ServiceUrl> {
        self.services
            .get(name)
            .map(|s| s.internal_urls.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn controller_url(&self) -> Option<&ServiceUrl> {
        self.services
            .get(services::CONTROLLER)
            .map(|s| &s.external_url)
            .filter(|u| !u.is_empty())
    }

    /// Generated secrets, by config field name
    pub fn secrets_mut(&mut self) -> Vec<(&'static str, &mut String)> {
        vec![
            ("SystemRootToken", &mut self.system_root_token),
            ("ManagementToken", &mut self.management_token),
            ("Collections.BlobSigningKey", &mut self.collections.blob_signing_key),
            ("Users.AnonymousUserToken", &mut self.users.anonymous_user_token),
        ]
    }
}

/// `Services.<Name>`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    #[serde(rename = "ExternalURL", default)]
    pub external_url: ServiceUrl,

    #[serde(rename = "InternalURLs", default)]
    pub internal_urls: BTreeMap<ServiceUrl, ServiceInstance>,

    #[serde(flatten)]
    pub extra: Extra,
}

/// Per-instance settings under `InternalURLs`; passed through untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostgreSql {
    #[serde(rename = "Connection", default)]
    pub connection: DatabaseConnection,

    #[serde(flatten)]
    pub extra: Extra,
}

/// `PostgreSQL.Connection`, keyed the way libpq keys are
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConnection {
    #[serde(default)]
    pub host: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub port: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub dbname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_encoding: String,

    #[serde(flatten)]
    pub extra: Extra,
}

impl DatabaseConnection {
    pub fn is_empty(&self) -> bool {
        self.host.is_empty() && self.dbname.is_empty()
    }

    /// Connection settings for the sqlx driver; an empty port means 5432
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        let port = if self.port.is_empty() {
            DEFAULT_POSTGRES_PORT
        } else {
            self.port.parse().map_err(|_| {
                SupervisorError::Config(format!("invalid PostgreSQL port {:?}", self.port))
            })?
        };
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.dbname))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Collections {
    #[serde(default)]
    pub blob_signing_key: String,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Users {
    #[serde(default)]
    pub anonymous_user_token: String,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Containers {
    #[serde(default)]
    pub dispatch_private_key: String,

    #[serde(rename = "CloudVMs", default)]
    pub cloud_vms: CloudVms,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudVms {
    #[serde(rename = "Enable", default)]
    pub enable: bool,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tls {
    #[serde(default)]
    pub certificate: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub insecure: bool,

    #[serde(flatten)]
    pub extra: Extra,
}

/// `Volumes.<id>`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Volume {
    #[serde(default)]
    pub driver: String,

    #[serde(default)]
    pub driver_parameters: Extra,

    #[serde(default)]
    pub access_via_hosts: BTreeMap<ServiceUrl, VolumeAccess>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub storage_classes: BTreeMap<String, bool>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeAccess {
    #[serde(default)]
    pub read_only: bool,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StorageClass {
    #[serde(default)]
    pub default: bool,

    #[serde(flatten)]
    pub extra: Extra,
}

/// Accept `port: 5432` as well as `port: "5432"`
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(u64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Num(n) => n.to_string(),
    })
}
