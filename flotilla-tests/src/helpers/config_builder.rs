//! Programmatic config creation with builder pattern

use flotilla_supervisor::config::{Cluster, ConfigDocument, ServiceInstance, ServiceUrl};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Token every test cluster is given unless overridden, so fake health
/// endpoints know what to expect
pub const TEST_MANAGEMENT_TOKEN: &str = "test-management-token";

/// Builder for whole config documents
pub struct TestConfigBuilder {
    auto_reload: bool,
    clusters: BTreeMap<String, Cluster>,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            auto_reload: false,
            clusters: BTreeMap::new(),
        }
    }

    pub fn with_auto_reload(mut self, enabled: bool) -> Self {
        self.auto_reload = enabled;
        self
    }

    pub fn add_cluster(mut self, cluster: Cluster) -> Self {
        self.clusters.insert(cluster.cluster_id.clone(), cluster);
        self
    }

    pub fn build(self) -> ConfigDocument {
        ConfigDocument {
            auto_reload_config: self.auto_reload,
            clusters: self.clusters,
            extra: Default::default(),
        }
    }

    pub fn to_yaml(&self) -> String {
        let doc = ConfigDocument {
            auto_reload_config: self.auto_reload,
            clusters: self.clusters.clone(),
            extra: Default::default(),
        };
        serde_yaml::to_string(&doc).unwrap_or_default()
    }

    /// Write the config to `config.yml` in `dir` and return the path
    pub fn write_to_file(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join("config.yml");
        std::fs::write(&path, self.to_yaml())?;
        Ok(path)
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a single cluster entry
pub struct TestClusterBuilder {
    cluster: Cluster,
}

impl TestClusterBuilder {
    pub fn new(id: &str) -> Self {
        let mut cluster = Cluster {
            cluster_id: id.to_string(),
            ..Default::default()
        };
        cluster.management_token = TEST_MANAGEMENT_TOKEN.to_string();
        Self { cluster }
    }

    pub fn with_management_token(mut self, token: &str) -> Self {
        self.cluster.management_token = token.to_string();
        self
    }

    pub fn with_system_root_token(mut self, token: &str) -> Self {
        self.cluster.system_root_token = token.to_string();
        self
    }

    pub fn with_controller_url(mut self, url: ServiceUrl) -> Self {
        self.cluster
            .service_mut(flotilla_supervisor::config::services::CONTROLLER)
            .external_url = url;
        self
    }

    pub fn with_internal_url(mut self, service: &str, url: ServiceUrl) -> Self {
        self.cluster
            .service_mut(service)
            .internal_urls
            .insert(url, ServiceInstance::default());
        self
    }

    pub fn with_tls_insecure(mut self, insecure: bool) -> Self {
        self.cluster.tls.insecure = insecure;
        self
    }

    /// Point the cluster at an existing database
    pub fn with_database(mut self, host: &str, port: u16, user: &str, password: &str, dbname: &str) -> Self {
        let conn = &mut self.cluster.postgresql.connection;
        conn.host = host.to_string();
        conn.port = port.to_string();
        conn.user = user.to_string();
        conn.password = password.to_string();
        conn.dbname = dbname.to_string();
        self
    }

    pub fn build(self) -> Cluster {
        self.cluster
    }
}
