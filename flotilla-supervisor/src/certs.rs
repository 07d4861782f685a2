//! Self-signed TLS material for an ephemeral cluster: a root CA and one
//! server certificate signed by it.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::info;

use crate::errors::Result;
use crate::task::{OneShot, RunContext};

pub const TASK_NAME: &str = "certificates";

const VALID_BEFORE_DAYS: i64 = 3;
const VALID_YEARS: i64 = 20;

/// Where [`materialize`] put its output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub ca_key: PathBuf,
    pub ca_cert: PathBuf,
    pub server_key: PathBuf,
    pub server_csr: PathBuf,
    pub server_cert: PathBuf,
}

impl CertPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            ca_key: dir.join("rootCA.key"),
            ca_cert: dir.join("rootCA.crt"),
            server_key: dir.join("server.key"),
            server_csr: dir.join("server.csr"),
            server_cert: dir.join("server.crt"),
        }
    }
}

/// Names the server certificate is valid for: the loopback names plus
/// `listen_host`, unless that is a wildcard address.
pub fn subject_alt_names(listen_host: &str) -> Vec<SanType> {
    let mut dns: BTreeSet<String> = BTreeSet::new();
    let mut ips: BTreeSet<IpAddr> = BTreeSet::new();
    dns.insert("localhost".to_string());
    ips.insert(IpAddr::from([127, 0, 0, 1]));
    ips.insert(IpAddr::V6(std::net::Ipv6Addr::LOCALHOST));

    let host = listen_host.trim().trim_start_matches('[').trim_end_matches(']');
    if !host.is_empty() {
        match host.parse::<IpAddr>() {
            Ok(ip) if ip.is_unspecified() => {}
            Ok(ip) => {
                ips.insert(ip);
            }
            Err(_) => {
                dns.insert(host.to_ascii_lowercase());
            }
        }
    }

    let mut sans = Vec::new();
    for name in dns {
        if let Ok(name) = name.try_into() {
            sans.push(SanType::DnsName(name));
        }
    }
    sans.extend(ips.into_iter().map(SanType::IpAddress));
    sans
}

/// Generate the CA and server files in `dir`. Existing files are replaced.
pub fn materialize(dir: &Path, listen_host: &str) -> Result<CertPaths> {
    let paths = CertPaths::in_dir(dir);
    let now = OffsetDateTime::now_utc();
    let not_before = now - TimeDuration::days(VALID_BEFORE_DAYS);
    let not_after = now + TimeDuration::days(365 * VALID_YEARS);

    let ca_key = KeyPair::generate()?;
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    ca_params.not_before = not_before;
    ca_params.not_after = not_after;
    ca_params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "flotilla test root CA");
        dn
    };
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let server_key = KeyPair::generate()?;
    let mut server_params = CertificateParams::default();
    server_params.subject_alt_names = subject_alt_names(listen_host);
    server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    server_params.not_before = not_before;
    server_params.not_after = not_after;
    server_params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "localhost");
        dn
    };
    let csr_pem = server_params.serialize_request(&server_key)?.pem()?;
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key)?;

    std::fs::create_dir_all(dir)?;
    write_private(&paths.ca_key, &ca_key.serialize_pem())?;
    std::fs::write(&paths.ca_cert, ca_cert.pem())?;
    write_private(&paths.server_key, &server_key.serialize_pem())?;
    std::fs::write(&paths.server_csr, csr_pem)?;
    std::fs::write(&paths.server_cert, server_cert.pem())?;
    Ok(paths)
}

fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// One-shot task writing the certificates into the run's temp dir
#[derive(Debug, Default)]
pub struct CreateCertificates;

#[async_trait]
impl OneShot for CreateCertificates {
    fn name(&self) -> String {
        TASK_NAME.to_string()
    }

    async fn run(&self, ctx: &RunContext) -> Result<()> {
        let dir = ctx.setup().temp_dir.clone();
        let host = ctx.setup().listen_host.clone();
        let paths = tokio::task::spawn_blocking(move || materialize(&dir, &host))
            .await
            .map_err(|e| crate::errors::SupervisorError::Internal(e.to_string()))??;
        info!(cert = %paths.server_cert.display(), "certificates ready");
        Ok(())
    }
}
