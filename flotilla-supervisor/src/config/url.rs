//! `ServiceUrl`, the endpoint value used for every service address in the
//! cluster config.

use reqwest::Url;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// An endpoint URL as written in the cluster config.
///
/// The empty string parses to the default value, which means "unset" and is
/// what autofill looks for. Parsing normalizes the host's case and drops a
/// port equal to the scheme default, so two spellings of one endpoint
/// compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceUrl(Option<Url>);

impl ServiceUrl {
    pub fn new(scheme: &str, host: &str, port: Option<u16>, path: &str) -> Result<Self, String> {
        let authority = match port {
            Some(p) => join_host_port(host, &p.to_string()),
            None if host.contains(':') => format!("[{}]", host),
            None => host.to_string(),
        };
        format!("{}://{}{}", scheme, authority, path).parse()
    }

    /// True if no URL has been configured
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn scheme(&self) -> &str {
        self.0.as_ref().map(Url::scheme).unwrap_or_default()
    }

    /// Host name or IP address, without IPv6 brackets
    pub fn hostname(&self) -> &str {
        let host = self.0.as_ref().and_then(Url::host_str).unwrap_or_default();
        host.strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
    }

    /// Port written in the URL, `None` when it is the scheme default
    pub fn port(&self) -> Option<u16> {
        self.0.as_ref().and_then(Url::port)
    }

    pub fn path(&self) -> &str {
        self.0.as_ref().map(Url::path).unwrap_or_default()
    }

    /// Explicit port, or the scheme's default
    pub fn port_or_default(&self) -> u16 {
        self.0
            .as_ref()
            .and_then(Url::port_or_known_default)
            .unwrap_or(80)
    }

    /// `host:port` (IPv6 hosts bracketed), omitting the port when unset
    pub fn authority(&self) -> String {
        let host = self.0.as_ref().and_then(Url::host_str).unwrap_or_default();
        match self.port() {
            Some(p) => format!("{}:{}", host, p),
            None => host.to_string(),
        }
    }

    /// `host:port` with the scheme default filled in, suitable for dialing
    pub fn dial_address(&self) -> String {
        join_host_port(self.hostname(), &self.port_or_default().to_string())
    }

    /// Same scheme and authority, different path
    pub fn with_path(&self, path: &str) -> ServiceUrl {
        let mut url = self.0.clone();
        if let Some(u) = url.as_mut() {
            u.set_path(path);
        }
        ServiceUrl(url)
    }
}

impl fmt::Display for ServiceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(url) => f.write_str(url.as_str()),
            None => Ok(()),
        }
    }
}

impl FromStr for ServiceUrl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(ServiceUrl::default());
        }
        let url = Url::parse(s).map_err(|e| format!("invalid URL {:?}: {}", s, e))?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(format!("invalid URL {:?}: missing host", s));
        }
        Ok(ServiceUrl(Some(url)))
    }
}

impl Serialize for ServiceUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ServiceUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Split `host:port`, `[v6]:port`, `:port` or `host:` into its two halves.
///
/// Unlike URL parsing, the colon is mandatory.
pub fn split_host_port(addr: &str) -> Result<(String, String), String> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| format!("address {}: missing ']'", addr))?;
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| format!("address {}: missing port", addr))?;
        return Ok((host.to_string(), port.to_string()));
    }
    match addr.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => {
            Err(format!("address {}: too many colons", addr))
        }
        Some((host, port)) => Ok((host.to_string(), port.to_string())),
        None => Err(format!("address {}: missing port", addr)),
    }
}

/// Inverse of [`split_host_port`]
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
