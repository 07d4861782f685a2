//! The fixed set of services a cluster config knows about

pub const CONTROLLER: &str = "Controller";
pub const RAILS_API: &str = "RailsAPI";
pub const WEBSOCKET: &str = "Websocket";
pub const KEEPPROXY: &str = "Keepproxy";
pub const KEEPSTORE: &str = "Keepstore";
pub const KEEPBALANCE: &str = "Keepbalance";
pub const WEBDAV: &str = "WebDAV";
pub const WEBDAV_DOWNLOAD: &str = "WebDAVDownload";
pub const GIT_HTTP: &str = "GitHTTP";
pub const HEALTH: &str = "Health";
pub const DISPATCH_CLOUD: &str = "DispatchCloud";
pub const WORKBENCH1: &str = "Workbench1";
pub const WORKBENCH2: &str = "Workbench2";

/// How a service is advertised to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exposure {
    /// `https://host:port/`
    Https,
    /// `wss://host:port/websocket`
    Websocket,
    /// Internal only; no ExternalURL is synthesized
    Internal,
}

impl Exposure {
    pub fn scheme(self) -> Option<&'static str> {
        match self {
            Exposure::Https => Some("https"),
            Exposure::Websocket => Some("wss"),
            Exposure::Internal => None,
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            Exposure::Websocket => "/websocket",
            _ => "/",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KnownService {
    pub name: &'static str,
    pub exposure: Exposure,
    /// Polled by the health aggregator when it has InternalURLs
    pub health_checked: bool,
    /// Gets URLs synthesized by autofill when none are configured
    pub autofill: bool,
}

pub static KNOWN_SERVICES: &[KnownService] = &[
    KnownService { name: CONTROLLER, exposure: Exposure::Https, health_checked: true, autofill: true },
    KnownService { name: DISPATCH_CLOUD, exposure: Exposure::Internal, health_checked: true, autofill: true },
    KnownService { name: GIT_HTTP, exposure: Exposure::Https, health_checked: true, autofill: true },
    KnownService { name: HEALTH, exposure: Exposure::Https, health_checked: true, autofill: true },
    KnownService { name: KEEPBALANCE, exposure: Exposure::Internal, health_checked: true, autofill: false },
    KnownService { name: KEEPPROXY, exposure: Exposure::Https, health_checked: true, autofill: true },
    KnownService { name: KEEPSTORE, exposure: Exposure::Internal, health_checked: true, autofill: true },
    KnownService { name: RAILS_API, exposure: Exposure::Internal, health_checked: true, autofill: true },
    KnownService { name: WEBDAV, exposure: Exposure::Https, health_checked: true, autofill: true },
    KnownService { name: WEBDAV_DOWNLOAD, exposure: Exposure::Https, health_checked: false, autofill: true },
    KnownService { name: WEBSOCKET, exposure: Exposure::Websocket, health_checked: true, autofill: true },
    KnownService { name: WORKBENCH1, exposure: Exposure::Https, health_checked: true, autofill: true },
    KnownService { name: WORKBENCH2, exposure: Exposure::Https, health_checked: false, autofill: true },
];

pub fn lookup(name: &str) -> Option<&'static KnownService> {
    KNOWN_SERVICES.iter().find(|s| s.name == name)
}
