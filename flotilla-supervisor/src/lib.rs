//! Boots a development or test cluster: fills in the cluster config, starts
//! every service in dependency order, waits for the fleet to report healthy
//! and tears it all down again on a signal, a config change or a failure.

pub mod certs;
pub mod config;
pub mod dblock;
pub mod env;
pub mod errors;
pub mod health;
pub mod logs;
pub mod migrate;
pub mod plan;
pub mod process;
pub mod supervisor;
pub mod task;
pub mod watcher;

pub use config::{ClusterType, ConfigSource};
pub use errors::{Result, ShutdownCause, SupervisorError};
pub use supervisor::{Supervisor, SupervisorOptions, SupervisorState};
