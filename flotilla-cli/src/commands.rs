use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use flotilla_supervisor::config::{ClusterType, parse_duration};

/// Flotilla - boots a whole development or test cluster from one config file
#[derive(Parser, Debug)]
#[command(name = "flotilla")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start every service of a cluster and keep it running until signalled
    Boot(BootArgs),

    /// Print version information
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct BootArgs {
    /// Config file, or "-" to read it from stdin
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Source tree to build and run from (default ".", or the enclosing
    /// git checkout in test mode)
    #[arg(long, value_name = "DIR")]
    pub source: Option<PathBuf>,

    /// Cluster type: development, test or production
    #[arg(long = "type", value_name = "TYPE", default_value = "production")]
    pub cluster_type: ClusterType,

    /// Listen address for synthesized endpoints (default: the controller's
    /// ExternalURL host, else 0.0.0.0)
    #[arg(long, value_name = "HOST", default_value = "")]
    pub listen_host: String,

    /// Controller ExternalURL host:port when not configured; port 0 picks one
    #[arg(long, value_name = "HOST:PORT", default_value = "")]
    pub controller_address: String,

    /// Run a throwaway PostgreSQL server instead of using the configured one
    #[arg(long)]
    pub own_temporary_database: bool,

    /// workbench2 checkout to run the dev server from
    #[arg(long, value_name = "DIR")]
    pub workbench2_source: Option<PathBuf>,

    /// Do not run workbench1
    #[arg(long)]
    pub no_workbench1: bool,

    /// Do not run workbench2
    #[arg(long)]
    pub no_workbench2: bool,

    /// Shut down and exit 0 as soon as the cluster is ready
    #[arg(long)]
    pub shutdown: bool,

    /// Give up and exit 1 if the cluster is not ready in time (e.g. 10m)
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Format of the supervisor's own log lines
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Print version information and exit
    #[arg(long = "version")]
    pub print_version: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Accept Go-style single-dash long flags (`-config x`) by rewriting them
/// to `--config x`. Arguments after `--` are left alone.
pub fn normalize_args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out = Vec::new();
    let mut passthrough = false;
    for (i, arg) in args.into_iter().map(Into::into).enumerate() {
        if i == 0 || passthrough {
            out.push(arg);
            continue;
        }
        if arg == "--" {
            passthrough = true;
            out.push(arg);
            continue;
        }
        let single_dash_long = arg.len() > 2
            && arg.starts_with('-')
            && !arg.starts_with("--")
            && arg[1..].starts_with(|c: char| c.is_ascii_alphabetic());
        if single_dash_long {
            out.push(format!("-{}", arg));
        } else {
            out.push(arg);
        }
    }
    out
}
