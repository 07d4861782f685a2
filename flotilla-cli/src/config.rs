use flotilla_supervisor::config::ConfigSource;
use flotilla_supervisor::env::CONFIG_ENV;
use flotilla_supervisor::logs::LogSink;
use flotilla_supervisor::task::PlanOptions;
use flotilla_supervisor::SupervisorOptions;

use crate::commands::BootArgs;

/// Used when neither `-config` nor the environment names a file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/flotilla/config.yml";

/// `-config` if given, else the path in the environment, else the default
pub fn resolve_config_source(arg: Option<&str>, env_value: Option<&str>) -> ConfigSource {
    match arg.or(env_value.filter(|v| !v.is_empty())) {
        Some(value) => ConfigSource::from_arg(value),
        None => ConfigSource::from_arg(DEFAULT_CONFIG_PATH),
    }
}

/// Supervisor options for a `boot` invocation
pub fn supervisor_options(args: &BootArgs) -> SupervisorOptions {
    let env_config = std::env::var(CONFIG_ENV).ok();
    let mut opts = SupervisorOptions::new(resolve_config_source(
        args.config.as_deref(),
        env_config.as_deref(),
    ));
    opts.cluster_type = args.cluster_type;
    opts.source_path = args.source.clone();
    opts.listen_host = args.listen_host.clone();
    opts.controller_address = args.controller_address.clone();
    opts.plan_options = PlanOptions {
        no_workbench1: args.no_workbench1,
        no_workbench2: args.no_workbench2,
        workbench2_source: args.workbench2_source.clone(),
        own_temporary_database: args.own_temporary_database,
    };
    opts.log_sink = LogSink::stderr();
    opts
}
