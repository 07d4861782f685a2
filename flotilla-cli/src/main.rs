mod commands;
mod config;
mod errors;

use std::io::Write;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use flotilla_supervisor::env::debug_requested;
use flotilla_supervisor::{ShutdownCause, Supervisor};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::commands::{BootArgs, Cli, Commands, LogFormat, normalize_args};
use crate::errors::CliError;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    let args = std::env::args_os().map(|a| a.to_string_lossy().into_owned());
    let cli = match Cli::try_parse_from(normalize_args(args)) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // 2 for usage errors, 0 for --help
            return ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(2));
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Version => print_version(),
        Commands::Boot(args) => {
            if args.print_version {
                return print_version();
            }
            init_logging(args.log_format);
            let result = boot(&args).await;
            if let Err(e) = &result {
                info!(error = %e, "exiting");
            }
            result
        }
    }
}

fn print_version() -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "flotilla {}", VERSION)?;
    Ok(())
}

/// `debug` when FLOTILLA_DEBUG asks for it, else RUST_LOG, else `info`
fn filter_directive(debug: bool, rust_log: Option<&str>) -> String {
    match rust_log {
        _ if debug => "debug".to_string(),
        Some(directive) if !directive.is_empty() => directive.to_string(),
        _ => "info".to_string(),
    }
}

fn init_logging(format: LogFormat) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directive = filter_directive(debug_requested(), rust_log.as_deref());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn boot(args: &BootArgs) -> Result<()> {
    let supervisor = Supervisor::start(config::supervisor_options(args), &CancellationToken::new());

    let ready = match args.timeout {
        Some(limit) => match tokio::time::timeout(limit, supervisor.wait_ready()).await {
            Ok(ready) => ready,
            Err(_) => {
                let _ = supervisor.stop().await;
                return Err(CliError::ReadyTimeout(limit).into());
            }
        },
        None => supervisor.wait_ready().await,
    };
    let Some(url) = ready else {
        let cause = supervisor.wait().await.err().unwrap_or(ShutdownCause::Cancelled);
        return Err(CliError::StartupFailed(cause).into());
    };

    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", url)?;
        stdout.flush()?;
    }

    if args.shutdown {
        // Whatever stopped the children, startup itself succeeded
        let _ = supervisor.stop().await;
        eprintln!("PASS - all services booted successfully");
        return Ok(());
    }

    supervisor.wait().await.map_err(CliError::from)?;
    Ok(())
}
