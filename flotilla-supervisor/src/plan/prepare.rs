//! Steps that run once before the task graph starts and may change the
//! environment every child inherits.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{Result, SupervisorError};
use crate::logs::LogSink;
use crate::process::{ROOT_SERVER, RunOptions};
use crate::task::{PRODUCTION_BIN_DIR, RunSetup};

/// Appended to the commit hash when the working tree has local changes
pub const DIRTY_SUFFIX: &str = "+uncommitted";

/// Run a command in the source tree and return its stdout
async fn capture<S: AsRef<str>>(
    setup: &RunSetup,
    cancel: &CancellationToken,
    opts: RunOptions,
    program: &str,
    args: &[S],
) -> Result<String> {
    let (sink, buf) = LogSink::capture();
    setup
        .runner()
        .run(cancel, ".", opts.output(sink), program, args)
        .await?;
    Ok(buf.contents())
}

/// Fill in `setup.source_version`.
///
/// With nothing requested, production leaves it empty and every other
/// cluster type uses the checked-out commit, marked dirty if the tree has
/// uncommitted changes. Production cannot run a requested version.
pub async fn resolve_source_version(
    setup: &mut RunSetup,
    cancel: &CancellationToken,
    requested: &str,
) -> Result<()> {
    if !requested.is_empty() {
        if setup.cluster_type.is_production() {
            return Err(SupervisorError::Config(
                "specifying a version to run is not yet supported".to_string(),
            ));
        }
        setup.source_version = requested.to_string();
        return Ok(());
    }
    if setup.cluster_type.is_production() {
        return Ok(());
    }

    let diff = capture(setup, cancel, RunOptions::new(), "git", &["diff", "--shortstat"]).await?;
    let dirty = !diff.trim().is_empty();
    let head = capture(setup, cancel, RunOptions::new(), "git", &["log", "-n1", "--format=%H"]).await?;
    let mut version = head.trim().to_string();
    if dirty {
        version.push_str(DIRTY_SUFFIX);
    }
    info!(version = %version, "source version");
    setup.source_version = version;
    Ok(())
}

/// Build the root server into the bin dir from source. Production uses
/// the preinstalled binary. Returns the binary's path either way.
pub async fn install_root_server(setup: &RunSetup, cancel: &CancellationToken) -> Result<PathBuf> {
    let bin = setup.bin_dir.join(ROOT_SERVER);
    if setup.cluster_type.is_production() {
        return Ok(bin);
    }
    let ldflags = format!("-X main.version={}", setup.source_version);
    let src = Path::new("cmd").join(ROOT_SERVER);
    setup
        .runner()
        .run(
            cancel,
            &src,
            RunOptions::new().env("GOBIN", setup.bin_dir.display().to_string()),
            "go",
            &["install", "-ldflags", &ldflags],
        )
        .await?;
    Ok(bin)
}

/// Point gem installs at a per-user gem path and set `HOME`.
///
/// An rvm-managed shell is trusted as is; only `HOME` is touched.
pub async fn setup_ruby_env(setup: &mut RunSetup, cancel: &CancellationToken) -> Result<()> {
    if setup.environ.get("rvm_path").is_none_or(str::is_empty) {
        setup.environ.clean(&["GEM_HOME=", "GEM_PATH="]);

        let preinstalled = Path::new(PRODUCTION_BIN_DIR).join("gem");
        let gem = if setup.cluster_type.is_production() || preinstalled.exists() {
            preinstalled.display().to_string()
        } else {
            "gem".to_string()
        };
        let output = if setup.cluster_type.is_production() {
            let args = ["-u", "www-data", "-E", "HOME=/var/www", gem.as_str(), "env", "gempath"];
            capture(setup, cancel, RunOptions::new(), "sudo", &args).await
        } else {
            capture(setup, cancel, RunOptions::new(), &gem, &["env", "gempath"]).await
        }?;
        let gempath = first_gem_path(&output).ok_or_else(|| {
            SupervisorError::Config("gem env gempath: empty output".to_string())
        })?;
        debug!(gempath = %gempath, "using gem path");
        setup.environ.prepend("PATH", &format!("{}/bin:", gempath));
        setup.environ.set("GEM_HOME", &gempath);
        setup.environ.set("GEM_PATH", &gempath);
    }

    let home = flotilla_unix::users::current_user_home()?;
    setup.environ.set("HOME", &home.display().to_string());
    Ok(())
}

/// First entry of a `:`-separated `gem env gempath` line
pub fn first_gem_path(output: &str) -> Option<String> {
    let first = output.trim().split(':').next()?.trim();
    if first.is_empty() {
        None
    } else {
        Some(first.to_string())
    }
}
