use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::tag::log_tag;
use crate::env::{Environ, dedup_env};
use crate::errors::{Result, SupervisorError};
use crate::logs::LogSink;

/// Time between SIGTERM and SIGKILL when a child is cancelled
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Per-call options for [`ProgramRunner::run`]
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Where the child's stdout goes; tagged log stream if unset
    pub output: Option<LogSink>,
    /// `KEY=value` entries that win over the inherited environment
    pub env: Vec<String>,
    /// Run as this user (name, uid, or uid:gid)
    pub user: Option<String>,
    pub stdin: Option<Vec<u8>>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn env(mut self, key: &str, value: impl AsRef<str>) -> Self {
        self.env.push(format!("{}={}", key, value.as_ref()));
        self
    }

    pub fn output(mut self, sink: LogSink) -> Self {
        self.output = Some(sink);
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

/// Launches child processes on behalf of tasks.
///
/// Cheap to clone; every clone shares the environment and log sink.
#[derive(Debug, Clone)]
pub struct ProgramRunner {
    source_root: PathBuf,
    environ: Arc<Environ>,
    log_sink: LogSink,
    strip_prefixes: Vec<String>,
    grace: Duration,
}

impl ProgramRunner {
    pub fn new(source_root: impl Into<PathBuf>, environ: Environ, log_sink: LogSink) -> Self {
        Self {
            source_root: source_root.into(),
            environ: Arc::new(environ),
            log_sink,
            strip_prefixes: Vec::new(),
            grace: DEFAULT_GRACE,
        }
    }

    /// Directories whose prefix is dropped from program names in log tags
    pub fn with_bin_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.strip_prefixes = dirs
            .into_iter()
            .map(|d| format!("{}/", d.as_ref().display().to_string().trim_end_matches('/')))
            .collect();
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn environ(&self) -> &Environ {
        &self.environ
    }

    pub fn log_sink(&self) -> &LogSink {
        &self.log_sink
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Absolute dirs are used as given; relative ones hang off the source root
    pub fn resolve_dir(&self, dir: &Path) -> PathBuf {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.source_root.join(dir)
        }
    }

    /// Run `program` in `dir` until it exits or `cancel` fires.
    ///
    /// Returns `Cancelled` whenever `cancel` fired, even if the cancellation
    /// is what made the child exit, so callers can tell a requested stop
    /// from a crash.
    pub async fn run<S: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        dir: impl AsRef<Path>,
        opts: RunOptions,
        program: &str,
        args: &[S],
    ) -> Result<()> {
        let dir_arg = dir.as_ref();
        let cmdline = format_cmdline(program, args);
        let workdir = self.resolve_dir(dir_arg);
        info!(command = %cmdline, dir = %dir_arg.display(), "executing");

        let tag = log_tag(
            program,
            args,
            &dir_arg.display().to_string(),
            &self.strip_prefixes,
        );
        let prefix = format!("[{}] ", tag);

        let resolved = self
            .environ
            .look_path(program, &workdir)
            .unwrap_or_else(|| PathBuf::from(program));
        let mut cmd = Command::new(&resolved);
        cmd.args(args.iter().map(|a| a.as_ref()))
            .current_dir(&workdir)
            .env_clear()
            .envs(dedup_env(opts.env.iter().chain(self.environ.entries())))
            .stdin(if opts.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so termination reaches anything a wrapper forks
        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(unix)]
        if let Some(ref user) = opts.user {
            let resolved_user = flotilla_unix::users::resolve_user(user, None)?;
            debug!(uid = resolved_user.uid, gid = resolved_user.gid, "dropping privileges");
            cmd.uid(resolved_user.uid).gid(resolved_user.gid);
        }

        let mut child = cmd.spawn().map_err(|e| SupervisorError::ChildStart {
            command: cmdline.clone(),
            source: e,
        })?;
        let pid = child.id();

        let stdin_task = match (opts.stdin, child.stdin.take()) {
            (Some(input), Some(mut stdin)) => Some(tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&input).await {
                    debug!(error = %err, "child stopped reading stdin");
                }
            })),
            _ => None,
        };

        let force_close = CancellationToken::new();
        let stderr_writer: Box<dyn Write + Send> = Box::new(self.log_sink.prefixed(prefix.clone()));
        let stdout_writer: Box<dyn Write + Send> = match opts.output {
            Some(sink) => Box::new(sink),
            None => Box::new(self.log_sink.prefixed(prefix)),
        };
        let stdout_task = tokio::spawn(copy_output(
            child.stdout.take(),
            stdout_writer,
            force_close.clone(),
        ));
        let stderr_task = tokio::spawn(copy_output(
            child.stderr.take(),
            stderr_writer,
            force_close.clone(),
        ));

        let exited = CancellationToken::new();
        let _exited_guard = exited.clone().drop_guard();
        let watchdog_task = pid.map(|pid| {
            tokio::spawn(watchdog(Watchdog {
                cancel: cancel.clone(),
                exited: exited.clone(),
                force_close,
                pid,
                grace: self.grace,
                cmdline: cmdline.clone(),
                dir: dir_arg.display().to_string(),
            }))
        });

        let _ = stdout_task.await;
        let _ = stderr_task.await;
        let status = child.wait().await;
        exited.cancel();
        for task in [stdin_task, watchdog_task].into_iter().flatten() {
            let _ = task.await;
        }

        if cancel.is_cancelled() {
            return Err(SupervisorError::Cancelled);
        }
        let status = status?;
        if !status.success() {
            return Err(SupervisorError::ChildFailed {
                command: cmdline,
                status,
            });
        }
        Ok(())
    }
}

fn format_cmdline<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    let mut parts = vec![program];
    parts.extend(args.iter().map(|a| a.as_ref()));
    format!("[{}]", parts.join(" "))
}

/// Drain `reader` into `writer` until EOF or until `force_close` fires.
///
/// A failing writer does not stop the drain; the child must never block on
/// a full pipe.
async fn copy_output<R>(
    reader: Option<R>,
    mut writer: Box<dyn Write + Send>,
    force_close: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0u8; 8192];
    let mut writable = true;
    loop {
        let n = tokio::select! {
            _ = force_close.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        if writable && writer.write_all(&buf[..n]).is_err() {
            writable = false;
        }
    }
    let _ = writer.flush();
}

struct Watchdog {
    cancel: CancellationToken,
    exited: CancellationToken,
    force_close: CancellationToken,
    pid: u32,
    grace: Duration,
    cmdline: String,
    dir: String,
}

/// On cancellation: SIGTERM the child's group, and if it is still around
/// after the grace period, close its pipes and SIGKILL it.
async fn watchdog(w: Watchdog) {
    tokio::select! {
        _ = w.exited.cancelled() => return,
        _ = w.cancel.cancelled() => {}
    }

    debug!(pid = w.pid, command = %w.cmdline, "sending SIGTERM");
    #[cfg(unix)]
    let _ = flotilla_unix::process::send_group_signal(
        w.pid,
        flotilla_unix::process::UnixSignal::SIGTERM,
    );

    tokio::select! {
        _ = w.exited.cancelled() => return,
        _ = tokio::time::sleep(w.grace) => {}
    }

    w.force_close.cancel();
    warn!(
        pid = w.pid,
        dir = %w.dir,
        cmdline = %w.cmdline,
        "still waiting for child process to exit {}s after SIGTERM",
        w.grace.as_secs()
    );
    #[cfg(unix)]
    let _ = flotilla_unix::process::send_group_signal(
        w.pid,
        flotilla_unix::process::UnixSignal::SIGKILL,
    );
}
