use super::*;
use crate::env::Environ;
use crate::errors::SupervisorError;
use crate::logs::LogSink;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn runner(root: &Path) -> (ProgramRunner, crate::logs::SharedBuffer) {
    let (sink, buf) = LogSink::capture();
    let mut env = Environ::inherit();
    env.set("K", "a");
    (ProgramRunner::new(root, env, sink), buf)
}

#[tokio::test]
async fn test_stdout_and_stderr_are_tagged() {
    let tmp = tempfile::tempdir().unwrap();
    let (runner, buf) = runner(tmp.path());
    runner
        .run(
            &CancellationToken::new(),
            tmp.path(),
            RunOptions::new(),
            "sh",
            &["-c", "echo out; echo err >&2"],
        )
        .await
        .unwrap();

    let logged = buf.contents();
    assert!(logged.contains("[sh] out\n"), "{logged}");
    assert!(logged.contains("[sh] err\n"), "{logged}");
}

#[tokio::test]
async fn test_output_sink_receives_raw_stdout() {
    let tmp = tempfile::tempdir().unwrap();
    let (runner, logged) = runner(tmp.path());
    let (out, captured) = LogSink::capture();
    runner
        .run(
            &CancellationToken::new(),
            tmp.path(),
            RunOptions::new().output(out),
            "sh",
            &["-c", "printf 'a\\nb\\n'"],
        )
        .await
        .unwrap();
    assert_eq!(captured.contents(), "a\nb\n");
    assert!(!logged.contents().contains("a\n"));
}

#[tokio::test]
async fn test_caller_env_overrides_inherited() {
    let tmp = tempfile::tempdir().unwrap();
    let (runner, _) = runner(tmp.path());
    let (out, captured) = LogSink::capture();
    runner
        .run(
            &CancellationToken::new(),
            tmp.path(),
            RunOptions::new().env("K", "b").output(out),
            "sh",
            &["-c", "echo $K"],
        )
        .await
        .unwrap();
    assert_eq!(captured.contents(), "b\n");
}

#[tokio::test]
async fn test_inherited_env_is_passed() {
    let tmp = tempfile::tempdir().unwrap();
    let (runner, _) = runner(tmp.path());
    let (out, captured) = LogSink::capture();
    runner
        .run(
            &CancellationToken::new(),
            tmp.path(),
            RunOptions::new().output(out),
            "sh",
            &["-c", "echo $K"],
        )
        .await
        .unwrap();
    assert_eq!(captured.contents(), "a\n");
}

#[tokio::test]
async fn test_relative_dir_resolves_against_source_root() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("sub")).unwrap();
    let (runner, _) = runner(tmp.path());
    let (out, captured) = LogSink::capture();
    runner
        .run(
            &CancellationToken::new(),
            "sub",
            RunOptions::new().output(out),
            "pwd",
            &[] as &[&str],
        )
        .await
        .unwrap();
    let expected = tmp.path().join("sub").canonicalize().unwrap();
    assert_eq!(
        Path::new(captured.contents().trim()).canonicalize().unwrap(),
        expected
    );
}

#[tokio::test]
async fn test_stdin_is_fed() {
    let tmp = tempfile::tempdir().unwrap();
    let (runner, _) = runner(tmp.path());
    let (out, captured) = LogSink::capture();
    runner
        .run(
            &CancellationToken::new(),
            tmp.path(),
            RunOptions::new().stdin("hello").output(out),
            "cat",
            &[] as &[&str],
        )
        .await
        .unwrap();
    assert_eq!(captured.contents(), "hello");
}

#[tokio::test]
async fn test_unread_stdin_does_not_hold_up_return() {
    let tmp = tempfile::tempdir().unwrap();
    let (runner, _) = runner(tmp.path());
    let (out, captured) = LogSink::capture();
    let input = vec![b'x'; 4 << 20];
    tokio::time::timeout(
        Duration::from_secs(10),
        runner.run(
            &CancellationToken::new(),
            tmp.path(),
            RunOptions::new().stdin(input).output(out),
            "head",
            &["-c", "5"],
        ),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(captured.contents(), "xxxxx");
}

#[tokio::test]
async fn test_nonzero_exit_is_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let (runner, _) = runner(tmp.path());
    let err = runner
        .run(
            &CancellationToken::new(),
            tmp.path(),
            RunOptions::new(),
            "sh",
            &["-c", "exit 3"],
        )
        .await
        .unwrap_err();
    match err {
        SupervisorError::ChildFailed { command, status } => {
            assert!(command.contains("exit 3"));
            assert_eq!(status.code(), Some(3));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_missing_program_fails_to_start() {
    let tmp = tempfile::tempdir().unwrap();
    let (runner, _) = runner(tmp.path());
    let err = runner
        .run(
            &CancellationToken::new(),
            tmp.path(),
            RunOptions::new(),
            "flotilla-no-such-program",
            &[] as &[&str],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::ChildStart { .. }), "{err}");
}

#[tokio::test]
async fn test_cancel_returns_cancelled() {
    let tmp = tempfile::tempdir().unwrap();
    let (runner, _) = runner(tmp.path());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let err = runner
        .run(&cancel, tmp.path(), RunOptions::new(), "sleep", &["30"])
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_sigterm_ignored_escalates_after_grace() {
    let tmp = tempfile::tempdir().unwrap();
    let pidfile = tmp.path().join("child.pid");
    let (runner, logged) = runner(tmp.path());
    let cancel = CancellationToken::new();

    let script = format!(
        "trap '' TERM; echo $$ > {}; while true; do sleep 1; done",
        pidfile.display()
    );
    let run = {
        let cancel = cancel.clone();
        let runner = runner.clone();
        let dir = tmp.path().to_path_buf();
        tokio::spawn(async move {
            runner
                .run(&cancel, &dir, RunOptions::new(), "sh", &["-c", script.as_str()])
                .await
        })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while !pidfile.exists() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let pid: u32 = std::fs::read_to_string(&pidfile).unwrap().trim().parse().unwrap();

    let cancelled_at = Instant::now();
    cancel.cancel();
    let result = run.await.unwrap();
    let elapsed = cancelled_at.elapsed();

    assert!(result.unwrap_err().is_cancelled());
    assert!(
        elapsed >= Duration::from_millis(4500) && elapsed <= Duration::from_millis(5500),
        "returned after {:?}",
        elapsed
    );
    assert!(!flotilla_unix::process::is_alive(pid));
    assert!(logged.contents().is_empty());
}

#[tokio::test]
async fn test_short_grace_is_honored() {
    let tmp = tempfile::tempdir().unwrap();
    let (runner, _) = runner(tmp.path());
    let runner = runner.with_grace(Duration::from_millis(300));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let err = runner
        .run(
            &cancel,
            tmp.path(),
            RunOptions::new(),
            "sh",
            &["-c", "trap '' TERM; while true; do sleep 1; done"],
        )
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_tag_plain_program() {
    assert_eq!(log_tag("nginx", &["-g", "daemon off;"], "/tmp", &[]), "nginx");
}

#[test]
fn test_tag_strips_bin_dirs() {
    let strip = vec!["/var/lib/flotilla/bin/".to_string(), "/tmp/x/bin/".to_string()];
    assert_eq!(log_tag("/tmp/x/bin/keepstore", &[] as &[&str], "/", &strip), "keepstore");
    assert_eq!(
        log_tag("/var/lib/flotilla/bin/gem", &["env"], "/", &strip),
        "gem"
    );
}

#[test]
fn test_tag_root_server_uses_component() {
    let strip = vec!["/tmp/x/bin/".to_string()];
    assert_eq!(
        log_tag("/tmp/x/bin/cluster-server", &["controller", "-config", "c.yml"], "/", &strip),
        "controller"
    );
    // bare invocation keeps the binary name
    assert_eq!(log_tag(ROOT_SERVER, &["version"], "/", &strip), ROOT_SERVER);
}

#[test]
fn test_tag_sudo_skips_options() {
    assert_eq!(
        log_tag("sudo", &["-u", "www-data", "-E", "HOME=/var/www", "gem", "env"], "/", &[]),
        "gem"
    );
}

#[test]
fn test_tag_bundle_exec() {
    assert_eq!(
        log_tag("bundle", &["exec", "passenger", "start"], "/src/services/api", &[]),
        "passenger@api"
    );
    assert_eq!(
        log_tag("bundle", &["exec", "rake", "db:migrate"], "services/api", &[]),
        "services/api: rake@api"
    );
}

#[test]
fn test_tag_relative_dir() {
    assert_eq!(log_tag("go", &["install"], "cmd/server", &[]), "cmd/server: go");
}
