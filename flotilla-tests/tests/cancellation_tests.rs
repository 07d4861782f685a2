//! Stopping children that ignore SIGTERM

use flotilla_supervisor::SupervisorError;
use flotilla_supervisor::env::Environ;
use flotilla_supervisor::logs::LogSink;
use flotilla_supervisor::process::{DEFAULT_GRACE, ProgramRunner, RunOptions};
use flotilla_tests::MarkerFileHelper;
use flotilla_unix::process::is_alive;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const STUBBORN: &str = "trap '' TERM; echo $$ > \"$PIDFILE\"; while :; do sleep 0.1; done";
const POLITE: &str = "echo $$ > \"$PIDFILE\"; exec sleep 60";

async fn run_until_cancelled(script: &'static str, grace: Duration) -> (Duration, u32) {
    let dir = tempfile::tempdir().unwrap();
    let markers = MarkerFileHelper::new(dir.path());
    let pidfile = markers.marker_path("pid");
    let runner = ProgramRunner::new(dir.path(), Environ::inherit(), LogSink::null()).with_grace(grace);

    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let cancel = cancel.clone();
        let dir = dir.path().to_path_buf();
        let opts = RunOptions::new().env("PIDFILE", pidfile.display().to_string());
        async move { runner.run(&cancel, &dir, opts, "sh", &["-c", script]).await }
    });

    let pid: u32 = markers
        .wait_for_marker_content("pid", Duration::from_secs(5))
        .await
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(is_alive(pid));

    let cancelled_at = Instant::now();
    cancel.cancel();
    let result = tokio::time::timeout(grace + Duration::from_secs(5), run)
        .await
        .expect("runner did not return")
        .unwrap();
    let elapsed = cancelled_at.elapsed();
    assert!(matches!(result, Err(SupervisorError::Cancelled)), "{result:?}");
    (elapsed, pid)
}

#[tokio::test]
async fn test_sigterm_ignoring_child_is_killed_after_grace() {
    let (elapsed, pid) = run_until_cancelled(STUBBORN, DEFAULT_GRACE).await;

    assert!(
        elapsed >= DEFAULT_GRACE - Duration::from_millis(500),
        "returned after {elapsed:?}"
    );
    assert!(
        elapsed <= DEFAULT_GRACE + Duration::from_millis(500),
        "returned after {elapsed:?}"
    );
    assert!(!is_alive(pid));
}

#[tokio::test]
async fn test_cooperative_child_exits_promptly() {
    let (elapsed, pid) = run_until_cancelled(POLITE, DEFAULT_GRACE).await;

    assert!(elapsed < Duration::from_secs(1), "returned after {elapsed:?}");
    assert!(!is_alive(pid));
}
