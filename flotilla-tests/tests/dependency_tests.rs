//! Startup ordering between dependent tasks

use flotilla_tests::{ScriptPlan, ScriptService, ScriptTask, TestClusterBuilder, TestConfigBuilder, TestSupervisor};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const BOOT_TIMEOUT: Duration = Duration::from_secs(15);

fn config() -> TestConfigBuilder {
    TestConfigBuilder::new().add_cluster(TestClusterBuilder::new("zzzzz").build())
}

#[tokio::test]
async fn test_dependent_starts_after_dependency_returns() {
    let mut harness = TestSupervisor::new().unwrap();
    let markers = harness.markers();
    let dir = harness.work_dir().to_path_buf();
    let plan = ScriptPlan::new()
        .one_shot(ScriptTask::new("b", &dir, markers.timestamp_command("b-entered")).after("a"))
        .one_shot(ScriptTask::new(
            "a",
            &dir,
            format!("sleep 0.05; {}", markers.timestamp_command("a-returned")),
        ));
    harness.start(&config(), plan).unwrap();
    harness.wait_ready(BOOT_TIMEOUT).await.unwrap();

    let a = markers.read_timestamps("a-returned");
    let b = markers.read_timestamps("b-entered");
    assert_eq!((a.len(), b.len()), (1, 1));
    assert!(b[0] >= a[0], "b entered at {} before a returned at {}", b[0], a[0]);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_diamond_runs_each_task_once() {
    let mut harness = TestSupervisor::new().unwrap();
    let markers = harness.markers();
    let dir = harness.work_dir().to_path_buf();
    let plan = ScriptPlan::new()
        .one_shot(ScriptTask::new("root", &dir, markers.timestamp_command("root")))
        .one_shot(ScriptTask::new("left", &dir, markers.timestamp_command("left")).after("root"))
        .one_shot(ScriptTask::new("right", &dir, markers.timestamp_command("right")).after("root"))
        .one_shot(
            ScriptTask::new("join", &dir, markers.timestamp_command("join"))
                .after("left")
                .after("right"),
        );
    harness.start(&config(), plan).unwrap();
    harness.wait_ready(BOOT_TIMEOUT).await.unwrap();

    for name in ["root", "left", "right", "join"] {
        assert_eq!(markers.count_marker_lines(name), 1, "{name}");
    }
    let join = markers.read_timestamps("join")[0];
    assert!(join >= markers.read_timestamps("left")[0]);
    assert!(join >= markers.read_timestamps("right")[0]);
    assert!(markers.read_timestamps("left")[0] >= markers.read_timestamps("root")[0]);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_service_dependency_waits_for_ready_probe() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    // The port starts accepting a little after the service is launched
    let listening_at = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let at = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        (listener, at)
    });

    let mut harness = TestSupervisor::new().unwrap();
    let markers = harness.markers();
    let dir = harness.work_dir().to_path_buf();
    let plan = ScriptPlan::new()
        .service(ScriptService::new("server", &dir, "exec sleep 60").ready_probe(&addr.to_string()))
        .one_shot(ScriptTask::new("client", &dir, markers.timestamp_command("client")).after("server"));
    harness.start(&config(), plan).unwrap();
    harness.wait_ready(BOOT_TIMEOUT).await.unwrap();

    let (_listener, listening) = listening_at.await.unwrap();
    let client = markers.read_timestamps("client")[0];
    assert!(client >= listening);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_dependency_fails_startup() {
    let mut harness = TestSupervisor::new().unwrap();
    let dir = harness.work_dir().to_path_buf();
    let plan = ScriptPlan::new().one_shot(ScriptTask::new("orphan", &dir, "true").after("missing"));
    harness.start(&config(), plan).unwrap();

    let cause = harness.wait(BOOT_TIMEOUT).await.unwrap();
    assert!(cause.to_string().contains("missing"), "{cause}");
}
