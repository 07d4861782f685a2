//! Readiness waits for every health target to report OK

use flotilla_supervisor::ConfigSource;
use flotilla_supervisor::health::HealthTarget;
use flotilla_tests::helpers::config_builder::TEST_MANAGEMENT_TOKEN;
use flotilla_tests::{FakeHealthServer, ScriptPlan, TestClusterBuilder, TestConfigBuilder, TestSupervisor, WaitError};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn target(name: &str, server: &FakeHealthServer) -> HealthTarget {
    HealthTarget {
        name: format!("{}+{}", name, server.url()),
        url: server.url(),
    }
}

fn config() -> TestConfigBuilder {
    TestConfigBuilder::new().add_cluster(TestClusterBuilder::new("zzzzz").build())
}

#[tokio::test]
async fn test_ready_only_after_slowest_target_is_healthy() {
    let fast = FakeHealthServer::start(TEST_MANAGEMENT_TOKEN, true).await.unwrap();
    let slow = FakeHealthServer::start(TEST_MANAGEMENT_TOKEN, false).await.unwrap();
    let plan = ScriptPlan::new()
        .health_target(target("Fast", &fast))
        .health_target(target("Slow", &slow));

    let mut harness = TestSupervisor::new().unwrap();
    let mut opts = harness.options(
        ConfigSource::Path(config().write_to_file(harness.work_dir()).unwrap()),
        plan,
    );
    opts.health_interval = POLL_INTERVAL;

    let started = Instant::now();
    slow.healthy_after(Duration::from_secs(3));
    harness.start_with(opts);
    harness.wait_ready(Duration::from_secs(15)).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(3), "ready after {elapsed:?}");
    // One poll interval plus slack for the request itself
    assert!(
        elapsed <= Duration::from_secs(3) + POLL_INTERVAL + Duration::from_secs(1),
        "ready after {elapsed:?}"
    );
    assert!(fast.hits() > 1);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_wrong_token_never_becomes_ready() {
    let server = FakeHealthServer::start("some-other-token", true).await.unwrap();
    let plan = ScriptPlan::new().health_target(target("Svc", &server));

    let mut harness = TestSupervisor::new().unwrap();
    harness.start(&config(), plan).unwrap();

    assert!(matches!(
        harness.wait_ready(Duration::from_secs(2)).await,
        Err(WaitError::Timeout)
    ));
    assert_eq!(server.hits(), 0);
    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_no_targets_is_ready_at_once() {
    let mut harness = TestSupervisor::new().unwrap();
    harness.start(&config(), ScriptPlan::new()).unwrap();
    harness.wait_ready(Duration::from_secs(5)).await.unwrap();
    harness.stop().await.unwrap();
}
