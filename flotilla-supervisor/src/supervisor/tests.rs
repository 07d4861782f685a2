use super::*;
use crate::health::HealthTarget;
use crate::task::{OneShot, RunContext, Service, ServiceLaunch, Task};
use async_trait::async_trait;
use axum::Router;
use axum::routing::get;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

const ONE_CLUSTER: &str = "Clusters:\n  zzzzz:\n    ManagementToken: mgmt\n";

#[derive(Clone, Default)]
struct TestPlan {
    tasks: Vec<Task>,
    targets: Vec<HealthTarget>,
}

#[async_trait]
impl TaskPlan for TestPlan {
    fn tasks(&self, _setup: &RunSetup) -> Vec<Task> {
        self.tasks.clone()
    }

    fn health_targets(&self, _cluster: &Cluster) -> Vec<HealthTarget> {
        self.targets.clone()
    }
}

/// Keeps a copy of the setup it ran with
#[derive(Clone, Default)]
struct Record(Arc<Mutex<Option<RunSetup>>>);

#[async_trait]
impl OneShot for Record {
    fn name(&self) -> String {
        "record".to_string()
    }

    async fn run(&self, ctx: &RunContext) -> Result<()> {
        *self.0.lock() = Some(ctx.setup().clone());
        Ok(())
    }
}

struct Broken;

#[async_trait]
impl OneShot for Broken {
    fn name(&self) -> String {
        "broken".to_string()
    }

    async fn run(&self, _ctx: &RunContext) -> Result<()> {
        Err(SupervisorError::Config("boom".to_string()))
    }
}

struct Echo;

#[async_trait]
impl OneShot for Echo {
    fn name(&self) -> String {
        "echo".to_string()
    }

    async fn run(&self, ctx: &RunContext) -> Result<()> {
        ctx.run_program(".", Default::default(), "sh", &["-c", "echo hello"])
            .await
    }
}

/// A service whose child exits shortly after it is ready
struct ShortLived;

#[async_trait]
impl Service for ShortLived {
    fn name(&self) -> String {
        "short-lived".to_string()
    }

    async fn prepare(&self, _ctx: &RunContext) -> Result<Vec<ServiceLaunch>> {
        Ok(vec![ServiceLaunch::new(".", "sh", ["-c", "sleep 0.3"])])
    }
}

fn options(yaml: &str, plan: TestPlan, source: &Path) -> SupervisorOptions {
    let mut opts = SupervisorOptions::config_yaml(yaml).plan(plan);
    opts.cluster_type = ClusterType::Test;
    opts.source_path = Some(source.to_path_buf());
    opts.listen_host = "127.0.0.1".to_string();
    opts.controller_address = ":0".to_string();
    opts.log_sink = LogSink::null();
    opts.handle_signals = false;
    opts.health_interval = Duration::from_millis(50);
    opts
}

async fn ready(supervisor: &Supervisor) -> Option<ServiceUrl> {
    tokio::time::timeout(Duration::from_secs(10), supervisor.wait_ready())
        .await
        .expect("wait_ready timed out")
}

#[tokio::test]
async fn test_cold_start_reports_controller_url_and_cleans_up() {
    let source = tempfile::tempdir().unwrap();
    let record = Record::default();
    let plan = TestPlan {
        tasks: vec![Task::one_shot(record.clone())],
        ..Default::default()
    };
    let supervisor = Supervisor::start(
        options(ONE_CLUSTER, plan, source.path()),
        &CancellationToken::new(),
    );

    let url = ready(&supervisor).await.unwrap();
    assert_eq!(url.scheme(), "https");
    assert_eq!(url.hostname(), "127.0.0.1");
    assert_ne!(url.port_or_default(), 0);
    assert_eq!(supervisor.state(), SupervisorState::Running);
    assert_eq!(supervisor.cluster().unwrap().controller_url(), Some(&url));

    let setup = record.0.lock().clone().unwrap();
    let written = std::fs::read_to_string(&setup.config_file).unwrap();
    assert!(written.contains("zzzzz"), "{written}");
    assert_eq!(
        setup.environ.get(CONFIG_ENV),
        Some(setup.config_file.display().to_string().as_str())
    );
    assert_eq!(setup.environ.get("RAILS_ENV"), Some("test"));
    assert_eq!(setup.source_path, source.path().canonicalize().unwrap());
    assert!(setup.temp_dir.is_dir());

    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Done);
    assert!(!setup.temp_dir.exists());
}

#[tokio::test]
async fn test_task_failure_is_the_cause() {
    let source = tempfile::tempdir().unwrap();
    let plan = TestPlan {
        tasks: vec![Task::one_shot(Broken), Task::one_shot(Record::default())],
        ..Default::default()
    };
    let supervisor = Supervisor::start(
        options(ONE_CLUSTER, plan, source.path()),
        &CancellationToken::new(),
    );

    assert_eq!(ready(&supervisor).await, None);
    match supervisor.wait().await {
        Err(ShutdownCause::TaskFailed { task, message }) => {
            assert_eq!(task, "broken");
            assert!(message.contains("boom"), "{message}");
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn test_service_exit_after_ready_stops_the_run() {
    let source = tempfile::tempdir().unwrap();
    let plan = TestPlan {
        tasks: vec![Task::service(ShortLived)],
        ..Default::default()
    };
    let supervisor = Supervisor::start(
        options(ONE_CLUSTER, plan, source.path()),
        &CancellationToken::new(),
    );

    let result = tokio::time::timeout(Duration::from_secs(10), supervisor.wait())
        .await
        .unwrap();
    match result {
        Err(ShutdownCause::TaskFailed { task, message }) => {
            assert_eq!(task, "short-lived");
            assert!(message.ends_with("exited"), "{message}");
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_config_never_starts() {
    let source = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::start(
        options("Clusters: {}\n", TestPlan::default(), source.path()),
        &CancellationToken::new(),
    );

    assert_eq!(ready(&supervisor).await, None);
    let cause = supervisor.wait().await.unwrap_err();
    assert!(matches!(cause, ShutdownCause::Startup(_)), "{cause:?}");
    assert!(cause.to_string().contains("does not define any clusters"));
    assert_eq!(supervisor.state(), SupervisorState::Done);
}

#[tokio::test]
async fn test_first_cause_wins() {
    let source = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::start(
        options(ONE_CLUSTER, TestPlan::default(), source.path()),
        &CancellationToken::new(),
    );
    ready(&supervisor).await.unwrap();

    supervisor
        .shutdown_handle()
        .shutdown(ShutdownCause::NeedReload);
    supervisor
        .shutdown_handle()
        .shutdown(ShutdownCause::Signal("SIGTERM".to_string()));

    assert_eq!(supervisor.stop().await, Err(ShutdownCause::NeedReload));
    let again = supervisor.wait().await.unwrap_err();
    assert_eq!(again.to_string(), ShutdownCause::RELOAD_SENTINEL);
}

#[tokio::test]
async fn test_parent_cancel_stops_the_run() {
    let source = tempfile::tempdir().unwrap();
    let parent = CancellationToken::new();
    let supervisor = Supervisor::start(
        options(ONE_CLUSTER, TestPlan::default(), source.path()),
        &parent,
    );
    ready(&supervisor).await.unwrap();

    parent.cancel();
    assert_eq!(supervisor.wait().await, Err(ShutdownCause::Cancelled));
}

#[tokio::test]
async fn test_health_gates_readiness() {
    let healthy = Arc::new(AtomicBool::new(false));
    let app = Router::new().route(
        health::HEALTH_PATH,
        get({
            let healthy = healthy.clone();
            move || async move {
                if healthy.load(Ordering::SeqCst) {
                    r#"{"health":"OK"}"#
                } else {
                    r#"{"health":"ERROR"}"#
                }
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    let url = ServiceUrl::new("http", "127.0.0.1", Some(port), "/").unwrap();

    let source = tempfile::tempdir().unwrap();
    let plan = TestPlan {
        targets: vec![HealthTarget {
            name: format!("Fake+{url}"),
            url,
        }],
        ..Default::default()
    };
    let started = Instant::now();
    let supervisor = Supervisor::start(
        options(ONE_CLUSTER, plan, source.path()),
        &CancellationToken::new(),
    );
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        healthy.store(true, Ordering::SeqCst);
    });

    ready(&supervisor).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(500));
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn test_federation_runs_one_supervisor_per_cluster() {
    let yaml = "Clusters:\n  bbbbb:\n    ManagementToken: b\n  aaaaa:\n    ManagementToken: a\n";
    let source = tempfile::tempdir().unwrap();
    let plan = TestPlan {
        tasks: vec![Task::one_shot(Echo)],
        ..Default::default()
    };
    let (sink, output) = LogSink::capture();
    let mut opts = options(yaml, plan, source.path());
    opts.log_sink = sink;
    let supervisor = Supervisor::start(opts, &CancellationToken::new());

    let url = ready(&supervisor).await.unwrap();
    let children = supervisor.children();
    assert_eq!(children.keys().collect::<Vec<_>>(), ["aaaaa", "bbbbb"]);
    let first = children["aaaaa"].cluster().unwrap();
    assert_eq!(first.controller_url(), Some(&url));
    assert_ne!(
        children["bbbbb"].cluster().unwrap().controller_url(),
        Some(&url)
    );

    let logged = output.contents();
    assert!(logged.contains("[aaaaa] "), "{logged}");
    assert!(logged.contains("[bbbbb] "), "{logged}");
    assert!(logged.contains("hello"), "{logged}");

    supervisor.stop().await.unwrap();
    for child in children.values() {
        assert_eq!(child.state(), SupervisorState::Done);
    }
}

#[tokio::test]
async fn test_failed_cluster_stops_the_federation() {
    let yaml = "Clusters:\n  aaaaa: {}\n  bbbbb: {}\n";
    let source = tempfile::tempdir().unwrap();
    let plan = TestPlan {
        tasks: vec![Task::one_shot(Broken)],
        ..Default::default()
    };
    let supervisor = Supervisor::start(
        options(yaml, plan, source.path()),
        &CancellationToken::new(),
    );

    assert_eq!(ready(&supervisor).await, None);
    let cause = tokio::time::timeout(Duration::from_secs(10), supervisor.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(cause, ShutdownCause::TaskFailed { .. }), "{cause:?}");
}

#[tokio::test]
async fn test_config_change_requests_reload() {
    let source = tempfile::tempdir().unwrap();
    let config_dir = tempfile::tempdir().unwrap();
    let path = config_dir.path().join("cluster.yml");
    std::fs::write(&path, format!("AutoReloadConfig: true\n{ONE_CLUSTER}")).unwrap();

    let mut opts = options(ONE_CLUSTER, TestPlan::default(), source.path());
    opts.config = ConfigSource::Path(path.clone());
    let supervisor = Supervisor::start(opts, &CancellationToken::new());
    ready(&supervisor).await.unwrap();

    std::fs::write(
        &path,
        "AutoReloadConfig: true\nClusters:\n  zzzzz:\n    ManagementToken: changed\n",
    )
    .unwrap();
    let cause = tokio::time::timeout(Duration::from_secs(10), supervisor.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert!(cause.is_reload(), "{cause:?}");
}

#[test]
fn test_default_listen_host() {
    let mut cluster = Cluster::default();
    assert_eq!(default_listen_host("", &cluster), "0.0.0.0");
    assert_eq!(default_listen_host("10.0.0.1", &cluster), "10.0.0.1");

    cluster.service_mut(crate::config::services::CONTROLLER).external_url =
        "https://ctl.example:8443/".parse().unwrap();
    assert_eq!(default_listen_host("", &cluster), "ctl.example");
}

#[test]
fn test_child_environ_drops_inherited_reserved_vars() {
    let dirs = RunDirs {
        bin_dir: PathBuf::from("/tmp/run/bin"),
        temp_dir: PathBuf::from("/tmp/run"),
        www_temp_dir: PathBuf::from("/tmp/run"),
        production: false,
        _guard: None,
    };
    let environ = child_environ(
        Environ::from_entries([
            "FLOTILLA_CONFIG=/old/config.yml",
            "FLOTILLA_SERVICE_INTERNAL_URL=http://old/",
            "PATH=/usr/bin",
            "HOME=/home/op",
        ]),
        Path::new("/tmp/run/config.yml"),
        ClusterType::Development,
        &dirs,
    );

    assert_eq!(environ.get(CONFIG_ENV), Some("/tmp/run/config.yml"));
    assert_eq!(environ.get("FLOTILLA_SERVICE_INTERNAL_URL"), None);
    assert_eq!(environ.get("RAILS_ENV"), Some("development"));
    assert_eq!(environ.get("TMPDIR"), Some("/tmp/run"));
    assert_eq!(
        environ.get("PATH"),
        Some("/tmp/run/bin:/var/lib/flotilla/bin:/usr/bin")
    );
    assert_eq!(environ.get("HOME"), Some("/home/op"));
}

#[test]
fn test_production_uses_fixed_dirs() {
    let dirs = RunDirs::create(ClusterType::Production).unwrap();
    assert_eq!(dirs.temp_dir, Path::new(PRODUCTION_TEMP_DIR));
    assert_eq!(dirs.bin_dir, Path::new(PRODUCTION_BIN_DIR));

    let environ = child_environ(
        Environ::from_entries(["PATH=/usr/bin"]),
        Path::new("/var/lib/flotilla/wwwtmp/config.yml"),
        ClusterType::Production,
        &dirs,
    );
    assert_eq!(environ.get("PATH"), Some("/var/lib/flotilla/bin:/usr/bin"));
}
