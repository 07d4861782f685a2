use super::*;
use crate::config::ServiceInstance;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const TOKEN: &str = "mgmt-token";

#[derive(Clone)]
struct Fake {
    healthy: Arc<AtomicBool>,
}

async fn ping(State(fake): State<Fake>, headers: HeaderMap) -> impl IntoResponse {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if auth != format!("Bearer {TOKEN}") {
        return (StatusCode::UNAUTHORIZED, "{}".to_string());
    }
    let health = if fake.healthy.load(Ordering::SeqCst) {
        r#"{"health":"OK"}"#
    } else {
        r#"{"health":"ERROR","error":"starting"}"#
    };
    (StatusCode::OK, health.to_string())
}

/// Fake health endpoint; returns its base URL and the switch controlling it
async fn fake_endpoint(healthy: bool) -> (ServiceUrl, Arc<AtomicBool>) {
    let flag = Arc::new(AtomicBool::new(healthy));
    let app = Router::new()
        .route(HEALTH_PATH, get(ping))
        .with_state(Fake { healthy: flag.clone() });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (ServiceUrl::new("http", "127.0.0.1", Some(port), "/").unwrap(), flag)
}

fn target(name: &str, url: ServiceUrl) -> HealthTarget {
    HealthTarget {
        name: format!("{name}+{url}"),
        url,
    }
}

fn closed_port_url() -> ServiceUrl {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    ServiceUrl::new("http", "127.0.0.1", Some(port), "/").unwrap()
}

#[test]
fn test_targets_cover_every_internal_url_of_checked_services() {
    let mut cluster = Cluster::default();
    for url in ["http://127.0.0.1:9001/", "http://127.0.0.1:9002/"] {
        cluster
            .service_mut(services::KEEPSTORE)
            .internal_urls
            .insert(url.parse().unwrap(), ServiceInstance::default());
    }
    cluster
        .service_mut(services::WORKBENCH2)
        .internal_urls
        .insert("http://127.0.0.1:9003/".parse().unwrap(), ServiceInstance::default());
    cluster
        .service_mut(services::DISPATCH_CLOUD)
        .internal_urls
        .insert("http://127.0.0.1:9004/".parse().unwrap(), ServiceInstance::default());
    cluster.service_mut(services::CONTROLLER);

    let names: Vec<String> = targets(&cluster).into_iter().map(|t| t.name).collect();
    assert_eq!(
        names,
        vec![
            "Keepstore+http://127.0.0.1:9001/".to_string(),
            "Keepstore+http://127.0.0.1:9002/".to_string(),
        ]
    );

    cluster.containers.cloud_vms.enable = true;
    let names: Vec<String> = targets(&cluster).into_iter().map(|t| t.name).collect();
    assert_eq!(names[0], "DispatchCloud+http://127.0.0.1:9004/");
}

#[test]
fn test_report_lists_unhealthy_targets() {
    let ok = TargetHealth {
        health: Health::Ok,
        response_time: Duration::ZERO,
        error: None,
    };
    let bad = TargetHealth {
        health: Health::Error,
        response_time: Duration::ZERO,
        error: Some("boom".into()),
    };
    let checks = BTreeMap::from([
        ("a".to_string(), ok.clone()),
        ("b".to_string(), bad.clone()),
        ("c".to_string(), bad),
    ]);
    let report = HealthReport::from_checks(checks);
    assert_eq!(report.cluster_health, "b c");
    assert!(!report.is_healthy());

    assert!(HealthReport::from_checks(BTreeMap::from([("a".to_string(), ok)])).is_healthy());
    assert!(!HealthReport::initial().is_healthy());
}

#[test]
fn test_no_targets_is_healthy() {
    assert!(HealthReport::from_checks(BTreeMap::new()).is_healthy());
}

#[tokio::test]
async fn test_tick_reports_each_target() {
    let (up, _) = fake_endpoint(true).await;
    let (starting, _) = fake_endpoint(false).await;
    let down = closed_port_url();

    let aggregator = HealthAggregator::with_targets(
        vec![
            target("Up", up.clone()),
            target("Starting", starting.clone()),
            target("Down", down.clone()),
        ],
        TOKEN,
        false,
    )
    .unwrap();
    let report = aggregator.tick().await;

    assert_eq!(report.checks[&format!("Up+{up}")].health, Health::Ok);
    let starting_check = &report.checks[&format!("Starting+{starting}")];
    assert_eq!(starting_check.health, Health::Error);
    assert_eq!(starting_check.error.as_deref(), Some("starting"));
    assert_eq!(report.checks[&format!("Down+{down}")].health, Health::Error);
    assert_eq!(
        report.cluster_health,
        format!("Down+{down} Starting+{starting}")
    );
}

#[tokio::test]
async fn test_wrong_token_is_unhealthy() {
    let (up, _) = fake_endpoint(true).await;
    let aggregator =
        HealthAggregator::with_targets(vec![target("Up", up)], "wrong", false).unwrap();
    let report = aggregator.tick().await;
    assert!(!report.is_healthy());
    let check = report.checks.values().next().unwrap();
    assert!(check.error.as_deref().unwrap().contains("401"));
}

#[tokio::test]
async fn test_wait_ready_follows_targets_becoming_healthy() {
    let (url, flag) = fake_endpoint(false).await;
    let monitor = HealthAggregator::with_targets(vec![target("Svc", url)], TOKEN, false)
        .unwrap()
        .with_interval(Duration::from_millis(50))
        .spawn(CancellationToken::new());

    tokio::spawn({
        let flag = flag.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            flag.store(true, Ordering::SeqCst);
        }
    });

    let cancel = CancellationToken::new();
    let ready = tokio::time::timeout(Duration::from_secs(5), monitor.wait_ready(&cancel))
        .await
        .unwrap();
    assert!(ready);
    assert!(monitor.report().is_healthy());
}

#[tokio::test]
async fn test_wait_ready_returns_false_on_cancel() {
    let monitor = HealthAggregator::with_targets(vec![target("Down", closed_port_url())], TOKEN, false)
        .unwrap()
        .with_interval(Duration::from_millis(50))
        .spawn(CancellationToken::new());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });
    assert!(!monitor.wait_ready(&cancel).await);
}

#[tokio::test]
async fn test_monitor_stops_when_cancelled() {
    let (url, _) = fake_endpoint(true).await;
    let stop = CancellationToken::new();
    let monitor = HealthAggregator::with_targets(vec![target("Svc", url)], TOKEN, false)
        .unwrap()
        .with_interval(Duration::from_millis(20))
        .spawn(stop.clone());
    stop.cancel();

    let mut rx = monitor.subscribe();
    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        while rx.changed().await.is_ok() {}
    })
    .await;
    assert!(closed.is_ok());
}
