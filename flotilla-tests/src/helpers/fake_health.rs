//! Stand-in for a service's `/_health/ping` endpoint

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::get;
use flotilla_supervisor::config::ServiceUrl;
use flotilla_supervisor::health::HEALTH_PATH;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct Shared {
    token: Arc<str>,
    healthy: Arc<AtomicBool>,
    hits: Arc<AtomicUsize>,
}

/// HTTP server answering health pings with a switchable verdict.
///
/// Requests without `Authorization: Bearer <token>` get a 401. The server
/// stops when dropped.
pub struct FakeHealthServer {
    url: ServiceUrl,
    shared: Shared,
    stop: CancellationToken,
}

impl FakeHealthServer {
    /// Bind an ephemeral port on 127.0.0.1 and start serving
    pub async fn start(token: &str, healthy: bool) -> std::io::Result<Self> {
        let shared = Shared {
            token: Arc::from(token),
            healthy: Arc::new(AtomicBool::new(healthy)),
            hits: Arc::new(AtomicUsize::new(0)),
        };
        let app = Router::new()
            .route(HEALTH_PATH, get(ping))
            .with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let url = ServiceUrl::new("http", "127.0.0.1", Some(port), "/")
            .map_err(std::io::Error::other)?;
        let stop = CancellationToken::new();
        let shutdown = stop.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
        });

        Ok(Self {
            url,
            shared,
            stop,
        })
    }

    pub fn url(&self) -> ServiceUrl {
        self.url.clone()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.shared.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Report healthy once `delay` has passed
    pub fn healthy_after(&self, delay: Duration) {
        let flag = self.shared.healthy.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            flag.store(true, Ordering::SeqCst);
        });
    }

    /// Number of authorized pings served so far
    pub fn hits(&self) -> usize {
        self.shared.hits.load(Ordering::SeqCst)
    }
}

impl Drop for FakeHealthServer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn ping(State(shared): State<Shared>, headers: HeaderMap) -> (StatusCode, String) {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|t| t == &*shared.token);
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "{}".to_string());
    }

    shared.hits.fetch_add(1, Ordering::SeqCst);
    if shared.healthy.load(Ordering::SeqCst) {
        (StatusCode::OK, r#"{"health":"OK"}"#.to_string())
    } else {
        (
            StatusCode::OK,
            r#"{"health":"ERROR","error":"not ready yet"}"#.to_string(),
        )
    }
}
