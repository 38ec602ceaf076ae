// tests/admission/main.rs

//! End-to-end admission pipeline tests.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use gatekeeper::http::{status_router, AdmissionState, HttpServer};
use gatekeeper::ratelimit::{
    Consistency, JsonFileStore, Limiter, LimiterConfig, MemoryStore, StateStore,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tower::ServiceExt;


use fixtures::test_clock::TestClock;

fn app(store: Arc<dyn StateStore>, clock: &TestClock, config: LimiterConfig) -> Router {
    let limiter = Arc::new(Limiter::new(store, config).unwrap());
    let state = AdmissionState::new(limiter, Arc::new(clock.clone()));
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    HttpServer::new(addr, state, status_router()).router()
}

async fn get_from(app: &Router, client: &str) -> Response {
    let ip: IpAddr = client.parse().unwrap();
    let addr = SocketAddr::new(ip, 40000);
    let request = Request::builder()
        .uri("/")
        .extension(ConnectInfo(addr))
        .body(Body::empty())
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

fn header(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .map(|v| v.to_str().unwrap().to_string())
}

async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn worked_example_with_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let store = JsonFileStore::new(&path);
    store.initialize().await.unwrap();

    let clock = TestClock::new(0);
    let app = app(Arc::new(store), &clock, LimiterConfig::default());

    for (t, remaining) in [(0, "2"), (10, "1"), (20, "0")] {
        clock.set(t);
        let response = get_from(&app, "192.0.2.10").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-limit").as_deref(), Some("3"));
        assert_eq!(
            header(&response, "x-ratelimit-remaining").as_deref(),
            Some(remaining)
        );
    }

    clock.set(30);
    let response = get_from(&app, "192.0.2.10").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, "retry-after").as_deref(), Some("1"));
    assert_eq!(
        body_json(response).await,
        serde_json::json!({"errors": [{"message": "Too many requests", "retryAfter": "1 sec"}]})
    );

    clock.set(1001);
    let response = get_from(&app, "192.0.2.10").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header(&response, "x-ratelimit-remaining").as_deref(),
        Some("2")
    );

    // The snapshot on disk uses the persisted field names.
    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(
        on_disk,
        serde_json::json!({"192.0.2.10": {"lastRequestTime": 1, "numberOfRequest": 1}})
    );
}

#[tokio::test]
async fn state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    JsonFileStore::new(&path).initialize().await.unwrap();
    let clock = TestClock::new(5_000);

    let first = app(
        Arc::new(JsonFileStore::new(&path)),
        &clock,
        LimiterConfig::default(),
    );
    for _ in 0..3 {
        assert_eq!(get_from(&first, "192.0.2.10").await.status(), StatusCode::OK);
    }
    drop(first);

    let second = app(
        Arc::new(JsonFileStore::new(&path)),
        &clock,
        LimiterConfig::default(),
    );
    assert_eq!(
        get_from(&second, "192.0.2.10").await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn missing_snapshot_fails_every_client() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path().join("absent.json"));
    let clock = TestClock::new(0);

    for consistency in [Consistency::Snapshot, Consistency::PerClient] {
        let config = LimiterConfig {
            consistency,
            ..LimiterConfig::default()
        };
        let app = app(
            Arc::new(JsonFileStore::new(store.path())),
            &clock,
            config,
        );

        for client in ["192.0.2.1", "192.0.2.2", "2001:db8::1"] {
            let response = get_from(&app, client).await;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(
                body_json(response).await,
                serde_json::json!({"errors": {"message": "System Error"}})
            );
        }
    }

    assert!(!store.path().exists());
}

#[tokio::test]
async fn malformed_snapshot_fails_requests() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "not json").unwrap();

    let clock = TestClock::new(0);
    let app = app(
        Arc::new(JsonFileStore::new(&path)),
        &clock,
        LimiterConfig::default(),
    );

    let response = get_from(&app, "192.0.2.1").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn throttled_client_recovers_in_next_window() {
    let clock = TestClock::new(10_000);
    let config = LimiterConfig {
        limit: 2,
        window_duration_ms: 500,
        consistency: Consistency::PerClient,
    };
    let app = app(Arc::new(MemoryStore::new()), &clock, config);

    assert_eq!(get_from(&app, "192.0.2.7").await.status(), StatusCode::OK);
    assert_eq!(get_from(&app, "192.0.2.7").await.status(), StatusCode::OK);

    let denied = get_from(&app, "192.0.2.7").await;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    // Sub-second windows still advertise a whole second.
    assert_eq!(header(&denied, "retry-after").as_deref(), Some("1"));

    // Other clients are unaffected.
    assert_eq!(get_from(&app, "192.0.2.8").await.status(), StatusCode::OK);

    // Exactly on the boundary belongs to the next window.
    clock.set(10_500);
    let response = get_from(&app, "192.0.2.7").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header(&response, "x-ratelimit-remaining").as_deref(),
        Some("1")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_per_client_respect_limit() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path().join("state.json"));
    store.initialize().await.unwrap();

    let clock = TestClock::new(0);
    let config = LimiterConfig {
        limit: 4,
        window_duration_ms: 60_000,
        consistency: Consistency::PerClient,
    };
    let app = app(Arc::new(store), &clock, config);

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let app = app.clone();
            let client = if i % 2 == 0 { "192.0.2.1" } else { "192.0.2.2" };
            tokio::spawn(async move { get_from(&app, client).await.status() })
        })
        .collect();

    let statuses: Vec<StatusCode> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let admitted = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    let denied = statuses
        .iter()
        .filter(|s| **s == StatusCode::TOO_MANY_REQUESTS)
        .count();
    assert_eq!(admitted, 8);
    assert_eq!(denied, 12);
}

#[tokio::test]
async fn serves_over_tcp_with_peer_address() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let limiter = Arc::new(
        Limiter::new(Arc::new(MemoryStore::new()), LimiterConfig::default()).unwrap(),
    );
    let state = AdmissionState::new(limiter, Arc::new(TestClock::new(0)));
    let server = HttpServer::new(addr, state, status_router());

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(server.serve_listener(listener, async move {
        let _ = rx.await;
    }));

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    let raw = raw.to_ascii_lowercase();
    assert!(raw.starts_with("http/1.1 200"));
    assert!(raw.contains("x-ratelimit-limit: 3"));
    assert!(raw.contains("x-ratelimit-remaining: 2"));
    assert!(raw.contains("\"status\":\"ok\""));

    tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}
