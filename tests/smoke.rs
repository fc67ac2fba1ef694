// ABOUTME: End-to-end smoke tests for beacon: SQLite store, delivery channel, and HTTP ingestion.
// ABOUTME: A local axum server stands in for the ingestion endpoint.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use beacon_channel::{ChannelBuilder, ChannelHandle, GroupConfig};
use beacon_core::{Log, LogStore};
use beacon_store::SqliteLogStore;
use beacon_transport::{DefaultHttpClient, IngestionHttp};
use http::{HeaderMap, StatusCode};
use serde_json::Value;
use uuid::Uuid;

const SECRET: &str = "smoke-secret-0000";

struct Received {
    app_secret: Option<String>,
    install_id: Option<String>,
    content_type: Option<String>,
    body: Value,
}

#[derive(Clone)]
struct Ingest {
    requests: Arc<Mutex<Vec<Received>>>,
    status: Arc<AtomicU16>,
}

impl Ingest {
    fn new() -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            status: Arc::new(AtomicU16::new(200)),
        }
    }

    fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

async fn ingest(State(state): State<Ingest>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    state.requests.lock().unwrap().push(Received {
        app_secret: header("app-secret"),
        install_id: header("install-id"),
        content_type: header("content-type"),
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    });
    StatusCode::from_u16(state.status.load(Ordering::SeqCst)).unwrap_or(StatusCode::OK)
}

/// Start the fake ingestion endpoint and return its base URL.
async fn start_server(state: Ingest) -> String {
    let router = Router::new()
        .route("/logs", post(ingest))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn start_channel(store: Arc<SqliteLogStore>, base_url: &str, install_id: Uuid) -> ChannelHandle {
    let client = Arc::new(
        DefaultHttpClient::builder()
            .https_only(false)
            .build()
            .unwrap(),
    );
    let ingestion = IngestionHttp::with_log_url(client, base_url);
    ChannelBuilder::new(store, Arc::new(ingestion))
        .app_secret(SECRET)
        .install_id(install_id)
        .spawn()
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn smoke_test_full_batch_and_timer_flush_are_delivered() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(SqliteLogStore::open(&dir.path().join("logs.db")).unwrap());
    let server = Ingest::new();
    let base_url = start_server(server.clone()).await;
    let install_id = Uuid::new_v4();
    let handle = start_channel(Arc::clone(&store), &base_url, install_id);

    handle
        .add_group(GroupConfig::new("events", 3, Duration::from_millis(50), 2))
        .await
        .unwrap();

    for i in 0..4 {
        handle
            .enqueue(Log::new("event").with_property("seq", i), "events")
            .await
            .unwrap();
    }

    wait_until(|| server.count() == 2 && store.count("events").unwrap() == 0).await;

    let requests = server.requests.lock().unwrap();
    let sizes: Vec<usize> = requests
        .iter()
        .map(|r| r.body["logs"].as_array().map(Vec::len).unwrap_or(0))
        .collect();
    assert_eq!(sizes, vec![3, 1]);

    let first = &requests[0];
    assert_eq!(first.app_secret.as_deref(), Some(SECRET));
    assert_eq!(first.install_id, Some(install_id.to_string()));
    assert_eq!(first.content_type.as_deref(), Some("application/json"));

    let log = &first.body["logs"][0];
    assert_eq!(log["type"], "event");
    assert_eq!(log["seq"], 0);
    assert!(log["timestamp"].is_string());
    assert!(log["device"]["sdkName"].is_string());
}

#[tokio::test]
async fn smoke_test_server_error_suspends_until_reenabled() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(SqliteLogStore::open(&dir.path().join("logs.db")).unwrap());
    let server = Ingest::new();
    server.status.store(503, Ordering::SeqCst);
    let base_url = start_server(server.clone()).await;
    let handle = start_channel(Arc::clone(&store), &base_url, Uuid::new_v4());

    handle
        .add_group(GroupConfig::new("events", 1, Duration::from_secs(3), 1))
        .await
        .unwrap();
    handle.enqueue(Log::new("event"), "events").await.unwrap();

    let mut enabled = true;
    for _ in 0..300 {
        enabled = handle.is_enabled().await.unwrap();
        if !enabled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!enabled, "503 should suspend the channel");
    assert_eq!(store.count("events").unwrap(), 1, "record kept for retry");
    assert_eq!(handle.pending_count("events").await.unwrap(), Some(1));

    server.status.store(200, Ordering::SeqCst);
    handle.set_enabled(true).await.unwrap();

    wait_until(|| store.count("events").unwrap() == 0).await;
    assert_eq!(server.count(), 2);
}

#[tokio::test]
async fn smoke_test_backlog_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("logs.db");

    // Nothing listens on this port, so the first run cannot deliver.
    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_url = format!("http://{}", unused.local_addr().unwrap());
    drop(unused);

    {
        let store = Arc::new(SqliteLogStore::open(&db_path).unwrap());
        let handle = start_channel(Arc::clone(&store), &dead_url, Uuid::new_v4());
        handle
            .add_group(GroupConfig::new("events", 2, Duration::from_secs(3), 1))
            .await
            .unwrap();
        handle.enqueue(Log::new("event"), "events").await.unwrap();
        handle.enqueue(Log::new("event"), "events").await.unwrap();

        let mut enabled = true;
        for _ in 0..300 {
            enabled = handle.is_enabled().await.unwrap();
            if !enabled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!enabled, "connection failure should suspend the channel");
        handle.shutdown().await.unwrap();
        assert_eq!(store.count("events").unwrap(), 2);
    }

    let server = Ingest::new();
    let base_url = start_server(server.clone()).await;
    let store = Arc::new(SqliteLogStore::open(&db_path).unwrap());
    let handle = start_channel(Arc::clone(&store), &base_url, Uuid::new_v4());

    handle
        .add_group(GroupConfig::new("events", 2, Duration::from_secs(3), 1))
        .await
        .unwrap();

    wait_until(|| store.count("events").unwrap() == 0).await;
    assert_eq!(server.count(), 1);
    let requests = server.requests.lock().unwrap();
    assert_eq!(requests[0].body["logs"].as_array().map(Vec::len), Some(2));
}
