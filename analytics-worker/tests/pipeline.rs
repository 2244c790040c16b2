use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use analytics_common::health::HealthRegistry;
use analytics_common::queue::{EventQueue, MemoryQueue};
use analytics_common::store::MemoryStore;
use analytics_worker::consumer::Consumer;
use anyhow::Result;
use assert_json_diff::assert_json_eq;
use axum::Router;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Pipeline {
    capture: SocketAddr,
    reporting: SocketAddr,
    queue: MemoryQueue,
    store: MemoryStore,
    client: reqwest::Client,
    cancel: CancellationToken,
    consumer: Option<JoinHandle<()>>,
}

async fn listen(app: Router) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { axum::serve(listener, app).await });
    Ok(addr)
}

impl Pipeline {
    async fn start() -> Result<Self> {
        let queue = MemoryQueue::new();
        let store = MemoryStore::new();

        let capture = listen(analytics_capture::router::router(
            Arc::new(queue.clone()),
            None,
            1_000_000,
            1024,
        ))
        .await?;
        let reporting =
            listen(analytics_reporting::router::router(Arc::new(store.clone()), None, 1024))
                .await?;

        Ok(Self {
            capture,
            reporting,
            queue,
            store,
            client: reqwest::Client::new(),
            cancel: CancellationToken::new(),
            consumer: None,
        })
    }

    async fn start_consumer(&mut self) {
        let liveness = HealthRegistry::new("liveness")
            .register("consumer".to_owned(), time::Duration::seconds(30))
            .await;
        let consumer = Consumer::new(
            "pipeline",
            Arc::new(self.queue.clone()),
            Arc::new(self.store.clone()),
            Duration::from_millis(10),
            Some(Duration::from_millis(50)),
            liveness,
        );
        let cancel = self.cancel.clone();
        self.consumer = Some(tokio::spawn(async move { consumer.run(cancel).await }));
    }

    async fn stop_consumer(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.consumer.take() {
            handle.await?;
        }
        Ok(())
    }

    async fn capture(&self, event: Value) -> Result<(StatusCode, Value)> {
        let response = self
            .client
            .post(format!("http://{}/event", self.capture))
            .json(&event)
            .send()
            .await?;
        Ok((response.status(), response.json().await?))
    }

    async fn stats(&self, query: &str) -> Result<(StatusCode, Value)> {
        let response = self
            .client
            .get(format!("http://{}/stats?{}", self.reporting, query))
            .send()
            .await?;
        Ok((response.status(), response.json().await?))
    }

    async fn wait_for_records(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.store.records().len() < count && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(self.store.records().len(), count);
    }

    async fn wait_for_drain(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !(self.queue.pending().is_empty() && self.queue.inflight().is_empty())
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(self.queue.pending().is_empty());
    }
}

#[tokio::test]
async fn accepted_event_shows_up_in_stats() -> Result<()> {
    let mut pipeline = Pipeline::start().await?;
    pipeline.start_consumer().await;

    let (status, body) = pipeline
        .capture(json!({
            "site_id": "s1",
            "event_type": "pageview",
            "timestamp": "2025-11-12T10:00:00Z"
        }))
        .await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_json_eq!(body, json!({"status": "accepted"}));

    pipeline.wait_for_records(1).await;

    let (status, body) = pipeline.stats("site_id=s1&date=2025-11-12").await?;
    assert_eq!(status, StatusCode::OK);
    assert_json_eq!(
        body,
        json!({
            "site_id": "s1",
            "date": "2025-11-12",
            "total_views": 1,
            "unique_users": 0,
            "top_paths": [{"path": "/", "views": 1}]
        })
    );

    pipeline.stop_consumer().await
}

#[tokio::test]
async fn rejected_event_never_reaches_the_store() -> Result<()> {
    let mut pipeline = Pipeline::start().await?;
    pipeline.start_consumer().await;

    let (status, body) = pipeline
        .capture(json!({"site_id": "s1", "timestamp": "2025-11-12T10:00:00Z"}))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_eq!(body, json!({"error": "event_type is required"}));

    pipeline.wait_for_drain().await;
    assert!(pipeline.store.records().is_empty());

    let (_, body) = pipeline.stats("site_id=s1").await?;
    assert_eq!(body["total_views"], json!(0));

    pipeline.stop_consumer().await
}

#[tokio::test]
async fn events_are_stored_in_submission_order() -> Result<()> {
    let mut pipeline = Pipeline::start().await?;

    for path in ["/a", "/b", "/c", "/d"] {
        let (status, _) = pipeline
            .capture(json!({
                "site_id": "s1",
                "event_type": "pageview",
                "timestamp": "2025-11-12T10:00:00Z",
                "path": path,
                "user_id": "u1"
            }))
            .await?;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    pipeline.start_consumer().await;
    pipeline.wait_for_records(4).await;

    let paths: Vec<String> = pipeline
        .store
        .records()
        .into_iter()
        .map(|record| record.path)
        .collect();
    assert_eq!(paths, vec!["/a", "/b", "/c", "/d"]);

    pipeline.stop_consumer().await
}

#[tokio::test]
async fn malformed_items_do_not_block_the_queue() -> Result<()> {
    let mut pipeline = Pipeline::start().await?;
    pipeline.queue.append(b"\x00garbage".to_vec()).await?;

    let (status, _) = pipeline
        .capture(json!({
            "site_id": "s1",
            "event_type": "pageview",
            "timestamp": "not a timestamp"
        }))
        .await?;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _) = pipeline
        .capture(json!({
            "site_id": "s1",
            "event_type": "pageview",
            "timestamp": "2025-11-12T10:00:00Z",
            "path": "/after"
        }))
        .await?;
    assert_eq!(status, StatusCode::ACCEPTED);

    pipeline.start_consumer().await;
    pipeline.wait_for_records(1).await;
    pipeline.wait_for_drain().await;

    assert_eq!(pipeline.store.records()[0].path, "/after");

    pipeline.stop_consumer().await
}
