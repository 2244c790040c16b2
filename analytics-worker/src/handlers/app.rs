use analytics_common::health::HealthRegistry;
use analytics_common::metrics::add_metrics_routes;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::consumer::ConsumerState;

#[derive(Debug, Serialize)]
struct StateResponse {
    state: ConsumerState,
}

pub fn app(
    liveness: HealthRegistry,
    state: watch::Receiver<ConsumerState>,
    recorder_handle: Option<PrometheusHandle>,
) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        )
        .route("/_state", get(consumer_state).with_state(state))
        .layer(TraceLayer::new_for_http());

    add_metrics_routes(router, recorder_handle)
}

pub async fn index() -> &'static str {
    "analytics worker"
}

async fn consumer_state(
    State(state): State<watch::Receiver<ConsumerState>>,
) -> Json<StateResponse> {
    let state = *state.borrow();
    Json(StateResponse { state })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use analytics_common::queue::MemoryQueue;
    use analytics_common::store::MemoryStore;
    use assert_json_diff::assert_json_eq;
    use axum::body::{Body, Bytes};
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::consumer::Consumer;

    async fn request(app: Router, uri: &str) -> (StatusCode, Bytes) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        (status, response.into_body().collect().await.unwrap().to_bytes())
    }

    #[tokio::test]
    async fn reports_consumer_state() {
        let liveness = HealthRegistry::new("liveness");
        let handle = liveness
            .register("consumer".to_owned(), time::Duration::seconds(30))
            .await;
        let consumer = Consumer::new(
            "test",
            Arc::new(MemoryQueue::new()),
            Arc::new(MemoryStore::new()),
            Duration::from_secs(1),
            None,
            handle,
        );

        let (status, body) = request(app(liveness, consumer.subscribe(), None), "/_state").await;

        assert_eq!(status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_json_eq!(body, json!({"state": "waiting"}));
    }

    #[tokio::test]
    async fn liveness_follows_registry() {
        let liveness = HealthRegistry::new("liveness");
        let (_, state) = watch::channel(ConsumerState::Waiting);

        let (status, _) = request(app(liveness.clone(), state.clone(), None), "/_liveness").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let handle = liveness
            .register("consumer".to_owned(), time::Duration::seconds(30))
            .await;
        handle.report_healthy().await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let (status, _) = request(app(liveness.clone(), state.clone(), None), "/_liveness").await;
            if status == StatusCode::OK {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "never went live");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn index_and_readiness() {
        let liveness = HealthRegistry::new("liveness");
        let (_, state) = watch::channel(ConsumerState::Waiting);

        for uri in ["/", "/_readiness"] {
            let (status, body) = request(app(liveness.clone(), state.clone(), None), uri).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(&body[..], b"analytics worker");
        }
    }
}
