use std::convert::Infallible;
use std::sync::Arc;

use analytics_common::metrics::add_metrics_routes;
use analytics_common::queue::EventQueue;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::capture;

#[derive(Clone)]
pub struct State {
    pub queue: Arc<dyn EventQueue>,
}

async fn index() -> &'static str {
    "analytics capture"
}

pub fn router(
    queue: Arc<dyn EventQueue>,
    recorder_handle: Option<PrometheusHandle>,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    let state = State { queue };

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(index))
        .route(
            "/event",
            post(capture::event)
                .with_state(state)
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    // Only installed when asked to: the global recorder can't be set twice in one process,
    // which tests building several routers would do.
    add_metrics_routes(router, recorder_handle)
}
