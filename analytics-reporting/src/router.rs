use std::convert::Infallible;
use std::sync::Arc;

use analytics_common::metrics::add_metrics_routes;
use analytics_common::store::EventStore;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::stats;

#[derive(Clone)]
pub struct State {
    pub store: Arc<dyn EventStore>,
}

async fn index() -> &'static str {
    "analytics reporting"
}

pub fn router(
    store: Arc<dyn EventStore>,
    recorder_handle: Option<PrometheusHandle>,
    concurrency_limit: usize,
) -> Router {
    let state = State { store };

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(index))
        .route(
            "/stats",
            get(stats::stats)
                .with_state(state)
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit)),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    add_metrics_routes(router, recorder_handle)
}
