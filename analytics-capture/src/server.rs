use std::future::Future;
use std::sync::Arc;

use analytics_common::metrics::setup_metrics_recorder;
use analytics_common::queue::RedisQueue;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::router;

/// Connect to the queue and serve capture requests on `listener` until `shutdown` resolves.
/// In-flight requests are allowed to finish.
pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> eyre::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let queue = RedisQueue::producer(&config.redis_url, &config.queue_key).await?;
    tracing::info!("appending events to {}", queue.queue_key());

    let recorder_handle = if config.export_prometheus {
        Some(setup_metrics_recorder()?)
    } else {
        None
    };

    let app = router::router(
        Arc::new(queue),
        recorder_handle,
        config.max_body_size,
        config.concurrency_limit,
    );

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
