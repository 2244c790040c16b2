use std::future::Future;
use std::sync::Arc;

use analytics_common::metrics::setup_metrics_recorder;
use analytics_common::store::PgEventStore;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::router;

/// Serve stats requests on `listener` until `shutdown` resolves, then close the pool.
pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> eyre::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let store = PgEventStore::new(&config.database_url, config.max_pg_connections).await?;

    let recorder_handle = if config.export_prometheus {
        Some(setup_metrics_recorder()?)
    } else {
        None
    };

    let app = router::router(
        Arc::new(store.clone()),
        recorder_handle,
        config.concurrency_limit,
    );

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    store.close().await;
    Ok(())
}
