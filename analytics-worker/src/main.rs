//! Drain the event queue into Postgres.
use std::future::IntoFuture;
use std::sync::Arc;

use analytics_common::health::HealthRegistry;
use analytics_common::metrics::setup_metrics_recorder;
use analytics_common::queue::RedisQueue;
use analytics_common::shutdown::shutdown_signal;
use analytics_common::store::PgEventStore;
use analytics_worker::config::Config;
use analytics_worker::consumer::{Consumer, LIVENESS_INTERVAL};
use analytics_worker::error::WorkerError;
use analytics_worker::handlers;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

async fn connect(config: &Config) -> Result<(RedisQueue, PgEventStore), WorkerError> {
    let queue = RedisQueue::new(&config.redis_url, &config.queue_key, &config.consumer_name).await?;
    let store = PgEventStore::new(&config.database_url, config.max_pg_connections).await?;

    if config.run_migrations {
        store.migrate().await?;
    }

    Ok((queue, store))
}

/// The loop reports at least every `LIVENESS_INTERVAL` while waiting, and between
/// deliveries, but not while sleeping in a backoff.
fn liveness_deadline(config: &Config) -> Result<time::Duration> {
    let backoff = time::Duration::try_from(config.backoff_interval.0)?;
    let interval = time::Duration::try_from(LIVENESS_INTERVAL)?;

    Ok(interval * 3_i32 + backoff)
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Config::init_from_env()?;
    let shutdown = shutdown_signal()?;

    let (queue, store) = connect(&config).await?;
    tracing::info!(
        "consuming {} through {}",
        queue.queue_key(),
        queue.inflight_key().unwrap_or_default()
    );

    let liveness = HealthRegistry::new("liveness");
    let handle = liveness
        .register("consumer".to_owned(), liveness_deadline(&config)?)
        .await;

    let consumer = Consumer::new(
        &config.consumer_name,
        Arc::new(queue),
        Arc::new(store.clone()),
        config.backoff_interval.0,
        config.take_timeout(),
        handle,
    );
    consumer.recover().await?;

    let recorder_handle = if config.export_prometheus {
        Some(setup_metrics_recorder()?)
    } else {
        None
    };
    let app = handlers::app(liveness, consumer.subscribe(), recorder_handle);
    let listener = tokio::net::TcpListener::bind(config.bind()).await?;
    tracing::info!("listening on {:?}", listener.local_addr()?);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown.await;
            cancel.cancel();
        }
    });

    let http_server = Box::pin(
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.clone().cancelled_owned())
            .into_future(),
    );
    let consumer_loop = Box::pin(consumer.run(cancel.clone()));

    match select(http_server, consumer_loop).await {
        Either::Left((listen_result, consumer_loop)) => {
            if let Err(e) = listen_result {
                tracing::error!("worker http server failed: {}", e);
            }
            cancel.cancel();
            consumer_loop.await;
        }
        Either::Right(((), http_server)) => {
            http_server.await?;
        }
    };

    store.close().await;
    Ok(())
}
