use analytics_capture::config::Config;
use analytics_capture::server::serve;
use analytics_common::shutdown::shutdown_signal;
use envconfig::Envconfig;
use eyre::Result;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

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
    let listener = tokio::net::TcpListener::bind(config.address).await?;

    serve(config, listener, shutdown_signal()?).await
}
