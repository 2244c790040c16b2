use analytics_common::queue::QueueError;
use analytics_common::store::StoreError;
use thiserror::Error;

/// Enumeration of errors that stop the worker from starting or running.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("queue operation failed: {0}")]
    QueueError(#[from] QueueError),
    #[error("failed to connect to the store: {0}")]
    StoreError(#[from] StoreError),
    #[error("failed to run migrations: {0}")]
    MigrateError(#[from] sqlx::migrate::MigrateError),
}
