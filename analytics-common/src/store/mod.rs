use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::EventRecord;

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::PgEventStore;

/// How many paths a stats response ranks at most.
pub const TOP_PATHS_LIMIT: usize = 10;

/// Errors from the document store, split by whether trying again later can help.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store is unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("store rejected the record: {0}")]
    Rejected(#[source] sqlx::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db_error) => {
                // SQLSTATE classes 08 (connection), 53 (resources) and 57 (operator
                // intervention) go away on their own; everything else is about the data.
                let transient = db_error
                    .code()
                    .map_or(false, |code| {
                        code.starts_with("08") || code.starts_with("53") || code.starts_with("57")
                    });
                if transient {
                    StoreError::Unavailable(error)
                } else {
                    StoreError::Rejected(error)
                }
            }
            _ => StoreError::Unavailable(error),
        }
    }
}

/// Scope of a stats query: one site, optionally one UTC day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsFilter {
    pub site_id: String,
    pub date: Option<String>,
}

impl StatsFilter {
    pub fn new(site_id: impl Into<String>, date: Option<String>) -> Self {
        Self {
            site_id: site_id.into(),
            date,
        }
    }

    pub fn matches(&self, record: &EventRecord) -> bool {
        record.site_id == self.site_id
            && self.date.as_ref().map_or(true, |date| &record.date == date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PathViews {
    pub path: String,
    pub views: i64,
}

/// Append-only storage for event records plus the aggregations reporting needs.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert(&self, record: &EventRecord) -> Result<(), StoreError>;

    /// Number of records matching the filter.
    async fn count(&self, filter: &StatsFilter) -> Result<i64, StoreError>;

    /// Number of distinct user ids among matching records. Records without a user id are
    /// not counted at all.
    async fn unique_users(&self, filter: &StatsFilter) -> Result<i64, StoreError>;

    /// Paths of matching records by descending number of records, ties by path, at most
    /// `limit` of them.
    async fn top_paths(
        &self,
        filter: &StatsFilter,
        limit: usize,
    ) -> Result<Vec<PathViews>, StoreError>;
}
