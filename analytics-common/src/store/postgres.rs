use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;

use super::{EventStore, PathViews, StatsFilter, StoreError};
use crate::event::EventRecord;

/// Event records in the `events` table created by `migrations/`.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(StoreError::Unavailable)?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../migrations").run(&self.pool).await
    }

    /// Close every pooled connection. Waits for connections currently checked out.
    pub async fn close(&self) {
        self.pool.close().await
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert(&self, record: &EventRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO events
    (site_id, event_type, path, user_id, timestamp, date, properties)
VALUES
    ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&record.site_id)
        .bind(&record.event_type)
        .bind(&record.path)
        .bind(&record.user_id)
        .bind(record.timestamp)
        .bind(&record.date)
        .bind(Json(&record.properties))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn count(&self, filter: &StatsFilter) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar(
            r#"
SELECT COUNT(*)
FROM events
WHERE site_id = $1 AND ($2::TEXT IS NULL OR date = $2)
            "#,
        )
        .bind(&filter.site_id)
        .bind(filter.date.as_deref())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn unique_users(&self, filter: &StatsFilter) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar(
            r#"
SELECT COUNT(DISTINCT user_id)
FROM events
WHERE site_id = $1 AND ($2::TEXT IS NULL OR date = $2)
    AND user_id IS NOT NULL AND user_id <> ''
            "#,
        )
        .bind(&filter.site_id)
        .bind(filter.date.as_deref())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn top_paths(
        &self,
        filter: &StatsFilter,
        limit: usize,
    ) -> Result<Vec<PathViews>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let paths = sqlx::query_as::<_, PathViews>(
            r#"
SELECT path, COUNT(*) AS views
FROM events
WHERE site_id = $1 AND ($2::TEXT IS NULL OR date = $2)
GROUP BY path
ORDER BY views DESC, path ASC
LIMIT $3
            "#,
        )
        .bind(&filter.site_id)
        .bind(filter.date.as_deref())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(paths)
    }
}
