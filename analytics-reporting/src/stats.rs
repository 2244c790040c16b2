use analytics_common::store::{EventStore, StatsFilter, TOP_PATHS_LIMIT};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::Json;
use chrono::NaiveDate;
use tracing::{error, instrument};

use crate::api::{ReportingError, StatsQuery, StatsResponse};
use crate::router;

/// `GET /stats?site_id=..&date=..`
#[instrument(skip_all)]
pub async fn stats(
    State(state): State<router::State>,
    query: Result<Query<StatsQuery>, QueryRejection>,
) -> Result<Json<StatsResponse>, ReportingError> {
    metrics::counter!("analytics_stats_queries_total").increment(1);

    let Query(query) = query?;
    let filter = parse_filter(query)?;
    let response = aggregate(state.store.as_ref(), filter)
        .await
        .map_err(|err| {
            error!("failed to compute stats: {}", err);
            err
        })?;

    Ok(Json(response))
}

/// Empty parameters count as absent. A date must be a real calendar day.
pub fn parse_filter(query: StatsQuery) -> Result<StatsFilter, ReportingError> {
    let site_id = query
        .site_id
        .filter(|site_id| !site_id.is_empty())
        .ok_or(ReportingError::MissingSiteId)?;

    let date = match query.date.filter(|date| !date.is_empty()) {
        Some(date) => {
            let parsed = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                .map_err(|_| ReportingError::InvalidDate)?;
            // Stored dates are zero padded, so "2025-1-5" could never match anything.
            if parsed.format("%Y-%m-%d").to_string() != date {
                return Err(ReportingError::InvalidDate);
            }
            Some(date)
        }
        None => None,
    };

    Ok(StatsFilter::new(site_id, date))
}

/// Run the three aggregations concurrently. They don't share a snapshot, so under
/// concurrent ingestion they may each see a slightly different set of records.
pub async fn aggregate(
    store: &dyn EventStore,
    filter: StatsFilter,
) -> Result<StatsResponse, ReportingError> {
    let (total_views, unique_users, top_paths) = tokio::try_join!(
        store.count(&filter),
        store.unique_users(&filter),
        store.top_paths(&filter, TOP_PATHS_LIMIT),
    )?;

    Ok(StatsResponse {
        site_id: filter.site_id,
        date: filter.date,
        total_views,
        unique_users,
        top_paths,
    })
}
