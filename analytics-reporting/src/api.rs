use analytics_common::store::{PathViews, StoreError};
use axum::extract::rejection::QueryRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub site_id: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct StatsResponse {
    pub site_id: String,
    pub date: Option<String>,
    pub total_views: i64,
    pub unique_users: i64,
    pub top_paths: Vec<PathViews>,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Error, Debug)]
pub enum ReportingError {
    #[error("failed to parse query string: {0}")]
    InvalidQuery(#[from] QueryRejection),
    #[error("site_id is required")]
    MissingSiteId,
    #[error("date must be formatted as YYYY-MM-DD")]
    InvalidDate,
    #[error("stats query failed: {0}")]
    StoreError(#[from] StoreError),
}

impl IntoResponse for ReportingError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            ReportingError::InvalidQuery(_) => {
                (StatusCode::BAD_REQUEST, "invalid_query".to_owned())
            }
            ReportingError::MissingSiteId | ReportingError::InvalidDate => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ReportingError::StoreError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error".to_owned())
            }
        };

        (status, Json(ErrorResponse { error })).into_response()
    }
}
