use analytics_common::event::ValidationError;
use analytics_common::queue::QueueError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureResponseCode {
    Accepted,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CaptureResponse {
    pub status: CaptureResponseCode,
}

impl CaptureResponse {
    pub fn accepted() -> Self {
        Self {
            status: CaptureResponseCode::Accepted,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidEvent(#[from] ValidationError),

    #[error("failed to encode event: {0}")]
    EncodingError(#[source] serde_json::Error),
    #[error("failed to enqueue event: {0}")]
    QueueError(#[from] QueueError),
}

impl CaptureError {
    /// Label for the rejected events counter.
    pub fn reason(&self) -> &'static str {
        match self {
            CaptureError::RequestParsingError(_) => "invalid_json",
            CaptureError::InvalidEvent(ValidationError::MissingField(field)) => *field,
            CaptureError::EncodingError(_) => "encoding",
            CaptureError::QueueError(_) => "queue_error",
        }
    }
}

impl IntoResponse for CaptureError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            CaptureError::RequestParsingError(_) => {
                (StatusCode::BAD_REQUEST, "invalid_json".to_owned())
            }
            CaptureError::InvalidEvent(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            CaptureError::EncodingError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error".to_owned())
            }
            CaptureError::QueueError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "queue_error".to_owned())
            }
        };

        (status, Json(ErrorResponse { error })).into_response()
    }
}
