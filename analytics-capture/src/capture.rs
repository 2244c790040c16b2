use std::time::Instant;

use analytics_common::event::RawEvent;
use analytics_common::queue::EventQueue;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use bytes::Bytes;
use metrics::{counter, histogram};
use tracing::{debug, error, instrument, Span};

use crate::api::{CaptureError, CaptureResponse};
use crate::router;

/// `POST /event`: validate one event and append it to the queue.
///
/// A malformed body gets the same `{"error": ...}` shape as every other refusal.
#[instrument(skip_all)]
pub async fn event(
    State(state): State<router::State>,
    body: Bytes,
) -> Result<(StatusCode, Json<CaptureResponse>), CaptureError> {
    counter!("analytics_events_received_total").increment(1);

    let result = match serde_json::from_slice::<RawEvent>(&body) {
        Ok(raw) => submit(state.queue.as_ref(), raw).await,
        Err(err) => Err(CaptureError::from(err)),
    };

    match result {
        Ok(()) => Ok((StatusCode::ACCEPTED, Json(CaptureResponse::accepted()))),
        Err(err) => {
            counter!("analytics_events_rejected_total", "reason" => err.reason()).increment(1);
            Err(err)
        }
    }
}

/// Normalize an event and append its encoding to the queue. Nothing is appended when the
/// event is invalid.
#[instrument(skip_all, fields(site_id, event_type))]
pub async fn submit(queue: &dyn EventQueue, raw: RawEvent) -> Result<(), CaptureError> {
    let event = raw.normalize()?;

    let span = Span::current();
    span.record("site_id", event.site_id.as_str());
    span.record("event_type", event.event_type.as_str());

    let payload = event.encode().map_err(CaptureError::EncodingError)?;

    let start = Instant::now();
    queue.append(payload).await.map_err(|err| {
        error!("failed to append event to queue: {}", err);
        CaptureError::from(err)
    })?;
    histogram!("analytics_queue_append_duration_seconds").record(start.elapsed().as_secs_f64());
    counter!("analytics_events_enqueued_total").increment(1);

    debug!("event enqueued");
    Ok(())
}
