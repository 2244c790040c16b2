use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_PATH: &str = "/";

/// Reasons an incoming event is refused before it reaches the queue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unparseable event timestamp: {0:?}")]
pub struct InvalidTimestamp(pub String);

/// An event as submitted by a site.
///
/// Known fields are kept as raw JSON values: browsers send whatever the page had at hand,
/// so presence is decided on the loose "truthy" rules the tracking snippets rely on and
/// scalars are coerced to strings during normalization. Anything else in the payload lands
/// in `properties`.
#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Value>,
    #[serde(flatten)]
    pub properties: HashMap<String, Value>,
}

impl RawEvent {
    /// Check required fields in order (site_id, event_type, timestamp), stopping at the first
    /// missing one, then apply the optional field defaults.
    pub fn normalize(self) -> Result<QueuedEvent, ValidationError> {
        let site_id = coerce(self.site_id).ok_or(ValidationError::MissingField("site_id"))?;
        let event_type =
            coerce(self.event_type).ok_or(ValidationError::MissingField("event_type"))?;
        let timestamp =
            coerce(self.timestamp).ok_or(ValidationError::MissingField("timestamp"))?;

        Ok(QueuedEvent {
            site_id,
            event_type,
            path: coerce(self.path).unwrap_or_else(|| DEFAULT_PATH.to_owned()),
            user_id: coerce(self.user_id),
            timestamp,
            properties: self.properties,
        })
    }
}

/// The normalized event, as serialized into the queue.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QueuedEvent {
    pub site_id: String,
    pub event_type: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, Value>,
}

fn default_path() -> String {
    DEFAULT_PATH.to_owned()
}

impl QueuedEvent {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Derive the stored form. Defaults are applied again so that payloads written by older
    /// producers (empty path, empty user_id) end up with the same shape.
    pub fn into_record(self) -> Result<EventRecord, InvalidTimestamp> {
        let timestamp = parse_timestamp(&self.timestamp)?;
        let date = timestamp.format("%Y-%m-%d").to_string();

        Ok(EventRecord {
            site_id: self.site_id,
            event_type: self.event_type,
            path: if self.path.is_empty() {
                default_path()
            } else {
                self.path
            },
            user_id: self.user_id.filter(|user_id| !user_id.is_empty()),
            timestamp,
            date,
            properties: self.properties,
        })
    }
}

impl From<QueuedEvent> for RawEvent {
    fn from(event: QueuedEvent) -> Self {
        RawEvent {
            site_id: Some(Value::String(event.site_id)),
            event_type: Some(Value::String(event.event_type)),
            timestamp: Some(Value::String(event.timestamp)),
            path: Some(Value::String(event.path)),
            user_id: event.user_id.map(Value::String),
            properties: event.properties,
        }
    }
}

/// One persisted event. Never updated once written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub site_id: String,
    pub event_type: String,
    pub path: String,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// UTC calendar date of `timestamp`, `YYYY-MM-DD`.
    pub date: String,
    pub properties: HashMap<String, Value>,
}

/// Parse a client supplied timestamp. Accepted, in order: RFC 3339, an ISO 8601 date-time
/// without offset (read as UTC), a bare date (UTC midnight), or Unix epoch milliseconds.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, InvalidTimestamp> {
    let value = raw.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(day) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(midnight) = day.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&midnight));
        }
    }

    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        if let Some(parsed) = value
            .parse::<i64>()
            .ok()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        {
            return Ok(parsed);
        }
    }

    Err(InvalidTimestamp(raw.to_owned()))
}

/// Returns the string form of a value, or None when the value counts as absent:
/// null, false, zero and the empty string.
fn coerce(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::Bool(false) => None,
        Value::Bool(true) => Some("true".to_owned()),
        Value::Number(number) => {
            if number.as_f64().map_or(false, |n| n == 0.0 || n.is_nan()) {
                None
            } else {
                Some(number.to_string())
            }
        }
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawEvent {
        serde_json::from_value(value).expect("valid raw event")
    }

    #[test]
    fn applies_defaults_to_optional_fields() {
        let event = raw(json!({
            "site_id": "s1",
            "event_type": "pageview",
            "timestamp": "2025-11-12T10:00:00Z"
        }))
        .normalize()
        .unwrap();

        assert_eq!(event.path, "/");
        assert_eq!(event.user_id, None);
        assert_eq!(event.timestamp, "2025-11-12T10:00:00Z");
        assert!(event.properties.is_empty());
    }

    #[test]
    fn keeps_submitted_optional_fields() {
        let event = raw(json!({
            "site_id": "s1",
            "event_type": "click",
            "timestamp": "not even a date",
            "path": "/pricing",
            "user_id": "u1"
        }))
        .normalize()
        .unwrap();

        assert_eq!(event.path, "/pricing");
        assert_eq!(event.user_id.as_deref(), Some("u1"));
        // ingestion does not look at the timestamp format
        assert_eq!(event.timestamp, "not even a date");
    }

    #[test]
    fn reports_first_missing_field() {
        let cases = [
            (json!({}), "site_id"),
            (json!({"event_type": "pageview"}), "site_id"),
            (json!({"site_id": "s1", "timestamp": "t"}), "event_type"),
            (json!({"site_id": "s1", "event_type": "pageview"}), "timestamp"),
            (
                json!({"site_id": "", "event_type": "pageview", "timestamp": "t"}),
                "site_id",
            ),
            (
                json!({"site_id": "s1", "event_type": null, "timestamp": "t"}),
                "event_type",
            ),
            (
                json!({"site_id": "s1", "event_type": "pageview", "timestamp": 0}),
                "timestamp",
            ),
        ];

        for (payload, field) in cases {
            let err = raw(payload.clone()).normalize().unwrap_err();
            assert_eq!(err, ValidationError::MissingField(field), "{payload}");
            assert_eq!(err.to_string(), format!("{field} is required"));
        }
    }

    #[test]
    fn coerces_scalars_to_strings() {
        let event = raw(json!({
            "site_id": 42,
            "event_type": true,
            "timestamp": 1762941600000u64,
            "user_id": 7
        }))
        .normalize()
        .unwrap();

        assert_eq!(event.site_id, "42");
        assert_eq!(event.event_type, "true");
        assert_eq!(event.timestamp, "1762941600000");
        assert_eq!(event.user_id.as_deref(), Some("7"));
    }

    #[test]
    fn falsy_optional_fields_fall_back_to_defaults() {
        let event = raw(json!({
            "site_id": "s1",
            "event_type": "pageview",
            "timestamp": "t",
            "path": "",
            "user_id": ""
        }))
        .normalize()
        .unwrap();

        assert_eq!(event.path, "/");
        assert_eq!(event.user_id, None);
    }

    #[test]
    fn normalization_is_a_fixed_point() {
        let once = raw(json!({
            "site_id": "s1",
            "event_type": "pageview",
            "timestamp": "2025-11-12T10:00:00Z",
            "referrer": "https://example.com"
        }))
        .normalize()
        .unwrap();

        let twice = RawEvent::from(once.clone()).normalize().unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn unknown_fields_are_carried_as_properties() {
        let event = raw(json!({
            "site_id": "s1",
            "event_type": "pageview",
            "timestamp": "t",
            "referrer": "https://example.com",
            "screen": {"w": 1280}
        }))
        .normalize()
        .unwrap();

        assert_eq!(event.properties.len(), 2);
        assert_eq!(event.properties["screen"], json!({"w": 1280}));

        let decoded = QueuedEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn derives_utc_date_partition() {
        let record = QueuedEvent {
            site_id: "s1".to_owned(),
            event_type: "pageview".to_owned(),
            path: "/".to_owned(),
            user_id: None,
            timestamp: "2025-11-12T23:30:00-02:00".to_owned(),
            properties: HashMap::new(),
        }
        .into_record()
        .unwrap();

        assert_eq!(record.date, "2025-11-13");
        assert_eq!(record.timestamp.to_rfc3339(), "2025-11-13T01:30:00+00:00");
    }

    #[test]
    fn accepts_common_timestamp_shapes() {
        let cases = [
            ("2025-11-12T10:00:00Z", "2025-11-12T10:00:00+00:00"),
            ("2025-11-12T10:00:00.250Z", "2025-11-12T10:00:00.250+00:00"),
            ("2025-11-12T10:00:00", "2025-11-12T10:00:00+00:00"),
            ("2025-11-12 10:00:00", "2025-11-12T10:00:00+00:00"),
            ("2025-11-12", "2025-11-12T00:00:00+00:00"),
            ("1762941600000", "2025-11-12T10:00:00+00:00"),
        ];

        for (input, expected) in cases {
            let parsed = parse_timestamp(input).unwrap();
            assert_eq!(parsed.to_rfc3339(), expected, "{input}");
        }
    }

    #[test]
    fn rejects_garbage_timestamps() {
        for input in ["", "yesterday", "2025-13-45", "12/11/2025"] {
            assert_eq!(
                parse_timestamp(input),
                Err(InvalidTimestamp(input.to_owned()))
            );
        }
    }

    #[test]
    fn record_defaults_survive_legacy_payloads() {
        let event = QueuedEvent::decode(
            br#"{"site_id":"s1","event_type":"pageview","path":"","user_id":"","timestamp":"2025-11-12"}"#,
        )
        .unwrap();
        let record = event.into_record().unwrap();

        assert_eq!(record.path, "/");
        assert_eq!(record.user_id, None);
        assert_eq!(record.date, "2025-11-12");
    }
}
