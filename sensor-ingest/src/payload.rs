//! Decoding of sensor messages received from the bus.
//!
//! Devices are not consistent about key names, so each field accepts a few aliases. The
//! first alias that is present and non-null wins, even if its value has the wrong type.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use sensor_common::event::{CandidateEvent, EventSource, Point, Severity, ValidationError};

const DEVICE_ID_KEYS: &[&str] = &["sensorId", "sensor_id"];
const LATITUDE_KEYS: &[&str] = &["latitude", "lat"];
const LONGITUDE_KEYS: &[&str] = &["longitude", "lng", "lon"];

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("payload is empty")]
    Empty,
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("{0} is missing or not a string")]
    NotAString(&'static str),
    #[error("{0} is missing or not a number")]
    NotANumber(&'static str),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

fn first<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find(|value| !value.is_null())
}

/// Turn one raw bus message into a validated candidate event.
pub fn parse_payload(
    raw: &[u8],
    received_at: DateTime<Utc>,
) -> Result<CandidateEvent, PayloadError> {
    if raw.is_empty() {
        return Err(PayloadError::Empty);
    }

    let value: Value = serde_json::from_slice(raw)?;
    let Value::Object(object) = value else {
        return Err(PayloadError::NotAnObject);
    };

    let device_id = first(&object, DEVICE_ID_KEYS)
        .and_then(Value::as_str)
        .ok_or(PayloadError::NotAString("sensorId"))?;
    let lat = first(&object, LATITUDE_KEYS)
        .and_then(Value::as_f64)
        .ok_or(PayloadError::NotANumber("latitude"))?;
    let lng = first(&object, LONGITUDE_KEYS)
        .and_then(Value::as_f64)
        .ok_or(PayloadError::NotANumber("longitude"))?;

    let location = Point::new(lat, lng)?;
    let mut candidate = CandidateEvent::new(EventSource::Bus, device_id, location)?
        .with_severity(Severity::coerce(
            object.get("severity").and_then(Value::as_str),
        ))
        .with_message_id(
            object
                .get("messageId")
                .and_then(Value::as_str)
                .map(str::to_owned),
        )
        .with_timestamp(object.get("timestamp").and_then(Value::as_f64))
        .with_received_at(received_at);

    if let Some(title) = object.get("title").and_then(Value::as_str) {
        candidate = candidate.with_title(title);
    }

    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use sensor_common::event::DEFAULT_TITLE;

    use super::*;

    fn parse(raw: &str) -> Result<CandidateEvent, PayloadError> {
        parse_payload(raw.as_bytes(), Utc::now())
    }

    #[test]
    fn test_full_payload() {
        let candidate = parse(
            r#"{"sensorId": "s1", "latitude": 41.31, "longitude": 69.24, "timestamp": 1738281600.5,
                "messageId": "m-1", "title": "Smoke detected", "severity": "HIGH"}"#,
        )
        .unwrap();

        assert_eq!(candidate.device_id(), "s1");
        assert_eq!(candidate.location(), Point::new(41.31, 69.24).unwrap());
        assert_eq!(candidate.timestamp(), Some(1738281600.5));
        assert_eq!(candidate.message_id(), Some("m-1"));
        assert_eq!(candidate.title(), "Smoke detected");
        assert_eq!(candidate.severity(), Severity::High);
        assert_eq!(candidate.source(), EventSource::Bus);
    }

    #[test]
    fn test_key_aliases_and_defaults() {
        let candidate = parse(r#"{"sensor_id": " s9 ", "lat": 40.0, "lon": 70.0}"#).unwrap();

        assert_eq!(candidate.device_id(), "s9");
        assert_eq!(candidate.location(), Point::new(40.0, 70.0).unwrap());
        assert_eq!(candidate.title(), DEFAULT_TITLE);
        assert_eq!(candidate.severity(), Severity::Medium);
        assert_eq!(candidate.message_id(), None);
        assert_eq!(candidate.timestamp(), None);

        let candidate = parse(r#"{"sensorId": "s9", "lat": 40.0, "lng": 70.0}"#).unwrap();
        assert_eq!(candidate.location().lng(), 70.0);
    }

    #[test]
    fn test_unknown_severity_becomes_medium() {
        let candidate =
            parse(r#"{"sensorId": "s1", "lat": 40.0, "lng": 70.0, "severity": "extreme"}"#)
                .unwrap();

        assert_eq!(candidate.severity(), Severity::Medium);
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(parse(""), Err(PayloadError::Empty)));
        assert!(matches!(parse("{not json"), Err(PayloadError::Json(_))));
        assert!(matches!(parse("[1, 2]"), Err(PayloadError::NotAnObject)));
        assert!(matches!(
            parse(r#"{"lat": 40.0, "lng": 70.0}"#),
            Err(PayloadError::NotAString("sensorId"))
        ));
        assert!(matches!(
            parse(r#"{"sensorId": 7, "lat": 40.0, "lng": 70.0}"#),
            Err(PayloadError::NotAString("sensorId"))
        ));
        assert!(matches!(
            parse(r#"{"sensorId": "s1", "lat": "40.0", "lng": 70.0}"#),
            Err(PayloadError::NotANumber("latitude"))
        ));
        assert!(matches!(
            parse(r#"{"sensorId": "s1", "lat": 40.0}"#),
            Err(PayloadError::NotANumber("longitude"))
        ));
        assert!(matches!(
            parse(r#"{"sensorId": "   ", "lat": 40.0, "lng": 70.0}"#),
            Err(PayloadError::Invalid(ValidationError::MissingDeviceId))
        ));
        assert!(matches!(
            parse(r#"{"sensorId": "s2", "lat": 90.5, "lng": 0}"#),
            Err(PayloadError::Invalid(ValidationError::LatitudeOutOfRange(_)))
        ));
    }

    #[test]
    fn test_null_alias_falls_through() {
        let candidate =
            parse(r#"{"sensorId": null, "sensor_id": "s3", "latitude": null, "lat": 1.0, "lng": 2.0}"#)
                .unwrap();

        assert_eq!(candidate.device_id(), "s3");
        assert_eq!(candidate.location().lat(), 1.0);
    }
}
