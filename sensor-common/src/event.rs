use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Titles longer than this are truncated, matching the `events.title` column.
pub const MAX_TITLE_CHARS: usize = 255;
pub const DEFAULT_TITLE: &str = "Sensor alert";

/// Reasons a candidate event is refused before it can reach the admission pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("device id is missing or blank")]
    MissingDeviceId,
    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid severity")]
pub struct ParseSeverityError(pub String);

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Lenient parse for untrusted input: anything missing or unknown becomes `Medium`.
    pub fn coerce(raw: Option<&str>) -> Self {
        raw.and_then(|s| s.parse().ok()).unwrap_or_default()
    }

    /// Low severity events are never pushed to external channels.
    pub fn is_alertable(&self) -> bool {
        !matches!(self, Severity::Low)
    }
}

impl FromStr for Severity {
    type Err = ParseSeverityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(ParseSeverityError(s.to_owned())),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A WGS84 coordinate. Can only be built with in-range, finite values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    lat: f64,
    lng: f64,
}

impl Point {
    pub fn new(lat: f64, lng: f64) -> Result<Self, ValidationError> {
        if !(-90.0..=90.0).contains(&lat) {
            return Err(ValidationError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(ValidationError::LongitudeOutOfRange(lng));
        }
        Ok(Self { lat, lng })
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lng(&self) -> f64 {
        self.lng
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}, {:.4}", self.lat, self.lng)
    }
}

/// Which producer built a candidate event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    Bus,
    Simulator,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Bus => "bus",
            EventSource::Simulator => "simulator",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reading offered to the admission pipeline by one of the producers.
///
/// The constructor enforces the structural invariants (non-blank device id, in-range
/// coordinates), so a value of this type is always safe to fingerprint and geofence.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateEvent {
    device_id: String,
    location: Point,
    message_id: Option<String>,
    timestamp: Option<f64>,
    title: String,
    severity: Severity,
    source: EventSource,
    received_at: DateTime<Utc>,
}

impl CandidateEvent {
    pub fn new(
        source: EventSource,
        device_id: &str,
        location: Point,
    ) -> Result<Self, ValidationError> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(ValidationError::MissingDeviceId);
        }

        Ok(Self {
            device_id: device_id.to_owned(),
            location,
            message_id: None,
            timestamp: None,
            title: DEFAULT_TITLE.to_owned(),
            severity: Severity::default(),
            source,
            received_at: Utc::now(),
        })
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.chars().take(MAX_TITLE_CHARS).collect();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Blank ids are ignored so the composite fingerprint is used instead.
    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id.filter(|id| !id.is_empty());
        self
    }

    /// Origin time in epoch seconds, as reported by the device.
    pub fn with_timestamp(mut self, timestamp: Option<f64>) -> Self {
        self.timestamp = timestamp.filter(|ts| ts.is_finite());
        self
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn location(&self) -> Point {
        self.location
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn timestamp(&self) -> Option<f64> {
        self.timestamp
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn source(&self) -> EventSource {
        self.source
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn description(&self) -> String {
        match self.source {
            EventSource::Bus => format!("sensorId: {}", self.device_id),
            EventSource::Simulator => "sensor-simulator".to_owned(),
        }
    }

    pub fn to_new_event(&self) -> NewEvent {
        NewEvent {
            title: self.title.clone(),
            description: Some(self.description()),
            severity: self.severity,
            location: self.location,
        }
    }
}

/// The row handed to an `EventStore` for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub title: String,
    pub description: Option<String>,
    pub severity: Severity,
    pub location: Point,
}

/// The canonical record returned by the store after insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub severity: Severity,
    pub location: Point,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_coercion() {
        assert_eq!(Severity::coerce(Some("HIGH")), Severity::High);
        assert_eq!(Severity::coerce(Some(" critical ")), Severity::Critical);
        assert_eq!(Severity::coerce(Some("apocalyptic")), Severity::Medium);
        assert_eq!(Severity::coerce(None), Severity::Medium);
    }

    #[test]
    fn test_only_low_is_not_alertable() {
        assert!(!Severity::Low.is_alertable());
        assert!(Severity::Medium.is_alertable());
        assert!(Severity::High.is_alertable());
        assert!(Severity::Critical.is_alertable());
    }

    #[test]
    fn test_point_rejects_out_of_range() {
        assert_eq!(
            Point::new(90.5, 0.0),
            Err(ValidationError::LatitudeOutOfRange(90.5))
        );
        assert_eq!(
            Point::new(0.0, -180.01),
            Err(ValidationError::LongitudeOutOfRange(-180.01))
        );
        assert!(Point::new(f64::NAN, 0.0).is_err());
        assert!(Point::new(-90.0, 180.0).is_ok());
    }

    #[test]
    fn test_candidate_requires_device_id() {
        let location = Point::new(41.31, 69.24).unwrap();

        assert_eq!(
            CandidateEvent::new(EventSource::Bus, "   ", location),
            Err(ValidationError::MissingDeviceId)
        );

        let candidate = CandidateEvent::new(EventSource::Bus, "  s1 ", location).unwrap();
        assert_eq!(candidate.device_id(), "s1");
        assert_eq!(candidate.title(), DEFAULT_TITLE);
        assert_eq!(candidate.severity(), Severity::Medium);
        assert_eq!(candidate.description(), "sensorId: s1");
    }

    #[test]
    fn test_title_is_truncated_by_chars() {
        let location = Point::new(41.31, 69.24).unwrap();
        let long_title = "ё".repeat(300);

        let candidate = CandidateEvent::new(EventSource::Simulator, "sim", location)
            .unwrap()
            .with_title(&long_title);

        assert_eq!(candidate.title().chars().count(), MAX_TITLE_CHARS);
        assert_eq!(candidate.description(), "sensor-simulator");
    }

    #[test]
    fn test_blank_message_id_is_dropped() {
        let location = Point::new(41.31, 69.24).unwrap();
        let candidate = CandidateEvent::new(EventSource::Bus, "s1", location)
            .unwrap()
            .with_message_id(Some(String::new()));

        assert_eq!(candidate.message_id(), None);
    }
}
