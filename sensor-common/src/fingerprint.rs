use std::fmt;

use crate::event::CandidateEvent;

/// Dedupe key for a candidate event.
///
/// A producer supplied message id is used verbatim. Otherwise the key is the device id,
/// the coordinates rounded to 4 decimals and the origin time floored to the second,
/// falling back to the receipt time when the device did not report one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(event: &CandidateEvent) -> Self {
        if let Some(message_id) = event.message_id() {
            return Fingerprint(message_id.to_owned());
        }

        let bucket = match event.timestamp() {
            Some(ts) => ts.floor() as i64,
            None => event.received_at().timestamp(),
        };
        let location = event.location();

        Fingerprint(format!(
            "{}:{:.4}:{:.4}:{}",
            event.device_id(),
            location.lat(),
            location.lng(),
            bucket
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Fingerprint {
    fn from(key: &str) -> Self {
        Fingerprint(key.to_owned())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::event::{EventSource, Point};

    fn candidate() -> CandidateEvent {
        CandidateEvent::new(
            EventSource::Bus,
            "s1",
            Point::new(41.311_149, 69.240_562).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_message_id_wins() {
        let event = candidate().with_message_id(Some("msg-42".to_owned()));

        assert_eq!(Fingerprint::of(&event).as_str(), "msg-42");
    }

    #[test]
    fn test_composite_uses_rounded_coordinates_and_floored_timestamp() {
        let event = candidate().with_timestamp(Some(1_738_281_600.987));

        assert_eq!(
            Fingerprint::of(&event).as_str(),
            "s1:41.3111:69.2406:1738281600"
        );
    }

    #[test]
    fn test_receipt_time_is_bucketed_to_the_second() {
        let received_at = Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap();
        let first = candidate().with_received_at(received_at + Duration::microseconds(10));
        let second = candidate().with_received_at(received_at + Duration::microseconds(900_000));
        let later = candidate().with_received_at(received_at + Duration::seconds(2));

        assert_eq!(Fingerprint::of(&first), Fingerprint::of(&second));
        assert_ne!(Fingerprint::of(&first), Fingerprint::of(&later));
    }

    #[test]
    fn test_origin_timestamp_ignores_receipt_time() {
        let received_at = Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap();
        let first = candidate()
            .with_timestamp(Some(1_738_324_800.0))
            .with_received_at(received_at);
        let second = candidate()
            .with_timestamp(Some(1_738_324_800.0))
            .with_received_at(received_at + Duration::seconds(2));

        assert_eq!(Fingerprint::of(&first), Fingerprint::of(&second));
    }
}
