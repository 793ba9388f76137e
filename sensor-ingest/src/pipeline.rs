use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use sensor_common::dedupe::DedupeCache;
use sensor_common::event::{CandidateEvent, EventSource, StoredEvent};
use sensor_common::fingerprint::Fingerprint;
use sensor_common::geofence::Geofence;
use sensor_common::store::EventStore;

use crate::feed::SubscriberFeed;
use crate::metrics::{ADMISSIONS, FEED_RECEIVERS, PERSIST_DURATION};
use crate::notifier::Notifier;
use crate::payload::parse_payload;

/// Where a candidate event ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The raw payload could not be turned into a candidate event.
    Malformed,
    /// Seen within the dedupe window.
    Duplicate,
    OutsideGeofence,
    /// The geofence could not answer. The fingerprint was released.
    GeofenceUnavailable,
    /// The insert failed. The fingerprint was released.
    StoreFailed,
    Stored(StoredEvent),
}

impl Admission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Admission::Malformed => "malformed",
            Admission::Duplicate => "duplicate",
            Admission::OutsideGeofence => "outside_geofence",
            Admission::GeofenceUnavailable => "geofence_unavailable",
            Admission::StoreFailed => "store_failed",
            Admission::Stored(_) => "stored",
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, Admission::Stored(_))
    }
}

/// The admission path shared by every producer: dedupe, geofence, persist, fan out.
///
/// Each call runs to completion on the caller's task. Nothing is queued and nothing is
/// retried here, so a slow store slows the producer down.
#[derive(Clone)]
pub struct Pipeline {
    dedupe: Arc<DedupeCache>,
    geofence: Arc<dyn Geofence>,
    store: Arc<dyn EventStore>,
    feed: Arc<dyn SubscriberFeed>,
    notifier: Arc<dyn Notifier>,
}

impl Pipeline {
    pub fn new(
        dedupe: Arc<DedupeCache>,
        geofence: Arc<dyn Geofence>,
        store: Arc<dyn EventStore>,
        feed: Arc<dyn SubscriberFeed>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            dedupe,
            geofence,
            store,
            feed,
            notifier,
        }
    }

    /// Decode a raw bus message and admit it.
    pub async fn ingest_payload(&self, raw: &[u8], received_at: DateTime<Utc>) -> Admission {
        match parse_payload(raw, received_at) {
            Ok(candidate) => self.admit(candidate).await,
            Err(error) => {
                debug!(reason = %error, "dropping malformed payload");
                metrics::counter!(
                    ADMISSIONS,
                    "source" => EventSource::Bus.as_str(),
                    "outcome" => "malformed"
                )
                .increment(1);
                Admission::Malformed
            }
        }
    }

    pub async fn admit(&self, candidate: CandidateEvent) -> Admission {
        let source = candidate.source();
        let admission = self.run(candidate).await;

        metrics::counter!(ADMISSIONS, "source" => source.as_str(), "outcome" => admission.as_str())
            .increment(1);

        admission
    }

    async fn run(&self, candidate: CandidateEvent) -> Admission {
        let fingerprint = Fingerprint::of(&candidate);
        let location = candidate.location();

        // Claim the fingerprint before any I/O so a concurrent copy cannot get past here.
        if !self.dedupe.should_admit(&fingerprint) {
            debug!(
                device_id = candidate.device_id(),
                fingerprint = %fingerprint,
                "dropping duplicate event"
            );
            return Admission::Duplicate;
        }

        match self.geofence.contains(location).await {
            Ok(true) => {}
            Ok(false) => {
                // The fingerprint stays claimed to damp a source flapping outside the boundary.
                warn!(
                    device_id = candidate.device_id(),
                    lat = location.lat(),
                    lng = location.lng(),
                    fingerprint = %fingerprint,
                    "dropping event outside geofence"
                );
                return Admission::OutsideGeofence;
            }
            Err(err) => {
                self.dedupe.release(&fingerprint);
                error!(
                    device_id = candidate.device_id(),
                    lat = location.lat(),
                    lng = location.lng(),
                    fingerprint = %fingerprint,
                    reason = %err,
                    "dropping event, geofence check failed"
                );
                return Admission::GeofenceUnavailable;
            }
        }

        let start = Instant::now();
        let result = self.store.insert(candidate.to_new_event()).await;
        metrics::histogram!(PERSIST_DURATION).record(start.elapsed().as_secs_f64());

        let stored = match result {
            Ok(stored) => stored,
            Err(err) => {
                self.dedupe.release(&fingerprint);
                error!(
                    device_id = candidate.device_id(),
                    lat = location.lat(),
                    lng = location.lng(),
                    fingerprint = %fingerprint,
                    reason = %err,
                    "dropping event, failed to store it"
                );
                return Admission::StoreFailed;
            }
        };

        self.fan_out(&stored, candidate.source()).await;

        Admission::Stored(stored)
    }

    /// Deliver to both sinks concurrently. Each sink's failure is only logged.
    async fn fan_out(&self, stored: &StoredEvent, source: EventSource) {
        let broadcast = async {
            match self.feed.broadcast(stored) {
                Ok(receivers) => {
                    metrics::gauge!(FEED_RECEIVERS).set(receivers as f64);
                }
                Err(err) => {
                    warn!(event_id = %stored.id, reason = %err, "failed to broadcast event");
                }
            }
        };
        let notify = self.notifier.send_alert(stored, source);

        let ((), delivered) = tokio::join!(broadcast, notify);
        debug!(event_id = %stored.id, delivered, "event admitted");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use sensor_common::event::Point;
    use sensor_common::test_utils::{MemoryEventStore, StaticGeofence};

    use super::*;
    use crate::feed::BroadcastFeed;

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn send_alert(&self, _event: &StoredEvent, _source: EventSource) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn candidate(device_id: &str) -> CandidateEvent {
        CandidateEvent::new(EventSource::Bus, device_id, Point::new(41.31, 69.24).unwrap())
            .unwrap()
            .with_timestamp(Some(1738281600.0))
    }

    #[tokio::test]
    async fn test_geofence_failure_releases_fingerprint() {
        let dedupe = Arc::new(DedupeCache::default());
        let geofence = Arc::new(StaticGeofence::failing());
        let store = Arc::new(MemoryEventStore::new());
        let notifier = Arc::new(CountingNotifier::default());
        let pipeline = Pipeline::new(
            dedupe.clone(),
            geofence.clone(),
            store.clone(),
            Arc::new(BroadcastFeed::new(8)),
            notifier.clone(),
        );

        assert_eq!(
            pipeline.admit(candidate("s1")).await,
            Admission::GeofenceUnavailable
        );
        assert!(dedupe.is_empty());
        assert_eq!(store.attempts(), 0);

        geofence.set_mode(sensor_common::test_utils::GeofenceMode::Inside);
        assert!(pipeline.admit(candidate("s1")).await.is_stored());
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stored_event_reaches_feed_subscribers() {
        let feed = Arc::new(BroadcastFeed::new(8));
        let mut receiver = feed.subscribe();
        let pipeline = Pipeline::new(
            Arc::new(DedupeCache::default()),
            Arc::new(StaticGeofence::inside()),
            Arc::new(MemoryEventStore::new()),
            feed.clone(),
            Arc::new(CountingNotifier::default()),
        );

        let Admission::Stored(stored) = pipeline.admit(candidate("s1")).await else {
            panic!("expected the event to be stored");
        };

        let data = receiver.recv().await.unwrap();
        let event: crate::feed::FeedEvent = serde_json::from_str(&data).unwrap();
        assert_eq!(event.id, stored.id);
        assert_eq!(event.description.as_deref(), Some("sensorId: s1"));
    }

    #[tokio::test]
    async fn test_malformed_payload_touches_nothing() {
        let dedupe = Arc::new(DedupeCache::default());
        let geofence = Arc::new(StaticGeofence::inside());
        let store = Arc::new(MemoryEventStore::new());
        let pipeline = Pipeline::new(
            dedupe.clone(),
            geofence.clone(),
            store.clone(),
            Arc::new(BroadcastFeed::new(8)),
            Arc::new(CountingNotifier::default()),
        );

        let admission = pipeline
            .ingest_payload(br#"{"sensorId": "s1", "lat": "north"}"#, Utc::now())
            .await;

        assert_eq!(admission, Admission::Malformed);
        assert!(dedupe.is_empty());
        assert_eq!(geofence.checks(), 0);
        assert_eq!(store.attempts(), 0);
    }
}
