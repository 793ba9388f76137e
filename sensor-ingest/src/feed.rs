use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use sensor_common::event::{Severity, StoredEvent};

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("failed to encode event {id}: {error}")]
    Encode { id: Uuid, error: serde_json::Error },
}

/// The JSON shape of an event as seen by dashboard clients, both on the live feed and on the
/// recent events endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEvent {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

impl From<&StoredEvent> for FeedEvent {
    fn from(event: &StoredEvent) -> Self {
        FeedEvent {
            id: event.id,
            title: event.title.clone(),
            description: event.description.clone(),
            latitude: event.location.lat(),
            longitude: event.location.lng(),
            severity: event.severity,
            created_at: event.created_at,
        }
    }
}

/// Fire-and-forget delivery of stored events to live subscribers.
pub trait SubscriberFeed: Send + Sync {
    /// Returns how many subscribers the event was queued for. Having none is not an error.
    fn broadcast(&self, event: &StoredEvent) -> Result<usize, FeedError>;
}

/// A `SubscriberFeed` over a tokio broadcast channel.
///
/// Events are encoded once and shared by every receiver. A receiver that falls more than
/// `capacity` events behind loses the oldest ones; producers never wait on it.
pub struct BroadcastFeed {
    sender: broadcast::Sender<Arc<str>>,
}

impl BroadcastFeed {
    pub fn new(capacity: usize) -> Self {
        // broadcast::channel panics on a zero capacity.
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl SubscriberFeed for BroadcastFeed {
    fn broadcast(&self, event: &StoredEvent) -> Result<usize, FeedError> {
        let data = serde_json::to_string(&FeedEvent::from(event))
            .map_err(|error| FeedError::Encode { id: event.id, error })?;

        // send only fails when nobody is listening.
        Ok(self.sender.send(Arc::from(data)).unwrap_or(0))
    }
}
