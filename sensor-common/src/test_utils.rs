//! In-memory doubles for the store and geofence seams, for use in tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::event::{NewEvent, Point, StoredEvent};
use crate::geofence::{BoundingBox, Geofence, GeofenceError};
use crate::store::{EventStore, StoreError};

/// An `EventStore` that keeps inserted events in a `Vec` and can be told to fail.
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<StoredEvent>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following insert fail until called again with `false`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<StoredEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts attempted so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(&self, event: NewEvent) -> Result<StoredEvent, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::QueryError {
                command: "INSERT",
                error: sqlx::Error::PoolTimedOut,
            });
        }

        let now = Utc::now();
        let stored = StoredEvent {
            id: Uuid::now_v7(),
            title: event.title,
            description: event.description,
            severity: event.severity,
            location: event.location,
            created_at: now,
            updated_at: now,
        };

        self.events.lock().unwrap().push(stored.clone());
        Ok(stored)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeofenceMode {
    Inside,
    Outside,
    Failing,
}

/// A `Geofence` with a fixed answer, counting how often it is asked.
pub struct StaticGeofence {
    mode: Mutex<GeofenceMode>,
    bbox: Option<BoundingBox>,
    checks: AtomicUsize,
}

impl StaticGeofence {
    pub fn new(mode: GeofenceMode, bbox: Option<BoundingBox>) -> Self {
        Self {
            mode: Mutex::new(mode),
            bbox,
            checks: AtomicUsize::new(0),
        }
    }

    pub fn inside() -> Self {
        Self::new(GeofenceMode::Inside, None)
    }

    pub fn outside() -> Self {
        Self::new(GeofenceMode::Outside, None)
    }

    pub fn failing() -> Self {
        Self::new(GeofenceMode::Failing, None)
    }

    pub fn set_mode(&self, mode: GeofenceMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Geofence for StaticGeofence {
    async fn contains(&self, _point: Point) -> Result<bool, GeofenceError> {
        self.checks.fetch_add(1, Ordering::SeqCst);

        match *self.mode.lock().unwrap() {
            GeofenceMode::Inside => Ok(true),
            GeofenceMode::Outside => Ok(false),
            GeofenceMode::Failing => Err(GeofenceError::QueryError {
                command: "SELECT",
                error: sqlx::Error::PoolTimedOut,
            }),
        }
    }

    async fn bounding_box(&self) -> Result<BoundingBox, GeofenceError> {
        self.bbox.ok_or(GeofenceError::NoBoundary)
    }
}
