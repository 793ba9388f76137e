use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use uuid::Uuid;

use tracing::warn;

use crate::event::{NewEvent, Point, Severity, StoredEvent, ValidationError};
use crate::geofence::BoundingBox;

/// Errors from event persistence. Errors originate from sqlx and are wrapped to provide
/// additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("stored row {id} is not a valid event: {error}")]
    InvalidRow { id: Uuid, error: ValidationError },
}

/// Append-only persistence of admitted events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert one event and return the canonical stored record.
    async fn insert(&self, event: NewEvent) -> Result<StoredEvent, StoreError>;
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    title: String,
    description: Option<String>,
    severity: String,
    latitude: f64,
    longitude: f64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for StoredEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let location = Point::new(row.latitude, row.longitude)
            .map_err(|error| StoreError::InvalidRow { id: row.id, error })?;

        Ok(StoredEvent {
            id: row.id,
            title: row.title,
            description: row.description,
            // Rows written by other tools may carry anything in this column.
            severity: Severity::coerce(Some(&row.severity)),
            location,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// An `EventStore` backed by the PostGIS `events` table.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Most recent events first, optionally restricted to a bounding box.
    /// Rows that do not map to a valid event are skipped.
    pub async fn recent(
        &self,
        bbox: Option<BoundingBox>,
        limit: i64,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
SELECT
    id, title, description, severity, created_at, updated_at,
    ST_Y(location) AS latitude,
    ST_X(location) AS longitude
FROM
    events
WHERE
    $1::float8 IS NULL
    OR location && ST_MakeEnvelope($1, $2, $3, $4, 4326)
ORDER BY
    created_at DESC
LIMIT $5
            "#,
        )
        .bind(bbox.map(|b| b.lng_min))
        .bind(bbox.map(|b| b.lat_min))
        .bind(bbox.map(|b| b.lng_max))
        .bind(bbox.map(|b| b.lat_max))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT",
            error,
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match StoredEvent::try_from(row) {
                Ok(event) => Some(event),
                Err(error) => {
                    warn!("skipping event row: {}", error);
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert(&self, event: NewEvent) -> Result<StoredEvent, StoreError> {
        let row: EventRow = sqlx::query_as(
            r#"
INSERT INTO events
    (title, description, location, severity)
VALUES
    ($1, $2, ST_SetSRID(ST_MakePoint($3, $4), 4326), $5)
RETURNING
    id, title, description, severity, created_at, updated_at,
    ST_Y(location) AS latitude,
    ST_X(location) AS longitude
            "#,
        )
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.location.lng())
        .bind(event.location.lat())
        .bind(event.severity.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT",
            error,
        })?;

        StoredEvent::try_from(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_event(title: &str, severity: Severity, lat: f64, lng: f64) -> NewEvent {
        NewEvent {
            title: title.to_owned(),
            description: Some("sensorId: s1".to_owned()),
            severity,
            location: Point::new(lat, lng).unwrap(),
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostGIS database"]
    async fn test_insert_returns_canonical_record(db: PgPool) {
        let store = PgEventStore::new_from_pool(db);

        let stored = store
            .insert(new_event("Smoke detected", Severity::High, 41.31, 69.24))
            .await
            .expect("failed to insert event");

        assert_eq!(stored.title, "Smoke detected");
        assert_eq!(stored.severity, Severity::High);
        assert_eq!(stored.description.as_deref(), Some("sensorId: s1"));
        assert_eq!(stored.location, Point::new(41.31, 69.24).unwrap());
        assert_eq!(stored.created_at, stored.updated_at);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostGIS database"]
    async fn test_recent_filters_by_bbox(db: PgPool) {
        let store = PgEventStore::new_from_pool(db);
        store
            .insert(new_event("Tashkent", Severity::Low, 41.31, 69.24))
            .await
            .unwrap();
        store
            .insert(new_event("London", Severity::Low, 51.5, -0.12))
            .await
            .unwrap();

        let all = store.recent(None, 500).await.unwrap();
        assert_eq!(all.len(), 2);

        let bbox = BoundingBox::new(56.0, 73.2, 37.2, 45.6).unwrap();
        let inside = store.recent(Some(bbox), 500).await.unwrap();
        assert_eq!(inside.len(), 1);
        assert_eq!(inside[0].title, "Tashkent");
    }
}
