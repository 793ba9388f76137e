use async_trait::async_trait;
use thiserror::Error;

use crate::event::Point;

pub mod polygon;
pub mod postgres;

pub use polygon::{Polygon, PolygonGeofence};
pub use postgres::{PgGeofence, TableName};

#[derive(Error, Debug)]
pub enum GeofenceError {
    #[error("no boundary polygon is loaded")]
    NoBoundary,
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: &'static str,
        error: sqlx::Error,
    },
}

/// Axis-aligned bounds of the boundary, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub lng_min: f64,
    pub lng_max: f64,
    pub lat_min: f64,
    pub lat_max: f64,
}

impl BoundingBox {
    /// Returns `None` for non-finite or inverted bounds.
    pub fn new(lng_min: f64, lng_max: f64, lat_min: f64, lat_max: f64) -> Option<Self> {
        let finite = [lng_min, lng_max, lat_min, lat_max]
            .iter()
            .all(|v| v.is_finite());
        if !finite || lng_min > lng_max || lat_min > lat_max {
            return None;
        }
        Some(Self {
            lng_min,
            lng_max,
            lat_min,
            lat_max,
        })
    }

    pub fn contains(&self, point: Point) -> bool {
        (self.lng_min..=self.lng_max).contains(&point.lng())
            && (self.lat_min..=self.lat_max).contains(&point.lat())
    }
}

/// Admission boundary for sensor events.
///
/// Implementations must fail closed: with no boundary loaded, `contains` answers `false`
/// and `bounding_box` returns `GeofenceError::NoBoundary`.
#[async_trait]
pub trait Geofence: Send + Sync {
    async fn contains(&self, point: Point) -> Result<bool, GeofenceError>;

    async fn bounding_box(&self) -> Result<BoundingBox, GeofenceError>;
}
