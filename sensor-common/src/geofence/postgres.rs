use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use thiserror::Error;

use super::{BoundingBox, Geofence, GeofenceError};
use crate::event::Point;

/// A table name that is safe to interpolate into a query.
/// sqlx cannot bind identifiers, so we only accept `[A-Za-z_][A-Za-z0-9_]*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0:?} is not a valid table name")]
pub struct InvalidTableName(pub String);

impl FromStr for TableName {
    type Err = InvalidTableName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let valid = match chars.next() {
            Some(first) => {
                (first.is_ascii_alphabetic() || first == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            None => false,
        };

        if valid {
            Ok(TableName(s.to_owned()))
        } else {
            Err(InvalidTableName(s.to_owned()))
        }
    }
}

impl TableName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A `Geofence` answered by PostGIS against a table of boundary (multi)polygons.
/// Every row of the table is part of the boundary.
#[derive(Clone)]
pub struct PgGeofence {
    pool: PgPool,
    table: TableName,
}

impl PgGeofence {
    pub fn new(pool: PgPool, table: TableName) -> Self {
        Self { pool, table }
    }
}

#[async_trait]
impl Geofence for PgGeofence {
    async fn contains(&self, point: Point) -> Result<bool, GeofenceError> {
        let query = format!(
            r#"
SELECT EXISTS (
    SELECT 1
    FROM "{0}"
    WHERE ST_Within(ST_SetSRID(ST_MakePoint($1, $2), 4326), geom)
)
            "#,
            &self.table
        );

        // An empty table yields false.
        sqlx::query_scalar::<_, bool>(&query)
            .bind(point.lng())
            .bind(point.lat())
            .fetch_one(&self.pool)
            .await
            .map_err(|error| GeofenceError::QueryError {
                command: "SELECT",
                error,
            })
    }

    async fn bounding_box(&self) -> Result<BoundingBox, GeofenceError> {
        let query = format!(
            r#"
SELECT
    ST_XMin(extent) AS lng_min,
    ST_XMax(extent) AS lng_max,
    ST_YMin(extent) AS lat_min,
    ST_YMax(extent) AS lat_max
FROM
    (SELECT ST_Extent(geom) AS extent FROM "{0}") AS boundary
            "#,
            &self.table
        );

        let (lng_min, lng_max, lat_min, lat_max): (
            Option<f64>,
            Option<f64>,
            Option<f64>,
            Option<f64>,
        ) = sqlx::query_as(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| GeofenceError::QueryError {
                command: "SELECT",
                error,
            })?;

        match (lng_min, lng_max, lat_min, lat_max) {
            (Some(lng_min), Some(lng_max), Some(lat_min), Some(lat_max)) => {
                BoundingBox::new(lng_min, lng_max, lat_min, lat_max)
                    .ok_or(GeofenceError::NoBoundary)
            }
            _ => Err(GeofenceError::NoBoundary),
        }
    }
}
