use async_trait::async_trait;

use super::{BoundingBox, Geofence, GeofenceError};
use crate::event::Point;

/// A polygon with `(lng, lat)` vertices. Rings may be open or closed.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    exterior: Vec<(f64, f64)>,
    holes: Vec<Vec<(f64, f64)>>,
}

impl Polygon {
    pub fn new(exterior: Vec<(f64, f64)>) -> Self {
        Self {
            exterior,
            holes: Vec::new(),
        }
    }

    pub fn with_hole(mut self, hole: Vec<(f64, f64)>) -> Self {
        self.holes.push(hole);
        self
    }

    pub fn contains(&self, point: Point) -> bool {
        ring_contains(&self.exterior, point.lng(), point.lat())
            && !self
                .holes
                .iter()
                .any(|hole| ring_contains(hole, point.lng(), point.lat()))
    }
}

/// Even-odd ray casting. Rings with fewer than 3 vertices contain nothing.
fn ring_contains(ring: &[(f64, f64)], x: f64, y: f64) -> bool {
    if ring.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// A `Geofence` over an in-memory multipolygon.
#[derive(Debug, Clone, Default)]
pub struct PolygonGeofence {
    polygons: Vec<Polygon>,
}

impl PolygonGeofence {
    pub fn new(polygons: Vec<Polygon>) -> Self {
        Self { polygons }
    }

    /// An axis-aligned rectangle, handy when the real boundary is not available.
    pub fn rectangle(bbox: BoundingBox) -> Self {
        Self::new(vec![Polygon::new(vec![
            (bbox.lng_min, bbox.lat_min),
            (bbox.lng_max, bbox.lat_min),
            (bbox.lng_max, bbox.lat_max),
            (bbox.lng_min, bbox.lat_max),
        ])])
    }

    fn extent(&self) -> Option<BoundingBox> {
        let mut vertices = self.polygons.iter().flat_map(|p| p.exterior.iter());
        let &(first_lng, first_lat) = vertices.next()?;

        let (lng_min, lng_max, lat_min, lat_max) = vertices.fold(
            (first_lng, first_lng, first_lat, first_lat),
            |(lng_min, lng_max, lat_min, lat_max), &(lng, lat)| {
                (
                    lng_min.min(lng),
                    lng_max.max(lng),
                    lat_min.min(lat),
                    lat_max.max(lat),
                )
            },
        );

        BoundingBox::new(lng_min, lng_max, lat_min, lat_max)
    }
}

#[async_trait]
impl Geofence for PolygonGeofence {
    async fn contains(&self, point: Point) -> Result<bool, GeofenceError> {
        Ok(self.polygons.iter().any(|polygon| polygon.contains(point)))
    }

    async fn bounding_box(&self) -> Result<BoundingBox, GeofenceError> {
        self.extent().ok_or(GeofenceError::NoBoundary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(lat: f64, lng: f64) -> Point {
        Point::new(lat, lng).unwrap()
    }

    /// An L shape: the square [0,10]x[0,10] minus its upper right quadrant.
    fn l_shape() -> Polygon {
        Polygon::new(vec![
            (0.0, 0.0),
            (10.0, 0.0),
            (10.0, 5.0),
            (5.0, 5.0),
            (5.0, 10.0),
            (0.0, 10.0),
            (0.0, 0.0),
        ])
    }

    #[tokio::test]
    async fn test_concave_polygon() {
        let geofence = PolygonGeofence::new(vec![l_shape()]);

        assert!(geofence.contains(point(2.0, 2.0)).await.unwrap());
        assert!(geofence.contains(point(8.0, 2.0)).await.unwrap());
        assert!(!geofence.contains(point(8.0, 8.0)).await.unwrap());
        assert!(!geofence.contains(point(-1.0, 2.0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_holes_are_excluded() {
        let donut = Polygon::new(vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)])
            .with_hole(vec![(4.0, 4.0), (6.0, 4.0), (6.0, 6.0), (4.0, 6.0)]);
        let geofence = PolygonGeofence::new(vec![donut]);

        assert!(geofence.contains(point(2.0, 2.0)).await.unwrap());
        assert!(!geofence.contains(point(5.0, 5.0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_multipolygon_extent() {
        let west = Polygon::new(vec![(56.0, 41.0), (60.0, 41.0), (60.0, 45.6), (56.0, 45.6)]);
        let east = Polygon::new(vec![(64.0, 37.2), (73.2, 37.2), (73.2, 42.0), (64.0, 42.0)]);
        let geofence = PolygonGeofence::new(vec![west, east]);

        assert_eq!(
            geofence.bounding_box().await.unwrap(),
            BoundingBox::new(56.0, 73.2, 37.2, 45.6).unwrap()
        );
        assert!(geofence.contains(point(40.0, 70.0)).await.unwrap());
        // Inside the extent, outside both polygons.
        assert!(!geofence.contains(point(39.0, 62.0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_boundary_fails_closed() {
        let geofence = PolygonGeofence::default();

        assert!(!geofence.contains(point(41.31, 69.24)).await.unwrap());
        assert!(matches!(
            geofence.bounding_box().await,
            Err(GeofenceError::NoBoundary)
        ));
    }
}
