use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

/// WGS84 position, longitude first as in GeoJSON.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lon: f64,
    pub lat: f64,
}

impl Coordinate {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    pub fn validate(&self) -> Result<(), HarvestError> {
        let in_range = self.lon.is_finite()
            && self.lat.is_finite()
            && (-180.0..=180.0).contains(&self.lon)
            && (-90.0..=90.0).contains(&self.lat);
        if !in_range {
            return Err(HarvestError::InvalidInput(format!(
                "coordinate out of range: lon={} lat={}",
                self.lon, self.lat
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    pub fn centroid(&self) -> Coordinate {
        Coordinate::new(
            (self.min_lon + self.max_lon) / 2.0,
            (self.min_lat + self.max_lat) / 2.0,
        )
    }

    pub fn contains(&self, point: Coordinate) -> bool {
        point.lon >= self.min_lon
            && point.lon <= self.max_lon
            && point.lat >= self.min_lat
            && point.lat <= self.max_lat
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
            && self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
    }

    fn corners(&self) -> [Coordinate; 4] {
        [
            Coordinate::new(self.min_lon, self.min_lat),
            Coordinate::new(self.max_lon, self.min_lat),
            Coordinate::new(self.max_lon, self.max_lat),
            Coordinate::new(self.min_lon, self.max_lat),
        ]
    }
}

/// A polygon with an exterior ring and optional holes.
///
/// Rings are stored without the closing vertex; GeoJSON input that repeats the
/// first vertex is normalized on construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    exterior: Vec<Coordinate>,
    holes: Vec<Vec<Coordinate>>,
}

impl Polygon {
    pub fn new(exterior: Vec<Coordinate>, holes: Vec<Vec<Coordinate>>) -> Result<Self, HarvestError> {
        let exterior = normalize_ring(exterior)?;
        let holes = holes
            .into_iter()
            .map(normalize_ring)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { exterior, holes })
    }

    pub fn exterior(&self) -> &[Coordinate] {
        &self.exterior
    }

    pub fn bbox(&self) -> BoundingBox {
        let mut bbox = BoundingBox::new(f64::MAX, f64::MAX, f64::MIN, f64::MIN);
        for point in &self.exterior {
            bbox.min_lon = bbox.min_lon.min(point.lon);
            bbox.min_lat = bbox.min_lat.min(point.lat);
            bbox.max_lon = bbox.max_lon.max(point.lon);
            bbox.max_lat = bbox.max_lat.max(point.lat);
        }
        bbox
    }

    /// Even-odd containment against the exterior minus holes.
    pub fn contains(&self, point: Coordinate) -> bool {
        ring_contains(&self.exterior, point)
            && !self.holes.iter().any(|hole| ring_contains(hole, point))
    }

    /// Whether the polygon's exterior shares any area with `bbox`.
    ///
    /// Holes are ignored, so a box lying entirely within a hole still counts.
    pub fn intersects_bbox(&self, bbox: &BoundingBox) -> bool {
        if !self.bbox().intersects(bbox) {
            return false;
        }
        if self.exterior.iter().any(|point| bbox.contains(*point)) {
            return true;
        }
        let corners = bbox.corners();
        if corners.iter().any(|corner| ring_contains(&self.exterior, *corner)) {
            return true;
        }
        let ring = &self.exterior;
        for i in 0..ring.len() {
            let a = ring[i];
            let b = ring[(i + 1) % ring.len()];
            for j in 0..corners.len() {
                let c = corners[j];
                let d = corners[(j + 1) % corners.len()];
                if segments_intersect(a, b, c, d) {
                    return true;
                }
            }
        }
        false
    }
}

/// A coverage area made of one or more polygons.
#[derive(Debug, Clone, PartialEq)]
pub struct Area {
    polygons: Vec<Polygon>,
}

impl Area {
    pub fn new(polygons: Vec<Polygon>) -> Result<Self, HarvestError> {
        if polygons.is_empty() {
            return Err(HarvestError::InvalidInput(
                "coverage area has no polygons".to_string(),
            ));
        }
        Ok(Self { polygons })
    }

    pub fn polygons(&self) -> &[Polygon] {
        &self.polygons
    }

    pub fn contains(&self, point: Coordinate) -> bool {
        self.polygons.iter().any(|polygon| polygon.contains(point))
    }
}

impl From<Polygon> for Area {
    fn from(value: Polygon) -> Self {
        Self {
            polygons: vec![value],
        }
    }
}

fn normalize_ring(mut ring: Vec<Coordinate>) -> Result<Vec<Coordinate>, HarvestError> {
    if ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    if ring.len() < 3 {
        return Err(HarvestError::InvalidInput(format!(
            "polygon ring needs at least 3 distinct vertices, got {}",
            ring.len()
        )));
    }
    for point in &ring {
        point.validate()?;
    }
    Ok(ring)
}

fn ring_contains(ring: &[Coordinate], point: Coordinate) -> bool {
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let pi = ring[i];
        let pj = ring[j];
        if (pi.lat > point.lat) != (pj.lat > point.lat) {
            let crossing = (pj.lon - pi.lon) * (point.lat - pi.lat) / (pj.lat - pi.lat) + pi.lon;
            if point.lon < crossing {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn orientation(a: Coordinate, b: Coordinate, c: Coordinate) -> f64 {
    (b.lon - a.lon) * (c.lat - a.lat) - (b.lat - a.lat) * (c.lon - a.lon)
}

fn on_segment(a: Coordinate, b: Coordinate, p: Coordinate) -> bool {
    p.lon >= a.lon.min(b.lon)
        && p.lon <= a.lon.max(b.lon)
        && p.lat >= a.lat.min(b.lat)
        && p.lat <= a.lat.max(b.lat)
}

fn segments_intersect(a: Coordinate, b: Coordinate, c: Coordinate, d: Coordinate) -> bool {
    let d1 = orientation(c, d, a);
    let d2 = orientation(c, d, b);
    let d3 = orientation(a, b, c);
    let d4 = orientation(a, b, d);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }
    (d1 == 0.0 && on_segment(c, d, a))
        || (d2 == 0.0 && on_segment(c, d, b))
        || (d3 == 0.0 && on_segment(a, b, c))
        || (d4 == 0.0 && on_segment(a, b, d))
}
