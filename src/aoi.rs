//! Coverage and point-of-interest input files.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::HarvestError;
use crate::geometry::{Area, Coordinate, Polygon};

type Position = Vec<f64>;
type Ring = Vec<Position>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
enum Geometry {
    Point(Position),
    MultiPoint(Vec<Position>),
    Polygon(Vec<Ring>),
    MultiPolygon(Vec<Vec<Ring>>),
    // Accepted so mixed files parse; not used for tiling.
    #[allow(dead_code)]
    LineString(Vec<Position>),
    #[allow(dead_code)]
    MultiLineString(Vec<Vec<Position>>),
}

/// Geometries of a FeatureCollection, a single Feature or a bare geometry.
fn geometries(value: Value) -> Result<Vec<Geometry>, String> {
    let features = match value.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => match value.get("features") {
            Some(Value::Array(features)) => features.clone(),
            _ => return Err("FeatureCollection without features".to_string()),
        },
        Some("Feature") => vec![value],
        Some(_) => return Ok(vec![parse_geometry(value)?]),
        None => return Err("missing `type` member".to_string()),
    };

    let mut geometries = Vec::new();
    for feature in features {
        match feature.get("geometry") {
            None | Some(Value::Null) => {}
            Some(geometry) => geometries.push(parse_geometry(geometry.clone())?),
        }
    }
    Ok(geometries)
}

fn parse_geometry(value: Value) -> Result<Geometry, String> {
    serde_json::from_value(value).map_err(|err| err.to_string())
}

/// Reads a coverage area from GeoJSON. Non-polygon geometries are ignored.
pub fn load_coverage(path: &Path) -> Result<Area, HarvestError> {
    let geojson_err = |reason: String| HarvestError::GeoJson {
        path: path.display().to_string(),
        reason,
    };
    let geometries = geometries(read_geojson(path)?).map_err(geojson_err)?;

    let mut polygons = Vec::new();
    for geometry in geometries {
        match geometry {
            Geometry::Polygon(rings) => polygons.push(polygon(rings).map_err(geojson_err)?),
            Geometry::MultiPolygon(parts) => {
                for rings in parts {
                    polygons.push(polygon(rings).map_err(geojson_err)?);
                }
            }
            _ => {}
        }
    }
    if polygons.is_empty() {
        return Err(geojson_err("no Polygon or MultiPolygon geometry found".to_string()));
    }
    Area::new(polygons)
}

/// Reads points of interest from GeoJSON, or from CSV when the file has a
/// `.csv` extension.
pub fn load_points(path: &Path) -> Result<Vec<Coordinate>, HarvestError> {
    let is_csv = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);
    if is_csv {
        return load_points_csv(path);
    }

    let geojson_err = |reason: String| HarvestError::GeoJson {
        path: path.display().to_string(),
        reason,
    };
    let mut points = Vec::new();
    for geometry in geometries(read_geojson(path)?).map_err(geojson_err)? {
        match geometry {
            Geometry::Point(position) => points.push(coordinate(&position).map_err(geojson_err)?),
            Geometry::MultiPoint(positions) => {
                for position in positions {
                    points.push(coordinate(&position).map_err(geojson_err)?);
                }
            }
            _ => {}
        }
    }
    Ok(points)
}

/// CSV with a header row naming latitude and longitude columns
/// (`lat`/`latitude`, `lon`/`lng`/`long`/`longitude`, any case).
pub fn load_points_csv(path: &Path) -> Result<Vec<Coordinate>, HarvestError> {
    let csv_err = |reason: String| HarvestError::Csv {
        path: path.display().to_string(),
        reason,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|err| csv_err(err.to_string()))?;

    let headers = reader.headers().map_err(|err| csv_err(err.to_string()))?.clone();
    let find = |names: &[&str]| {
        headers
            .iter()
            .position(|header| names.iter().any(|name| header.eq_ignore_ascii_case(name)))
    };
    let lat_idx = find(&["lat", "latitude"]).ok_or_else(|| csv_err("missing latitude column".to_string()))?;
    let lon_idx = find(&["lon", "lng", "long", "longitude"])
        .ok_or_else(|| csv_err("missing longitude column".to_string()))?;

    let mut points = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|err| csv_err(err.to_string()))?;
        let parse = |idx: usize| -> Result<f64, HarvestError> {
            let raw = record.get(idx).unwrap_or_default();
            raw.parse::<f64>()
                .map_err(|_| csv_err(format!("row {}: `{raw}` is not a number", row + 2)))
        };
        let point = Coordinate::new(parse(lon_idx)?, parse(lat_idx)?);
        point.validate()?;
        points.push(point);
    }
    Ok(points)
}

fn read_geojson(path: &Path) -> Result<Value, HarvestError> {
    let content = fs::read_to_string(path).map_err(|err| HarvestError::GeoJson {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|err| HarvestError::GeoJson {
        path: path.display().to_string(),
        reason: err.to_string(),
    })
}

fn coordinate(position: &[f64]) -> Result<Coordinate, String> {
    match position {
        [lon, lat, ..] => {
            let point = Coordinate::new(*lon, *lat);
            point.validate().map_err(|err| err.to_string())?;
            Ok(point)
        }
        _ => Err(format!("position needs two values, got {}", position.len())),
    }
}

fn polygon(rings: Vec<Ring>) -> Result<Polygon, String> {
    let mut rings = rings.into_iter().map(|ring| {
        ring.iter()
            .map(|position| coordinate(position))
            .collect::<Result<Vec<_>, _>>()
    });
    let exterior = rings.next().ok_or_else(|| "polygon without rings".to_string())??;
    let holes = rings.collect::<Result<Vec<_>, _>>()?;
    Polygon::new(exterior, holes).map_err(|err| err.to_string())
}
