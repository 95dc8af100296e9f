use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::seq::index;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::Geohash;
use crate::error::HarvestError;
use crate::geohash::{Grid, decode_bbox};
use crate::geometry::{Area, BoundingBox, Coordinate};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tile {
    pub geohash: Geohash,
    pub centroid: Coordinate,
    pub bbox: BoundingBox,
    pub point_of_interest: bool,
}

impl Tile {
    pub fn from_geohash(geohash: Geohash, point_of_interest: bool) -> Self {
        let bbox = decode_bbox(&geohash);
        Self {
            centroid: bbox.centroid(),
            bbox,
            geohash,
            point_of_interest,
        }
    }
}

/// Seeded subsampling of the tiles that contain no point of interest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
    pub rate: f64,
    pub seed: u64,
}

impl Sampling {
    pub fn new(rate: f64, seed: u64) -> Result<Self, HarvestError> {
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(HarvestError::InvalidInput(format!(
                "sampling rate must be within (0, 1], got {rate}"
            )));
        }
        Ok(Self { rate, seed })
    }
}

/// Tiles sorted by geohash code, unique per code.
#[derive(Debug, Clone, PartialEq)]
pub struct TileSet {
    precision: usize,
    tiles: Vec<Tile>,
}

impl TileSet {
    pub(crate) fn from_map(precision: usize, map: BTreeMap<Geohash, bool>) -> Self {
        let tiles = map
            .into_iter()
            .map(|(geohash, point_of_interest)| Tile::from_geohash(geohash, point_of_interest))
            .collect();
        Self { precision, tiles }
    }

    pub fn precision(&self) -> usize {
        self.precision
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn get(&self, geohash: &Geohash) -> Option<&Tile> {
        self.tiles
            .binary_search_by(|tile| tile.geohash.cmp(geohash))
            .ok()
            .map(|index| &self.tiles[index])
    }

    pub fn points_of_interest(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.iter().filter(|tile| tile.point_of_interest)
    }
}

/// Decomposes a coverage area and/or points of interest into geohash tiles.
///
/// Every cell whose box touches a coverage polygon is kept, so the union of
/// returned boxes always contains the polygon interior. Point cells are
/// flagged as points of interest and never removed by sampling.
pub fn tile(
    coverage: Option<&Area>,
    points: Option<&[Coordinate]>,
    precision: usize,
    sampling: Option<Sampling>,
) -> Result<TileSet, HarvestError> {
    let has_points = points.map(|points| !points.is_empty()).unwrap_or(false);
    if coverage.is_none() && !has_points {
        return Err(HarvestError::InvalidInput(
            "a coverage polygon or at least one point of interest is required".to_string(),
        ));
    }
    let grid = Grid::new(precision)?;
    let mut cells = BTreeMap::<Geohash, bool>::new();

    if let Some(area) = coverage {
        for polygon in area.polygons() {
            for (hash, bbox) in grid.cells_in(&polygon.bbox())? {
                if polygon.intersects_bbox(&bbox) {
                    cells.entry(hash).or_insert(false);
                }
            }
        }
        debug!(cells = cells.len(), precision, "coverage tiled");
    }

    for point in points.unwrap_or_default() {
        point.validate()?;
        cells.insert(grid.encode(*point), true);
    }

    if let Some(sampling) = sampling {
        sample_negatives(&mut cells, sampling);
    }

    Ok(TileSet::from_map(precision, cells))
}

fn sample_negatives(cells: &mut BTreeMap<Geohash, bool>, sampling: Sampling) {
    let negatives: Vec<Geohash> = cells
        .iter()
        .filter(|(_, poi)| !**poi)
        .map(|(hash, _)| hash.clone())
        .collect();
    let total = negatives.len();
    let keep = ((total as f64) * sampling.rate).ceil() as usize;
    if keep >= total {
        return;
    }

    let mut rng = ChaCha8Rng::seed_from_u64(sampling.seed);
    let mut selected = vec![false; total];
    for chosen in index::sample(&mut rng, total, keep) {
        selected[chosen] = true;
    }
    for (hash, retained) in negatives.iter().zip(selected) {
        if !retained {
            cells.remove(hash);
        }
    }
    debug!(kept = keep, dropped = total - keep, seed = sampling.seed, "negative tiles sampled");
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::geometry::Polygon;

    fn rectangle(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Area {
        Polygon::new(
            vec![
                Coordinate::new(min_lon, min_lat),
                Coordinate::new(max_lon, min_lat),
                Coordinate::new(max_lon, max_lat),
                Coordinate::new(min_lon, max_lat),
            ],
            Vec::new(),
        )
        .unwrap()
        .into()
    }

    #[test]
    fn requires_some_input() {
        assert_matches!(tile(None, None, 5, None), Err(HarvestError::InvalidInput(_)));
        assert_matches!(tile(None, Some(&[][..]), 5, None), Err(HarvestError::InvalidInput(_)));
    }

    #[test]
    fn rejects_bad_sampling_rate() {
        assert!(Sampling::new(0.0, 1).is_err());
        assert!(Sampling::new(1.5, 1).is_err());
        assert!(Sampling::new(1.0, 1).is_ok());
    }

    #[test]
    fn tiles_are_sorted_and_flag_points() {
        let area = rectangle(10.0, 50.0, 10.2, 50.1);
        let points = [Coordinate::new(10.05, 50.05)];
        let set = tile(Some(&area), Some(&points[..]), 5, None).unwrap();
        let codes: Vec<_> = set.tiles().iter().map(|t| t.geohash.as_str()).collect();
        let mut sorted = codes.clone();
        sorted.sort();
        assert_eq!(codes, sorted);
        assert_eq!(set.points_of_interest().count(), 1);
    }

    #[test]
    fn points_outside_coverage_are_added() {
        let area = rectangle(10.0, 50.0, 10.04, 50.04);
        let far = [Coordinate::new(-3.0, 40.0)];
        let without = tile(Some(&area), None, 5, None).unwrap();
        let with = tile(Some(&area), Some(&far[..]), 5, None).unwrap();
        assert_eq!(with.len(), without.len() + 1);
    }

    #[test]
    fn sampling_is_reproducible_and_exempts_points() {
        let area = rectangle(10.0, 50.0, 10.5, 50.5);
        let points = [Coordinate::new(10.25, 50.25)];
        let sampling = Sampling::new(0.3, 42).unwrap();
        let first = tile(Some(&area), Some(&points[..]), 5, Some(sampling)).unwrap();
        let second = tile(Some(&area), Some(&points[..]), 5, Some(sampling)).unwrap();
        assert_eq!(first, second);

        let full = tile(Some(&area), Some(&points[..]), 5, None).unwrap();
        let negatives = full.len() - 1;
        let expected = ((negatives as f64) * 0.3).ceil() as usize;
        assert_eq!(first.len(), expected + 1);
        assert_eq!(first.points_of_interest().count(), 1);

        let other_seed = tile(Some(&area), Some(&points[..]), 5, Some(Sampling::new(0.3, 7).unwrap()))
            .unwrap();
        assert_ne!(first, other_seed);
    }
}
