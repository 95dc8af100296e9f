//! Geohash encoding on an integer grid.
//!
//! A geohash of precision `p` carries `5p` bits, interleaved longitude-first.
//! Working with the (column, row) indices of that grid instead of repeated
//! float bisection keeps cell enumeration exact: neighbouring cells never
//! overlap and never leave gaps.

use crate::domain::{GEOHASH_ALPHABET, Geohash, MAX_PRECISION};
use crate::error::HarvestError;
use crate::geometry::{BoundingBox, Coordinate};

/// Upper bound on cells enumerated for a single bounding box.
pub const MAX_CELLS: u64 = 4_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    precision: usize,
    lon_bits: u32,
    lat_bits: u32,
}

impl Grid {
    pub fn new(precision: usize) -> Result<Self, HarvestError> {
        if precision == 0 || precision > MAX_PRECISION {
            return Err(HarvestError::InvalidInput(format!(
                "geohash precision must be within 1..={MAX_PRECISION}, got {precision}"
            )));
        }
        let bits = 5 * precision as u32;
        Ok(Self {
            precision,
            lon_bits: bits.div_ceil(2),
            lat_bits: bits / 2,
        })
    }

    pub fn precision(&self) -> usize {
        self.precision
    }

    pub fn cell_width(&self) -> f64 {
        360.0 / (1u64 << self.lon_bits) as f64
    }

    pub fn cell_height(&self) -> f64 {
        180.0 / (1u64 << self.lat_bits) as f64
    }

    fn columns(&self) -> u64 {
        1u64 << self.lon_bits
    }

    fn rows(&self) -> u64 {
        1u64 << self.lat_bits
    }

    fn column_of(&self, lon: f64) -> u64 {
        let raw = ((lon + 180.0) / self.cell_width()).floor();
        (raw.max(0.0) as u64).min(self.columns() - 1)
    }

    fn row_of(&self, lat: f64) -> u64 {
        let raw = ((lat + 90.0) / self.cell_height()).floor();
        (raw.max(0.0) as u64).min(self.rows() - 1)
    }

    pub fn encode(&self, point: Coordinate) -> Geohash {
        self.encode_cell(self.column_of(point.lon), self.row_of(point.lat))
    }

    fn encode_cell(&self, column: u64, row: u64) -> Geohash {
        let total = self.lon_bits + self.lat_bits;
        let mut lon_left = self.lon_bits;
        let mut lat_left = self.lat_bits;
        let mut code = String::with_capacity(self.precision);
        let mut chunk = 0u8;
        for position in 0..total {
            let bit = if position % 2 == 0 {
                lon_left -= 1;
                (column >> lon_left) & 1
            } else {
                lat_left -= 1;
                (row >> lat_left) & 1
            };
            chunk = (chunk << 1) | bit as u8;
            if position % 5 == 4 {
                code.push(GEOHASH_ALPHABET[chunk as usize] as char);
                chunk = 0;
            }
        }
        Geohash::from_validated(code)
    }

    /// Cells whose box intersects `bbox`, in row-major order.
    pub fn cells_in(&self, bbox: &BoundingBox) -> Result<Vec<(Geohash, BoundingBox)>, HarvestError> {
        let first_column = self.column_of(bbox.min_lon);
        let last_column = self.column_of(bbox.max_lon);
        let first_row = self.row_of(bbox.min_lat);
        let last_row = self.row_of(bbox.max_lat);
        let count = (last_column - first_column + 1) * (last_row - first_row + 1);
        if count > MAX_CELLS {
            return Err(HarvestError::InvalidInput(format!(
                "coverage spans {count} cells at precision {}, limit is {MAX_CELLS}",
                self.precision
            )));
        }

        let mut cells = Vec::with_capacity(count as usize);
        for row in first_row..=last_row {
            for column in first_column..=last_column {
                cells.push((self.encode_cell(column, row), self.cell_bbox(column, row)));
            }
        }
        Ok(cells)
    }

    fn cell_bbox(&self, column: u64, row: u64) -> BoundingBox {
        let width = self.cell_width();
        let height = self.cell_height();
        let min_lon = -180.0 + column as f64 * width;
        let min_lat = -90.0 + row as f64 * height;
        BoundingBox::new(min_lon, min_lat, min_lon + width, min_lat + height)
    }
}

pub fn encode(point: Coordinate, precision: usize) -> Result<Geohash, HarvestError> {
    point.validate()?;
    Ok(Grid::new(precision)?.encode(point))
}

pub fn decode_bbox(hash: &Geohash) -> BoundingBox {
    let mut column = 0u64;
    let mut row = 0u64;
    let mut position = 0usize;
    for byte in hash.as_str().bytes() {
        let value = GEOHASH_ALPHABET
            .iter()
            .position(|ch| *ch == byte)
            .unwrap_or(0) as u64;
        for shift in (0..5).rev() {
            let bit = (value >> shift) & 1;
            if position % 2 == 0 {
                column = (column << 1) | bit;
            } else {
                row = (row << 1) | bit;
            }
            position += 1;
        }
    }
    let lon_bits = position.div_ceil(2) as u32;
    let lat_bits = (position / 2) as u32;
    let width = 360.0 / (1u64 << lon_bits) as f64;
    let height = 180.0 / (1u64 << lat_bits) as f64;
    let min_lon = -180.0 + column as f64 * width;
    let min_lat = -90.0 + row as f64 * height;
    BoundingBox::new(min_lon, min_lat, min_lon + width, min_lat + height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_known_reference_points() {
        // Jutland, the canonical geohash example
        let hash = encode(Coordinate::new(10.40744, 57.64911), 11).unwrap();
        assert_eq!(hash.as_str(), "u4pruydqqvj");

        let hash = encode(Coordinate::new(-122.4194, 37.7749), 5).unwrap();
        assert_eq!(hash.as_str(), "9q8yy");
    }

    #[test]
    fn decode_contains_encoded_point() {
        let point = Coordinate::new(-0.1278, 51.5074);
        for precision in 1..=MAX_PRECISION {
            let hash = encode(point, precision).unwrap();
            let bbox = decode_bbox(&hash);
            assert!(bbox.contains(point), "precision {precision}: {bbox:?}");
        }
    }

    #[test]
    fn cell_dimensions_match_precision_five() {
        let grid = Grid::new(5).unwrap();
        assert!((grid.cell_width() - 0.0439453125).abs() < 1e-12);
        assert!((grid.cell_height() - 0.0439453125).abs() < 1e-12);
    }

    #[test]
    fn cells_in_bbox_are_unique_and_cover() {
        let grid = Grid::new(4).unwrap();
        let bbox = BoundingBox::new(10.0, 50.0, 10.9, 50.5);
        let cells = grid.cells_in(&bbox).unwrap();
        let mut codes: Vec<_> = cells.iter().map(|(hash, _)| hash.clone()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), cells.len());
        for (hash, cell) in &cells {
            assert_eq!(decode_bbox(hash), *cell);
            assert!(cell.intersects(&bbox));
        }
    }

    #[test]
    fn rejects_precision_out_of_range() {
        assert!(Grid::new(0).is_err());
        assert!(Grid::new(13).is_err());
    }

    #[test]
    fn poles_and_antimeridian_clamp_to_grid() {
        let hash = encode(Coordinate::new(180.0, 90.0), 3).unwrap();
        assert_eq!(hash.as_str(), "zzz");
        let hash = encode(Coordinate::new(-180.0, -90.0), 3).unwrap();
        assert_eq!(hash.as_str(), "000");
    }
}
