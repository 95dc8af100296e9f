//! Request planning and the persisted request manifest.
//!
//! A manifest stores the resolved tile codes and window bounds rather than the
//! parameters that produced them, so replaying it never depends on re-running
//! the tiler, the windower or the sampling RNG.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use chrono::NaiveDate;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{CollectionId, Geohash, MAX_PRECISION, RequestKey};
use crate::error::HarvestError;
use crate::store;
use crate::tiler::{Sampling, Tile, TileSet};
use crate::window::{RemainderPolicy, TimeWindow};

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One unit of fetch work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchRequest {
    pub key: RequestKey,
    pub tile: Tile,
    pub window: TimeWindow,
    pub collection: CollectionId,
    pub channels: Vec<String>,
}

/// How the manifest's tiles and windows were produced. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Provenance {
    #[serde(default)]
    pub interval_days: Option<i64>,
    #[serde(default)]
    pub remainder: Option<RemainderPolicy>,
    #[serde(default)]
    pub sampling: Option<Sampling>,
    #[serde(default)]
    pub coverage_file: Option<String>,
    #[serde(default)]
    pub points_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestEntry {
    pub geohash: Geohash,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub point_of_interest: bool,
}

impl ManifestEntry {
    pub fn key(&self) -> RequestKey {
        RequestKey::new(self.geohash.clone(), self.date_start)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestManifest {
    pub schema_version: u32,
    pub precision: usize,
    #[serde(default)]
    pub provenance: Provenance,
    pub collection: CollectionId,
    pub channels: Vec<String>,
    pub entries: Vec<ManifestEntry>,
}

impl RequestManifest {
    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<RequestKey> {
        self.entries.iter().map(ManifestEntry::key).collect()
    }

    /// Expands entries into requests, in manifest order.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.entries
            .iter()
            .map(|entry| FetchRequest {
                key: entry.key(),
                tile: Tile::from_geohash(entry.geohash.clone(), entry.point_of_interest),
                window: TimeWindow {
                    start: entry.date_start,
                    end: entry.date_end,
                },
                collection: self.collection.clone(),
                channels: self.channels.clone(),
            })
            .collect()
    }

    /// The distinct planned tiles.
    pub fn tiles(&self) -> TileSet {
        let mut map = BTreeMap::new();
        for entry in &self.entries {
            let flag = map.entry(entry.geohash.clone()).or_insert(false);
            *flag |= entry.point_of_interest;
        }
        TileSet::from_map(self.precision, map)
    }

    /// Same tiles and windows, addressed to another collection.
    pub fn retarget(mut self, collection: CollectionId, channels: Option<Vec<String>>) -> Self {
        self.collection = collection;
        if let Some(channels) = channels {
            self.channels = channels;
        }
        self
    }

    fn validate(&self) -> Result<(), String> {
        if self.schema_version != MANIFEST_SCHEMA_VERSION {
            return Err(format!(
                "unsupported schema_version {} (expected {MANIFEST_SCHEMA_VERSION})",
                self.schema_version
            ));
        }
        if self.precision == 0 || self.precision > MAX_PRECISION {
            return Err(format!("precision {} out of range", self.precision));
        }
        if self.channels.iter().any(|channel| channel.trim().is_empty()) {
            return Err("blank channel name".to_string());
        }
        if self.entries.is_empty() {
            return Err("manifest has no entries".to_string());
        }

        let mut flags = BTreeMap::<&Geohash, bool>::new();
        let mut previous: Option<RequestKey> = None;
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.geohash.precision() != self.precision {
                return Err(format!(
                    "entry {index}: geohash {} does not have precision {}",
                    entry.geohash, self.precision
                ));
            }
            if entry.date_end <= entry.date_start {
                return Err(format!(
                    "entry {index}: window end {} is not after start {}",
                    entry.date_end, entry.date_start
                ));
            }
            if let Some(flag) = flags.insert(&entry.geohash, entry.point_of_interest) {
                if flag != entry.point_of_interest {
                    return Err(format!(
                        "entry {index}: conflicting point_of_interest flag for {}",
                        entry.geohash
                    ));
                }
            }
            let key = entry.key();
            if let Some(previous) = &previous {
                if *previous >= key {
                    return Err(format!(
                        "entry {index}: key {key} is duplicated or out of canonical order"
                    ));
                }
            }
            previous = Some(key);
        }
        Ok(())
    }
}

/// Cross product of tiles and windows: tiles outer, windows inner.
pub fn plan(
    tiles: &TileSet,
    windows: &[TimeWindow],
    collection: CollectionId,
    channels: Vec<String>,
) -> Result<RequestManifest, HarvestError> {
    if tiles.is_empty() || windows.is_empty() {
        return Err(HarvestError::InvalidInput(
            "cannot plan requests without tiles and windows".to_string(),
        ));
    }
    let mut windows = windows.to_vec();
    windows.sort();
    windows.dedup();
    if let Some(pair) = windows.windows(2).find(|pair| pair[1].start < pair[0].end) {
        return Err(HarvestError::InvalidInput(format!(
            "windows {} and {} overlap",
            pair[0], pair[1]
        )));
    }

    let mut entries = Vec::with_capacity(tiles.len() * windows.len());
    for tile in tiles.tiles() {
        for window in &windows {
            entries.push(ManifestEntry {
                geohash: tile.geohash.clone(),
                date_start: window.start,
                date_end: window.end,
                point_of_interest: tile.point_of_interest,
            });
        }
    }
    Ok(RequestManifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        precision: tiles.precision(),
        provenance: Provenance::default(),
        collection,
        channels,
        entries,
    })
}

/// Writes the manifest atomically. A `.gz` extension selects gzip.
pub fn save(manifest: &RequestManifest, path: &Path) -> Result<(), HarvestError> {
    let mut json = serde_json::to_vec_pretty(manifest)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    json.push(b'\n');

    let gzip = path.extension().map(|ext| ext == "gz").unwrap_or(false);
    let content = if gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        encoder
            .finish()
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?
    } else {
        json
    };
    store::write_bytes_atomic(path, &content)?;
    info!(path = %path.display(), entries = manifest.len(), "manifest saved");
    Ok(())
}

/// Reads and validates a manifest exactly as it was saved.
pub fn read(path: &Path) -> Result<RequestManifest, HarvestError> {
    let corrupt = |reason: String| HarvestError::ManifestCorrupt {
        path: path.display().to_string(),
        reason,
    };
    let raw = fs::read(path).map_err(|err| corrupt(err.to_string()))?;
    let json = if raw.starts_with(&GZIP_MAGIC) {
        let mut decoder = GzDecoder::new(raw.as_slice());
        let mut text = Vec::new();
        decoder
            .read_to_end(&mut text)
            .map_err(|err| corrupt(format!("gzip: {err}")))?;
        text
    } else {
        raw
    };
    let manifest: RequestManifest =
        serde_json::from_slice(&json).map_err(|err| corrupt(err.to_string()))?;
    manifest.validate().map_err(corrupt)?;
    Ok(manifest)
}

/// Replays a saved manifest against `collection`, optionally with new channels.
pub fn load(
    path: &Path,
    collection: CollectionId,
    channels: Option<Vec<String>>,
) -> Result<RequestManifest, HarvestError> {
    let manifest = read(path)?;
    info!(
        path = %path.display(),
        entries = manifest.len(),
        from = %manifest.collection,
        to = %collection,
        "manifest replayed"
    );
    Ok(manifest.retarget(collection, channels))
}
