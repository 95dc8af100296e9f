//! Turns the executor's raw archives into a dataset directory.
//!
//! One pass covers one collection: archives of different collections share
//! request keys and would otherwise map to the same output names.
//!
//! Output files are renamed after the Sentinel-2 distribution scheme,
//! `{geohash}_{YYYYMMDD}T000000_{band}.{ext}`, so every file name carries its
//! tile and window and flattened output cannot collide.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use camino::Utf8PathBuf;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{CollectionId, Geohash, RequestKey};
use crate::error::HarvestError;
use crate::fs_util::Unpacker;
use crate::manifest::RequestManifest;
use crate::store::{self, ARCHIVE_EXTENSION, METADATA_FILE, OutputLayout};
use crate::tiler::TileSet;

static BAND_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^.]+\.(?P<band>[^.]+)\.(?P<ext>[A-Za-z0-9]+)$").unwrap());
static SHORT_BAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<prefix>[A-Za-z])(?P<digit>\d)$").unwrap());

/// Planned tiles and the subset that contains points of interest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileIndex {
    planned: BTreeSet<Geohash>,
    points_of_interest: BTreeSet<Geohash>,
}

impl TileIndex {
    pub fn from_tiles(tiles: &TileSet) -> Self {
        let mut index = Self::default();
        for tile in tiles.tiles() {
            index.planned.insert(tile.geohash.clone());
            if tile.point_of_interest {
                index.points_of_interest.insert(tile.geohash.clone());
            }
        }
        index
    }

    pub fn from_manifest(manifest: &RequestManifest) -> Self {
        Self::from_tiles(&manifest.tiles())
    }

    pub fn is_planned(&self, geohash: &Geohash) -> bool {
        self.planned.contains(geohash)
    }

    pub fn is_point_of_interest(&self, geohash: &Geohash) -> bool {
        self.points_of_interest.contains(geohash)
    }
}

#[derive(Debug, Clone)]
pub enum OrganizeMode {
    Labeled {
        positive_label: String,
        negative_label: String,
        index: TileIndex,
    },
    Flattened,
}

#[derive(Debug, Clone)]
pub struct OrganizeOptions {
    /// Bands dropped from the output, e.g. cloud masks.
    pub skip_bands: Vec<String>,
    pub copy_metadata: bool,
}

impl Default for OrganizeOptions {
    fn default() -> Self {
        Self {
            skip_bands: vec!["QA60".to_string()],
            copy_metadata: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledSample {
    pub key: RequestKey,
    pub label: Option<String>,
    pub files: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleFailure {
    pub archive: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrganizeReport {
    pub samples: Vec<LabeledSample>,
    pub unknown_tiles: Vec<RequestKey>,
    pub failures: Vec<SampleFailure>,
}

impl OrganizeReport {
    pub fn count_label(&self, label: &str) -> usize {
        self.samples
            .iter()
            .filter(|sample| sample.label.as_deref() == Some(label))
            .count()
    }
}

/// Places every archive fetched for `collection` under `output` into
/// `target_dir`.
///
/// Per-sample problems (unplanned tiles, unreadable archives) are collected in
/// the report and do not stop the pass.
pub fn organize<U: Unpacker>(
    output: &OutputLayout,
    collection: &CollectionId,
    target_dir: &Path,
    mode: &OrganizeMode,
    options: &OrganizeOptions,
    unpacker: &U,
) -> Result<OrganizeReport, HarvestError> {
    let source_dir = output.collection_dir(collection);
    if !source_dir.is_dir() {
        return Err(HarvestError::InvalidInput(format!(
            "no archives for {collection}: {source_dir} does not exist"
        )));
    }
    fs::create_dir_all(target_dir).map_err(|err| HarvestError::Filesystem(err.to_string()))?;

    let mut report = OrganizeReport::default();
    let mut seen = BTreeSet::new();
    let archives = store::walk_files(source_dir.as_std_path())?
        .into_iter()
        .filter(|path| path.extension().map(|ext| ext == ARCHIVE_EXTENSION).unwrap_or(false));

    for archive in archives {
        let Some(key) = archive
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<RequestKey>().ok())
        else {
            report.failures.push(SampleFailure {
                archive: archive.display().to_string(),
                error: "file name is not a request key".to_string(),
            });
            continue;
        };
        if !seen.insert(key.clone()) {
            report.failures.push(SampleFailure {
                archive: archive.display().to_string(),
                error: format!("another archive already provided {key}"),
            });
            continue;
        }

        let (dest, label) = match mode {
            OrganizeMode::Flattened => (target_dir.to_path_buf(), None),
            OrganizeMode::Labeled {
                positive_label,
                negative_label,
                index,
            } => {
                if !index.is_planned(key.geohash()) {
                    let err = HarvestError::UnknownTile {
                        key: key.to_string(),
                    };
                    warn!(archive = %archive.display(), "{err}");
                    report.failures.push(SampleFailure {
                        archive: archive.display().to_string(),
                        error: err.to_string(),
                    });
                    report.unknown_tiles.push(key);
                    continue;
                }
                let label = if index.is_point_of_interest(key.geohash()) {
                    positive_label
                } else {
                    negative_label
                };
                (target_dir.join(label), Some(label.clone()))
            }
        };

        match place_sample(&archive, &key, &dest, options, unpacker, target_dir) {
            Ok(files) => {
                debug!(key = %key, files = files.len(), label = ?label, "sample placed");
                report.samples.push(LabeledSample { key, label, files });
            }
            Err(err) => {
                warn!(archive = %archive.display(), error = %err, "sample skipped");
                report.failures.push(SampleFailure {
                    archive: archive.display().to_string(),
                    error: err.to_string(),
                });
            }
        }
    }

    if options.copy_metadata {
        let metadata = output.metadata_path(collection);
        if metadata.is_file() {
            store::copy_file_atomic(metadata.as_std_path(), &target_dir.join(METADATA_FILE))?;
        } else {
            warn!(path = %metadata, "no run metadata to copy");
        }
    }

    report.samples.sort_by(|a, b| a.key.cmp(&b.key));
    info!(
        samples = report.samples.len(),
        unknown = report.unknown_tiles.len(),
        failures = report.failures.len(),
        "organize finished"
    );
    Ok(report)
}

fn place_sample<U: Unpacker>(
    archive: &Path,
    key: &RequestKey,
    dest: &Path,
    options: &OrganizeOptions,
    unpacker: &U,
    scratch_root: &Path,
) -> Result<Vec<Utf8PathBuf>, HarvestError> {
    let scratch = tempfile::Builder::new()
        .prefix(".geoharvest-unpack")
        .tempdir_in(scratch_root)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    let unpacked = unpacker.unpack(archive, scratch.path())?;

    let mut placed = Vec::new();
    for file in unpacked {
        let Some(name) = file.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some(output_name) = sample_file_name(key, name, &options.skip_bands) else {
            continue;
        };
        let output = dest.join(output_name);
        store::copy_file_atomic(&file, &output)?;
        let output = Utf8PathBuf::from_path_buf(output)
            .map_err(|_| HarvestError::Filesystem("non-utf8 output path".to_string()))?;
        placed.push(output);
    }
    placed.sort();
    Ok(placed)
}

/// Output name for one unpacked file, or `None` when its band is skipped.
pub fn sample_file_name(key: &RequestKey, file_name: &str, skip_bands: &[String]) -> Option<String> {
    let stamp = key.start().format("%Y%m%dT000000");
    let Some(captures) = BAND_FILE.captures(file_name) else {
        return Some(format!("{key}_{file_name}"));
    };
    let band = &captures["band"];
    if skip_bands.iter().any(|skip| skip == band) {
        return None;
    }
    let band = SHORT_BAND.replace(band, "${prefix}0${digit}");
    Some(format!(
        "{}_{stamp}_{band}.{}",
        key.geohash(),
        &captures["ext"]
    ))
}
