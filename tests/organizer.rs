use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::NaiveDate;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use geoharvest::domain::CollectionId;
use geoharvest::error::HarvestError;
use geoharvest::executor::{CancellationToken, ExecutorOptions, FetchExecutor, RetryPolicy};
use geoharvest::fs_util::ZipUnpacker;
use geoharvest::geometry::{BoundingBox, Coordinate};
use geoharvest::manifest;
use geoharvest::organizer::{OrganizeMode, OrganizeOptions, TileIndex, organize};
use geoharvest::source::{ImagerySource, SourceError};
use geoharvest::store::{METADATA_FILE, OutputLayout, RunMetadata};
use geoharvest::tiler;
use geoharvest::window::{self, TimeWindow};

fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        writer
            .start_file(name.to_string(), SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn write_archive(layout: &OutputLayout, collection: &CollectionId, key: &str, entries: &[&str]) {
    let path = layout.archive_path(collection, &key.parse().unwrap());
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let entries: Vec<(&str, &[u8])> = entries.iter().map(|name| (*name, name.as_bytes())).collect();
    fs::write(path, zip_bytes(&entries)).unwrap();
}

fn sentinel() -> CollectionId {
    "COPERNICUS/S2".parse().unwrap()
}

fn labeled(index: TileIndex) -> OrganizeMode {
    OrganizeMode::Labeled {
        positive_label: "positive".to_string(),
        negative_label: "negative".to_string(),
        index,
    }
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn unknown_tiles_are_reported_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::from_path(&dir.path().join("raw")).unwrap();
    let tiles = tiler::tile(None, Some(&[Coordinate::new(10.5, 45.25)][..]), 5, None).unwrap();
    let planned = tiles.tiles()[0].geohash.clone();

    write_archive(
        &layout,
        &sentinel(),
        &format!("{planned}_2020-01-01"),
        &[format!("{planned}.B2.tif").as_str()],
    );
    write_archive(&layout, &sentinel(), "zzzzz_2020-01-01", &["zzzzz.B2.tif"]);

    let report = organize(
        &layout,
        &sentinel(),
        &dir.path().join("dataset"),
        &labeled(TileIndex::from_tiles(&tiles)),
        &OrganizeOptions::default(),
        &ZipUnpacker,
    )
    .unwrap();

    assert_eq!(report.samples.len(), 1);
    assert_eq!(report.count_label("positive"), 1);
    assert_eq!(report.unknown_tiles.len(), 1);
    assert_eq!(report.unknown_tiles[0].to_string(), "zzzzz_2020-01-01");
    assert_eq!(report.failures.len(), 1);
    assert!(
        dir.path()
            .join("dataset/positive")
            .join(format!("{planned}_20200101T000000_B02.tif"))
            .is_file()
    );
}

#[test]
fn flattened_output_is_collision_free() {
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::from_path(&dir.path().join("raw")).unwrap();
    write_archive(&layout, &sentinel(), "u4pru_2020-01-01", &["u4pru.B1.tif", "u4pru.QA60.tif"]);
    write_archive(&layout, &sentinel(), "u4pru_2020-01-31", &["u4pru.B1.tif", "preview.png"]);

    let target = dir.path().join("flat");
    let report = organize(
        &layout,
        &sentinel(),
        &target,
        &OrganizeMode::Flattened,
        &OrganizeOptions::default(),
        &ZipUnpacker,
    )
    .unwrap();

    assert_eq!(report.samples.len(), 2);
    assert!(report.samples.iter().all(|sample| sample.label.is_none()));
    assert_eq!(
        file_names(&target),
        vec![
            "u4pru_2020-01-31_preview.png".to_string(),
            "u4pru_20200101T000000_B01.tif".to_string(),
            "u4pru_20200131T000000_B01.tif".to_string(),
        ]
    );
}

#[test]
fn each_pass_reads_only_its_own_collection() {
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::from_path(&dir.path().join("raw")).unwrap();
    let other: CollectionId = "OTHER/X".parse().unwrap();
    write_archive(&layout, &sentinel(), "u0zh7_2020-01-01", &["u0zh7.B1.tif"]);
    let other_path = layout.archive_path(&other, &"u0zh7_2020-01-01".parse().unwrap());
    fs::create_dir_all(other_path.parent().unwrap()).unwrap();
    fs::write(&other_path, zip_bytes(&[("u0zh7.B1.tif", &b"other"[..])])).unwrap();

    let sentinel_flat = dir.path().join("flat-s2");
    let report = organize(
        &layout,
        &sentinel(),
        &sentinel_flat,
        &OrganizeMode::Flattened,
        &OrganizeOptions::default(),
        &ZipUnpacker,
    )
    .unwrap();
    assert_eq!(report.samples.len(), 1);
    assert!(report.failures.is_empty());

    let other_flat = dir.path().join("flat-other");
    let report = organize(
        &layout,
        &other,
        &other_flat,
        &OrganizeMode::Flattened,
        &OrganizeOptions::default(),
        &ZipUnpacker,
    )
    .unwrap();
    assert_eq!(report.samples.len(), 1);

    let name = "u0zh7_20200101T000000_B01.tif";
    assert_eq!(fs::read(sentinel_flat.join(name)).unwrap(), b"u0zh7.B1.tif");
    assert_eq!(fs::read(other_flat.join(name)).unwrap(), b"other");
}

/// Serves a one-band archive for every request.
struct OneBandSource;

impl ImagerySource for OneBandSource {
    fn fetch_tile(
        &self,
        _bbox: &BoundingBox,
        window: &TimeWindow,
        _collection: &CollectionId,
        _channels: &[String],
    ) -> Result<Vec<u8>, SourceError> {
        Ok(zip_bytes(&[("tile.B2.tif", window.start.to_string().as_bytes())]))
    }
}

#[test]
fn metadata_written_by_fetch_is_copied() {
    let dir = tempfile::tempdir().unwrap();
    let raw = dir.path().join("raw");
    let tiles = tiler::tile(None, Some(&[Coordinate::new(6.63, 46.53)][..]), 5, None).unwrap();
    let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2020, 2, 1).unwrap();
    let windows = window::window(start, end, 31).unwrap();
    let planned = manifest::plan(&tiles, &windows, sentinel(), vec!["B2".to_string()]).unwrap();

    let options = ExecutorOptions {
        concurrency: 1,
        retry: RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
        skip_existing: true,
    };
    let layout = OutputLayout::from_path(&raw).unwrap();
    FetchExecutor::new(&OneBandSource, layout.clone(), options, CancellationToken::new())
        .unwrap()
        .execute(&planned.requests())
        .unwrap();

    let target = dir.path().join("flat");
    let report = organize(
        &layout,
        &sentinel(),
        &target,
        &OrganizeMode::Flattened,
        &OrganizeOptions {
            copy_metadata: true,
            ..OrganizeOptions::default()
        },
        &ZipUnpacker,
    )
    .unwrap();
    assert_eq!(report.samples.len(), 1);

    let copied: RunMetadata =
        serde_json::from_slice(&fs::read(target.join(METADATA_FILE)).unwrap()).unwrap();
    assert_eq!(copied.collection, "COPERNICUS/S2");
    assert_eq!(copied.requests, 1);
}

#[test]
fn corrupt_archives_are_collected_as_failures() {
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::from_path(&dir.path().join("raw")).unwrap();
    layout.ensure_collection_dir(&sentinel()).unwrap();
    fs::write(
        layout.archive_path(&sentinel(), &"u4pru_2020-01-01".parse().unwrap()),
        b"truncated",
    )
    .unwrap();

    let report = organize(
        &layout,
        &sentinel(),
        &dir.path().join("flat"),
        &OrganizeMode::Flattened,
        &OrganizeOptions::default(),
        &ZipUnpacker,
    )
    .unwrap();
    assert!(report.samples.is_empty());
    assert_eq!(report.failures.len(), 1);
}

#[test]
fn missing_collection_dir_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::from_path(&dir.path().join("absent")).unwrap();
    assert_matches!(
        organize(
            &layout,
            &sentinel(),
            &dir.path().join("flat"),
            &OrganizeMode::Flattened,
            &OrganizeOptions::default(),
            &ZipUnpacker,
        ),
        Err(HarvestError::InvalidInput(_))
    );
}
