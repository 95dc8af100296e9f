use std::fs;

use assert_matches::assert_matches;

use geoharvest::config::ConfigLoader;
use geoharvest::error::HarvestError;
use geoharvest::window::RemainderPolicy;

#[test]
fn resolve_reads_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("geoharvest.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "collection": "COPERNICUS/Landcover/100m/Proba-V-C3/Global",
            "precision": 4,
            "interval_days": 15,
            "date_start": "2018-01-01",
            "date_end": "2018-02-01",
            "remainder": "merge",
            "points": "poi.csv",
            "output_dir": "raw"
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.precision, 4);
    assert_eq!(resolved.remainder, RemainderPolicy::Merge);
    assert_eq!(resolved.channels[0], "discrete_classification");
    assert_eq!(resolved.points.as_deref(), Some(std::path::Path::new("poi.csv")));
    assert_eq!(resolved.output_dir, std::path::PathBuf::from("raw"));
}

#[test]
fn explicit_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nope.json");
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(HarvestError::ConfigRead(_))
    );
}

#[test]
fn unknown_keys_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("geoharvest.json");
    fs::write(&path, r#"{"precison": 5}"#).unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(HarvestError::ConfigParse(_))
    );
}
