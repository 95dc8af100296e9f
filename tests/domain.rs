use assert_matches::assert_matches;

use geoharvest::domain::{CollectionId, Geohash, RequestKey};
use geoharvest::error::HarvestError;

#[test]
fn parse_geohash_normalizes_case() {
    let hash: Geohash = "U4PRU".parse().unwrap();
    assert_eq!(hash.as_str(), "u4pru");
    assert_eq!(hash.precision(), 5);
}

#[test]
fn parse_geohash_rejects_excluded_letters() {
    for bad in ["", "u4pra", "ilo", "0123456789bcd"] {
        assert_matches!(bad.parse::<Geohash>(), Err(HarvestError::InvalidGeohash(_)));
    }
}

#[test]
fn request_key_round_trips_through_file_stem() {
    let key: RequestKey = "9q8yy_2018-01-16".parse().unwrap();
    assert_eq!(key.geohash().as_str(), "9q8yy");
    assert_eq!(key.start().to_string(), "2018-01-16");
    assert_eq!(key.to_string(), "9q8yy_2018-01-16");

    assert!("9q8yy".parse::<RequestKey>().is_err());
    assert!("9q8yy_2018-13-01".parse::<RequestKey>().is_err());
}

#[test]
fn request_keys_order_by_tile_then_date() {
    let mut keys: Vec<RequestKey> = ["u4prv_2018-01-01", "u4pru_2018-01-16", "u4pru_2018-01-01"]
        .iter()
        .map(|raw| raw.parse().unwrap())
        .collect();
    keys.sort();
    let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
    assert_eq!(
        rendered,
        vec!["u4pru_2018-01-01", "u4pru_2018-01-16", "u4prv_2018-01-01"]
    );
}

#[test]
fn collection_slug_is_path_safe() {
    let id: CollectionId = "COPERNICUS/Landcover/100m/Proba-V-C3/Global".parse().unwrap();
    assert_eq!(id.slug(), "COPERNICUS_Landcover_100m_Proba-V-C3_Global");
    assert_matches!(
        "with space".parse::<CollectionId>(),
        Err(HarvestError::InvalidCollection(_))
    );
}

#[test]
fn explicit_channels_win_over_presets() {
    let id: CollectionId = "COPERNICUS/S2".parse().unwrap();
    assert_eq!(
        id.resolve_channels(Some(vec!["B4".to_string()])).unwrap(),
        vec!["B4"]
    );
    assert_eq!(id.resolve_channels(None).unwrap().len(), 13);
}
