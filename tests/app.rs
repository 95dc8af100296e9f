use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Mutex;

use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use geoharvest::app::{self, App, FetchOptions, ProgressEvent, ProgressSink};
use geoharvest::config::{Config, ConfigLoader, ResolvedConfig};
use geoharvest::domain::CollectionId;
use geoharvest::executor::{CancellationToken, FetchStatus};
use geoharvest::fs_util::ZipUnpacker;
use geoharvest::geometry::BoundingBox;
use geoharvest::organizer::{OrganizeMode, OrganizeOptions, TileIndex};
use geoharvest::output::JsonOutput;
use geoharvest::source::{ImagerySource, SourceError};
use geoharvest::window::TimeWindow;

#[derive(Default)]
struct MockSource {
    calls: Mutex<usize>,
}

impl ImagerySource for MockSource {
    fn fetch_tile(
        &self,
        _bbox: &BoundingBox,
        window: &TimeWindow,
        _collection: &CollectionId,
        channels: &[String],
    ) -> Result<Vec<u8>, SourceError> {
        let mut guard = self.calls.lock().unwrap();
        *guard += 1;
        if *guard == 3 {
            return Err(SourceError::Timeout("slow".to_string()));
        }
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for channel in channels {
            writer
                .start_file(format!("tile.{channel}.tif"), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(window.start.to_string().as_bytes()).unwrap();
        }
        Ok(writer.finish().unwrap().into_inner())
    }
}

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

fn config(dir: &Path) -> ResolvedConfig {
    let coverage = dir.join("area.geojson");
    fs::write(
        &coverage,
        r#"{"type":"Feature","properties":{},"geometry":{"type":"Polygon",
            "coordinates":[[[6.60,46.50],[6.70,46.50],[6.70,46.56],[6.60,46.56],[6.60,46.50]]]}}"#,
    )
    .unwrap();
    let points = dir.join("poi.csv");
    fs::write(&points, "name,lat,lon\nsite,46.53,6.63\n").unwrap();

    let config: Config = serde_json::from_str(&format!(
        r#"{{
            "channels": ["B2", "B3", "QA60"],
            "precision": 5,
            "interval_days": 15,
            "date_start": "2018-01-01",
            "date_end": "2018-02-01",
            "remainder": "merge",
            "concurrency": 3,
            "retry": {{"max_retries": 3, "base_delay_ms": 1, "max_delay_ms": 2}},
            "coverage": {:?},
            "points": {:?},
            "output_dir": {:?}
        }}"#,
        coverage.display().to_string(),
        points.display().to_string(),
        dir.join("raw").display().to_string(),
    ))
    .unwrap();
    ConfigLoader::resolve_config(config).unwrap()
}

#[test]
fn plan_fetch_organize_through_app() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let sink = RecordingSink::default();

    let planned = app::plan(&config, &sink).unwrap();
    assert!(planned.tiles > 1);
    assert_eq!(planned.points_of_interest, 1);
    assert_eq!(planned.windows, 2);
    assert_eq!(planned.manifest.provenance.interval_days, Some(15));

    let app = App::new(MockSource::default(), ZipUnpacker);
    let result = app
        .fetch(
            &planned.manifest,
            &config,
            FetchOptions::default(),
            CancellationToken::new(),
            &sink,
        )
        .unwrap();
    assert_eq!(result.outcomes.len(), planned.requests);
    assert!(
        result
            .outcomes
            .iter()
            .all(|outcome| outcome.status == FetchStatus::Success)
    );
    assert_eq!(result.summary.success, planned.requests);

    let mode = OrganizeMode::Labeled {
        positive_label: "yes".to_string(),
        negative_label: "no".to_string(),
        index: TileIndex::from_manifest(&planned.manifest),
    };
    let organized = app
        .organize(
            &dir.path().join("raw"),
            &planned.manifest.collection,
            &dir.path().join("dataset"),
            &mode,
            &OrganizeOptions::default(),
            &sink,
        )
        .unwrap();
    assert_eq!(organized.report.count_label("yes"), 2);
    assert_eq!(
        organized.report.count_label("no"),
        planned.requests - 2
    );

    let messages = sink.messages.lock().unwrap();
    assert!(messages.iter().any(|message| message.starts_with("phase=Fetch")));
    assert!(messages.iter().any(|message| message.starts_with("phase=Organize")));
}

#[test]
fn json_output_is_a_silent_sink() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let planned = app::plan(&config, &JsonOutput).unwrap();
    let json = serde_json::to_value(&planned).unwrap();
    assert_eq!(json["requests"], planned.requests);
    assert!(json.get("manifest").is_none());
}

#[test]
fn cancelled_before_start_fetches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let sink = RecordingSink::default();
    let planned = app::plan(&config, &sink).unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let source = MockSource::default();
    let app = App::new(source, ZipUnpacker);
    let result = app
        .fetch(&planned.manifest, &config, FetchOptions::default(), token, &sink)
        .unwrap();
    assert_eq!(result.summary.cancelled, planned.requests);
    assert!(result.outcomes.iter().all(|outcome| outcome.attempts == 0));
}
