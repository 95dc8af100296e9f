use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::aoi;
use crate::config::ResolvedConfig;
use crate::domain::CollectionId;
use crate::error::HarvestError;
use crate::executor::{CancellationToken, FetchExecutor, FetchOutcome, FetchStatus, FetchSummary};
use crate::fs_util::Unpacker;
use crate::manifest::{self, Provenance, RequestManifest};
use crate::organizer::{self, OrganizeMode, OrganizeOptions, OrganizeReport};
use crate::source::ImagerySource;
use crate::store::OutputLayout;
use crate::tiler;
use crate::window;

#[derive(Debug, Clone, Serialize)]
pub struct PlanResult {
    pub tiles: usize,
    pub points_of_interest: usize,
    pub windows: usize,
    pub requests: usize,
    pub collection: String,
    pub manifest_path: Option<String>,
    #[serde(skip)]
    pub manifest: RequestManifest,
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub dry_run: bool,
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub dry_run: bool,
    pub output_dir: String,
    pub planned: usize,
    pub summary: FetchSummary,
    pub outcomes: Vec<FetchOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrganizeResult {
    pub target_dir: String,
    pub report: OrganizeReport,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Builds a manifest from the coverage/points files named in `config`.
pub fn plan(config: &ResolvedConfig, sink: &dyn ProgressSink) -> Result<PlanResult, HarvestError> {
    plan_from(config, config.coverage.as_deref(), config.points.as_deref(), sink)
}

pub fn plan_from(
    config: &ResolvedConfig,
    coverage_path: Option<&Path>,
    points_path: Option<&Path>,
    sink: &dyn ProgressSink,
) -> Result<PlanResult, HarvestError> {
    let started = Instant::now();
    sink.event(ProgressEvent {
        message: "phase=Resolve; reading coverage and points".to_string(),
        elapsed: None,
    });
    let coverage = coverage_path.map(aoi::load_coverage).transpose()?;
    let points = points_path.map(aoi::load_points).transpose()?;

    sink.event(ProgressEvent {
        message: format!("phase=Tile; precision={}", config.precision),
        elapsed: Some(started.elapsed()),
    });
    let tiles = tiler::tile(
        coverage.as_ref(),
        points.as_deref(),
        config.precision,
        config.sampling,
    )?;

    sink.event(ProgressEvent {
        message: format!(
            "phase=Window; {}..{} every {} days",
            config.date_start, config.date_end, config.interval_days
        ),
        elapsed: Some(started.elapsed()),
    });
    let windows = window::window_with(
        config.date_start,
        config.date_end,
        config.interval_days,
        config.remainder,
    )?;

    let provenance = Provenance {
        interval_days: Some(config.interval_days),
        remainder: Some(config.remainder),
        sampling: config.sampling,
        coverage_file: coverage_path.map(|path| path.display().to_string()),
        points_file: points_path.map(|path| path.display().to_string()),
    };
    let manifest = manifest::plan(
        &tiles,
        &windows,
        config.collection.clone(),
        config.channels.clone(),
    )?
    .with_provenance(provenance);

    sink.event(ProgressEvent {
        message: format!("phase=Plan; {} requests", manifest.len()),
        elapsed: Some(started.elapsed()),
    });

    Ok(PlanResult {
        tiles: tiles.len(),
        points_of_interest: tiles.points_of_interest().count(),
        windows: windows.len(),
        requests: manifest.len(),
        collection: manifest.collection.to_string(),
        manifest_path: None,
        manifest,
    })
}

/// Saves `result.manifest` and records where it went.
pub fn save_plan(result: &mut PlanResult, path: &Path, sink: &dyn ProgressSink) -> Result<(), HarvestError> {
    manifest::save(&result.manifest, path)?;
    sink.event(ProgressEvent {
        message: format!("phase=Store; manifest saved to {}", path.display()),
        elapsed: None,
    });
    result.manifest_path = Some(path.display().to_string());
    Ok(())
}

/// Loads a saved manifest. With a collection, the same tiles and windows are
/// re-addressed to it, using `channels` or the collection's defaults.
pub fn replay(
    path: &Path,
    collection: Option<CollectionId>,
    channels: Option<Vec<String>>,
) -> Result<RequestManifest, HarvestError> {
    match collection {
        Some(collection) => {
            let channels = collection.resolve_channels(channels)?;
            manifest::load(path, collection, Some(channels))
        }
        None => {
            let manifest = manifest::read(path)?;
            let collection = manifest.collection.clone();
            Ok(manifest.retarget(collection, channels))
        }
    }
}

#[derive(Clone)]
pub struct App<S: ImagerySource, U: Unpacker> {
    source: S,
    unpacker: U,
}

impl<S: ImagerySource, U: Unpacker> App<S, U> {
    pub fn new(source: S, unpacker: U) -> Self {
        Self { source, unpacker }
    }

    pub fn fetch(
        &self,
        manifest: &RequestManifest,
        config: &ResolvedConfig,
        options: FetchOptions,
        cancel: CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<FetchResult, HarvestError> {
        let output_dir = options
            .output_dir
            .clone()
            .unwrap_or_else(|| config.output_dir.clone());
        let requests = manifest.requests();

        if options.dry_run {
            sink.event(ProgressEvent {
                message: format!("phase=Plan; dry run, {} requests not sent", requests.len()),
                elapsed: None,
            });
            return Ok(FetchResult {
                dry_run: true,
                output_dir: output_dir.display().to_string(),
                planned: requests.len(),
                summary: FetchSummary::default(),
                outcomes: Vec::new(),
            });
        }

        sink.event(ProgressEvent {
            message: format!(
                "phase=Fetch; {} requests, concurrency={}",
                requests.len(),
                config.executor.concurrency
            ),
            elapsed: None,
        });
        let started = Instant::now();
        let layout = OutputLayout::from_path(&output_dir)?;
        let executor = FetchExecutor::new(&self.source, layout, config.executor.clone(), cancel)?;
        let outcomes = executor.execute(&requests)?;

        for outcome in &outcomes {
            if outcome.status != FetchStatus::Success {
                sink.event(ProgressEvent {
                    message: format!(
                        "fetch.outcome key={} status={:?} attempts={}",
                        outcome.key, outcome.status, outcome.attempts
                    ),
                    elapsed: None,
                });
            }
        }
        let summary = FetchSummary::from_outcomes(&outcomes);
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; success={} skipped={} failed={} cancelled={}",
                summary.success,
                summary.skipped_existing,
                summary.failed(),
                summary.cancelled
            ),
            elapsed: Some(started.elapsed()),
        });

        Ok(FetchResult {
            dry_run: false,
            output_dir: output_dir.display().to_string(),
            planned: requests.len(),
            summary,
            outcomes,
        })
    }

    /// Organizes the archives that `fetch` wrote below `output_dir` for one
    /// collection.
    pub fn organize(
        &self,
        output_dir: &Path,
        collection: &CollectionId,
        target_dir: &Path,
        mode: &OrganizeMode,
        options: &OrganizeOptions,
        sink: &dyn ProgressSink,
    ) -> Result<OrganizeResult, HarvestError> {
        let layout = OutputLayout::from_path(output_dir)?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Organize; {}",
                layout.collection_dir(collection)
            ),
            elapsed: None,
        });
        let started = Instant::now();
        let report = organizer::organize(
            &layout,
            collection,
            target_dir,
            mode,
            options,
            &self.unpacker,
        )?;
        for key in &report.unknown_tiles {
            sink.event(ProgressEvent {
                message: format!("organize.unknown_tile key={key}"),
                elapsed: None,
            });
        }
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; samples={} failures={}",
                report.samples.len(),
                report.failures.len()
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(OrganizeResult {
            target_dir: target_dir.display().to_string(),
            report,
        })
    }
}
