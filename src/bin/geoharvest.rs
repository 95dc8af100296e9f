use std::path::PathBuf;
use std::process::ExitCode;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use geoharvest::app::{self, App, FetchOptions, ProgressSink};
use geoharvest::config::{ConfigLoader, ResolvedConfig};
use geoharvest::domain::CollectionId;
use geoharvest::error::HarvestError;
use geoharvest::executor::CancellationToken;
use geoharvest::fs_util::ZipUnpacker;
use geoharvest::organizer::{OrganizeMode, OrganizeOptions, TileIndex};
use geoharvest::output::{JsonOutput, OutputMode, TextOutput};
use geoharvest::source::HttpImagerySource;
use geoharvest::tiler::Sampling;
use geoharvest::window::RemainderPolicy;

#[derive(Parser)]
#[command(name = "geoharvest")]
#[command(about = "Reproducible satellite tile harvesting over geohash grids")]
#[command(version, author)]
struct Cli {
    /// Run config (defaults to ./geoharvest.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Tile, window and save a request manifest without fetching")]
    Plan(PlanArgs),
    #[command(about = "Fetch every request of a fresh plan or a saved manifest")]
    Fetch(FetchArgs),
    #[command(about = "Unpack fetched archives into a labeled or flat dataset")]
    Organize(OrganizeArgs),
}

#[derive(Args, Clone, Default)]
struct PlanningArgs {
    /// GeoJSON polygon coverage
    #[arg(long)]
    coverage: Option<PathBuf>,

    /// Points of interest (GeoJSON or CSV)
    #[arg(long)]
    points: Option<PathBuf>,

    #[arg(long)]
    precision: Option<usize>,

    #[arg(long)]
    interval_days: Option<i64>,

    #[arg(long)]
    start: Option<NaiveDate>,

    #[arg(long)]
    end: Option<NaiveDate>,

    #[arg(long, value_enum)]
    remainder: Option<RemainderArg>,

    #[arg(long)]
    sample_rate: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Clone, Default)]
struct CollectionArgs {
    #[arg(long)]
    collection: Option<String>,

    #[arg(long, value_delimiter = ',')]
    channels: Option<Vec<String>>,
}

#[derive(Args)]
struct PlanArgs {
    #[command(flatten)]
    planning: PlanningArgs,

    #[command(flatten)]
    collection: CollectionArgs,

    #[arg(long, default_value = "requests.json")]
    save_manifest: PathBuf,
}

#[derive(Args)]
struct FetchArgs {
    /// Replay a saved manifest instead of planning
    #[arg(long, conflicts_with_all = ["coverage", "points"])]
    manifest: Option<PathBuf>,

    #[command(flatten)]
    planning: PlanningArgs,

    #[command(flatten)]
    collection: CollectionArgs,

    #[arg(long)]
    save_manifest: Option<PathBuf>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long)]
    max_retries: Option<u32>,

    /// Re-fetch requests whose archive already exists
    #[arg(long)]
    no_skip_existing: bool,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct OrganizeArgs {
    /// Root the archives were fetched into (defaults to the configured output_dir)
    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// Collection whose archives to organize (defaults to the manifest's, then the config's)
    #[arg(long)]
    collection: Option<String>,

    #[arg(long)]
    target_dir: PathBuf,

    /// Manifest that planned the archives; required unless --flatten
    #[arg(long, required_unless_present = "flatten")]
    manifest: Option<PathBuf>,

    #[arg(long)]
    flatten: bool,

    #[arg(long, default_value = "positive")]
    positive_label: String,

    #[arg(long, default_value = "negative")]
    negative_label: String,

    #[arg(long = "skip-band", default_values = ["QA60"])]
    skip_bands: Vec<String>,

    #[arg(long)]
    copy_metadata: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum RemainderArg {
    Split,
    Merge,
}

impl From<RemainderArg> for RemainderPolicy {
    fn from(value: RemainderArg) -> Self {
        match value {
            RemainderArg::Split => RemainderPolicy::Split,
            RemainderArg::Merge => RemainderPolicy::Merge,
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<HarvestError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::InvalidInput(_)
        | HarvestError::InvalidRange(_)
        | HarvestError::InvalidGeohash(_)
        | HarvestError::InvalidCollection(_)
        | HarvestError::UnknownChannels(_)
        | HarvestError::ManifestCorrupt { .. }
        | HarvestError::UnknownTile { .. }
        | HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_)
        | HarvestError::GeoJson { .. }
        | HarvestError::Csv { .. } => 2,
        HarvestError::SourceHttp(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Plan(args) => run_plan(args, &mut config, output_mode),
        Commands::Fetch(args) => run_fetch(args, &mut config, output_mode),
        Commands::Organize(args) => run_organize(args, &config, output_mode),
    }
}

fn sink_for(output_mode: OutputMode) -> &'static dyn ProgressSink {
    match output_mode {
        OutputMode::Text => &TextOutput,
        OutputMode::Json => &JsonOutput,
    }
}

fn run_plan(
    args: PlanArgs,
    config: &mut ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    apply_planning(&args.planning, config)?;
    apply_collection(&args.collection, config)?;
    let sink = sink_for(output_mode);

    let mut result = app::plan(config, sink)?;
    app::save_plan(&mut result, &args.save_manifest, sink)?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_plan(&result).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_plan(&result),
    }
    Ok(ExitCode::SUCCESS)
}

fn run_fetch(
    args: FetchArgs,
    config: &mut ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    apply_planning(&args.planning, config)?;
    if let Some(concurrency) = args.concurrency {
        config.executor.concurrency = concurrency;
    }
    if let Some(max_retries) = args.max_retries {
        config.executor.retry.max_retries = max_retries;
    }
    if args.no_skip_existing {
        config.executor.skip_existing = false;
    }
    let sink = sink_for(output_mode);

    let manifest = match &args.manifest {
        Some(path) => {
            let collection = args
                .collection
                .collection
                .as_deref()
                .map(str::parse::<CollectionId>)
                .transpose()?;
            app::replay(path, collection, args.collection.channels.clone())?
        }
        None => {
            apply_collection(&args.collection, config)?;
            let mut planned = app::plan(config, sink)?;
            if let Some(path) = &args.save_manifest {
                app::save_plan(&mut planned, path, sink)?;
            }
            planned.manifest
        }
    };
    if args.manifest.is_some() {
        if let Some(path) = &args.save_manifest {
            geoharvest::manifest::save(&manifest, path)?;
        }
    }

    let options = FetchOptions {
        dry_run: args.dry_run,
        output_dir: args.output_dir,
    };
    let result = if options.dry_run {
        App::new(Offline, ZipUnpacker).fetch(
            &manifest,
            config,
            options,
            CancellationToken::new(),
            sink,
        )?
    } else {
        let source = HttpImagerySource::new(config.source.http_config()?)?;
        App::new(source, ZipUnpacker).fetch(
            &manifest,
            config,
            options,
            CancellationToken::new(),
            sink,
        )?
    };

    match output_mode {
        OutputMode::Json => JsonOutput::print_fetch(&result).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_fetch(&result),
    }
    if result.summary.failed() > 0 {
        return Ok(ExitCode::from(3));
    }
    Ok(ExitCode::SUCCESS)
}

fn run_organize(
    args: OrganizeArgs,
    config: &ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let sink = sink_for(output_mode);
    let manifest = args
        .manifest
        .as_deref()
        .map(geoharvest::manifest::read)
        .transpose()?;
    let collection: CollectionId = match (&args.collection, &manifest) {
        (Some(collection), _) => collection.parse()?,
        (None, Some(manifest)) => manifest.collection.clone(),
        (None, None) => config.collection.clone(),
    };
    let mode = match (&manifest, args.flatten) {
        (_, true) => OrganizeMode::Flattened,
        (Some(manifest), false) => {
            OrganizeMode::Labeled {
                positive_label: args.positive_label.clone(),
                negative_label: args.negative_label.clone(),
                index: TileIndex::from_manifest(manifest),
            }
        }
        (None, false) => {
            return Err(HarvestError::InvalidInput(
                "labeled organize needs --manifest".to_string(),
            )
            .into());
        }
    };
    let options = OrganizeOptions {
        skip_bands: args.skip_bands,
        copy_metadata: args.copy_metadata,
    };

    let source_dir = args.source_dir.unwrap_or_else(|| config.output_dir.clone());
    let result = App::new(Offline, ZipUnpacker).organize(
        &source_dir,
        &collection,
        &args.target_dir,
        &mode,
        &options,
        sink,
    )?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_organize(&result).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_organize(&result),
    }
    Ok(ExitCode::SUCCESS)
}

fn apply_planning(args: &PlanningArgs, config: &mut ResolvedConfig) -> Result<(), HarvestError> {
    if args.coverage.is_some() || args.points.is_some() {
        config.coverage = args.coverage.clone();
        config.points = args.points.clone();
    }
    if let Some(precision) = args.precision {
        config.precision = precision;
    }
    if let Some(interval_days) = args.interval_days {
        config.interval_days = interval_days;
    }
    if let Some(start) = args.start {
        config.date_start = start;
    }
    if let Some(end) = args.end {
        config.date_end = end;
    }
    if let Some(remainder) = args.remainder {
        config.remainder = remainder.into();
    }
    if let Some(rate) = args.sample_rate {
        let seed = args
            .seed
            .or(config.sampling.map(|sampling| sampling.seed))
            .unwrap_or(0);
        config.sampling = Some(Sampling::new(rate, seed)?);
    }
    Ok(())
}

fn apply_collection(args: &CollectionArgs, config: &mut ResolvedConfig) -> Result<(), HarvestError> {
    if let Some(collection) = &args.collection {
        config.collection = collection.parse()?;
        config.channels = config.collection.resolve_channels(args.channels.clone())?;
    } else if let Some(channels) = &args.channels {
        config.channels = channels.clone();
    }
    Ok(())
}

/// Stand-in source for commands that never reach the network.
struct Offline;

impl geoharvest::source::ImagerySource for Offline {
    fn fetch_tile(
        &self,
        _bbox: &geoharvest::geometry::BoundingBox,
        _window: &geoharvest::window::TimeWindow,
        _collection: &CollectionId,
        _channels: &[String],
    ) -> Result<Vec<u8>, geoharvest::source::SourceError> {
        Err(geoharvest::source::SourceError::Unavailable(
            "offline command".to_string(),
        ))
    }
}
