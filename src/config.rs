use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::{CollectionId, SENTINEL_2_COLLECTION};
use crate::error::HarvestError;
use crate::executor::{ExecutorOptions, RetryPolicy};
use crate::source::HttpSourceConfig;
use crate::tiler::Sampling;
use crate::window::RemainderPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "geoharvest.json";
pub const ENDPOINT_ENV: &str = "GEOHARVEST_ENDPOINT";
pub const TOKEN_ENV: &str = "GEOHARVEST_TOKEN";

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub channels: Option<Vec<String>>,
    #[serde(default)]
    pub precision: Option<usize>,
    #[serde(default)]
    pub interval_days: Option<i64>,
    #[serde(default)]
    pub date_start: Option<NaiveDate>,
    #[serde(default)]
    pub date_end: Option<NaiveDate>,
    #[serde(default)]
    pub remainder: Option<RemainderPolicy>,
    #[serde(default)]
    pub sampling: Option<SamplingEntry>,
    #[serde(default)]
    pub coverage: Option<PathBuf>,
    #[serde(default)]
    pub points: Option<PathBuf>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub retry: Option<RetryEntry>,
    #[serde(default)]
    pub skip_existing: Option<bool>,
    #[serde(default)]
    pub source: Option<SourceEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SamplingEntry {
    pub rate: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetryEntry {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SourceEntry {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub scale_m: Option<f64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Run settings with every default filled in.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub collection: CollectionId,
    pub channels: Vec<String>,
    /// Whether `channels` came from the config rather than a preset.
    pub precision: usize,
    pub interval_days: i64,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub remainder: RemainderPolicy,
    pub sampling: Option<Sampling>,
    pub coverage: Option<PathBuf>,
    pub points: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub executor: ExecutorOptions,
    pub source: ResolvedSource,
}

#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub scale_m: f64,
    pub timeout: Duration,
}

impl ResolvedSource {
    pub fn http_config(&self) -> Result<HttpSourceConfig, HarvestError> {
        let endpoint = self.endpoint.clone().ok_or_else(|| {
            HarvestError::InvalidInput(format!(
                "no imagery endpoint configured; set source.endpoint or {ENDPOINT_ENV}"
            ))
        })?;
        Ok(HttpSourceConfig {
            endpoint,
            token: self.token.clone(),
            scale_m: self.scale_m,
            timeout: self.timeout,
        })
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `geoharvest.json` in the working directory when it
    /// exists. With neither, every setting takes its default.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(HarvestError::ConfigParse(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let collection: CollectionId = config
            .collection
            .as_deref()
            .unwrap_or(SENTINEL_2_COLLECTION)
            .parse()?;
        let channels = collection.resolve_channels(config.channels)?;

        let sampling = config
            .sampling
            .map(|entry| Sampling::new(entry.rate, entry.seed.unwrap_or(0)))
            .transpose()?;

        let retry_entry = config.retry.unwrap_or_default();
        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: retry_entry.max_retries.unwrap_or(defaults.max_retries),
            base_delay: retry_entry
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: retry_entry
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
        };
        let executor = ExecutorOptions {
            concurrency: config
                .concurrency
                .unwrap_or(ExecutorOptions::default().concurrency),
            retry,
            skip_existing: config.skip_existing.unwrap_or(true),
        };
        if executor.concurrency == 0 {
            return Err(HarvestError::ConfigParse(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let source_entry = config.source.unwrap_or_default();
        let source = ResolvedSource {
            endpoint: source_entry
                .endpoint
                .or_else(|| non_empty_env(ENDPOINT_ENV)),
            token: source_entry.token.or_else(|| non_empty_env(TOKEN_ENV)),
            scale_m: source_entry.scale_m.unwrap_or(10.0),
            timeout: Duration::from_secs(source_entry.timeout_secs.unwrap_or(120)),
        };

        Ok(ResolvedConfig {
            schema_version,
            collection,
            channels,
            precision: config.precision.unwrap_or(5),
            interval_days: config.interval_days.unwrap_or(30),
            date_start: config.date_start.unwrap_or(default_date(2020, 1, 1)),
            date_end: config.date_end.unwrap_or(default_date(2020, 2, 1)),
            remainder: config.remainder.unwrap_or_default(),
            sampling,
            coverage: config.coverage,
            points: config.points,
            output_dir: config.output_dir.unwrap_or_else(|| PathBuf::from("data")),
            executor,
            source,
        })
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn default_date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
}
