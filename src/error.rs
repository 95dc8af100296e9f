use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid date range: {0}")]
    InvalidRange(String),

    #[error("invalid geohash: {0}")]
    InvalidGeohash(String),

    #[error("invalid collection id: {0}")]
    InvalidCollection(String),

    #[error("no default channels known for collection {0}; pass channels explicitly")]
    UnknownChannels(String),

    #[error("manifest at {path} is corrupt: {reason}")]
    #[diagnostic(help("regenerate the manifest with `geoharvest plan` instead of editing it"))]
    ManifestCorrupt { path: String, reason: String },

    #[error("sample {key} does not match any planned tile")]
    #[diagnostic(help("the output directory and the manifest were produced by different plans"))]
    UnknownTile { key: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to parse GeoJSON input {path}: {reason}")]
    GeoJson { path: String, reason: String },

    #[error("failed to parse CSV input {path}: {reason}")]
    Csv { path: String, reason: String },

    #[error("imagery source request failed: {0}")]
    SourceHttp(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
