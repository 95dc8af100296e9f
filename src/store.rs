use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tempfile::Builder;

use crate::domain::{CollectionId, RequestKey};
use crate::error::HarvestError;

pub const ARCHIVE_EXTENSION: &str = "zip";
pub const METADATA_FILE: &str = "metadata.json";

/// Where the fetch executor places archives:
/// `<root>/<collection slug>/<request key>.zip`.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: Utf8PathBuf,
}

impl OutputLayout {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn from_path(root: &Path) -> Result<Self, HarvestError> {
        let root = Utf8PathBuf::from_path_buf(root.to_path_buf())
            .map_err(|_| HarvestError::Filesystem("non-utf8 output directory".to_string()))?;
        Ok(Self { root })
    }

    pub fn collection_dir(&self, collection: &CollectionId) -> Utf8PathBuf {
        self.root.join(collection.slug())
    }

    pub fn archive_path(&self, collection: &CollectionId, key: &RequestKey) -> Utf8PathBuf {
        self.collection_dir(collection)
            .join(format!("{key}.{ARCHIVE_EXTENSION}"))
    }

    pub fn metadata_path(&self, collection: &CollectionId) -> Utf8PathBuf {
        self.collection_dir(collection).join(METADATA_FILE)
    }

    pub fn ensure_collection_dir(&self, collection: &CollectionId) -> Result<(), HarvestError> {
        fs::create_dir_all(self.collection_dir(collection).as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))
    }

    /// A previous run left a complete archive for this key.
    ///
    /// Archives are only ever renamed into place once fully written, so a
    /// non-empty file at the final path is complete.
    pub fn has_archive(&self, collection: &CollectionId, key: &RequestKey) -> bool {
        fs::metadata(self.archive_path(collection, key).as_std_path())
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub collection: String,
    pub channels: Vec<String>,
    pub precision: usize,
    pub requests: usize,
    pub fetched_at: String,
    pub tool: String,
}

pub fn write_metadata(path: &Utf8Path, metadata: &RunMetadata) -> Result<(), HarvestError> {
    let content = serde_json::to_vec_pretty(metadata)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    write_bytes_atomic(path.as_std_path(), &content)
}

/// Writes through a temp file in the destination directory and renames it
/// over `path`, so readers never observe a partial file.
pub fn write_bytes_atomic(path: &Path, content: &[u8]) -> Result<(), HarvestError> {
    let parent = parent_dir(path)?;
    fs::create_dir_all(parent).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".geoharvest-")
        .tempfile_in(parent)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    std::io::Write::write_all(&mut temp, content)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.persist(path)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn copy_file_atomic(source: &Path, dest: &Path) -> Result<(), HarvestError> {
    let parent = parent_dir(dest)?;
    fs::create_dir_all(parent).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    let temp = Builder::new()
        .prefix(".geoharvest-")
        .tempfile_in(parent)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    fs::copy(source, temp.path()).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.persist(dest)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    Ok(())
}

/// All regular files below `root`, sorted for stable processing order.
pub fn walk_files(root: &Path) -> Result<Vec<PathBuf>, HarvestError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                items.push(path);
            }
        }
    }
    items.sort();
    Ok(items)
}

fn parent_dir(path: &Path) -> Result<&Path, HarvestError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent),
        Some(_) => Ok(Path::new(".")),
        None => Err(HarvestError::Filesystem(format!(
            "invalid destination path {}",
            path.display()
        ))),
    }
}
