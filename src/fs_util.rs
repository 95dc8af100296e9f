use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::HarvestError;

/// Extracts an archive into a directory and reports the files it wrote.
pub trait Unpacker: Send + Sync {
    fn unpack(&self, archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, HarvestError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ZipUnpacker;

impl Unpacker for ZipUnpacker {
    fn unpack(&self, archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, HarvestError> {
        extract_zip(archive, dest_dir)
    }
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<Vec<PathBuf>, HarvestError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        HarvestError::Archive(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| HarvestError::Archive(err.to_string()))?;

    let mut written = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| HarvestError::Archive(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(HarvestError::Archive(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        written.push(entry_path);
    }
    written.sort();
    Ok(written)
}

/// Reads every entry of an in-memory archive to check it is complete.
pub fn validate_zip(bytes: &[u8]) -> Result<(), HarvestError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| HarvestError::Archive(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| HarvestError::Archive(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| HarvestError::Archive(err.to_string()))?;
    }
    Ok(())
}
