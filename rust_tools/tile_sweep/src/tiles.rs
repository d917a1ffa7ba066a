use crate::error::Result;
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

pub const TILE_EXTENSION: &str = "tif";

/// A raster file that has arrived for a tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileFile {
    pub tile_id: u32,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// `africa_s2_2021` + 42 → `africa_s2_2021_tile_0042.tif`
pub fn tile_file_name(prefix: &str, tile_id: u32) -> String {
    format!("{}_tile_{:04}.{}", prefix, tile_id, TILE_EXTENSION)
}

/// Stem used for exports and result files, without extension.
pub fn tile_stem(prefix: &str, tile_id: u32) -> String {
    format!("{}_tile_{:04}", prefix, tile_id)
}

/// Extract the tile id from a file name ending in `_tile_<digits>.tif`.
pub fn parse_tile_id(file_name: &str) -> Option<u32> {
    let stem = file_name.strip_suffix(&format!(".{}", TILE_EXTENSION))?;
    let (_, digits) = stem.rsplit_once("_tile_")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// List tile files in `dir` whose names start with `prefix`, sorted by id.
/// A missing directory yields an empty list.
pub fn scan_tile_files(dir: &Path, prefix: &str) -> Result<Vec<TileFile>> {
    if !dir.exists() {
        debug!("Tile directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }
        let Some(tile_id) = parse_tile_id(name) else {
            debug!("Skipping unrecognised file {}", name);
            continue;
        };
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        files.push(TileFile {
            tile_id,
            path: entry.path(),
            size_bytes: metadata.len(),
        });
    }

    files.sort_by_key(|f| f.tile_id);
    files.dedup_by_key(|f| f.tile_id);
    Ok(files)
}
