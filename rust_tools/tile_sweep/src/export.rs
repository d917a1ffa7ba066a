//! Quota-limited export scheduling.
//!
//! The exporter itself is asynchronous and external: a request only asks for a
//! raster to appear later under the tile's file name. A tile is recorded as
//! exported once its request has been accepted, never before.

use crate::atomic::write_json_atomic;
use crate::command::{expand_args, run_with_timeout, CommandOutcome};
use crate::error::{Result, TileSweepError};
use crate::grid::{BBox, Tile};
use crate::progress::{ExportRun, ProgressStore};
use crate::tiles::tile_stem;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Up to `quota` land tiles not yet exported, lowest ids first.
pub fn next_batch(all_tiles: &[Tile], already_exported: &BTreeSet<u32>, quota: usize) -> Vec<Tile> {
    let mut candidates: Vec<Tile> = all_tiles
        .iter()
        .filter(|t| t.is_land && !already_exported.contains(&t.id))
        .copied()
        .collect();
    candidates.sort_by_key(|t| t.id);
    candidates.truncate(quota);
    candidates
}

pub trait Exporter {
    fn request(&mut self, tile: &Tile) -> Result<()>;
}

/// Accepts every request. The batch manifest is the hand-off to whatever
/// performs the export.
#[derive(Debug, Default)]
pub struct ManifestExporter;

impl Exporter for ManifestExporter {
    fn request(&mut self, _tile: &Tile) -> Result<()> {
        Ok(())
    }
}

/// Submits each tile by running an external program.
///
/// Placeholders: `{id}`, `{name}`, `{min_lon}`, `{min_lat}`, `{max_lon}`, `{max_lat}`.
#[derive(Debug, Clone)]
pub struct CommandExporter {
    pub program: String,
    pub args: Vec<String>,
    pub name_prefix: String,
    pub timeout: Option<Duration>,
}

impl Exporter for CommandExporter {
    fn request(&mut self, tile: &Tile) -> Result<()> {
        let args = expand_args(
            &self.args,
            &[
                ("id", tile.id.to_string()),
                ("name", tile_stem(&self.name_prefix, tile.id)),
                ("min_lon", tile.bbox.min_lon.to_string()),
                ("min_lat", tile.bbox.min_lat.to_string()),
                ("max_lon", tile.bbox.max_lon.to_string()),
                ("max_lat", tile.bbox.max_lat.to_string()),
            ],
        );

        let outcome = run_with_timeout(&self.program, &args, self.timeout).map_err(|e| {
            TileSweepError::Export {
                tile_id: tile.id,
                reason: format!("failed to start {}: {}", self.program, e),
            }
        })?;

        match outcome {
            CommandOutcome::Exited { status, .. } if status.success() => Ok(()),
            CommandOutcome::Exited { status, stderr } => Err(TileSweepError::Export {
                tile_id: tile.id,
                reason: format!("{} exited with {}: {}", self.program, status, stderr),
            }),
            CommandOutcome::TimedOut => Err(TileSweepError::Export {
                tile_id: tile.id,
                reason: format!("{} timed out", self.program),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestEntry {
    pub id: u32,
    pub name: String,
    pub bbox: BBox,
}

#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub tile_id: u32,
    pub reason: String,
}

/// Batch metadata written next to the progress state on every export run.
#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub batch: usize,
    pub timestamp: DateTime<Utc>,
    pub requested: Vec<ManifestEntry>,
    pub accepted: Vec<u32>,
    pub rejected: Vec<Rejection>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportReport {
    pub requested: usize,
    pub accepted: Vec<u32>,
    pub rejected: Vec<u32>,
    pub remaining: usize,
    pub manifest: Option<PathBuf>,
}

pub struct ExportOptions<'a> {
    pub quota: usize,
    pub name_prefix: &'a str,
    pub manifest_dir: &'a Path,
}

/// Request the next batch and record accepted tiles in the store.
pub fn export_next_batch<E: Exporter + ?Sized>(
    store: &ProgressStore,
    tiles: &[Tile],
    exporter: &mut E,
    options: &ExportOptions<'_>,
) -> Result<ExportReport> {
    let snapshot = store.snapshot();
    let exported = snapshot.exported_ids();
    let batch = next_batch(tiles, &exported, options.quota);

    if batch.is_empty() {
        let remaining = unexported(tiles, &exported).count();
        if remaining == 0 {
            info!("All {} land tiles have been exported", tiles.len());
        } else {
            info!(
                "Export quota is {}; {} tile(s) still awaiting export",
                options.quota, remaining
            );
        }
        return Ok(ExportReport {
            remaining,
            ..ExportReport::default()
        });
    }

    info!(
        "Requesting export of {} tile(s): ids {} to {}",
        batch.len(),
        batch[0].id,
        batch[batch.len() - 1].id
    );

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for tile in &batch {
        match exporter.request(tile) {
            Ok(()) => {
                info!("Export requested: {}", tile_stem(options.name_prefix, tile.id));
                accepted.push(tile.id);
            }
            Err(e) => {
                warn!("Export of tile {} rejected: {}", tile.id, e);
                rejected.push(Rejection {
                    tile_id: tile.id,
                    reason: e.to_string(),
                });
            }
        }
    }

    let timestamp = Utc::now();
    let batch_number = snapshot.export_history.len() + 1;
    let manifest = ExportManifest {
        batch: batch_number,
        timestamp,
        requested: batch
            .iter()
            .map(|t| ManifestEntry {
                id: t.id,
                name: tile_stem(options.name_prefix, t.id),
                bbox: t.bbox,
            })
            .collect(),
        accepted: accepted.clone(),
        rejected: rejected.clone(),
    };
    let manifest_path = options
        .manifest_dir
        .join(format!("export_batch_{:04}.json", batch_number));
    write_json_atomic(&manifest_path, &manifest)?;

    let rejected_ids: Vec<u32> = rejected.iter().map(|r| r.tile_id).collect();
    store.mark_exported(ExportRun {
        timestamp,
        requested: batch.len(),
        accepted: accepted.clone(),
        rejected: rejected_ids.clone(),
    })?;

    let remaining = unexported(tiles, &exported)
        .filter(|t| !accepted.contains(&t.id))
        .count();

    Ok(ExportReport {
        requested: batch.len(),
        accepted,
        rejected: rejected_ids,
        remaining,
        manifest: Some(manifest_path),
    })
}

fn unexported<'a>(
    tiles: &'a [Tile],
    exported: &'a BTreeSet<u32>,
) -> impl Iterator<Item = &'a Tile> + 'a {
    tiles
        .iter()
        .filter(move |t| t.is_land && !exported.contains(&t.id))
}
