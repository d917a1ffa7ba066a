//! Durable per-tile processing state.
//!
//! The snapshot on disk is the single source of truth for what remains to be
//! done. Every state change goes through [`ProgressStore::commit`], which
//! applies a mutation to a copy of the current snapshot, writes the result
//! with write-then-rename and only then publishes it in memory. A crash at
//! any point leaves the last fully committed snapshot on disk.
//!
//! The store assumes a single writer process. Within that process the
//! internal mutex serializes concurrent commits from worker threads.

use crate::atomic::write_json_atomic;
use crate::error::{Result, TileSweepError};
use crate::grid::{BBox, Tile, TileGrid};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileStatus {
    Pending,
    Exported,
    InProgress,
    Done,
    Failed,
    /// A status written by a newer version of the tool. Never selected for work.
    #[serde(other)]
    Unknown,
}

impl TileStatus {
    /// Allowed moves. Forward only, except `failed → pending` (retry) and
    /// `in_progress → pending` (crash recovery).
    pub fn can_transition_to(self, next: TileStatus) -> bool {
        use TileStatus::*;
        matches!(
            (self, next),
            (Pending, Exported)
                | (Pending, InProgress)
                | (Exported, InProgress)
                | (InProgress, Done)
                | (InProgress, Failed)
                | (InProgress, Pending)
                | (Failed, Pending)
        )
    }

    /// Statuses the batch runner may pick up.
    pub fn is_runnable(self) -> bool {
        matches!(self, TileStatus::Pending | TileStatus::Exported)
    }
}

impl fmt::Display for TileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TileStatus::Pending => "pending",
            TileStatus::Exported => "exported",
            TileStatus::InProgress => "in_progress",
            TileStatus::Done => "done",
            TileStatus::Failed => "failed",
            TileStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub tile_id: u32,
    pub status: TileStatus,
    #[serde(default)]
    pub attempts: u32,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ProcessingRecord {
    pub fn new(tile_id: u32, now: DateTime<Utc>) -> Self {
        Self {
            tile_id,
            status: TileStatus::Pending,
            attempts: 0,
            last_updated: now,
            last_error: None,
        }
    }
}

/// One invocation of the export command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRun {
    pub timestamp: DateTime<Utc>,
    pub requested: usize,
    pub accepted: Vec<u32>,
    #[serde(default)]
    pub rejected: Vec<u32>,
}

/// Grid parameters the tracked ids were generated from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub aoi: BBox,
    pub cell_size_degrees: f64,
}

impl From<&TileGrid> for GridSpec {
    fn from(grid: &TileGrid) -> Self {
        Self {
            aoi: grid.aoi(),
            cell_size_degrees: grid.cell_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    #[serde(default)]
    pub grid: Option<GridSpec>,
    #[serde(default)]
    pub total_tiles: u32,
    #[serde(default)]
    pub records: BTreeMap<u32, ProcessingRecord>,
    #[serde(default)]
    pub export_history: Vec<ExportRun>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

fn default_format_version() -> u32 {
    FORMAT_VERSION
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            grid: None,
            total_tiles: 0,
            records: BTreeMap::new(),
            export_history: Vec::new(),
            last_updated: None,
        }
    }
}

impl Snapshot {
    pub fn status(&self, tile_id: u32) -> Option<TileStatus> {
        self.records.get(&tile_id).map(|r| r.status)
    }

    pub fn ids_with_status(&self, status: TileStatus) -> Vec<u32> {
        self.records
            .values()
            .filter(|r| r.status == status)
            .map(|r| r.tile_id)
            .collect()
    }

    pub fn processed(&self) -> Vec<u32> {
        self.ids_with_status(TileStatus::Done)
    }

    pub fn failed(&self) -> Vec<u32> {
        self.ids_with_status(TileStatus::Failed)
    }

    pub fn in_progress(&self) -> Vec<u32> {
        self.ids_with_status(TileStatus::InProgress)
    }

    /// Ids an export has already been accepted for. Covers tiles that went
    /// back to `pending` through retry or crash recovery.
    pub fn exported_ids(&self) -> BTreeSet<u32> {
        self.records
            .values()
            .filter(|r| r.status != TileStatus::Pending)
            .map(|r| r.tile_id)
            .chain(
                self.export_history
                    .iter()
                    .flat_map(|run| run.accepted.iter().copied()),
            )
            .collect()
    }

    /// Apply one validated status change.
    pub fn transition(
        &mut self,
        tile_id: u32,
        to: TileStatus,
        now: DateTime<Utc>,
    ) -> Result<&mut ProcessingRecord> {
        let record = self
            .records
            .get_mut(&tile_id)
            .ok_or(TileSweepError::UnknownTile(tile_id))?;
        if !record.status.can_transition_to(to) {
            return Err(TileSweepError::InvalidTransition {
                tile_id,
                from: record.status,
                to,
            });
        }
        record.status = to;
        record.last_updated = now;
        Ok(record)
    }

    /// Add pending records for tiles not yet tracked. Existing records are untouched.
    pub fn seed(&mut self, tiles: &[Tile], now: DateTime<Utc>) -> usize {
        let mut added = 0;
        for tile in tiles.iter().filter(|t| t.is_land) {
            self.records.entry(tile.id).or_insert_with(|| {
                added += 1;
                ProcessingRecord::new(tile.id, now)
            });
        }
        self.total_tiles = self.records.len() as u32;
        added
    }

    pub fn summary(&self) -> ProgressSummary {
        let mut summary = ProgressSummary {
            total_tiles: self.total_tiles,
            ..ProgressSummary::default()
        };
        for record in self.records.values() {
            match record.status {
                TileStatus::Pending => summary.pending += 1,
                TileStatus::Exported => summary.exported += 1,
                TileStatus::InProgress => summary.in_progress += 1,
                TileStatus::Done => summary.done += 1,
                TileStatus::Failed => summary.failed += 1,
                TileStatus::Unknown => summary.unknown += 1,
            }
        }
        summary.completion_percent = if summary.total_tiles > 0 {
            100.0 * summary.done as f64 / summary.total_tiles as f64
        } else {
            0.0
        };
        summary
    }

    fn validate(&self, path: &Path) -> Result<()> {
        for (key, record) in &self.records {
            if *key != record.tile_id {
                return Err(TileSweepError::CorruptState {
                    path: path.to_path_buf(),
                    reason: format!("record keyed {} carries tile id {}", key, record.tile_id),
                });
            }
        }
        if (self.total_tiles as usize) < self.records.len() {
            return Err(TileSweepError::CorruptState {
                path: path.to_path_buf(),
                reason: format!(
                    "total_tiles {} is less than the {} tracked records",
                    self.total_tiles,
                    self.records.len()
                ),
            });
        }
        if self.format_version > FORMAT_VERSION {
            warn!(
                "Progress state format version {} is newer than {}; unknown fields are ignored",
                self.format_version, FORMAT_VERSION
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSummary {
    pub total_tiles: u32,
    pub pending: u32,
    pub exported: u32,
    pub in_progress: u32,
    pub done: u32,
    pub failed: u32,
    pub unknown: u32,
    pub completion_percent: f64,
}

/// On-disk layout: the snapshot plus derived id sets for human inspection.
/// The derived sets are ignored on load.
#[derive(Serialize)]
struct SnapshotDocument<'a> {
    #[serde(flatten)]
    snapshot: &'a Snapshot,
    processed: Vec<u32>,
    failed: Vec<u32>,
    in_progress: Vec<u32>,
}

pub struct ProgressStore {
    path: PathBuf,
    snapshot: Mutex<Snapshot>,
}

impl ProgressStore {
    /// Read the persisted snapshot, `None` if nothing has been committed yet.
    pub fn load(path: &Path) -> Result<Option<Snapshot>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot =
            serde_json::from_slice(&bytes).map_err(|e| TileSweepError::CorruptState {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        snapshot.validate(path)?;

        debug!(
            "Loaded progress state from {} ({} records)",
            path.display(),
            snapshot.records.len()
        );
        Ok(Some(snapshot))
    }

    /// Open the store at process start.
    ///
    /// Records left `in_progress` by a previous process are demoted to `pending`
    /// and the demotion is committed before any other work.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = match Self::load(&path)? {
            Some(snapshot) => snapshot,
            None => {
                info!("No progress state at {}, starting fresh", path.display());
                Snapshot::default()
            }
        };

        let store = Self {
            path,
            snapshot: Mutex::new(snapshot),
        };
        let recovered = store.reset_stale_in_progress()?;
        if !recovered.is_empty() {
            warn!(
                "Recovered {} tile(s) left in progress by a previous run: {:?}",
                recovered.len(),
                recovered
            );
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.lock().clone()
    }

    /// Apply `mutation` to a copy of the current snapshot and persist the
    /// result atomically. On any error the previous snapshot stays in force.
    pub fn commit<F>(&self, mutation: F) -> Result<Snapshot>
    where
        F: FnOnce(&Snapshot) -> Result<Snapshot>,
    {
        let mut current = self.snapshot.lock();
        let mut next = mutation(&current)?;
        next.last_updated = Some(Utc::now());

        let document = SnapshotDocument {
            snapshot: &next,
            processed: next.processed(),
            failed: next.failed(),
            in_progress: next.in_progress(),
        };
        write_json_atomic(&self.path, &document)?;

        *current = next.clone();
        Ok(next)
    }

    /// Tie the store to one grid. Ids are only stable for fixed grid
    /// parameters, so a store seeded from a different grid is refused.
    pub fn bind_grid(&self, grid: &TileGrid) -> Result<()> {
        let wanted = GridSpec::from(grid);
        match self.snapshot.lock().grid {
            Some(existing) if existing == wanted => return Ok(()),
            Some(existing) => {
                return Err(TileSweepError::InvalidConfiguration(format!(
                    "progress state {} was created for aoi {:?} at {}°, not aoi {:?} at {}°",
                    self.path.display(),
                    <[f64; 4]>::from(existing.aoi),
                    existing.cell_size_degrees,
                    <[f64; 4]>::from(wanted.aoi),
                    wanted.cell_size_degrees
                )))
            }
            None => {}
        }
        self.commit(|old| {
            let mut next = old.clone();
            next.grid = Some(wanted);
            Ok(next)
        })?;
        Ok(())
    }

    /// Register grid tiles so each has a record. Returns how many were new.
    pub fn seed_tiles(&self, tiles: &[Tile]) -> Result<usize> {
        let untracked = {
            let current = self.snapshot.lock();
            tiles
                .iter()
                .any(|t| t.is_land && !current.records.contains_key(&t.id))
        };
        if !untracked {
            return Ok(0);
        }
        let mut added = 0;
        self.commit(|old| {
            let mut next = old.clone();
            added = next.seed(tiles, Utc::now());
            Ok(next)
        })?;
        if added > 0 {
            info!("Tracking {} new tile(s)", added);
        }
        Ok(added)
    }

    pub fn mark_exported(&self, run: ExportRun) -> Result<()> {
        self.commit(|old| {
            let mut next = old.clone();
            for &id in &run.accepted {
                next.transition(id, TileStatus::Exported, run.timestamp)?;
            }
            next.export_history.push(run.clone());
            Ok(next)
        })?;
        Ok(())
    }

    pub fn mark_in_progress(&self, tile_id: u32) -> Result<()> {
        self.commit(|old| {
            let mut next = old.clone();
            let record = next.transition(tile_id, TileStatus::InProgress, Utc::now())?;
            record.attempts += 1;
            Ok(next)
        })?;
        Ok(())
    }

    pub fn mark_done(&self, tile_id: u32) -> Result<()> {
        self.commit(|old| {
            let mut next = old.clone();
            let record = next.transition(tile_id, TileStatus::Done, Utc::now())?;
            record.last_error = None;
            Ok(next)
        })?;
        Ok(())
    }

    pub fn mark_failed(&self, tile_id: u32, reason: &str) -> Result<()> {
        self.commit(|old| {
            let mut next = old.clone();
            let record = next.transition(tile_id, TileStatus::Failed, Utc::now())?;
            record.last_error = Some(reason.to_string());
            Ok(next)
        })?;
        Ok(())
    }

    /// Explicit retry: move failed tiles back to `pending`. With `ids` given,
    /// only those tiles are reset and each must currently be `failed`.
    pub fn reset_failed(&self, ids: Option<&[u32]>) -> Result<Vec<u32>> {
        let mut reset = Vec::new();
        self.commit(|old| {
            let mut next = old.clone();
            let targets = match ids {
                Some(ids) => ids.to_vec(),
                None => old.failed(),
            };
            let now = Utc::now();
            for id in targets {
                match old.status(id) {
                    Some(TileStatus::Failed) => {}
                    Some(from) => {
                        return Err(TileSweepError::InvalidTransition {
                            tile_id: id,
                            from,
                            to: TileStatus::Pending,
                        })
                    }
                    None => return Err(TileSweepError::UnknownTile(id)),
                }
                let record = next.transition(id, TileStatus::Pending, now)?;
                record.last_error = None;
                reset.push(id);
            }
            Ok(next)
        })?;
        Ok(reset)
    }

    /// Demote every `in_progress` record to `pending`. Only valid when no
    /// detector task is live, which holds at process start.
    pub fn reset_stale_in_progress(&self) -> Result<Vec<u32>> {
        let stale = self.snapshot.lock().in_progress();
        if stale.is_empty() {
            return Ok(stale);
        }
        self.commit(|old| {
            let mut next = old.clone();
            let now = Utc::now();
            for &id in &stale {
                next.transition(id, TileStatus::Pending, now)?;
            }
            Ok(next)
        })?;
        Ok(stale)
    }
}
