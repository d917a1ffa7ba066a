//! Bounded detection batches with per-tile failure isolation.
//!
//! Each selected tile goes `in_progress → done | failed` through the progress
//! store. A detector error or a failed result write only fails that tile.
//! Errors from the store itself abort the batch because progress can no
//! longer be recorded.

use crate::detector::Detector;
use crate::error::Result;
use crate::grid::Tile;
use crate::progress::{ProgressStore, Snapshot};
use crate::results::ResultStore;
use crate::tiles::TileFile;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub tile: Tile,
    pub file: TileFile,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub succeeded: Vec<u32>,
    pub failed: Vec<(u32, String)>,
    /// Files present on disk whose id is not a tracked land tile.
    pub ignored_files: Vec<u32>,
}

impl BatchReport {
    pub fn processed(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

enum TileOutcome {
    Done(u32),
    Failed(u32, String),
}

pub struct BatchRunner<'a> {
    store: &'a ProgressStore,
    tiles: HashMap<u32, Tile>,
    results: ResultStore,
    work_dir: Option<PathBuf>,
    workers: usize,
}

impl<'a> BatchRunner<'a> {
    pub fn new(store: &'a ProgressStore, tiles: &[Tile], results: ResultStore) -> Self {
        Self {
            store,
            tiles: tiles
                .iter()
                .filter(|t| t.is_land)
                .map(|t| (t.id, *t))
                .collect(),
            results,
            work_dir: None,
            workers: 1,
        }
    }

    /// Copy each tile into `dir` before detection and delete the copy after.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Up to `batch_size` runnable tiles among `files`, ascending id.
    pub fn select(
        &self,
        files: &[TileFile],
        batch_size: usize,
        snapshot: &Snapshot,
    ) -> (Vec<WorkItem>, Vec<u32>) {
        let mut sorted: Vec<&TileFile> = files.iter().collect();
        sorted.sort_by_key(|f| f.tile_id);

        let mut ignored = Vec::new();
        let mut selected = Vec::new();
        for file in sorted {
            let Some(tile) = self.tiles.get(&file.tile_id) else {
                ignored.push(file.tile_id);
                continue;
            };
            match snapshot.status(file.tile_id) {
                Some(status) if status.is_runnable() => {}
                Some(status) => {
                    debug!("Tile {} is {}, skipping", file.tile_id, status);
                    continue;
                }
                None => {
                    ignored.push(file.tile_id);
                    continue;
                }
            }
            if selected.len() < batch_size {
                selected.push(WorkItem {
                    tile: *tile,
                    file: file.clone(),
                });
            }
        }
        (selected, ignored)
    }

    pub fn run<D: Detector + ?Sized>(
        &self,
        files: &[TileFile],
        batch_size: usize,
        detector: &D,
    ) -> Result<BatchReport> {
        let (batch, ignored) = self.select(files, batch_size, &self.store.snapshot());
        if !ignored.is_empty() {
            warn!(
                "Ignoring {} file(s) with no tracked land tile: {:?}",
                ignored.len(),
                ignored
            );
        }
        if batch.is_empty() {
            info!("No eligible tiles among {} available file(s)", files.len());
            return Ok(BatchReport {
                ignored_files: ignored,
                ..BatchReport::default()
            });
        }

        info!(
            "Processing {} tile(s) with {} worker(s)",
            batch.len(),
            self.workers
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()?;
        let outcomes: Vec<TileOutcome> = pool.install(|| {
            batch
                .par_iter()
                .map(|item| self.process_tile(item, detector))
                .collect::<Result<Vec<_>>>()
        })?;

        let mut report = BatchReport {
            ignored_files: ignored,
            ..BatchReport::default()
        };
        for outcome in outcomes {
            match outcome {
                TileOutcome::Done(id) => report.succeeded.push(id),
                TileOutcome::Failed(id, reason) => report.failed.push((id, reason)),
            }
        }
        report.succeeded.sort_unstable();
        report.failed.sort_by_key(|(id, _)| *id);

        info!(
            "Batch finished: {} succeeded, {} failed",
            report.succeeded.len(),
            report.failed.len()
        );
        Ok(report)
    }

    fn process_tile<D: Detector + ?Sized>(&self, item: &WorkItem, detector: &D) -> Result<TileOutcome> {
        let tile_id = item.tile.id;
        self.store.mark_in_progress(tile_id)?;
        info!(
            "Tile {:04}: detecting ({:.1} MB)",
            tile_id,
            item.file.size_bytes as f64 / (1024.0 * 1024.0)
        );

        let staged = match self.stage(&item.file) {
            Ok(path) => path,
            Err(e) => return self.fail(tile_id, format!("staging failed: {}", e)),
        };

        let detected = detector.detect(&item.tile, &staged);
        if staged != item.file.path {
            if let Err(e) = fs::remove_file(&staged) {
                debug!("Could not remove staged copy {}: {}", staged.display(), e);
            }
        }

        let result = match detected {
            Ok(result) => result,
            Err(e) => return self.fail(tile_id, e.to_string()),
        };
        if let Err(e) = self.results.write(&result) {
            return self.fail(tile_id, format!("result write failed: {}", e));
        }

        self.store.mark_done(tile_id)?;
        info!(
            "Tile {:04}: done, {} detection(s)",
            tile_id,
            result.detections.len()
        );
        Ok(TileOutcome::Done(tile_id))
    }

    fn stage(&self, file: &TileFile) -> std::io::Result<PathBuf> {
        let Some(work_dir) = &self.work_dir else {
            return Ok(file.path.clone());
        };
        fs::create_dir_all(work_dir)?;
        let name = file
            .path
            .file_name()
            .map(Path::new)
            .unwrap_or_else(|| Path::new("tile.tif"));
        let dest = work_dir.join(name);
        fs::copy(&file.path, &dest)?;
        Ok(dest)
    }

    fn fail(&self, tile_id: u32, reason: String) -> Result<TileOutcome> {
        warn!("Tile {:04}: failed: {}", tile_id, reason);
        self.store.mark_failed(tile_id, &reason)?;
        Ok(TileOutcome::Failed(tile_id, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{Detection, DetectionResult};
    use crate::error::DetectionError;
    use crate::grid::{generate, AllLand, BBox};
    use crate::progress::TileStatus;
    use crate::tiles::{scan_tile_files, tile_file_name};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: ProgressStore,
        tiles: Vec<Tile>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = ProgressStore::open(dir.path().join("progress.json")).unwrap();
            let tiles = generate(BBox::new(0.0, 0.0, 3.0, 2.0), 1.0, &AllLand).unwrap();
            store.seed_tiles(&tiles).unwrap();
            Self { dir, store, tiles }
        }

        fn add_files(&self, ids: &[u32]) -> Vec<TileFile> {
            let src = self.dir.path().join("incoming");
            fs::create_dir_all(&src).unwrap();
            for id in ids {
                fs::write(src.join(tile_file_name("s2", *id)), b"raster").unwrap();
            }
            scan_tile_files(&src, "s2").unwrap()
        }

        fn runner(&self) -> BatchRunner<'_> {
            BatchRunner::new(
                &self.store,
                &self.tiles,
                ResultStore::new(self.dir.path().join("results")),
            )
        }
    }

    fn one_detection(tile: &Tile, _raster: &Path) -> std::result::Result<DetectionResult, DetectionError> {
        Ok(DetectionResult {
            tile_id: tile.id,
            bbox: tile.bbox,
            width: 10,
            height: 10,
            detections: vec![Detection {
                polygon: vec![[1.0, 1.0], [3.0, 1.0], [3.0, 3.0], [1.0, 3.0]],
                confidence: 0.9,
                class: "cpi".into(),
            }],
        })
    }

    #[test]
    fn test_batch_size_limits_selection() {
        let fx = Fixture::new();
        let files = fx.add_files(&[4, 0, 2, 5]);
        let report = fx.runner().run(&files, 2, &one_detection).unwrap();
        assert_eq!(report.succeeded, vec![0, 2]);
        assert_eq!(fx.store.snapshot().status(4), Some(TileStatus::Pending));
    }

    #[test]
    fn test_failure_is_isolated() {
        let fx = Fixture::new();
        let files = fx.add_files(&[1, 2, 3, 4, 5]);
        let flaky = |tile: &Tile, raster: &Path| {
            if tile.id == 3 {
                Err(DetectionError::InvalidOutput("corrupt raster".into()))
            } else {
                one_detection(tile, raster)
            }
        };

        let report = fx.runner().with_workers(3).run(&files, 5, &flaky).unwrap();
        assert_eq!(report.succeeded, vec![1, 2, 4, 5]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 3);

        let snapshot = fx.store.snapshot();
        assert_eq!(snapshot.status(3), Some(TileStatus::Failed));
        for id in [1, 2, 4, 5] {
            assert_eq!(snapshot.status(id), Some(TileStatus::Done));
            assert!(fx.dir.path().join("results").join(format!("tile_{:04}.json", id)).exists());
        }
        assert!(!fx.dir.path().join("results").join("tile_0003.json").exists());
    }

    #[test]
    fn test_rerun_processes_nothing_new() {
        let fx = Fixture::new();
        let files = fx.add_files(&[0, 1, 2]);
        let calls = AtomicUsize::new(0);
        let counting = |tile: &Tile, raster: &Path| {
            calls.fetch_add(1, Ordering::SeqCst);
            one_detection(tile, raster)
        };

        let first = fx.runner().run(&files, 10, &counting).unwrap();
        assert_eq!(first.processed(), 3);
        let second = fx.runner().run(&files, 10, &counting).unwrap();
        assert_eq!(second.processed(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failed_tiles_wait_for_explicit_retry() {
        let fx = Fixture::new();
        let files = fx.add_files(&[0]);
        let failing = |_: &Tile, _: &Path| -> std::result::Result<DetectionResult, DetectionError> {
            Err(DetectionError::Timeout(30))
        };

        fx.runner().run(&files, 10, &failing).unwrap();
        let again = fx.runner().run(&files, 10, &one_detection).unwrap();
        assert_eq!(again.processed(), 0);

        fx.store.reset_failed(None).unwrap();
        let retried = fx.runner().run(&files, 10, &one_detection).unwrap();
        assert_eq!(retried.succeeded, vec![0]);
        assert_eq!(fx.store.snapshot().records[&0].attempts, 2);
    }

    #[test]
    fn test_untracked_files_are_ignored() {
        let fx = Fixture::new();
        let files = fx.add_files(&[1, 40]);
        let report = fx.runner().run(&files, 10, &one_detection).unwrap();
        assert_eq!(report.succeeded, vec![1]);
        assert_eq!(report.ignored_files, vec![40]);
    }

    #[test]
    fn test_staged_copies_are_removed() {
        let fx = Fixture::new();
        let files = fx.add_files(&[0, 1]);
        let work = fx.dir.path().join("work");
        let seen_staged = |tile: &Tile, raster: &Path| {
            assert!(raster.starts_with(fx.dir.path().join("work")));
            assert!(raster.exists());
            one_detection(tile, raster)
        };

        let report = fx
            .runner()
            .with_work_dir(&work)
            .run(&files, 10, &seen_staged)
            .unwrap();
        assert_eq!(report.succeeded, vec![0, 1]);
        assert_eq!(fs::read_dir(&work).unwrap().count(), 0);
        // Source files are left in place
        assert!(files.iter().all(|f| f.path.exists()));
    }
}
