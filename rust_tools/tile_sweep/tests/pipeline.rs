use std::fs;
use std::path::Path;

use tempfile::TempDir;
use tile_sweep::detector::Detection;
use tile_sweep::export::{export_next_batch, ExportOptions, ManifestExporter};
use tile_sweep::tiles::{scan_tile_files, tile_file_name};
use tile_sweep::{
    merge, BBox, BatchRunner, DetectionError, DetectionResult, MergeOptions, ProgressStore,
    ResultStore, Tile, TileGrid, TileStatus,
};

const PREFIX: &str = "s2";

/// 2x2 grid over [0,0,2,2] with the north-west cell (id 2) treated as ocean.
fn grid_and_tiles() -> (TileGrid, Vec<Tile>) {
    let grid = TileGrid::new(BBox::new(0.0, 0.0, 2.0, 2.0), 1.0).unwrap();
    let mask = |b: &BBox| !(b.min_lon < 0.5 && b.min_lat > 0.5);
    let tiles = grid.land_tiles(&mask);
    (grid, tiles)
}

/// One square field in the middle of each tile.
fn centre_field(tile: &Tile, _raster: &Path) -> Result<DetectionResult, DetectionError> {
    Ok(DetectionResult {
        tile_id: tile.id,
        bbox: tile.bbox,
        width: 100,
        height: 100,
        detections: vec![Detection {
            polygon: vec![[40.0, 40.0], [60.0, 40.0], [60.0, 60.0], [40.0, 60.0]],
            confidence: 0.8,
            class: "cpi".into(),
        }],
    })
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn state(&self) -> std::path::PathBuf {
        self.dir.path().join("tile_progress.json")
    }

    fn open(&self, grid: &TileGrid, tiles: &[Tile]) -> ProgressStore {
        let store = ProgressStore::open(self.state()).unwrap();
        store.bind_grid(grid).unwrap();
        store.seed_tiles(tiles).unwrap();
        store
    }

    fn deliver(&self, ids: &[u32]) {
        let incoming = self.dir.path().join("tiles");
        fs::create_dir_all(&incoming).unwrap();
        for id in ids {
            fs::write(incoming.join(tile_file_name(PREFIX, *id)), b"raster").unwrap();
        }
    }

    fn results(&self) -> ResultStore {
        ResultStore::new(self.dir.path().join("results"))
    }

    fn run(&self, store: &ProgressStore, tiles: &[Tile]) -> tile_sweep::BatchReport {
        let files = scan_tile_files(&self.dir.path().join("tiles"), PREFIX).unwrap();
        BatchRunner::new(store, tiles, self.results())
            .with_work_dir(self.dir.path().join("work"))
            .with_workers(2)
            .run(&files, 10, &centre_field)
            .unwrap()
    }
}

#[test]
fn test_grid_export_run_merge() {
    let ws = Workspace::new();
    let (grid, tiles) = grid_and_tiles();
    assert_eq!(tiles.iter().map(|t| t.id).collect::<Vec<_>>(), vec![0, 1, 3]);

    let store = ws.open(&grid, &tiles);
    let manifest_dir = ws.dir.path().join("exports");
    let report = export_next_batch(
        &store,
        &tiles,
        &mut ManifestExporter,
        &ExportOptions {
            quota: 10,
            name_prefix: PREFIX,
            manifest_dir: &manifest_dir,
        },
    )
    .unwrap();
    assert_eq!(report.accepted, vec![0, 1, 3]);
    assert_eq!(report.remaining, 0);
    assert!(manifest_dir.join("export_batch_0001.json").exists());

    ws.deliver(&[0, 1, 3]);
    let batch = ws.run(&store, &tiles);
    assert_eq!(batch.succeeded, vec![0, 1, 3]);
    assert!(batch.failed.is_empty());

    let merged = merge(&store.snapshot(), &ws.results(), &MergeOptions::default()).unwrap();
    let ids: Vec<u64> = merged.detections.iter().map(|d| d.global_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(merged.summary.tiles_skipped, 0);
    assert_eq!(merged.summary.tiles_contributing, 3);
    assert_eq!(merged.summary.duplicates_removed, 0);

    let (geojson, summary) = merged.write(&ws.dir.path().join("output"), "merged").unwrap();
    assert!(geojson.exists());
    assert!(summary.exists());
}

#[test]
fn test_restart_resumes_from_persisted_state() {
    let ws = Workspace::new();
    let (grid, tiles) = grid_and_tiles();

    {
        let store = ws.open(&grid, &tiles);
        ws.deliver(&[0, 1]);
        ws.run(&store, &tiles);
        // Process killed while tile 3 was being detected
        store.mark_in_progress(3).unwrap();
    }

    let store = ws.open(&grid, &tiles);
    let snapshot = store.snapshot();
    assert_eq!(snapshot.status(0), Some(TileStatus::Done));
    assert_eq!(snapshot.status(1), Some(TileStatus::Done));
    assert_eq!(snapshot.status(3), Some(TileStatus::Pending));

    ws.deliver(&[3]);
    let batch = ws.run(&store, &tiles);
    assert_eq!(batch.succeeded, vec![3]);
    assert_eq!(store.snapshot().records[&3].attempts, 2);
}

#[test]
fn test_second_pass_is_a_no_op() {
    let ws = Workspace::new();
    let (grid, tiles) = grid_and_tiles();
    let store = ws.open(&grid, &tiles);
    ws.deliver(&[0, 1, 3]);

    ws.run(&store, &tiles);
    let first = merge(&store.snapshot(), &ws.results(), &MergeOptions::default()).unwrap();
    let before = fs::read_to_string(ws.state()).unwrap();

    let again = ws.run(&store, &tiles);
    assert_eq!(again.processed(), 0);
    assert_eq!(fs::read_to_string(ws.state()).unwrap(), before);

    let second = merge(&store.snapshot(), &ws.results(), &MergeOptions::default()).unwrap();
    assert_eq!(first.detections, second.detections);
}

#[test]
fn test_grid_change_is_rejected() {
    let ws = Workspace::new();
    let (grid, tiles) = grid_and_tiles();
    ws.open(&grid, &tiles);

    let coarser = TileGrid::new(BBox::new(0.0, 0.0, 2.0, 2.0), 2.0).unwrap();
    let store = ProgressStore::open(ws.state()).unwrap();
    assert!(store.bind_grid(&coarser).is_err());
}
