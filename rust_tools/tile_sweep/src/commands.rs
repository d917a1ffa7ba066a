//! One function per CLI subcommand. Each reports succeeded/failed/skipped
//! counts rather than a bare pass/fail.

use crate::atomic::write_json_atomic;
use crate::config::Config;
use crate::detector::CommandDetector;
use crate::error::{Result, TileSweepError};
use crate::export::{export_next_batch, next_batch, CommandExporter, ExportOptions, Exporter, ManifestExporter};
use crate::grid::Tile;
use crate::merge::merge;
use crate::progress::{ProgressStore, TileStatus};
use crate::results::ResultStore;
use crate::runner::BatchRunner;
use crate::tiles::{scan_tile_files, tile_file_name};
use log::{info, warn};
use std::path::{Path, PathBuf};

/// Generate the land tiles and open the store bound to this grid.
fn open_pipeline(config: &Config) -> Result<(Vec<Tile>, ProgressStore)> {
    let grid = config.grid()?;
    let tiles = grid.land_tiles(&config.land_mask());
    let store = ProgressStore::open(&config.paths.state_file)?;
    store.bind_grid(&grid)?;
    store.seed_tiles(&tiles)?;
    Ok((tiles, store))
}

pub fn grid(config: &Config, json: Option<&Path>) -> Result<()> {
    let grid = config.grid()?;
    let mask = config.land_mask();
    let summary = grid.summary(&mask);

    info!(
        "Grid: {} columns x {} rows at {}° ({} tile ids)",
        summary.columns,
        summary.rows,
        grid.cell_size(),
        summary.id_space
    );
    info!("Land tiles: {}", summary.land_tiles);
    info!("Ocean tiles (skipped, ids reserved): {}", summary.ocean_tiles);
    if let (Some(min), Some(max)) = (summary.min_id, summary.max_id) {
        info!("Land tile ids: {} to {}", min, max);
    }

    if let Some(path) = json {
        let tiles = grid.land_tiles(&mask);
        write_json_atomic(path, &tiles)?;
        info!("Wrote {} tiles to {}", tiles.len(), path.display());
    }
    Ok(())
}

pub fn export(config: &Config, quota: Option<usize>, dry_run: bool) -> Result<()> {
    let quota = quota.unwrap_or(config.export.quota);
    let (tiles, store) = open_pipeline(config)?;

    if dry_run {
        let batch = next_batch(&tiles, &store.snapshot().exported_ids(), quota);
        info!("[DRY RUN] Would request {} tile(s):", batch.len());
        for tile in &batch {
            info!(
                "  {:04}: {}",
                tile.id,
                tile_file_name(&config.export.name_prefix, tile.id)
            );
        }
        return Ok(());
    }

    let mut exporter: Box<dyn Exporter> = match &config.export.program {
        Some(program) => Box::new(CommandExporter {
            program: program.clone(),
            args: config.export.args.clone(),
            name_prefix: config.export.name_prefix.clone(),
            timeout: config.export_timeout(),
        }),
        None => Box::new(ManifestExporter),
    };
    let manifest_dir = config.paths.output_dir.join("exports");
    let options = ExportOptions {
        quota,
        name_prefix: &config.export.name_prefix,
        manifest_dir: &manifest_dir,
    };
    let report = export_next_batch(&store, &tiles, exporter.as_mut(), &options)?;

    info!(
        "Export: {} requested, {} accepted, {} rejected, {} remaining",
        report.requested,
        report.accepted.len(),
        report.rejected.len(),
        report.remaining
    );
    if let Some(manifest) = &report.manifest {
        info!("Batch manifest: {}", manifest.display());
    }
    if !report.rejected.is_empty() {
        warn!("Rejected tiles stay pending: {:?}", report.rejected);
    }
    Ok(())
}

pub fn run(
    config: &Config,
    batch_size: Option<usize>,
    source: Option<PathBuf>,
    dry_run: bool,
) -> Result<()> {
    let batch_size = batch_size.unwrap_or(config.detect.batch_size);
    let source = source.unwrap_or_else(|| config.paths.tiles_dir.clone());
    let (tiles, store) = open_pipeline(config)?;

    let files = scan_tile_files(&source, &config.export.name_prefix)?;
    info!("Found {} tile file(s) in {}", files.len(), source.display());

    let runner = BatchRunner::new(&store, &tiles, ResultStore::new(&config.paths.results_dir))
        .with_work_dir(&config.paths.work_dir)
        .with_workers(config.detect.workers);

    if dry_run {
        let (batch, ignored) = runner.select(&files, batch_size, &store.snapshot());
        info!("[DRY RUN] Would process {} tile(s):", batch.len());
        let mut total_mb = 0.0;
        for item in &batch {
            let mb = item.file.size_bytes as f64 / (1024.0 * 1024.0);
            total_mb += mb;
            info!("  {:04}: {} ({:.1} MB)", item.tile.id, item.file.path.display(), mb);
        }
        info!("  Total batch size: {:.1} MB", total_mb);
        if !ignored.is_empty() {
            info!("  Ignored untracked files: {:?}", ignored);
        }
        return Ok(());
    }

    let program = config.detect.program.clone().ok_or_else(|| {
        TileSweepError::InvalidConfiguration("detect.program is not set".to_string())
    })?;
    let detector = CommandDetector {
        program,
        args: config.detect.args.clone(),
        scratch_dir: config.paths.work_dir.join("detections"),
        timeout: config.detect_timeout(),
    };

    let report = runner.run(&files, batch_size, &detector)?;
    info!(
        "Batch: {} succeeded, {} failed, {} ignored file(s)",
        report.succeeded.len(),
        report.failed.len(),
        report.ignored_files.len()
    );
    for (id, reason) in &report.failed {
        warn!("  tile {:04} failed: {}", id, reason);
    }
    if !report.failed.is_empty() {
        warn!("Failed tiles are retried only after `tile-sweep retry`");
    }

    let summary = store.snapshot().summary();
    info!(
        "Progress: {}/{} done ({:.1}%)",
        summary.done, summary.total_tiles, summary.completion_percent
    );
    Ok(())
}

pub fn merge_results(config: &Config, output: Option<PathBuf>) -> Result<()> {
    let output_dir = output.unwrap_or_else(|| config.paths.output_dir.clone());
    let (_, store) = open_pipeline(config)?;
    let results = ResultStore::new(&config.paths.results_dir);

    let merged = merge(&store.snapshot(), &results, &config.merge_options())?;
    let (geojson, summary_path) = merged.write(&output_dir, &config.merge.output_name)?;

    let s = &merged.summary;
    info!("Total detections: {}", s.total_detections);
    info!("Duplicates removed at tile boundaries: {}", s.duplicates_removed);
    info!("Below confidence threshold: {}", s.below_threshold);
    info!("Tiles contributing: {}", s.tiles_contributing);
    info!("Tiles skipped: {}", s.tiles_skipped);
    if !s.skipped_tile_ids.is_empty() {
        warn!("Skipped tiles (missing or unreadable results): {:?}", s.skipped_tile_ids);
    }
    info!(
        "Total area: {:.1} ha ({:.2} km²)",
        s.total_area_ha, s.total_area_km2
    );
    if let Some(avg) = s.avg_area_ha {
        info!("Average area: {:.2} ha", avg);
    }
    if let Some(avg) = s.avg_confidence {
        info!("Average confidence: {:.2}", avg);
    }
    info!("Output: {}", geojson.display());
    info!("Summary: {}", summary_path.display());
    Ok(())
}

pub fn status(config: &Config) -> Result<()> {
    let (_, store) = open_pipeline(config)?;
    let snapshot = store.snapshot();
    let s = snapshot.summary();

    info!("Total tiles: {}", s.total_tiles);
    info!("Pending: {}", s.pending);
    info!("Exported: {}", s.exported);
    info!("In progress: {}", s.in_progress);
    info!("Done: {}", s.done);
    info!("Failed: {}", s.failed);
    if s.unknown > 0 {
        warn!("Unknown status: {}", s.unknown);
    }
    info!("Completion: {:.1}%", s.completion_percent);
    info!("Export runs: {}", snapshot.export_history.len());

    for record in snapshot.records.values() {
        if record.status == TileStatus::Failed {
            info!(
                "  tile {:04} failed after {} attempt(s): {}",
                record.tile_id,
                record.attempts,
                record.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    Ok(())
}

pub fn retry(config: &Config, ids: &[u32]) -> Result<()> {
    let (_, store) = open_pipeline(config)?;
    let ids = (!ids.is_empty()).then_some(ids);
    let reset = store.reset_failed(ids)?;
    info!("Reset {} failed tile(s) to pending: {:?}", reset.len(), reset);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::BBox;
    use std::fs;
    use tempfile::TempDir;

    /// 2x2 one-degree grid with every path under `dir`.
    fn config_in(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.grid.aoi = BBox::new(0.0, 0.0, 2.0, 2.0);
        config.grid.cell_size_degrees = 1.0;
        config.paths.state_file = dir.path().join("tile_progress.json");
        config.paths.tiles_dir = dir.path().join("tiles");
        config.paths.work_dir = dir.path().join("work");
        config.paths.results_dir = dir.path().join("results");
        config.paths.output_dir = dir.path().join("output");
        config
    }

    fn deliver(config: &Config, ids: &[u32]) {
        fs::create_dir_all(&config.paths.tiles_dir).unwrap();
        for id in ids {
            let name = tile_file_name(&config.export.name_prefix, *id);
            fs::write(config.paths.tiles_dir.join(name), b"raster").unwrap();
        }
    }

    fn load_state(config: &Config) -> crate::progress::Snapshot {
        ProgressStore::load(&config.paths.state_file).unwrap().unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn test_detector_failures_do_not_fail_the_run() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.detect.program = Some("sh".into());
        config.detect.args = vec!["-c".into(), "echo 'no model' >&2; exit 2".into()];
        deliver(&config, &[0, 1]);

        run(&config, None, None, false).unwrap();

        let state = load_state(&config);
        assert_eq!(state.status(0), Some(TileStatus::Failed));
        assert_eq!(state.status(1), Some(TileStatus::Failed));
        let reason = state.records[&0].last_error.as_deref().unwrap();
        assert!(reason.contains("no model"));

        retry(&config, &[]).unwrap();
        assert_eq!(load_state(&config).failed(), Vec::<u32>::new());
    }

    #[test]
    fn test_missing_detector_program_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        deliver(&config, &[0]);

        let err = run(&config, None, None, false).unwrap_err();
        assert!(matches!(err, TileSweepError::InvalidConfiguration(_)));
        assert!(err.is_fatal());
        assert_eq!(load_state(&config).status(0), Some(TileStatus::Pending));
    }

    #[test]
    fn test_dry_run_leaves_tiles_untouched() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        deliver(&config, &[0, 3]);

        run(&config, None, None, true).unwrap();
        export(&config, Some(2), true).unwrap();

        let state = load_state(&config);
        assert_eq!(state.summary().pending, 4);
        assert!(state.export_history.is_empty());
    }

    #[test]
    fn test_corrupt_state_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        fs::write(&config.paths.state_file, b"{\"records\": [").unwrap();

        let err = status(&config).unwrap_err();
        assert!(matches!(err, TileSweepError::CorruptState { .. }));
        assert!(err.is_fatal());
        // Never repaired by discarding history
        assert_eq!(fs::read(&config.paths.state_file).unwrap(), b"{\"records\": [");
    }

    #[test]
    fn test_changed_grid_is_refused() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        status(&config).unwrap();

        config.grid.cell_size_degrees = 0.5;
        let err = export(&config, None, false).unwrap_err();
        assert!(matches!(err, TileSweepError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_export_then_merge_with_no_results() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        export(&config, Some(3), false).unwrap();
        assert!(config.paths.output_dir.join("exports").join("export_batch_0001.json").exists());
        assert_eq!(load_state(&config).exported_ids().len(), 3);

        merge_results(&config, None).unwrap();
        let summary = config.paths.output_dir.join("merged_detections_summary.json");
        let doc: serde_json::Value = serde_json::from_slice(&fs::read(summary).unwrap()).unwrap();
        assert_eq!(doc["total_detections"], 0);
    }

    #[test]
    fn test_grid_json_dump() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.grid.ocean_boxes = vec![BBox::new(0.0, 1.0, 1.0, 2.0)];
        let out = dir.path().join("grid.json");

        grid(&config, Some(&out)).unwrap();
        let tiles: Vec<Tile> = serde_json::from_slice(&fs::read(out).unwrap()).unwrap();
        assert_eq!(tiles.iter().map(|t| t.id).collect::<Vec<_>>(), vec![0, 1, 3]);
    }
}
