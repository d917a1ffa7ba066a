//! Pipeline configuration.
//!
//! Precedence (highest to lowest):
//! 1. Command-line flags
//! 2. `TILE_SWEEP_*` environment variables
//! 3. Config file (`--config`, else `./tile-sweep.toml`)
//! 4. Defaults

use crate::error::{Result, TileSweepError};
use crate::grid::{BBox, OceanBoxes, TileGrid};
use crate::merge::MergeOptions;
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "tile-sweep.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub grid: GridConfig,
    pub paths: PathsConfig,
    pub export: ExportConfig,
    pub detect: DetectConfig,
    pub merge: MergeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// `[min_lon, min_lat, max_lon, max_lat]`
    pub aoi: BBox,
    pub cell_size_degrees: f64,
    /// Tiles whose centre falls in any of these boxes are ocean.
    pub ocean_boxes: Vec<BBox>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub state_file: PathBuf,
    /// Where exported tile rasters arrive.
    pub tiles_dir: PathBuf,
    /// Staging area for the tiles of the running batch.
    pub work_dir: PathBuf,
    pub results_dir: PathBuf,
    /// Merged output and export manifests.
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub quota: usize,
    /// External export program. Without one, exports are only recorded in
    /// the batch manifest.
    pub program: Option<String>,
    pub args: Vec<String>,
    pub name_prefix: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
    pub program: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub workers: usize,
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub overlap_threshold: f64,
    pub min_confidence: f64,
    pub output_name: String,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            aoi: BBox::new(-17.6, -35.0, 51.4, 37.3),
            cell_size_degrees: 2.0,
            ocean_boxes: Vec::new(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("tile_progress.json"),
            tiles_dir: PathBuf::from("tiles"),
            work_dir: PathBuf::from("work"),
            results_dir: PathBuf::from("results"),
            output_dir: PathBuf::from("output"),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            quota: 50,
            program: None,
            args: Vec::new(),
            name_prefix: "tiles".to_string(),
            timeout_secs: 300,
        }
    }
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["{input}".to_string(), "{output}".to_string()],
            timeout_secs: 1800,
            workers: 1,
            batch_size: 10,
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        let options = MergeOptions::default();
        Self {
            overlap_threshold: options.overlap_threshold,
            min_confidence: options.min_confidence,
            output_name: "merged_detections".to_string(),
        }
    }
}

impl Config {
    /// Load from `path`, or from `./tile-sweep.toml` when present, then apply
    /// environment overrides. An explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.is_file() {
                    Self::load_from_file(default_path)?
                } else {
                    debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                    Self::default()
                }
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading config from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            TileSweepError::InvalidConfiguration(format!(
                "cannot read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// `lookup` is `std::env::var` in production and a map in tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TILE_SWEEP_STATE_FILE") {
            self.paths.state_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("TILE_SWEEP_TILES_DIR") {
            self.paths.tiles_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TILE_SWEEP_WORK_DIR") {
            self.paths.work_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TILE_SWEEP_RESULTS_DIR") {
            self.paths.results_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TILE_SWEEP_OUTPUT_DIR") {
            self.paths.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TILE_SWEEP_BATCH_SIZE") {
            self.detect.batch_size = parse_env("TILE_SWEEP_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("TILE_SWEEP_WORKERS") {
            self.detect.workers = parse_env("TILE_SWEEP_WORKERS", &v)?;
        }
        if let Some(v) = lookup("TILE_SWEEP_EXPORT_QUOTA") {
            self.export.quota = parse_env("TILE_SWEEP_EXPORT_QUOTA", &v)?;
        }
        Ok(())
    }

    /// Reject values that would make any command misbehave, before any work.
    pub fn validate(&self) -> Result<()> {
        TileGrid::new(self.grid.aoi, self.grid.cell_size_degrees)?;
        if self.detect.workers == 0 {
            return Err(invalid("detect.workers must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.merge.overlap_threshold) {
            return Err(invalid(format!(
                "merge.overlap_threshold must be within [0, 1], got {}",
                self.merge.overlap_threshold
            )));
        }
        if !self.merge.min_confidence.is_finite() {
            return Err(invalid("merge.min_confidence must be finite"));
        }
        if self.export.name_prefix.is_empty() || self.export.name_prefix.contains('/') {
            return Err(invalid(format!(
                "export.name_prefix '{}' must be a non-empty file name prefix",
                self.export.name_prefix
            )));
        }
        if self.merge.output_name.is_empty() {
            return Err(invalid("merge.output_name must not be empty"));
        }
        if self.grid.ocean_boxes.iter().any(BBox::is_degenerate) {
            return Err(invalid("grid.ocean_boxes contains a degenerate box"));
        }
        Ok(())
    }

    pub fn grid(&self) -> Result<TileGrid> {
        TileGrid::new(self.grid.aoi, self.grid.cell_size_degrees)
    }

    pub fn land_mask(&self) -> OceanBoxes {
        OceanBoxes::new(self.grid.ocean_boxes.clone())
    }

    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            overlap_threshold: self.merge.overlap_threshold,
            min_confidence: self.merge.min_confidence,
        }
    }

    pub fn detect_timeout(&self) -> Option<Duration> {
        (self.detect.timeout_secs > 0).then(|| Duration::from_secs(self.detect.timeout_secs))
    }

    pub fn export_timeout(&self) -> Option<Duration> {
        (self.export.timeout_secs > 0).then(|| Duration::from_secs(self.export.timeout_secs))
    }
}

fn invalid(msg: impl Into<String>) -> TileSweepError {
    TileSweepError::InvalidConfiguration(msg.into())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(format!("{}={} is not a valid number", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.detect.batch_size, 10);
        assert_eq!(config.export.quota, 50);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tile-sweep.toml");
        std::fs::write(
            &path,
            r#"
[grid]
aoi = [0.0, 0.0, 2.0, 2.0]
cell_size_degrees = 1.0
ocean_boxes = [[-180.0, -90.0, -10.0, 15.0]]

[detect]
program = "detect-cpi"
workers = 4
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.grid.aoi, BBox::new(0.0, 0.0, 2.0, 2.0));
        assert_eq!(config.grid.ocean_boxes.len(), 1);
        assert_eq!(config.detect.program.as_deref(), Some("detect-cpi"));
        assert_eq!(config.detect.workers, 4);
        assert_eq!(config.detect.batch_size, 10);
        assert_eq!(config.merge.output_name, "merged_detections");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Config::load(Some(&dir.path().join("absent.toml"))),
            Err(TileSweepError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TILE_SWEEP_BATCH_SIZE", "25"),
            ("TILE_SWEEP_RESULTS_DIR", "/scratch/results"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.detect.batch_size, 25);
        assert_eq!(config.paths.results_dir, PathBuf::from("/scratch/results"));

        let mut config = Config::default();
        let bad = |k: &str| (k == "TILE_SWEEP_WORKERS").then(|| "many".to_string());
        assert!(config.apply_env_overrides(bad).is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.grid.cell_size_degrees = 0.0;
        assert!(matches!(
            config.validate(),
            Err(TileSweepError::InvalidConfiguration(_))
        ));

        let mut config = Config::default();
        config.merge.overlap_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.detect.workers = 0;
        assert!(config.validate().is_err());
    }
}
