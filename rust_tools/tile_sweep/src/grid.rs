use crate::error::{Result, TileSweepError};
use log::debug;
use serde::{Deserialize, Serialize};

/// Column counts are computed with this slack so that float noise in
/// `width / cell` cannot add a zero-width sliver column.
const CELL_EPSILON: f64 = 1e-9;

/// Geographic bounding box in degrees: (min_lon, min_lat, max_lon, max_lat).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lon + self.max_lon) / 2.0,
            (self.min_lat + self.max_lat) / 2.0,
        )
    }

    /// Degenerate boxes (min >= max on either axis, or NaN) have no area to grid.
    pub fn is_degenerate(&self) -> bool {
        !(self.min_lon < self.max_lon && self.min_lat < self.max_lat)
    }

    pub fn contains_point(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }
}

impl From<[f64; 4]> for BBox {
    fn from(v: [f64; 4]) -> Self {
        BBox::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f64; 4] {
    fn from(b: BBox) -> Self {
        [b.min_lon, b.min_lat, b.max_lon, b.max_lat]
    }
}

/// One grid cell of the area of interest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tile {
    pub id: u32,
    pub bbox: BBox,
    pub is_land: bool,
}

/// Boolean land/ocean contract consulted once per tile at grid generation.
pub trait LandMask {
    fn is_land(&self, bbox: &BBox) -> bool;
}

impl<F> LandMask for F
where
    F: Fn(&BBox) -> bool,
{
    fn is_land(&self, bbox: &BBox) -> bool {
        self(bbox)
    }
}

/// Treats every tile as land.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllLand;

impl LandMask for AllLand {
    fn is_land(&self, _bbox: &BBox) -> bool {
        true
    }
}

/// A tile is ocean when its centre falls inside any of the configured boxes.
#[derive(Debug, Clone, Default)]
pub struct OceanBoxes {
    pub boxes: Vec<BBox>,
}

impl OceanBoxes {
    pub fn new(boxes: Vec<BBox>) -> Self {
        Self { boxes }
    }
}

impl LandMask for OceanBoxes {
    fn is_land(&self, bbox: &BBox) -> bool {
        let (lon, lat) = bbox.center();
        !self.boxes.iter().any(|ocean| ocean.contains_point(lon, lat))
    }
}

/// Row-major partition of an AOI into square cells. Row 0 is the southernmost.
#[derive(Debug, Clone)]
pub struct TileGrid {
    aoi: BBox,
    cell_size: f64,
    pub num_columns: u32,
    pub num_rows: u32,
    pub id_space: u32,
}

impl TileGrid {
    pub fn new(aoi: BBox, cell_size_degrees: f64) -> Result<Self> {
        if !(cell_size_degrees > 0.0) || !cell_size_degrees.is_finite() {
            return Err(TileSweepError::InvalidConfiguration(format!(
                "cell size must be positive, got {}",
                cell_size_degrees
            )));
        }
        if aoi.is_degenerate() {
            return Err(TileSweepError::InvalidConfiguration(format!(
                "area of interest is degenerate: {:?}",
                <[f64; 4]>::from(aoi)
            )));
        }

        let num_columns = cell_count(aoi.width(), cell_size_degrees);
        let num_rows = cell_count(aoi.height(), cell_size_degrees);
        let id_space = num_columns
            .checked_mul(num_rows)
            .ok_or_else(|| {
                TileSweepError::InvalidConfiguration(format!(
                    "grid of {}x{} cells overflows the tile id space",
                    num_columns, num_rows
                ))
            })?;

        debug!(
            "TileGrid: {:?} at {}° → {}x{} cells ({} ids)",
            <[f64; 4]>::from(aoi),
            cell_size_degrees,
            num_columns,
            num_rows,
            id_space
        );

        Ok(Self {
            aoi,
            cell_size: cell_size_degrees,
            num_columns,
            num_rows,
            id_space,
        })
    }

    pub fn aoi(&self) -> BBox {
        self.aoi
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Bounding box of cell `id`, clipped to the AOI on the last row/column.
    pub fn tile_bbox(&self, id: u32) -> Option<BBox> {
        if id >= self.id_space {
            return None;
        }
        let row = id / self.num_columns;
        let col = id % self.num_columns;

        let min_lon = self.aoi.min_lon + col as f64 * self.cell_size;
        let min_lat = self.aoi.min_lat + row as f64 * self.cell_size;
        let max_lon = (min_lon + self.cell_size).min(self.aoi.max_lon);
        let max_lat = (min_lat + self.cell_size).min(self.aoi.max_lat);

        Some(BBox::new(min_lon, min_lat, max_lon, max_lat))
    }

    /// Every cell in id order, with the mask applied but nothing filtered.
    pub fn cells<'a, M: LandMask + ?Sized>(&'a self, mask: &'a M) -> impl Iterator<Item = Tile> + 'a {
        (0..self.id_space).filter_map(move |id| {
            self.tile_bbox(id).map(|bbox| Tile {
                id,
                bbox,
                is_land: mask.is_land(&bbox),
            })
        })
    }

    /// Land tiles in ascending id order. Ocean tiles keep their ids reserved.
    pub fn land_tiles<M: LandMask + ?Sized>(&self, mask: &M) -> Vec<Tile> {
        self.cells(mask).filter(|t| t.is_land).collect()
    }

    pub fn summary<M: LandMask + ?Sized>(&self, mask: &M) -> GridSummary {
        let land: Vec<u32> = self.cells(mask).filter(|t| t.is_land).map(|t| t.id).collect();
        GridSummary {
            columns: self.num_columns,
            rows: self.num_rows,
            id_space: self.id_space,
            land_tiles: land.len() as u32,
            ocean_tiles: self.id_space - land.len() as u32,
            min_id: land.first().copied(),
            max_id: land.last().copied(),
        }
    }
}

fn cell_count(extent: f64, cell: f64) -> u32 {
    ((extent / cell) - CELL_EPSILON).ceil().max(1.0) as u32
}

/// Partition `aoi` into `cell_size_degrees` cells and keep the land tiles.
pub fn generate<M: LandMask + ?Sized>(aoi: BBox, cell_size_degrees: f64, mask: &M) -> Result<Vec<Tile>> {
    let grid = TileGrid::new(aoi, cell_size_degrees)?;
    Ok(grid.land_tiles(mask))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridSummary {
    pub columns: u32,
    pub rows: u32,
    pub id_space: u32,
    pub land_tiles: u32,
    pub ocean_tiles: u32,
    pub min_id: Option<u32>,
    pub max_id: Option<u32>,
}
