//! Merge every `done` tile's detections into one global collection.
//!
//! The merge is recomputed from scratch on every call:
//! 1. read the result file of each `done` tile (unreadable ones are skipped and counted),
//! 2. drop detections below `min_confidence`,
//! 3. reproject pixel polygons onto the tile's bbox,
//! 4. greedily suppress cross-tile duplicates, visiting detections by
//!    descending confidence then ascending source tile,
//! 5. number survivors in (source tile, detection index) order.
//!
//! Identical inputs therefore always produce identical ids and geometry.

use crate::atomic::write_json_atomic;
use crate::error::Result;
use crate::geometry::{area_hectares, envelope, overlap_fraction, reproject};
use crate::grid::BBox;
use crate::progress::Snapshot;
use crate::results::ResultStore;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rstar::{RTree, RTreeObject, AABB};
use serde::Serialize;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy)]
pub struct MergeOptions {
    /// Cross-tile pairs overlapping by more than this fraction of the smaller
    /// polygon are treated as the same object.
    pub overlap_threshold: f64,
    pub min_confidence: f64,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            overlap_threshold: 0.1,
            min_confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedDetection {
    pub global_id: u64,
    pub source_tile_id: u32,
    pub confidence: f64,
    pub class: String,
    pub area_ha: f64,
    pub polygon: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeSummary {
    pub total_detections: usize,
    pub duplicates_removed: usize,
    pub below_threshold: usize,
    pub tiles_contributing: usize,
    pub tiles_skipped: usize,
    pub skipped_tile_ids: Vec<u32>,
    pub total_area_ha: f64,
    pub total_area_km2: f64,
    pub avg_area_ha: Option<f64>,
    pub avg_confidence: Option<f64>,
    pub extent: Option<BBox>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedCollection {
    pub detections: Vec<MergedDetection>,
    pub summary: MergeSummary,
}

struct Candidate {
    source_tile_id: u32,
    index: usize,
    confidence: f64,
    class: String,
    polygon: Vec<[f64; 2]>,
}

struct KeptEnvelope {
    slot: usize,
    source_tile_id: u32,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for KeptEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

fn ring_envelope(ring: &[[f64; 2]]) -> AABB<[f64; 2]> {
    let (min, max) = envelope(ring);
    AABB::from_corners(min, max)
}

fn visit_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then(a.source_tile_id.cmp(&b.source_tile_id))
        .then(a.index.cmp(&b.index))
}

pub fn merge(snapshot: &Snapshot, results: &ResultStore, options: &MergeOptions) -> Result<MergedCollection> {
    let done = snapshot.processed();
    info!("Merging results from {} done tile(s)", done.len());

    let mut candidates = Vec::new();
    let mut skipped = Vec::new();
    let mut contributing = 0usize;
    let mut below_threshold = 0usize;

    for tile_id in done {
        let result = match results.read(tile_id) {
            Ok(result) if result.tile_id == tile_id => result,
            Ok(result) => {
                warn!(
                    "Result file for tile {} carries tile id {}, skipping",
                    tile_id, result.tile_id
                );
                skipped.push(tile_id);
                continue;
            }
            Err(e) => {
                warn!(
                    "Result for tile {} missing or unreadable ({}), skipping",
                    tile_id, e
                );
                skipped.push(tile_id);
                continue;
            }
        };
        contributing += 1;
        debug!(
            "Tile {}: {} detection(s)",
            tile_id,
            result.detections.len()
        );

        for (index, detection) in result.detections.into_iter().enumerate() {
            if detection.confidence < options.min_confidence {
                below_threshold += 1;
                continue;
            }
            candidates.push(Candidate {
                source_tile_id: tile_id,
                index,
                confidence: detection.confidence,
                class: detection.class,
                polygon: reproject(&detection.polygon, &result.bbox, result.width, result.height),
            });
        }
    }

    let total_candidates = candidates.len();
    let survivors = suppress_duplicates(candidates, options.overlap_threshold);
    let duplicates_removed = total_candidates - survivors.len();

    let detections: Vec<MergedDetection> = survivors
        .into_iter()
        .enumerate()
        .map(|(i, c)| MergedDetection {
            global_id: i as u64 + 1,
            source_tile_id: c.source_tile_id,
            confidence: c.confidence,
            area_ha: area_hectares(&c.polygon),
            class: c.class,
            polygon: c.polygon,
        })
        .collect();

    let summary = summarize(
        &detections,
        duplicates_removed,
        below_threshold,
        contributing,
        skipped,
    );
    info!(
        "Merged {} detection(s) from {} tile(s); {} duplicate(s) removed, {} tile(s) skipped",
        summary.total_detections,
        summary.tiles_contributing,
        summary.duplicates_removed,
        summary.tiles_skipped
    );

    Ok(MergedCollection {
        detections,
        summary,
    })
}

/// Greedy cross-tile suppression. Returns survivors in (tile, index) order.
fn suppress_duplicates(mut candidates: Vec<Candidate>, threshold: f64) -> Vec<Candidate> {
    candidates.sort_by(visit_order);

    let mut kept: Vec<Candidate> = Vec::new();
    let mut tree: RTree<KeptEnvelope> = RTree::new();
    for candidate in candidates {
        let env = ring_envelope(&candidate.polygon);
        let duplicate = tree
            .locate_in_envelope_intersecting(&env)
            .filter(|k| k.source_tile_id != candidate.source_tile_id)
            .any(|k| overlap_fraction(&candidate.polygon, &kept[k.slot].polygon) > threshold);
        if duplicate {
            debug!(
                "Dropping tile {} detection {} (confidence {:.3}) as duplicate",
                candidate.source_tile_id, candidate.index, candidate.confidence
            );
            continue;
        }
        tree.insert(KeptEnvelope {
            slot: kept.len(),
            source_tile_id: candidate.source_tile_id,
            env,
        });
        kept.push(candidate);
    }

    kept.sort_by(|a, b| {
        a.source_tile_id
            .cmp(&b.source_tile_id)
            .then(a.index.cmp(&b.index))
    });
    kept
}

fn summarize(
    detections: &[MergedDetection],
    duplicates_removed: usize,
    below_threshold: usize,
    tiles_contributing: usize,
    skipped: Vec<u32>,
) -> MergeSummary {
    let total_area_ha: f64 = detections.iter().map(|d| d.area_ha).sum();
    let (avg_area_ha, avg_confidence) = if detections.is_empty() {
        (None, None)
    } else {
        let n = detections.len() as f64;
        (
            Some(total_area_ha / n),
            Some(detections.iter().map(|d| d.confidence).sum::<f64>() / n),
        )
    };
    let extent = detections
        .iter()
        .map(|d| envelope(&d.polygon))
        .reduce(|(amin, amax), (bmin, bmax)| {
            (
                [amin[0].min(bmin[0]), amin[1].min(bmin[1])],
                [amax[0].max(bmax[0]), amax[1].max(bmax[1])],
            )
        })
        .map(|(min, max)| BBox::new(min[0], min[1], max[0], max[1]));

    MergeSummary {
        total_detections: detections.len(),
        duplicates_removed,
        below_threshold,
        tiles_contributing,
        tiles_skipped: skipped.len(),
        skipped_tile_ids: skipped,
        total_area_ha,
        total_area_km2: total_area_ha / 100.0,
        avg_area_ha,
        avg_confidence,
        extent,
        generated_at: Utc::now(),
    }
}

#[derive(Serialize)]
struct FeatureCollection<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    features: Vec<Feature<'a>>,
}

#[derive(Serialize)]
struct Feature<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    id: u64,
    geometry: Polygon,
    properties: FeatureProperties<'a>,
}

#[derive(Serialize)]
struct Polygon {
    #[serde(rename = "type")]
    kind: &'static str,
    coordinates: Vec<Vec<[f64; 2]>>,
}

#[derive(Serialize)]
struct FeatureProperties<'a> {
    global_id: u64,
    source_tile_id: u32,
    confidence: f64,
    class: &'a str,
    area_ha: f64,
}

fn closed_ring(ring: &[[f64; 2]]) -> Vec<[f64; 2]> {
    let mut closed = ring.to_vec();
    if let (Some(first), Some(last)) = (ring.first(), ring.last()) {
        if first != last {
            closed.push(*first);
        }
    }
    closed
}

impl MergedCollection {
    fn to_feature_collection(&self) -> FeatureCollection<'_> {
        FeatureCollection {
            kind: "FeatureCollection",
            features: self
                .detections
                .iter()
                .map(|d| Feature {
                    kind: "Feature",
                    id: d.global_id,
                    geometry: Polygon {
                        kind: "Polygon",
                        coordinates: vec![closed_ring(&d.polygon)],
                    },
                    properties: FeatureProperties {
                        global_id: d.global_id,
                        source_tile_id: d.source_tile_id,
                        confidence: d.confidence,
                        class: &d.class,
                        area_ha: d.area_ha,
                    },
                })
                .collect(),
        }
    }

    /// Write `<name>.geojson` and `<name>_summary.json` into `dir`.
    pub fn write(&self, dir: &Path, name: &str) -> Result<(PathBuf, PathBuf)> {
        let geojson_path = dir.join(format!("{}.geojson", name));
        let summary_path = dir.join(format!("{}_summary.json", name));
        write_json_atomic(&geojson_path, &self.to_feature_collection())?;
        write_json_atomic(&summary_path, &self.summary)?;
        Ok((geojson_path, summary_path))
    }
}
