//! Planar polygon helpers for merge-time reprojection and overlap tests.
//!
//! Polygons are open rings of `[x, y]` vertices (the closing vertex is not
//! repeated). Overlap is computed by clipping against the convex hull of the
//! other polygon, which is exact for convex detections.

use crate::grid::BBox;

const METRES_PER_DEGREE: f64 = 111_319.49;
const SQ_METRES_PER_HECTARE: f64 = 10_000.0;

/// Pixel `[x, y]` (origin top-left, y down) in a `width × height` raster
/// covering `bbox` → `[lon, lat]`.
pub fn pixel_to_lonlat(point: [f64; 2], bbox: &BBox, width: u32, height: u32) -> [f64; 2] {
    let lon = bbox.min_lon + point[0] / width as f64 * bbox.width();
    let lat = bbox.max_lat - point[1] / height as f64 * bbox.height();
    [lon, lat]
}

pub fn reproject(ring: &[[f64; 2]], bbox: &BBox, width: u32, height: u32) -> Vec<[f64; 2]> {
    ring.iter()
        .map(|&p| pixel_to_lonlat(p, bbox, width, height))
        .collect()
}

/// Shoelace sum; positive for counter-clockwise rings.
pub fn signed_area(ring: &[[f64; 2]]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..ring.len() {
        let [x1, y1] = ring[i];
        let [x2, y2] = ring[(i + 1) % ring.len()];
        sum += x1 * y2 - x2 * y1;
    }
    sum / 2.0
}

pub fn area(ring: &[[f64; 2]]) -> f64 {
    signed_area(ring).abs()
}

/// Approximate area in hectares of a lon/lat ring (equirectangular at the
/// ring's mean latitude).
pub fn area_hectares(ring: &[[f64; 2]]) -> f64 {
    if ring.is_empty() {
        return 0.0;
    }
    let mean_lat = ring.iter().map(|p| p[1]).sum::<f64>() / ring.len() as f64;
    let scale = METRES_PER_DEGREE * METRES_PER_DEGREE * mean_lat.to_radians().cos();
    area(ring) * scale / SQ_METRES_PER_HECTARE
}

/// `[min, max]` corners of the ring.
pub fn envelope(ring: &[[f64; 2]]) -> ([f64; 2], [f64; 2]) {
    let mut min = [f64::INFINITY, f64::INFINITY];
    let mut max = [f64::NEG_INFINITY, f64::NEG_INFINITY];
    for p in ring {
        min[0] = min[0].min(p[0]);
        min[1] = min[1].min(p[1]);
        max[0] = max[0].max(p[0]);
        max[1] = max[1].max(p[1]);
    }
    (min, max)
}

fn cross(o: [f64; 2], a: [f64; 2], b: [f64; 2]) -> f64 {
    (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
}

/// Counter-clockwise convex hull (monotone chain).
pub fn convex_hull(points: &[[f64; 2]]) -> Vec<[f64; 2]> {
    let mut pts = points.to_vec();
    pts.sort_by(|a, b| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])));
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }

    let mut lower: Vec<[f64; 2]> = Vec::new();
    for &p in &pts {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(p);
    }
    let mut upper: Vec<[f64; 2]> = Vec::new();
    for &p in pts.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

fn line_intersection(p1: [f64; 2], p2: [f64; 2], a: [f64; 2], b: [f64; 2]) -> [f64; 2] {
    let d1 = [p2[0] - p1[0], p2[1] - p1[1]];
    let d2 = [b[0] - a[0], b[1] - a[1]];
    let denom = d1[0] * d2[1] - d1[1] * d2[0];
    if denom.abs() < f64::EPSILON {
        return p2;
    }
    let t = ((a[0] - p1[0]) * d2[1] - (a[1] - p1[1]) * d2[0]) / denom;
    [p1[0] + t * d1[0], p1[1] + t * d1[1]]
}

/// Sutherland–Hodgman: the part of `subject` inside the convex CCW `clip`.
pub fn clip_to_convex(subject: &[[f64; 2]], clip: &[[f64; 2]]) -> Vec<[f64; 2]> {
    let mut output = subject.to_vec();
    for i in 0..clip.len() {
        if output.is_empty() {
            break;
        }
        let a = clip[i];
        let b = clip[(i + 1) % clip.len()];
        let input = std::mem::take(&mut output);
        for j in 0..input.len() {
            let current = input[j];
            let previous = input[(j + input.len() - 1) % input.len()];
            let current_inside = cross(a, b, current) >= 0.0;
            let previous_inside = cross(a, b, previous) >= 0.0;
            if current_inside {
                if !previous_inside {
                    output.push(line_intersection(previous, current, a, b));
                }
                output.push(current);
            } else if previous_inside {
                output.push(line_intersection(previous, current, a, b));
            }
        }
    }
    output
}

/// Intersection area divided by the smaller polygon's area, in `[0, 1]`.
pub fn overlap_fraction(a: &[[f64; 2]], b: &[[f64; 2]]) -> f64 {
    let smaller = area(a).min(area(b));
    if smaller <= 0.0 {
        return 0.0;
    }
    let hull = convex_hull(b);
    if hull.len() < 3 {
        return 0.0;
    }
    let intersection = area(&clip_to_convex(a, &hull));
    (intersection / smaller).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f64, y: f64, size: f64) -> Vec<[f64; 2]> {
        vec![[x, y], [x + size, y], [x + size, y + size], [x, y + size]]
    }

    #[test]
    fn test_pixel_to_lonlat_corners() {
        let bbox = BBox::new(10.0, -5.0, 12.0, -3.0);
        assert_eq!(pixel_to_lonlat([0.0, 0.0], &bbox, 100, 50), [10.0, -3.0]);
        assert_eq!(pixel_to_lonlat([100.0, 50.0], &bbox, 100, 50), [12.0, -5.0]);
        assert_eq!(pixel_to_lonlat([50.0, 25.0], &bbox, 100, 50), [11.0, -4.0]);
    }

    #[test]
    fn test_area_ignores_orientation() {
        let mut ring = square(0.0, 0.0, 2.0);
        assert_eq!(area(&ring), 4.0);
        ring.reverse();
        assert_eq!(area(&ring), 4.0);
        assert!(signed_area(&ring) < 0.0);
    }

    #[test]
    fn test_area_hectares_at_equator() {
        // 0.01° square at the equator is about 1.239 km² = 123.9 ha
        let ha = area_hectares(&square(0.0, 0.0, 0.01));
        assert!((ha - 123.92).abs() < 0.1, "got {}", ha);
    }

    #[test]
    fn test_overlap_of_shifted_squares() {
        let a = square(0.0, 0.0, 2.0);
        let b = square(1.0, 0.0, 2.0);
        assert!((overlap_fraction(&a, &b) - 0.5).abs() < 1e-9);
        assert!((overlap_fraction(&b, &a) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_contained_polygon_overlaps_fully() {
        let outer = square(0.0, 0.0, 4.0);
        let inner = square(1.0, 1.0, 1.0);
        assert!((overlap_fraction(&outer, &inner) - 1.0).abs() < 1e-9);
        assert!((overlap_fraction(&inner, &outer) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_disjoint_and_touching() {
        let a = square(0.0, 0.0, 1.0);
        assert_eq!(overlap_fraction(&a, &square(5.0, 5.0, 1.0)), 0.0);
        assert!(overlap_fraction(&a, &square(1.0, 0.0, 1.0)) < 1e-9);
    }

    #[test]
    fn test_hull_drops_interior_points() {
        let mut pts = square(0.0, 0.0, 2.0);
        pts.push([1.0, 1.0]);
        let hull = convex_hull(&pts);
        assert_eq!(hull.len(), 4);
        assert!(signed_area(&hull) > 0.0);
    }

    #[test]
    fn test_envelope() {
        let (min, max) = envelope(&[[1.0, 5.0], [-2.0, 3.0], [4.0, -1.0]]);
        assert_eq!(min, [-2.0, -1.0]);
        assert_eq!(max, [4.0, 5.0]);
    }
}
