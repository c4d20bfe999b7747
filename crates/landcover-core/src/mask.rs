//! Geometry → raster masking.
//!
//! A pixel belongs to a geometry iff its centre lies inside it, tested with
//! the even-odd rule on a scanline through the pixel centres. Edges are
//! half-open (a centre on a left or bottom-in-pixel-space edge is inside, on
//! a right or top edge outside), so two cells sharing an edge never claim the
//! same pixel.
use geo::{LineString, MultiPolygon};

use crate::raster::GeoTransform;

/// Flat row-major indices of the pixels whose centres fall inside
/// `geometry`, ascending. `geometry` must be in the raster's CRS.
///
/// Returns None when the transform is singular or a vertex is not finite.
pub fn cell_pixels(
    geometry: &MultiPolygon<f64>,
    transform: &GeoTransform,
    width: usize,
    height: usize,
) -> Option<Vec<usize>> {
    let rings = pixel_space_rings(geometry, transform)?;
    if rings.is_empty() || width == 0 || height == 0 {
        return Some(Vec::new());
    }

    let (min_r, max_r) = rings
        .iter()
        .flatten()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(_, r)| (lo.min(r), hi.max(r)));
    let row_start = first_centre_at_or_after(min_r, height);
    let row_end = first_centre_at_or_after(max_r, height);

    let mut pixels = Vec::new();
    let mut crossings: Vec<f64> = Vec::new();

    for row in row_start..row_end {
        let y = row as f64 + 0.5;
        crossings.clear();
        for ring in &rings {
            for edge in ring.windows(2) {
                let (ax, ay) = edge[0];
                let (bx, by) = edge[1];
                if (ay <= y) != (by <= y) {
                    crossings.push(ax + (y - ay) * (bx - ax) / (by - ay));
                }
            }
        }
        crossings.sort_by(f64::total_cmp);

        for span in crossings.chunks_exact(2) {
            let c0 = first_centre_at_or_after(span[0], width);
            let c1 = first_centre_at_or_after(span[1], width);
            pixels.extend((c0..c1).map(|col| row * width + col));
        }
    }
    Some(pixels)
}

/// Smallest index `i` in `0..=limit` whose centre `i + 0.5` is `>= v`.
#[inline]
fn first_centre_at_or_after(v: f64, limit: usize) -> usize {
    let i = (v - 0.5).ceil();
    if i <= 0.0 {
        0
    } else if i >= limit as f64 {
        limit
    } else {
        i as usize
    }
}

/// Every ring of every polygon as closed (col, row) vertex lists.
fn pixel_space_rings(geometry: &MultiPolygon<f64>, transform: &GeoTransform) -> Option<Vec<Vec<(f64, f64)>>> {
    let to_pixels = |ring: &LineString<f64>| -> Option<Vec<(f64, f64)>> {
        let mut out = Vec::with_capacity(ring.0.len() + 1);
        for c in &ring.0 {
            let (col, row) = transform.invert(c.x, c.y)?;
            if !col.is_finite() || !row.is_finite() {
                return None;
            }
            out.push((col, row));
        }
        if let (Some(&first), Some(&last)) = (out.first(), out.last()) {
            if first != last {
                out.push(first);
            }
        }
        Some(out)
    };

    let mut rings = Vec::new();
    for polygon in &geometry.0 {
        rings.push(to_pixels(polygon.exterior())?);
        for interior in polygon.interiors() {
            rings.push(to_pixels(interior)?);
        }
    }
    Some(rings)
}
