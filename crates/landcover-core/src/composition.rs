//! Per-cell class composition of a single snapshot, and the change in
//! composition between two snapshots.
//!
//! The share of class `c` in a cell is `100 · count(c) / Σ count(k)` over the
//! requested classes `k`; pixels holding any other code (nodata included)
//! are ignored.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::crs::CrsTransform;
use crate::error::{AnalysisError, Result};
use crate::grid::{Grid, GridCell};
use crate::mask::cell_pixels;
use crate::raster::CategoricalRaster;
use crate::transitions::CellFailurePolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassShare {
    pub grid_id: u32,
    pub class: i32,
    pub count: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassChange {
    pub grid_id: u32,
    pub class: i32,
    pub percent_before: f64,
    pub percent_after: f64,
    /// `percent_after − percent_before`.
    pub change_pct: f64,
}

/// One [`ClassShare`] per (cell, class), cells in grid order and classes in
/// the order given. Cells with no pixel of any listed class get 0 % for all.
///
/// A cell that cannot be projected or mapped onto the raster follows
/// `on_failure` the same way the transition engine does: `ZeroRecord`
/// emits zero shares for it, `Fatal` aborts.
pub fn class_composition(
    grid: &Grid,
    raster: &CategoricalRaster,
    classes: &[i32],
    on_failure: CellFailurePolicy,
) -> Result<Vec<ClassShare>> {
    raster.validate()?;
    let to_raster = CrsTransform::new(grid.crs, raster.crs)?;
    let mut shares = Vec::with_capacity(grid.len() * classes.len());

    for cell in grid.iter() {
        let counts = match count_classes(cell, &to_raster, raster, classes) {
            Ok(counts) => counts,
            Err(e) if e.is_recoverable() && on_failure == CellFailurePolicy::ZeroRecord => {
                warn!(grid_id = cell.grid_id, error = %e, "composition failed; substituting zero shares");
                vec![0; classes.len()]
            }
            Err(e) => return Err(e),
        };
        let total: u64 = counts.iter().sum();

        for (k, &class) in classes.iter().enumerate() {
            let percent = if total > 0 { 100.0 * counts[k] as f64 / total as f64 } else { 0.0 };
            shares.push(ClassShare { grid_id: cell.grid_id, class, count: counts[k], percent });
        }
    }
    Ok(shares)
}

/// Pixel count per listed class inside one cell.
fn count_classes(
    cell: &GridCell,
    to_raster: &CrsTransform,
    raster: &CategoricalRaster,
    classes: &[i32],
) -> Result<Vec<u64>> {
    let cell_failed = |reason: String| AnalysisError::CellProcessing { grid_id: cell.grid_id, reason };
    let geometry = to_raster
        .transform_geometry(&cell.geometry)
        .map_err(|e| cell_failed(e.to_string()))?;
    let pixels = cell_pixels(&geometry, &raster.transform, raster.width, raster.height)
        .ok_or_else(|| cell_failed("cell geometry cannot be mapped onto the raster grid".to_string()))?;

    let mut counts = vec![0u64; classes.len()];
    for &i in &pixels {
        if let Some(k) = classes.iter().position(|&c| c == raster.data[i]) {
            counts[k] += 1;
        }
    }
    Ok(counts)
}

/// Outer-join two compositions on (grid_id, class); a side missing a pair
/// counts as 0 %. Output is sorted by grid_id, then class.
pub fn compare_compositions(before: &[ClassShare], after: &[ClassShare]) -> Vec<ClassChange> {
    let mut joined: BTreeMap<(u32, i32), (f64, f64)> = BTreeMap::new();
    for s in before {
        joined.entry((s.grid_id, s.class)).or_default().0 = s.percent;
    }
    for s in after {
        joined.entry((s.grid_id, s.class)).or_default().1 = s.percent;
    }
    joined
        .into_iter()
        .map(|((grid_id, class), (b, a))| ClassChange {
            grid_id,
            class,
            percent_before: b,
            percent_after: a,
            change_pct: a - b,
        })
        .collect()
}
