//! Per-cell categorical transition counts between two aligned rasters.
//!
//! For every grid cell the engine selects the pixels whose centres fall in
//! the cell, keeps those that are valid in both snapshots, and evaluates each
//! [`TransitionRule`] over the valid pixels:
//!
//!   n_origin      = #{ before ∈ O }
//!   n_match       = #{ before ∈ O ∧ after ∉ X }
//!   pct_of_cell   = 100 · n_match / n_valid        (0 when n_valid = 0)
//!   pct_of_origin = 100 · n_match / n_origin       (0 when n_origin = 0)
//!
//! Records come out in grid order (ascending `grid_id`) whether or not the
//! `threading` feature is enabled.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use geo::MultiPolygon;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[cfg(feature = "threading")]
use rayon::prelude::*;

use crate::crs::CrsTransform;
use crate::error::{AnalysisError, Result};
use crate::grid::Grid;
use crate::mask::cell_pixels;
use crate::raster::CategoricalRaster;
use crate::rules::{validate_rules, TransitionRule};

// ── Options ───────────────────────────────────────────────────────────────────

/// What to do with a cell whose geometry is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyCellPolicy {
    /// Emit no record for the cell.
    #[default]
    Skip,
    /// Emit an all-zero record with status `EmptyGeometry`.
    ZeroRecord,
}

/// What to do when a single cell cannot be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellFailurePolicy {
    /// Abort the run with the cell's error.
    Fatal,
    /// Log a warning and emit an all-zero record with status `Failed`.
    #[default]
    ZeroRecord,
}

/// Cooperative cancellation, checked before each cell.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Sentinels that invalidate a pixel in either snapshot, in addition to
    /// each raster's own `nodata`.
    pub nodata_values: Vec<i32>,
    pub empty_cell_policy: EmptyCellPolicy,
    pub cell_failure_policy: CellFailurePolicy,
    pub cancel: Option<CancelFlag>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            nodata_values: vec![-9999],
            empty_cell_policy: EmptyCellPolicy::default(),
            cell_failure_policy: CellFailurePolicy::default(),
            cancel: None,
        }
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    Ok,
    /// Every pixel in the cell was nodata or outside the raster.
    NoValidPixels,
    /// The cell geometry was empty (only with `EmptyCellPolicy::ZeroRecord`).
    EmptyGeometry,
    /// Processing failed and a zero record was substituted.
    Failed,
}

/// Counts for one rule within one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCounts {
    pub rule: String,
    pub n_origin: u64,
    pub n_match: u64,
    pub pct_of_cell: f64,
    pub pct_of_origin: f64,
}

impl RuleCounts {
    fn zero(rule: &TransitionRule) -> Self {
        Self { rule: rule.name.clone(), n_origin: 0, n_match: 0, pct_of_cell: 0.0, pct_of_origin: 0.0 }
    }
}

/// One row of output: a cell and its counts for every rule, in rule order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub grid_id: u32,
    /// Pixels whose centres fall inside the cell, valid or not.
    pub n_pixels: u64,
    pub n_valid: u64,
    pub status: CellStatus,
    pub rules: Vec<RuleCounts>,
}

impl TransitionRecord {
    pub fn zero(grid_id: u32, rules: &[TransitionRule], status: CellStatus) -> Self {
        Self {
            grid_id,
            n_pixels: 0,
            n_valid: 0,
            status,
            rules: rules.iter().map(RuleCounts::zero).collect(),
        }
    }

    /// Counts for the rule called `name`.
    pub fn rule(&self, name: &str) -> Option<&RuleCounts> {
        self.rules.iter().find(|r| r.rule == name)
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// How the per-cell map is driven. Both modes yield records in job order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Execution {
    #[cfg_attr(feature = "threading", allow(dead_code))]
    Sequential,
    #[cfg(feature = "threading")]
    Parallel,
}

impl Execution {
    fn preferred() -> Self {
        #[cfg(feature = "threading")]
        {
            Execution::Parallel
        }
        #[cfg(not(feature = "threading"))]
        {
            Execution::Sequential
        }
    }
}

struct CellJob<'a> {
    grid_id: u32,
    /// Cell geometry in the raster CRS, or the error that prevented it.
    geometry: Result<Cow<'a, MultiPolygon<f64>>>,
}

/// Compute one [`TransitionRecord`] per grid cell.
///
/// Fails before producing any record when the rules are malformed, a raster
/// buffer does not match its shape, or the rasters disagree on CRS,
/// transform or shape. Cell-level failures follow
/// `options.cell_failure_policy`; a cell is never silently dropped.
pub fn compute_transitions(
    grid: &Grid,
    before: &CategoricalRaster,
    after: &CategoricalRaster,
    rules: &[TransitionRule],
    options: &EngineOptions,
) -> Result<Vec<TransitionRecord>> {
    compute_with(grid, before, after, rules, options, Execution::preferred())
}

fn compute_with(
    grid: &Grid,
    before: &CategoricalRaster,
    after: &CategoricalRaster,
    rules: &[TransitionRule],
    options: &EngineOptions,
    execution: Execution,
) -> Result<Vec<TransitionRecord>> {
    validate_rules(rules)?;
    before.check_aligned(after)?;

    let mut nodata: Vec<i32> = options
        .nodata_values
        .iter()
        .copied()
        .chain(before.nodata)
        .chain(after.nodata)
        .collect();
    nodata.sort_unstable();
    nodata.dedup();

    let to_raster = CrsTransform::new(grid.crs, before.crs)?;
    debug!(cells = grid.len(), grid_crs = %grid.crs, raster_crs = %before.crs, "preparing cells");

    let mut jobs = Vec::with_capacity(grid.len());
    for cell in grid.iter() {
        if cell.is_empty() {
            match options.empty_cell_policy {
                EmptyCellPolicy::Skip => {
                    debug!(grid_id = cell.grid_id, "skipping empty cell");
                    continue;
                }
                EmptyCellPolicy::ZeroRecord => {
                    jobs.push(CellJob { grid_id: cell.grid_id, geometry: Ok(Cow::Owned(MultiPolygon::new(vec![]))) });
                    continue;
                }
            }
        }
        let geometry = if grid.crs == before.crs {
            Ok(Cow::Borrowed(&cell.geometry))
        } else {
            to_raster
                .transform_geometry(&cell.geometry)
                .map(Cow::Owned)
                .map_err(|e| AnalysisError::CellProcessing { grid_id: cell.grid_id, reason: e.to_string() })
        };
        jobs.push(CellJob { grid_id: cell.grid_id, geometry });
    }

    let completed = AtomicUsize::new(0);
    let run = |job: &CellJob<'_>| -> Result<TransitionRecord> {
        if let Some(flag) = &options.cancel {
            if flag.is_cancelled() {
                return Err(AnalysisError::Cancelled { completed: completed.load(Ordering::Relaxed) });
            }
        }
        let outcome = job
            .geometry
            .as_ref()
            .map_err(Clone::clone)
            .and_then(|g| process_cell(job.grid_id, g, before, after, rules, &nodata));
        let record = match outcome {
            Ok(record) => record,
            Err(e) if e.is_recoverable() && options.cell_failure_policy == CellFailurePolicy::ZeroRecord => {
                warn!(grid_id = job.grid_id, error = %e, "cell failed; substituting zero record");
                TransitionRecord::zero(job.grid_id, rules, CellStatus::Failed)
            }
            Err(e) => return Err(e),
        };
        completed.fetch_add(1, Ordering::Relaxed);
        Ok(record)
    };

    let records = match execution {
        Execution::Sequential => jobs.iter().map(&run).collect::<Result<Vec<_>>>()?,
        #[cfg(feature = "threading")]
        Execution::Parallel => jobs.par_iter().map(&run).collect::<Result<Vec<_>>>()?,
    };

    info!(
        records = records.len(),
        failed = records.iter().filter(|r| r.status == CellStatus::Failed).count(),
        "transitions computed"
    );
    Ok(records)
}

/// Count one cell. `geometry` is in the raster CRS.
fn process_cell(
    grid_id: u32,
    geometry: &MultiPolygon<f64>,
    before: &CategoricalRaster,
    after: &CategoricalRaster,
    rules: &[TransitionRule],
    nodata: &[i32],
) -> Result<TransitionRecord> {
    if geometry.0.is_empty() {
        return Ok(TransitionRecord::zero(grid_id, rules, CellStatus::EmptyGeometry));
    }

    let pixels = cell_pixels(geometry, &before.transform, before.width, before.height).ok_or_else(|| {
        AnalysisError::CellProcessing {
            grid_id,
            reason: "cell geometry cannot be mapped onto the raster grid".to_string(),
        }
    })?;

    let is_valid = |v: i32| v >= 0 && !nodata.contains(&v);
    let mut n_valid = 0u64;
    let mut n_origin = vec![0u64; rules.len()];
    let mut n_match = vec![0u64; rules.len()];

    for &i in &pixels {
        let (b, a) = (before.data[i], after.data[i]);
        if !is_valid(b) || !is_valid(a) {
            continue;
        }
        n_valid += 1;
        for (k, rule) in rules.iter().enumerate() {
            if rule.is_origin(b) {
                n_origin[k] += 1;
            }
            if rule.matches(b, a) {
                n_match[k] += 1;
            }
        }
    }

    let n_pixels = pixels.len() as u64;
    if n_valid == 0 {
        let mut record = TransitionRecord::zero(grid_id, rules, CellStatus::NoValidPixels);
        record.n_pixels = n_pixels;
        return Ok(record);
    }

    let pct = |num: u64, den: u64| if den == 0 { 0.0 } else { 100.0 * num as f64 / den as f64 };
    let counts = rules
        .iter()
        .enumerate()
        .map(|(k, rule)| RuleCounts {
            rule: rule.name.clone(),
            n_origin: n_origin[k],
            n_match: n_match[k],
            pct_of_cell: pct(n_match[k], n_valid),
            pct_of_origin: pct(n_match[k], n_origin[k]),
        })
        .collect();

    Ok(TransitionRecord { grid_id, n_pixels, n_valid, status: CellStatus::Ok, rules: counts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::Crs;
    use crate::grid::GridCell;
    use crate::raster::GeoTransform;
    use approx::assert_abs_diff_eq;
    use geo::{Coord, Rect};

    const ND: i32 = -9999;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![Rect::new(Coord { x: x0, y: y0 }, Coord { x: x1, y: y1 }).to_polygon()])
    }

    /// Raster of `w`×`h` 10 m pixels with its top-left corner at (0, 10·h).
    fn raster(data: Vec<i32>, w: usize, h: usize) -> CategoricalRaster {
        let t = GeoTransform::north_up(0.0, 10.0 * h as f64, 10.0, 10.0);
        CategoricalRaster::new(data, w, h, Crs::WebMercator, t, None).unwrap()
    }

    fn single_cell_grid(w: usize, h: usize) -> Grid {
        let cell = GridCell::new(1, rect(0.0, 0.0, 10.0 * w as f64, 10.0 * h as f64));
        Grid::from_cells(Crs::WebMercator, vec![cell]).unwrap()
    }

    fn one_to_other() -> Vec<TransitionRule> {
        vec![TransitionRule::new("one_to_other", [1], [1])]
    }

    #[test]
    fn two_by_two_scenario() {
        let before = raster(vec![1, 1, 5, 2], 2, 2);
        let after = raster(vec![2, 1, 5, 2], 2, 2);
        let records = compute_transitions(
            &single_cell_grid(2, 2),
            &before,
            &after,
            &one_to_other(),
            &EngineOptions::default(),
        )
        .unwrap();

        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.status, CellStatus::Ok);
        assert_eq!(r.n_pixels, 4);
        assert_eq!(r.n_valid, 4);
        let c = &r.rules[0];
        assert_eq!(c.n_origin, 2);
        assert_eq!(c.n_match, 1);
        assert_abs_diff_eq!(c.pct_of_cell, 25.0);
        assert_abs_diff_eq!(c.pct_of_origin, 50.0);
    }

    #[test]
    fn all_nodata_cell_yields_zero_record() {
        let before = raster(vec![ND; 4], 2, 2);
        let after = raster(vec![1, 2, 3, 4], 2, 2);
        let records = compute_transitions(
            &single_cell_grid(2, 2),
            &before,
            &after,
            &TransitionRule::builtin(),
            &EngineOptions::default(),
        )
        .unwrap();

        let r = &records[0];
        assert_eq!(r.status, CellStatus::NoValidPixels);
        assert_eq!(r.n_valid, 0);
        for c in &r.rules {
            assert_eq!((c.n_origin, c.n_match), (0, 0));
            assert_eq!(c.pct_of_cell, 0.0);
            assert_eq!(c.pct_of_origin, 0.0);
        }
    }

    #[test]
    fn negative_codes_and_raster_nodata_are_invalid() {
        let mut before = raster(vec![1, 1, 1, 1], 2, 2);
        before.nodata = Some(255);
        let after = raster(vec![-1, 255, 2, 7], 2, 2);
        let records = compute_transitions(
            &single_cell_grid(2, 2),
            &before,
            &after,
            &one_to_other(),
            &EngineOptions { nodata_values: vec![7], ..EngineOptions::default() },
        )
        .unwrap();
        // -1 (negative), 255 (before's sentinel), 7 (configured) are excluded.
        assert_eq!(records[0].n_valid, 1);
        assert_eq!(records[0].rules[0].n_match, 1);
    }

    #[test]
    fn no_origin_pixels_gives_zero_origin_pct() {
        let before = raster(vec![2, 2, 3, 3], 2, 2);
        let after = raster(vec![4, 4, 4, 4], 2, 2);
        let records = compute_transitions(
            &single_cell_grid(2, 2),
            &before,
            &after,
            &one_to_other(),
            &EngineOptions::default(),
        )
        .unwrap();
        let c = &records[0].rules[0];
        assert_eq!(c.n_origin, 0);
        assert_eq!(c.pct_of_origin, 0.0);
        assert!(!c.pct_of_origin.is_nan());
    }

    #[test]
    fn mismatched_shapes_fail_before_any_record() {
        let before = raster(vec![1; 4], 2, 2);
        let after = raster(vec![1; 6], 3, 2);
        let err = compute_transitions(
            &single_cell_grid(2, 2),
            &before,
            &after,
            &one_to_other(),
            &EngineOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, AnalysisError::RasterMisalignment { .. }));
    }

    #[test]
    fn short_raster_buffer_is_an_error_not_a_panic() {
        let good = raster(vec![1; 4], 2, 2);
        let short = CategoricalRaster { data: vec![1, 1], ..good.clone() };
        let grid = single_cell_grid(2, 2);
        let opts = EngineOptions::default();

        let err = compute_transitions(&grid, &good, &short, &one_to_other(), &opts).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidParameter { .. }));
        let err = compute_transitions(&grid, &short, &good, &one_to_other(), &opts).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidParameter { .. }));
    }

    #[test]
    fn malformed_rule_is_rejected() {
        let r = raster(vec![1; 4], 2, 2);
        let rules = vec![TransitionRule::new("bad", [], [1])];
        let err = compute_transitions(&single_cell_grid(2, 2), &r, &r, &rules, &EngineOptions::default())
            .unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidParameter { .. }));
    }

    #[test]
    fn records_follow_grid_order() {
        // 4×1 raster, one cell per pixel column.
        let before = raster(vec![1, 1, 1, 1], 4, 1);
        let after = raster(vec![2, 1, 2, 1], 4, 1);
        let cells = (0..4)
            .map(|i| {
                let x = 10.0 * i as f64;
                GridCell::new(i + 1, rect(x, 0.0, x + 10.0, 10.0))
            })
            .collect();
        let grid = Grid::from_cells(Crs::WebMercator, cells).unwrap();
        let records =
            compute_transitions(&grid, &before, &after, &one_to_other(), &EngineOptions::default()).unwrap();
        let ids: Vec<u32> = records.iter().map(|r| r.grid_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        let matches: Vec<u64> = records.iter().map(|r| r.rules[0].n_match).collect();
        assert_eq!(matches, vec![1, 0, 1, 0]);
    }

    #[test]
    fn empty_cells_follow_policy() {
        let r = raster(vec![1; 4], 2, 2);
        let cells = vec![
            GridCell::new(1, rect(0.0, 0.0, 20.0, 20.0)),
            GridCell::new(2, MultiPolygon::new(vec![])),
        ];
        let grid = Grid::from_cells(Crs::WebMercator, cells).unwrap();

        let skipped = compute_transitions(&grid, &r, &r, &one_to_other(), &EngineOptions::default()).unwrap();
        assert_eq!(skipped.len(), 1);

        let opts = EngineOptions { empty_cell_policy: EmptyCellPolicy::ZeroRecord, ..EngineOptions::default() };
        let kept = compute_transitions(&grid, &r, &r, &one_to_other(), &opts).unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[1].status, CellStatus::EmptyGeometry);
        assert_eq!(kept[1].n_valid, 0);
    }

    #[test]
    fn failed_cell_follows_failure_policy() {
        // A cell in lon/lat at the pole cannot be projected to Web Mercator.
        let r = raster(vec![1; 4], 2, 2);
        let cells = vec![
            GridCell::new(1, rect(0.0, 0.0, 0.0001, 0.0001)),
            GridCell::new(2, rect(0.0, 89.0, 1.0, 90.0)),
        ];
        let grid = Grid::from_cells(Crs::Wgs84, cells).unwrap();

        let records = compute_transitions(&grid, &r, &r, &one_to_other(), &EngineOptions::default()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, CellStatus::Ok);
        assert_eq!(records[1].status, CellStatus::Failed);
        assert_eq!(records[1].rules[0].n_match, 0);

        let fatal = EngineOptions { cell_failure_policy: CellFailurePolicy::Fatal, ..EngineOptions::default() };
        let err = compute_transitions(&grid, &r, &r, &one_to_other(), &fatal).unwrap_err();
        assert!(matches!(err, AnalysisError::CellProcessing { grid_id: 2, .. }));
    }

    #[test]
    fn sequential_and_preferred_execution_agree() {
        use crate::grid::{build_grid, Aoi, GridOptions, MetricProjection};
        use crate::summary::summarize;
        use geo::polygon;

        // 20×20 pixels of mixed codes, nodata and negatives included.
        let before: Vec<i32> = (0..400).map(|i| ((i * 7 + i / 20) % 11) - 1).collect();
        let after: Vec<i32> = (0..400).map(|i| ((i * 3 + i / 7) % 10) - 1).collect();
        let mut before = raster(before, 20, 20);
        before.data[57] = ND;
        let after = raster(after, 20, 20);

        let aoi = Aoi::from_polygon(
            polygon![(x: 5.0, y: 3.0), (x: 196.0, y: 12.0), (x: 180.0, y: 197.0), (x: 14.0, y: 170.0)],
            Crs::WebMercator,
        )
        .unwrap();
        let options = GridOptions { metric_projection: MetricProjection::WebMercator, output_crs: Crs::WebMercator };
        let grid = build_grid(&aoi, 30.0, &options).unwrap();
        assert!(grid.len() > 20);

        let rules = TransitionRule::builtin();
        let opts = EngineOptions::default();
        let sequential = compute_with(&grid, &before, &after, &rules, &opts, Execution::Sequential).unwrap();
        let preferred = compute_transitions(&grid, &before, &after, &rules, &opts).unwrap();

        #[cfg(feature = "threading")]
        assert_eq!(Execution::preferred(), Execution::Parallel);
        assert_eq!(sequential, preferred);
        assert_eq!(summarize(&sequential, &rules), summarize(&preferred, &rules));
        assert!(sequential.iter().any(|r| r.rules.iter().any(|c| c.n_match > 0)));
    }

    #[test]
    fn cancelled_run_returns_no_records() {
        let r = raster(vec![1; 4], 2, 2);
        let flag = CancelFlag::new();
        flag.cancel();
        let opts = EngineOptions { cancel: Some(flag), ..EngineOptions::default() };
        let err = compute_transitions(&single_cell_grid(2, 2), &r, &r, &one_to_other(), &opts).unwrap_err();
        assert!(matches!(err, AnalysisError::Cancelled { .. }));
    }

    #[test]
    fn lookup_rule_by_name() {
        let record = TransitionRecord::zero(4, &TransitionRule::builtin(), CellStatus::Ok);
        assert!(record.rule("forest_loss").is_some());
        assert!(record.rule("nope").is_none());
    }
}
