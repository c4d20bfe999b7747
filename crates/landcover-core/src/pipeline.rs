//! Pipeline orchestrator: runs every analysis stage for one AOI.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AnalysisConfig;
use crate::error::Result;
use crate::grid::{build_grid, Aoi, Grid};
use crate::raster::CategoricalRaster;
use crate::report::AoiReport;
use crate::summary::{summarize, SummaryStatistics};
use crate::transitions::{compute_transitions, CancelFlag, TransitionRecord};

/// Full output of one AOI analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AoiAnalysis {
    pub grid: Grid,
    pub records: Vec<TransitionRecord>,
    pub summary: SummaryStatistics,
    pub report: AoiReport,
}

/// Run the full pipeline for one AOI.
///
/// Pipeline order:
///   1. Config validation
///   2. Grid tiling (falls back to the whole AOI when tiling yields no cell)
///   3. Per-cell transitions
///   4. Summary
///   5. Area report
pub fn analyze_aoi(
    name: &str,
    aoi: &Aoi,
    before: &CategoricalRaster,
    after: &CategoricalRaster,
    config: &AnalysisConfig,
    cancel: Option<CancelFlag>,
) -> Result<AoiAnalysis> {
    // ── 1. Config ───────────────────────────────────────────────────────────
    config.validate()?;
    info!(aoi = name, cell_size_m = config.cell_size_m, "analysing AOI");

    // ── 2. Grid ─────────────────────────────────────────────────────────────
    let mut grid = build_grid(aoi, config.cell_size_m, &config.grid_options())?;
    let fallback = grid.is_empty();
    if fallback {
        warn!(aoi = name, "tiling produced no cells; analysing the AOI as a single cell");
        grid = Grid::whole_aoi(aoi, config.output_crs)?;
    }

    // ── 3. Transitions ──────────────────────────────────────────────────────
    let mut options = config.engine_options();
    options.cancel = cancel;
    let records = compute_transitions(&grid, before, after, &config.rules, &options)?;

    // ── 4. Summary ──────────────────────────────────────────────────────────
    let summary = summarize(&records, &config.rules);

    // ── 5. Report ───────────────────────────────────────────────────────────
    let report = AoiReport::from_summary(name, &summary, config.pixel_area_ha, fallback);
    for r in &report.rules {
        info!(aoi = name, rule = %r.rule, total_ha = r.total_ha, max_cell = ?r.max_cell, "rule summary");
    }

    Ok(AoiAnalysis { grid, records, summary, report })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::Crs;
    use crate::grid::MetricProjection;
    use crate::raster::GeoTransform;
    use geo::{Coord, Rect};

    /// 20×20 raster of 10 m pixels in Web Mercator covering (0..200, 0..200):
    /// the left half is forest that becomes grass, the right half stays forest.
    fn rasters() -> (CategoricalRaster, CategoricalRaster) {
        let t = GeoTransform::north_up(0.0, 200.0, 10.0, 10.0);
        let before = CategoricalRaster::filled(20, 20, Crs::WebMercator, t, 1);
        let mut after = before.clone();
        for r in 0..20 {
            for c in 0..10 {
                after.set(r, c, 2);
            }
        }
        (before, after)
    }

    fn config() -> AnalysisConfig {
        AnalysisConfig {
            cell_size_m: 100.0,
            metric_projection: MetricProjection::WebMercator,
            output_crs: Crs::WebMercator,
            ..AnalysisConfig::default()
        }
    }

    #[test]
    fn end_to_end_forest_loss() {
        let aoi = Aoi::from_polygon(
            Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 200.0, y: 200.0 }).to_polygon(),
            Crs::WebMercator,
        )
        .unwrap();
        let (before, after) = rasters();
        let result = analyze_aoi("test", &aoi, &before, &after, &config(), None).unwrap();

        assert_eq!(result.grid.len(), 4);
        assert_eq!(result.records.len(), 4);
        // Cells 1 and 2 (x 0..100) lost all 100 forest pixels each.
        let forest = result.summary.rule("forest_loss").unwrap();
        assert_eq!(forest.total_match, 200);
        assert_eq!(forest.max_cell, Some(1));
        assert_eq!(result.report.rule("forest_loss").unwrap().total_ha, 2.0);
        assert!(!result.report.whole_aoi_fallback);
    }

    #[test]
    fn invalid_config_aborts_before_work() {
        let aoi = Aoi::from_polygon(
            Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 200.0, y: 200.0 }).to_polygon(),
            Crs::WebMercator,
        )
        .unwrap();
        let (before, after) = rasters();
        let bad = AnalysisConfig { cell_size_m: -1.0, ..config() };
        assert!(analyze_aoi("test", &aoi, &before, &after, &bad, None).is_err());
    }
}
