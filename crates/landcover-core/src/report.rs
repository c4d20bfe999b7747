//! Area reporting: converts pixel counts into hectares for one AOI.
//!
//! hectares = round(count × pixel_area_ha, 2). Rounding is half away from
//! zero; values are never truncated.
use serde::{Deserialize, Serialize};

use crate::summary::SummaryStatistics;

/// Area of one 10 m × 10 m pixel in hectares.
pub const DEFAULT_PIXEL_AREA_HA: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleReport {
    pub rule: String,
    pub total_ha: f64,
    pub max_cell: Option<u32>,
    pub max_cell_ha: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AoiReport {
    pub name: String,
    pub n_cells: usize,
    /// True when tiling produced no cells and the AOI was analysed whole.
    pub whole_aoi_fallback: bool,
    pub pixel_area_ha: f64,
    pub rules: Vec<RuleReport>,
}

impl AoiReport {
    pub fn from_summary(
        name: impl Into<String>,
        summary: &SummaryStatistics,
        pixel_area_ha: f64,
        whole_aoi_fallback: bool,
    ) -> Self {
        let rules = summary
            .rules
            .iter()
            .map(|r| RuleReport {
                rule: r.rule.clone(),
                total_ha: to_hectares(r.total_match, pixel_area_ha),
                max_cell: r.max_cell,
                max_cell_ha: to_hectares(r.max_cell_match, pixel_area_ha),
            })
            .collect();
        Self { name: name.into(), n_cells: summary.n_cells, whole_aoi_fallback, pixel_area_ha, rules }
    }

    pub fn rule(&self, name: &str) -> Option<&RuleReport> {
        self.rules.iter().find(|r| r.rule == name)
    }
}

pub fn to_hectares(count: u64, pixel_area_ha: f64) -> f64 {
    round2(count as f64 * pixel_area_ha)
}

#[inline]
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
