use serde::{Deserialize, Serialize};

use crate::crs::Crs;
use crate::error::{AnalysisError, Result};
use crate::grid::{GridOptions, MetricProjection};
use crate::report::DEFAULT_PIXEL_AREA_HA;
use crate::rules::{validate_rules, TransitionRule};
use crate::transitions::{CellFailurePolicy, EmptyCellPolicy, EngineOptions};

/// Default side of a grid cell, in metres.
pub const DEFAULT_CELL_SIZE_M: f64 = 10_000.0;

/// Dynamic World exports mark missing pixels with this value.
pub const DEFAULT_NODATA: i32 = -9999;

/// Everything one AOI analysis needs besides its inputs.
/// Defaults reproduce the forest/shrub monitoring setup: 10 km cells,
/// 10 m pixels, the two built-in rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    pub cell_size_m: f64,
    pub metric_projection: MetricProjection,
    /// CRS of the returned grid, as an EPSG code.
    pub output_crs: Crs,
    pub rules: Vec<TransitionRule>,
    pub nodata_values: Vec<i32>,
    /// Hectares per pixel, used only for reporting.
    pub pixel_area_ha: f64,
    pub empty_cell_policy: EmptyCellPolicy,
    pub cell_failure_policy: CellFailurePolicy,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            cell_size_m: DEFAULT_CELL_SIZE_M,
            metric_projection: MetricProjection::Utm,
            output_crs: Crs::Wgs84,
            rules: TransitionRule::builtin(),
            nodata_values: vec![DEFAULT_NODATA],
            pixel_area_ha: DEFAULT_PIXEL_AREA_HA,
            empty_cell_policy: EmptyCellPolicy::Skip,
            cell_failure_policy: CellFailurePolicy::ZeroRecord,
        }
    }
}

impl AnalysisConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)
            .map_err(|e| AnalysisError::parameter("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.cell_size_m.is_finite() || self.cell_size_m <= 0.0 {
            return Err(AnalysisError::parameter(
                "cell_size_m",
                format!("must be a positive number of metres, got {}", self.cell_size_m),
            ));
        }
        if !self.pixel_area_ha.is_finite() || self.pixel_area_ha <= 0.0 {
            return Err(AnalysisError::parameter("pixel_area_ha", "must be positive"));
        }
        if self.rules.is_empty() {
            return Err(AnalysisError::parameter("rules", "at least one rule is required"));
        }
        validate_rules(&self.rules)
    }

    pub fn grid_options(&self) -> GridOptions {
        GridOptions { metric_projection: self.metric_projection, output_crs: self.output_crs }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            nodata_values: self.nodata_values.clone(),
            empty_cell_policy: self.empty_cell_policy,
            cell_failure_policy: self.cell_failure_policy,
            cancel: None,
        }
    }
}
