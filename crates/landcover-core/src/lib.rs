//! Land-cover change analysis over a gridded area of interest.
//!
//! The crate tiles an AOI polygon into fixed-size metric cells, counts
//! class-to-class transitions between two categorical rasters inside each
//! cell, and reduces the per-cell table into AOI-level statistics.
//!
//! Pipeline: [`grid::build_grid`] → [`transitions::compute_transitions`]
//! → [`summary::summarize`] → [`report::AoiReport`].

pub mod classes;
pub mod composition;
pub mod config;
pub mod crs;
pub mod error;
pub mod grid;
pub mod mask;
pub mod pipeline;
pub mod raster;
pub mod report;
pub mod rules;
pub mod summary;
pub mod transitions;

pub use config::AnalysisConfig;
pub use crs::Crs;
pub use error::{AnalysisError, Result};
pub use grid::{build_grid, Aoi, Grid, GridCell, GridOptions};
pub use raster::{CategoricalRaster, GeoTransform};
pub use rules::TransitionRule;
pub use summary::{summarize, SummaryStatistics};
pub use transitions::{compute_transitions, CellStatus, EngineOptions, TransitionRecord};
