use thiserror::Error;

/// Errors raised by grid construction and transition analysis.
///
/// Everything except [`AnalysisError::CellProcessing`] aborts the run.
/// Cell failures are recoverable when the engine runs with
/// [`CellFailurePolicy::ZeroRecord`](crate::transitions::CellFailurePolicy).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("invalid geometry ({context}): {reason}")]
    InvalidGeometry { context: String, reason: String },

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("before/after rasters are not aligned: {detail}")]
    RasterMisalignment { detail: String },

    #[error("grid cell {grid_id} failed: {reason}")]
    CellProcessing { grid_id: u32, reason: String },

    #[error("coordinate transform failed: {detail}")]
    Projection { detail: String },

    #[error("analysis cancelled after {completed} cells")]
    Cancelled { completed: usize },
}

impl AnalysisError {
    pub(crate) fn geometry(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidGeometry { context: context.into(), reason: reason.into() }
    }

    pub(crate) fn parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter { name: name.into(), reason: reason.into() }
    }

    /// True for errors that the engine may absorb into a zero record.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::CellProcessing { .. })
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
