//! Error types for psrecon

use std::fmt;
use thiserror::Error;

/// Engine stage a failure originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    NeighborGraph,
    NormalEstimation,
    OctreeBuild,
    Solve,
    Extraction,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::NeighborGraph => "neighbor graph",
            Stage::NormalEstimation => "normal estimation",
            Stage::OctreeBuild => "octree build",
            Stage::Solve => "poisson solve",
            Stage::Extraction => "isosurface extraction",
        };
        f.write_str(name)
    }
}

/// Main error type for psrecon operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("{stage}: insufficient input: {reason}")]
    InsufficientInput { stage: Stage, reason: String },

    #[error("{stage}: degenerate neighborhood at point {index}: {reason}")]
    DegenerateNeighborhood {
        stage: Stage,
        index: usize,
        reason: String,
    },

    #[error("{stage}: degenerate input: {reason}")]
    DegenerateInput { stage: Stage, reason: String },

    #[error("{stage}: solver diverged: {reason}")]
    SolverDivergence { stage: Stage, reason: String },

    #[error("{stage}: empty isosurface: {reason}")]
    EmptyIsosurface { stage: Stage, reason: String },

    /// `stage` is the stage that was about to start, not the last one finished
    #[error("deadline exceeded before {stage}")]
    DeadlineExceeded { stage: Stage },

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    /// Stage the failure originated from, if it came out of an engine stage
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::InsufficientInput { stage, .. }
            | Error::DegenerateNeighborhood { stage, .. }
            | Error::DegenerateInput { stage, .. }
            | Error::SolverDivergence { stage, .. }
            | Error::EmptyIsosurface { stage, .. }
            | Error::DeadlineExceeded { stage } => Some(*stage),
            Error::InvalidData(_) => None,
        }
    }

    pub fn insufficient_input(stage: Stage, reason: impl Into<String>) -> Self {
        Error::InsufficientInput { stage, reason: reason.into() }
    }

    pub fn degenerate_input(stage: Stage, reason: impl Into<String>) -> Self {
        Error::DegenerateInput { stage, reason: reason.into() }
    }

    pub fn solver_divergence(stage: Stage, reason: impl Into<String>) -> Self {
        Error::SolverDivergence { stage, reason: reason.into() }
    }

    pub fn empty_isosurface(stage: Stage, reason: impl Into<String>) -> Self {
        Error::EmptyIsosurface { stage, reason: reason.into() }
    }
}

/// Result type alias for psrecon operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_is_reported() {
        let err = Error::solver_divergence(Stage::Solve, "residual grew");
        assert_eq!(err.stage(), Some(Stage::Solve));
        assert_eq!(err.to_string(), "poisson solve: solver diverged: residual grew");

        let err = Error::InvalidData("bad".to_string());
        assert_eq!(err.stage(), None);
    }

    #[test]
    fn test_degenerate_neighborhood_message() {
        let err = Error::DegenerateNeighborhood {
            stage: Stage::NormalEstimation,
            index: 7,
            reason: "2 neighbors".to_string(),
        };
        assert!(err.to_string().contains("point 7"));
    }
}
