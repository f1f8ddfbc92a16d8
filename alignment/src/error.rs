//! Alignment model errors

use std::path::PathBuf;
use thiserror::Error;

use crate::PierSide;

#[derive(Error, Debug)]
pub enum AlignmentError {
    // =========================================================================
    // Configuration
    // =========================================================================

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Fitting
    // =========================================================================

    #[error("Too few sync points: {required} equations needed, {available} available")]
    TooFewPoints { required: usize, available: usize },

    #[error("Design matrix is rank deficient: rank {rank} of {columns} model terms")]
    RankDeficient { rank: usize, columns: usize },

    #[error("Numerical failure: {0}")]
    Numerical(String),

    #[error("Model is not fitted for pier side {0}")]
    NotFitted(PierSide),

    #[error("Inverse correction did not converge after {0} iterations")]
    NoConvergence(usize),

    // =========================================================================
    // Persistence
    // =========================================================================

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid model file {}: {message}", path.display())]
    Format { path: PathBuf, message: String },

    #[error("Model file {} holds a {found} model, expected {expected}", path.display())]
    FamilyMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("Sync data line {line}: {message}")]
    SyncData { line: usize, message: String },
}

pub type AlignmentResult<T> = Result<T, AlignmentError>;
