use std::path::PathBuf;
use thiserror::Error;

/// Stride trainer error types
#[derive(Error, Debug)]
pub enum StrideError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("No valid samples left to train on: {0}")]
    EmptyDataset(String),

    #[error("Covariance matrix is singular even after regularization")]
    SingularCovariance,

    #[error("Stride {row} has a non-finite target")]
    NonFiniteTarget { row: usize },

    #[error("Scaler used before fit")]
    ScalerNotFitted,

    #[error("No hyperparameter combination converged ({0} tried)")]
    NoConvergentCombination(usize),

    #[error("Artifact bundle is missing {0}")]
    MissingArtifact(PathBuf),

    #[error("Model weights are missing tensor {0}")]
    MissingTensor(String),
}

pub type Result<T> = std::result::Result<T, StrideError>;
