//! Per-stride displacement and heading regressors for pedestrian
//! dead-reckoning: feature extraction, reference-calibrated outlier gating,
//! augmentation, dual-target LSTM training and artifact persistence.

pub mod augment;
pub mod bundle;
pub mod config;
pub mod dataset;
pub mod error;
pub mod features;
pub mod gate;
pub mod model;
pub mod pipeline;
pub mod random;
pub mod scaler;
pub mod training;
pub mod trajectory;
pub mod types;

pub use bundle::{ArtifactBundle, StridePrediction, StridePredictor};
pub use config::{HyperparameterGrid, HyperparameterSet, PipelineConfig};
pub use error::{Result, StrideError};
pub use pipeline::{Pipeline, PipelineReport};
