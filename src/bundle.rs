//! Artifact bundle: everything needed to run the trained models later, and a
//! predictor that does so from a raw stride segment.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use candle_core::Device;
use chrono::Utc;
use ndarray::{Array1, Array2};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{HyperparameterSet, RegressorConfig};
use crate::error::{Result, StrideError};
use crate::features::{FeatureExtractor, StrideSegment};
use crate::gate::ReferenceDistribution;
use crate::model::{features_tensor, SequenceRegressor, TrainedModelPair};
use crate::scaler::{QuantileScaler, Scaler, ScalerSet};
use crate::training::TestReport;

pub const DIST_MODEL_FILE: &str = "dist_model.safetensors";
pub const HEADING_MODEL_FILE: &str = "heading_model.safetensors";
pub const FEAT_SCALER_FILE: &str = "feat_scaler.json";
pub const DIST_SCALER_FILE: &str = "dist_scaler.json";
pub const HEADING_SCALER_FILE: &str = "heading_scaler.json";
pub const FEAT_COLS_FILE: &str = "feat_cols.json";
pub const PARAMS_FILE: &str = "params.json";
pub const OUTLIER_GATE_FILE: &str = "outlier_gate.json";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub created_at: String,
    pub crate_version: String,
    pub best_score: f64,
    pub sampling_rate_hz: f64,
    pub seed: u64,
    pub test_report: Option<TestReport>,
    /// Bundle files in the order they were written (manifest last).
    pub files: Vec<String>,
}

impl Manifest {
    pub fn new(best_score: f64, sampling_rate_hz: f64, seed: u64, test_report: Option<TestReport>) -> Self {
        Self {
            created_at: Utc::now().to_rfc3339(),
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            best_score,
            sampling_rate_hz,
            seed,
            test_report,
            files: Vec::new(),
        }
    }
}

pub struct ArtifactBundle {
    pub models: TrainedModelPair,
    pub scalers: ScalerSet,
    pub feature_columns: Vec<String>,
    pub params: HyperparameterSet,
    pub gate: Option<ReferenceDistribution>,
    pub manifest: Manifest,
}

fn write_json<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<PathBuf> {
    let path = dir.join(name);
    let json = serde_json::to_string_pretty(value)?;
    fs::write(&path, json)?;
    Ok(path)
}

fn read_json<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<T> {
    let path = dir.join(name);
    if !path.exists() {
        return Err(StrideError::MissingArtifact(path));
    }
    let reader = BufReader::new(File::open(&path)?);
    Ok(serde_json::from_reader(reader)?)
}

impl ArtifactBundle {
    /// Write every artifact into `dir`, creating it if needed. Returns the
    /// written paths in order.
    pub fn save(&mut self, dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;
        let mut written = Vec::new();

        let dist_path = dir.join(DIST_MODEL_FILE);
        self.models.distance.save_safetensors(&dist_path)?;
        written.push(dist_path);
        let head_path = dir.join(HEADING_MODEL_FILE);
        self.models.heading.save_safetensors(&head_path)?;
        written.push(head_path);

        written.push(write_json(dir, FEAT_SCALER_FILE, &self.scalers.features)?);
        written.push(write_json(dir, DIST_SCALER_FILE, &self.scalers.distance)?);
        written.push(write_json(dir, HEADING_SCALER_FILE, &self.scalers.heading)?);
        written.push(write_json(dir, FEAT_COLS_FILE, &self.feature_columns)?);
        written.push(write_json(dir, PARAMS_FILE, &self.params)?);
        if let Some(gate) = &self.gate {
            written.push(write_json(dir, OUTLIER_GATE_FILE, gate)?);
        }

        self.manifest.files = written
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .chain(std::iter::once(MANIFEST_FILE.to_string()))
            .collect();
        written.push(write_json(dir, MANIFEST_FILE, &self.manifest)?);

        log::info!("[bundle] wrote {} files to {}", written.len(), dir.display());
        Ok(written)
    }

    /// Read a bundle written by [`ArtifactBundle::save`], in the same order.
    pub fn load(dir: &Path, device: &Device) -> Result<Self> {
        // Model shape comes from the column list and hyperparameters.
        let feature_columns: Vec<String> = read_json(dir, FEAT_COLS_FILE)?;
        let params: HyperparameterSet = read_json(dir, PARAMS_FILE)?;
        let config = RegressorConfig::from_hyperparameters(feature_columns.len(), &params);

        let distance = SequenceRegressor::load_safetensors(&config, &dir.join(DIST_MODEL_FILE), device)?;
        let heading = SequenceRegressor::load_safetensors(&config, &dir.join(HEADING_MODEL_FILE), device)?;
        let scalers = ScalerSet {
            features: read_json(dir, FEAT_SCALER_FILE)?,
            distance: read_json(dir, DIST_SCALER_FILE)?,
            heading: read_json(dir, HEADING_SCALER_FILE)?,
        };
        let gate = if dir.join(OUTLIER_GATE_FILE).exists() {
            Some(read_json(dir, OUTLIER_GATE_FILE)?)
        } else {
            None
        };
        let manifest: Manifest = read_json(dir, MANIFEST_FILE)?;

        Ok(Self {
            models: TrainedModelPair { distance, heading },
            scalers,
            feature_columns,
            params,
            gate,
            manifest,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub enum StridePrediction {
    /// Fewer samples than a stride needs.
    TooShort,
    /// Features fall outside the reference distribution.
    Rejected { mahalanobis: f64 },
    Estimate { distance: f64, heading: f64 },
}

/// Inference from raw acceleration segments with a loaded bundle.
pub struct StridePredictor {
    bundle: ArtifactBundle,
    extractor: FeatureExtractor,
    device: Device,
}

impl StridePredictor {
    pub fn new(bundle: ArtifactBundle, device: Device) -> Self {
        let extractor = FeatureExtractor::new(bundle.manifest.sampling_rate_hz);
        Self {
            bundle,
            extractor,
            device,
        }
    }

    pub fn load(dir: &Path, device: Device) -> Result<Self> {
        let bundle = ArtifactBundle::load(dir, &device)?;
        Ok(Self::new(bundle, device))
    }

    pub fn bundle(&self) -> &ArtifactBundle {
        &self.bundle
    }

    pub fn predict(&self, segment: StrideSegment) -> Result<StridePrediction> {
        let mut features = match self.extractor.extract(segment) {
            Some(f) => f,
            None => return Ok(StridePrediction::TooShort),
        };
        for v in features.iter_mut() {
            if !v.is_finite() {
                *v = 0.0;
            }
        }
        let raw = Array1::from(features);

        if let Some(gate) = &self.bundle.gate {
            let d = gate.distance(raw.view())?;
            if d > gate.threshold() {
                return Ok(StridePrediction::Rejected { mahalanobis: d });
            }
        }

        let width = raw.len();
        let row = Array2::from_shape_vec((1, width), raw.to_vec())
            .map_err(|e| StrideError::InvalidConfig(format!("feature row shape: {e}")))?;
        let scaled = self.bundle.scalers.features.transform(row.view())?;
        let x = features_tensor(scaled.view(), &self.device)?;

        let distance = unscale(&self.bundle.scalers.distance, self.bundle.models.distance.predict(&x)?)?;
        let heading = unscale(&self.bundle.scalers.heading, self.bundle.models.heading.predict(&x)?)?;
        Ok(StridePrediction::Estimate { distance, heading })
    }
}

fn unscale(scaler: &QuantileScaler, scaled: Vec<f32>) -> Result<f64> {
    let values: Array1<f64> = scaled.into_iter().map(f64::from).collect();
    let original = scaler.inverse_transform_column(values.view())?;
    original
        .first()
        .copied()
        .ok_or_else(|| StrideError::EmptyDataset("model returned no prediction".to_string()))
}
