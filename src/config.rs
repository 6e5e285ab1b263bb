// config.rs — Run configuration for the stride training pipeline
//
// Every knob the pipeline reads lives here with its default. A JSON file may
// override any subset of fields; missing fields keep the defaults below.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::{Result, StrideError};
use crate::features::DEFAULT_SAMPLING_RATE_HZ;

// ─── Hyperparameters ─────────────────────────────────────────────────────────

/// One point of the grid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HyperparameterSet {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub dropout: f64,
}

/// Value lists expanded as a Cartesian product, learning rate outermost.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperparameterGrid {
    pub learning_rate: Vec<f64>,
    pub batch_size: Vec<usize>,
    pub hidden_size: Vec<usize>,
    pub num_layers: Vec<usize>,
    pub dropout: Vec<f64>,
}

impl Default for HyperparameterGrid {
    fn default() -> Self {
        Self {
            learning_rate: vec![0.0005],
            batch_size: vec![32],
            hidden_size: vec![256],
            num_layers: vec![5],
            dropout: vec![0.2],
        }
    }
}

impl HyperparameterGrid {
    pub fn len(&self) -> usize {
        self.learning_rate.len()
            * self.batch_size.len()
            * self.hidden_size.len()
            * self.num_layers.len()
            * self.dropout.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn combinations(&self) -> Vec<HyperparameterSet> {
        let mut out = Vec::with_capacity(self.len());
        for &learning_rate in &self.learning_rate {
            for &batch_size in &self.batch_size {
                for &hidden_size in &self.hidden_size {
                    for &num_layers in &self.num_layers {
                        for &dropout in &self.dropout {
                            out.push(HyperparameterSet {
                                learning_rate,
                                batch_size,
                                hidden_size,
                                num_layers,
                                dropout,
                            });
                        }
                    }
                }
            }
        }
        out
    }
}

// ─── Regressor shape ─────────────────────────────────────────────────────────

/// Shape of one [`crate::model::SequenceRegressor`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegressorConfig {
    pub input_dim: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub dropout: f64,
}

impl RegressorConfig {
    pub fn from_hyperparameters(input_dim: usize, params: &HyperparameterSet) -> Self {
        Self {
            input_dim,
            hidden_size: params.hidden_size,
            num_layers: params.num_layers,
            dropout: params.dropout,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 {
            return Err(StrideError::InvalidConfig("input_dim must be positive".to_string()));
        }
        if self.hidden_size < 2 {
            return Err(StrideError::InvalidConfig(format!(
                "hidden_size must be at least 2, got {}",
                self.hidden_size
            )));
        }
        if self.num_layers == 0 {
            return Err(StrideError::InvalidConfig("num_layers must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(StrideError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // ── Input ──
    pub sampling_rate_hz: f64,
    pub reference_marker: String,

    // ── Outlier gate ──
    pub filter_outliers: bool,
    pub outlier_percentile: f64,

    // ── Augmentation ──
    pub add_synthetic: bool,
    pub synthetic_samples: usize,
    pub use_augment: bool,
    pub augment_times: usize,

    // ── Splits ──
    pub test_fraction: f64,
    pub val_fraction: f64,

    // ── Scalers ──
    pub n_quantiles: usize,

    // ── Training ──
    pub grid: HyperparameterGrid,
    pub patience: usize,
    pub max_epochs: usize,
    pub min_improvement: f64,
    pub weight_decay: f64,
    pub huber_delta: f64,
    pub grad_clip_norm: f64,

    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sampling_rate_hz: DEFAULT_SAMPLING_RATE_HZ,
            reference_marker: "SensorConnectData".to_string(),
            filter_outliers: true,
            outlier_percentile: 99.0,
            add_synthetic: true,
            synthetic_samples: 1800,
            use_augment: true,
            augment_times: 4,
            test_fraction: 0.2,
            val_fraction: 0.1,
            n_quantiles: 500,
            grid: HyperparameterGrid::default(),
            patience: 15,
            max_epochs: 20000,
            min_improvement: 0.001,
            weight_decay: 1e-4,
            huber_delta: 0.5,
            grad_clip_norm: 1.0,
            seed: 10,
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by whatever fields the file sets.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: PipelineConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.sampling_rate_hz > 0.0) {
            return Err(StrideError::InvalidConfig(format!(
                "sampling_rate_hz must be positive, got {}",
                self.sampling_rate_hz
            )));
        }
        if !(0.0..=100.0).contains(&self.outlier_percentile) {
            return Err(StrideError::InvalidConfig(format!(
                "outlier_percentile must be in [0, 100], got {}",
                self.outlier_percentile
            )));
        }
        for (name, fraction) in [("test_fraction", self.test_fraction), ("val_fraction", self.val_fraction)] {
            if !(0.0..1.0).contains(&fraction) {
                return Err(StrideError::InvalidConfig(format!(
                    "{} must be in [0, 1), got {}",
                    name, fraction
                )));
            }
        }
        if self.n_quantiles == 0 {
            return Err(StrideError::InvalidConfig("n_quantiles must be positive".to_string()));
        }
        if self.grid.is_empty() {
            return Err(StrideError::InvalidConfig("hyperparameter grid is empty".to_string()));
        }
        for params in self.grid.combinations() {
            if params.batch_size < 2 {
                return Err(StrideError::InvalidConfig(format!(
                    "batch_size must be at least 2, got {}",
                    params.batch_size
                )));
            }
            if !(params.learning_rate > 0.0) {
                return Err(StrideError::InvalidConfig(format!(
                    "learning_rate must be positive, got {}",
                    params.learning_rate
                )));
            }
            RegressorConfig::from_hyperparameters(1, &params).validate()?;
        }
        if self.patience == 0 || self.max_epochs == 0 {
            return Err(StrideError::InvalidConfig(
                "patience and max_epochs must be positive".to_string(),
            ));
        }
        if !(self.huber_delta > 0.0) || !(self.grad_clip_norm > 0.0) {
            return Err(StrideError::InvalidConfig(
                "huber_delta and grad_clip_norm must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.grid.len(), 1);
        assert_eq!(config.seed, 10);
        assert_eq!(config.sampling_rate_hz, 200.0);
    }

    #[test]
    fn test_grid_order_learning_rate_outermost() {
        let grid = HyperparameterGrid {
            learning_rate: vec![1e-3, 1e-4],
            batch_size: vec![16],
            hidden_size: vec![8],
            num_layers: vec![1],
            dropout: vec![0.0, 0.5],
        };
        let combos = grid.combinations();
        assert_eq!(combos.len(), 4);
        assert_eq!(combos[0].learning_rate, 1e-3);
        assert_eq!(combos[0].dropout, 0.0);
        assert_eq!(combos[1].learning_rate, 1e-3);
        assert_eq!(combos[1].dropout, 0.5);
        assert_eq!(combos[2].learning_rate, 1e-4);
    }

    #[test]
    fn test_partial_json_overrides_defaults() {
        let json = r#"{ "seed": 3, "augment_times": 1, "grid": { "hidden_size": [16] } }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.seed, 3);
        assert_eq!(config.augment_times, 1);
        assert_eq!(config.grid.hidden_size, vec![16]);
        assert_eq!(config.grid.batch_size, vec![32]);
        assert_eq!(config.patience, 15);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.outlier_percentile = 120.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.grid.dropout = vec![1.0];
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.grid.batch_size = vec![];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = std::env::temp_dir().join(format!("stride_cfg_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, r#"{ "max_epochs": 7, "filter_outliers": false }"#).unwrap();
        let config = PipelineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.max_epochs, 7);
        assert!(!config.filter_outliers);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
