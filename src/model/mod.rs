//! Single-output sequence regressor: bidirectional LSTM encoder, batch norm,
//! and a narrowing feed-forward head.

pub mod layers;

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor, Var};
use ndarray::ArrayView2;

use crate::config::RegressorConfig;
use crate::error::{Result, StrideError};
use crate::random::RandomSource;
use layers::{dropout, BatchNorm, BiLstm, Linear, NamedParameters};

/// CUDA when compiled with the `cuda` feature and a device is present.
pub fn default_device() -> Device {
    match Device::cuda_if_available(0) {
        Ok(device) => device,
        Err(e) => {
            log::warn!("[model] CUDA unavailable ({}), using CPU", e);
            Device::Cpu
        }
    }
}

/// `(rows, cols)` f32 tensor from a feature matrix.
pub fn features_tensor(features: ArrayView2<f64>, device: &Device) -> Result<Tensor> {
    let (rows, cols) = features.dim();
    let values: Vec<f32> = features.iter().map(|v| *v as f32).collect();
    Ok(Tensor::from_vec(values, (rows, cols), device)?)
}

/// Deep copy of every parameter and buffer, keyed by weight-file name.
#[derive(Clone, Debug)]
pub struct ModelSnapshot {
    tensors: HashMap<String, Tensor>,
}

#[derive(Clone, Debug)]
pub struct SequenceRegressor {
    config: RegressorConfig,
    lstm: BiLstm,
    bn: BatchNorm,
    fc0: Linear,
    fc3: Linear,
    fc6: Linear,
    device: Device,
}

impl SequenceRegressor {
    pub fn new(config: &RegressorConfig, rng: &mut RandomSource, device: &Device) -> Result<Self> {
        config.validate()?;
        let h = config.hidden_size;
        let lstm = BiLstm::new(config.input_dim, h, config.num_layers, config.dropout, rng, device)?;
        let bn = BatchNorm::new(2 * h, device)?;
        let fc0 = Linear::new(2 * h, h, rng, device)?;
        let fc3 = Linear::new(h, h / 2, rng, device)?;
        let fc6 = Linear::new(h / 2, 1, rng, device)?;
        Ok(Self {
            config: config.clone(),
            lstm,
            bn,
            fc0,
            fc3,
            fc6,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &RegressorConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Trainable parameters, in weight-file order.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let mut vars = self.lstm.named_vars("lstm");
        vars.extend(self.bn.named_vars("bn"));
        vars.extend(self.fc0.named_vars("fc.0"));
        vars.extend(self.fc3.named_vars("fc.3"));
        vars.extend(self.fc6.named_vars("fc.6"));
        vars
    }

    pub fn vars(&self) -> Vec<Var> {
        self.named_vars().into_iter().map(|(_, v)| v).collect()
    }

    pub fn parameter_count(&self) -> usize {
        self.named_vars().iter().map(|(_, v)| v.elem_count()).sum()
    }

    /// Training forward: dropout active, batch statistics, running stats updated.
    /// `x` is `(batch, input_dim)`; output is `(batch, 1)`.
    pub fn forward_train(&mut self, x: &Tensor, rng: &mut RandomSource) -> Result<Tensor> {
        let p = self.config.dropout;
        let encoded = self.lstm.forward(x, Some(&mut *rng))?;
        let normed = self.bn.forward_train(&encoded)?;
        let h = self.fc0.forward(&normed)?.silu()?;
        let h = dropout(&h, p, rng)?;
        let h = self.fc3.forward(&h)?.silu()?;
        let h = dropout(&h, p / 2.0, rng)?;
        self.fc6.forward(&h)
    }

    /// Inference forward: no dropout, running statistics.
    pub fn forward_eval(&self, x: &Tensor) -> Result<Tensor> {
        let encoded = self.lstm.forward(x, None)?;
        let normed = self.bn.forward_eval(&encoded)?;
        let h = self.fc0.forward(&normed)?.silu()?;
        let h = self.fc3.forward(&h)?.silu()?;
        self.fc6.forward(&h)
    }

    /// Scaled-space predictions for a batch, one per row.
    pub fn predict(&self, x: &Tensor) -> Result<Vec<f32>> {
        Ok(self.forward_eval(x)?.flatten_all()?.to_vec1()?)
    }

    fn named_tensors(&self) -> Vec<(String, Tensor)> {
        let mut out: Vec<(String, Tensor)> = self
            .named_vars()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect();
        out.extend(self.bn.named_buffers("bn"));
        out
    }

    pub fn snapshot(&self) -> Result<ModelSnapshot> {
        let mut tensors = HashMap::new();
        for (name, tensor) in self.named_tensors() {
            tensors.insert(name, tensor.copy()?);
        }
        Ok(ModelSnapshot { tensors })
    }

    pub fn restore(&mut self, snapshot: &ModelSnapshot) -> Result<()> {
        self.load_named(&|name| snapshot.tensors.get(name).cloned())
    }

    fn load_named(&mut self, lookup: &dyn Fn(&str) -> Option<Tensor>) -> Result<()> {
        layers::restore_vars(&self.lstm, "lstm", lookup)?;
        layers::restore_vars(&self.bn, "bn", lookup)?;
        layers::restore_vars(&self.fc0, "fc.0", lookup)?;
        layers::restore_vars(&self.fc3, "fc.3", lookup)?;
        layers::restore_vars(&self.fc6, "fc.6", lookup)?;
        for name in ["bn.running_mean", "bn.running_var"] {
            let tensor = lookup(name).ok_or_else(|| StrideError::MissingTensor(name.to_string()))?;
            self.bn.set_buffer(name, tensor.copy()?)?;
        }
        Ok(())
    }

    /// Parameters and batch-norm running statistics as safetensors.
    pub fn save_safetensors(&self, path: &Path) -> Result<()> {
        let tensors: HashMap<String, Tensor> = self.named_tensors().into_iter().collect();
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Rebuild from a config and a weight file written by [`Self::save_safetensors`].
    pub fn load_safetensors(config: &RegressorConfig, path: &Path, device: &Device) -> Result<Self> {
        if !path.exists() {
            return Err(StrideError::MissingArtifact(path.to_path_buf()));
        }
        // Init values are overwritten below; any seed will do.
        let mut model = Self::new(config, &mut RandomSource::new(0), device)?;
        let tensors = candle_core::safetensors::load(path, device)?;
        model.load_named(&|name| tensors.get(name).cloned())?;
        Ok(model)
    }
}

/// Distance and heading regressors trained side by side.
#[derive(Clone, Debug)]
pub struct TrainedModelPair {
    pub distance: SequenceRegressor,
    pub heading: SequenceRegressor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{AdamW, Optimizer, ParamsAdamW};

    fn tiny_config() -> RegressorConfig {
        RegressorConfig {
            input_dim: 6,
            hidden_size: 8,
            num_layers: 2,
            dropout: 0.2,
        }
    }

    fn inputs(rows: usize, device: &Device) -> Tensor {
        let values: Vec<f32> = (0..rows * 6).map(|i| ((i * 7) % 11) as f32 / 11.0 - 0.5).collect();
        Tensor::from_vec(values, (rows, 6), device).unwrap()
    }

    #[test]
    fn test_forward_shapes() {
        let device = Device::Cpu;
        let mut rng = RandomSource::new(10);
        let mut model = SequenceRegressor::new(&tiny_config(), &mut rng, &device).unwrap();
        let x = inputs(5, &device);
        assert_eq!(model.forward_train(&x, &mut rng).unwrap().dims(), &[5, 1]);
        assert_eq!(model.forward_eval(&x).unwrap().dims(), &[5, 1]);
        assert_eq!(model.predict(&x).unwrap().len(), 5);
    }

    #[test]
    fn test_same_seed_same_weights() {
        let device = Device::Cpu;
        let a = SequenceRegressor::new(&tiny_config(), &mut RandomSource::new(3), &device).unwrap();
        let b = SequenceRegressor::new(&tiny_config(), &mut RandomSource::new(3), &device).unwrap();
        let x = inputs(4, &device);
        assert_eq!(a.predict(&x).unwrap(), b.predict(&x).unwrap());
    }

    #[test]
    fn test_parameter_layout() {
        let device = Device::Cpu;
        let model = SequenceRegressor::new(&tiny_config(), &mut RandomSource::new(1), &device).unwrap();
        // lstm: 2 layers x 2 directions x 4 tensors, bn: 2, head: 3 x 2
        assert_eq!(model.named_vars().len(), 16 + 2 + 6);
        let l0 = 2 * (4 * 8 * 6 + 4 * 8 * 8 + 2 * 4 * 8);
        let l1 = 2 * (4 * 8 * 16 + 4 * 8 * 8 + 2 * 4 * 8);
        let bn = 2 * 16;
        let head = (16 * 8 + 8) + (8 * 4 + 4) + (4 + 1);
        assert_eq!(model.parameter_count(), l0 + l1 + bn + head);
    }

    #[test]
    fn test_snapshot_restore() {
        let device = Device::Cpu;
        let mut rng = RandomSource::new(4);
        let mut model = SequenceRegressor::new(&tiny_config(), &mut rng, &device).unwrap();
        let x = inputs(8, &device);
        let before = model.predict(&x).unwrap();
        let snap = model.snapshot().unwrap();

        let mut opt = AdamW::new(
            model.vars(),
            ParamsAdamW {
                lr: 0.05,
                ..Default::default()
            },
        )
        .unwrap();
        let target = Tensor::ones((8, 1), DType::F32, &device).unwrap();
        for _ in 0..3 {
            let out = model.forward_train(&x, &mut rng).unwrap();
            let loss = (out - &target).unwrap().sqr().unwrap().mean_all().unwrap();
            opt.backward_step(&loss).unwrap();
        }
        assert_ne!(model.predict(&x).unwrap(), before);

        model.restore(&snap).unwrap();
        assert_eq!(model.predict(&x).unwrap(), before);
    }

    #[test]
    fn test_training_reduces_loss() {
        let device = Device::Cpu;
        let mut rng = RandomSource::new(5);
        let config = RegressorConfig {
            dropout: 0.0,
            ..tiny_config()
        };
        let mut model = SequenceRegressor::new(&config, &mut rng, &device).unwrap();
        let x = inputs(16, &device);
        let target_values: Vec<f32> = (0..16).map(|i| (i % 4) as f32 * 0.5 - 0.75).collect();
        let target = Tensor::from_vec(target_values, (16, 1), &device).unwrap();
        let mut opt = AdamW::new(
            model.vars(),
            ParamsAdamW {
                lr: 0.01,
                ..Default::default()
            },
        )
        .unwrap();
        let mut losses = Vec::new();
        for _ in 0..60 {
            let out = model.forward_train(&x, &mut rng).unwrap();
            let loss = (out - &target).unwrap().sqr().unwrap().mean_all().unwrap();
            losses.push(loss.to_scalar::<f32>().unwrap());
            opt.backward_step(&loss).unwrap();
        }
        assert!(losses[losses.len() - 1] < losses[0]);
    }

    #[test]
    fn test_safetensors_roundtrip_includes_running_stats() {
        let device = Device::Cpu;
        let mut rng = RandomSource::new(6);
        let mut model = SequenceRegressor::new(&tiny_config(), &mut rng, &device).unwrap();
        let x = inputs(10, &device);
        // move the running statistics away from their init values
        for _ in 0..3 {
            model.forward_train(&x, &mut rng).unwrap();
        }
        let dir = std::env::temp_dir().join(format!("stride_model_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.safetensors");
        model.save_safetensors(&path).unwrap();

        let loaded = SequenceRegressor::load_safetensors(&tiny_config(), &path, &device).unwrap();
        let a = model.predict(&x).unwrap();
        let b = loaded.predict(&x).unwrap();
        assert_eq!(a, b);
        let rm: Vec<f32> = loaded.bn.running_mean().to_vec1().unwrap();
        assert!(rm.iter().any(|v| *v != 0.0));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let path = std::env::temp_dir().join("stride_model_does_not_exist.safetensors");
        let err = SequenceRegressor::load_safetensors(&tiny_config(), &path, &Device::Cpu);
        assert!(matches!(err, Err(StrideError::MissingArtifact(_))));
    }
}
