//! Building blocks for the sequence regressor. Parameters are candle `Var`s
//! drawn from a [`RandomSource`] instead of candle's global RNG; forward
//! passes use `candle_nn` where it has the layer.

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::ops::sigmoid;

use crate::error::{Result, StrideError};
use crate::random::RandomSource;

pub const BATCH_NORM_EPS: f64 = 1e-5;
pub const BATCH_NORM_MOMENTUM: f64 = 0.1;

/// Inverted dropout: surviving activations are scaled by `1 / (1 - p)`.
pub fn dropout(x: &Tensor, p: f64, rng: &mut RandomSource) -> Result<Tensor> {
    if p <= 0.0 {
        return Ok(x.clone());
    }
    let keep = 1.0 - p;
    let scale = (1.0 / keep) as f32;
    let mask: Vec<f32> = (0..x.elem_count())
        .map(|_| if rng.bernoulli(keep) { scale } else { 0.0 })
        .collect();
    let mask = Tensor::from_vec(mask, x.dims(), x.device())?;
    Ok((x * mask)?)
}

/// `U(-bound, bound)` parameter of the given shape.
pub fn uniform_var(dims: &[usize], bound: f64, rng: &mut RandomSource, device: &Device) -> Result<Var> {
    let count: usize = dims.iter().product();
    let values: Vec<f32> = (0..count).map(|_| rng.uniform(-bound, bound) as f32).collect();
    let tensor = Tensor::from_vec(values, dims, device)?;
    Ok(Var::from_tensor(&tensor)?)
}

fn set_checked(var: &Var, name: &str, tensor: &Tensor) -> Result<()> {
    if var.dims() != tensor.dims() {
        return Err(StrideError::ShapeMismatch {
            expected: var.elem_count(),
            actual: tensor.elem_count(),
        });
    }
    log::trace!("[model] restoring {}", name);
    var.set(&tensor.to_dtype(DType::F32)?)?;
    Ok(())
}

/// Parameter tensors addressed by name, for checkpoints and weight files.
pub trait NamedParameters {
    fn named_vars(&self, prefix: &str) -> Vec<(String, Var)>;

    /// Tensors that are state but not trained (running statistics).
    fn named_buffers(&self, _prefix: &str) -> Vec<(String, Tensor)> {
        Vec::new()
    }

    fn set_buffer(&mut self, _name: &str, _value: Tensor) -> Result<()> {
        Ok(())
    }
}

/// Restore vars of one layer from a name → tensor lookup.
pub fn restore_vars<L: NamedParameters + ?Sized>(
    layer: &L,
    prefix: &str,
    lookup: &dyn Fn(&str) -> Option<Tensor>,
) -> Result<()> {
    for (name, var) in layer.named_vars(prefix) {
        let tensor = lookup(&name).ok_or_else(|| StrideError::MissingTensor(name.clone()))?;
        set_checked(&var, &name, &tensor)?;
    }
    Ok(())
}

// ===== Linear =====

/// `candle_nn::Linear` over trainable vars. The layer shares storage with
/// the vars, so optimizer steps and restores show up in `forward`.
#[derive(Clone, Debug)]
pub struct Linear {
    weight: Var,
    bias: Var,
    inner: candle_nn::Linear,
}

impl Linear {
    /// Default init: weight and bias in `U(-1/sqrt(in), 1/sqrt(in))`.
    pub fn new(in_dim: usize, out_dim: usize, rng: &mut RandomSource, device: &Device) -> Result<Self> {
        let bound = 1.0 / (in_dim as f64).sqrt();
        let weight = uniform_var(&[out_dim, in_dim], bound, rng, device)?;
        let bias = uniform_var(&[out_dim], bound, rng, device)?;
        let inner = candle_nn::Linear::new(weight.as_tensor().clone(), Some(bias.as_tensor().clone()));
        Ok(Self { weight, bias, inner })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.inner.forward(x)?)
    }
}

impl NamedParameters for Linear {
    fn named_vars(&self, prefix: &str) -> Vec<(String, Var)> {
        vec![
            (format!("{prefix}.weight"), self.weight.clone()),
            (format!("{prefix}.bias"), self.bias.clone()),
        ]
    }
}

// ===== LSTM =====

/// One direction of one LSTM layer. Gate order is input, forget, cell, output.
#[derive(Clone, Debug)]
struct LstmDirection {
    weight_ih: Var,
    weight_hh: Var,
    bias_ih: Var,
    bias_hh: Var,
    hidden: usize,
}

impl LstmDirection {
    fn new(input: usize, hidden: usize, rng: &mut RandomSource, device: &Device) -> Result<Self> {
        let bound = 1.0 / (hidden as f64).sqrt();
        Ok(Self {
            weight_ih: uniform_var(&[4 * hidden, input], bound, rng, device)?,
            weight_hh: uniform_var(&[4 * hidden, hidden], bound, rng, device)?,
            bias_ih: uniform_var(&[4 * hidden], bound, rng, device)?,
            bias_hh: uniform_var(&[4 * hidden], bound, rng, device)?,
            hidden,
        })
    }

    /// Single time step from a zero state; returns `h`.
    fn step(&self, x: &Tensor) -> Result<Tensor> {
        let batch = x.dim(0)?;
        let h0 = Tensor::zeros((batch, self.hidden), DType::F32, x.device())?;
        let c0 = Tensor::zeros((batch, self.hidden), DType::F32, x.device())?;
        let gates = x
            .matmul(&self.weight_ih.as_tensor().t()?)?
            .broadcast_add(self.bias_ih.as_tensor())?
            .add(&h0.matmul(&self.weight_hh.as_tensor().t()?)?)?
            .broadcast_add(self.bias_hh.as_tensor())?;
        let chunks = gates.chunk(4, 1)?;
        let i = sigmoid(&chunks[0])?;
        let f = sigmoid(&chunks[1])?;
        let g = chunks[2].tanh()?;
        let o = sigmoid(&chunks[3])?;
        let c = ((f * c0)? + (i * g)?)?;
        Ok((o * c.tanh()?)?)
    }

    fn named_vars(&self, layer: usize, suffix: &str, prefix: &str) -> Vec<(String, Var)> {
        vec![
            (format!("{prefix}.weight_ih_l{layer}{suffix}"), self.weight_ih.clone()),
            (format!("{prefix}.weight_hh_l{layer}{suffix}"), self.weight_hh.clone()),
            (format!("{prefix}.bias_ih_l{layer}{suffix}"), self.bias_ih.clone()),
            (format!("{prefix}.bias_hh_l{layer}{suffix}"), self.bias_hh.clone()),
        ]
    }
}

/// Stacked bidirectional LSTM over a length-one sequence.
#[derive(Clone, Debug)]
pub struct BiLstm {
    layers: Vec<(LstmDirection, LstmDirection)>,
    dropout: f64,
}

impl BiLstm {
    pub fn new(
        input: usize,
        hidden: usize,
        num_layers: usize,
        dropout: f64,
        rng: &mut RandomSource,
        device: &Device,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for layer in 0..num_layers {
            let in_dim = if layer == 0 { input } else { 2 * hidden };
            let forward = LstmDirection::new(in_dim, hidden, rng, device)?;
            let backward = LstmDirection::new(in_dim, hidden, rng, device)?;
            layers.push((forward, backward));
        }
        let dropout = if num_layers > 1 { dropout } else { 0.0 };
        Ok(Self { layers, dropout })
    }

    /// `(batch, input)` → `(batch, 2 * hidden)`. Dropout between layers only
    /// when `rng` is given (training).
    pub fn forward(&self, x: &Tensor, mut rng: Option<&mut RandomSource>) -> Result<Tensor> {
        let mut out = x.clone();
        let last = self.layers.len().saturating_sub(1);
        for (idx, (fwd, bwd)) in self.layers.iter().enumerate() {
            let h_f = fwd.step(&out)?;
            let h_b = bwd.step(&out)?;
            out = Tensor::cat(&[&h_f, &h_b], 1)?;
            if idx < last {
                if let Some(r) = rng.as_deref_mut() {
                    out = dropout(&out, self.dropout, r)?;
                }
            }
        }
        Ok(out)
    }
}

impl NamedParameters for BiLstm {
    fn named_vars(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut vars = Vec::new();
        for (layer, (fwd, bwd)) in self.layers.iter().enumerate() {
            vars.extend(fwd.named_vars(layer, "", prefix));
            vars.extend(bwd.named_vars(layer, "_reverse", prefix));
        }
        vars
    }
}

// ===== Batch norm =====

/// Batch normalization over the feature axis of a `(batch, features)` input.
///
/// Running statistics are plain tensors outside the autograd graph and are
/// updated only by [`BatchNorm::forward_train`].
#[derive(Clone, Debug)]
pub struct BatchNorm {
    weight: Var,
    bias: Var,
    running_mean: Tensor,
    running_var: Tensor,
}

impl BatchNorm {
    pub fn new(features: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            weight: Var::ones(features, DType::F32, device)?,
            bias: Var::zeros(features, DType::F32, device)?,
            running_mean: Tensor::zeros(features, DType::F32, device)?,
            running_var: Tensor::ones(features, DType::F32, device)?,
        })
    }

    pub fn forward_train(&mut self, x: &Tensor) -> Result<Tensor> {
        let n = x.dim(0)?;
        if n < 2 {
            return Err(StrideError::InvalidConfig(
                "batch norm needs at least 2 rows in training".to_string(),
            ));
        }
        let mean = x.mean_keepdim(0)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(0)?;
        let normed = centered.broadcast_div(&(var.clone() + BATCH_NORM_EPS)?.sqrt()?)?;

        // Running update uses the unbiased variance.
        let batch_mean: Vec<f32> = mean.flatten_all()?.to_vec1()?;
        let batch_var: Vec<f32> = var.flatten_all()?.to_vec1()?;
        let unbias = n as f32 / (n as f32 - 1.0);
        let m = BATCH_NORM_MOMENTUM as f32;
        let old_mean: Vec<f32> = self.running_mean.to_vec1()?;
        let old_var: Vec<f32> = self.running_var.to_vec1()?;
        let new_mean: Vec<f32> = old_mean
            .iter()
            .zip(&batch_mean)
            .map(|(r, b)| (1.0 - m) * r + m * b)
            .collect();
        let new_var: Vec<f32> = old_var
            .iter()
            .zip(&batch_var)
            .map(|(r, b)| (1.0 - m) * r + m * b * unbias)
            .collect();
        let device = x.device();
        self.running_mean = Tensor::from_vec(new_mean, old_mean.len(), device)?;
        self.running_var = Tensor::from_vec(new_var, old_var.len(), device)?;

        self.affine(&normed)
    }

    pub fn forward_eval(&self, x: &Tensor) -> Result<Tensor> {
        let normed = x
            .broadcast_sub(&self.running_mean)?
            .broadcast_div(&(&self.running_var + BATCH_NORM_EPS)?.sqrt()?)?;
        self.affine(&normed)
    }

    fn affine(&self, normed: &Tensor) -> Result<Tensor> {
        Ok(normed
            .broadcast_mul(self.weight.as_tensor())?
            .broadcast_add(self.bias.as_tensor())?)
    }

    pub fn running_mean(&self) -> &Tensor {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Tensor {
        &self.running_var
    }
}

impl NamedParameters for BatchNorm {
    fn named_vars(&self, prefix: &str) -> Vec<(String, Var)> {
        vec![
            (format!("{prefix}.weight"), self.weight.clone()),
            (format!("{prefix}.bias"), self.bias.clone()),
        ]
    }

    fn named_buffers(&self, prefix: &str) -> Vec<(String, Tensor)> {
        vec![
            (format!("{prefix}.running_mean"), self.running_mean.clone()),
            (format!("{prefix}.running_var"), self.running_var.clone()),
        ]
    }

    fn set_buffer(&mut self, name: &str, value: Tensor) -> Result<()> {
        let slot = if name.ends_with(".running_mean") {
            &mut self.running_mean
        } else if name.ends_with(".running_var") {
            &mut self.running_var
        } else {
            return Err(StrideError::MissingTensor(name.to_string()));
        };
        if slot.dims() != value.dims() {
            return Err(StrideError::ShapeMismatch {
                expected: slot.elem_count(),
                actual: value.elem_count(),
            });
        }
        *slot = value.to_dtype(DType::F32)?;
        Ok(())
    }
}
