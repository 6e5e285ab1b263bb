//! Column-wise invertible transforms.
//!
//! Both scalers are fit once and then applied unchanged; fitting again is an
//! explicit `fit` call, never a side effect of `transform`.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::error::{Result, StrideError};
use crate::features::stats;
use crate::types::FeatureTable;

/// Values this close to the fitted range edges snap onto them.
const BOUNDS_THRESHOLD: f64 = 1e-7;

pub trait Scaler {
    fn fit(&mut self, data: ArrayView2<f64>) -> Result<()>;
    fn transform(&self, data: ArrayView2<f64>) -> Result<Array2<f64>>;
    fn inverse_transform(&self, data: ArrayView2<f64>) -> Result<Array2<f64>>;

    fn fit_transform(&mut self, data: ArrayView2<f64>) -> Result<Array2<f64>> {
        self.fit(data)?;
        self.transform(data)
    }

    /// Single-column convenience used for the distance and heading targets.
    fn transform_column(&self, column: ArrayView1<f64>) -> Result<Array1<f64>> {
        let as_2d = column.insert_axis(Axis(1));
        Ok(self.transform(as_2d)?.column(0).to_owned())
    }

    fn inverse_transform_column(&self, column: ArrayView1<f64>) -> Result<Array1<f64>> {
        let as_2d = column.insert_axis(Axis(1));
        Ok(self.inverse_transform(as_2d)?.column(0).to_owned())
    }
}

fn check_width(expected: usize, data: &ArrayView2<f64>) -> Result<()> {
    if data.ncols() != expected {
        return Err(StrideError::ShapeMismatch {
            expected,
            actual: data.ncols(),
        });
    }
    Ok(())
}

/// Z-score scaler (population std; zero-variance columns keep scale 1).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn new() -> Self {
        Self::default()
    }

    fn fitted(&self) -> Result<()> {
        if self.mean.is_empty() {
            return Err(StrideError::ScalerNotFitted);
        }
        Ok(())
    }

    /// Scale a single row.
    pub fn transform_row(&self, row: ArrayView1<f64>) -> Result<Array1<f64>> {
        self.fitted()?;
        if row.len() != self.mean.len() {
            return Err(StrideError::ShapeMismatch {
                expected: self.mean.len(),
                actual: row.len(),
            });
        }
        Ok(row
            .iter()
            .zip(self.mean.iter().zip(self.scale.iter()))
            .map(|(v, (m, s))| (v - m) / s)
            .collect())
    }
}

impl Scaler for StandardScaler {
    fn fit(&mut self, data: ArrayView2<f64>) -> Result<()> {
        if data.nrows() == 0 {
            return Err(StrideError::EmptyDataset("cannot fit scaler on zero rows".to_string()));
        }
        self.mean.clear();
        self.scale.clear();
        for col in data.columns() {
            let values: Vec<f64> = col.iter().copied().collect();
            let std = stats::std_dev(&values);
            self.mean.push(stats::mean(&values));
            self.scale.push(if std > 0.0 { std } else { 1.0 });
        }
        Ok(())
    }

    fn transform(&self, data: ArrayView2<f64>) -> Result<Array2<f64>> {
        self.fitted()?;
        check_width(self.mean.len(), &data)?;
        let mut out = data.to_owned();
        for (j, mut col) in out.columns_mut().into_iter().enumerate() {
            col.mapv_inplace(|v| (v - self.mean[j]) / self.scale[j]);
        }
        Ok(out)
    }

    fn inverse_transform(&self, data: ArrayView2<f64>) -> Result<Array2<f64>> {
        self.fitted()?;
        check_width(self.mean.len(), &data)?;
        let mut out = data.to_owned();
        for (j, mut col) in out.columns_mut().into_iter().enumerate() {
            col.mapv_inplace(|v| v * self.scale[j] + self.mean[j]);
        }
        Ok(out)
    }
}

/// Maps each column through its empirical CDF onto a standard normal.
///
/// Quantiles are taken at `n_quantiles` evenly spaced references (capped at the
/// number of fit rows); values between quantiles are linearly interpolated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuantileScaler {
    pub n_quantiles: usize,
    pub references: Vec<f64>,
    /// One ascending quantile vector per column.
    pub quantiles: Vec<Vec<f64>>,
}

impl Default for QuantileScaler {
    fn default() -> Self {
        Self::new(500)
    }
}

impl QuantileScaler {
    pub fn new(n_quantiles: usize) -> Self {
        Self {
            n_quantiles,
            references: Vec::new(),
            quantiles: Vec::new(),
        }
    }

    fn fitted(&self) -> Result<()> {
        if self.quantiles.is_empty() {
            return Err(StrideError::ScalerNotFitted);
        }
        Ok(())
    }

    /// `q_rn` and `refs_rn` are `reversed_neg` of the column's quantiles and
    /// of the references, built once per column by the caller.
    fn forward_value(&self, bounds: &NormalBounds, q: &[f64], q_rn: &[f64], refs_rn: &[f64], x: f64) -> f64 {
        if x.is_nan() {
            return f64::NAN;
        }
        let lower = q[0];
        let upper = q[q.len() - 1];

        // Average of left- and right-sided interpolation keeps repeated
        // quantiles (flat CDF stretches) centered.
        let mut p = if x + BOUNDS_THRESHOLD > upper {
            1.0
        } else {
            0.5 * (interp(x, q, &self.references) - interp(-x, q_rn, refs_rn))
        };
        if x - BOUNDS_THRESHOLD < lower {
            p = 0.0;
        }

        if p <= 0.0 {
            bounds.lo
        } else if p >= 1.0 {
            bounds.hi
        } else {
            bounds.normal.inverse_cdf(p).clamp(bounds.lo, bounds.hi)
        }
    }

    fn inverse_value(&self, bounds: &NormalBounds, col: usize, z: f64) -> f64 {
        let q = &self.quantiles[col];
        if z.is_nan() {
            return f64::NAN;
        }
        if z <= bounds.lo {
            return q[0];
        }
        if z >= bounds.hi {
            return q[q.len() - 1];
        }
        let p = bounds.normal.cdf(z);
        if p - BOUNDS_THRESHOLD < 0.0 {
            return q[0];
        }
        if p + BOUNDS_THRESHOLD > 1.0 {
            return q[q.len() - 1];
        }
        interp(p, &self.references, q)
    }
}

/// Standard normal plus the clip range `[ppf(1e-7), ppf(1 - 1e-7)]`.
struct NormalBounds {
    normal: Normal,
    lo: f64,
    hi: f64,
}

impl NormalBounds {
    fn new() -> Result<Self> {
        let normal = Normal::new(0.0, 1.0)
            .map_err(|e| StrideError::InvalidConfig(format!("normal dist: {e}")))?;
        let lo = normal.inverse_cdf(BOUNDS_THRESHOLD - f64::EPSILON);
        let hi = normal.inverse_cdf(1.0 - (BOUNDS_THRESHOLD - f64::EPSILON));
        Ok(Self { normal, lo, hi })
    }
}

impl Scaler for QuantileScaler {
    fn fit(&mut self, data: ArrayView2<f64>) -> Result<()> {
        let n = data.nrows();
        if n == 0 {
            return Err(StrideError::EmptyDataset("cannot fit scaler on zero rows".to_string()));
        }
        if self.n_quantiles == 0 {
            return Err(StrideError::InvalidConfig("n_quantiles must be positive".to_string()));
        }
        let n_q = self.n_quantiles.min(n).max(2);
        self.references = (0..n_q).map(|i| i as f64 / (n_q - 1) as f64).collect();
        self.quantiles.clear();

        for col in data.columns() {
            let mut sorted: Vec<f64> = col.iter().copied().collect();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let mut q: Vec<f64> = self
                .references
                .iter()
                .map(|r| stats::percentile_sorted(&sorted, r * 100.0))
                .collect();
            // Interpolation can wobble by an ulp; force monotone.
            for i in 1..q.len() {
                if q[i] < q[i - 1] {
                    q[i] = q[i - 1];
                }
            }
            self.quantiles.push(q);
        }
        Ok(())
    }

    fn transform(&self, data: ArrayView2<f64>) -> Result<Array2<f64>> {
        self.fitted()?;
        check_width(self.quantiles.len(), &data)?;
        let bounds = NormalBounds::new()?;
        let refs_rn = reversed_neg(&self.references);
        let mut out = data.to_owned();
        for (j, mut col) in out.columns_mut().into_iter().enumerate() {
            let q = &self.quantiles[j];
            let q_rn = reversed_neg(q);
            col.mapv_inplace(|v| self.forward_value(&bounds, q, &q_rn, &refs_rn, v));
        }
        Ok(out)
    }

    fn inverse_transform(&self, data: ArrayView2<f64>) -> Result<Array2<f64>> {
        self.fitted()?;
        check_width(self.quantiles.len(), &data)?;
        let bounds = NormalBounds::new()?;
        let mut out = data.to_owned();
        for (j, mut col) in out.columns_mut().into_iter().enumerate() {
            col.mapv_inplace(|v| self.inverse_value(&bounds, j, v));
        }
        Ok(out)
    }
}

/// Feature and target scalers, fit together on one training partition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScalerSet {
    pub features: QuantileScaler,
    pub distance: QuantileScaler,
    pub heading: QuantileScaler,
}

impl ScalerSet {
    pub fn fit(train: &FeatureTable, n_quantiles: usize) -> Result<Self> {
        let mut features = QuantileScaler::new(n_quantiles);
        let mut distance = QuantileScaler::new(n_quantiles);
        let mut heading = QuantileScaler::new(n_quantiles);
        features.fit(train.features.view())?;
        distance.fit(train.distance.view().insert_axis(Axis(1)))?;
        heading.fit(train.heading.view().insert_axis(Axis(1)))?;
        Ok(Self {
            features,
            distance,
            heading,
        })
    }

    /// Same table with features and targets mapped into scaled space.
    pub fn transform(&self, table: &FeatureTable) -> Result<FeatureTable> {
        Ok(FeatureTable {
            columns: table.columns.clone(),
            features: self.features.transform(table.features.view())?,
            distance: self.distance.transform_column(table.distance.view())?,
            heading: self.heading.transform_column(table.heading.view())?,
        })
    }
}

/// Piecewise-linear interpolation over ascending `xp`, clamped at the ends.
/// On repeated `xp` values the rightmost one wins.
fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let n = xp.len();
    if x.is_nan() {
        return f64::NAN;
    }
    let j = xp.partition_point(|&v| v <= x);
    if j == 0 {
        return fp[0];
    }
    if j == n {
        return fp[n - 1];
    }
    let (x0, x1) = (xp[j - 1], xp[j]);
    let (y0, y1) = (fp[j - 1], fp[j]);
    y0 + (x - x0) * (y1 - y0) / (x1 - x0)
}

/// `-v[::-1]`. `-interp(-x, reversed_neg(xp), reversed_neg(fp))` is the
/// left-sided counterpart of [`interp`].
fn reversed_neg(v: &[f64]) -> Vec<f64> {
    v.iter().rev().map(|x| -x).collect()
}
