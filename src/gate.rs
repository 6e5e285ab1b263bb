//! Mahalanobis outlier gate calibrated on reference trials.
//!
//! The gate is fit once, on reference-provenance samples only, and the
//! resulting [`ReferenceDistribution`] is then applied unchanged to every
//! trial of either provenance.

use nalgebra::DMatrix;
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrideError};
use crate::features::stats;
use crate::scaler::{Scaler, StandardScaler};
use crate::types::{linalg, StrideSample, TrialSamples};

/// Added to the covariance diagonal before inversion.
pub const COVARIANCE_RIDGE: f64 = 1e-6;

/// Fitted gate parameters; immutable once built.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReferenceDistribution {
    z_scaler: StandardScaler,
    mean: Vec<f64>,
    /// Row-major F×F inverse covariance in z-space.
    inv_covariance: Vec<f64>,
    threshold: f64,
    percentile: f64,
}

impl ReferenceDistribution {
    /// Fit on reference samples.
    ///
    /// Needs at least two samples (the covariance is the unbiased estimate).
    pub fn fit(reference: &[StrideSample], percentile: f64) -> Result<Self> {
        if !(0.0..=100.0).contains(&percentile) {
            return Err(StrideError::InvalidConfig(format!(
                "outlier percentile must be in [0, 100], got {}",
                percentile
            )));
        }
        if reference.len() < 2 {
            return Err(StrideError::EmptyDataset(format!(
                "outlier gate needs at least 2 reference samples, got {}",
                reference.len()
            )));
        }

        let raw = samples_matrix(reference)?;
        let mut z_scaler = StandardScaler::new();
        let z = z_scaler.fit_transform(raw.view())?;

        let (n, dim) = z.dim();
        let z_m = linalg::matrix_from_nd(z.view());
        let mean_row = z_m.row_mean();
        let mut centered = z_m.clone();
        for mut row in centered.row_iter_mut() {
            row -= &mean_row;
        }
        let mut cov = centered.transpose() * &centered / (n as f64 - 1.0);
        cov += DMatrix::<f64>::identity(dim, dim) * COVARIANCE_RIDGE;
        let inv = cov.try_inverse().ok_or(StrideError::SingularCovariance)?;

        let mut dist = Self {
            z_scaler,
            mean: mean_row.iter().copied().collect(),
            inv_covariance: inv.transpose().iter().copied().collect(),
            threshold: f64::INFINITY,
            percentile,
        };

        let self_distances = dist.distances(reference)?;
        dist.threshold = stats::percentile(&self_distances, percentile);
        Ok(dist)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn percentile(&self) -> f64 {
        self.percentile
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn z_scaler(&self) -> &StandardScaler {
        &self.z_scaler
    }

    /// Row-major inverse covariance.
    pub fn inv_covariance(&self) -> &[f64] {
        &self.inv_covariance
    }

    fn inv_matrix(&self) -> DMatrix<f64> {
        let dim = self.dim();
        DMatrix::from_row_slice(dim, dim, &self.inv_covariance)
    }

    /// Mahalanobis distance of one raw (unscaled) feature row.
    pub fn distance(&self, features: ArrayView1<f64>) -> Result<f64> {
        let z = self.z_scaler.transform_row(features)?;
        let diff = linalg::vector_from_nd(z.view()) - nalgebra::DVector::from_column_slice(&self.mean);
        Ok(linalg::quadratic_form(&self.inv_matrix(), &diff).max(0.0).sqrt())
    }

    pub fn distances(&self, samples: &[StrideSample]) -> Result<Vec<f64>> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        let raw = samples_matrix(samples)?;
        let z = self.z_scaler.transform(raw.view())?;
        let inv = self.inv_matrix();
        let mean = nalgebra::DVector::from_column_slice(&self.mean);
        Ok(z.rows()
            .into_iter()
            .map(|row| {
                let diff = linalg::vector_from_nd(row) - &mean;
                linalg::quadratic_form(&inv, &diff).max(0.0).sqrt()
            })
            .collect())
    }

    pub fn accepts(&self, features: ArrayView1<f64>) -> Result<bool> {
        Ok(self.distance(features)? <= self.threshold)
    }

    /// Samples whose distance is within the threshold, order preserved.
    pub fn apply(&self, samples: &[StrideSample]) -> Result<Vec<StrideSample>> {
        let distances = self.distances(samples)?;
        Ok(samples
            .iter()
            .zip(distances)
            .filter(|(_, d)| *d <= self.threshold)
            .map(|(s, _)| s.clone())
            .collect())
    }

    /// Gate each trial separately. Trials left with no strides are dropped.
    pub fn filter_trials(&self, trials: Vec<TrialSamples>) -> Result<Vec<TrialSamples>> {
        let mut kept = Vec::with_capacity(trials.len());
        for mut trial in trials {
            let before = trial.samples.len();
            trial.samples = self.apply(&trial.samples)?;
            if trial.samples.is_empty() {
                log::warn!("[gate] {}: no strides within threshold, trial excluded", trial.name);
                continue;
            }
            log::info!(
                "[gate] {} ({:?}): kept {}/{} strides",
                trial.name,
                trial.provenance,
                trial.samples.len(),
                before
            );
            kept.push(trial);
        }
        Ok(kept)
    }
}

fn samples_matrix(samples: &[StrideSample]) -> Result<Array2<f64>> {
    let width = samples.first().map(|s| s.features().len()).unwrap_or(0);
    let mut flat = Vec::with_capacity(samples.len() * width);
    for s in samples {
        if s.features().len() != width {
            return Err(StrideError::ShapeMismatch {
                expected: width,
                actual: s.features().len(),
            });
        }
        flat.extend_from_slice(s.features());
    }
    Array2::from_shape_vec((samples.len(), width), flat)
        .map_err(|e| StrideError::InvalidConfig(format!("feature matrix shape: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::RandomSource;
    use crate::types::Provenance;

    fn cloud(n: usize, center: f64, spread: f64, rng: &mut RandomSource, provenance: Provenance) -> Vec<StrideSample> {
        (0..n)
            .map(|_| {
                let a = center + rng.normal(spread);
                let b = 2.0 * center + rng.normal(spread);
                let c = a * 0.5 + rng.normal(spread * 0.3);
                let d = center - rng.normal(spread);
                StrideSample::new(vec![a, b, c, d], 1.0, 0.0, provenance)
            })
            .collect()
    }

    #[test]
    fn test_percentile_100_keeps_all_reference() {
        let mut rng = RandomSource::new(10);
        let reference = cloud(40, 1.0, 0.5, &mut rng, Provenance::Reference);
        let gate = ReferenceDistribution::fit(&reference, 100.0).unwrap();
        let kept = gate.apply(&reference).unwrap();
        assert_eq!(kept.len(), reference.len());
        for d in gate.distances(&reference).unwrap() {
            assert!(d <= gate.threshold());
        }
    }

    #[test]
    fn test_percentile_98_drops_at_least_one() {
        let mut rng = RandomSource::new(11);
        let reference = cloud(25, 1.0, 0.5, &mut rng, Provenance::Reference);
        let gate = ReferenceDistribution::fit(&reference, 98.0).unwrap();
        let kept = gate.apply(&reference).unwrap();
        assert!(kept.len() <= (25.0_f64 * 0.98).ceil() as usize);
        assert!(kept.len() < reference.len());
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut rng = RandomSource::new(12);
        let reference = cloud(30, 0.0, 1.0, &mut rng, Provenance::Reference);
        let mut target = cloud(20, 0.5, 1.5, &mut rng, Provenance::Target);
        target.extend(cloud(5, 8.0, 0.1, &mut rng, Provenance::Target));
        let gate = ReferenceDistribution::fit(&reference, 90.0).unwrap();
        let once = gate.apply(&target).unwrap();
        let twice = gate.apply(&once).unwrap();
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.features(), b.features());
        }
    }

    #[test]
    fn test_far_target_rejected_by_reference_calibration() {
        let mut rng = RandomSource::new(13);
        let reference = cloud(50, 0.0, 1.0, &mut rng, Provenance::Reference);
        let far = cloud(10, 50.0, 0.1, &mut rng, Provenance::Target);
        let gate = ReferenceDistribution::fit(&reference, 99.0).unwrap();
        assert!(gate.apply(&far).unwrap().is_empty());
        let far_row = ndarray::Array1::from(far[0].features().to_vec());
        assert!(!gate.accepts(far_row.view()).unwrap());
        // Threshold is untouched by applying to target data.
        let before = gate.threshold();
        let _ = gate.apply(&far).unwrap();
        assert_eq!(before, gate.threshold());
    }

    #[test]
    fn test_constant_feature_column_is_regularized() {
        let mut rng = RandomSource::new(14);
        let reference: Vec<StrideSample> = (0..20)
            .map(|_| StrideSample::new(vec![rng.normal(1.0), 3.0, rng.normal(1.0)], 1.0, 0.0, Provenance::Reference))
            .collect();
        let gate = ReferenceDistribution::fit(&reference, 95.0).unwrap();
        assert!(gate.threshold().is_finite());
        assert_eq!(gate.dim(), 3);
    }

    #[test]
    fn test_fit_rejects_tiny_or_invalid_input() {
        let one = vec![StrideSample::new(vec![1.0, 2.0], 1.0, 0.0, Provenance::Reference)];
        assert!(ReferenceDistribution::fit(&one, 98.0).is_err());
        assert!(ReferenceDistribution::fit(&[], 98.0).is_err());
        let two = vec![one[0].clone(), StrideSample::new(vec![2.0, 1.0], 1.0, 0.0, Provenance::Reference)];
        assert!(ReferenceDistribution::fit(&two, 101.0).is_err());
    }

    #[test]
    fn test_filter_trials_drops_empty_trials() {
        let mut rng = RandomSource::new(16);
        let reference = cloud(40, 0.0, 1.0, &mut rng, Provenance::Reference);
        let gate = ReferenceDistribution::fit(&reference, 99.0).unwrap();
        let trials = vec![
            TrialSamples {
                name: "near".to_string(),
                provenance: Provenance::Target,
                samples: cloud(10, 0.0, 0.2, &mut rng, Provenance::Target),
            },
            TrialSamples {
                name: "far".to_string(),
                provenance: Provenance::Target,
                samples: cloud(10, 40.0, 0.1, &mut rng, Provenance::Target),
            },
        ];
        let kept = gate.filter_trials(trials).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "near");
    }

    #[test]
    fn test_single_row_distance_matches_batch() {
        let mut rng = RandomSource::new(15);
        let reference = cloud(30, 1.0, 0.5, &mut rng, Provenance::Reference);
        let gate = ReferenceDistribution::fit(&reference, 98.0).unwrap();
        let batch = gate.distances(&reference[..3]).unwrap();
        for (s, d) in reference[..3].iter().zip(batch) {
            let row = ndarray::Array1::from(s.features().to_vec());
            let single = gate.distance(row.view()).unwrap();
            assert!((single - d).abs() < 1e-9);
        }
    }
}
