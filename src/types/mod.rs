pub mod linalg;

pub use linalg::{AXES, FEATURE_DIM};

use std::f64::consts::PI;

use ndarray::{concatenate, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::augment::wrap_heading;
use crate::error::{Result, StrideError};

/// Which side of the outlier gate calibration a trial belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// Trusted trials; the gate is fit on these only.
    Reference,
    Target,
}

/// One stride: feature vector plus ground-truth displacement and heading.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrideSample {
    features: Vec<f64>,
    distance: f64,
    heading: f64,
    provenance: Provenance,
}

impl StrideSample {
    /// Non-finite features are zeroed here so nothing downstream sees NaN/inf.
    /// A heading outside (−π, π] is wrapped into it.
    pub fn new(mut features: Vec<f64>, distance: f64, heading: f64, provenance: Provenance) -> Self {
        for v in features.iter_mut() {
            if !v.is_finite() {
                *v = 0.0;
            }
        }
        let heading = if heading > -PI && heading <= PI {
            heading
        } else {
            wrap_heading(heading)
        };
        Self {
            features,
            distance,
            heading,
            provenance,
        }
    }

    pub fn features(&self) -> &[f64] {
        &self.features
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn heading(&self) -> f64 {
        self.heading
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }
}

/// Stride samples loaded from one trial file.
#[derive(Clone, Debug)]
pub struct TrialSamples {
    pub name: String,
    pub provenance: Provenance,
    pub samples: Vec<StrideSample>,
}

/// Rectangular feature/target table used from gating onwards.
#[derive(Clone, Debug)]
pub struct FeatureTable {
    pub columns: Vec<String>,
    pub features: Array2<f64>,
    pub distance: Array1<f64>,
    pub heading: Array1<f64>,
}

pub fn feature_column_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("feat_{}", i)).collect()
}

impl FeatureTable {
    pub fn from_samples(samples: &[StrideSample]) -> Result<Self> {
        let first = samples
            .first()
            .ok_or_else(|| StrideError::EmptyDataset("no stride samples".to_string()))?;
        let width = first.features().len();

        let mut flat = Vec::with_capacity(samples.len() * width);
        for (row, sample) in samples.iter().enumerate() {
            if !sample.distance().is_finite() || !sample.heading().is_finite() {
                return Err(StrideError::NonFiniteTarget { row });
            }
            if sample.features().len() != width {
                return Err(StrideError::ShapeMismatch {
                    expected: width,
                    actual: sample.features().len(),
                });
            }
            flat.extend_from_slice(sample.features());
        }

        let features = Array2::from_shape_vec((samples.len(), width), flat)
            .map_err(|e| StrideError::InvalidConfig(format!("feature table shape: {e}")))?;
        let distance = samples.iter().map(|s| s.distance()).collect();
        let heading = samples.iter().map(|s| s.heading()).collect();

        Ok(Self {
            columns: feature_column_names(width),
            features,
            distance,
            heading,
        })
    }

    pub fn len(&self) -> usize {
        self.features.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn width(&self) -> usize {
        self.features.ncols()
    }

    /// Rows appended below `self`.
    pub fn concat(&self, other: &FeatureTable) -> Result<FeatureTable> {
        if other.width() != self.width() {
            return Err(StrideError::ShapeMismatch {
                expected: self.width(),
                actual: other.width(),
            });
        }
        let features = concatenate(Axis(0), &[self.features.view(), other.features.view()])
            .map_err(|e| StrideError::InvalidConfig(format!("concat features: {e}")))?;
        let distance = concatenate(Axis(0), &[self.distance.view(), other.distance.view()])
            .map_err(|e| StrideError::InvalidConfig(format!("concat distance: {e}")))?;
        let heading = concatenate(Axis(0), &[self.heading.view(), other.heading.view()])
            .map_err(|e| StrideError::InvalidConfig(format!("concat heading: {e}")))?;
        Ok(FeatureTable {
            columns: self.columns.clone(),
            features,
            distance,
            heading,
        })
    }

    /// Rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> FeatureTable {
        FeatureTable {
            columns: self.columns.clone(),
            features: self.features.select(Axis(0), indices),
            distance: self.distance.select(Axis(0), indices),
            heading: self.heading.select(Axis(0), indices),
        }
    }

    /// Shuffle-then-cut split; returns `(kept, held_out)` with
    /// `ceil(len * fraction)` rows held out, as sklearn's `train_test_split` does.
    pub fn split(&self, fraction: f64, order: &[usize]) -> (FeatureTable, FeatureTable) {
        let n = self.len();
        let held = ((n as f64) * fraction).ceil() as usize;
        let held = held.min(n);
        let (held_idx, kept_idx) = order.split_at(held);
        (self.select(kept_idx), self.select(held_idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(v: f64) -> StrideSample {
        StrideSample::new(vec![v, v * 2.0, v * 3.0], v, 0.1, Provenance::Target)
    }

    #[test]
    fn test_non_finite_features_zeroed() {
        let s = StrideSample::new(
            vec![f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1.5],
            1.0,
            0.0,
            Provenance::Reference,
        );
        assert_eq!(s.features(), &[0.0, 0.0, 0.0, 1.5]);
    }

    #[test]
    fn test_heading_minus_pi_maps_to_pi() {
        let s = StrideSample::new(vec![1.0], 1.0, -PI, Provenance::Target);
        assert_eq!(s.heading(), PI);
        let inside = StrideSample::new(vec![1.0], 1.0, -3.0, Provenance::Target);
        assert_eq!(inside.heading(), -3.0);
    }

    #[test]
    fn test_non_finite_targets_rejected() {
        let bad = StrideSample::new(vec![1.0, 2.0, 3.0], f64::NAN, 0.0, Provenance::Target);
        assert!(matches!(
            FeatureTable::from_samples(&[sample(1.0), bad]),
            Err(StrideError::NonFiniteTarget { row: 1 })
        ));
    }

    #[test]
    fn test_table_from_samples() {
        let table = FeatureTable::from_samples(&[sample(1.0), sample(2.0)]).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.width(), 3);
        assert_eq!(table.columns, vec!["feat_0", "feat_1", "feat_2"]);
        assert_eq!(table.features[[1, 2]], 6.0);
    }

    #[test]
    fn test_empty_samples_rejected() {
        assert!(FeatureTable::from_samples(&[]).is_err());
    }

    #[test]
    fn test_ragged_samples_rejected() {
        let bad = StrideSample::new(vec![1.0], 1.0, 0.0, Provenance::Target);
        assert!(FeatureTable::from_samples(&[sample(1.0), bad]).is_err());
    }

    #[test]
    fn test_split_sizes() {
        let samples: Vec<_> = (0..10).map(|i| sample(i as f64)).collect();
        let table = FeatureTable::from_samples(&samples).unwrap();
        let order: Vec<usize> = (0..10).rev().collect();
        let (kept, held) = table.split(0.2, &order);
        assert_eq!(held.len(), 2);
        assert_eq!(kept.len(), 8);
        assert_eq!(held.distance[0], 9.0);
    }

    #[test]
    fn test_concat() {
        let a = FeatureTable::from_samples(&[sample(1.0)]).unwrap();
        let b = FeatureTable::from_samples(&[sample(2.0), sample(3.0)]).unwrap();
        let c = a.concat(&b).unwrap();
        assert_eq!(c.len(), 3);
        assert_eq!(c.distance.to_vec(), vec![1.0, 2.0, 3.0]);
    }
}
