//! Synthetic and jittered stride samples.

use std::f64::consts::PI;

use ndarray::{Array1, Array2};

use crate::error::{Result, StrideError};
use crate::random::RandomSource;
use crate::types::FeatureTable;

// Synthetic rows
const SYNTH_FEATURE_NOISE: f64 = 0.02;
const SYNTH_DISTANCE_SCALE: (f64, f64) = (0.95, 1.05);
const SYNTH_HEADING_JITTER: f64 = 0.02;

// Augmentation passes
const AUG_FEATURE_SCALE: (f64, f64) = (0.98, 1.02);
const AUG_FEATURE_NOISE: f64 = 0.01;
const AUG_DISTANCE_SCALE: (f64, f64) = (0.99, 1.01);
const AUG_HEADING_JITTER: f64 = 0.005;

/// Wrap an angle into (−π, π].
pub fn wrap_heading(heading: f64) -> f64 {
    let wrapped = (heading + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped <= -PI {
        PI
    } else {
        wrapped
    }
}

/// `n_samples` new rows, each a perturbed copy of a row drawn with replacement.
pub fn synthesize(table: &FeatureTable, n_samples: usize, rng: &mut RandomSource) -> Result<FeatureTable> {
    if table.is_empty() {
        return Err(StrideError::EmptyDataset("cannot synthesize from an empty table".to_string()));
    }
    let width = table.width();
    let mut features = Array2::<f64>::zeros((n_samples, width));
    let mut distance = Array1::<f64>::zeros(n_samples);
    let mut heading = Array1::<f64>::zeros(n_samples);

    for i in 0..n_samples {
        let src = rng.index(table.len());
        for j in 0..width {
            let v = table.features[[src, j]];
            features[[i, j]] = v + rng.normal(SYNTH_FEATURE_NOISE * v.abs());
        }
        distance[i] = table.distance[src] * rng.uniform(SYNTH_DISTANCE_SCALE.0, SYNTH_DISTANCE_SCALE.1);
        heading[i] = wrap_heading(
            table.heading[src] + rng.uniform(-SYNTH_HEADING_JITTER, SYNTH_HEADING_JITTER),
        );
    }

    Ok(FeatureTable {
        columns: table.columns.clone(),
        features,
        distance,
        heading,
    })
}

/// `times` jittered passes over every row, in row order.
pub fn augment(table: &FeatureTable, times: usize, rng: &mut RandomSource) -> FeatureTable {
    let n = table.len();
    let width = table.width();
    let total = n * times;
    let mut features = Array2::<f64>::zeros((total, width));
    let mut distance = Array1::<f64>::zeros(total);
    let mut heading = Array1::<f64>::zeros(total);

    for pass in 0..times {
        for src in 0..n {
            let i = pass * n + src;
            for j in 0..width {
                let scaled = table.features[[src, j]] * rng.uniform(AUG_FEATURE_SCALE.0, AUG_FEATURE_SCALE.1);
                features[[i, j]] = scaled + rng.normal(AUG_FEATURE_NOISE * scaled.abs());
            }
            distance[i] = table.distance[src] * rng.uniform(AUG_DISTANCE_SCALE.0, AUG_DISTANCE_SCALE.1);
            heading[i] = wrap_heading(
                table.heading[src] + rng.uniform(-AUG_HEADING_JITTER, AUG_HEADING_JITTER),
            );
        }
    }

    FeatureTable {
        columns: table.columns.clone(),
        features,
        distance,
        heading,
    }
}
