//! Linear algebra glue between the ndarray tables and nalgebra solvers.
//!
//! Feature tables live in ndarray; anything needing a factorization or an
//! inverse crosses over to nalgebra through these helpers.

use nalgebra::{DMatrix, DVector};
use ndarray::{ArrayView1, ArrayView2};

// ===== Feature Dimensions =====
pub const AXES: usize = 3;
pub const TIME_FEATURES_PER_AXIS: usize = 10;
pub const FREQ_FEATURES_PER_AXIS: usize = 6;
pub const WAVELET_FEATURES_PER_AXIS: usize = 3;
pub const ENVELOPE_FEATURES_PER_AXIS: usize = 8;
pub const SEGMENT_SCALARS: usize = 2;

pub const FEATURE_DIM: usize = AXES
    * (TIME_FEATURES_PER_AXIS
        + FREQ_FEATURES_PER_AXIS
        + WAVELET_FEATURES_PER_AXIS
        + ENVELOPE_FEATURES_PER_AXIS)
    + SEGMENT_SCALARS; // 83

pub type FeatureMatrix = DMatrix<f64>;
pub type FeatureVector = DVector<f64>;

pub fn matrix_from_nd(array: ArrayView2<f64>) -> FeatureMatrix {
    let (rows, cols) = array.dim();
    DMatrix::from_fn(rows, cols, |r, c| array[[r, c]])
}

pub fn vector_from_nd(array: ArrayView1<f64>) -> FeatureVector {
    DVector::from_iterator(array.len(), array.iter().copied())
}

/// `d^T * m * d`
pub fn quadratic_form(m: &FeatureMatrix, d: &FeatureVector) -> f64 {
    (d.transpose() * m * d)[(0, 0)]
}
