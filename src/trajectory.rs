//! Polar stride deltas and planar trajectory reconstruction.
//!
//! A walk is summarized as one `(displacement, heading)` pair per stride;
//! chaining them from the first control point rebuilds the 2-D path.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolarStride {
    pub displacement: f64,
    /// Absolute direction of travel, radians from +x.
    pub heading: f64,
}

impl PolarStride {
    pub fn delta(&self) -> Vector2<f64> {
        Vector2::new(
            self.displacement * self.heading.cos(),
            self.displacement * self.heading.sin(),
        )
    }
}

/// Deltas between consecutive planar points.
pub fn polar_deltas(points: &[Vector2<f64>]) -> Vec<PolarStride> {
    points
        .windows(2)
        .map(|w| {
            let d = w[1] - w[0];
            PolarStride {
                displacement: d.norm(),
                heading: d.y.atan2(d.x),
            }
        })
        .collect()
}

/// Positions starting at `origin`, one more than there are strides.
pub fn reconstruct(strides: &[PolarStride], origin: Vector2<f64>) -> Vec<Vector2<f64>> {
    let mut path = Vec::with_capacity(strides.len() + 1);
    path.push(origin);
    let mut current = origin;
    for stride in strides {
        current += stride.delta();
        path.push(current);
    }
    path
}

/// Largest Euclidean gap between two equally long paths.
pub fn max_deviation(a: &[Vector2<f64>], b: &[Vector2<f64>]) -> f64 {
    a.iter().zip(b).map(|(p, q)| (p - q).norm()).fold(0.0, f64::max)
}

/// Vertical comparison series as paired for plotting: ground-truth Z next to
/// the reconstructed path's Y component. These are different axes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerticalComparison {
    pub ground_truth_z: Vec<f64>,
    pub reconstructed_y: Vec<f64>,
    pub axis_mismatch: bool,
}

impl VerticalComparison {
    pub fn new(ground_truth_z: Vec<f64>, reconstructed: &[Vector2<f64>]) -> Self {
        Self {
            ground_truth_z,
            reconstructed_y: reconstructed.iter().map(|p| p.y).collect(),
            axis_mismatch: true,
        }
    }
}
