//! Mini-batches over a scaled feature table.

use candle_core::{Device, Tensor};

use crate::error::Result;
use crate::model::features_tensor;
use crate::random::RandomSource;
use crate::types::FeatureTable;

/// Which regression target a model learns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Distance,
    Heading,
}

pub struct Batch {
    pub features: Tensor,
    pub distance: Tensor,
    pub heading: Tensor,
}

impl Batch {
    pub fn target(&self, target: Target) -> &Tensor {
        match target {
            Target::Distance => &self.distance,
            Target::Heading => &self.heading,
        }
    }
}

pub struct BatchLoader<'a> {
    table: &'a FeatureTable,
    batch_size: usize,
    /// Batches smaller than this are skipped.
    min_batch: usize,
}

impl<'a> BatchLoader<'a> {
    /// Training loader; a trailing single-row batch is dropped since batch
    /// norm cannot normalize one row.
    pub fn train(table: &'a FeatureTable, batch_size: usize) -> Self {
        Self {
            table,
            batch_size: batch_size.max(1),
            min_batch: 2,
        }
    }

    pub fn eval(table: &'a FeatureTable, batch_size: usize) -> Self {
        Self {
            table,
            batch_size: batch_size.max(1),
            min_batch: 1,
        }
    }

    /// Row indices per batch; shuffled when `rng` is given.
    pub fn batches(&self, rng: Option<&mut RandomSource>) -> Vec<Vec<usize>> {
        let order = match rng {
            Some(r) => r.permutation(self.table.len()),
            None => (0..self.table.len()).collect(),
        };
        order
            .chunks(self.batch_size)
            .filter(|chunk| chunk.len() >= self.min_batch)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    pub fn load(&self, indices: &[usize], device: &Device) -> Result<Batch> {
        let rows = self.table.select(indices);
        let n = indices.len();
        let column = |values: &ndarray::Array1<f64>| -> Result<Tensor> {
            let v: Vec<f32> = values.iter().map(|x| *x as f32).collect();
            Ok(Tensor::from_vec(v, (n, 1), device)?)
        };
        Ok(Batch {
            features: features_tensor(rows.features.view(), device)?,
            distance: column(&rows.distance)?,
            heading: column(&rows.heading)?,
        })
    }
}
