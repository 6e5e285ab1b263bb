//! Dual-target training: grid search over hyperparameters, each combination
//! fitting a distance model and a heading model side by side.

pub mod early_stop;
pub mod loader;
pub mod loss;

use std::time::Instant;

use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};

use crate::config::{HyperparameterGrid, HyperparameterSet, PipelineConfig, RegressorConfig};
use crate::error::{Result, StrideError};
use crate::model::{SequenceRegressor, TrainedModelPair};
use crate::random::RandomSource;
use crate::scaler::{QuantileScaler, Scaler, ScalerSet};
use crate::types::FeatureTable;
use early_stop::{EarlyStopping, StopDecision};
use loader::{BatchLoader, Target};
use loss::{clip_grad_norm, huber_loss};

#[derive(Clone, Debug)]
pub struct TrainerSettings {
    pub patience: usize,
    pub max_epochs: usize,
    pub min_improvement: f64,
    pub weight_decay: f64,
    pub huber_delta: f64,
    pub grad_clip_norm: f64,
}

impl From<&PipelineConfig> for TrainerSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            patience: config.patience,
            max_epochs: config.max_epochs,
            min_improvement: config.min_improvement,
            weight_decay: config.weight_decay,
            huber_delta: config.huber_delta,
            grad_clip_norm: config.grad_clip_norm,
        }
    }
}

/// Errors in original target units.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub mse: f64,
    pub mae: f64,
}

impl ErrorMetrics {
    pub fn between(targets: &[f64], preds: &[f64]) -> Self {
        let n = targets.len().max(1) as f64;
        let (sq, abs) = targets
            .iter()
            .zip(preds)
            .fold((0.0, 0.0), |(sq, abs), (t, p)| (sq + (t - p).powi(2), abs + (t - p).abs()));
        Self {
            mse: sq / n,
            mae: abs / n,
        }
    }
}

/// Held-out evaluation of the winning pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestReport {
    pub samples: usize,
    pub distance: ErrorMetrics,
    pub heading: ErrorMetrics,
}

/// Run `model` over `table` (scaled space) and score it in original units:
/// both predictions and targets go through the target scaler's inverse.
pub fn evaluate(
    model: &SequenceRegressor,
    table: &FeatureTable,
    target: Target,
    scaler: &QuantileScaler,
    batch_size: usize,
    device: &Device,
) -> Result<ErrorMetrics> {
    let loader = BatchLoader::eval(table, batch_size);
    let mut preds = Vec::with_capacity(table.len());
    for indices in loader.batches(None) {
        let batch = loader.load(&indices, device)?;
        preds.extend(model.predict(&batch.features)?.into_iter().map(f64::from));
    }
    let scaled_targets = match target {
        Target::Distance => &table.distance,
        Target::Heading => &table.heading,
    };
    let preds = scaler.inverse_transform_column(ndarray::Array1::from(preds).view())?;
    let targets = scaler.inverse_transform_column(scaled_targets.view())?;
    Ok(ErrorMetrics::between(&targets.to_vec(), &preds.to_vec()))
}

pub fn test_report(
    models: &TrainedModelPair,
    test: &FeatureTable,
    scalers: &ScalerSet,
    batch_size: usize,
    device: &Device,
) -> Result<TestReport> {
    Ok(TestReport {
        samples: test.len(),
        distance: evaluate(&models.distance, test, Target::Distance, &scalers.distance, batch_size, device)?,
        heading: evaluate(&models.heading, test, Target::Heading, &scalers.heading, batch_size, device)?,
    })
}

/// Index and score of the strictly lowest defined score; earliest wins ties.
pub fn select_best(scores: &[Option<f64>]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (i, score) in scores.iter().enumerate() {
        let s = match score {
            Some(s) if s.is_finite() => *s,
            _ => continue,
        };
        match best {
            Some((_, b)) if s >= b => {}
            _ => best = Some((i, s)),
        }
    }
    best
}

/// What one grid point produced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CombinationOutcome {
    pub index: usize,
    pub params: HyperparameterSet,
    /// Best average validation MSE; `None` when training diverged.
    pub score: Option<f64>,
    pub best_epoch: Option<usize>,
    pub epochs_run: usize,
    pub elapsed_secs: f64,
}

pub struct GridSearchOutcome {
    pub outcomes: Vec<CombinationOutcome>,
    pub best_index: usize,
    pub best_score: f64,
    pub best_params: HyperparameterSet,
    pub models: TrainedModelPair,
}

/// One model with its optimizer.
struct Learner {
    model: SequenceRegressor,
    opt: AdamW,
    target: Target,
}

impl Learner {
    fn new(
        config: &RegressorConfig,
        params: &HyperparameterSet,
        settings: &TrainerSettings,
        target: Target,
        rng: &mut RandomSource,
        device: &Device,
    ) -> Result<Self> {
        let model = SequenceRegressor::new(config, rng, device)?;
        let opt = AdamW::new(
            model.vars(),
            ParamsAdamW {
                lr: params.learning_rate,
                weight_decay: settings.weight_decay,
                ..Default::default()
            },
        )?;
        Ok(Self { model, opt, target })
    }

    /// One optimizer step; returns the batch loss.
    fn step(&mut self, batch: &loader::Batch, settings: &TrainerSettings, dropout_rng: &mut RandomSource) -> Result<f64> {
        let pred = self.model.forward_train(&batch.features, dropout_rng)?;
        let loss = huber_loss(&pred, batch.target(self.target), settings.huber_delta)?;
        let loss_value = f64::from(loss.to_scalar::<f32>()?);
        if !loss_value.is_finite() {
            return Ok(loss_value);
        }
        let mut grads = loss.backward()?;
        clip_grad_norm(&mut grads, &self.model.vars(), settings.grad_clip_norm)?;
        self.opt.step(&grads)?;
        Ok(loss_value)
    }
}

pub struct DualTargetTrainer<'a> {
    settings: TrainerSettings,
    scalers: &'a ScalerSet,
    device: Device,
}

impl<'a> DualTargetTrainer<'a> {
    pub fn new(settings: TrainerSettings, scalers: &'a ScalerSet, device: Device) -> Self {
        Self {
            settings,
            scalers,
            device,
        }
    }

    /// Train both models for one grid point. `None` models when it diverged.
    pub fn train_combination(
        &self,
        index: usize,
        params: &HyperparameterSet,
        train: &FeatureTable,
        val: &FeatureTable,
        rng: &RandomSource,
    ) -> Result<(CombinationOutcome, Option<TrainedModelPair>)> {
        let started = Instant::now();
        let tag = index.to_string();
        let mut init_rng = rng.stream("init").stream(&tag);
        let mut loader_rng = rng.stream("loader").stream(&tag);
        let mut dropout_rng = rng.stream("dropout").stream(&tag);

        let config = RegressorConfig::from_hyperparameters(train.width(), params);
        let mut dist = Learner::new(&config, params, &self.settings, Target::Distance, &mut init_rng, &self.device)?;
        let mut head = Learner::new(&config, params, &self.settings, Target::Heading, &mut init_rng, &self.device)?;
        log::debug!(
            "[train] combination {}: {} parameters per model",
            index + 1,
            dist.model.parameter_count()
        );

        let train_loader = BatchLoader::train(train, params.batch_size);
        let val_batch = params.batch_size * 2;

        let mut stopper = EarlyStopping::new(self.settings.patience, self.settings.min_improvement);
        let mut best = None;
        let mut epochs_run = 0;
        let mut diverged = false;

        'epochs: for epoch in 0..self.settings.max_epochs {
            epochs_run = epoch + 1;
            let mut total_loss = 0.0;
            for indices in train_loader.batches(Some(&mut loader_rng)) {
                let batch = train_loader.load(&indices, &self.device)?;
                let ld = dist.step(&batch, &self.settings, &mut dropout_rng)?;
                let lh = head.step(&batch, &self.settings, &mut dropout_rng)?;
                if !ld.is_finite() || !lh.is_finite() {
                    log::warn!("[train] combination {}: non-finite loss at epoch {}", index + 1, epoch);
                    diverged = true;
                    break 'epochs;
                }
                total_loss += ld + lh;
            }

            let mse_d = evaluate(&dist.model, val, Target::Distance, &self.scalers.distance, val_batch, &self.device)?.mse;
            let mse_h = evaluate(&head.model, val, Target::Heading, &self.scalers.heading, val_batch, &self.device)?.mse;
            let avg = (mse_d + mse_h) / 2.0;
            if !avg.is_finite() {
                log::warn!("[train] combination {}: non-finite validation error at epoch {}", index + 1, epoch);
                diverged = true;
                break;
            }
            log::debug!(
                "[train] epoch {} loss {:.5} val dist {:.5} head {:.5} avg {:.5}",
                epoch,
                total_loss,
                mse_d,
                mse_h,
                avg
            );

            match stopper.update(epoch, avg) {
                StopDecision::Improved => {
                    best = Some((dist.model.snapshot()?, head.model.snapshot()?));
                }
                StopDecision::Wait => {}
                StopDecision::Stop => break,
            }
        }

        let mut outcome = CombinationOutcome {
            index,
            params: params.clone(),
            score: None,
            best_epoch: stopper.best_epoch(),
            epochs_run,
            elapsed_secs: started.elapsed().as_secs_f64(),
        };
        if diverged {
            return Ok((outcome, None));
        }
        let (dist_snap, head_snap) = match best {
            Some(b) => b,
            None => return Ok((outcome, None)),
        };
        dist.model.restore(&dist_snap)?;
        head.model.restore(&head_snap)?;
        outcome.score = stopper.best();
        Ok((
            outcome,
            Some(TrainedModelPair {
                distance: dist.model,
                heading: head.model,
            }),
        ))
    }

    /// Every grid point in order; keeps the winning pair only.
    pub fn grid_search(
        &self,
        grid: &HyperparameterGrid,
        train: &FeatureTable,
        val: &FeatureTable,
        rng: &RandomSource,
    ) -> Result<GridSearchOutcome> {
        let combos = grid.combinations();
        log::info!("[train] grid search over {} combinations", combos.len());

        let mut outcomes = Vec::with_capacity(combos.len());
        let mut scores = Vec::with_capacity(combos.len());
        let mut best_models: Option<TrainedModelPair> = None;

        for (i, params) in combos.iter().enumerate() {
            log::info!("[train] combination {}/{}: {:?}", i + 1, combos.len(), params);
            let (outcome, models) = self.train_combination(i, params, train, val, rng)?;
            match outcome.score {
                Some(score) => log::info!(
                    "[train] combination {} score {:.4} (best epoch {:?}, {} epochs, {:.1}s)",
                    i + 1,
                    score,
                    outcome.best_epoch,
                    outcome.epochs_run,
                    outcome.elapsed_secs
                ),
                None => log::warn!(
                    "[train] combination {} did not converge ({:.1}s)",
                    i + 1,
                    outcome.elapsed_secs
                ),
            }

            let previous_best = select_best(&scores);
            scores.push(outcome.score);
            if select_best(&scores).map(|(idx, _)| idx) != previous_best.map(|(idx, _)| idx) {
                if let Some(score) = outcome.score {
                    log::info!("[train] new best score {:.4}", score);
                }
                best_models = models;
            }
            outcomes.push(outcome);
        }

        let (best_index, best_score) =
            select_best(&scores).ok_or(StrideError::NoConvergentCombination(combos.len()))?;
        let models = best_models.ok_or(StrideError::NoConvergentCombination(combos.len()))?;
        Ok(GridSearchOutcome {
            best_params: combos[best_index].clone(),
            outcomes,
            best_index,
            best_score,
            models,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Provenance, StrideSample};

    #[test]
    fn test_select_best_prefers_lower_score() {
        assert_eq!(select_best(&[Some(0.30), Some(0.25)]), Some((1, 0.25)));
    }

    #[test]
    fn test_select_best_ties_keep_first_and_skips_undefined() {
        assert_eq!(select_best(&[None, Some(0.4), Some(0.4)]), Some((1, 0.4)));
        assert_eq!(select_best(&[Some(f64::NAN), Some(0.9)]), Some((1, 0.9)));
        assert_eq!(select_best(&[None, None]), None);
        assert_eq!(select_best(&[]), None);
    }

    #[test]
    fn test_error_metrics() {
        let m = ErrorMetrics::between(&[1.0, 2.0, 3.0], &[1.0, 3.0, 1.0]);
        assert!((m.mse - 5.0 / 3.0).abs() < 1e-12);
        assert!((m.mae - 1.0).abs() < 1e-12);
    }

    fn synthetic_table(n: usize, rng: &mut RandomSource) -> FeatureTable {
        let samples: Vec<StrideSample> = (0..n)
            .map(|_| {
                let a = rng.uniform(-1.0, 1.0);
                let b = rng.uniform(-1.0, 1.0);
                let c = rng.uniform(-1.0, 1.0);
                StrideSample::new(vec![a, b, c], 0.7 + 0.2 * a, 0.5 * b, Provenance::Target)
            })
            .collect();
        FeatureTable::from_samples(&samples).unwrap()
    }

    fn tiny_grid() -> HyperparameterGrid {
        HyperparameterGrid {
            learning_rate: vec![0.005],
            batch_size: vec![16],
            hidden_size: vec![8],
            num_layers: vec![1, 2],
            dropout: vec![0.1],
        }
    }

    #[test]
    fn test_grid_search_on_tiny_problem() {
        let mut rng = RandomSource::new(10);
        let raw_train = synthetic_table(80, &mut rng);
        let raw_val = synthetic_table(20, &mut rng);
        let scalers = ScalerSet::fit(&raw_train, 500).unwrap();
        let train = scalers.transform(&raw_train).unwrap();
        let val = scalers.transform(&raw_val).unwrap();

        let settings = TrainerSettings {
            patience: 3,
            max_epochs: 6,
            min_improvement: 0.001,
            weight_decay: 1e-4,
            huber_delta: 0.5,
            grad_clip_norm: 1.0,
        };
        let trainer = DualTargetTrainer::new(settings, &scalers, Device::Cpu);
        let result = trainer.grid_search(&tiny_grid(), &train, &val, &rng).unwrap();

        assert_eq!(result.outcomes.len(), 2);
        assert!(result.best_score.is_finite());
        for o in &result.outcomes {
            assert!(o.epochs_run >= 1 && o.epochs_run <= 6);
        }
        let best = &result.outcomes[result.best_index];
        assert_eq!(best.score, Some(result.best_score));
        assert_eq!(result.best_params, best.params);

        let report = test_report(&result.models, &val, &scalers, 32, &Device::Cpu).unwrap();
        assert_eq!(report.samples, 20);
        assert!(report.distance.mse.is_finite() && report.heading.mae.is_finite());
    }

    #[test]
    fn test_restored_models_reproduce_best_score() {
        let mut rng = RandomSource::new(11);
        let raw_train = synthetic_table(64, &mut rng);
        let raw_val = synthetic_table(16, &mut rng);
        let scalers = ScalerSet::fit(&raw_train, 500).unwrap();
        let train = scalers.transform(&raw_train).unwrap();
        let val = scalers.transform(&raw_val).unwrap();
        let settings = TrainerSettings {
            patience: 2,
            max_epochs: 5,
            min_improvement: 0.001,
            weight_decay: 1e-4,
            huber_delta: 0.5,
            grad_clip_norm: 1.0,
        };
        let trainer = DualTargetTrainer::new(settings, &scalers, Device::Cpu);
        let params = tiny_grid().combinations()[0].clone();
        let (outcome, models) = trainer.train_combination(0, &params, &train, &val, &rng).unwrap();
        let models = models.unwrap();
        let d = evaluate(&models.distance, &val, Target::Distance, &scalers.distance, 32, &Device::Cpu).unwrap();
        let h = evaluate(&models.heading, &val, Target::Heading, &scalers.heading, 32, &Device::Cpu).unwrap();
        let score = outcome.score.unwrap();
        assert!(((d.mse + h.mse) / 2.0 - score).abs() < 1e-9);
    }

    fn quick_settings() -> TrainerSettings {
        TrainerSettings {
            patience: 2,
            max_epochs: 3,
            min_improvement: 0.001,
            weight_decay: 1e-4,
            huber_delta: 0.5,
            grad_clip_norm: 1.0,
        }
    }

    #[test]
    fn test_nan_target_marks_combination_non_convergent() {
        let mut rng = RandomSource::new(12);
        let raw_train = synthetic_table(48, &mut rng);
        let raw_val = synthetic_table(16, &mut rng);
        let scalers = ScalerSet::fit(&raw_train, 500).unwrap();
        let mut train = scalers.transform(&raw_train).unwrap();
        let val = scalers.transform(&raw_val).unwrap();
        train.distance[3] = f64::NAN;

        let trainer = DualTargetTrainer::new(quick_settings(), &scalers, Device::Cpu);
        let grid = HyperparameterGrid {
            num_layers: vec![1],
            ..tiny_grid()
        };
        let params = grid.combinations()[0].clone();
        let (outcome, models) = trainer.train_combination(0, &params, &train, &val, &rng).unwrap();
        assert_eq!(outcome.score, None);
        assert!(models.is_none());
        assert_eq!(outcome.epochs_run, 1);

        let result = trainer.grid_search(&grid, &train, &val, &rng);
        assert!(matches!(result, Err(StrideError::NoConvergentCombination(1))));
    }

    #[test]
    fn test_diverging_combination_is_skipped_by_selection() {
        let mut rng = RandomSource::new(13);
        let raw_train = synthetic_table(64, &mut rng);
        let raw_val = synthetic_table(16, &mut rng);
        let scalers = ScalerSet::fit(&raw_train, 500).unwrap();
        let train = scalers.transform(&raw_train).unwrap();
        let val = scalers.transform(&raw_val).unwrap();

        // An infinite step size blows the weights up after the first update.
        let grid = HyperparameterGrid {
            learning_rate: vec![f64::INFINITY, 0.005],
            num_layers: vec![1],
            ..tiny_grid()
        };
        let trainer = DualTargetTrainer::new(quick_settings(), &scalers, Device::Cpu);
        let result = trainer.grid_search(&grid, &train, &val, &rng).unwrap();

        assert_eq!(result.outcomes.len(), 2);
        assert_eq!(result.outcomes[0].score, None);
        assert_eq!(result.best_index, 1);
        assert_eq!(result.best_params.learning_rate, 0.005);
        assert_eq!(result.outcomes[1].score, Some(result.best_score));
    }
}
