//! End-to-end training run: load, gate, augment, split, scale, train, test,
//! persist.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::Device;
use serde::Serialize;

use crate::augment::{augment, synthesize};
use crate::bundle::{ArtifactBundle, Manifest};
use crate::config::PipelineConfig;
use crate::dataset::{all_samples, samples_with, DatasetLoader};
use crate::error::{Result, StrideError};
use crate::features::FeatureExtractor;
use crate::gate::ReferenceDistribution;
use crate::random::RandomSource;
use crate::scaler::ScalerSet;
use crate::training::{test_report, CombinationOutcome, DualTargetTrainer, TestReport, TrainerSettings};
use crate::types::{FeatureTable, Provenance, TrialSamples};

#[derive(Clone, Debug, Serialize)]
pub struct GateSummary {
    pub threshold: f64,
    pub percentile: f64,
    pub reference_kept: usize,
    pub target_kept: usize,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct SplitSizes {
    pub train: usize,
    pub validation: usize,
    pub test: usize,
}

/// What a run did, for logging and the session file.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineReport {
    pub trials: usize,
    pub reference_samples: usize,
    pub target_samples: usize,
    pub gate: Option<GateSummary>,
    pub table_rows: usize,
    pub splits: SplitSizes,
    pub combinations: Vec<CombinationOutcome>,
    pub best_index: usize,
    pub best_score: f64,
    pub test_report: TestReport,
    pub bundle_files: Vec<PathBuf>,
    pub elapsed_secs: f64,
}

pub struct Pipeline {
    config: PipelineConfig,
    device: Device,
}

fn count(trials: &[TrialSamples], provenance: Provenance) -> usize {
    trials
        .iter()
        .filter(|t| t.provenance == provenance)
        .map(|t| t.samples.len())
        .sum()
}

impl Pipeline {
    pub fn new(config: PipelineConfig, device: Device) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, device })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Fit the reference distribution, or `None` when gating is off or there
    /// is too little reference data to fit it.
    fn fit_gate(&self, trials: &[TrialSamples]) -> Result<Option<ReferenceDistribution>> {
        if !self.config.filter_outliers {
            log::info!("[gate] outlier filtering disabled");
            return Ok(None);
        }
        let reference = samples_with(trials, Provenance::Reference);
        if reference.len() < 2 {
            log::warn!(
                "[gate] {} reference strides (marker {:?}), gating disabled",
                reference.len(),
                self.config.reference_marker
            );
            return Ok(None);
        }
        let gate = ReferenceDistribution::fit(&reference, self.config.outlier_percentile)?;
        log::info!(
            "[gate] fit on {} reference strides, P{} threshold {:.4}",
            reference.len(),
            gate.percentile(),
            gate.threshold()
        );
        Ok(Some(gate))
    }

    fn enlarge(&self, table: FeatureTable, rng: &RandomSource) -> Result<FeatureTable> {
        let mut rng = rng.stream("augment");
        let mut table = table;
        if self.config.add_synthetic && self.config.synthetic_samples > 0 {
            let synthetic = synthesize(&table, self.config.synthetic_samples, &mut rng)?;
            table = table.concat(&synthetic)?;
            log::info!("[augment] +{} synthetic rows -> {}", self.config.synthetic_samples, table.len());
        }
        if self.config.use_augment && self.config.augment_times > 0 {
            let jittered = augment(&table, self.config.augment_times, &mut rng);
            table = table.concat(&jittered)?;
            log::info!("[augment] x{} jitter passes -> {}", self.config.augment_times, table.len());
        }
        Ok(table)
    }

    /// `(train, validation, test)`
    fn split(&self, table: &FeatureTable, rng: &RandomSource) -> Result<(FeatureTable, FeatureTable, FeatureTable)> {
        let mut rng = rng.stream("split");
        let order = rng.permutation(table.len());
        let (rest, test) = table.split(self.config.test_fraction, &order);
        let order = rng.permutation(rest.len());
        let (train, val) = rest.split(self.config.val_fraction, &order);

        if train.len() < 2 || val.is_empty() || test.is_empty() {
            return Err(StrideError::EmptyDataset(format!(
                "{} rows cannot be split into train {} / validation {} / test {}",
                table.len(),
                train.len(),
                val.len(),
                test.len()
            )));
        }
        Ok((train, val, test))
    }

    /// Train on every trial file in `data_dir` and write the bundle to
    /// `output_dir`.
    pub fn run(&self, data_dir: &Path, output_dir: &Path) -> Result<PipelineReport> {
        let start = Instant::now();
        let rng = RandomSource::new(self.config.seed);
        let cfg = &self.config;

        // ── 1. Load ──
        let loader = DatasetLoader::new(FeatureExtractor::new(cfg.sampling_rate_hz), cfg.reference_marker.clone());
        let mut trials = loader.load_dir(data_dir)?;
        let reference_samples = count(&trials, Provenance::Reference);
        let target_samples = count(&trials, Provenance::Target);
        log::info!(
            "[pipeline] {} trials: {} reference strides, {} target strides",
            trials.len(),
            reference_samples,
            target_samples
        );
        let n_trials = trials.len();

        // ── 2. Gate ──
        let gate = self.fit_gate(&trials)?;
        let gate_summary = match &gate {
            Some(g) => {
                trials = g.filter_trials(trials)?;
                let summary = GateSummary {
                    threshold: g.threshold(),
                    percentile: g.percentile(),
                    reference_kept: count(&trials, Provenance::Reference),
                    target_kept: count(&trials, Provenance::Target),
                };
                log::info!(
                    "[gate] kept {}/{} reference, {}/{} target",
                    summary.reference_kept,
                    reference_samples,
                    summary.target_kept,
                    target_samples
                );
                Some(summary)
            }
            None => None,
        };

        // ── 3. Table + augmentation ──
        let table = FeatureTable::from_samples(&all_samples(&trials))?;
        let table = self.enlarge(table, &rng)?;
        let table_rows = table.len();

        // ── 4. Split + scale ──
        let (train, val, test) = self.split(&table, &rng)?;
        let splits = SplitSizes {
            train: train.len(),
            validation: val.len(),
            test: test.len(),
        };
        log::info!("[pipeline] split {:?}", splits);
        let scalers = ScalerSet::fit(&train, cfg.n_quantiles)?;
        let train = scalers.transform(&train)?;
        let val = scalers.transform(&val)?;
        let test = scalers.transform(&test)?;

        // ── 5. Grid search ──
        let trainer = DualTargetTrainer::new(TrainerSettings::from(cfg), &scalers, self.device.clone());
        let search = trainer.grid_search(&cfg.grid, &train, &val, &rng)?;
        log::info!(
            "[pipeline] best combination {} score {:.4}: {:?}",
            search.best_index + 1,
            search.best_score,
            search.best_params
        );

        // ── 6. Held-out test ──
        let report = test_report(&search.models, &test, &scalers, search.best_params.batch_size * 2, &self.device)?;
        log::info!(
            "[pipeline] test ({} rows): distance mse {:.4} mae {:.4}, heading mse {:.4} mae {:.4}",
            report.samples,
            report.distance.mse,
            report.distance.mae,
            report.heading.mse,
            report.heading.mae
        );

        // ── 7. Persist ──
        let mut bundle = ArtifactBundle {
            models: search.models,
            feature_columns: train.columns.clone(),
            params: search.best_params,
            gate,
            manifest: Manifest::new(search.best_score, cfg.sampling_rate_hz, cfg.seed, Some(report.clone())),
            scalers,
        };
        let bundle_files = bundle.save(output_dir)?;

        Ok(PipelineReport {
            trials: n_trials,
            reference_samples,
            target_samples,
            gate: gate_summary,
            table_rows,
            splits,
            combinations: search.outcomes,
            best_index: search.best_index,
            best_score: search.best_score,
            test_report: report,
            bundle_files,
            elapsed_secs: start.elapsed().as_secs_f64(),
        })
    }
}
