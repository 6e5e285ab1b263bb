//! Rebuild a trial's planar trajectory from per-stride polar deltas.
//!
//! Ground-truth deltas come from the trial's control points. With `--bundle`
//! the trained models predict each stride as well and the predicted path is
//! written next to the ground-truth one.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use nalgebra::Vector2;
use serde::Serialize;

use stride_trainer_rs::dataset::{load_recording, TrialRecording};
use stride_trainer_rs::model::default_device;
use stride_trainer_rs::trajectory::{max_deviation, polar_deltas, reconstruct, PolarStride, VerticalComparison};
use stride_trainer_rs::{StridePrediction, StridePredictor};

#[derive(Parser, Debug)]
#[command(name = "reconstruct")]
#[command(about = "Reconstruct a trial trajectory from stride displacement and heading", long_about = None)]
struct Args {
    /// Trial file (.json / .json.gz)
    #[arg(long)]
    trial: PathBuf,

    /// Output JSON path (stdout when omitted)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Trained bundle directory; adds a model-predicted trajectory
    #[arg(long)]
    bundle: Option<PathBuf>,
}

#[derive(Serialize)]
struct PredictedPath {
    strides: Vec<PolarStride>,
    /// Strides the predictor could not estimate fall back to ground truth.
    substituted: usize,
    path: Vec<[f64; 2]>,
    max_deviation: f64,
}

#[derive(Serialize)]
struct ReconstructionOutput {
    trial: String,
    control_points: Vec<[f64; 2]>,
    strides: Vec<PolarStride>,
    reconstructed: Vec<[f64; 2]>,
    max_deviation: f64,
    vertical: VerticalComparison,
    predicted: Option<PredictedPath>,
}

fn to_pairs(points: &[Vector2<f64>]) -> Vec<[f64; 2]> {
    points.iter().map(|p| [p.x, p.y]).collect()
}

fn predict_path(bundle: &Path, rec: &TrialRecording, truth: &[PolarStride], origin: Vector2<f64>, gt: &[Vector2<f64>]) -> Result<PredictedPath> {
    let predictor = StridePredictor::load(bundle, default_device())
        .with_context(|| format!("loading bundle {}", bundle.display()))?;
    let mut strides = Vec::with_capacity(truth.len());
    let mut substituted = 0;
    for (i, bounds) in rec.stride_index.windows(2).enumerate().take(truth.len()) {
        let (s, e) = (bounds[0], bounds[1]);
        let estimate = if s < e && e <= rec.acc_n.len() {
            predictor.predict(&rec.acc_n[s..e])?
        } else {
            StridePrediction::TooShort
        };
        match estimate {
            StridePrediction::Estimate { distance, heading } => strides.push(PolarStride {
                displacement: distance,
                heading,
            }),
            other => {
                log::warn!("stride {}: {:?}, using ground truth", i, other);
                substituted += 1;
                strides.push(truth[i]);
            }
        }
    }
    let path = reconstruct(&strides, origin);
    Ok(PredictedPath {
        max_deviation: max_deviation(&path, gt),
        path: to_pairs(&path),
        strides,
        substituted,
    })
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let rec = load_recording(&args.trial).with_context(|| format!("reading {}", args.trial.display()))?;
    if rec.gcp.len() < 2 {
        anyhow::bail!("{} has {} control points, need at least 2", args.trial.display(), rec.gcp.len());
    }
    let mut points = Vec::with_capacity(rec.gcp.len());
    for (i, p) in rec.gcp.iter().enumerate() {
        if p.len() < 2 {
            anyhow::bail!("control point {} has {} coordinates", i, p.len());
        }
        points.push(Vector2::new(p[0], p[1]));
    }

    let strides = polar_deltas(&points);
    let path = reconstruct(&strides, points[0]);
    let deviation = max_deviation(&path, &points);
    log::info!("{} strides, max deviation from control points {:.3e} m", strides.len(), deviation);

    // Ground-truth Z plotted against the reconstruction's Y component.
    let ground_truth_z: Vec<f64> = rec.gcp.iter().map(|p| p.get(2).copied().unwrap_or(0.0)).collect();
    let vertical = VerticalComparison::new(ground_truth_z, &path);
    log::warn!("vertical series pairs ground-truth Z with reconstructed Y; axes differ");

    let predicted = match &args.bundle {
        Some(dir) => Some(predict_path(dir, &rec, &strides, points[0], &points)?),
        None => None,
    };

    let output = ReconstructionOutput {
        trial: args.trial.display().to_string(),
        control_points: to_pairs(&points),
        reconstructed: to_pairs(&path),
        max_deviation: deviation,
        strides,
        vertical,
        predicted,
    };
    let json = serde_json::to_string_pretty(&output)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json)?;
            log::info!("wrote {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
