use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;

use stride_trainer_rs::model::default_device;
use stride_trainer_rs::{Pipeline, PipelineConfig};

#[derive(Parser, Debug)]
#[command(name = "stride_trainer")]
#[command(about = "Train per-stride distance and heading regressors", long_about = None)]
struct Args {
    /// Directory of trial files (.json / .json.gz)
    #[arg(long)]
    data_dir: PathBuf,

    /// Bundle output directory
    #[arg(long, default_value = "stride_models")]
    output_dir: PathBuf,

    /// JSON file overriding the default pipeline settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed for every random stage (overrides the config file)
    #[arg(long)]
    seed: Option<u64>,

    /// Skip the Mahalanobis outlier gate
    #[arg(long)]
    no_outlier_filter: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if args.no_outlier_filter {
        config.filter_outliers = false;
    }
    if !args.data_dir.is_dir() {
        anyhow::bail!("data directory {} does not exist", args.data_dir.display());
    }

    let device = default_device();
    log::info!("[main] device {:?}, seed {}", device, config.seed);
    log::info!("[main] data {} -> {}", args.data_dir.display(), args.output_dir.display());

    let pipeline = Pipeline::new(config, device).context("invalid pipeline configuration")?;
    let report = pipeline
        .run(&args.data_dir, &args.output_dir)
        .context("training run failed")?;

    let report_path = args
        .output_dir
        .join(format!("run_{}.json", Utc::now().format("%Y%m%d_%H%M%S")));
    let json = serde_json::to_string_pretty(&report)?;
    std::fs::write(&report_path, json)?;

    log::info!(
        "[main] done in {:.1}s: best score {:.4}, report {}",
        report.elapsed_secs,
        report.best_score,
        report_path.display()
    );
    Ok(())
}
