//! Trial file loading: stride boundaries + control points + acceleration
//! in, per-stride samples out.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrideError};
use crate::features::FeatureExtractor;
use crate::types::{Provenance, StrideSample, TrialSamples};

/// One recorded walking trial as stored on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrialRecording {
    /// Sample indices of stride boundaries into `acc_n`.
    pub stride_index: Vec<usize>,
    /// Ground-truth control point per stride boundary; `[x, y, ...]`.
    pub gcp: Vec<Vec<f64>>,
    /// Navigation-frame acceleration, one `[x, y, z]` row per sample.
    pub acc_n: Vec<[f64; 3]>,
}

impl TrialRecording {
    /// Planar displacement between control points `i` and `i + 1`.
    pub fn displacement(&self, i: usize) -> Option<(f64, f64)> {
        let a = self.gcp.get(i)?;
        let b = self.gcp.get(i + 1)?;
        if a.len() < 2 || b.len() < 2 {
            return None;
        }
        Some((b[0] - a[0], b[1] - a[1]))
    }
}

/// `.json` or `.json.gz`
pub fn is_trial_file(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };
    name.ends_with(".json") || name.ends_with(".json.gz")
}

pub fn load_recording(path: &Path) -> Result<TrialRecording> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let reader = BufReader::new(GzDecoder::new(file));
        Ok(serde_json::from_reader(reader)?)
    } else {
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

pub fn provenance_for(file_name: &str, reference_marker: &str) -> Provenance {
    if file_name.contains(reference_marker) {
        Provenance::Reference
    } else {
        Provenance::Target
    }
}

#[derive(Clone, Debug)]
pub struct DatasetLoader {
    extractor: FeatureExtractor,
    reference_marker: String,
}

impl DatasetLoader {
    pub fn new(extractor: FeatureExtractor, reference_marker: impl Into<String>) -> Self {
        Self {
            extractor,
            reference_marker: reference_marker.into(),
        }
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    /// One sample per usable consecutive boundary pair.
    pub fn stride_samples(&self, name: &str, recording: &TrialRecording, provenance: Provenance) -> Vec<StrideSample> {
        let mut samples = Vec::new();
        let n_acc = recording.acc_n.len();
        for (i, bounds) in recording.stride_index.windows(2).enumerate() {
            let (s, e) = (bounds[0], bounds[1]);
            if s >= e || e > n_acc {
                log::debug!("[dataset] {} stride {}: bounds {}..{} outside 0..{}", name, i, s, e, n_acc);
                continue;
            }
            let features = match self.extractor.extract(&recording.acc_n[s..e]) {
                Some(f) => f,
                None => {
                    log::debug!("[dataset] {} stride {}: {} samples, too short", name, i, e - s);
                    continue;
                }
            };
            let (dx, dy) = match recording.displacement(i) {
                Some(d) => d,
                None => {
                    log::warn!("[dataset] {} stride {}: no control point pair", name, i);
                    continue;
                }
            };
            samples.push(StrideSample::new(features, dx.hypot(dy), dy.atan2(dx), provenance));
        }
        samples
    }

    /// Load one file. Returns `Ok(None)` when it yields no usable strides.
    pub fn load_file(&self, path: &Path) -> Result<Option<TrialSamples>> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let provenance = provenance_for(&name, &self.reference_marker);
        let recording = load_recording(path)?;
        let samples = self.stride_samples(&name, &recording, provenance);
        if samples.is_empty() {
            log::info!("[dataset] {}: no valid strides, skipped", name);
            return Ok(None);
        }
        log::info!(
            "[dataset] {} ({:?}): {} strides from {} boundaries",
            name,
            provenance,
            samples.len(),
            recording.stride_index.len()
        );
        Ok(Some(TrialSamples {
            name,
            provenance,
            samples,
        }))
    }

    /// Every trial file in `dir`, visited in sorted filename order.
    /// Unreadable files are skipped with a warning.
    pub fn load_dir(&self, dir: &Path) -> Result<Vec<TrialSamples>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_trial_file(p))
            .collect();
        paths.sort();

        let mut trials = Vec::new();
        for path in &paths {
            match self.load_file(path) {
                Ok(Some(trial)) => trials.push(trial),
                Ok(None) => {}
                Err(e) => log::warn!("[dataset] skipping {}: {}", path.display(), e),
            }
        }

        if trials.is_empty() {
            return Err(StrideError::EmptyDataset(format!(
                "no usable strides in {} ({} candidate files)",
                dir.display(),
                paths.len()
            )));
        }
        Ok(trials)
    }
}

/// Flattened samples of the trials with the given provenance, file order kept.
pub fn samples_with(trials: &[TrialSamples], provenance: Provenance) -> Vec<StrideSample> {
    trials
        .iter()
        .filter(|t| t.provenance == provenance)
        .flat_map(|t| t.samples.iter().cloned())
        .collect()
}

/// All samples, reference trials first, then target trials.
pub fn all_samples(trials: &[TrialSamples]) -> Vec<StrideSample> {
    let mut out = samples_with(trials, Provenance::Reference);
    out.extend(samples_with(trials, Provenance::Target));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::f64::consts::PI;
    use std::io::Write;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("stride_dataset_{}_{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn recording(strides: usize, stride_len: usize) -> TrialRecording {
        let n = strides * stride_len;
        let acc_n = (0..n)
            .map(|i| {
                let t = i as f64 / 200.0;
                [(2.0 * PI * 2.0 * t).sin(), (2.0 * PI * 3.0 * t).cos(), 0.1 * t]
            })
            .collect();
        let stride_index = (0..=strides).map(|k| k * stride_len).collect();
        let gcp = (0..=strides).map(|k| vec![0.7 * k as f64, 0.1 * k as f64, 0.0]).collect();
        TrialRecording { stride_index, gcp, acc_n }
    }

    #[test]
    fn test_stride_targets_from_control_points() {
        let loader = DatasetLoader::new(FeatureExtractor::default(), "SensorConnectData");
        let samples = loader.stride_samples("t", &recording(3, 60), Provenance::Target);
        assert_eq!(samples.len(), 3);
        for s in &samples {
            assert!((s.distance() - (0.49f64 + 0.01).sqrt()).abs() < 1e-12);
            assert!((s.heading() - 0.1f64.atan2(0.7)).abs() < 1e-12);
            assert_eq!(s.features().len(), 83);
        }
    }

    #[test]
    fn test_short_and_out_of_range_strides_skipped() {
        let loader = DatasetLoader::new(FeatureExtractor::default(), "SensorConnectData");
        let mut rec = recording(3, 60);
        // stride 0 shrinks to 9 samples, stride 2 runs past the end
        rec.stride_index = vec![0, 9, 69, 500];
        let samples = loader.stride_samples("t", &rec, Provenance::Target);
        assert_eq!(samples.len(), 1);

        let mut rec = recording(3, 60);
        rec.gcp.truncate(2);
        assert_eq!(loader.stride_samples("t", &rec, Provenance::Target).len(), 1);
    }

    #[test]
    fn test_westward_stride_heading_is_pi() {
        let loader = DatasetLoader::new(FeatureExtractor::default(), "SensorConnectData");
        let mut rec = recording(1, 60);
        rec.gcp = vec![vec![0.0, 0.0], vec![-1.0, -0.0]];
        let samples = loader.stride_samples("t", &rec, Provenance::Target);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].heading(), PI);
        assert_eq!(samples[0].distance(), 1.0);
    }

    #[test]
    fn test_provenance_marker() {
        assert_eq!(provenance_for("SensorConnectData_03.json", "SensorConnectData"), Provenance::Reference);
        assert_eq!(provenance_for("vicon_03.json.gz", "SensorConnectData"), Provenance::Target);
    }

    #[test]
    fn test_load_dir_sorted_with_gzip_and_corrupt_files() {
        let dir = scratch_dir("load");
        let rec = recording(4, 50);

        fs::write(dir.join("b_vicon.json"), serde_json::to_vec(&rec).unwrap()).unwrap();
        let mut gz = GzEncoder::new(File::create(dir.join("a_SensorConnectData.json.gz")).unwrap(), Compression::default());
        gz.write_all(&serde_json::to_vec(&rec).unwrap()).unwrap();
        gz.finish().unwrap();
        fs::write(dir.join("c_broken.json"), b"{ not json").unwrap();
        fs::write(dir.join("notes.txt"), b"ignored").unwrap();
        let empty = TrialRecording { stride_index: vec![0], gcp: vec![vec![0.0, 0.0]], acc_n: vec![] };
        fs::write(dir.join("d_empty.json"), serde_json::to_vec(&empty).unwrap()).unwrap();

        let loader = DatasetLoader::new(FeatureExtractor::default(), "SensorConnectData");
        let trials = loader.load_dir(&dir).unwrap();
        assert_eq!(trials.len(), 2);
        assert_eq!(trials[0].name, "a_SensorConnectData.json.gz");
        assert_eq!(trials[0].provenance, Provenance::Reference);
        assert_eq!(trials[1].provenance, Provenance::Target);
        assert_eq!(samples_with(&trials, Provenance::Reference).len(), 4);
        assert_eq!(all_samples(&trials).len(), 8);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_dir_without_strides_is_error() {
        let dir = scratch_dir("empty");
        let loader = DatasetLoader::new(FeatureExtractor::default(), "SensorConnectData");
        assert!(loader.load_dir(&dir).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }
}
