//! Stride feature extraction
//!
//! Turns one stride of normalized 3-axis acceleration into a fixed-length
//! feature vector. Groups are concatenated in this order, each covering the
//! x, y, z axes before moving on:
//!
//! | group      | per axis | contents                                              |
//! |------------|----------|-------------------------------------------------------|
//! | time       | 10       | mean, std, max, min, skew, kurtosis, iqr, median, ms, var |
//! | frequency  | 6        | Welch PSD sum, mean, max, median, p10, p90            |
//! | wavelet    | 3        | mean/max/min of \|CWT\| over Ricker widths 1..=30     |
//! | envelope   | 8        | amplitude envelope and instantaneous frequency stats  |
//!
//! followed by the peak acceleration norm and the stride duration.

pub mod spectral;
pub mod stats;
pub mod wavelet;

use std::f64::consts::PI;

use crate::types::{AXES, FEATURE_DIM};

/// Strides shorter than this carry too little signal and are discarded.
pub const MIN_STRIDE_SAMPLES: usize = 10;

pub const DEFAULT_SAMPLING_RATE_HZ: f64 = 200.0;

/// Welch segment length (clamped to the stride length).
const WELCH_NPERSEG: usize = 256;

/// One stride of acceleration, one `[x, y, z]` row per sample.
pub type StrideSegment<'a> = &'a [[f64; 3]];

#[derive(Clone, Debug)]
pub struct FeatureExtractor {
    sampling_rate_hz: f64,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLING_RATE_HZ)
    }
}

impl FeatureExtractor {
    pub fn new(sampling_rate_hz: f64) -> Self {
        Self { sampling_rate_hz }
    }

    pub fn sampling_rate_hz(&self) -> f64 {
        self.sampling_rate_hz
    }

    /// Number of features produced for every accepted stride.
    pub fn feature_count(&self) -> usize {
        FEATURE_DIM
    }

    /// Feature vector for one stride, or `None` if it is shorter than
    /// [`MIN_STRIDE_SAMPLES`].
    pub fn extract(&self, segment: StrideSegment) -> Option<Vec<f64>> {
        if segment.len() < MIN_STRIDE_SAMPLES {
            return None;
        }

        let channels: Vec<Vec<f64>> = (0..AXES)
            .map(|axis| segment.iter().map(|row| row[axis]).collect())
            .collect();

        let mut feats = Vec::with_capacity(FEATURE_DIM);
        for ch in &channels {
            feats.extend(time_domain_features(ch));
        }
        for ch in &channels {
            feats.extend(frequency_domain_features(ch, self.sampling_rate_hz));
        }
        for ch in &channels {
            feats.extend(wavelet_features(ch));
        }
        for ch in &channels {
            feats.extend(envelope_features(ch));
        }

        let peak_norm = segment
            .iter()
            .map(|r| (r[0] * r[0] + r[1] * r[1] + r[2] * r[2]).sqrt())
            .fold(0.0, f64::max);
        let duration_s = segment.len() as f64 / self.sampling_rate_hz;
        feats.push(peak_norm);
        feats.push(duration_s);

        debug_assert_eq!(feats.len(), FEATURE_DIM);
        Some(feats)
    }
}

fn time_domain_features(sig: &[f64]) -> [f64; 10] {
    [
        stats::mean(sig),
        stats::std_dev(sig),
        stats::max(sig),
        stats::min(sig),
        stats::skewness(sig),
        stats::kurtosis(sig),
        stats::iqr(sig),
        stats::median(sig),
        stats::mean_square(sig),
        stats::variance(sig),
    ]
}

fn frequency_domain_features(sig: &[f64], fs: f64) -> [f64; 6] {
    let (_, psd) = spectral::welch_psd(sig, fs, WELCH_NPERSEG);
    [
        psd.iter().sum(),
        stats::mean(&psd),
        stats::max(&psd),
        stats::median(&psd),
        stats::percentile(&psd, 10.0),
        stats::percentile(&psd, 90.0),
    ]
}

fn wavelet_features(sig: &[f64]) -> [f64; 3] {
    let coeffs = wavelet::cwt_ricker(sig, wavelet::CWT_WIDTHS);
    let magnitudes: Vec<f64> = coeffs.iter().flatten().map(|c| c.abs()).collect();
    [
        stats::mean(&magnitudes),
        stats::max(&magnitudes),
        stats::min(&magnitudes),
    ]
}

fn envelope_features(sig: &[f64]) -> [f64; 8] {
    let analytic = spectral::analytic_signal(sig);
    let amplitude: Vec<f64> = analytic.iter().map(|c| c.norm()).collect();
    let phase: Vec<f64> = analytic.iter().map(|c| c.im.atan2(c.re)).collect();
    let phase = spectral::unwrap_phase(&phase);
    let inst_freq: Vec<f64> = phase.windows(2).map(|w| (w[1] - w[0]) / (2.0 * PI)).collect();
    [
        stats::mean(&amplitude),
        stats::std_dev(&amplitude),
        stats::max(&amplitude),
        stats::min(&amplitude),
        stats::mean(&inst_freq),
        stats::std_dev(&inst_freq),
        stats::max(&inst_freq),
        stats::min(&inst_freq),
    ]
}
