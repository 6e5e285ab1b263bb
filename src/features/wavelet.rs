//! Continuous wavelet transform with a Ricker (Mexican hat) mother wavelet.

use std::f64::consts::PI;

/// Widths used by the stride extractor.
pub const CWT_WIDTHS: std::ops::RangeInclusive<usize> = 1..=30;

/// Ricker wavelet sampled at `points` positions centered on the window.
pub fn ricker(points: usize, width: f64) -> Vec<f64> {
    let amplitude = 2.0 / ((3.0 * width).sqrt() * PI.powf(0.25));
    let wsq = width * width;
    let center = (points as f64 - 1.0) / 2.0;
    (0..points)
        .map(|i| {
            let x = i as f64 - center;
            let xsq = x * x;
            amplitude * (1.0 - xsq / wsq) * (-xsq / (2.0 * wsq)).exp()
        })
        .collect()
}

/// Linear convolution trimmed to the input length, centered on the full result.
pub fn convolve_same(signal: &[f64], kernel: &[f64]) -> Vec<f64> {
    let n = signal.len();
    let m = kernel.len();
    if n == 0 || m == 0 {
        return vec![0.0; n];
    }
    let offset = (m - 1) / 2;
    (0..n)
        .map(|i| {
            let k = i + offset; // index into the full convolution
            let j_lo = k.saturating_sub(m - 1);
            let j_hi = k.min(n - 1);
            (j_lo..=j_hi).map(|j| signal[j] * kernel[k - j]).sum()
        })
        .collect()
}

/// CWT coefficients, one row per width. Wavelet length is `min(10 * width, len)`.
pub fn cwt_ricker<I>(signal: &[f64], widths: I) -> Vec<Vec<f64>>
where
    I: IntoIterator<Item = usize>,
{
    widths
        .into_iter()
        .map(|w| {
            let points = (10 * w).min(signal.len());
            let mut wavelet = ricker(points, w as f64);
            wavelet.reverse();
            convolve_same(signal, &wavelet)
        })
        .collect()
}
