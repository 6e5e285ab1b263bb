//! Spectral helpers: Hann window, Welch PSD, analytic signal.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::f64::consts::PI;

/// Hann window.
///
/// `periodic = true` gives the DFT-even window used for spectral estimation
/// (`0.5 - 0.5 * cos(2πi / n)`); `false` gives the symmetric one
/// (`0.5 - 0.5 * cos(2πi / (n-1))`).
pub fn hann_window(length: usize, periodic: bool) -> Vec<f64> {
    if length <= 1 {
        return vec![1.0; length];
    }
    let denom = if periodic { length as f64 } else { length as f64 - 1.0 };
    (0..length)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / denom).cos())
        .collect()
}

/// Welch power spectral density, density scaling, one-sided.
///
/// Segment length is `min(nperseg, len)`, overlap half a segment, each segment
/// mean-detrended and Hann-windowed. Returns `(frequencies, psd)`.
pub fn welch_psd(signal: &[f64], fs: f64, nperseg: usize) -> (Vec<f64>, Vec<f64>) {
    let n = signal.len();
    if n == 0 {
        return (Vec::new(), Vec::new());
    }
    let nperseg = nperseg.min(n).max(1);
    let noverlap = nperseg / 2;
    let step = nperseg - noverlap;
    let n_segments = (n - noverlap) / step;

    let window = hann_window(nperseg, true);
    let win_energy: f64 = window.iter().map(|w| w * w).sum();
    let scale = 1.0 / (fs * win_energy);
    let n_bins = nperseg / 2 + 1;

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(nperseg);

    let mut psd = vec![0.0; n_bins];
    let mut buffer = vec![Complex::new(0.0, 0.0); nperseg];
    for seg in 0..n_segments {
        let chunk = &signal[seg * step..seg * step + nperseg];
        let seg_mean = chunk.iter().sum::<f64>() / nperseg as f64;
        for (slot, (value, w)) in buffer.iter_mut().zip(chunk.iter().zip(window.iter())) {
            *slot = Complex::new((value - seg_mean) * w, 0.0);
        }
        fft.process(&mut buffer);
        for (bin, acc) in psd.iter_mut().enumerate() {
            *acc += buffer[bin].norm_sqr() * scale;
        }
    }

    let n_segments = n_segments.max(1) as f64;
    for (bin, value) in psd.iter_mut().enumerate() {
        *value /= n_segments;
        // Fold the negative frequencies in: everything except DC (and Nyquist
        // for even lengths) is doubled.
        let is_nyquist = nperseg % 2 == 0 && bin == n_bins - 1;
        if bin != 0 && !is_nyquist {
            *value *= 2.0;
        }
    }

    let freqs = (0..n_bins).map(|k| k as f64 * fs / nperseg as f64).collect();
    (freqs, psd)
}

/// Analytic signal via the FFT Hilbert transform.
pub fn analytic_signal(signal: &[f64]) -> Vec<Complex<f64>> {
    let n = signal.len();
    if n == 0 {
        return Vec::new();
    }
    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(n);
    let inverse = planner.plan_fft_inverse(n);

    let mut buffer: Vec<Complex<f64>> = signal.iter().map(|&v| Complex::new(v, 0.0)).collect();
    forward.process(&mut buffer);

    let mut h = vec![0.0; n];
    h[0] = 1.0;
    if n % 2 == 0 {
        h[n / 2] = 1.0;
        for v in h.iter_mut().take(n / 2).skip(1) {
            *v = 2.0;
        }
    } else {
        for v in h.iter_mut().take((n + 1) / 2).skip(1) {
            *v = 2.0;
        }
    }
    for (slot, gain) in buffer.iter_mut().zip(h.iter()) {
        *slot *= *gain;
    }

    inverse.process(&mut buffer);
    let norm = 1.0 / n as f64;
    buffer.iter().map(|c| c * norm).collect()
}

/// Phase unwrapping with a π discontinuity threshold.
pub fn unwrap_phase(phase: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(phase.len());
    let mut correction = 0.0;
    for (i, &p) in phase.iter().enumerate() {
        if i > 0 {
            let dd = p - phase[i - 1];
            let mut ddmod = (dd + PI).rem_euclid(2.0 * PI) - PI;
            if ddmod == -PI && dd > 0.0 {
                ddmod = PI;
            }
            if dd.abs() >= PI {
                correction += ddmod - dd;
            }
        }
        out.push(p + correction);
    }
    out
}
