//! Summary statistics with numpy/scipy conventions (population moments,
//! linear-interpolation percentiles).

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance (ddof = 0).
pub fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

pub fn std_dev(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

pub fn max(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

pub fn min(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

fn central_moment(values: &[f64], order: i32) -> f64 {
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(order)).sum::<f64>() / values.len() as f64
}

/// Biased sample skewness. Constant input gives 0.
pub fn skewness(values: &[f64]) -> f64 {
    let m2 = central_moment(values, 2);
    if m2 <= f64::EPSILON * f64::EPSILON {
        return 0.0;
    }
    central_moment(values, 3) / m2.powf(1.5)
}

/// Biased Fisher kurtosis (normal = 0). Constant input gives 0.
pub fn kurtosis(values: &[f64]) -> f64 {
    let m2 = central_moment(values, 2);
    if m2 <= f64::EPSILON * f64::EPSILON {
        return 0.0;
    }
    central_moment(values, 4) / (m2 * m2) - 3.0
}

/// Percentile (0..=100) with linear interpolation between order statistics.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    percentile_sorted(&sorted, p)
}

pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    let frac = rank - lo as f64;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}

pub fn median(values: &[f64]) -> f64 {
    percentile(values, 50.0)
}

pub fn iqr(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    percentile_sorted(&sorted, 75.0) - percentile_sorted(&sorted, 25.0)
}

pub fn mean_square(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_moments() {
        let x = [1.0, 2.0, 3.0, 4.0];
        assert_relative_eq!(mean(&x), 2.5);
        assert_relative_eq!(variance(&x), 1.25);
        assert_relative_eq!(mean_square(&x), 7.5);
        assert_relative_eq!(skewness(&x), 0.0, epsilon = 1e-12);
        // scipy.stats.kurtosis([1,2,3,4]) == -1.36
        assert_relative_eq!(kurtosis(&x), -1.36, epsilon = 1e-12);
    }

    #[test]
    fn test_skew_sign() {
        let right = [0.0, 0.0, 0.0, 0.0, 10.0];
        assert!(skewness(&right) > 0.0);
    }

    #[test]
    fn test_percentiles_match_numpy() {
        let x = [3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0];
        assert_relative_eq!(median(&x), 3.5);
        // np.percentile(x, 10) == 1.0, np.percentile(x, 90) == 6.9
        assert_relative_eq!(percentile(&x, 10.0), 1.0);
        assert_relative_eq!(percentile(&x, 90.0), 6.9, epsilon = 1e-12);
        // scipy.stats.iqr(x) == 3.5
        assert_relative_eq!(iqr(&x), 3.5, epsilon = 1e-12);
    }

    #[test]
    fn test_constant_signal_shape_stats() {
        let x = [2.0; 12];
        assert_eq!(skewness(&x), 0.0);
        assert_eq!(kurtosis(&x), 0.0);
        assert_eq!(std_dev(&x), 0.0);
    }
}
