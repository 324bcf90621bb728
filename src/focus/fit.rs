//! Curve smoothing and Gaussian peak fitting for through-focus data.

use crate::error::{AppResult, ColorimeterError};
use nalgebra::{Matrix3, Vector3};

/// Result of a log-quadratic Gaussian fit `y = exp(a + b·x + c·x²)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianFit {
    /// Abscissa of the peak, `−b / 2c`.
    pub peak: f64,
    /// Fitted value at the peak.
    pub amplitude: f64,
    /// Gaussian width, `sqrt(−1 / 2c)`.
    pub sigma: f64,
}

/// Centred moving average with half window `half_window`; the window shrinks
/// at both ends so the output has the input length.
pub fn moving_average(values: &[f64], half_window: usize) -> Vec<f64> {
    if half_window == 0 {
        return values.to_vec();
    }
    (0..values.len())
        .map(|index| {
            let start = index.saturating_sub(half_window);
            let end = (index + half_window + 1).min(values.len());
            let window = &values[start..end];
            window.iter().sum::<f64>() / window.len() as f64
        })
        .collect()
}

/// Least-squares fit of `ln y = a + b·x + c·x²`.
///
/// Samples with non-finite `x` or non-positive `y` are ignored. Fails with
/// `InsufficientData` when fewer than three samples remain and with `NoPeak`
/// when the parabola opens upwards or its vertex falls outside the sampled
/// range.
pub fn fit_gaussian(xs: &[f64], ys: &[f64]) -> AppResult<GaussianFit> {
    let samples: Vec<(f64, f64)> = xs
        .iter()
        .zip(ys)
        .filter(|(x, y)| x.is_finite() && y.is_finite() && **y > 0.0)
        .map(|(x, y)| (*x, y.ln()))
        .collect();
    if samples.len() < 3 {
        return Err(ColorimeterError::InsufficientData(format!(
            "{} usable samples, need at least 3",
            samples.len()
        )));
    }

    let (min_x, max_x) = samples
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (x, _)| {
            (lo.min(*x), hi.max(*x))
        });
    let center = 0.5 * (min_x + max_x);
    let scale = 0.5 * (max_x - min_x);
    if scale <= 0.0 {
        return Err(ColorimeterError::InsufficientData(
            "samples share a single abscissa".to_string(),
        ));
    }

    // Normal equations on the centred, scaled abscissa.
    let mut normal = Matrix3::<f64>::zeros();
    let mut rhs = Vector3::<f64>::zeros();
    for (x, ln_y) in &samples {
        let u = (x - center) / scale;
        let basis = Vector3::new(1.0, u, u * u);
        normal += basis * basis.transpose();
        rhs += basis * *ln_y;
    }
    let coefficients = normal
        .try_inverse()
        .map(|inverse| inverse * rhs)
        .ok_or_else(|| ColorimeterError::NoPeak("degenerate sample layout".to_string()))?;
    let (a, b, c) = (coefficients[0], coefficients[1], coefficients[2]);

    if !(c < 0.0) {
        return Err(ColorimeterError::NoPeak(format!(
            "curve has no maximum (curvature {:.3e})",
            c
        )));
    }
    let peak_u = -b / (2.0 * c);
    let peak = center + peak_u * scale;
    if !peak.is_finite() || peak < min_x || peak > max_x {
        return Err(ColorimeterError::NoPeak(format!(
            "fitted peak {} outside sampled range [{}, {}]",
            peak, min_x, max_x
        )));
    }

    Ok(GaussianFit {
        peak,
        amplitude: (a + b * peak_u + c * peak_u * peak_u).exp(),
        sigma: scale * (-1.0 / (2.0 * c)).sqrt(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn gaussian(x: f64, mu: f64, sigma: f64) -> f64 {
        0.8 * (-(x - mu).powi(2) / (2.0 * sigma * sigma)).exp()
    }

    #[test]
    fn recovers_exact_gaussian() {
        let xs: Vec<f64> = (0..11).map(|i| 90.0 + i as f64 * 2.0).collect();
        let ys: Vec<f64> = xs.iter().map(|x| gaussian(*x, 101.3, 6.0)).collect();
        let fit = fit_gaussian(&xs, &ys).unwrap();
        assert!((fit.peak - 101.3).abs() < 1e-6, "peak {}", fit.peak);
        assert!((fit.sigma - 6.0).abs() < 1e-6);
        assert!((fit.amplitude - 0.8).abs() < 1e-9);
    }

    #[test]
    fn monotonic_curve_has_no_peak() {
        let xs: Vec<f64> = (0..9).map(f64::from).collect();
        let ys: Vec<f64> = xs.iter().map(|x| (0.3 * x).exp()).collect();
        let err = fit_gaussian(&xs, &ys).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoPeak);
    }

    #[test]
    fn too_few_samples() {
        let err = fit_gaussian(&[1.0, 2.0, 3.0], &[0.5, 0.0, -1.0]).unwrap_err();
        assert!(matches!(err, ColorimeterError::InsufficientData(_)));
    }

    #[test]
    fn moving_average_preserves_length() {
        let smoothed = moving_average(&[1.0, 2.0, 3.0, 4.0, 5.0], 1);
        assert_eq!(smoothed, vec![1.5, 2.0, 3.0, 4.0, 4.5]);
        assert_eq!(moving_average(&[1.0, 9.0], 0), vec![1.0, 9.0]);
    }
}
