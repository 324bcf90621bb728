//! Sharpness metrics used by the through-focus search.
//!
//! The coarse phase ranks positions with the pixel standard deviation, which is
//! cheap and monotone in contrast. The fine phase measures the modulation
//! transfer at a single spatial frequency from the edge spread function
//! (chessboard targets) or the line spread function (cross-hair targets).

use crate::types::{Image, Roi};
use ndarray::{Array1, ArrayView2, Axis};
use num_complex::Complex64;
use std::f64::consts::PI;

/// Scores captured frames for the coarse and fine phases.
pub trait SharpnessMetric: Send + Sync {
    /// Coarse-phase score; larger is sharper.
    fn proxy(&self, image: &Image, rois: &[Roi]) -> f64;

    /// Fine-phase score; non-positive values mark an unusable sample.
    fn fine(&self, image: &Image, rois: &[Roi]) -> f64;
}

/// Standard deviation proxy plus single-frequency MTF.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MtfMetric {
    /// Evaluation frequency in cycles per (binned) pixel.
    pub cycles_per_pixel: f64,
    /// Edge target when true, line target otherwise.
    pub chess_mode: bool,
}

impl MtfMetric {
    /// Metric evaluated at `cycles_per_pixel`.
    pub fn new(cycles_per_pixel: f64, chess_mode: bool) -> Self {
        Self {
            cycles_per_pixel,
            chess_mode,
        }
    }
}

impl SharpnessMetric for MtfMetric {
    fn proxy(&self, image: &Image, rois: &[Roi]) -> f64 {
        std_proxy(image, rois)
    }

    fn fine(&self, image: &Image, rois: &[Roi]) -> f64 {
        let values: Vec<f64> = regions(image, rois)
            .into_iter()
            .filter_map(|view| {
                if self.chess_mode {
                    edge_mtf(view, self.cycles_per_pixel)
                } else {
                    line_mtf(view, self.cycles_per_pixel)
                }
            })
            .collect();
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }
}

/// Convert the configured frequency to cycles per binned pixel.
///
/// `lpmm_unit` selects line pairs per millimetre on the sensor; otherwise
/// `freq` is in line pairs per degree of field, converted with the module
/// focal length.
pub fn cycles_per_pixel(
    freq: f64,
    lpmm_unit: bool,
    pixel_size_um: f64,
    binning_factor: usize,
    focal_length_mm: f64,
) -> f64 {
    let pixel_mm = pixel_size_um * 1e-3 * binning_factor.max(1) as f64;
    if lpmm_unit {
        freq * pixel_mm
    } else {
        let mm_per_degree = focal_length_mm * 1f64.to_radians().tan();
        freq * pixel_mm / mm_per_degree
    }
}

fn regions<'a>(image: &'a Image, rois: &[Roi]) -> Vec<ArrayView2<'a, f64>> {
    if rois.is_empty() {
        return vec![image.view()];
    }
    let (rows, cols) = image.dim();
    rois.iter()
        .filter_map(|roi| roi.clip(rows, cols))
        .map(|roi| {
            image.slice(ndarray::s![
                roi.y..roi.y + roi.height,
                roi.x..roi.x + roi.width
            ])
        })
        .collect()
}

/// Mean over ROIs of the pixel standard deviation; full frame without ROIs.
pub fn std_proxy(image: &Image, rois: &[Roi]) -> f64 {
    let values: Vec<f64> = regions(image, rois)
        .into_iter()
        .filter(|view| !view.is_empty())
        .map(|view| view.std(0.0))
        .collect();
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Sum of absolute first differences along `axis`.
fn gradient_energy(view: ArrayView2<'_, f64>, axis: Axis) -> f64 {
    let len = view.len_of(axis);
    if len < 2 {
        return 0.0;
    }
    let head = view.slice_axis(axis, (0..len - 1).into());
    let tail = view.slice_axis(axis, (1..len).into());
    (&tail - &head).iter().map(|value| value.abs()).sum()
}

/// Profile across the dominant edge/line direction.
fn profile(view: ArrayView2<'_, f64>) -> Option<Array1<f64>> {
    let across_columns =
        gradient_energy(view, Axis(1)) >= gradient_energy(view, Axis(0));
    if across_columns {
        view.mean_axis(Axis(0))
    } else {
        view.mean_axis(Axis(1))
    }
}

/// MTF at `cycles_per_pixel` from the edge spread function of `view`.
pub fn edge_mtf(view: ArrayView2<'_, f64>, cycles_per_pixel: f64) -> Option<f64> {
    let esf = profile(view)?;
    if esf.len() < 4 {
        return None;
    }
    let lsf: Vec<f64> = (1..esf.len()).map(|i| esf[i] - esf[i - 1]).collect();
    // Falling edges give a negative LSF.
    let sign = lsf.iter().sum::<f64>().signum();
    let lsf: Vec<f64> = lsf.iter().map(|value| value * sign).collect();
    spectrum_ratio(&lsf, cycles_per_pixel)
}

/// MTF at `cycles_per_pixel` from the line spread function of `view`.
pub fn line_mtf(view: ArrayView2<'_, f64>, cycles_per_pixel: f64) -> Option<f64> {
    let line = profile(view)?;
    if line.len() < 4 {
        return None;
    }
    let floor = line.iter().cloned().fold(f64::INFINITY, f64::min);
    let lsf: Vec<f64> = line.iter().map(|value| value - floor).collect();
    spectrum_ratio(&lsf, cycles_per_pixel)
}

/// `|F(f)| / |F(0)|` of the Hann-windowed line spread function.
fn spectrum_ratio(lsf: &[f64], frequency: f64) -> Option<f64> {
    let n = lsf.len();
    let last = (n - 1) as f64;
    let windowed: Vec<f64> = lsf
        .iter()
        .enumerate()
        .map(|(i, value)| value * (0.5 - 0.5 * (2.0 * PI * i as f64 / last).cos()))
        .collect();

    let dc: f64 = windowed.iter().sum();
    if !dc.is_finite() || dc.abs() <= f64::EPSILON {
        return None;
    }
    let component: Complex64 = windowed
        .iter()
        .enumerate()
        .map(|(i, value)| Complex64::from_polar(*value, -2.0 * PI * frequency * i as f64))
        .sum();
    let ratio = component.norm() / dc.abs();
    ratio.is_finite().then_some(ratio)
}

/// Intersection of a bright cross-hair: the brightest column and row of the
/// mean profiles. `None` for a featureless image.
pub fn cross_center(image: &Image) -> Option<(usize, usize)> {
    let column_profile = image.mean_axis(Axis(0))?;
    let row_profile = image.mean_axis(Axis(1))?;
    let argmax = |values: &Array1<f64>| {
        values
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(index, _)| index)
    };
    let x = argmax(&column_profile)?;
    let y = argmax(&row_profile)?;
    let flat = column_profile.iter().all(|value| (value - column_profile[x]).abs() < 1e-9);
    (!flat).then_some((x, y))
}

/// Four square ROIs of side `size` on the arms of a cross-hair, `offset`
/// pixels from its centre (left, right, top, bottom).
pub fn cross_rois(image: &Image, offset: usize, size: usize) -> Vec<Roi> {
    let Some((cx, cy)) = cross_center(image) else {
        return Vec::new();
    };
    let half = size / 2;
    let (rows, cols) = image.dim();
    let centers = [
        (cx.checked_sub(offset), Some(cy)),
        (Some(cx + offset), Some(cy)),
        (Some(cx), cy.checked_sub(offset)),
        (Some(cx), Some(cy + offset)),
    ];
    centers
        .iter()
        .filter_map(|(x, y)| {
            let (x, y) = ((*x)?, (*y)?);
            Roi::new(x.checked_sub(half)?, y.checked_sub(half)?, size, size).clip(rows, cols)
        })
        .collect()
}
