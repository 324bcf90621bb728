//! Coarse + fine through-focus search.
//!
//! The engine drives a [`FocusBench`] (a focus axis plus a camera) through two
//! scans:
//!
//! 1. **Coarse**: `focus_min..=focus_max` by `rough_step`, ranked by the
//!    metric's cheap proxy.
//! 2. **Fine**: `fine_range` centred on the coarse optimum by `fine_step`,
//!    scored by MTF and fitted with a Gaussian over the axis position.
//!
//! The axis position is affine in dioptric power (`1000 / VID`), so the fit
//! stays well posed when the window straddles the infinity position. The
//! fitted position is reported with the VID it images and the axis is parked
//! there. Every sampled point ends up in [`ThroughFocusCurves`], also when the
//! search fails.

use crate::config::ThroughFocusConfig;
use crate::error::{AppResult, ColorimeterError};
use crate::focus::fit::{fit_gaussian, moving_average};
use crate::focus::metric::SharpnessMetric;
use crate::types::Image;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// Hardware seen by the engine.
#[async_trait]
pub trait FocusBench: Send + Sync {
    /// Move the focus axis to `position` and wait until it settled.
    async fn move_to(&self, position: f64) -> AppResult<()>;

    /// Acquire one frame at the current position.
    async fn grab(&self) -> AppResult<Image>;

    /// VID imaged at axis `position`; infinite at the reference position.
    fn vid_for_position(&self, position: f64) -> f64;
}

/// Sampled curves of one search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThroughFocusCurves {
    /// Coarse axis positions.
    pub rough_motion: Vec<f64>,
    /// VID (mm) of each coarse position.
    pub rough_vid: Vec<f64>,
    /// Coarse sharpness proxy.
    pub rough_std: Vec<f64>,
    /// Fine axis positions.
    pub motion: Vec<f64>,
    /// VID (mm) of each fine position.
    pub vid: Vec<f64>,
    /// Fine MTF scores.
    pub mtf: Vec<f64>,
}

/// Best focus found by a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusPeak {
    /// VID at best focus (mm).
    pub vid: f64,
    /// Axis position at best focus.
    pub position: f64,
    /// Fitted peak MTF, or the best sampled score when not fitted.
    pub score: f64,
    /// True when the peak comes from the Gaussian fit.
    pub fitted: bool,
    /// Reason a phase was cut short; the peak is then best-so-far.
    pub degraded: Option<String>,
}

/// Outcome plus the curves sampled on the way.
#[derive(Debug)]
pub struct ThroughFocusRun {
    /// Every sample taken, also on failure.
    pub curves: ThroughFocusCurves,
    /// Best focus or the reason there is none.
    pub outcome: AppResult<FocusPeak>,
}

/// Runs the two-phase search for one configuration.
pub struct ThroughFocusEngine<M> {
    config: ThroughFocusConfig,
    metric: M,
}

impl<M: SharpnessMetric> ThroughFocusEngine<M> {
    /// Engine for `config` scored with `metric`.
    pub fn new(config: ThroughFocusConfig, metric: M) -> Self {
        Self { config, metric }
    }

    /// Coarse scan positions, `focus_min` up to and including `focus_max`.
    pub fn coarse_positions(&self) -> Vec<f64> {
        let span = self.config.focus_max - self.config.focus_min;
        let count = (span / self.config.rough_step + 1e-9).floor() as usize + 1;
        (0..count)
            .map(|i| self.config.focus_min + i as f64 * self.config.rough_step)
            .collect()
    }

    /// Fine scan positions centred on `center`.
    pub fn fine_positions(&self, center: f64) -> Vec<f64> {
        let start = center - self.config.fine_range / 2.0;
        (0..self.config.fine_sample_count())
            .map(|i| start + i as f64 * self.config.fine_step)
            .collect()
    }

    /// Run the search. Invalid configuration fails before any motion.
    #[instrument(skip_all, fields(focus_min = self.config.focus_min, focus_max = self.config.focus_max))]
    pub async fn run<P: FocusBench + ?Sized>(&self, bench: &P) -> ThroughFocusRun {
        let mut curves = ThroughFocusCurves::default();
        let outcome = match self.config.validate() {
            Ok(()) => self.search(bench, &mut curves).await,
            Err(err) => Err(err),
        };
        ThroughFocusRun { curves, outcome }
    }

    async fn search<P: FocusBench + ?Sized>(
        &self,
        bench: &P,
        curves: &mut ThroughFocusCurves,
    ) -> AppResult<FocusPeak> {
        let rois = &self.config.rois;

        // Coarse phase
        let mut degraded = None;
        for position in self.coarse_positions() {
            match self.sample(bench, position).await {
                Ok(image) => {
                    curves.rough_motion.push(position);
                    curves.rough_vid.push(bench.vid_for_position(position));
                    curves.rough_std.push(self.metric.proxy(&image, rois));
                }
                Err(err) if err.is_user_stop() => return Err(err),
                Err(err) if curves.rough_motion.is_empty() => return Err(err),
                Err(err) => {
                    warn!(position, error = %err, "coarse scan aborted");
                    degraded = Some(format!("coarse scan aborted at {}: {}", position, err));
                    break;
                }
            }
        }
        let coarse_index = argmax(&curves.rough_std).ok_or_else(|| {
            ColorimeterError::InsufficientData("coarse scan produced no samples".to_string())
        })?;
        let coarse_best = curves.rough_motion[coarse_index];
        debug!(coarse_best, "coarse optimum");

        if let Some(reason) = degraded {
            return Ok(FocusPeak {
                vid: curves.rough_vid[coarse_index],
                position: coarse_best,
                score: curves.rough_std[coarse_index],
                fitted: false,
                degraded: Some(reason),
            });
        }

        // Fine phase
        for position in self.fine_positions(coarse_best) {
            match self.sample(bench, position).await {
                Ok(image) => {
                    curves.motion.push(position);
                    curves.vid.push(bench.vid_for_position(position));
                    curves.mtf.push(self.metric.fine(&image, rois));
                }
                Err(err) if err.is_user_stop() => return Err(err),
                Err(err) => {
                    warn!(position, error = %err, "fine scan aborted");
                    degraded = Some(format!("fine scan aborted at {}: {}", position, err));
                    break;
                }
            }
        }

        // Fit over the axis coordinate: VID passes through infinity at the
        // reference position, the axis does not.
        let half_window = self.config.smooth.map(|s| s.round() as usize).unwrap_or(0);
        let smoothed = moving_average(&curves.mtf, half_window);
        let fitted = fit_gaussian(&curves.motion, &smoothed);

        if let Some(reason) = degraded {
            let peak = match (fitted, argmax(&curves.mtf)) {
                (Ok(fit), _) => FocusPeak {
                    vid: bench.vid_for_position(fit.peak),
                    position: fit.peak,
                    score: fit.amplitude,
                    fitted: true,
                    degraded: Some(reason),
                },
                (Err(_), Some(index)) => FocusPeak {
                    vid: curves.vid[index],
                    position: curves.motion[index],
                    score: curves.mtf[index],
                    fitted: false,
                    degraded: Some(reason),
                },
                (Err(_), None) => FocusPeak {
                    vid: curves.rough_vid[coarse_index],
                    position: coarse_best,
                    score: curves.rough_std[coarse_index],
                    fitted: false,
                    degraded: Some(reason),
                },
            };
            return Ok(peak);
        }

        let fit = fitted?;
        let position = fit.peak;
        let mut peak = FocusPeak {
            vid: bench.vid_for_position(position),
            position,
            score: fit.amplitude,
            fitted: true,
            degraded: None,
        };
        if let Err(err) = bench.move_to(position).await {
            if err.is_user_stop() {
                return Err(err);
            }
            warn!(position, error = %err, "could not park at best focus");
            peak.degraded = Some(format!("final move to {} failed: {}", position, err));
        }
        info!(vid = peak.vid, position = peak.position, score = peak.score, "best focus");
        Ok(peak)
    }

    async fn sample<P: FocusBench + ?Sized>(&self, bench: &P, position: f64) -> AppResult<Image> {
        bench.move_to(position).await?;
        bench.grab().await
    }
}

fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, value)| value.is_finite())
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::focus::mapping::FocusCurve;
    use crate::types::Roi;
    use parking_lot::Mutex;

    /// Mean grey level is a Gaussian of the axis position.
    struct GaussianBench {
        best: f64,
        width: f64,
        position: Mutex<f64>,
        moves: Mutex<Vec<f64>>,
        fail_after: Option<usize>,
        stop_after: Option<usize>,
        curve: FocusCurve,
    }

    impl GaussianBench {
        fn new(best: f64) -> Self {
            Self {
                best,
                width: 0.6,
                curve: FocusCurve::inverse(50.0, -20.0),
                position: Mutex::new(0.0),
                moves: Mutex::new(Vec::new()),
                fail_after: None,
                stop_after: None,
            }
        }
    }

    #[async_trait]
    impl FocusBench for GaussianBench {
        async fn move_to(&self, position: f64) -> AppResult<()> {
            let mut moves = self.moves.lock();
            if self.stop_after.is_some_and(|n| moves.len() >= n) {
                return Err(ColorimeterError::UserStop("focus".into()));
            }
            if self.fail_after.is_some_and(|n| moves.len() >= n) {
                return Err(ColorimeterError::NotConnected("focus".into()));
            }
            moves.push(position);
            *self.position.lock() = position;
            Ok(())
        }

        async fn grab(&self) -> AppResult<Image> {
            let offset = *self.position.lock() - self.best;
            let level = 0.9 * (-(offset * offset) / (2.0 * self.width * self.width)).exp();
            Ok(Image::from_elem((4, 4), level))
        }

        fn vid_for_position(&self, position: f64) -> f64 {
            self.curve.vid_for_position(position)
        }
    }

    struct MeanMetric;

    impl SharpnessMetric for MeanMetric {
        fn proxy(&self, image: &Image, _rois: &[Roi]) -> f64 {
            image.mean().unwrap_or(0.0)
        }

        fn fine(&self, image: &Image, _rois: &[Roi]) -> f64 {
            image.mean().unwrap_or(0.0)
        }
    }

    fn config() -> ThroughFocusConfig {
        ThroughFocusConfig {
            focus_min: 0.0,
            focus_max: 4.0,
            rough_step: 0.5,
            fine_range: 1.0,
            fine_step: 0.1,
            freq: 20.0,
            smooth: None,
            rois: vec![],
            chess_mode: true,
            lpmm_unit: true,
            pixel_size_um: 5.5,
            move_timeout_ms: 1_000,
        }
    }

    #[test]
    fn scan_positions() {
        let engine = ThroughFocusEngine::new(config(), MeanMetric);
        assert_eq!(engine.coarse_positions().len(), 9);
        let fine = engine.fine_positions(2.0);
        assert_eq!(fine.len(), 11);
        assert!((fine[0] - 1.5).abs() < 1e-12);
        assert!((fine[10] - 2.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn recovers_gaussian_peak() {
        let bench = GaussianBench::new(2.13);
        let run = ThroughFocusEngine::new(config(), MeanMetric).run(&bench).await;
        let peak = run.outcome.unwrap();
        assert!(peak.fitted);
        assert!(peak.degraded.is_none());
        assert!((peak.position - 2.13).abs() < 0.1, "peak at {}", peak.position);
        assert_eq!(run.curves.rough_std.len(), 9);
        assert_eq!(run.curves.mtf.len(), 11);
        // Parked at the peak.
        assert_eq!(*bench.moves.lock().last().unwrap(), peak.position);
    }

    #[tokio::test]
    async fn invalid_config_moves_nothing() {
        let bench = GaussianBench::new(2.0);
        let mut bad = config();
        bad.fine_step = 0.3;
        let run = ThroughFocusEngine::new(bad, MeanMetric).run(&bench).await;
        assert_eq!(run.outcome.unwrap_err().kind(), ErrorKind::Configuration);
        assert!(bench.moves.lock().is_empty());
    }

    #[tokio::test]
    async fn fine_failure_returns_best_so_far() {
        let mut bench = GaussianBench::new(2.0);
        bench.fail_after = Some(9 + 4);
        let run = ThroughFocusEngine::new(config(), MeanMetric).run(&bench).await;
        let peak = run.outcome.unwrap();
        assert!(peak.degraded.is_some());
        assert_eq!(run.curves.mtf.len(), 4);
        assert!(!peak.fitted || (peak.position - 2.0).abs() < 0.5);
    }

    #[tokio::test]
    async fn peak_at_infinity_is_fitted() {
        let mut bench = GaussianBench::new(2.0);
        bench.curve = FocusCurve::inverse(100.0, 2.0);
        let run = ThroughFocusEngine::new(config(), MeanMetric).run(&bench).await;
        let peak = run.outcome.unwrap();
        assert!(peak.fitted);
        assert!((peak.position - 2.0).abs() < 1e-6, "peak at {}", peak.position);
        assert!(peak.vid.abs() > 1e6);
        // The window straddles infinity: VID flips sign across it.
        assert!(run.curves.vid[0] < -1e4);
        assert!(run.curves.vid[10] > 1e4);
    }

    #[tokio::test]
    async fn degraded_fit_across_infinity_keeps_best_so_far() {
        let mut bench = GaussianBench::new(2.0);
        bench.curve = FocusCurve::inverse(100.0, 2.0);
        bench.fail_after = Some(9 + 8);
        let run = ThroughFocusEngine::new(config(), MeanMetric).run(&bench).await;
        let peak = run.outcome.unwrap();
        assert!(peak.degraded.is_some());
        assert_eq!(run.curves.mtf.len(), 8);
        assert!((peak.position - 2.0).abs() < 0.1, "peak at {}", peak.position);
    }

    #[tokio::test]
    async fn user_stop_propagates() {
        let mut bench = GaussianBench::new(2.0);
        bench.stop_after = Some(3);
        let run = ThroughFocusEngine::new(config(), MeanMetric).run(&bench).await;
        let err = run.outcome.unwrap_err();
        assert_eq!(err.code().as_i32(), 1);
        assert_eq!(run.curves.rough_motion.len(), 3);
    }
}
