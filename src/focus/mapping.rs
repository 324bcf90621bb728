//! Conversion between virtual image distance (VID) and focus axis position.
//!
//! With [`FocusMethod::Inverse`] the axis follows Newton's form of the thin
//! lens equation:
//!
//! ```text
//! position = reference_position + f² / vid
//! vid      = f² / (position − reference_position)
//! ```
//!
//! VID is in millimetres; `vid = ±∞` (an object at infinity, 0 D) maps to
//! the reference position.

use crate::error::{AppResult, ColorimeterError};
use crate::types::FocusMethod;
use serde::{Deserialize, Serialize};

/// Focus axis calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusCurve {
    /// Mapping law.
    #[serde(default)]
    pub method: FocusMethod,
    /// Focal length of the focusing group (mm).
    pub focal_length_mm: f64,
    /// Axis position imaging an object at infinity.
    #[serde(default)]
    pub reference_position: f64,
}

impl FocusCurve {
    /// Inverse curve with the given focal length and reference position.
    pub fn inverse(focal_length_mm: f64, reference_position: f64) -> Self {
        Self {
            method: FocusMethod::Inverse,
            focal_length_mm,
            reference_position,
        }
    }

    /// Reject non-physical parameters.
    pub fn validate(&self) -> AppResult<()> {
        if !self.focal_length_mm.is_finite() || self.focal_length_mm <= 0.0 {
            return Err(ColorimeterError::config(format!(
                "focal_length_mm must be positive, got {}",
                self.focal_length_mm
            )));
        }
        if !self.reference_position.is_finite() {
            return Err(ColorimeterError::config("reference_position must be finite"));
        }
        Ok(())
    }

    /// Axis position that images an object at `vid` millimetres.
    pub fn position_for_vid(&self, vid: f64) -> AppResult<f64> {
        match self.method {
            FocusMethod::Inverse => {
                if vid.is_infinite() {
                    return Ok(self.reference_position);
                }
                if vid.is_nan() || vid == 0.0 {
                    return Err(ColorimeterError::config(format!(
                        "VID {} has no focus position",
                        vid
                    )));
                }
                Ok(self.reference_position + self.focal_length_mm.powi(2) / vid)
            }
        }
    }

    /// VID imaged at axis `position`; infinite at the reference position.
    pub fn vid_for_position(&self, position: f64) -> f64 {
        match self.method {
            FocusMethod::Inverse => {
                let offset = position - self.reference_position;
                if offset == 0.0 {
                    f64::INFINITY
                } else {
                    self.focal_length_mm.powi(2) / offset
                }
            }
        }
    }
}

/// VID (mm) corresponding to a spherical power in diopters.
pub fn diopters_to_vid(diopters: f64) -> f64 {
    if diopters == 0.0 {
        f64::INFINITY
    } else {
        1000.0 / diopters
    }
}

/// Spherical power (D) corresponding to a VID in millimetres.
pub fn vid_to_diopters(vid: f64) -> f64 {
    if vid.is_infinite() {
        0.0
    } else {
        1000.0 / vid
    }
}
