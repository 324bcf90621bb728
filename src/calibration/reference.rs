//! Reference ("pre-calibration") data consumed by the calibration stages.

use crate::error::{AppResult, ColorimeterError};
use crate::types::{FfcMethod, FilterChannel, Image, RxCombination};
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Measurement conditions a reference data set was recorded under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationContext {
    /// Aperture label.
    pub aperture: String,
    /// ND filter in the beam.
    pub nd_filter: FilterChannel,
    /// RX in effect.
    pub rx: RxCombination,
    /// Light source label.
    #[serde(default)]
    pub light_source: String,
}

impl Default for CalibrationContext {
    fn default() -> Self {
        Self {
            aperture: "3mm".to_string(),
            nd_filter: FilterChannel::ND0,
            rx: RxCombination::UNSET,
            light_source: String::new(),
        }
    }
}

impl CalibrationContext {
    /// Directory name of this context below a reference root,
    /// e.g. `3mm_ND0_S-1.00_C-0.50_A90_D65`.
    pub fn dir_name(&self) -> String {
        let rx = if self.rx.is_set() {
            self.rx.to_string()
        } else {
            "noRX".to_string()
        };
        let mut name = format!("{}_{}_{}", self.aperture, self.nd_filter, rx);
        if !self.light_source.is_empty() {
            name.push('_');
            name.push_str(&self.light_source);
        }
        name
    }
}

/// Sub-pixel registration offset of one filter, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PixelOffset {
    /// Column shift.
    pub dx: f64,
    /// Row shift.
    pub dy: f64,
}

/// Brown-Conrady coefficients in OpenCV order.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DistortionCoefficients {
    /// Radial, r².
    pub k1: f64,
    /// Radial, r⁴.
    pub k2: f64,
    /// Tangential.
    pub p1: f64,
    /// Tangential.
    pub p2: f64,
    /// Radial, r⁶.
    pub k3: f64,
}

impl DistortionCoefficients {
    /// Distort normalised undistorted coordinates.
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;

        let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;

        let x_tan = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let y_tan = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;

        (x * radial + x_tan, y * radial + y_tan)
    }
}

/// Pinhole camera with lens distortion and rectification rotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistortionModel {
    /// Intrinsics `[fx 0 cx; 0 fy cy; 0 0 1]`.
    pub camera_matrix: Matrix3<f64>,
    /// Lens distortion.
    pub coefficients: DistortionCoefficients,
    /// Rectification rotation.
    #[serde(default = "identity")]
    pub rotation: Matrix3<f64>,
}

fn identity() -> Matrix3<f64> {
    Matrix3::identity()
}

/// Flat-field reference of one filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlatField {
    /// One flat image.
    Normal(Image),
    /// Several flat captures averaged into one.
    Synthetic(Vec<Image>),
}

impl FlatField {
    /// Construction method of this flat.
    pub fn method(&self) -> FfcMethod {
        match self {
            FlatField::Normal(_) => FfcMethod::Normal,
            FlatField::Synthetic(_) => FfcMethod::Synthetic,
        }
    }

    /// The flat image to divide by.
    pub fn image(&self) -> AppResult<Image> {
        match self {
            FlatField::Normal(image) => Ok(image.clone()),
            FlatField::Synthetic(images) => {
                let first = images.first().ok_or_else(|| {
                    ColorimeterError::Processing("synthetic flat has no images".to_string())
                })?;
                let mut sum = Image::zeros(first.dim());
                for image in images {
                    if image.dim() != first.dim() {
                        return Err(ColorimeterError::Processing(format!(
                            "synthetic flat images differ in shape: {:?} vs {:?}",
                            image.dim(),
                            first.dim()
                        )));
                    }
                    sum += image;
                }
                Ok(sum / images.len() as f64)
            }
        }
    }
}

/// Luminance correction of one filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LuminanceMap {
    /// One factor for the whole frame.
    Scalar(f64),
    /// Per-pixel factors, same shape as the image.
    Map(Image),
}

/// Field-of-view crop around the optical centre.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FovCrop {
    /// Optical centre column (pixels).
    pub center_x: f64,
    /// Optical centre row (pixels).
    pub center_y: f64,
    /// Full angular field kept (degrees).
    pub fov_deg: f64,
    /// Imaging focal length (mm).
    pub focal_length_mm: f64,
    /// Sensor pixel pitch (µm).
    pub pixel_size_um: f64,
}

/// Everything the stages need besides the captures themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreCalibrationData {
    /// Conditions the data was recorded under.
    pub context: CalibrationContext,
    /// Flat field per filter.
    pub flats: BTreeMap<FilterChannel, FlatField>,
    /// Per-filter dark frames used when the dark library has no match.
    pub darks: BTreeMap<FilterChannel, Image>,
    /// Registration offset per filter.
    pub color_shift: BTreeMap<FilterChannel, PixelOffset>,
    /// Lens model.
    pub distortion: Option<DistortionModel>,
    /// XYZ colour matrix `M`, `[X', Y', Z'] = M · [X, Y, Z]`.
    pub four_color: Option<Matrix3<f64>>,
    /// K-map per filter.
    pub luminance: BTreeMap<FilterChannel, LuminanceMap>,
    /// Field-of-view crop.
    pub fov_crop: Option<FovCrop>,
}

/// Dark frames indexed by exposure time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DarkLibrary {
    frames: Vec<(f64, Image)>,
}

impl DarkLibrary {
    /// Empty library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the dark frame for `exposure_ms`.
    pub fn insert(&mut self, exposure_ms: f64, image: Image) {
        match self
            .frames
            .iter_mut()
            .find(|(exposure, _)| *exposure == exposure_ms)
        {
            Some(entry) => entry.1 = image,
            None => {
                self.frames.push((exposure_ms, image));
                self.frames.sort_by(|a, b| a.0.total_cmp(&b.0));
            }
        }
    }

    /// Frame with the exposure closest to `exposure_ms`; ties pick the shorter.
    pub fn nearest(&self, exposure_ms: f64) -> Option<&Image> {
        self.frames
            .iter()
            .min_by(|a, b| (a.0 - exposure_ms).abs().total_cmp(&(b.0 - exposure_ms).abs()))
            .map(|(_, image)| image)
    }

    /// Exposure times present, ascending.
    pub fn exposures(&self) -> Vec<f64> {
        self.frames.iter().map(|(exposure, _)| *exposure).collect()
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True without frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dark_library_picks_nearest_exposure() {
        let mut library = DarkLibrary::new();
        library.insert(100.0, Image::from_elem((2, 2), 10.0));
        library.insert(10.0, Image::from_elem((2, 2), 1.0));
        library.insert(1000.0, Image::from_elem((2, 2), 100.0));
        assert_eq!(library.exposures(), vec![10.0, 100.0, 1000.0]);
        assert_eq!(library.nearest(80.0).unwrap()[[0, 0]], 10.0);
        assert_eq!(library.nearest(700.0).unwrap()[[0, 0]], 100.0);
        assert_eq!(library.nearest(0.0).unwrap()[[0, 0]], 1.0);

        library.insert(10.0, Image::from_elem((2, 2), 2.0));
        assert_eq!(library.len(), 3);
        assert_eq!(library.nearest(10.0).unwrap()[[0, 0]], 2.0);
        assert!(DarkLibrary::new().nearest(1.0).is_none());
    }

    #[test]
    fn synthetic_flat_is_mean() {
        let flat = FlatField::Synthetic(vec![
            Image::from_elem((2, 3), 2.0),
            Image::from_elem((2, 3), 4.0),
        ]);
        assert_eq!(flat.method(), FfcMethod::Synthetic);
        assert_eq!(flat.image().unwrap(), Image::from_elem((2, 3), 3.0));
        assert!(FlatField::Synthetic(vec![]).image().is_err());
    }

    #[test]
    fn context_directory_name() {
        let mut context = CalibrationContext::default();
        assert_eq!(context.dir_name(), "3mm_ND0_noRX");
        context.rx = RxCombination::new(-1.0, -0.5, 90);
        context.light_source = "D65".into();
        assert_eq!(context.dir_name(), "3mm_ND0_S-1.00_C-0.50_A90_D65");
    }

    #[test]
    fn zero_coefficients_do_not_distort() {
        let coefficients = DistortionCoefficients::default();
        assert_eq!(coefficients.distort(0.3, -0.2), (0.3, -0.2));
        let barrel = DistortionCoefficients {
            k1: -0.1,
            ..Default::default()
        };
        let (x, _) = barrel.distort(0.5, 0.0);
        assert!(x < 0.5);
    }

    #[test]
    fn pre_calibration_json_round_trip() {
        let mut data = PreCalibrationData::default();
        data.four_color = Some(Matrix3::identity() * 2.0);
        data.color_shift
            .insert(FilterChannel::Z, PixelOffset { dx: 0.5, dy: -0.25 });
        data.flats
            .insert(FilterChannel::X, FlatField::Normal(Image::from_elem((2, 2), 1.0)));
        let text = serde_json::to_string(&data).unwrap();
        let back: PreCalibrationData = serde_json::from_str(&text).unwrap();
        assert_eq!(back, data);
    }
}
