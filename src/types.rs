//! Domain value types shared by the managers, the focus engine and the
//! calibration pipeline.

use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Single-channel image buffer in digital counts (row-major, `[rows, cols]`).
pub type Image = Array2<f64>;

/// Which eye a module represents in a binocular rig.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum EyeMode {
    /// First (left) eye.
    #[default]
    Eye1,
    /// Second (right) eye.
    Eye2,
    /// Module covers both eyes.
    Both,
}

/// Fan-out policy across modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default)]
pub enum OperationMode {
    /// Issue to every module concurrently.
    #[default]
    Parallel,
    /// Issue module n+1 only after module n completed.
    Serial,
}

/// Filter wheel position / capture channel.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum FilterChannel {
    /// CIE X tristimulus filter.
    X,
    /// CIE Y tristimulus filter.
    Y,
    /// CIE Z tristimulus filter.
    Z,
    /// Neutral density, OD 0.
    ND0,
    /// Neutral density, OD 1.
    ND1,
    /// Neutral density, OD 2.
    ND2,
    /// Neutral density, OD 3.
    ND3,
    /// Neutral density, OD 4.
    ND4,
    /// Neutral density, OD 5.
    ND5,
    /// Open slot.
    Clear,
    /// Opaque slot.
    Block,
    /// Customer slot 1.
    Customer1,
    /// Customer slot 2.
    Customer2,
    /// Customer slot 3.
    Customer3,
    /// Customer slot 4.
    Customer4,
    /// Customer slot 5.
    Customer5,
    /// Customer slot 6.
    Customer6,
    /// Customer slot 7.
    Customer7,
    /// Customer slot 8.
    Customer8,
    /// Customer slot 9.
    Customer9,
    /// Customer slot 10.
    Customer10,
    /// Not reported by the wheel.
    Unknown,
}

impl FilterChannel {
    /// The tristimulus colour channels in pipeline order.
    pub const XYZ: [FilterChannel; 3] = [FilterChannel::X, FilterChannel::Y, FilterChannel::Z];

    /// True for the X/Y/Z colour filters.
    pub fn is_color(self) -> bool {
        Self::XYZ.contains(&self)
    }

    /// True for ND0..ND5.
    pub fn is_neutral_density(self) -> bool {
        matches!(
            self,
            FilterChannel::ND0
                | FilterChannel::ND1
                | FilterChannel::ND2
                | FilterChannel::ND3
                | FilterChannel::ND4
                | FilterChannel::ND5
        )
    }
}

/// Refractive correction realised by the RX wheel, its axis and the focus motor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RxCombination {
    /// Spherical power (diopters).
    pub sphere: f64,
    /// Cylindrical power (diopters).
    pub cylinder: f64,
    /// Cylinder axis (degrees).
    pub axis: i32,
}

impl RxCombination {
    /// Sentinel meaning "no RX configured".
    pub const UNSET: RxCombination = RxCombination {
        sphere: f64::MAX,
        cylinder: f64::MAX,
        axis: i32::MAX,
    };

    /// Build a combination.
    pub fn new(sphere: f64, cylinder: f64, axis: i32) -> Self {
        Self {
            sphere,
            cylinder,
            axis,
        }
    }

    /// False when every field still holds the sentinel.
    pub fn is_set(&self) -> bool {
        self.sphere != f64::MAX || self.cylinder != f64::MAX || self.axis != i32::MAX
    }
}

impl Default for RxCombination {
    fn default() -> Self {
        Self::UNSET
    }
}

impl std::fmt::Display for RxCombination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.is_set() {
            return write!(f, "RX(unset)");
        }
        write!(
            f,
            "S{:+.2}_C{:+.2}_A{}",
            self.sphere, self.cylinder, self.axis
        )
    }
}

/// Exposure control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExposureMode {
    /// Use the given exposure time.
    Fixed,
    /// Iterate toward a target grey level starting at the given time.
    #[default]
    Auto,
}

/// Camera exposure request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ExposureSetting {
    /// Fixed or auto.
    pub mode: ExposureMode,
    /// Exposure time (fixed) or initial time (auto), milliseconds.
    pub exposure_time_ms: f64,
}

impl ExposureSetting {
    /// Fixed exposure of `ms` milliseconds.
    pub fn fixed(ms: f64) -> Self {
        Self {
            mode: ExposureMode::Fixed,
            exposure_time_ms: ms,
        }
    }

    /// Auto exposure starting from `initial_ms`.
    pub fn auto(initial_ms: f64) -> Self {
        Self {
            mode: ExposureMode::Auto,
            exposure_time_ms: initial_ms,
        }
    }
}

/// Sensor binning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
pub enum Binning {
    #[default]
    #[strum(serialize = "1x1")]
    OneByOne,
    #[strum(serialize = "2x2")]
    TwoByTwo,
    #[strum(serialize = "4x4")]
    FourByFour,
    #[strum(serialize = "8x8")]
    EightByEight,
}

impl Binning {
    /// Pixels combined along each axis.
    pub fn factor(self) -> usize {
        match self {
            Binning::OneByOne => 1,
            Binning::TwoByTwo => 2,
            Binning::FourByFour => 4,
            Binning::EightByEight => 8,
        }
    }
}

/// How binned pixels are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
pub enum BinningMode {
    /// Sum of the binned pixels.
    Sum,
    /// Mean of the binned pixels.
    #[default]
    Average,
}

/// Camera pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
pub enum PixelFormat {
    Mono8,
    Mono10,
    #[default]
    Mono12,
    Mono16,
    Rgb24,
    Bayer,
    BayerGb8,
    BayerGb10,
    BayerGb12,
}

impl PixelFormat {
    /// Bits per channel.
    pub fn bit_depth(self) -> u32 {
        match self {
            PixelFormat::Mono8 | PixelFormat::Rgb24 | PixelFormat::Bayer | PixelFormat::BayerGb8 => 8,
            PixelFormat::Mono10 | PixelFormat::BayerGb10 => 10,
            PixelFormat::Mono12 | PixelFormat::BayerGb12 => 12,
            PixelFormat::Mono16 => 16,
        }
    }

    /// Largest representable count.
    pub fn max_value(self) -> f64 {
        ((1u32 << self.bit_depth()) - 1) as f64
    }
}

/// VID ↔ position conversion method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FocusMethod {
    /// Newtonian inverse mapping: `position = reference + f² / vid`.
    #[default]
    Inverse,
}

/// Flat-field reference construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FfcMethod {
    /// Single flat image.
    #[default]
    Normal,
    /// Mean of several flat captures.
    Synthetic,
}

/// Calibration pipeline stage; also keys the result map.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
pub enum CalibrationStage {
    /// Captures as acquired.
    Raw,
    /// Dark subtraction.
    Dark,
    /// Flat-field correction.
    #[strum(serialize = "FFC")]
    Ffc,
    /// Per-filter registration.
    ColorShift,
    /// Lens undistortion.
    Distortion,
    /// Exposure normalisation.
    Exposure,
    /// XYZ colour matrix.
    FourColor,
    /// Luminance K-map.
    Luminance,
    /// Field-of-view crop.
    #[strum(serialize = "FOVCrop")]
    FovCrop,
}

impl CalibrationStage {
    /// Fixed execution order of the correction stages.
    pub const PIPELINE: [CalibrationStage; 8] = [
        CalibrationStage::Dark,
        CalibrationStage::Ffc,
        CalibrationStage::ColorShift,
        CalibrationStage::Distortion,
        CalibrationStage::Exposure,
        CalibrationStage::FourColor,
        CalibrationStage::Luminance,
        CalibrationStage::FovCrop,
    ];
}

/// Rectangular region of interest in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Roi {
    /// Left column.
    pub x: usize,
    /// Top row.
    pub y: usize,
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
}

impl Roi {
    /// Build a ROI.
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// True for a zero-area ROI.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Clip the ROI to an image of `rows × cols`; `None` if nothing remains.
    pub fn clip(&self, rows: usize, cols: usize) -> Option<Roi> {
        if self.x >= cols || self.y >= rows {
            return None;
        }
        let width = self.width.min(cols - self.x);
        let height = self.height.min(rows - self.y);
        let clipped = Roi::new(self.x, self.y, width, height);
        (!clipped.is_empty()).then_some(clipped)
    }
}

/// Immutable identity of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleIdentity {
    /// Numeric id, unique within a `MultiModuleManager`.
    pub id: i32,
    /// Hardware serial number.
    pub serial_number: String,
    /// Display name.
    pub name: String,
    /// Config key.
    pub key: String,
    /// Eye assignment.
    pub eye_mode: EyeMode,
}

/// One raw acquisition plus the physical state at capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureData {
    /// Module serial number.
    pub serial_number: String,
    /// Module name.
    pub module_name: String,
    /// Module key.
    pub key: String,
    /// Aperture label.
    pub aperture: String,
    /// Light source label.
    pub light_source: String,
    /// ND filter in the beam.
    pub nd_filter: FilterChannel,
    /// Colour filter in the beam.
    pub color_filter: FilterChannel,
    /// RX realised at capture time.
    pub movement_rx: RxCombination,
    /// VID (mm) at capture time.
    pub vid: f64,
    /// Exposure (ms).
    pub exposure_time_ms: f64,
    /// Camera binning.
    pub binning: Binning,
    /// Camera pixel format.
    pub pixel_format: PixelFormat,
    /// Set once a dark frame has been subtracted from `image`.
    pub dark_subtracted: bool,
    /// Acquisition time.
    pub captured_at: DateTime<Utc>,
    /// Pixels.
    pub image: Image,
}

impl Default for CaptureData {
    fn default() -> Self {
        Self {
            serial_number: String::new(),
            module_name: String::new(),
            key: String::new(),
            aperture: "3mm".to_string(),
            light_source: String::new(),
            nd_filter: FilterChannel::ND0,
            color_filter: FilterChannel::X,
            movement_rx: RxCombination::UNSET,
            vid: 0.0,
            exposure_time_ms: 100.0,
            binning: Binning::OneByOne,
            pixel_format: PixelFormat::Mono12,
            dark_subtracted: false,
            captured_at: DateTime::<Utc>::UNIX_EPOCH,
            image: Image::zeros((0, 0)),
        }
    }
}

impl CaptureData {
    /// Same metadata with a different image.
    pub fn with_image(&self, image: Image) -> Self {
        Self {
            image,
            ..self.clone()
        }
    }
}

/// Output of one calibration stage for one filter channel.
pub type CaliProcessData = CaptureData;
