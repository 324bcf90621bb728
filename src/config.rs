//! Configuration System using Figment
//!
//! Strongly-typed configuration for colorimeter modules, the through-focus
//! search and the calibration pipeline. Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `ML_COLORIMETER_` (nested keys
//!    separated by `__`, e.g. `ML_COLORIMETER_APPLICATION__LOG_LEVEL=debug`)
//!
//! Every device entry names a `driver` type resolved through the
//! [`DriverRegistry`](crate::hardware::registry::DriverRegistry) and carries a
//! free-form `settings` table parsed by that driver's factory.
//!
//! # Example
//! ```no_run
//! use ml_colorimeter::config::AppConfig;
//!
//! let config = AppConfig::load_from("config/colorimeter.toml")?;
//! config.validate()?;
//! println!("{} modules", config.modules.len());
//! # Ok::<(), ml_colorimeter::error::ColorimeterError>(())
//! ```

use crate::calibration::reference::CalibrationContext;
use crate::error::{AppResult, ColorimeterError};
use crate::focus::mapping::FocusCurve;
use crate::module::rx::RxMappingRule;
use crate::types::{
    CalibrationStage, EyeMode, FilterChannel, OperationMode, Roi, RxCombination,
};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default bound for module-level `wait_for_moving_stop`.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 10_000;
/// Default bound for a synchronous ND/XYZ wheel move.
pub const DEFAULT_FILTER_WHEEL_TIMEOUT_MS: u64 = 20_000;
/// Default bound for a synchronous RX wheel move.
pub const DEFAULT_RX_WHEEL_TIMEOUT_MS: u64 = 30_000;

const ENV_PREFIX: &str = "ML_COLORIMETER_";

// =============================================================================
// Top level
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Default fan-out policy
    #[serde(default)]
    pub operation_mode: OperationMode,
    /// Module definitions
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    /// Optional inter-pupillary distance axis shared by a binocular rig
    #[serde(default)]
    pub ipd_motion: Option<MotionConfig>,
    /// Calibration defaults
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Output settings for calibration results
    #[serde(default)]
    pub save: SaveDataConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "ml-colorimeter".to_string(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file plus environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ColorimeterError::config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut ids = HashSet::new();
        for module in &self.modules {
            if !ids.insert(module.id) {
                return Err(ColorimeterError::config(format!(
                    "Duplicate module id: {}",
                    module.id
                )));
            }
            module.validate()?;
        }

        self.calibration.validate()
    }
}

// =============================================================================
// Module and devices
// =============================================================================

/// Configuration of one colorimeter module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Numeric id, unique within a rig
    pub id: i32,
    /// Hardware serial number
    pub serial_number: String,
    /// Display name
    pub name: String,
    /// Config key
    pub key: String,
    /// Eye assignment
    #[serde(default)]
    pub eye_mode: EyeMode,
    /// Measurement camera
    pub camera: CameraConfig,
    /// Motion axes keyed by `MotionConfig::key`
    #[serde(default)]
    pub motions: Vec<MotionConfig>,
    /// ND / XYZ filter wheels
    #[serde(default)]
    pub filter_wheels: Vec<FilterWheelConfig>,
    /// Optional cylinder wheel with its rotation axis
    #[serde(default)]
    pub rx_filter_wheel: Option<RxFilterWheelConfig>,
    /// Key of the axis driven by `set_focus_*`
    #[serde(default)]
    pub focus_axis: Option<String>,
    /// Auto exposure tuning
    #[serde(default)]
    pub auto_exposure: AutoExposureConfig,
    /// Default bound for `wait_for_moving_stop`
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_ms: u64,
}

impl ModuleConfig {
    /// Load a single module definition from a TOML file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Figment::new().merge(Toml::file(path.as_ref())).extract()?)
    }

    /// Look up a motion config by key.
    pub fn motion(&self, key: &str) -> Option<&MotionConfig> {
        self.motions.iter().find(|motion| motion.key == key)
    }

    /// Check keys are unique and references resolve.
    pub fn validate(&self) -> AppResult<()> {
        let mut keys = HashSet::new();
        for motion in &self.motions {
            if !keys.insert(motion.key.as_str()) {
                return Err(ColorimeterError::config(format!(
                    "Module {}: duplicate motion key '{}'",
                    self.id, motion.key
                )));
            }
            if let Some(curve) = &motion.focus_curve {
                curve.validate()?;
            }
        }

        let mut wheel_keys = HashSet::new();
        for wheel in &self.filter_wheels {
            if !wheel_keys.insert(wheel.key.as_str()) {
                return Err(ColorimeterError::config(format!(
                    "Module {}: duplicate filter wheel key '{}'",
                    self.id, wheel.key
                )));
            }
            if wheel.channels.is_empty() {
                return Err(ColorimeterError::config(format!(
                    "Module {}: filter wheel '{}' has no channels",
                    self.id, wheel.key
                )));
            }
        }

        if let Some(rx) = &self.rx_filter_wheel {
            if rx.channels.is_empty() {
                return Err(ColorimeterError::config(format!(
                    "Module {}: RX filter wheel has no channels",
                    self.id
                )));
            }
        }

        if let Some(focus) = &self.focus_axis {
            match self.motion(focus) {
                Some(motion) if motion.focus_curve.is_some() => {}
                Some(_) => {
                    return Err(ColorimeterError::config(format!(
                        "Module {}: focus axis '{}' has no focus_curve",
                        self.id, focus
                    )))
                }
                None => {
                    return Err(ColorimeterError::config(format!(
                        "Module {}: focus axis '{}' is not a configured motion",
                        self.id, focus
                    )))
                }
            }
        }

        Ok(())
    }
}

/// Measurement camera definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Display name
    #[serde(default = "default_camera_name")]
    pub name: String,
    /// Driver type (e.g. "mock")
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Driver-specific configuration (dynamic)
    #[serde(default = "empty_settings")]
    pub settings: toml::Value,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: default_camera_name(),
            driver: default_driver(),
            settings: empty_settings(),
        }
    }
}

/// Motion axis definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Unique key within the module (e.g. "focus")
    pub key: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Driver type
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Whether this axis is connected with the module
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver-specific configuration (dynamic)
    #[serde(default = "empty_settings")]
    pub settings: toml::Value,
    /// VID ↔ position mapping when this axis drives focus
    #[serde(default)]
    pub focus_curve: Option<FocusCurve>,
}

impl MotionConfig {
    /// Mock-driven axis with default settings.
    pub fn mock(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            name: key.clone(),
            key,
            driver: default_driver(),
            enabled: true,
            settings: empty_settings(),
            focus_curve: None,
        }
    }
}

/// ND / XYZ filter wheel definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterWheelConfig {
    /// Unique key within the module (e.g. "nd", "xyz")
    pub key: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Driver type
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Whether this wheel is connected with the module
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Channels in slot order
    pub channels: Vec<FilterChannel>,
    /// Bound for synchronous moves
    #[serde(default = "default_filter_wheel_timeout")]
    pub wait_timeout_ms: u64,
    /// Driver-specific configuration (dynamic)
    #[serde(default = "empty_settings")]
    pub settings: toml::Value,
}

/// RX wheel plus its rotation axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RxFilterWheelConfig {
    /// Display name
    #[serde(default = "default_rx_name")]
    pub name: String,
    /// Driver type
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Slot names in order (e.g. "0d", "-0.5d")
    pub channels: Vec<String>,
    /// Cylinder axis motor
    pub axis: MotionConfig,
    /// Mapping from requested RX to available hardware settings
    #[serde(default)]
    pub mapping: RxMappingRule,
    /// Bound for synchronous moves
    #[serde(default = "default_rx_wheel_timeout")]
    pub wait_timeout_ms: u64,
    /// Driver-specific configuration (dynamic)
    #[serde(default = "empty_settings")]
    pub settings: toml::Value,
}

/// Auto exposure tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutoExposureConfig {
    /// Target mean grey level as a fraction of full scale
    #[serde(default = "default_target_ratio")]
    pub target_ratio: f64,
    /// Accepted relative deviation from the target
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Maximum capture iterations
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Lower exposure bound (ms)
    #[serde(default = "default_min_exposure")]
    pub min_exposure_ms: f64,
    /// Upper exposure bound (ms)
    #[serde(default = "default_max_exposure")]
    pub max_exposure_ms: f64,
}

impl Default for AutoExposureConfig {
    fn default() -> Self {
        Self {
            target_ratio: default_target_ratio(),
            tolerance: default_tolerance(),
            max_iterations: default_max_iterations(),
            min_exposure_ms: default_min_exposure(),
            max_exposure_ms: default_max_exposure(),
        }
    }
}

// =============================================================================
// Through focus
// =============================================================================

/// Parameters of a coarse+fine through-focus search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughFocusConfig {
    /// Lower bound of the coarse scan (axis units)
    pub focus_min: f64,
    /// Upper bound of the coarse scan (axis units)
    pub focus_max: f64,
    /// Coarse step
    pub rough_step: f64,
    /// Total width of the fine scan, centred on the coarse optimum
    pub fine_range: f64,
    /// Fine step; `fine_range / fine_step` must be whole
    pub fine_step: f64,
    /// MTF evaluation frequency (lp/mm or lp/deg)
    pub freq: f64,
    /// Moving-average smoothing of the fine curve
    #[serde(default)]
    pub smooth: Option<f64>,
    /// Regions evaluated for sharpness; empty means the full frame
    #[serde(default)]
    pub rois: Vec<Roi>,
    /// Edge (chessboard) target when true, cross-hair line target otherwise
    #[serde(default = "default_enabled")]
    pub chess_mode: bool,
    /// `freq` in lp/mm when true, lp/deg otherwise
    #[serde(default = "default_enabled")]
    pub lpmm_unit: bool,
    /// Unbinned pixel pitch used for the frequency conversion
    #[serde(default = "default_pixel_size")]
    pub pixel_size_um: f64,
    /// Bound for each synchronous focus move
    #[serde(default = "default_wait_timeout")]
    pub move_timeout_ms: u64,
}

impl ThroughFocusConfig {
    /// Reject inconsistent parameters before any motion is issued.
    pub fn validate(&self) -> AppResult<()> {
        let values = [
            self.focus_min,
            self.focus_max,
            self.rough_step,
            self.fine_range,
            self.fine_step,
            self.freq,
            self.pixel_size_um,
        ];
        if values.iter().any(|value| !value.is_finite()) {
            return Err(ColorimeterError::config(
                "through-focus parameters must be finite",
            ));
        }
        if self.focus_max < self.focus_min {
            return Err(ColorimeterError::config(format!(
                "focus_max ({}) < focus_min ({})",
                self.focus_max, self.focus_min
            )));
        }
        if self.rough_step <= 0.0 || self.fine_step <= 0.0 {
            return Err(ColorimeterError::config("focus steps must be positive"));
        }
        if self.fine_range <= 0.0 {
            return Err(ColorimeterError::config("fine_range must be positive"));
        }
        if self.freq <= 0.0 {
            return Err(ColorimeterError::config("freq must be positive"));
        }
        if self.pixel_size_um <= 0.0 {
            return Err(ColorimeterError::config("pixel_size_um must be positive"));
        }
        let ratio = self.fine_range / self.fine_step;
        if (ratio - ratio.round()).abs() > 1e-6 {
            return Err(ColorimeterError::config(format!(
                "fine_range ({}) is not a whole multiple of fine_step ({})",
                self.fine_range, self.fine_step
            )));
        }
        if let Some(smooth) = self.smooth {
            if !smooth.is_finite() || smooth < 0.0 {
                return Err(ColorimeterError::config("smooth must be >= 0"));
            }
        }
        Ok(())
    }

    /// Number of fine samples, `fine_range / fine_step + 1`.
    pub fn fine_sample_count(&self) -> usize {
        (self.fine_range / self.fine_step).round() as usize + 1
    }
}

// =============================================================================
// Calibration
// =============================================================================

/// Stage selection and reference context of a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Dark subtraction
    #[serde(default = "default_enabled")]
    pub dark: bool,
    /// Flat-field correction
    #[serde(default = "default_enabled")]
    pub ffc: bool,
    /// Per-filter sub-pixel registration
    #[serde(default = "default_enabled")]
    pub color_shift: bool,
    /// Lens distortion correction
    #[serde(default = "default_enabled")]
    pub distortion: bool,
    /// Exposure normalisation
    #[serde(default = "default_enabled")]
    pub exposure: bool,
    /// XYZ colour matrix
    #[serde(default = "default_enabled")]
    pub four_color: bool,
    /// Luminance K-map
    #[serde(default)]
    pub luminance: bool,
    /// Field-of-view crop
    #[serde(default)]
    pub fov_crop: bool,
    /// Channels to process
    #[serde(default = "default_filters")]
    pub filters: Vec<FilterChannel>,
    /// Aperture of the reference data
    #[serde(default = "default_aperture")]
    pub aperture: String,
    /// ND filter of the reference data
    #[serde(default = "default_nd")]
    pub nd_filter: FilterChannel,
    /// RX of the reference data
    #[serde(default)]
    pub rx: RxCombination,
    /// Light source of the reference data
    #[serde(default)]
    pub light_source: String,
    /// Exposure all outputs are normalised to (ms)
    #[serde(default = "default_reference_exposure")]
    pub reference_exposure_ms: f64,
    /// Root directory of the pre-calibration data
    #[serde(default)]
    pub reference_root: PathBuf,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            dark: true,
            ffc: true,
            color_shift: true,
            distortion: true,
            exposure: true,
            four_color: true,
            luminance: false,
            fov_crop: false,
            filters: default_filters(),
            aperture: default_aperture(),
            nd_filter: default_nd(),
            rx: RxCombination::UNSET,
            light_source: String::new(),
            reference_exposure_ms: default_reference_exposure(),
            reference_root: PathBuf::new(),
        }
    }
}

impl CalibrationConfig {
    /// Configuration with every stage disabled.
    pub fn none_enabled() -> Self {
        Self {
            dark: false,
            ffc: false,
            color_shift: false,
            distortion: false,
            exposure: false,
            four_color: false,
            luminance: false,
            fov_crop: false,
            ..Self::default()
        }
    }

    /// Whether `stage` runs. `Raw` is always recorded.
    pub fn is_enabled(&self, stage: CalibrationStage) -> bool {
        match stage {
            CalibrationStage::Raw => true,
            CalibrationStage::Dark => self.dark,
            CalibrationStage::Ffc => self.ffc,
            CalibrationStage::ColorShift => self.color_shift,
            CalibrationStage::Distortion => self.distortion,
            CalibrationStage::Exposure => self.exposure,
            CalibrationStage::FourColor => self.four_color,
            CalibrationStage::Luminance => self.luminance,
            CalibrationStage::FovCrop => self.fov_crop,
        }
    }

    /// Reference context selected by this configuration.
    pub fn context(&self) -> CalibrationContext {
        CalibrationContext {
            aperture: self.aperture.clone(),
            nd_filter: self.nd_filter,
            rx: self.rx,
            light_source: self.light_source.clone(),
        }
    }

    /// Reject empty filter lists and non-positive reference exposure.
    pub fn validate(&self) -> AppResult<()> {
        if self.filters.is_empty() {
            return Err(ColorimeterError::config("calibration filter list is empty"));
        }
        let mut seen = HashSet::new();
        for filter in &self.filters {
            if !seen.insert(*filter) {
                return Err(ColorimeterError::config(format!(
                    "duplicate calibration filter {}",
                    filter
                )));
            }
        }
        if !self.reference_exposure_ms.is_finite() || self.reference_exposure_ms <= 0.0 {
            return Err(ColorimeterError::config(
                "reference_exposure_ms must be positive",
            ));
        }
        Ok(())
    }
}

/// File format for saved result images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageFileFormat {
    /// Full-precision ndarray JSON
    #[default]
    Json,
    /// 16-bit TIFF (values clamped to 0..=65535)
    Tiff,
    /// 16-bit PNG (values clamped to 0..=65535)
    Png,
}

impl ImageFileFormat {
    /// File extension without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            ImageFileFormat::Json => "json",
            ImageFileFormat::Tiff => "tif",
            ImageFileFormat::Png => "png",
        }
    }
}

/// Where and how calibration results are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveDataConfig {
    /// Output root; results go to `<root>/<module key>/<stage>/`
    #[serde(default = "default_output_dir")]
    pub root: PathBuf,
    /// Stages to save; empty saves every recorded stage
    #[serde(default)]
    pub stages: Vec<CalibrationStage>,
    /// Image file format
    #[serde(default)]
    pub format: ImageFileFormat,
    /// Optional file name prefix
    #[serde(default)]
    pub prefix: Option<String>,
}

impl Default for SaveDataConfig {
    fn default() -> Self {
        Self {
            root: default_output_dir(),
            stages: Vec::new(),
            format: ImageFileFormat::Json,
            prefix: None,
        }
    }
}

impl SaveDataConfig {
    /// Whether results of `stage` are written.
    pub fn includes(&self, stage: CalibrationStage) -> bool {
        self.stages.is_empty() || self.stages.contains(&stage)
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_driver() -> String {
    "mock".to_string()
}

fn default_camera_name() -> String {
    "camera".to_string()
}

fn default_rx_name() -> String {
    "rx".to_string()
}

fn default_enabled() -> bool {
    true
}

fn empty_settings() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

fn default_wait_timeout() -> u64 {
    DEFAULT_WAIT_TIMEOUT_MS
}

fn default_filter_wheel_timeout() -> u64 {
    DEFAULT_FILTER_WHEEL_TIMEOUT_MS
}

fn default_rx_wheel_timeout() -> u64 {
    DEFAULT_RX_WHEEL_TIMEOUT_MS
}

fn default_target_ratio() -> f64 {
    0.6
}

fn default_tolerance() -> f64 {
    0.05
}

fn default_max_iterations() -> u32 {
    8
}

fn default_min_exposure() -> f64 {
    0.01
}

fn default_max_exposure() -> f64 {
    10_000.0
}

fn default_pixel_size() -> f64 {
    5.5
}

fn default_filters() -> Vec<FilterChannel> {
    FilterChannel::XYZ.to_vec()
}

fn default_aperture() -> String {
    "3mm".to_string()
}

fn default_nd() -> FilterChannel {
    FilterChannel::ND0
}

fn default_reference_exposure() -> f64 {
    1.0
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULE_TOML: &str = r#"
        id = 1
        serial_number = "SN001"
        name = "left"
        key = "eye1"
        eye_mode = "EYE1"
        focus_axis = "focus"

        [camera]
        driver = "mock"
        settings = { width = 32, height = 32 }

        [[motions]]
        key = "focus"
        settings = { speed = 50.0 }
        focus_curve = { focal_length_mm = 100.0, reference_position = -95.0 }

        [[filter_wheels]]
        key = "nd"
        channels = ["ND0", "ND1", "ND2"]

        [[filter_wheels]]
        key = "xyz"
        channels = ["X", "Y", "Z", "Clear"]
    "#;

    fn through_focus() -> ThroughFocusConfig {
        ThroughFocusConfig {
            focus_min: 4.0,
            focus_max: 6.0,
            rough_step: 0.25,
            fine_range: 0.5,
            fine_step: 0.05,
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
    fn test_module_config_defaults() {
        let config: ModuleConfig = Figment::new()
            .merge(Toml::string(MODULE_TOML))
            .extract()
            .unwrap();

        assert_eq!(config.eye_mode, EyeMode::Eye1);
        assert_eq!(config.wait_timeout_ms, DEFAULT_WAIT_TIMEOUT_MS);
        assert_eq!(config.filter_wheels[0].wait_timeout_ms, 20_000);
        assert_eq!(config.filter_wheels[1].channels[3], FilterChannel::Clear);
        assert!(config.motion("focus").unwrap().enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_motion_keys_rejected() {
        let mut config: ModuleConfig = Figment::new()
            .merge(Toml::string(MODULE_TOML))
            .extract()
            .unwrap();
        config.motions.push(MotionConfig::mock("focus"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_focus_axis_must_have_curve() {
        let mut config: ModuleConfig = Figment::new()
            .merge(Toml::string(MODULE_TOML))
            .extract()
            .unwrap();
        config.focus_axis = Some("ipd".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_through_focus_validation() {
        assert!(through_focus().validate().is_ok());
        assert_eq!(through_focus().fine_sample_count(), 11);

        let mut reversed = through_focus();
        reversed.focus_max = 3.0;
        assert!(reversed.validate().is_err());

        let mut fractional = through_focus();
        fractional.fine_step = 0.03;
        assert!(fractional.validate().is_err());

        let mut zero_freq = through_focus();
        zero_freq.freq = 0.0;
        assert!(zero_freq.validate().is_err());
    }

    #[test]
    fn test_calibration_defaults() {
        let config = CalibrationConfig::default();
        assert!(config.dark && config.ffc && config.four_color);
        assert!(!config.luminance && !config.fov_crop);
        assert_eq!(config.filters, FilterChannel::XYZ.to_vec());
        assert_eq!(config.aperture, "3mm");
        assert!(config.validate().is_ok());

        let empty = CalibrationConfig {
            filters: vec![],
            ..CalibrationConfig::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_app_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");
        std::fs::write(
            &path,
            "operation_mode = \"Serial\"\n[application]\nname = \"rig\"\nlog_level = \"info\"\n",
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.operation_mode, OperationMode::Serial);
        assert!(config.modules.is_empty());
        assert!(config.validate().is_ok());
    }
}
