//! Calibration pipeline: reference data, per-stage image operations, the
//! per-module processing state and its storage backends.

pub mod pipeline;
pub mod reference;
pub mod stages;
pub mod store;

pub use pipeline::CalibrationAlgorithms;
pub use reference::{
    CalibrationContext, DarkLibrary, DistortionCoefficients, DistortionModel, FlatField, FovCrop,
    LuminanceMap, PixelOffset, PreCalibrationData,
};
pub use store::{CalibrationResults, CalibrationStore, FileStore, MemoryStore};
