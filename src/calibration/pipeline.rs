//! Per-module calibration pipeline.
//!
//! [`CalibrationAlgorithms`] holds the reference data, the dark library, the
//! current capture map and the results of the last run. `process` records the
//! raw captures and then runs every enabled stage in
//! [`CalibrationStage::PIPELINE`] order, each stage reading the output of the
//! previous enabled one.

use crate::calibration::reference::{DarkLibrary, PreCalibrationData};
use crate::calibration::stages;
use crate::calibration::store::{CalibrationResults, CalibrationStore};
use crate::config::{CalibrationConfig, SaveDataConfig};
use crate::error::{AppResult, ColorimeterError};
use crate::types::{CaliProcessData, CalibrationStage, CaptureData, FilterChannel, Image};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

type ChannelMap = BTreeMap<FilterChannel, CaliProcessData>;

/// Calibration state of one module.
pub struct CalibrationAlgorithms {
    module_key: String,
    store: Arc<dyn CalibrationStore>,
    reference: RwLock<Arc<PreCalibrationData>>,
    darks: RwLock<Arc<DarkLibrary>>,
    captures: RwLock<BTreeMap<FilterChannel, CaptureData>>,
    results: RwLock<CalibrationResults>,
}

impl CalibrationAlgorithms {
    /// Empty pipeline for the module keyed `module_key`.
    pub fn new(module_key: impl Into<String>, store: Arc<dyn CalibrationStore>) -> Self {
        Self {
            module_key: module_key.into(),
            store,
            reference: RwLock::new(Arc::new(PreCalibrationData::default())),
            darks: RwLock::new(Arc::new(DarkLibrary::new())),
            captures: RwLock::new(BTreeMap::new()),
            results: RwLock::new(CalibrationResults::new()),
        }
    }

    /// Key of the owning module.
    pub fn module_key(&self) -> &str {
        &self.module_key
    }

    // =========================================================================
    // Reference data
    // =========================================================================

    /// Replace the dark library with the frames found under `path`.
    /// Returns the number of frames loaded.
    pub fn load_dark_by_exposure_time_list(&self, path: &Path) -> AppResult<usize> {
        let library = self.store.load_dark_library(path)?;
        let count = library.len();
        self.set_dark_library(library);
        Ok(count)
    }

    /// Replace the dark library.
    pub fn set_dark_library(&self, library: DarkLibrary) {
        *self.darks.write() = Arc::new(library);
    }

    /// Current dark library.
    pub fn dark_library(&self) -> Arc<DarkLibrary> {
        Arc::clone(&self.darks.read())
    }

    /// Load the reference data selected by `config` from the store.
    pub fn load_calibration_data(&self, config: &CalibrationConfig) -> AppResult<()> {
        let context = config.context();
        let data = self
            .store
            .load_pre_calibration(&config.reference_root, &context)?;
        info!(module = %self.module_key, context = %context.dir_name(), "reference data loaded");
        self.set_pre_calibration_data(data);
        Ok(())
    }

    /// Swap in new reference data; runs in progress keep the previous set.
    pub fn set_pre_calibration_data(&self, data: PreCalibrationData) {
        *self.reference.write() = Arc::new(data);
    }

    /// Current reference data.
    pub fn pre_calibration_data(&self) -> Arc<PreCalibrationData> {
        Arc::clone(&self.reference.read())
    }

    // =========================================================================
    // Captures
    // =========================================================================

    /// Replace the capture map. With `sub_dark` the matching dark frame is
    /// subtracted now and the captures are marked `dark_subtracted`, so the
    /// Dark stage leaves them untouched.
    pub fn set_capture_data_map(
        &self,
        map: BTreeMap<FilterChannel, CaptureData>,
        sub_dark: bool,
    ) -> AppResult<()> {
        let map = if sub_dark {
            let reference = self.pre_calibration_data();
            let darks = self.dark_library();
            map.into_iter()
                .map(|(filter, data)| {
                    let corrected = subtract_matching_dark(&data, filter, &darks, &reference)?;
                    Ok((filter, corrected))
                })
                .collect::<AppResult<BTreeMap<_, _>>>()?
        } else {
            map
        };
        *self.captures.write() = map;
        Ok(())
    }

    /// Captures the next run processes.
    pub fn capture_data_map(&self) -> BTreeMap<FilterChannel, CaptureData> {
        self.captures.read().clone()
    }

    // =========================================================================
    // Processing
    // =========================================================================

    /// Run the enabled stages on the current captures.
    #[instrument(skip_all, fields(module = %self.module_key))]
    pub fn process(&self, config: &CalibrationConfig) -> AppResult<()> {
        config.validate()?;
        let reference = self.pre_calibration_data();
        let darks = self.dark_library();
        let captures = self.capture_data_map();

        let mut current = ChannelMap::new();
        for filter in &config.filters {
            let data = captures.get(filter).ok_or_else(|| {
                ColorimeterError::Processing(format!("no capture for filter {}", filter))
            })?;
            current.insert(*filter, data.clone());
        }

        let mut results = CalibrationResults::new();
        results.insert(CalibrationStage::Raw, current.clone());
        for stage in CalibrationStage::PIPELINE {
            if !config.is_enabled(stage) {
                continue;
            }
            current = apply_stage(stage, &current, config, &reference, &darks)?;
            debug!(%stage, filters = current.len(), "stage applied");
            results.insert(stage, current.clone());
        }

        *self.results.write() = results;
        info!("calibration processed");
        Ok(())
    }

    /// Results of the last successful `process`.
    pub fn calibration_data(&self) -> CalibrationResults {
        self.results.read().clone()
    }

    /// Save `data` below `<save.root>/<module key>`.
    pub fn save_calibration_data(
        &self,
        data: &CalibrationResults,
        save: &SaveDataConfig,
    ) -> AppResult<PathBuf> {
        let dir = save.root.join(&self.module_key);
        self.store.save_calibration_results(&dir, data, save)
    }
}

fn subtract_matching_dark(
    data: &CaptureData,
    filter: FilterChannel,
    darks: &DarkLibrary,
    reference: &PreCalibrationData,
) -> AppResult<CaptureData> {
    if data.dark_subtracted {
        return Ok(data.clone());
    }
    let dark = darks
        .nearest(data.exposure_time_ms)
        .or_else(|| reference.darks.get(&filter))
        .ok_or_else(|| {
            ColorimeterError::Processing(format!(
                "no dark frame for filter {} at {} ms",
                filter, data.exposure_time_ms
            ))
        })?;
    let mut corrected = data.with_image(stages::subtract_dark(&data.image, dark)?);
    corrected.dark_subtracted = true;
    Ok(corrected)
}

fn map_images<F>(current: &ChannelMap, mut op: F) -> AppResult<ChannelMap>
where
    F: FnMut(FilterChannel, &CaliProcessData) -> AppResult<Image>,
{
    current
        .iter()
        .map(|(filter, data)| Ok((*filter, data.with_image(op(*filter, data)?))))
        .collect()
}

fn apply_stage(
    stage: CalibrationStage,
    current: &ChannelMap,
    config: &CalibrationConfig,
    reference: &PreCalibrationData,
    darks: &DarkLibrary,
) -> AppResult<ChannelMap> {
    match stage {
        CalibrationStage::Raw => Ok(current.clone()),
        CalibrationStage::Dark => current
            .iter()
            .map(|(filter, data)| {
                Ok((*filter, subtract_matching_dark(data, *filter, darks, reference)?))
            })
            .collect(),
        CalibrationStage::Ffc => map_images(current, |filter, data| {
            let flat = reference.flats.get(&filter).ok_or_else(|| {
                ColorimeterError::Processing(format!("no flat field for filter {}", filter))
            })?;
            stages::flat_field(&data.image, &flat.image()?)
        }),
        CalibrationStage::ColorShift => map_images(current, |filter, data| {
            let offset = reference.color_shift.get(&filter).copied().unwrap_or_default();
            Ok(stages::shift(&data.image, offset))
        }),
        CalibrationStage::Distortion => {
            let model = reference.distortion.as_ref().ok_or_else(|| {
                ColorimeterError::Processing("no distortion model in reference data".to_string())
            })?;
            map_images(current, |_, data| stages::undistort(&data.image, model))
        }
        CalibrationStage::Exposure => map_images(current, |_, data| {
            stages::scale_exposure(&data.image, data.exposure_time_ms, config.reference_exposure_ms)
        }),
        CalibrationStage::FourColor => {
            let matrix = reference.four_color.as_ref().ok_or_else(|| {
                ColorimeterError::Processing("no four-color matrix in reference data".to_string())
            })?;
            let channel = |filter: FilterChannel| {
                current.get(&filter).ok_or_else(|| {
                    ColorimeterError::Processing(format!(
                        "four color needs filter {} in the capture set",
                        filter
                    ))
                })
            };
            let (x, y, z) = (
                channel(FilterChannel::X)?,
                channel(FilterChannel::Y)?,
                channel(FilterChannel::Z)?,
            );
            let [x_out, y_out, z_out] = stages::four_color(&x.image, &y.image, &z.image, matrix)?;
            let mut next = current.clone();
            next.insert(FilterChannel::X, x.with_image(x_out));
            next.insert(FilterChannel::Y, y.with_image(y_out));
            next.insert(FilterChannel::Z, z.with_image(z_out));
            Ok(next)
        }
        CalibrationStage::Luminance => map_images(current, |filter, data| {
            match reference.luminance.get(&filter) {
                Some(map) => stages::apply_luminance(&data.image, map),
                None => Ok(data.image.clone()),
            }
        }),
        CalibrationStage::FovCrop => {
            let crop = reference.fov_crop.as_ref().ok_or_else(|| {
                ColorimeterError::Processing("no FOV crop in reference data".to_string())
            })?;
            map_images(current, |_, data| {
                let (rows, cols) = data.image.dim();
                let roi = stages::fov_rect(crop, rows, cols)?;
                Ok(stages::crop(&data.image, roi))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::reference::{FlatField, PixelOffset};
    use crate::calibration::store::MemoryStore;
    use nalgebra::Matrix3;

    fn capture(filter: FilterChannel, level: f64) -> CaptureData {
        CaptureData {
            key: "m1".into(),
            color_filter: filter,
            exposure_time_ms: 100.0,
            image: Image::from_elem((4, 4), level),
            ..CaptureData::default()
        }
    }

    fn captures() -> BTreeMap<FilterChannel, CaptureData> {
        FilterChannel::XYZ
            .iter()
            .zip([1100.0, 1200.0, 1300.0])
            .map(|(filter, level)| (*filter, capture(*filter, level)))
            .collect()
    }

    fn pipeline() -> CalibrationAlgorithms {
        let algorithms = CalibrationAlgorithms::new("m1", Arc::new(MemoryStore::new()));
        let mut darks = DarkLibrary::new();
        darks.insert(100.0, Image::from_elem((4, 4), 100.0));
        algorithms.set_dark_library(darks);

        let mut reference = PreCalibrationData::default();
        for filter in FilterChannel::XYZ {
            reference
                .flats
                .insert(filter, FlatField::Normal(Image::from_elem((4, 4), 2.0)));
        }
        reference.color_shift.insert(FilterChannel::Z, PixelOffset { dx: 0.0, dy: 0.0 });
        reference.four_color = Some(Matrix3::identity());
        algorithms.set_pre_calibration_data(reference);
        algorithms
    }

    #[test]
    fn stages_chain_in_order() {
        let algorithms = pipeline();
        algorithms.set_capture_data_map(captures(), false).unwrap();
        let config = CalibrationConfig {
            distortion: false,
            ..CalibrationConfig::default()
        };
        algorithms.process(&config).unwrap();
        let results = algorithms.calibration_data();

        let stages: Vec<_> = results.keys().copied().collect();
        assert_eq!(
            stages,
            vec![
                CalibrationStage::Raw,
                CalibrationStage::Dark,
                CalibrationStage::Ffc,
                CalibrationStage::ColorShift,
                CalibrationStage::Exposure,
                CalibrationStage::FourColor,
            ]
        );
        let x = &results[&CalibrationStage::FourColor][&FilterChannel::X];
        // (1100 − 100) / 1 · (1 ms / 100 ms)
        assert!((x.image[[1, 1]] - 10.0).abs() < 1e-12);
        assert!(x.dark_subtracted);
        assert!(!results[&CalibrationStage::Raw][&FilterChannel::X].dark_subtracted);
    }

    #[test]
    fn missing_filter_capture_is_processing_error() {
        let algorithms = pipeline();
        let mut partial = captures();
        partial.remove(&FilterChannel::Y);
        algorithms.set_capture_data_map(partial, false).unwrap();
        let err = algorithms.process(&CalibrationConfig::none_enabled()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Processing);
    }

    #[test]
    fn four_color_requires_xyz() {
        let algorithms = pipeline();
        let mut only_x = BTreeMap::new();
        only_x.insert(FilterChannel::X, capture(FilterChannel::X, 500.0));
        algorithms.set_capture_data_map(only_x, false).unwrap();
        let config = CalibrationConfig {
            filters: vec![FilterChannel::X],
            four_color: true,
            ..CalibrationConfig::none_enabled()
        };
        assert!(algorithms.process(&config).is_err());
    }

    #[test]
    fn pre_subtracted_captures_skip_dark_stage() {
        let algorithms = pipeline();
        algorithms.set_capture_data_map(captures(), true).unwrap();
        let stored = algorithms.capture_data_map();
        assert!(stored[&FilterChannel::Y].dark_subtracted);
        assert_eq!(stored[&FilterChannel::Y].image[[0, 0]], 1100.0);

        let config = CalibrationConfig {
            dark: true,
            ..CalibrationConfig::none_enabled()
        };
        algorithms.process(&config).unwrap();
        let dark = &algorithms.calibration_data()[&CalibrationStage::Dark][&FilterChannel::Y];
        assert_eq!(dark.image[[0, 0]], 1100.0);
    }
}
