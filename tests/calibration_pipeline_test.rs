//! Calibration runs through the multi-module manager with both stores.

mod common;

use common::module_config;
use ml_colorimeter::calibration::store::write_image;
use ml_colorimeter::calibration::{
    CalibrationStore, DarkLibrary, FileStore, FlatField, MemoryStore, PreCalibrationData,
};
use ml_colorimeter::config::{CalibrationConfig, ImageFileFormat, SaveDataConfig};
use ml_colorimeter::error::ErrorKind;
use ml_colorimeter::hardware::DriverRegistry;
use ml_colorimeter::module::MultiModuleManager;
use ml_colorimeter::types::{CalibrationStage, CaptureData, EyeMode, FilterChannel, Image, OperationMode};
use nalgebra::Matrix3;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

const DARK_LEVEL: f64 = 100.0;

fn captures(offset: f64) -> BTreeMap<FilterChannel, CaptureData> {
    FilterChannel::XYZ
        .iter()
        .enumerate()
        .map(|(i, filter)| {
            let data = CaptureData {
                key: "eye1".into(),
                color_filter: *filter,
                exposure_time_ms: 100.0,
                image: Image::from_elem((4, 6), 1000.0 + offset + 100.0 * i as f64),
                ..CaptureData::default()
            };
            (*filter, data)
        })
        .collect()
}

fn reference(config: &CalibrationConfig) -> PreCalibrationData {
    let mut data = PreCalibrationData {
        context: config.context(),
        four_color: Some(Matrix3::new(1.0, 0.5, 0.0, 0.0, 1.0, 0.0, 0.0, 0.25, 1.0)),
        ..PreCalibrationData::default()
    };
    for filter in FilterChannel::XYZ {
        data.flats
            .insert(filter, FlatField::Normal(Image::from_elem((4, 6), 3.0)));
    }
    data
}

fn darks() -> DarkLibrary {
    let mut library = DarkLibrary::new();
    library.insert(100.0, Image::from_elem((4, 6), DARK_LEVEL));
    library
}

fn no_distortion() -> CalibrationConfig {
    CalibrationConfig {
        distortion: false,
        ..CalibrationConfig::default()
    }
}

async fn rig_with_memory_store() -> (MultiModuleManager, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store.insert_dark_library("darks", darks());
    store
        .save_pre_calibration(Path::new("reference"), &reference(&no_distortion()))
        .unwrap();
    let rig = MultiModuleManager::with_store(DriverRegistry::with_mock_drivers(), store.clone());
    rig.add_module_config(module_config(1, EyeMode::Eye1))
        .await
        .unwrap();
    rig.add_module_config(module_config(2, EyeMode::Eye2))
        .await
        .unwrap();
    (rig, store)
}

fn with_reference_root(mut config: CalibrationConfig) -> CalibrationConfig {
    config.reference_root = "reference".into();
    config
}

#[tokio::test]
async fn test_process_is_repeatable() {
    let (rig, _) = rig_with_memory_store().await;
    let config = with_reference_root(no_distortion());
    assert!(rig
        .load_dark_by_exposure_time_list(Path::new("darks"))
        .await
        .is_success());
    assert!(rig
        .load_calibration_data(&config, OperationMode::Parallel)
        .await
        .is_success());
    rig.set_capture_data_map(1, captures(0.0), false).await.unwrap();
    rig.set_capture_data_map(2, captures(50.0), false).await.unwrap();

    assert!(rig.process(&config, OperationMode::Parallel).await.is_success());
    let first = rig.calibration_data(1).await.unwrap();
    assert!(rig.process(&config, OperationMode::Serial).await.is_success());
    assert_eq!(rig.calibration_data(1).await.unwrap(), first);

    assert_eq!(
        first.keys().copied().collect::<Vec<_>>(),
        vec![
            CalibrationStage::Raw,
            CalibrationStage::Dark,
            CalibrationStage::Ffc,
            CalibrationStage::ColorShift,
            CalibrationStage::Exposure,
            CalibrationStage::FourColor,
        ]
    );
    assert_ne!(rig.calibration_data(2).await.unwrap(), first);
}

#[tokio::test]
async fn test_dark_stage_subtracts_the_matching_frame() {
    let (rig, _) = rig_with_memory_store().await;
    rig.load_dark_by_exposure_time_list(Path::new("darks")).await;
    rig.set_capture_data_map(1, captures(0.0), false).await.unwrap();

    let without = CalibrationConfig::none_enabled();
    let with_dark = CalibrationConfig {
        dark: true,
        ..CalibrationConfig::none_enabled()
    };

    let module = rig.calibration_process_by_id(1).await.unwrap();
    module.process(&without).unwrap();
    let raw = module.calibration_data();
    assert_eq!(raw.len(), 1);
    module.process(&with_dark).unwrap();
    let dark = module.calibration_data();

    for filter in FilterChannel::XYZ {
        let delta = &dark[&CalibrationStage::Dark][&filter].image
            - &raw[&CalibrationStage::Raw][&filter].image;
        assert!(delta.iter().all(|value| (value + DARK_LEVEL).abs() < 1e-12));
    }
}

#[tokio::test]
async fn test_pre_subtracted_captures_are_not_subtracted_twice() {
    let (rig, _) = rig_with_memory_store().await;
    rig.load_dark_by_exposure_time_list(Path::new("darks")).await;
    rig.set_capture_data_map(1, captures(0.0), true).await.unwrap();

    let config = CalibrationConfig {
        dark: true,
        ..CalibrationConfig::none_enabled()
    };
    let out = rig.process(&config, OperationMode::Serial).await;
    // Module 2 has no captures.
    assert_eq!(out.failed_ids(), vec![2]);
    assert_eq!(out.errors[&2].kind(), ErrorKind::Processing);

    let results = rig.calibration_data(1).await.unwrap();
    let x = &results[&CalibrationStage::Dark][&FilterChannel::X];
    assert!(x.dark_subtracted);
    assert_eq!(x.image[[0, 0]], 1000.0 - DARK_LEVEL);
}

#[tokio::test]
async fn test_missing_reference_data_is_reported() {
    let (rig, _) = rig_with_memory_store().await;
    let config = CalibrationConfig {
        aperture: "2mm".into(),
        ..with_reference_root(no_distortion())
    };
    let out = rig.load_calibration_data(&config, OperationMode::Parallel).await;
    assert_eq!(out.failed_ids(), vec![1, 2]);
    assert_eq!(out.errors[&1].kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_save_results_to_memory_store() {
    let (rig, store) = rig_with_memory_store().await;
    let config = with_reference_root(no_distortion());
    rig.load_dark_by_exposure_time_list(Path::new("darks")).await;
    rig.load_calibration_data(&config, OperationMode::Parallel).await;
    rig.set_capture_data_map(1, captures(0.0), false).await.unwrap();
    rig.process(&config, OperationMode::Serial).await;

    let data = rig.calibration_data(1).await.unwrap();
    let save = SaveDataConfig {
        root: "out".into(),
        stages: vec![CalibrationStage::FourColor],
        ..SaveDataConfig::default()
    };
    let dir = rig.save_calibration_data(&data, 1, &save).await.unwrap();
    assert_eq!(dir, Path::new("out/eye1"));

    let saved = store.saved_results(&dir).unwrap();
    assert_eq!(
        saved.keys().copied().collect::<Vec<_>>(),
        vec![CalibrationStage::FourColor]
    );
    assert!(rig.save_calibration_data(&data, 9, &save).await.is_err());
}

#[tokio::test]
async fn test_file_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let dark_dir = dir.path().join("darks");
    std::fs::create_dir_all(&dark_dir).unwrap();
    write_image(
        &dark_dir.join("100.json"),
        &Image::from_elem((4, 6), DARK_LEVEL),
        ImageFileFormat::Json,
    )
    .unwrap();

    let mut config = no_distortion();
    config.reference_root = dir.path().join("reference");
    let location = FileStore::new()
        .save_pre_calibration(&config.reference_root, &reference(&config))
        .unwrap();
    assert!(location.ends_with("3mm_ND0_noRX/pre_calibration.json"));

    let rig = MultiModuleManager::new(DriverRegistry::with_mock_drivers());
    rig.add_module_config(module_config(1, EyeMode::Eye1))
        .await
        .unwrap();
    let loaded = rig.load_dark_by_exposure_time_list(&dark_dir).await;
    assert_eq!(loaded.values[&1], 1);
    assert!(rig
        .load_calibration_data(&config, OperationMode::Serial)
        .await
        .is_success());

    let module = rig.calibration_process_by_id(1).await.unwrap();
    assert_eq!(*module.pre_calibration_data(), reference(&config));

    rig.set_capture_data_map(1, captures(0.0), false).await.unwrap();
    assert!(rig.process(&config, OperationMode::Serial).await.is_success());

    let save = SaveDataConfig {
        root: dir.path().join("out"),
        prefix: Some("run1_".into()),
        ..SaveDataConfig::default()
    };
    let data = rig.calibration_data(1).await.unwrap();
    let out = rig.save_calibration_data(&data, 1, &save).await.unwrap();
    assert!(out.join("FourColor").join("run1_Y.json").is_file());
    assert!(out.join("FFC").join("run1_X.json").is_file());
    let metadata: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("metadata.json")).unwrap())
            .unwrap();
    assert_eq!(metadata.as_array().unwrap().len(), 6 * 3);
}
