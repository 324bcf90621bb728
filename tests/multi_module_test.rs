//! Fan-out behaviour of the multi-module manager.

mod common;

use common::{module_config, settings, through_focus_config};
use ml_colorimeter::calibration::MemoryStore;
use ml_colorimeter::config::{
    AppConfig, CalibrationConfig, FilterWheelConfig, ModuleConfig, SaveDataConfig,
};
use ml_colorimeter::error::{ColorimeterError, ErrorKind, ResultCode};
use ml_colorimeter::hardware::DriverRegistry;
use ml_colorimeter::module::MultiModuleManager;
use ml_colorimeter::types::{
    CalibrationStage, EyeMode, ExposureSetting, FilterChannel, OperationMode,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn rig() -> MultiModuleManager {
    MultiModuleManager::with_store(
        DriverRegistry::with_mock_drivers(),
        Arc::new(MemoryStore::new()),
    )
}

/// Focus axis moving 10 units/s, so a 1-unit move takes 100 ms.
fn timed_module(id: i32, eye_mode: EyeMode) -> ModuleConfig {
    let mut config = module_config(id, eye_mode);
    config.motions[0].settings = settings("speed = 10.0");
    config
}

#[tokio::test(flavor = "multi_thread")]
async fn test_parallel_takes_max_serial_takes_sum() {
    let rig = rig();
    rig.add_module_config(timed_module(1, EyeMode::Eye1))
        .await
        .unwrap();
    rig.add_module_config(timed_module(2, EyeMode::Eye2))
        .await
        .unwrap();
    assert!(rig.connect_modules().await.is_success());

    let start = Instant::now();
    let out = rig
        .set_position_rel_sync("focus", 1.0, OperationMode::Parallel)
        .await;
    let parallel = start.elapsed();
    assert!(out.is_success());

    let start = Instant::now();
    let out = rig
        .set_position_rel_sync("focus", 1.0, OperationMode::Serial)
        .await;
    let serial = start.elapsed();
    assert!(out.is_success());

    assert!(parallel >= Duration::from_millis(100), "parallel {:?}", parallel);
    assert!(serial >= Duration::from_millis(200), "serial {:?}", serial);
    assert!(
        parallel.as_secs_f64() < 0.75 * serial.as_secs_f64(),
        "parallel {:?} vs serial {:?}",
        parallel,
        serial
    );

    let positions = rig.motion_position("focus").await.into_result().unwrap();
    assert_eq!(positions.values().copied().collect::<Vec<_>>(), vec![2.0, 2.0]);
}

#[tokio::test]
async fn test_alarm_on_one_module_is_a_partial_failure() {
    let rig = rig();
    let mut faulty = module_config(2, EyeMode::Eye2);
    faulty.motions[0].settings = settings("speed = 200.0\nfault = \"alarm\"");
    rig.add_module_config(module_config(1, EyeMode::Eye1))
        .await
        .unwrap();
    rig.add_module_config(faulty).await.unwrap();
    rig.connect_modules().await;

    let out = rig
        .set_position_abs_sync("focus", 2.0, OperationMode::Parallel)
        .await;
    assert_eq!(out.values.keys().copied().collect::<Vec<_>>(), vec![1]);
    assert_eq!(out.failed_ids(), vec![2]);

    let status = out.status();
    assert!(!status.success);
    assert_eq!(status.code, ResultCode::Runtime);
    assert!(status.message.contains("module 2"), "{}", status.message);

    match out.into_result() {
        Err(ColorimeterError::PartialFailure { failed, .. }) => assert_eq!(failed, vec![2]),
        other => panic!("expected partial failure, got {:?}", other),
    }

    let healthy = rig.module_by_id(1).await.unwrap();
    assert_eq!(healthy.motion_position("focus").await.unwrap(), 2.0);
    assert!(healthy.is_module_connected());
    assert!(!rig.is_modules_connected().await);

    // An explicit stop clears the alarm.
    assert!(rig
        .stop_modules_movement(OperationMode::Serial)
        .await
        .is_success());
    assert!(rig.is_modules_connected().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_is_not_held_up_by_a_queued_add() {
    let rig = Arc::new(rig());
    let mut slow = module_config(1, EyeMode::Eye1);
    // 125 ms per coarse step, starting on the first coarse position.
    slow.motions[0].settings = settings("speed = 2.0\ninitial_position = 4.0");
    rig.add_module_config(slow).await.unwrap();
    assert!(rig.connect_modules().await.is_success());

    let search = tokio::spawn({
        let rig = Arc::clone(&rig);
        async move {
            let config = through_focus_config();
            rig.through_focus("focus", &config, OperationMode::Parallel)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    let add = tokio::spawn({
        let rig = Arc::clone(&rig);
        async move { rig.add_module_config(module_config(2, EyeMode::Eye2)).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let start = Instant::now();
    let stopped = tokio::time::timeout(
        Duration::from_secs(1),
        rig.stop_modules_movement(OperationMode::Parallel),
    )
    .await
    .expect("stop waited for the running search");
    assert!(stopped.is_success());
    assert!(start.elapsed() < Duration::from_millis(500));

    let out = search.await.unwrap();
    assert_eq!(out.errors[&1].kind(), ErrorKind::UserStop);
    assert_eq!(add.await.unwrap().unwrap(), 2);
    assert_eq!(rig.modules_id_list().await, vec![1, 2]);
}

#[tokio::test]
async fn test_filter_wheel_alarm_leaves_other_module_moved() {
    let rig = rig();
    let mut faulty = module_config(2, EyeMode::Eye2);
    faulty.filter_wheels[0].settings = settings("slots_per_second = 100.0\nfault = \"alarm\"");
    rig.add_module_config(module_config(1, EyeMode::Eye1))
        .await
        .unwrap();
    rig.add_module_config(faulty).await.unwrap();
    assert!(rig.connect_modules().await.is_success());

    let status = rig
        .move_nd_xyz_filter_by_enum_sync("xyz", FilterChannel::Z, OperationMode::Parallel)
        .await
        .status();
    assert!(!status.success);
    assert!(status.message.contains("module 2"), "{}", status.message);
    assert!(!status.message.contains("module 1"), "{}", status.message);

    let channels = rig.nd_xyz_filter_channel("xyz").await;
    assert_eq!(channels.values[&1], FilterChannel::Z);
}

#[tokio::test]
async fn test_connect_failure_is_reported_per_module() {
    let rig = rig();
    let mut broken = module_config(2, EyeMode::Eye2);
    broken.camera.settings = settings("fault = \"connect_failure\"");
    rig.add_module_config(module_config(1, EyeMode::Eye1))
        .await
        .unwrap();
    rig.add_module_config(broken).await.unwrap();

    let out = rig.connect_modules().await;
    assert_eq!(out.failed_ids(), vec![2]);
    assert!(!rig.is_modules_connected().await);
    assert!(rig.module_by_id(1).await.unwrap().is_module_connected());
}

#[tokio::test]
async fn test_capture_fan_out_and_maps() {
    let rig = rig();
    rig.add_module_config(module_config(1, EyeMode::Eye1))
        .await
        .unwrap();
    rig.add_module_config(module_config(2, EyeMode::Eye2))
        .await
        .unwrap();
    rig.connect_modules().await;

    rig.set_aperture("2mm").await;
    assert!(rig
        .move_nd_xyz_filter_by_enum_sync("xyz", FilterChannel::Y, OperationMode::Parallel)
        .await
        .is_success());
    let captures = rig
        .capture_image_sync(OperationMode::Serial)
        .await
        .into_result()
        .unwrap();

    assert_eq!(captures.len(), 2);
    assert!(captures.values().all(|c| c.aperture == "2mm"));
    assert_eq!(rig.image().await.len(), 2);
    let colors = rig.color_camera_capture_data().await;
    assert!(colors[&2].contains_key(&FilterChannel::Y));

    rig.reset_color_capture_data().await;
    assert!(rig.color_camera_capture_data().await[&1].is_empty());
}

fn with_nd_wheel(mut config: ModuleConfig) -> ModuleConfig {
    config.filter_wheels.push(FilterWheelConfig {
        key: "nd".into(),
        name: "ND wheel".into(),
        driver: "mock".into(),
        enabled: true,
        channels: vec![FilterChannel::ND0, FilterChannel::ND1, FilterChannel::ND2],
        wait_timeout_ms: 2_000,
        settings: settings("slots_per_second = 100.0"),
    });
    config
}

#[tokio::test]
async fn test_measurement_captures_each_filter_and_processes() {
    let rig = rig();
    rig.add_module_config(with_nd_wheel(module_config(1, EyeMode::Eye1)))
        .await
        .unwrap();
    rig.add_module_config(with_nd_wheel(module_config(2, EyeMode::Eye2)))
        .await
        .unwrap();
    rig.connect_modules().await;

    let config = CalibrationConfig {
        aperture: "4mm".into(),
        nd_filter: FilterChannel::ND1,
        ..CalibrationConfig::none_enabled()
    };
    let results = rig
        .measurement(
            "nd",
            "xyz",
            &config,
            ExposureSetting::fixed(50.0),
            false,
            OperationMode::Parallel,
        )
        .await
        .into_result()
        .unwrap();

    assert_eq!(results.len(), 2);
    for (id, stages) in &results {
        let raw = &stages[&CalibrationStage::Raw];
        assert_eq!(raw.keys().copied().collect::<Vec<_>>(), FilterChannel::XYZ.to_vec());
        for (filter, data) in raw {
            assert_eq!(data.color_filter, *filter);
            assert_eq!(data.nd_filter, FilterChannel::ND1);
            assert_eq!(data.aperture, "4mm");
            assert_eq!(data.exposure_time_ms, 50.0);
        }
        assert_eq!(&rig.calibration_data(*id).await.unwrap(), stages);
    }
    let channels = rig.nd_xyz_filter_channel("xyz").await.into_result().unwrap();
    assert!(channels.values().all(|channel| *channel == FilterChannel::Z));
    assert_eq!(rig.color_camera_capture_data().await[&2].len(), 3);

    let save = SaveDataConfig {
        root: "measure".into(),
        ..SaveDataConfig::default()
    };
    let out = rig.save_measure_result(1, &save).await.unwrap();
    assert_eq!(out, std::path::Path::new("measure/eye1"));
    assert!(rig.save_measure_result(9, &save).await.is_err());
}

#[tokio::test]
async fn test_measurement_with_color_camera_captures_once() {
    let rig = rig();
    rig.add_module_config(with_nd_wheel(module_config(1, EyeMode::Eye1)))
        .await
        .unwrap();
    rig.connect_modules().await;
    let before = rig.nd_xyz_filter_channel("xyz").await.values[&1];

    let results = rig
        .measurement(
            "nd",
            "xyz",
            &CalibrationConfig::none_enabled(),
            ExposureSetting::fixed(20.0),
            true,
            OperationMode::Serial,
        )
        .await
        .into_result()
        .unwrap();

    let raw = &results[&1][&CalibrationStage::Raw];
    assert_eq!(raw.len(), 3);
    assert_eq!(raw[&FilterChannel::X].image, raw[&FilterChannel::Z].image);
    assert_eq!(rig.nd_xyz_filter_channel("xyz").await.values[&1], before);
}

#[tokio::test]
async fn test_measurement_reports_missing_wheel_per_module() {
    let rig = rig();
    rig.add_module_config(with_nd_wheel(module_config(1, EyeMode::Eye1)))
        .await
        .unwrap();
    rig.add_module_config(module_config(2, EyeMode::Eye2))
        .await
        .unwrap();
    rig.connect_modules().await;

    let out = rig
        .measurement(
            "nd",
            "xyz",
            &CalibrationConfig::none_enabled(),
            ExposureSetting::fixed(20.0),
            false,
            OperationMode::Parallel,
        )
        .await;
    assert_eq!(out.values.keys().copied().collect::<Vec<_>>(), vec![1]);
    assert_eq!(out.errors[&2].kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_modules_load_from_files() {
    let dir = tempfile::tempdir().unwrap();
    let module_path = dir.path().join("left.toml");
    std::fs::write(
        &module_path,
        r#"
            id = 7
            serial_number = "SN007"
            name = "left"
            key = "left"
            eye_mode = "EYE1"

            [camera]
            settings = { width = 16, height = 16, readout_ms = 0 }

            [[motions]]
            key = "focus"
            settings = { speed = 0.0 }
        "#,
    )
    .unwrap();
    let ipd_path = dir.path().join("ipd.toml");
    std::fs::write(&ipd_path, "key = \"ipd\"\nsettings = { speed = 0.0 }\n").unwrap();

    let rig = rig();
    assert_eq!(rig.add_module(&module_path).await.unwrap(), 7);
    rig.add_ipd_motion(&ipd_path).await.unwrap();
    rig.connect_modules().await.into_result().unwrap();

    rig.set_ipd_sync(63.0).await.unwrap();
    assert_eq!(rig.ipd().await.unwrap(), 63.0);
    assert_eq!(rig.modules_name().await[&7], "left");
    assert_eq!(rig.module_by_eye_mode(EyeMode::Eye1).await.unwrap().id(), 7);
}

#[tokio::test]
async fn test_rig_from_app_config() {
    let mut config = AppConfig {
        application: Default::default(),
        operation_mode: OperationMode::Serial,
        modules: vec![module_config(1, EyeMode::Eye1), module_config(2, EyeMode::Eye2)],
        ipd_motion: None,
        calibration: Default::default(),
        save: Default::default(),
    };
    let rig = MultiModuleManager::from_config(
        &config,
        DriverRegistry::with_mock_drivers(),
        Arc::new(MemoryStore::new()),
    )
    .await
    .unwrap();
    assert_eq!(rig.operation_mode(), OperationMode::Serial);
    assert_eq!(rig.modules_id_list().await, vec![1, 2]);

    config.modules.push(module_config(2, EyeMode::Both));
    let err = MultiModuleManager::from_config(
        &config,
        DriverRegistry::with_mock_drivers(),
        Arc::new(MemoryStore::new()),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, ColorimeterError::Configuration(_)));
}
