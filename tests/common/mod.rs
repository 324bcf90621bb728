//! Shared fixtures: mock-driven module configurations.

#![allow(dead_code)]

use ml_colorimeter::config::{
    CameraConfig, FilterWheelConfig, ModuleConfig, MotionConfig, RxFilterWheelConfig,
    ThroughFocusConfig,
};
use ml_colorimeter::focus::FocusCurve;
use ml_colorimeter::module::RxMappingRule;
use ml_colorimeter::types::{EyeMode, FilterChannel};

/// Axis position of best focus rendered by the mock camera.
pub const BEST_FOCUS: f64 = 5.0;

pub fn settings(text: &str) -> toml::Value {
    toml::from_str(text).unwrap()
}

/// Focus axis imaging VID 100 mm at position 5.
pub fn focus_motion(extra_settings: &str) -> MotionConfig {
    let mut focus = MotionConfig::mock("focus");
    focus.settings = settings(&format!("speed = 200.0\n{}", extra_settings));
    focus.focus_curve = Some(FocusCurve::inverse(100.0, -95.0));
    focus
}

/// One camera bound to a focus axis plus an XYZ wheel.
pub fn module_config(id: i32, eye_mode: EyeMode) -> ModuleConfig {
    ModuleConfig {
        id,
        serial_number: format!("SN{:03}", id),
        name: format!("module-{}", id),
        key: format!("eye{}", id),
        eye_mode,
        camera: CameraConfig {
            settings: settings(&format!(
                "focus_axis = \"focus\"\nbest_focus = {:.1}\nreadout_ms = 0",
                BEST_FOCUS
            )),
            ..CameraConfig::default()
        },
        motions: vec![focus_motion("")],
        filter_wheels: vec![FilterWheelConfig {
            key: "xyz".into(),
            name: "XYZ wheel".into(),
            driver: "mock".into(),
            enabled: true,
            channels: vec![FilterChannel::X, FilterChannel::Y, FilterChannel::Z],
            wait_timeout_ms: 2_000,
            settings: settings("slots_per_second = 100.0"),
        }],
        rx_filter_wheel: None,
        focus_axis: Some("focus".into()),
        auto_exposure: Default::default(),
        wait_timeout_ms: 2_000,
    }
}

/// Adds an RX wheel with cylinder lenses 0, -0.5, -1 and -2 D.
pub fn with_rx_wheel(mut config: ModuleConfig) -> ModuleConfig {
    let mut axis = MotionConfig::mock("rx_axis");
    axis.settings = settings("speed = 2000.0\nmin_position = 0.0\nmax_position = 180.0");
    config.rx_filter_wheel = Some(RxFilterWheelConfig {
        name: "rx".into(),
        driver: "mock".into(),
        channels: vec!["0d".into(), "-0.5d".into(), "-1d".into(), "-2d".into()],
        axis,
        mapping: RxMappingRule {
            cyl_list: vec![0.0, -0.5, -1.0, -2.0],
            axis_list: vec![0, 45, 90, 135, 180],
            ..RxMappingRule::default()
        },
        wait_timeout_ms: 2_000,
        settings: settings("slots_per_second = 100.0"),
    });
    config
}

/// Search around [`BEST_FOCUS`] whose fine range holds the peak.
pub fn through_focus_config() -> ThroughFocusConfig {
    ThroughFocusConfig {
        focus_min: 4.0,
        focus_max: 6.0,
        rough_step: 0.25,
        fine_range: 0.5,
        fine_step: 0.05,
        freq: 20.0,
        smooth: None,
        rois: Vec::new(),
        chess_mode: true,
        lpmm_unit: true,
        pixel_size_um: 5.5,
        move_timeout_ms: 2_000,
    }
}
