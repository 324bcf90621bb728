//! Driver Registry for Module Construction
//!
//! Resolves the `driver` string of each device entry in a [`ModuleConfig`]
//! to a factory that validates the free-form `settings` table and builds the
//! device behind its capability trait.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        DriverRegistry                         │
//! │  axes: "mock" | ...     cameras: "mock" | ...                  │
//! │  filter_wheels: "mock"  rx_filter_wheels: "mock"               │
//! ├───────────────────────────────────────────────────────────────┤
//! │                      Capability Traits                        │
//! │  AxisControl | CameraControl | FilterWheelControl | RxFilter… │
//! ├───────────────────────────────────────────────────────────────┤
//! │                      Hardware Drivers                         │
//! │  MockAxis | MockCamera | MockFilterWheel | vendor drivers …    │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The registry is constructed explicitly and injected into
//! [`MultiModuleManager`](crate::module::multi::MultiModuleManager); there is
//! no process-wide instance.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let registry = DriverRegistry::with_mock_drivers();
//! let axis = registry.create_axis(&MotionConfig::mock("focus"))?;
//! axis.connect().await?;
//! ```
//!
//! [`ModuleConfig`]: crate::config::ModuleConfig

use crate::config::{CameraConfig, FilterWheelConfig, MotionConfig, RxFilterWheelConfig};
use crate::error::{AppResult, ColorimeterError};
use crate::hardware::capabilities::{
    AxisControl, CameraControl, FilterWheelControl, RxFilterWheelControl,
};
use crate::hardware::mock::{
    MockAxisFactory, MockCameraFactory, MockFilterWheelFactory, MockRxFilterWheelFactory,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// =============================================================================
// Factories
// =============================================================================

/// Builds motion axes for one driver type.
pub trait AxisFactory: Send + Sync {
    /// Driver type string matched against `MotionConfig::driver`.
    fn driver_type(&self) -> &'static str;

    /// Check the settings table without touching hardware.
    fn validate(&self, config: &MotionConfig) -> AppResult<()>;

    /// Instantiate the (unconnected) axis.
    fn build(&self, config: &MotionConfig) -> AppResult<Arc<dyn AxisControl>>;
}

/// Builds cameras for one driver type.
pub trait CameraFactory: Send + Sync {
    /// Driver type string matched against `CameraConfig::driver`.
    fn driver_type(&self) -> &'static str;

    /// Check the settings table without touching hardware.
    fn validate(&self, config: &CameraConfig) -> AppResult<()>;

    /// Instantiate the (unconnected) camera. `axes` are the module's already
    /// built motion axes, keyed by config key.
    fn build(
        &self,
        config: &CameraConfig,
        axes: &BTreeMap<String, Arc<dyn AxisControl>>,
    ) -> AppResult<Arc<dyn CameraControl>>;
}

/// Builds ND / XYZ filter wheels for one driver type.
pub trait FilterWheelFactory: Send + Sync {
    /// Driver type string matched against `FilterWheelConfig::driver`.
    fn driver_type(&self) -> &'static str;

    /// Check the settings table without touching hardware.
    fn validate(&self, config: &FilterWheelConfig) -> AppResult<()>;

    /// Instantiate the (unconnected) wheel.
    fn build(&self, config: &FilterWheelConfig) -> AppResult<Arc<dyn FilterWheelControl>>;
}

/// Builds RX filter wheels for one driver type.
pub trait RxFilterWheelFactory: Send + Sync {
    /// Driver type string matched against `RxFilterWheelConfig::driver`.
    fn driver_type(&self) -> &'static str;

    /// Check the settings table without touching hardware.
    fn validate(&self, config: &RxFilterWheelConfig) -> AppResult<()>;

    /// Instantiate the (unconnected) wheel.
    fn build(&self, config: &RxFilterWheelConfig) -> AppResult<Arc<dyn RxFilterWheelControl>>;
}

/// Device class a factory produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceClass {
    /// Motion axis
    Axis,
    /// Measurement camera
    Camera,
    /// ND / XYZ filter wheel
    FilterWheel,
    /// RX filter wheel
    RxFilterWheel,
}

// =============================================================================
// Driver Registry
// =============================================================================

/// Factories keyed by driver type, one table per device class.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    axes: HashMap<String, Arc<dyn AxisFactory>>,
    cameras: HashMap<String, Arc<dyn CameraFactory>>,
    filter_wheels: HashMap<String, Arc<dyn FilterWheelFactory>>,
    rx_filter_wheels: HashMap<String, Arc<dyn RxFilterWheelFactory>>,
}

impl DriverRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `"mock"` driver registered for every device class.
    pub fn with_mock_drivers() -> Self {
        let mut registry = Self::new();
        registry.register_axis(Arc::new(MockAxisFactory));
        registry.register_camera(Arc::new(MockCameraFactory));
        registry.register_filter_wheel(Arc::new(MockFilterWheelFactory));
        registry.register_rx_filter_wheel(Arc::new(MockRxFilterWheelFactory));
        registry
    }

    /// Register (or replace) an axis factory.
    pub fn register_axis(&mut self, factory: Arc<dyn AxisFactory>) {
        self.axes.insert(factory.driver_type().to_string(), factory);
    }

    /// Register (or replace) a camera factory.
    pub fn register_camera(&mut self, factory: Arc<dyn CameraFactory>) {
        self.cameras
            .insert(factory.driver_type().to_string(), factory);
    }

    /// Register (or replace) a filter wheel factory.
    pub fn register_filter_wheel(&mut self, factory: Arc<dyn FilterWheelFactory>) {
        self.filter_wheels
            .insert(factory.driver_type().to_string(), factory);
    }

    /// Register (or replace) an RX filter wheel factory.
    pub fn register_rx_filter_wheel(&mut self, factory: Arc<dyn RxFilterWheelFactory>) {
        self.rx_filter_wheels
            .insert(factory.driver_type().to_string(), factory);
    }

    /// Whether `driver` is registered for `class`.
    pub fn contains(&self, class: DeviceClass, driver: &str) -> bool {
        match class {
            DeviceClass::Axis => self.axes.contains_key(driver),
            DeviceClass::Camera => self.cameras.contains_key(driver),
            DeviceClass::FilterWheel => self.filter_wheels.contains_key(driver),
            DeviceClass::RxFilterWheel => self.rx_filter_wheels.contains_key(driver),
        }
    }

    /// Sorted `(class, driver)` pairs of every registered factory.
    pub fn list_drivers(&self) -> Vec<(DeviceClass, String)> {
        let mut drivers: Vec<(DeviceClass, String)> = self
            .axes
            .keys()
            .map(|name| (DeviceClass::Axis, name.clone()))
            .chain(self.cameras.keys().map(|name| (DeviceClass::Camera, name.clone())))
            .chain(
                self.filter_wheels
                    .keys()
                    .map(|name| (DeviceClass::FilterWheel, name.clone())),
            )
            .chain(
                self.rx_filter_wheels
                    .keys()
                    .map(|name| (DeviceClass::RxFilterWheel, name.clone())),
            )
            .collect();
        drivers.sort();
        drivers
    }

    // =========================================================================
    // Device Instantiation
    // =========================================================================

    /// Validate and build an axis.
    pub fn create_axis(&self, config: &MotionConfig) -> AppResult<Arc<dyn AxisControl>> {
        let factory = lookup(&self.axes, DeviceClass::Axis, &config.driver, &config.key)?;
        factory.validate(config)?;
        factory.build(config)
    }

    /// Validate and build a camera wired to the module's axes.
    pub fn create_camera(
        &self,
        config: &CameraConfig,
        axes: &BTreeMap<String, Arc<dyn AxisControl>>,
    ) -> AppResult<Arc<dyn CameraControl>> {
        let factory = lookup(&self.cameras, DeviceClass::Camera, &config.driver, &config.name)?;
        factory.validate(config)?;
        factory.build(config, axes)
    }

    /// Validate and build an ND / XYZ filter wheel.
    pub fn create_filter_wheel(
        &self,
        config: &FilterWheelConfig,
    ) -> AppResult<Arc<dyn FilterWheelControl>> {
        let factory = lookup(
            &self.filter_wheels,
            DeviceClass::FilterWheel,
            &config.driver,
            &config.key,
        )?;
        factory.validate(config)?;
        factory.build(config)
    }

    /// Validate and build an RX filter wheel.
    pub fn create_rx_filter_wheel(
        &self,
        config: &RxFilterWheelConfig,
    ) -> AppResult<Arc<dyn RxFilterWheelControl>> {
        let factory = lookup(
            &self.rx_filter_wheels,
            DeviceClass::RxFilterWheel,
            &config.driver,
            &config.name,
        )?;
        factory.validate(config)?;
        factory.build(config)
    }
}

fn lookup<'a, F: ?Sized>(
    table: &'a HashMap<String, Arc<F>>,
    class: DeviceClass,
    driver: &str,
    device: &str,
) -> AppResult<&'a Arc<F>> {
    table.get(driver).ok_or_else(|| {
        ColorimeterError::config(format!(
            "unknown {:?} driver '{}' for device '{}'",
            class, driver, device
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FilterChannel;

    fn settings(text: &str) -> toml::Value {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn test_mock_drivers_registered_for_every_class() {
        let registry = DriverRegistry::with_mock_drivers();
        for class in [
            DeviceClass::Axis,
            DeviceClass::Camera,
            DeviceClass::FilterWheel,
            DeviceClass::RxFilterWheel,
        ] {
            assert!(registry.contains(class, "mock"));
        }
        assert_eq!(registry.list_drivers().len(), 4);
        assert!(DriverRegistry::new().list_drivers().is_empty());
    }

    #[test]
    fn test_unknown_driver_is_configuration_error() {
        let registry = DriverRegistry::with_mock_drivers();
        let mut config = MotionConfig::mock("focus");
        config.driver = "esp300".to_string();
        let err = registry.create_axis(&config).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn test_invalid_settings_rejected_before_build() {
        let registry = DriverRegistry::with_mock_drivers();
        let mut config = MotionConfig::mock("focus");
        config.settings = settings("min_position = 5.0\nmax_position = 1.0");
        assert!(registry.create_axis(&config).is_err());
    }

    #[test]
    fn test_camera_focus_axis_must_exist() {
        let registry = DriverRegistry::with_mock_drivers();
        let config = CameraConfig {
            settings: settings("focus_axis = \"focus\""),
            ..CameraConfig::default()
        };
        assert!(registry.create_camera(&config, &BTreeMap::new()).is_err());

        let mut axes = BTreeMap::new();
        axes.insert(
            "focus".to_string(),
            registry.create_axis(&MotionConfig::mock("focus")).unwrap(),
        );
        assert!(registry.create_camera(&config, &axes).is_ok());
    }

    #[test]
    fn test_filter_wheel_initial_slot_checked() {
        let registry = DriverRegistry::with_mock_drivers();
        let config = FilterWheelConfig {
            key: "nd".into(),
            name: "ND".into(),
            driver: "mock".into(),
            enabled: true,
            channels: vec![FilterChannel::ND0, FilterChannel::ND1],
            wait_timeout_ms: 1_000,
            settings: settings("initial_slot = 4"),
        };
        assert!(registry.create_filter_wheel(&config).is_err());
    }
}
