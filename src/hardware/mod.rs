//! Hardware abstraction layer.
//!
//! Capability traits for the sub-devices of a colorimeter module, the
//! per-device state machine, the driver registry and mock drivers.

pub mod capabilities;
pub mod error;
pub mod mock;
pub mod registry;
pub mod state;

pub use capabilities::{
    AxisControl, CameraControl, Device, FilterWheelControl, Frame, RxFilterWheelControl,
};
pub use error::{DriverError, DriverErrorKind, DriverResult};
pub use registry::DriverRegistry;
pub use state::{DeviceState, StateTracker};
