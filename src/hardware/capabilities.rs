//! Hardware Capabilities
//!
//! Fine-grained capability traits implemented by colorimeter sub-devices. A
//! module is composed from one camera, any number of motion axes, ND/XYZ filter
//! wheels and an optional RX filter wheel; each is accessed only through the
//! trait for what it can do:
//!
//! - A focus motor or IPD stage implements: `AxisControl`
//! - An ND or XYZ wheel implements: `FilterWheelControl`
//! - The cylinder wheel implements: `RxFilterWheelControl`
//! - A measurement camera implements: `CameraControl`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync, state behind interior mutability)
//! - Returns [`DriverResult`] so callers can classify failures
//! - Reports progress through channels instead of callbacks
//!
//! # Motion contract
//!
//! `move_*` calls return as soon as the motion has been *issued*. Motions on the
//! same device execute in FIFO order. Completion is observed through
//! `is_moving()`, the state channel or the position channel.

use crate::hardware::error::DriverResult;
use crate::hardware::state::DeviceState;
use crate::types::{Binning, BinningMode, FilterChannel, Image, PixelFormat};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

// =============================================================================
// Frame
// =============================================================================

/// A single acquired image plus its acquisition parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Monotonic frame counter of the producing camera.
    pub frame_number: u64,
    /// Exposure time used for this frame (ms).
    pub exposure_ms: f64,
    /// Binning applied by the sensor.
    pub binning: Binning,
    /// Pixel format of the raw data.
    pub pixel_format: PixelFormat,
    /// Pixel data in digital counts, `[rows, cols]`.
    pub data: Image,
}

impl Frame {
    /// Frame width in pixels.
    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    /// Frame height in pixels.
    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    /// Mean grey level (counts).
    pub fn mean_level(&self) -> f64 {
        self.data.mean().unwrap_or(0.0)
    }
}

// =============================================================================
// Common device surface
// =============================================================================

/// Lifecycle shared by every sub-device.
#[async_trait]
pub trait Device: Send + Sync {
    /// Config key / display name used in logs and errors.
    fn name(&self) -> &str;

    /// Open the device. `Disconnected → Connecting → Connected` on success,
    /// `Connecting → Error` on failure.
    async fn connect(&self) -> DriverResult<()>;

    /// Close the device. Idempotent.
    async fn disconnect(&self) -> DriverResult<()>;

    /// Current state.
    fn state(&self) -> DeviceState;

    /// Receiver notified on every state change.
    fn subscribe_state(&self) -> watch::Receiver<DeviceState>;

    /// True while the device is connected.
    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }
}

// =============================================================================
// Motion
// =============================================================================

/// Capability: linear or rotary axis (focus motor, IPD stage, RX axis).
///
/// # Contract
/// - Positions are in device-native units (mm or degrees)
/// - `move_abs`/`move_rel` return once the motion is issued
/// - `stop` is idempotent and also clears a fault state back to `Connected`
#[async_trait]
pub trait AxisControl: Device {
    /// Issue an absolute move.
    async fn move_abs(&self, position: f64) -> DriverResult<()>;

    /// Issue a move relative to the position at which the move starts.
    async fn move_rel(&self, delta: f64) -> DriverResult<()>;

    /// Current position; interpolated while moving.
    async fn position(&self) -> DriverResult<f64>;

    /// True while any issued move has not finished.
    fn is_moving(&self) -> bool;

    /// Halt current and queued motion.
    async fn stop(&self) -> DriverResult<()>;

    /// Receiver of position updates.
    fn subscribe_position(&self) -> broadcast::Receiver<f64>;
}

/// Capability: ND / XYZ filter wheel.
#[async_trait]
pub trait FilterWheelControl: Device {
    /// Issue a move to the slot holding `channel`.
    async fn move_to_channel(&self, channel: FilterChannel) -> DriverResult<()>;

    /// Channel at the current slot.
    async fn channel(&self) -> DriverResult<FilterChannel>;

    /// Channels mounted on the wheel, in slot order.
    fn channels(&self) -> Vec<FilterChannel>;

    /// True while the wheel is turning.
    fn is_moving(&self) -> bool;

    /// Halt the wheel; clears a fault state.
    async fn stop(&self) -> DriverResult<()>;
}

/// Capability: RX (cylinder) filter wheel with named slots.
#[async_trait]
pub trait RxFilterWheelControl: Device {
    /// Issue a move to the slot named `name` (e.g. `"-1.5d"`).
    async fn move_to_named(&self, name: &str) -> DriverResult<()>;

    /// Name of the current slot.
    async fn channel_name(&self) -> DriverResult<String>;

    /// Slot names in order.
    fn channel_names(&self) -> Vec<String>;

    /// True while the wheel is turning.
    fn is_moving(&self) -> bool;

    /// Halt the wheel; clears a fault state.
    async fn stop(&self) -> DriverResult<()>;
}

// =============================================================================
// Camera
// =============================================================================

/// Capability: measurement camera.
///
/// Frames are returned from `capture` and also published on the frame channel;
/// the mean grey level of every frame is published on the grey-level channel.
#[async_trait]
pub trait CameraControl: Device {
    /// Set exposure time in milliseconds.
    async fn set_exposure_ms(&self, exposure_ms: f64) -> DriverResult<()>;

    /// Current exposure time in milliseconds.
    async fn exposure_ms(&self) -> DriverResult<f64>;

    /// Set sensor binning.
    async fn set_binning(&self, binning: Binning) -> DriverResult<()>;

    /// Current sensor binning.
    async fn binning(&self) -> DriverResult<Binning>;

    /// Set binning combination mode.
    async fn set_binning_mode(&self, mode: BinningMode) -> DriverResult<()>;

    /// Current binning combination mode.
    async fn binning_mode(&self) -> DriverResult<BinningMode>;

    /// Set pixel format.
    async fn set_pixel_format(&self, format: PixelFormat) -> DriverResult<()>;

    /// Current pixel format.
    async fn pixel_format(&self) -> DriverResult<PixelFormat>;

    /// Acquire a single frame.
    async fn capture(&self) -> DriverResult<Arc<Frame>>;

    /// Unbinned sensor size `(width, height)`.
    fn resolution(&self) -> (usize, usize);

    /// Physical pixel pitch in micrometres (unbinned).
    fn pixel_size_um(&self) -> f64;

    /// Receiver of every captured frame.
    fn subscribe_frames(&self) -> broadcast::Receiver<Arc<Frame>>;

    /// Receiver of the mean grey level of every captured frame.
    fn subscribe_gray_level(&self) -> broadcast::Receiver<u32>;
}
