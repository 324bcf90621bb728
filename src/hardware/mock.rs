//! Mock Hardware Implementations
//!
//! Simulated colorimeter sub-devices for tests and dry runs. All mocks use
//! async-safe timing (`tokio::time::sleep`, never `std::thread::sleep`).
//!
//! # Available Mocks
//!
//! - `MockAxis` - linear/rotary axis with finite speed and interpolated position
//! - `MockFilterWheel` - ND / XYZ wheel, slot moves at a configurable rate
//! - `MockRxFilterWheel` - cylinder wheel with named slots
//! - `MockCamera` - synthetic edge / cross-hair / uniform scene; when bound to a
//!   focus axis the scene is blurred by the defocus of that axis
//!
//! # Timing
//!
//! Moves are issued immediately and executed by a background task. Moves on the
//! same device are serialized through a FIFO motion lane (`tokio::sync::Mutex`
//! is fair), so overlapping requests complete in issue order.
//!
//! # Fault injection
//!
//! Every mock accepts a `fault` entry in its settings table:
//!
//! ```toml
//! fault = "alarm"                                        # every move ends in Alarm
//! fault = "connect_failure"                              # connect fails
//! fault = { fail_after = { operation = "capture", count = 3 } }
//! ```

use crate::config::{CameraConfig, FilterWheelConfig, MotionConfig, RxFilterWheelConfig};
use crate::error::{AppResult, ColorimeterError};
use crate::hardware::capabilities::{
    AxisControl, CameraControl, Device, FilterWheelControl, Frame, RxFilterWheelControl,
};
use crate::hardware::error::{DriverError, DriverErrorKind, DriverResult};
use crate::hardware::registry::{AxisFactory, CameraFactory, FilterWheelFactory, RxFilterWheelFactory};
use crate::hardware::state::{DeviceState, StateTracker};
use crate::types::{Binning, BinningMode, FilterChannel, Image, PixelFormat};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, Duration, Instant};

/// Interpolation tick of simulated motion.
const MOTION_TICK: Duration = Duration::from_millis(5);

// =============================================================================
// Fault injection
// =============================================================================

/// Failure scenario of a mock device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FaultScenario {
    /// No injected failures
    #[default]
    None,
    /// `connect` fails with a connection error
    ConnectFailure,
    /// Every move ends with the motor driver alarm raised
    Alarm,
    /// Every operation after connect fails with a hardware fault
    Hardware,
    /// The first `count` calls of `operation` succeed, later ones fail
    FailAfter {
        /// Operation name: "move", "capture" or "connect"
        operation: String,
        /// Successful calls before failures start
        count: u32,
    },
}

/// Evaluates a [`FaultScenario`] for one device.
#[derive(Debug)]
pub struct FaultInjector {
    device: String,
    scenario: FaultScenario,
    counts: parking_lot::Mutex<HashMap<String, u32>>,
}

impl FaultInjector {
    /// Injector for `device`.
    pub fn new(device: impl Into<String>, scenario: FaultScenario) -> Self {
        Self {
            device: device.into(),
            scenario,
            counts: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Fail `operation` if the scenario says so.
    pub fn check(&self, operation: &str) -> DriverResult<()> {
        match &self.scenario {
            FaultScenario::ConnectFailure if operation == "connect" => Err(DriverError::new(
                &self.device,
                DriverErrorKind::Connection,
                "device did not answer",
            )),
            FaultScenario::Alarm if operation == "move" => Err(DriverError::new(
                &self.device,
                DriverErrorKind::Alarm,
                "motor driver alarm raised",
            )),
            FaultScenario::Hardware if operation != "connect" => Err(DriverError::new(
                &self.device,
                DriverErrorKind::Hardware,
                format!("hardware fault during {}", operation),
            )),
            FaultScenario::FailAfter {
                operation: target,
                count,
            } if target == operation => {
                let mut counts = self.counts.lock();
                let seen = counts.entry(target.clone()).or_insert(0);
                *seen += 1;
                if *seen > *count {
                    Err(DriverError::new(
                        &self.device,
                        DriverErrorKind::Hardware,
                        format!("injected failure after {} {} calls", count, operation),
                    ))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}

fn parse_settings<T: serde::de::DeserializeOwned>(
    device: &str,
    settings: &toml::Value,
) -> AppResult<T> {
    settings.clone().try_into().map_err(|err| {
        ColorimeterError::config(format!("invalid settings for '{}': {}", device, err))
    })
}

// =============================================================================
// Motion core shared by axes and wheels
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum MoveTarget {
    Absolute(f64),
    Relative(f64),
}

enum MoveOutcome {
    Completed,
    Stopped,
}

/// Simulated motor: FIFO lane, interpolated position, stop epochs.
struct MotionCore {
    name: String,
    state: StateTracker,
    position: parking_lot::Mutex<f64>,
    speed: f64,
    settle_ms: u64,
    connect_delay_ms: u64,
    limits: (f64, f64),
    lane: tokio::sync::Mutex<()>,
    pending: parking_lot::Mutex<usize>,
    stop_epoch: AtomicU64,
    position_tx: broadcast::Sender<f64>,
    faults: FaultInjector,
}

impl MotionCore {
    #[allow(clippy::too_many_arguments)]
    fn new(
        name: &str,
        initial_position: f64,
        speed: f64,
        settle_ms: u64,
        connect_delay_ms: u64,
        limits: (f64, f64),
        fault: FaultScenario,
    ) -> Arc<Self> {
        let (position_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            name: name.to_string(),
            state: StateTracker::new(name),
            position: parking_lot::Mutex::new(initial_position),
            speed,
            settle_ms,
            connect_delay_ms,
            limits,
            lane: tokio::sync::Mutex::new(()),
            pending: parking_lot::Mutex::new(0),
            stop_epoch: AtomicU64::new(0),
            position_tx,
            faults: FaultInjector::new(name, fault),
        })
    }

    async fn connect(&self) -> DriverResult<()> {
        if self.state.current().is_attached() {
            return Ok(());
        }
        self.state.transition(DeviceState::Connecting)?;
        if self.connect_delay_ms > 0 {
            sleep(Duration::from_millis(self.connect_delay_ms)).await;
        }
        if let Err(err) = self.faults.check("connect") {
            self.state.transition(DeviceState::Error)?;
            return Err(err);
        }
        self.state.transition(DeviceState::Connected)?;
        tracing::debug!(device = %self.name, "mock device connected");
        Ok(())
    }

    fn disconnect(&self) -> DriverResult<()> {
        self.stop_epoch.fetch_add(1, Ordering::SeqCst);
        self.state.transition(DeviceState::Disconnected)?;
        Ok(())
    }

    fn check_ready(&self) -> DriverResult<()> {
        let state = self.state.current();
        if !state.is_attached() {
            return Err(DriverError::new(
                &self.name,
                DriverErrorKind::NotConnected,
                "device is not connected",
            ));
        }
        match state.fault_error(&self.name) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_limits(&self, target: f64) -> DriverResult<()> {
        let (min, max) = self.limits;
        if !target.is_finite() || target < min || target > max {
            return Err(DriverError::new(
                &self.name,
                DriverErrorKind::InvalidParameter,
                format!("target {} outside travel range [{}, {}]", target, min, max),
            ));
        }
        Ok(())
    }

    fn issue(self: &Arc<Self>, target: MoveTarget) -> DriverResult<()> {
        self.check_ready()?;
        if let MoveTarget::Absolute(position) = target {
            self.check_limits(position)?;
        }
        {
            let mut pending = self.pending.lock();
            self.state.transition(DeviceState::Moving)?;
            *pending += 1;
        }
        let epoch = self.stop_epoch.load(Ordering::SeqCst);
        let core = Arc::clone(self);
        tokio::spawn(async move {
            core.run_move(target, epoch).await;
        });
        Ok(())
    }

    async fn run_move(self: Arc<Self>, target: MoveTarget, epoch: u64) {
        let _lane = self.lane.lock().await;
        let outcome = self.execute(target, epoch).await;

        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        match outcome {
            Ok(MoveOutcome::Completed) | Ok(MoveOutcome::Stopped) => {
                if *pending == 0 && self.state.current() == DeviceState::Moving {
                    let _ = self.state.transition(DeviceState::Stationary);
                }
            }
            Err(err) => {
                tracing::warn!(device = %self.name, error = %err, "mock move failed");
                let next = match err.kind {
                    DriverErrorKind::Alarm => DeviceState::Alarm,
                    DriverErrorKind::Timeout => DeviceState::Timeout,
                    _ => DeviceState::Error,
                };
                let _ = self.state.transition(next);
            }
        }
    }

    async fn execute(&self, target: MoveTarget, epoch: u64) -> DriverResult<MoveOutcome> {
        if self.stopped_since(epoch) {
            return Ok(MoveOutcome::Stopped);
        }
        if let Some(err) = self.state.current().fault_error(&self.name) {
            return Err(err);
        }
        self.faults.check("move")?;

        let start = *self.position.lock();
        let end = match target {
            MoveTarget::Absolute(position) => position,
            MoveTarget::Relative(delta) => start + delta,
        };
        self.check_limits(end)?;

        let duration = if self.speed > 0.0 {
            Duration::from_secs_f64((end - start).abs() / self.speed)
        } else {
            Duration::ZERO
        };
        let began = Instant::now();
        loop {
            let elapsed = began.elapsed();
            let fraction = if duration.is_zero() {
                1.0
            } else {
                (elapsed.as_secs_f64() / duration.as_secs_f64()).min(1.0)
            };
            let position = start + (end - start) * fraction;
            *self.position.lock() = position;
            let _ = self.position_tx.send(position);
            if fraction >= 1.0 {
                break;
            }
            sleep(MOTION_TICK.min(duration - elapsed.min(duration))).await;
            if self.stopped_since(epoch) {
                return Ok(MoveOutcome::Stopped);
            }
        }

        if self.settle_ms > 0 {
            sleep(Duration::from_millis(self.settle_ms)).await;
        }
        Ok(MoveOutcome::Completed)
    }

    fn stopped_since(&self, epoch: u64) -> bool {
        self.stop_epoch.load(Ordering::SeqCst) != epoch
    }

    fn stop(&self) -> DriverResult<()> {
        self.stop_epoch.fetch_add(1, Ordering::SeqCst);
        let state = self.state.current();
        if state.is_fault() {
            self.state.transition(DeviceState::Connected)?;
        }
        Ok(())
    }

    fn is_moving(&self) -> bool {
        *self.pending.lock() > 0
    }

    fn position(&self) -> f64 {
        *self.position.lock()
    }
}

// =============================================================================
// MockAxis
// =============================================================================

/// Settings table of a mock axis.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockAxisSettings {
    /// Start position (axis units)
    pub initial_position: f64,
    /// Travel speed in units per second; 0 moves instantly
    pub speed: f64,
    /// Extra settle time after each move (ms)
    pub settle_ms: u64,
    /// Time spent in `Connecting` (ms)
    pub connect_delay_ms: u64,
    /// Lower travel limit
    pub min_position: f64,
    /// Upper travel limit
    pub max_position: f64,
    /// Injected failure
    pub fault: FaultScenario,
}

impl Default for MockAxisSettings {
    fn default() -> Self {
        Self {
            initial_position: 0.0,
            speed: 100.0,
            settle_ms: 0,
            connect_delay_ms: 0,
            min_position: -1.0e6,
            max_position: 1.0e6,
            fault: FaultScenario::None,
        }
    }
}

/// Simulated motion axis.
///
/// ```rust,ignore
/// let axis = MockAxis::new("focus", MockAxisSettings::default());
/// axis.connect().await?;
/// axis.move_abs(5.0).await?;      // returns once issued
/// while axis.is_moving() { tokio::task::yield_now().await; }
/// ```
pub struct MockAxis {
    core: Arc<MotionCore>,
}

impl MockAxis {
    /// Create an axis named `name`.
    pub fn new(name: &str, settings: MockAxisSettings) -> Self {
        Self {
            core: MotionCore::new(
                name,
                settings.initial_position,
                settings.speed,
                settings.settle_ms,
                settings.connect_delay_ms,
                (settings.min_position, settings.max_position),
                settings.fault,
            ),
        }
    }
}

#[async_trait]
impl Device for MockAxis {
    fn name(&self) -> &str {
        &self.core.name
    }

    async fn connect(&self) -> DriverResult<()> {
        self.core.connect().await
    }

    async fn disconnect(&self) -> DriverResult<()> {
        self.core.disconnect()
    }

    fn state(&self) -> DeviceState {
        self.core.state.current()
    }

    fn subscribe_state(&self) -> watch::Receiver<DeviceState> {
        self.core.state.subscribe()
    }
}

#[async_trait]
impl AxisControl for MockAxis {
    async fn move_abs(&self, position: f64) -> DriverResult<()> {
        self.core.issue(MoveTarget::Absolute(position))
    }

    async fn move_rel(&self, delta: f64) -> DriverResult<()> {
        self.core.issue(MoveTarget::Relative(delta))
    }

    async fn position(&self) -> DriverResult<f64> {
        Ok(self.core.position())
    }

    fn is_moving(&self) -> bool {
        self.core.is_moving()
    }

    async fn stop(&self) -> DriverResult<()> {
        self.core.stop()
    }

    fn subscribe_position(&self) -> broadcast::Receiver<f64> {
        self.core.position_tx.subscribe()
    }
}

/// Factory registered as the `"mock"` axis driver.
pub struct MockAxisFactory;

impl AxisFactory for MockAxisFactory {
    fn driver_type(&self) -> &'static str {
        "mock"
    }

    fn validate(&self, config: &MotionConfig) -> AppResult<()> {
        let settings: MockAxisSettings = parse_settings(&config.key, &config.settings)?;
        if settings.min_position > settings.max_position {
            return Err(ColorimeterError::config(format!(
                "axis '{}': min_position > max_position",
                config.key
            )));
        }
        if settings.speed < 0.0 {
            return Err(ColorimeterError::config(format!(
                "axis '{}': speed must be >= 0",
                config.key
            )));
        }
        Ok(())
    }

    fn build(&self, config: &MotionConfig) -> AppResult<Arc<dyn AxisControl>> {
        let settings: MockAxisSettings = parse_settings(&config.key, &config.settings)?;
        Ok(Arc::new(MockAxis::new(&config.key, settings)))
    }
}

// =============================================================================
// MockFilterWheel / MockRxFilterWheel
// =============================================================================

/// Settings table of a mock filter wheel (ND/XYZ or RX).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockWheelSettings {
    /// Slot index at power-up
    pub initial_slot: usize,
    /// Rotation rate in slots per second; 0 moves instantly
    pub slots_per_second: f64,
    /// Extra settle time after each move (ms)
    pub settle_ms: u64,
    /// Time spent in `Connecting` (ms)
    pub connect_delay_ms: u64,
    /// Injected failure
    pub fault: FaultScenario,
}

impl Default for MockWheelSettings {
    fn default() -> Self {
        Self {
            initial_slot: 0,
            slots_per_second: 50.0,
            settle_ms: 0,
            connect_delay_ms: 0,
            fault: FaultScenario::None,
        }
    }
}

fn wheel_core(name: &str, slots: usize, settings: MockWheelSettings) -> Arc<MotionCore> {
    let last = slots.saturating_sub(1) as f64;
    MotionCore::new(
        name,
        settings.initial_slot.min(slots.saturating_sub(1)) as f64,
        settings.slots_per_second,
        settings.settle_ms,
        settings.connect_delay_ms,
        (0.0, last),
        settings.fault,
    )
}

fn slot_index(core: &MotionCore) -> usize {
    core.position().round().max(0.0) as usize
}

/// Simulated ND / XYZ filter wheel.
pub struct MockFilterWheel {
    core: Arc<MotionCore>,
    channels: Vec<FilterChannel>,
}

impl MockFilterWheel {
    /// Create a wheel carrying `channels` in slot order.
    pub fn new(name: &str, channels: Vec<FilterChannel>, settings: MockWheelSettings) -> Self {
        Self {
            core: wheel_core(name, channels.len(), settings),
            channels,
        }
    }
}

#[async_trait]
impl Device for MockFilterWheel {
    fn name(&self) -> &str {
        &self.core.name
    }

    async fn connect(&self) -> DriverResult<()> {
        self.core.connect().await
    }

    async fn disconnect(&self) -> DriverResult<()> {
        self.core.disconnect()
    }

    fn state(&self) -> DeviceState {
        self.core.state.current()
    }

    fn subscribe_state(&self) -> watch::Receiver<DeviceState> {
        self.core.state.subscribe()
    }
}

#[async_trait]
impl FilterWheelControl for MockFilterWheel {
    async fn move_to_channel(&self, channel: FilterChannel) -> DriverResult<()> {
        let slot = self
            .channels
            .iter()
            .position(|mounted| *mounted == channel)
            .ok_or_else(|| {
                DriverError::new(
                    &self.core.name,
                    DriverErrorKind::InvalidParameter,
                    format!("channel {} is not mounted", channel),
                )
            })?;
        self.core.issue(MoveTarget::Absolute(slot as f64))
    }

    async fn channel(&self) -> DriverResult<FilterChannel> {
        Ok(self
            .channels
            .get(slot_index(&self.core))
            .copied()
            .unwrap_or(FilterChannel::Unknown))
    }

    fn channels(&self) -> Vec<FilterChannel> {
        self.channels.clone()
    }

    fn is_moving(&self) -> bool {
        self.core.is_moving()
    }

    async fn stop(&self) -> DriverResult<()> {
        self.core.stop()
    }
}

/// Factory registered as the `"mock"` filter wheel driver.
pub struct MockFilterWheelFactory;

impl FilterWheelFactory for MockFilterWheelFactory {
    fn driver_type(&self) -> &'static str {
        "mock"
    }

    fn validate(&self, config: &FilterWheelConfig) -> AppResult<()> {
        let settings: MockWheelSettings = parse_settings(&config.key, &config.settings)?;
        if settings.initial_slot >= config.channels.len() {
            return Err(ColorimeterError::config(format!(
                "filter wheel '{}': initial_slot {} out of range",
                config.key, settings.initial_slot
            )));
        }
        Ok(())
    }

    fn build(&self, config: &FilterWheelConfig) -> AppResult<Arc<dyn FilterWheelControl>> {
        let settings: MockWheelSettings = parse_settings(&config.key, &config.settings)?;
        Ok(Arc::new(MockFilterWheel::new(
            &config.key,
            config.channels.clone(),
            settings,
        )))
    }
}

/// Simulated RX (cylinder) wheel with named slots.
pub struct MockRxFilterWheel {
    core: Arc<MotionCore>,
    names: Vec<String>,
}

impl MockRxFilterWheel {
    /// Create a wheel with `names` in slot order.
    pub fn new(name: &str, names: Vec<String>, settings: MockWheelSettings) -> Self {
        Self {
            core: wheel_core(name, names.len(), settings),
            names,
        }
    }
}

#[async_trait]
impl Device for MockRxFilterWheel {
    fn name(&self) -> &str {
        &self.core.name
    }

    async fn connect(&self) -> DriverResult<()> {
        self.core.connect().await
    }

    async fn disconnect(&self) -> DriverResult<()> {
        self.core.disconnect()
    }

    fn state(&self) -> DeviceState {
        self.core.state.current()
    }

    fn subscribe_state(&self) -> watch::Receiver<DeviceState> {
        self.core.state.subscribe()
    }
}

#[async_trait]
impl RxFilterWheelControl for MockRxFilterWheel {
    async fn move_to_named(&self, name: &str) -> DriverResult<()> {
        let slot = self
            .names
            .iter()
            .position(|mounted| mounted == name)
            .ok_or_else(|| {
                DriverError::new(
                    &self.core.name,
                    DriverErrorKind::InvalidParameter,
                    format!("no RX slot named '{}'", name),
                )
            })?;
        self.core.issue(MoveTarget::Absolute(slot as f64))
    }

    async fn channel_name(&self) -> DriverResult<String> {
        self.names
            .get(slot_index(&self.core))
            .cloned()
            .ok_or_else(|| {
                DriverError::new(&self.core.name, DriverErrorKind::Hardware, "slot out of range")
            })
    }

    fn channel_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn is_moving(&self) -> bool {
        self.core.is_moving()
    }

    async fn stop(&self) -> DriverResult<()> {
        self.core.stop()
    }
}

/// Factory registered as the `"mock"` RX wheel driver.
pub struct MockRxFilterWheelFactory;

impl RxFilterWheelFactory for MockRxFilterWheelFactory {
    fn driver_type(&self) -> &'static str {
        "mock"
    }

    fn validate(&self, config: &RxFilterWheelConfig) -> AppResult<()> {
        parse_settings::<MockWheelSettings>(&config.name, &config.settings).map(|_| ())
    }

    fn build(&self, config: &RxFilterWheelConfig) -> AppResult<Arc<dyn RxFilterWheelControl>> {
        let settings: MockWheelSettings = parse_settings(&config.name, &config.settings)?;
        Ok(Arc::new(MockRxFilterWheel::new(
            &config.name,
            config.channels.clone(),
            settings,
        )))
    }
}

// =============================================================================
// MockCamera
// =============================================================================

/// Synthetic target rendered by [`MockCamera`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SceneKind {
    /// Flat field
    Uniform,
    /// Vertical dark/bright edge through the image centre
    #[default]
    Edge,
    /// Bright cross-hair lines through the image centre
    Cross,
}

/// Settings table of a mock camera.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockCameraSettings {
    /// Sensor width (unbinned pixels)
    pub width: usize,
    /// Sensor height (unbinned pixels)
    pub height: usize,
    /// Pixel pitch (µm)
    pub pixel_size_um: f64,
    /// Rendered target
    pub scene: SceneKind,
    /// Constant offset present in every pixel (counts)
    pub dark_level: f64,
    /// Bright-level signal per millisecond of exposure (counts)
    pub signal_per_ms: f64,
    /// Fraction of the bright level removed on the dark side of the target
    pub contrast: f64,
    /// Axis whose position defocuses the scene
    pub focus_axis: Option<String>,
    /// Axis position of best focus
    pub best_focus: f64,
    /// In-focus blur sigma (pixels)
    pub blur_sigma0: f64,
    /// Blur growth per unit of defocus (pixels per axis unit)
    pub blur_per_unit: f64,
    /// Readout time per frame (ms)
    pub readout_ms: u64,
    /// Time spent in `Connecting` (ms)
    pub connect_delay_ms: u64,
    /// Initial exposure (ms)
    pub exposure_ms: f64,
    /// Injected failure
    pub fault: FaultScenario,
}

impl Default for MockCameraSettings {
    fn default() -> Self {
        Self {
            width: 64,
            height: 64,
            pixel_size_um: 5.5,
            scene: SceneKind::Edge,
            dark_level: 64.0,
            signal_per_ms: 20.0,
            contrast: 0.8,
            focus_axis: None,
            best_focus: 0.0,
            blur_sigma0: 0.8,
            blur_per_unit: 4.0,
            readout_ms: 2,
            connect_delay_ms: 0,
            exposure_ms: 100.0,
            fault: FaultScenario::None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CameraParams {
    exposure_ms: f64,
    binning: Binning,
    binning_mode: BinningMode,
    pixel_format: PixelFormat,
}

/// Simulated measurement camera.
pub struct MockCamera {
    name: String,
    settings: MockCameraSettings,
    state: StateTracker,
    params: parking_lot::RwLock<CameraParams>,
    focus: Option<Arc<dyn AxisControl>>,
    frame_count: AtomicU64,
    frame_tx: broadcast::Sender<Arc<Frame>>,
    gray_tx: broadcast::Sender<u32>,
    faults: FaultInjector,
}

impl MockCamera {
    /// Create a camera; `focus` couples scene blur to an axis position.
    pub fn new(
        name: &str,
        settings: MockCameraSettings,
        focus: Option<Arc<dyn AxisControl>>,
    ) -> Self {
        let (frame_tx, _) = broadcast::channel(16);
        let (gray_tx, _) = broadcast::channel(16);
        let params = CameraParams {
            exposure_ms: settings.exposure_ms,
            binning: Binning::OneByOne,
            binning_mode: BinningMode::Average,
            pixel_format: PixelFormat::Mono12,
        };
        let faults = FaultInjector::new(name, settings.fault.clone());
        Self {
            name: name.to_string(),
            settings,
            state: StateTracker::new(name),
            params: parking_lot::RwLock::new(params),
            focus,
            frame_count: AtomicU64::new(0),
            frame_tx,
            gray_tx,
            faults,
        }
    }

    fn check_ready(&self) -> DriverResult<()> {
        let state = self.state.current();
        if !state.is_attached() {
            return Err(DriverError::new(
                &self.name,
                DriverErrorKind::NotConnected,
                "camera is not connected",
            ));
        }
        match state.fault_error(&self.name) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn blur_sigma(&self, focus_position: Option<f64>) -> f64 {
        let sigma0 = self.settings.blur_sigma0;
        let defocus = focus_position
            .map(|position| self.settings.blur_per_unit * (position - self.settings.best_focus))
            .unwrap_or(0.0);
        (sigma0 * sigma0 + defocus * defocus).sqrt().max(1e-3)
    }

    fn render(&self, params: CameraParams, sigma: f64) -> Image {
        let factor = params.binning.factor();
        let rows = (self.settings.height / factor).max(1);
        let cols = (self.settings.width / factor).max(1);
        let sigma = sigma / factor as f64;

        let bright = self.settings.signal_per_ms * params.exposure_ms;
        let dim = bright * (1.0 - self.settings.contrast.clamp(0.0, 1.0));
        let center_row = rows as f64 / 2.0 - 0.5;
        let center_col = cols as f64 / 2.0 - 0.5;
        let gain = match params.binning_mode {
            BinningMode::Sum => (factor * factor) as f64,
            BinningMode::Average => 1.0,
        };
        let full_scale = params.pixel_format.max_value();
        let scene = self.settings.scene;
        let dark = self.settings.dark_level;

        Image::from_shape_fn((rows, cols), |(row, col)| {
            let weight = match scene {
                SceneKind::Uniform => 1.0,
                SceneKind::Edge => {
                    let z = (col as f64 - center_col) / sigma;
                    1.0 / (1.0 + (-1.702 * z).exp())
                }
                SceneKind::Cross => {
                    let line = |offset: f64| (-(offset * offset) / (2.0 * sigma * sigma)).exp();
                    line(col as f64 - center_col).max(line(row as f64 - center_row))
                }
            };
            let signal = dim + (bright - dim) * weight;
            ((dark + signal) * gain).clamp(0.0, full_scale)
        })
    }
}

#[async_trait]
impl Device for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> DriverResult<()> {
        if self.state.current().is_attached() {
            return Ok(());
        }
        self.state.transition(DeviceState::Connecting)?;
        if self.settings.connect_delay_ms > 0 {
            sleep(Duration::from_millis(self.settings.connect_delay_ms)).await;
        }
        if let Err(err) = self.faults.check("connect") {
            self.state.transition(DeviceState::Error)?;
            return Err(err);
        }
        self.state.transition(DeviceState::Connected)?;
        Ok(())
    }

    async fn disconnect(&self) -> DriverResult<()> {
        self.state.transition(DeviceState::Disconnected)?;
        Ok(())
    }

    fn state(&self) -> DeviceState {
        self.state.current()
    }

    fn subscribe_state(&self) -> watch::Receiver<DeviceState> {
        self.state.subscribe()
    }
}

#[async_trait]
impl CameraControl for MockCamera {
    async fn set_exposure_ms(&self, exposure_ms: f64) -> DriverResult<()> {
        if !exposure_ms.is_finite() || exposure_ms <= 0.0 {
            return Err(DriverError::new(
                &self.name,
                DriverErrorKind::InvalidParameter,
                format!("exposure must be positive, got {}", exposure_ms),
            ));
        }
        self.params.write().exposure_ms = exposure_ms;
        Ok(())
    }

    async fn exposure_ms(&self) -> DriverResult<f64> {
        Ok(self.params.read().exposure_ms)
    }

    async fn set_binning(&self, binning: Binning) -> DriverResult<()> {
        self.params.write().binning = binning;
        Ok(())
    }

    async fn binning(&self) -> DriverResult<Binning> {
        Ok(self.params.read().binning)
    }

    async fn set_binning_mode(&self, mode: BinningMode) -> DriverResult<()> {
        self.params.write().binning_mode = mode;
        Ok(())
    }

    async fn binning_mode(&self) -> DriverResult<BinningMode> {
        Ok(self.params.read().binning_mode)
    }

    async fn set_pixel_format(&self, format: PixelFormat) -> DriverResult<()> {
        self.params.write().pixel_format = format;
        Ok(())
    }

    async fn pixel_format(&self) -> DriverResult<PixelFormat> {
        Ok(self.params.read().pixel_format)
    }

    async fn capture(&self) -> DriverResult<Arc<Frame>> {
        self.check_ready()?;
        self.faults.check("capture")?;

        let focus_position = match &self.focus {
            Some(axis) => Some(axis.position().await?),
            None => None,
        };
        let params = *self.params.read();
        if self.settings.readout_ms > 0 {
            sleep(Duration::from_millis(self.settings.readout_ms)).await;
        }

        let data = self.render(params, self.blur_sigma(focus_position));
        let frame_number = self.frame_count.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = Arc::new(Frame {
            frame_number,
            exposure_ms: params.exposure_ms,
            binning: params.binning,
            pixel_format: params.pixel_format,
            data,
        });

        // Broadcast (ignore errors if no receivers)
        let _ = self.gray_tx.send(frame.mean_level().round() as u32);
        let _ = self.frame_tx.send(Arc::clone(&frame));
        tracing::trace!(camera = %self.name, frame_number, "mock frame captured");
        Ok(frame)
    }

    fn resolution(&self) -> (usize, usize) {
        (self.settings.width, self.settings.height)
    }

    fn pixel_size_um(&self) -> f64 {
        self.settings.pixel_size_um
    }

    fn subscribe_frames(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.frame_tx.subscribe()
    }

    fn subscribe_gray_level(&self) -> broadcast::Receiver<u32> {
        self.gray_tx.subscribe()
    }
}

/// Factory registered as the `"mock"` camera driver.
pub struct MockCameraFactory;

impl CameraFactory for MockCameraFactory {
    fn driver_type(&self) -> &'static str {
        "mock"
    }

    fn validate(&self, config: &CameraConfig) -> AppResult<()> {
        let settings: MockCameraSettings = parse_settings(&config.name, &config.settings)?;
        if settings.width == 0 || settings.height == 0 {
            return Err(ColorimeterError::config(format!(
                "camera '{}': resolution must be non-zero",
                config.name
            )));
        }
        if settings.pixel_size_um <= 0.0 {
            return Err(ColorimeterError::config(format!(
                "camera '{}': pixel_size_um must be positive",
                config.name
            )));
        }
        Ok(())
    }

    fn build(
        &self,
        config: &CameraConfig,
        axes: &BTreeMap<String, Arc<dyn AxisControl>>,
    ) -> AppResult<Arc<dyn CameraControl>> {
        let settings: MockCameraSettings = parse_settings(&config.name, &config.settings)?;
        let focus = match &settings.focus_axis {
            Some(key) => Some(axes.get(key).cloned().ok_or_else(|| {
                ColorimeterError::config(format!(
                    "camera '{}': focus_axis '{}' is not a configured motion",
                    config.name, key
                ))
            })?),
            None => None,
        };
        Ok(Arc::new(MockCamera::new(&config.name, settings, focus)))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_axis(name: &str) -> MockAxis {
        MockAxis::new(
            name,
            MockAxisSettings {
                speed: 1000.0,
                ..Default::default()
            },
        )
    }

    async fn settle(axis: &MockAxis) {
        while axis.is_moving() {
            sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_axis_requires_connection() {
        let axis = fast_axis("focus");
        let err = axis.move_abs(1.0).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_axis_absolute_and_relative_moves() {
        let axis = fast_axis("focus");
        axis.connect().await.unwrap();

        axis.move_abs(10.0).await.unwrap();
        assert!(axis.is_moving());
        assert_eq!(axis.state(), DeviceState::Moving);
        settle(&axis).await;
        assert_eq!(axis.position().await.unwrap(), 10.0);
        assert_eq!(axis.state(), DeviceState::Stationary);

        axis.move_rel(-3.0).await.unwrap();
        settle(&axis).await;
        assert_eq!(axis.position().await.unwrap(), 7.0);
    }

    #[tokio::test]
    async fn test_axis_moves_run_in_issue_order() {
        let axis = fast_axis("focus");
        axis.connect().await.unwrap();

        axis.move_abs(5.0).await.unwrap();
        axis.move_rel(1.0).await.unwrap();
        axis.move_rel(1.0).await.unwrap();
        settle(&axis).await;
        assert_eq!(axis.position().await.unwrap(), 7.0);
    }

    #[tokio::test]
    async fn test_axis_stop_interrupts_motion() {
        let axis = MockAxis::new(
            "slow",
            MockAxisSettings {
                speed: 10.0,
                ..Default::default()
            },
        );
        axis.connect().await.unwrap();
        axis.move_abs(100.0).await.unwrap();
        sleep(Duration::from_millis(30)).await;

        axis.stop().await.unwrap();
        axis.stop().await.unwrap();
        settle(&axis).await;
        let position = axis.position().await.unwrap();
        assert!(position > 0.0 && position < 100.0, "position {}", position);
    }

    #[tokio::test]
    async fn test_axis_alarm_and_reset() {
        let axis = MockAxis::new(
            "nd",
            MockAxisSettings {
                fault: FaultScenario::Alarm,
                ..Default::default()
            },
        );
        axis.connect().await.unwrap();
        axis.move_abs(1.0).await.unwrap();
        settle(&axis).await;
        assert_eq!(axis.state(), DeviceState::Alarm);

        let err = axis.move_abs(2.0).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Alarm);

        axis.stop().await.unwrap();
        assert_eq!(axis.state(), DeviceState::Connected);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_error_state() {
        let axis = MockAxis::new(
            "ipd",
            MockAxisSettings {
                fault: FaultScenario::ConnectFailure,
                ..Default::default()
            },
        );
        let err = axis.connect().await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Connection);
        assert_eq!(axis.state(), DeviceState::Error);
        axis.disconnect().await.unwrap();
        assert!(!axis.is_connected());
    }

    #[tokio::test]
    async fn test_filter_wheel_channels() {
        let wheel = MockFilterWheel::new(
            "xyz",
            vec![FilterChannel::X, FilterChannel::Y, FilterChannel::Z],
            MockWheelSettings {
                slots_per_second: 0.0,
                ..Default::default()
            },
        );
        wheel.connect().await.unwrap();
        assert_eq!(wheel.channel().await.unwrap(), FilterChannel::X);

        wheel.move_to_channel(FilterChannel::Z).await.unwrap();
        while wheel.is_moving() {
            sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(wheel.channel().await.unwrap(), FilterChannel::Z);

        let err = wheel.move_to_channel(FilterChannel::ND4).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::InvalidParameter);
    }

    #[tokio::test]
    async fn test_rx_wheel_named_slots() {
        let wheel = MockRxFilterWheel::new(
            "rx",
            vec!["0d".into(), "-0.5d".into(), "-1d".into()],
            MockWheelSettings::default(),
        );
        wheel.connect().await.unwrap();
        wheel.move_to_named("-1d").await.unwrap();
        while wheel.is_moving() {
            sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(wheel.channel_name().await.unwrap(), "-1d");
        assert!(wheel.move_to_named("-3d").await.is_err());
    }

    #[tokio::test]
    async fn test_camera_exposure_scales_signal() {
        let camera = MockCamera::new(
            "camera",
            MockCameraSettings {
                scene: SceneKind::Uniform,
                dark_level: 0.0,
                readout_ms: 0,
                ..Default::default()
            },
            None,
        );
        camera.connect().await.unwrap();
        let mut gray = camera.subscribe_gray_level();

        camera.set_exposure_ms(10.0).await.unwrap();
        let first = camera.capture().await.unwrap();
        camera.set_exposure_ms(20.0).await.unwrap();
        let second = camera.capture().await.unwrap();

        assert_eq!(first.mean_level(), 200.0);
        assert_eq!(second.mean_level(), 400.0);
        assert_eq!(second.frame_number, 2);
        assert_eq!(gray.recv().await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_camera_binning_shrinks_frame() {
        let camera = MockCamera::new("camera", MockCameraSettings::default(), None);
        camera.connect().await.unwrap();
        camera.set_binning(Binning::TwoByTwo).await.unwrap();
        let frame = camera.capture().await.unwrap();
        assert_eq!((frame.width(), frame.height()), (32, 32));
    }

    #[tokio::test]
    async fn test_camera_defocus_reduces_contrast() {
        let axis: Arc<dyn AxisControl> = Arc::new(fast_axis("focus"));
        axis.connect().await.unwrap();
        let camera = MockCamera::new(
            "camera",
            MockCameraSettings {
                focus_axis: Some("focus".into()),
                best_focus: 0.0,
                readout_ms: 0,
                ..Default::default()
            },
            Some(Arc::clone(&axis)),
        );
        camera.connect().await.unwrap();

        let sharp = camera.capture().await.unwrap();
        axis.move_abs(2.0).await.unwrap();
        while axis.is_moving() {
            sleep(Duration::from_millis(1)).await;
        }
        let blurred = camera.capture().await.unwrap();

        let spread = |frame: &Frame| frame.data.std(0.0);
        assert!(spread(&sharp) > spread(&blurred));
    }

    #[tokio::test]
    async fn test_camera_fail_after_captures() {
        let camera = MockCamera::new(
            "camera",
            MockCameraSettings {
                readout_ms: 0,
                fault: FaultScenario::FailAfter {
                    operation: "capture".into(),
                    count: 1,
                },
                ..Default::default()
            },
            None,
        );
        camera.connect().await.unwrap();
        assert!(camera.capture().await.is_ok());
        let err = camera.capture().await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Hardware);
    }

    #[test]
    fn test_fault_scenario_from_toml() {
        let settings: MockAxisSettings = toml::from_str("fault = \"alarm\"").unwrap();
        assert_eq!(settings.fault, FaultScenario::Alarm);

        let settings: MockCameraSettings =
            toml::from_str("fault = { fail_after = { operation = \"capture\", count = 3 } }")
                .unwrap();
        assert_eq!(
            settings.fault,
            FaultScenario::FailAfter {
                operation: "capture".into(),
                count: 3
            }
        );
    }
}
