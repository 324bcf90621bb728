//! Single-module orchestration.
//!
//! A [`ModuleManager`] owns one camera, the module's motion axes, its ND/XYZ
//! filter wheels and the optional RX wheel with its rotation axis. Devices are
//! built from a [`ModuleConfig`] through the [`DriverRegistry`] and used only
//! through their capability traits.
//!
//! ## Sync and async motion
//!
//! Every motion has two forms:
//! - `*_sync` issues the move and waits until the involved devices settled,
//!   bounded by the configured timeout.
//! - `*_async` returns once the move is issued. If a completion sender is
//!   given, a background task reports a [`MoveCompletion`] when the devices
//!   settled (or failed).
//!
//! `stop_module_movement` / `stop_motion_movement` bump a stop generation;
//! every sync wait started before the bump ends with `UserStop`.

use crate::calibration::store::{write_through_focus_csv, CalibrationStore};
use crate::calibration::CalibrationAlgorithms;
use crate::config::{ModuleConfig, ThroughFocusConfig};
use crate::error::{AppResult, ColorimeterError, OperationResult};
use crate::focus::engine::{FocusPeak, FocusBench, ThroughFocusCurves, ThroughFocusEngine};
use crate::focus::mapping::{diopters_to_vid, FocusCurve};
use crate::focus::metric::{cycles_per_pixel, MtfMetric};
use crate::hardware::capabilities::{
    AxisControl, CameraControl, Device, FilterWheelControl, RxFilterWheelControl,
};
use crate::hardware::error::{DriverError, DriverResult};
use crate::hardware::registry::DriverRegistry;
use crate::hardware::state::DeviceState;
use crate::module::rx::{cylinder_slot_name, RxMappingRule};
use crate::types::{
    Binning, BinningMode, CaptureData, ExposureMode, ExposureSetting, EyeMode, FilterChannel,
    FocusMethod, Image, ModuleIdentity, PixelFormat, RxCombination,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Poll period of motion waits.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Completion report of an async motion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveCompletion {
    /// Module that issued the move.
    pub module_id: i32,
    /// Device key (or `"module"` for multi-device moves).
    pub device: String,
    /// State of the first involved device when the wait ended.
    pub state: DeviceState,
    /// Outcome of the wait.
    pub result: OperationResult,
}

/// Sender half used to receive [`MoveCompletion`]s.
pub type CompletionSender = mpsc::UnboundedSender<MoveCompletion>;

// =============================================================================
// Device handles
// =============================================================================

#[derive(Clone)]
enum DeviceHandle {
    Camera(Arc<dyn CameraControl>),
    Axis(Arc<dyn AxisControl>),
    Wheel(Arc<dyn FilterWheelControl>),
    Rx(Arc<dyn RxFilterWheelControl>),
}

impl DeviceHandle {
    fn name(&self) -> &str {
        match self {
            DeviceHandle::Camera(device) => device.name(),
            DeviceHandle::Axis(device) => device.name(),
            DeviceHandle::Wheel(device) => device.name(),
            DeviceHandle::Rx(device) => device.name(),
        }
    }

    fn state(&self) -> DeviceState {
        match self {
            DeviceHandle::Camera(device) => device.state(),
            DeviceHandle::Axis(device) => device.state(),
            DeviceHandle::Wheel(device) => device.state(),
            DeviceHandle::Rx(device) => device.state(),
        }
    }

    fn is_moving(&self) -> bool {
        match self {
            DeviceHandle::Camera(_) => false,
            DeviceHandle::Axis(device) => device.is_moving(),
            DeviceHandle::Wheel(device) => device.is_moving(),
            DeviceHandle::Rx(device) => device.is_moving(),
        }
    }

    async fn connect(&self) -> DriverResult<()> {
        match self {
            DeviceHandle::Camera(device) => device.connect().await,
            DeviceHandle::Axis(device) => device.connect().await,
            DeviceHandle::Wheel(device) => device.connect().await,
            DeviceHandle::Rx(device) => device.connect().await,
        }
    }

    async fn disconnect(&self) -> DriverResult<()> {
        match self {
            DeviceHandle::Camera(device) => device.disconnect().await,
            DeviceHandle::Axis(device) => device.disconnect().await,
            DeviceHandle::Wheel(device) => device.disconnect().await,
            DeviceHandle::Rx(device) => device.disconnect().await,
        }
    }

    async fn stop(&self) -> DriverResult<()> {
        match self {
            DeviceHandle::Camera(_) => Ok(()),
            DeviceHandle::Axis(device) => device.stop().await,
            DeviceHandle::Wheel(device) => device.stop().await,
            DeviceHandle::Rx(device) => device.stop().await,
        }
    }
}

/// Wait until none of `devices` is moving.
///
/// Fails with the device fault if one of them enters a fault state, with
/// `UserStop` if `stop_generation` moved past `generation`, and with
/// `Timeout` once `timeout_ms` elapsed.
async fn wait_until_idle(
    devices: &[DeviceHandle],
    operation: &str,
    timeout_ms: u64,
    stop_generation: &AtomicU64,
    generation: u64,
) -> AppResult<()> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if stop_generation.load(Ordering::SeqCst) != generation {
            return Err(ColorimeterError::UserStop(format!("{} stopped", operation)));
        }
        // Sample motion before state: a finished move has already left Moving.
        let moving = devices.iter().any(DeviceHandle::is_moving);
        if let Some(fault) = devices
            .iter()
            .find_map(|device| device.state().fault_error(device.name()))
        {
            return Err(fault.into());
        }
        if !moving {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(ColorimeterError::Timeout {
                operation: operation.to_string(),
                timeout_ms,
            });
        }
        sleep(POLL_INTERVAL.min(deadline - now)).await;
    }
}

struct RxAssembly {
    wheel: Arc<dyn RxFilterWheelControl>,
    axis: Arc<dyn AxisControl>,
    mapping: RxMappingRule,
    timeout_ms: u64,
}

struct ModuleSettings {
    aperture: String,
    light_source: String,
    spherical: f64,
    rx: RxCombination,
    exposure: ExposureSetting,
}

// =============================================================================
// ModuleManager
// =============================================================================

/// Orchestrates the devices of one colorimeter module.
pub struct ModuleManager {
    identity: ModuleIdentity,
    config: ModuleConfig,
    camera: Arc<dyn CameraControl>,
    motions: BTreeMap<String, Arc<dyn AxisControl>>,
    filter_wheels: BTreeMap<String, (Arc<dyn FilterWheelControl>, u64)>,
    rx: Option<RxAssembly>,
    stop_generation: Arc<AtomicU64>,
    settings: RwLock<ModuleSettings>,
    last_capture: RwLock<Option<CaptureData>>,
    color_captures: RwLock<BTreeMap<FilterChannel, CaptureData>>,
    focus_curves: RwLock<ThroughFocusCurves>,
    last_focus: RwLock<Option<FocusPeak>>,
    calibration: Arc<CalibrationAlgorithms>,
}

impl ModuleManager {
    /// Build every enabled device of `config`. Nothing is connected yet.
    pub fn new(
        config: ModuleConfig,
        registry: &DriverRegistry,
        store: Arc<dyn CalibrationStore>,
    ) -> AppResult<Self> {
        config.validate()?;

        let mut motions = BTreeMap::new();
        for motion in config.motions.iter().filter(|motion| motion.enabled) {
            motions.insert(motion.key.clone(), registry.create_axis(motion)?);
        }
        let camera = registry.create_camera(&config.camera, &motions)?;

        let mut filter_wheels = BTreeMap::new();
        for wheel in config.filter_wheels.iter().filter(|wheel| wheel.enabled) {
            filter_wheels.insert(
                wheel.key.clone(),
                (registry.create_filter_wheel(wheel)?, wheel.wait_timeout_ms),
            );
        }

        let rx = match &config.rx_filter_wheel {
            Some(rx) => Some(RxAssembly {
                wheel: registry.create_rx_filter_wheel(rx)?,
                axis: registry.create_axis(&rx.axis)?,
                mapping: rx.mapping.clone(),
                timeout_ms: rx.wait_timeout_ms,
            }),
            None => None,
        };

        let identity = ModuleIdentity {
            id: config.id,
            serial_number: config.serial_number.clone(),
            name: config.name.clone(),
            key: config.key.clone(),
            eye_mode: config.eye_mode,
        };
        let calibration = Arc::new(CalibrationAlgorithms::new(config.key.clone(), store));
        let settings = ModuleSettings {
            aperture: "3mm".to_string(),
            light_source: String::new(),
            spherical: RxCombination::UNSET.sphere,
            rx: RxCombination::UNSET,
            exposure: ExposureSetting::fixed(100.0),
        };

        debug!(
            module_id = identity.id,
            motions = motions.len(),
            filter_wheels = filter_wheels.len(),
            rx = rx.is_some(),
            "module built"
        );

        Ok(Self {
            identity,
            config,
            camera,
            motions,
            filter_wheels,
            rx,
            stop_generation: Arc::new(AtomicU64::new(0)),
            settings: RwLock::new(settings),
            last_capture: RwLock::new(None),
            color_captures: RwLock::new(BTreeMap::new()),
            focus_curves: RwLock::new(ThroughFocusCurves::default()),
            last_focus: RwLock::new(None),
            calibration,
        })
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// Identity fields of this module.
    pub fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    /// Module id.
    pub fn id(&self) -> i32 {
        self.identity.id
    }

    /// Serial number.
    pub fn serial_number(&self) -> &str {
        &self.identity.serial_number
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Config key; also names the output directory.
    pub fn key(&self) -> &str {
        &self.identity.key
    }

    /// Eye this module represents.
    pub fn eye_mode(&self) -> EyeMode {
        self.identity.eye_mode
    }

    /// Configuration the module was built from.
    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// Calibration state of this module.
    pub fn calibration(&self) -> Arc<CalibrationAlgorithms> {
        Arc::clone(&self.calibration)
    }

    /// The module camera.
    pub fn camera(&self) -> Arc<dyn CameraControl> {
        Arc::clone(&self.camera)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    fn devices(&self) -> Vec<DeviceHandle> {
        let mut devices: Vec<DeviceHandle> = self
            .motions
            .values()
            .map(|axis| DeviceHandle::Axis(Arc::clone(axis)))
            .collect();
        devices.extend(
            self.filter_wheels
                .values()
                .map(|(wheel, _)| DeviceHandle::Wheel(Arc::clone(wheel))),
        );
        if let Some(rx) = &self.rx {
            devices.push(DeviceHandle::Rx(Arc::clone(&rx.wheel)));
            devices.push(DeviceHandle::Axis(Arc::clone(&rx.axis)));
        }
        devices.push(DeviceHandle::Camera(Arc::clone(&self.camera)));
        devices
    }

    /// Connect every device; on failure the already connected ones are
    /// disconnected again and the failure is returned.
    #[instrument(skip(self), fields(module_id = self.identity.id, key = %self.identity.key))]
    pub async fn connect_module(&self) -> AppResult<()> {
        let mut connected: Vec<DeviceHandle> = Vec::new();
        for device in self.devices() {
            match device.connect().await {
                Ok(()) => connected.push(device),
                Err(err) => {
                    error!(device = device.name(), error = %err, "connect failed, rolling back");
                    for done in connected.iter().rev() {
                        if let Err(rollback) = done.disconnect().await {
                            warn!(device = done.name(), error = %rollback, "rollback disconnect failed");
                        }
                    }
                    if let Err(reset) = device.disconnect().await {
                        warn!(device = device.name(), error = %reset, "could not reset failed device");
                    }
                    return Err(err.into());
                }
            }
        }
        info!("module connected");
        Ok(())
    }

    /// Disconnect every device; returns the first failure after trying all.
    #[instrument(skip(self), fields(module_id = self.identity.id, key = %self.identity.key))]
    pub async fn disconnect_module(&self) -> AppResult<()> {
        self.stop_generation.fetch_add(1, Ordering::SeqCst);
        let mut first_error: Option<DriverError> = None;
        for device in self.devices() {
            if let Err(err) = device.disconnect().await {
                warn!(device = device.name(), error = %err, "disconnect failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => {
                info!("module disconnected");
                Ok(())
            }
        }
    }

    /// True when every device is connected.
    pub fn is_module_connected(&self) -> bool {
        self.devices()
            .iter()
            .all(|device| device.state().is_connected())
    }

    /// True while any axis or wheel is moving.
    pub fn is_module_motors_moving(&self) -> bool {
        self.devices().iter().any(DeviceHandle::is_moving)
    }

    /// Wait until every motor of the module settled.
    pub async fn wait_for_moving_stop(&self, timeout_ms: u64) -> AppResult<()> {
        let generation = self.stop_generation.load(Ordering::SeqCst);
        wait_until_idle(
            &self.devices(),
            "wait_for_moving_stop",
            timeout_ms,
            &self.stop_generation,
            generation,
        )
        .await
    }

    /// Halt every motor. Pending sync waits end with `UserStop`.
    #[instrument(skip(self), fields(module_id = self.identity.id, key = %self.identity.key))]
    pub async fn stop_module_movement(&self) -> AppResult<()> {
        self.stop_generation.fetch_add(1, Ordering::SeqCst);
        let mut first_error: Option<DriverError> = None;
        for device in self.devices() {
            if let Err(err) = device.stop().await {
                warn!(device = device.name(), error = %err, "stop failed");
                first_error.get_or_insert(err);
            }
        }
        info!("module movement stopped");
        first_error.map_or(Ok(()), |err| Err(err.into()))
    }

    /// Halt one axis. Pending sync waits end with `UserStop`.
    pub async fn stop_motion_movement(&self, key: &str) -> AppResult<()> {
        let axis = self.motion(key)?;
        self.stop_generation.fetch_add(1, Ordering::SeqCst);
        axis.stop().await?;
        info!(module_id = self.identity.id, key, "motion stopped");
        Ok(())
    }

    async fn settle(
        &self,
        devices: &[DeviceHandle],
        operation: &str,
        timeout_ms: u64,
        generation: u64,
    ) -> AppResult<()> {
        wait_until_idle(devices, operation, timeout_ms, &self.stop_generation, generation).await
    }

    fn notify_when_settled(
        &self,
        devices: Vec<DeviceHandle>,
        device: String,
        timeout_ms: u64,
        notify: Option<CompletionSender>,
    ) {
        let Some(tx) = notify else {
            return;
        };
        let module_id = self.identity.id;
        let stop_generation = Arc::clone(&self.stop_generation);
        let generation = stop_generation.load(Ordering::SeqCst);
        tokio::spawn(async move {
            let result =
                wait_until_idle(&devices, &device, timeout_ms, &stop_generation, generation).await;
            let state = devices
                .first()
                .map(DeviceHandle::state)
                .unwrap_or_default();
            let completion = MoveCompletion {
                module_id,
                device,
                state,
                result: OperationResult::from(&result),
            };
            // Receiver may be gone
            let _ = tx.send(completion);
        });
    }

    // =========================================================================
    // Axes
    // =========================================================================

    fn motion(&self, key: &str) -> AppResult<Arc<dyn AxisControl>> {
        self.motions.get(key).cloned().ok_or_else(|| {
            ColorimeterError::NotFound(format!(
                "module {}: no motion '{}'",
                self.identity.id, key
            ))
        })
    }

    /// Current position of axis `key`.
    pub async fn motion_position(&self, key: &str) -> AppResult<f64> {
        Ok(self.motion(key)?.position().await?)
    }

    /// Issue an absolute move of axis `key`.
    pub async fn set_position_abs_async(
        &self,
        key: &str,
        position: f64,
        notify: Option<CompletionSender>,
    ) -> AppResult<()> {
        let axis = self.motion(key)?;
        axis.move_abs(position).await?;
        debug!(module_id = self.identity.id, key, position, "absolute move issued");
        self.notify_when_settled(
            vec![DeviceHandle::Axis(axis)],
            key.to_string(),
            self.config.wait_timeout_ms,
            notify,
        );
        Ok(())
    }

    /// Move axis `key` to `position` and wait.
    pub async fn set_position_abs_sync(&self, key: &str, position: f64) -> AppResult<()> {
        let generation = self.stop_generation.load(Ordering::SeqCst);
        let axis = self.motion(key)?;
        axis.move_abs(position).await?;
        self.settle(&[DeviceHandle::Axis(axis)], key, self.config.wait_timeout_ms, generation)
            .await
    }

    /// Issue a relative move of axis `key`.
    pub async fn set_position_rel_async(
        &self,
        key: &str,
        delta: f64,
        notify: Option<CompletionSender>,
    ) -> AppResult<()> {
        let axis = self.motion(key)?;
        axis.move_rel(delta).await?;
        debug!(module_id = self.identity.id, key, delta, "relative move issued");
        self.notify_when_settled(
            vec![DeviceHandle::Axis(axis)],
            key.to_string(),
            self.config.wait_timeout_ms,
            notify,
        );
        Ok(())
    }

    /// Move axis `key` by `delta` and wait.
    pub async fn set_position_rel_sync(&self, key: &str, delta: f64) -> AppResult<()> {
        let generation = self.stop_generation.load(Ordering::SeqCst);
        let axis = self.motion(key)?;
        axis.move_rel(delta).await?;
        self.settle(&[DeviceHandle::Axis(axis)], key, self.config.wait_timeout_ms, generation)
            .await
    }

    // =========================================================================
    // Filter wheels
    // =========================================================================

    fn filter_wheel(&self, key: &str) -> AppResult<(Arc<dyn FilterWheelControl>, u64)> {
        self.filter_wheels
            .get(key)
            .map(|(wheel, timeout)| (Arc::clone(wheel), *timeout))
            .ok_or_else(|| {
                ColorimeterError::NotFound(format!(
                    "module {}: no filter wheel '{}'",
                    self.identity.id, key
                ))
            })
    }

    fn rx_assembly(&self) -> AppResult<&RxAssembly> {
        self.rx.as_ref().ok_or_else(|| {
            ColorimeterError::NotFound(format!("module {}: no RX filter wheel", self.identity.id))
        })
    }

    /// Issue a move of wheel `key` to `channel`.
    pub async fn move_nd_xyz_filter_by_enum_async(
        &self,
        key: &str,
        channel: FilterChannel,
        notify: Option<CompletionSender>,
    ) -> AppResult<()> {
        let (wheel, timeout_ms) = self.filter_wheel(key)?;
        wheel.move_to_channel(channel).await?;
        debug!(module_id = self.identity.id, key, %channel, "filter move issued");
        self.notify_when_settled(vec![DeviceHandle::Wheel(wheel)], key.to_string(), timeout_ms, notify);
        Ok(())
    }

    /// Move wheel `key` to `channel` and wait.
    pub async fn move_nd_xyz_filter_by_enum_sync(
        &self,
        key: &str,
        channel: FilterChannel,
    ) -> AppResult<()> {
        let generation = self.stop_generation.load(Ordering::SeqCst);
        let (wheel, timeout_ms) = self.filter_wheel(key)?;
        wheel.move_to_channel(channel).await?;
        self.settle(&[DeviceHandle::Wheel(wheel)], key, timeout_ms, generation)
            .await
    }

    /// Channel currently in the beam on wheel `key`.
    pub async fn nd_xyz_filter_channel(&self, key: &str) -> AppResult<FilterChannel> {
        let (wheel, _) = self.filter_wheel(key)?;
        Ok(wheel.channel().await?)
    }

    /// Move the RX wheel to slot `name` and its axis to `degree`.
    pub async fn move_rx_filter_by_name_async(
        &self,
        name: &str,
        degree: f64,
        notify: Option<CompletionSender>,
    ) -> AppResult<()> {
        let rx = self.rx_assembly()?;
        rx.wheel.move_to_named(name).await?;
        rx.axis.move_abs(degree).await?;
        self.notify_when_settled(
            vec![
                DeviceHandle::Rx(Arc::clone(&rx.wheel)),
                DeviceHandle::Axis(Arc::clone(&rx.axis)),
            ],
            rx.wheel.name().to_string(),
            rx.timeout_ms,
            notify,
        );
        Ok(())
    }

    /// Move the RX wheel and its axis and wait.
    pub async fn move_rx_filter_by_name_sync(&self, name: &str, degree: f64) -> AppResult<()> {
        let generation = self.stop_generation.load(Ordering::SeqCst);
        let rx = self.rx_assembly()?;
        rx.wheel.move_to_named(name).await?;
        rx.axis.move_abs(degree).await?;
        let devices = [
            DeviceHandle::Rx(Arc::clone(&rx.wheel)),
            DeviceHandle::Axis(Arc::clone(&rx.axis)),
        ];
        self.settle(&devices, "rx filter", rx.timeout_ms, generation)
            .await
    }

    /// Slot name currently in the beam on the RX wheel.
    pub async fn rx_filter_channel(&self) -> AppResult<String> {
        Ok(self.rx_assembly()?.wheel.channel_name().await?)
    }

    /// RX axis angle (degrees).
    pub async fn rx_filter_axis(&self) -> AppResult<f64> {
        Ok(self.rx_assembly()?.axis.position().await?)
    }

    // =========================================================================
    // Focus
    // =========================================================================

    fn focus_axis(&self, key: Option<&str>) -> AppResult<(String, Arc<dyn AxisControl>, FocusCurve)> {
        let key = match key {
            Some(key) => key.to_string(),
            None => self.config.focus_axis.clone().ok_or_else(|| {
                ColorimeterError::config(format!("module {}: no focus axis configured", self.identity.id))
            })?,
        };
        let curve = self
            .config
            .motion(&key)
            .and_then(|motion| motion.focus_curve)
            .ok_or_else(|| {
                ColorimeterError::config(format!(
                    "module {}: motion '{}' has no focus curve",
                    self.identity.id, key
                ))
            })?;
        let axis = self.motion(&key)?;
        Ok((key, axis, curve))
    }

    fn curve_with(curve: FocusCurve, method: FocusMethod) -> FocusCurve {
        FocusCurve { method, ..curve }
    }

    /// Issue a focus move to `vid` (mm).
    pub async fn set_focus_async(
        &self,
        vid: f64,
        method: FocusMethod,
        notify: Option<CompletionSender>,
    ) -> AppResult<()> {
        let (key, axis, curve) = self.focus_axis(None)?;
        let position = Self::curve_with(curve, method).position_for_vid(vid)?;
        axis.move_abs(position).await?;
        debug!(module_id = self.identity.id, vid, position, "focus move issued");
        self.notify_when_settled(vec![DeviceHandle::Axis(axis)], key, self.config.wait_timeout_ms, notify);
        Ok(())
    }

    /// Move focus to `vid` (mm) and wait.
    pub async fn set_focus_sync(&self, vid: f64, method: FocusMethod) -> AppResult<()> {
        let generation = self.stop_generation.load(Ordering::SeqCst);
        let (key, axis, curve) = self.focus_axis(None)?;
        let position = Self::curve_with(curve, method).position_for_vid(vid)?;
        axis.move_abs(position).await?;
        self.settle(&[DeviceHandle::Axis(axis)], &key, self.config.wait_timeout_ms, generation)
            .await
    }

    /// VID (mm) imaged at the current focus position.
    pub async fn vid(&self, method: FocusMethod) -> AppResult<f64> {
        let (_, axis, curve) = self.focus_axis(None)?;
        let position = axis.position().await?;
        Ok(Self::curve_with(curve, method).vid_for_position(position))
    }

    /// Coarse + fine through-focus on axis `key`. The axis is parked at the
    /// best focus; curves are kept also when the search fails.
    #[instrument(skip(self, config), fields(module_id = self.identity.id))]
    pub async fn through_focus(&self, key: &str, config: &ThroughFocusConfig) -> AppResult<FocusPeak> {
        let (key, axis, curve) = self.focus_axis(Some(key))?;
        let binning = self.camera.binning().await?;
        let metric = MtfMetric::new(
            cycles_per_pixel(
                config.freq,
                config.lpmm_unit,
                config.pixel_size_um,
                binning.factor(),
                curve.focal_length_mm,
            ),
            config.chess_mode,
        );
        let bench = ManagerBench {
            manager: self,
            key,
            axis,
            curve,
            timeout_ms: config.move_timeout_ms,
            generation: self.stop_generation.load(Ordering::SeqCst),
        };
        let run = ThroughFocusEngine::new(config.clone(), metric).run(&bench).await;
        *self.focus_curves.write() = run.curves;
        match &run.outcome {
            Ok(peak) => {
                *self.last_focus.write() = Some(peak.clone());
                if let Some(reason) = &peak.degraded {
                    warn!(reason = %reason, "through focus degraded");
                }
            }
            Err(err) => warn!(error = %err, "through focus failed"),
        }
        run.outcome
    }

    /// Result of the last successful through-focus.
    pub fn focus_peak(&self) -> Option<FocusPeak> {
        self.last_focus.read().clone()
    }

    /// Curves of the last through-focus.
    pub fn through_focus_curves(&self) -> ThroughFocusCurves {
        self.focus_curves.read().clone()
    }

    /// Fine-phase VIDs of the last search.
    pub fn vid_curve(&self) -> Vec<f64> {
        self.focus_curves.read().vid.clone()
    }

    /// Fine-phase MTF scores of the last search.
    pub fn mtf_curve(&self) -> Vec<f64> {
        self.focus_curves.read().mtf.clone()
    }

    /// Fine-phase axis positions of the last search.
    pub fn motion_curve(&self) -> Vec<f64> {
        self.focus_curves.read().motion.clone()
    }

    /// Coarse-phase proxy scores of the last search.
    pub fn rough_std_curve(&self) -> Vec<f64> {
        self.focus_curves.read().rough_std.clone()
    }

    /// Coarse-phase VIDs of the last search.
    pub fn rough_vid_curve(&self) -> Vec<f64> {
        self.focus_curves.read().rough_vid.clone()
    }

    /// Coarse-phase axis positions of the last search.
    pub fn rough_motion_curve(&self) -> Vec<f64> {
        self.focus_curves.read().rough_motion.clone()
    }

    /// Write the last through-focus curves to a CSV file.
    pub fn save_through_focus_result(&self, path: &Path) -> AppResult<()> {
        let metadata = serde_json::json!({
            "module_id": self.identity.id,
            "serial_number": self.identity.serial_number,
            "key": self.identity.key,
            "peak": self.focus_peak(),
        });
        write_through_focus_csv(path, &metadata, &self.through_focus_curves())
    }

    // =========================================================================
    // Spherical / RX
    // =========================================================================

    /// Focus to the VID of `sphere` diopters.
    pub async fn set_spherical_async(
        &self,
        sphere: f64,
        notify: Option<CompletionSender>,
    ) -> AppResult<()> {
        self.set_focus_async(diopters_to_vid(sphere), FocusMethod::Inverse, notify)
            .await?;
        self.settings.write().spherical = sphere;
        Ok(())
    }

    /// Focus to the VID of `sphere` diopters and wait.
    pub async fn set_spherical_sync(&self, sphere: f64) -> AppResult<()> {
        self.set_focus_sync(diopters_to_vid(sphere), FocusMethod::Inverse)
            .await?;
        self.settings.write().spherical = sphere;
        Ok(())
    }

    /// Last requested spherical power; `f64::MAX` when never set.
    pub fn spherical(&self) -> f64 {
        self.settings.read().spherical
    }

    /// Issue the motions realising `rx`; returns the devices involved.
    async fn issue_rx(&self, rx: RxCombination) -> AppResult<(Vec<DeviceHandle>, u64, RxCombination)> {
        let unset = RxCombination::UNSET;
        let mapping = self
            .rx
            .as_ref()
            .map(|rx| rx.mapping.clone())
            .unwrap_or_default();
        let mapped = mapping.map(rx);

        // Resolve every target before moving anything.
        let focus = if mapped.sphere != unset.sphere {
            let (_, axis, curve) = self.focus_axis(None)?;
            Some((axis, curve.position_for_vid(diopters_to_vid(mapped.sphere))?))
        } else {
            None
        };
        let needs_rx = mapped.cylinder != unset.cylinder || mapped.axis != unset.axis;
        let assembly = if needs_rx { Some(self.rx_assembly()?) } else { None };

        let mut devices = Vec::new();
        let mut timeout_ms = self.config.wait_timeout_ms;
        if let Some((axis, position)) = focus {
            axis.move_abs(position).await?;
            devices.push(DeviceHandle::Axis(axis));
        }
        if let Some(assembly) = assembly {
            if mapped.cylinder != unset.cylinder {
                assembly
                    .wheel
                    .move_to_named(&cylinder_slot_name(mapped.cylinder))
                    .await?;
                devices.push(DeviceHandle::Rx(Arc::clone(&assembly.wheel)));
            }
            if mapped.axis != unset.axis {
                assembly.axis.move_abs(f64::from(mapped.axis)).await?;
                devices.push(DeviceHandle::Axis(Arc::clone(&assembly.axis)));
            }
            timeout_ms = timeout_ms.max(assembly.timeout_ms);
        }
        info!(module_id = self.identity.id, requested = %rx, mapped = %mapped, "rx issued");
        Ok((devices, timeout_ms, mapped))
    }

    /// Issue the motions realising `rx`.
    pub async fn set_rx_async(
        &self,
        rx: RxCombination,
        notify: Option<CompletionSender>,
    ) -> AppResult<()> {
        let (devices, timeout_ms, mapped) = self.issue_rx(rx).await?;
        self.store_rx(mapped);
        self.notify_when_settled(devices, "rx".to_string(), timeout_ms, notify);
        Ok(())
    }

    /// Realise `rx` and wait.
    pub async fn set_rx_sync(&self, rx: RxCombination) -> AppResult<()> {
        let generation = self.stop_generation.load(Ordering::SeqCst);
        let (devices, timeout_ms, mapped) = self.issue_rx(rx).await?;
        self.store_rx(mapped);
        self.settle(&devices, "rx", timeout_ms, generation).await
    }

    fn store_rx(&self, mapped: RxCombination) {
        let mut settings = self.settings.write();
        settings.rx = mapped;
        if mapped.sphere != RxCombination::UNSET.sphere {
            settings.spherical = mapped.sphere;
        }
    }

    /// RX last realised (after mapping).
    pub fn rx(&self) -> RxCombination {
        self.settings.read().rx
    }

    // =========================================================================
    // Measurement context
    // =========================================================================

    /// Aperture recorded with later captures.
    pub fn set_aperture(&self, aperture: impl Into<String>) {
        self.settings.write().aperture = aperture.into();
    }

    /// Current aperture label.
    pub fn aperture(&self) -> String {
        self.settings.read().aperture.clone()
    }

    /// Light source recorded with later captures.
    pub fn set_light_source(&self, light_source: impl Into<String>) {
        self.settings.write().light_source = light_source.into();
    }

    /// Current light source label.
    pub fn light_source(&self) -> String {
        self.settings.read().light_source.clone()
    }

    // =========================================================================
    // Camera
    // =========================================================================

    /// Apply a fixed exposure or run auto exposure. Returns the exposure time
    /// in effect afterwards.
    #[instrument(skip(self), fields(module_id = self.identity.id))]
    pub async fn set_exposure(&self, setting: ExposureSetting) -> AppResult<f64> {
        let exposure_ms = match setting.mode {
            ExposureMode::Fixed => {
                self.camera.set_exposure_ms(setting.exposure_time_ms).await?;
                setting.exposure_time_ms
            }
            ExposureMode::Auto => self.auto_exposure(setting.exposure_time_ms).await?,
        };
        self.settings.write().exposure = ExposureSetting {
            mode: setting.mode,
            exposure_time_ms: exposure_ms,
        };
        Ok(exposure_ms)
    }

    /// Scale the exposure toward `target_ratio` of full scale.
    async fn auto_exposure(&self, initial_ms: f64) -> AppResult<f64> {
        let tuning = &self.config.auto_exposure;
        let full_scale = self.camera.pixel_format().await?.max_value();
        let target = tuning.target_ratio * full_scale;
        let mut exposure = initial_ms.clamp(tuning.min_exposure_ms, tuning.max_exposure_ms);

        for iteration in 0..tuning.max_iterations {
            self.camera.set_exposure_ms(exposure).await?;
            let level = self.camera.capture().await?.mean_level();
            debug!(iteration, exposure, level, target, "auto exposure step");
            if ((level - target) / target).abs() <= tuning.tolerance {
                return Ok(exposure);
            }
            let next = if level > 0.0 {
                exposure * target / level
            } else {
                exposure * 2.0
            }
            .clamp(tuning.min_exposure_ms, tuning.max_exposure_ms);
            if next == exposure {
                break;
            }
            exposure = next;
        }
        self.camera.set_exposure_ms(exposure).await?;
        warn!(exposure, "auto exposure did not converge");
        Ok(exposure)
    }

    /// Exposure time reported by the camera (ms).
    pub async fn exposure_time(&self) -> AppResult<f64> {
        Ok(self.camera.exposure_ms().await?)
    }

    /// Last applied exposure setting.
    pub fn exposure_setting(&self) -> ExposureSetting {
        self.settings.read().exposure
    }

    /// Camera binning.
    pub async fn set_binning(&self, binning: Binning) -> AppResult<()> {
        Ok(self.camera.set_binning(binning).await?)
    }

    /// Camera binning.
    pub async fn binning(&self) -> AppResult<Binning> {
        Ok(self.camera.binning().await?)
    }

    /// Sum or average binned pixels.
    pub async fn set_binning_mode(&self, mode: BinningMode) -> AppResult<()> {
        Ok(self.camera.set_binning_mode(mode).await?)
    }

    /// Sum or average binned pixels.
    pub async fn binning_mode(&self) -> AppResult<BinningMode> {
        Ok(self.camera.binning_mode().await?)
    }

    /// Camera pixel format.
    pub async fn set_pixel_format(&self, format: PixelFormat) -> AppResult<()> {
        Ok(self.camera.set_pixel_format(format).await?)
    }

    /// Camera pixel format.
    pub async fn pixel_format(&self) -> AppResult<PixelFormat> {
        Ok(self.camera.pixel_format().await?)
    }

    /// Acquire one frame with its measurement context.
    ///
    /// The capture becomes [`capture_data`](Self::capture_data); when a wheel
    /// has an X/Y/Z filter in the beam it is also stored in the colour map.
    #[instrument(skip(self), fields(module_id = self.identity.id, key = %self.identity.key))]
    pub async fn capture_image_sync(&self) -> AppResult<CaptureData> {
        let mut nd_filter = FilterChannel::ND0;
        let mut color_filter = FilterChannel::Unknown;
        for (wheel, _) in self.filter_wheels.values() {
            let channel = wheel.channel().await?;
            if channel.is_neutral_density() {
                nd_filter = channel;
            } else if channel.is_color() || color_filter == FilterChannel::Unknown {
                color_filter = channel;
            }
        }
        let vid = match self.focus_axis(None) {
            Ok((_, axis, curve)) => curve.vid_for_position(axis.position().await?),
            Err(_) => 0.0,
        };

        let frame = self.camera.capture().await?;
        let (aperture, light_source, rx) = {
            let settings = self.settings.read();
            (settings.aperture.clone(), settings.light_source.clone(), settings.rx)
        };
        let capture = CaptureData {
            serial_number: self.identity.serial_number.clone(),
            module_name: self.identity.name.clone(),
            key: self.identity.key.clone(),
            aperture,
            light_source,
            nd_filter,
            color_filter,
            movement_rx: rx,
            vid,
            exposure_time_ms: frame.exposure_ms,
            binning: frame.binning,
            pixel_format: frame.pixel_format,
            dark_subtracted: false,
            captured_at: Utc::now(),
            image: frame.data.clone(),
        };

        if color_filter.is_color() {
            self.color_captures
                .write()
                .insert(color_filter, capture.clone());
        }
        *self.last_capture.write() = Some(capture.clone());
        debug!(frame = frame.frame_number, %color_filter, %nd_filter, "image captured");
        Ok(capture)
    }

    /// Capture on a background task.
    pub fn capture_image_async(self: &Arc<Self>) -> JoinHandle<AppResult<CaptureData>> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.capture_image_sync().await })
    }

    /// Pixels of the last capture.
    pub fn image(&self) -> Option<Image> {
        self.last_capture
            .read()
            .as_ref()
            .map(|capture| capture.image.clone())
    }

    /// Last capture with its context.
    pub fn capture_data(&self) -> Option<CaptureData> {
        self.last_capture.read().clone()
    }

    /// Last capture per X/Y/Z filter.
    pub fn color_camera_capture_data(&self) -> BTreeMap<FilterChannel, CaptureData> {
        self.color_captures.read().clone()
    }

    /// Forget the per-filter captures.
    pub fn reset_color_capture_data(&self) {
        self.color_captures.write().clear();
    }
}

// =============================================================================
// Through-focus bench
// =============================================================================

struct ManagerBench<'a> {
    manager: &'a ModuleManager,
    key: String,
    axis: Arc<dyn AxisControl>,
    curve: FocusCurve,
    timeout_ms: u64,
    generation: u64,
}

#[async_trait]
impl FocusBench for ManagerBench<'_> {
    // A stop anywhere in the search ends it, also between two moves.
    async fn move_to(&self, position: f64) -> AppResult<()> {
        if self.manager.stop_generation.load(Ordering::SeqCst) != self.generation {
            return Err(ColorimeterError::UserStop(format!("{} stopped", self.key)));
        }
        self.axis.move_abs(position).await?;
        self.manager
            .settle(
                &[DeviceHandle::Axis(Arc::clone(&self.axis))],
                &self.key,
                self.timeout_ms,
                self.generation,
            )
            .await
    }

    async fn grab(&self) -> AppResult<Image> {
        let frame = self.manager.camera.capture().await?;
        Ok(frame.data.clone())
    }

    fn vid_for_position(&self, position: f64) -> f64 {
        self.curve.vid_for_position(position)
    }
}
