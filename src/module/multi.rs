//! Multi-module orchestration.
//!
//! [`MultiModuleManager`] owns the modules of a rig (keyed by module id) and an
//! optional IPD axis shared by a binocular rig. Every per-module operation is
//! fanned out in [`OperationMode::Parallel`] (all modules issued together) or
//! [`OperationMode::Serial`] (module n+1 after module n returned). A failing
//! module never aborts the others; results and errors come back together in a
//! [`FanOut`].

use crate::calibration::store::CalibrationResults;
use crate::calibration::{CalibrationAlgorithms, CalibrationStore, FileStore};
use crate::config::{
    AppConfig, CalibrationConfig, ModuleConfig, MotionConfig, SaveDataConfig,
    ThroughFocusConfig, DEFAULT_WAIT_TIMEOUT_MS,
};
use crate::error::{AppResult, ColorimeterError, OperationResult, ResultCode};
use crate::focus::engine::{FocusPeak, ThroughFocusCurves};
use crate::hardware::capabilities::{AxisControl, Device};
use crate::hardware::registry::DriverRegistry;
use crate::module::manager::{CompletionSender, ModuleManager};
use crate::types::{
    Binning, BinningMode, CaptureData, ExposureSetting, EyeMode, FilterChannel, FocusMethod,
    Image, OperationMode, PixelFormat, RxCombination,
};
use figment::providers::{Format, Toml};
use figment::Figment;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, instrument, warn};

// =============================================================================
// FanOut
// =============================================================================

/// Per-module outcome of a fan-out.
#[derive(Debug, Default)]
pub struct FanOut<T> {
    /// Values of the modules that succeeded
    pub values: BTreeMap<i32, T>,
    /// Errors of the modules that failed
    pub errors: BTreeMap<i32, ColorimeterError>,
    /// Failure of the shared IPD axis, for operations that also drive it
    pub ipd_error: Option<ColorimeterError>,
}

impl<T> FanOut<T> {
    fn new() -> Self {
        Self {
            values: BTreeMap::new(),
            errors: BTreeMap::new(),
            ipd_error: None,
        }
    }

    fn record_ipd(&mut self, result: AppResult<()>) {
        if let Err(err) = result {
            warn!(error = %err, "IPD axis operation failed");
            self.ipd_error = Some(err);
        }
    }

    fn record(&mut self, id: i32, result: AppResult<T>) {
        match result {
            Ok(value) => {
                self.values.insert(id, value);
            }
            Err(err) => {
                warn!(module_id = id, error = %err, "module operation failed");
                self.errors.insert(id, err);
            }
        }
    }

    /// True when neither a module nor the IPD axis failed.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.ipd_error.is_none()
    }

    /// Ids of the failed modules, ascending.
    pub fn failed_ids(&self) -> Vec<i32> {
        self.errors.keys().copied().collect()
    }

    fn message(&self) -> String {
        self.errors
            .iter()
            .map(|(id, err)| format!("module {}: {}", id, err))
            .chain(self.ipd_error.iter().map(|err| format!("IPD axis: {}", err)))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn failures(&self) -> impl Iterator<Item = &ColorimeterError> {
        self.errors.values().chain(self.ipd_error.iter())
    }

    /// Flat report: success iff nothing failed. The code is `UserStop`
    /// only when every failure was a user stop.
    pub fn status(&self) -> OperationResult {
        if self.is_success() {
            return OperationResult::ok();
        }
        let code = if self.failures().all(ColorimeterError::is_user_stop) {
            ResultCode::UserStop
        } else {
            ResultCode::Runtime
        };
        OperationResult {
            success: false,
            message: self.message(),
            code,
        }
    }

    /// All values, or a `PartialFailure` naming the failed modules. An IPD
    /// failure alone yields a `PartialFailure` with no module ids.
    pub fn into_result(self) -> AppResult<BTreeMap<i32, T>> {
        if self.is_success() {
            return Ok(self.values);
        }
        let message = self.message();
        Err(ColorimeterError::PartialFailure {
            failed: self.failed_ids(),
            message,
        })
    }
}

// =============================================================================
// MultiModuleManager
// =============================================================================

/// Owner of every module of a rig.
pub struct MultiModuleManager {
    registry: DriverRegistry,
    store: Arc<dyn CalibrationStore>,
    modules: RwLock<BTreeMap<i32, Arc<ModuleManager>>>,
    ipd: RwLock<Option<(Arc<dyn AxisControl>, MotionConfig)>>,
    mode: parking_lot::RwLock<OperationMode>,
}

impl MultiModuleManager {
    /// Empty manager persisting calibration data to the file system.
    pub fn new(registry: DriverRegistry) -> Self {
        Self::with_store(registry, Arc::new(FileStore::new()))
    }

    /// Empty manager with a custom calibration store.
    pub fn with_store(registry: DriverRegistry, store: Arc<dyn CalibrationStore>) -> Self {
        Self {
            registry,
            store,
            modules: RwLock::new(BTreeMap::new()),
            ipd: RwLock::new(None),
            mode: parking_lot::RwLock::new(OperationMode::default()),
        }
    }

    /// Manager holding every module and the IPD axis of `config`.
    pub async fn from_config(
        config: &AppConfig,
        registry: DriverRegistry,
        store: Arc<dyn CalibrationStore>,
    ) -> AppResult<Self> {
        config.validate()?;
        let manager = Self::with_store(registry, store);
        manager.set_operation_mode(config.operation_mode);
        for module in &config.modules {
            manager.add_module_config(module.clone()).await?;
        }
        if let Some(ipd) = &config.ipd_motion {
            manager.add_ipd_motion_config(ipd.clone()).await?;
        }
        Ok(manager)
    }

    /// Fan-out policy used by operations without an explicit mode.
    pub fn operation_mode(&self) -> OperationMode {
        *self.mode.read()
    }

    /// Set the default fan-out policy.
    pub fn set_operation_mode(&self, mode: OperationMode) {
        *self.mode.write() = mode;
    }

    // =========================================================================
    // Fan-out machinery
    // =========================================================================

    /// Modules at this instant. The guard is released before any module
    /// call, so a queued add/remove never delays a stop.
    async fn snapshot(&self) -> Vec<(i32, Arc<ModuleManager>)> {
        self.modules
            .read()
            .await
            .iter()
            .map(|(id, module)| (*id, Arc::clone(module)))
            .collect()
    }

    async fn fan_out<T, F, Fut>(&self, mode: OperationMode, op: F) -> FanOut<T>
    where
        F: Fn(Arc<ModuleManager>) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let modules = self.snapshot().await;
        let mut out = FanOut::new();
        match mode {
            OperationMode::Parallel => {
                let calls = modules.into_iter().map(|(id, module)| {
                    let call = op(module);
                    async move { (id, call.await) }
                });
                for (id, result) in join_all(calls).await {
                    out.record(id, result);
                }
            }
            OperationMode::Serial => {
                for (id, module) in modules {
                    let result = op(module).await;
                    out.record(id, result);
                }
            }
        }
        out
    }

    async fn collect<T, F>(&self, get: F) -> BTreeMap<i32, T>
    where
        F: Fn(&ModuleManager) -> T,
    {
        self.modules
            .read()
            .await
            .iter()
            .map(|(id, module)| (*id, get(module)))
            .collect()
    }

    async fn collect_some<T, F>(&self, get: F) -> BTreeMap<i32, T>
    where
        F: Fn(&ModuleManager) -> Option<T>,
    {
        self.modules
            .read()
            .await
            .iter()
            .filter_map(|(id, module)| get(module).map(|value| (*id, value)))
            .collect()
    }

    // =========================================================================
    // Module collection
    // =========================================================================

    /// Add the module described by the TOML file at `path`. Returns its id.
    pub async fn add_module(&self, path: &Path) -> AppResult<i32> {
        self.add_module_config(ModuleConfig::load_from(path)?).await
    }

    /// Add a module from its configuration. Returns its id.
    #[instrument(skip(self, config), fields(module_id = config.id, key = %config.key))]
    pub async fn add_module_config(&self, config: ModuleConfig) -> AppResult<i32> {
        let id = config.id;
        let mut modules = self.modules.write().await;
        if modules.contains_key(&id) {
            return Err(ColorimeterError::config(format!(
                "module id {} already added",
                id
            )));
        }
        let module = ModuleManager::new(config, &self.registry, Arc::clone(&self.store))?;
        modules.insert(id, Arc::new(module));
        info!("module added");
        Ok(id)
    }

    /// Disconnect and drop module `id`.
    pub async fn remove_module(&self, id: i32) -> AppResult<()> {
        let module = self.modules.write().await.remove(&id).ok_or_else(|| {
            ColorimeterError::NotFound(format!("module id {}", id))
        })?;
        if let Err(err) = module.disconnect_module().await {
            warn!(module_id = id, error = %err, "disconnect on remove failed");
        }
        info!(module_id = id, "module removed");
        Ok(())
    }

    /// Add the IPD axis described by the TOML file at `path`.
    pub async fn add_ipd_motion(&self, path: &Path) -> AppResult<()> {
        let config: MotionConfig = Figment::new().merge(Toml::file(path)).extract()?;
        self.add_ipd_motion_config(config).await
    }

    /// Add the IPD axis; replaces (and disconnects) a previous one.
    pub async fn add_ipd_motion_config(&self, config: MotionConfig) -> AppResult<()> {
        let axis = self.registry.create_axis(&config)?;
        let previous = self.ipd.write().await.replace((axis, config));
        if let Some((old, _)) = previous {
            if let Err(err) = old.disconnect().await {
                warn!(error = %err, "previous IPD axis did not disconnect");
            }
        }
        info!("IPD motion added");
        Ok(())
    }

    /// Disconnect and drop the IPD axis.
    pub async fn remove_ipd_motion(&self) -> AppResult<()> {
        let (axis, _) = self
            .ipd
            .write()
            .await
            .take()
            .ok_or_else(|| ColorimeterError::NotFound("IPD motion".to_string()))?;
        axis.disconnect().await?;
        info!("IPD motion removed");
        Ok(())
    }

    /// Configuration of the IPD axis, if one was added.
    pub async fn ipd_motion_config(&self) -> Option<MotionConfig> {
        self.ipd.read().await.as_ref().map(|(_, config)| config.clone())
    }

    async fn ipd_axis(&self) -> AppResult<Arc<dyn AxisControl>> {
        self.ipd
            .read()
            .await
            .as_ref()
            .map(|(axis, _)| Arc::clone(axis))
            .ok_or_else(|| ColorimeterError::NotFound("IPD motion".to_string()))
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Serial number per module.
    pub async fn modules_serial_number(&self) -> BTreeMap<i32, String> {
        self.collect(|module| module.serial_number().to_string()).await
    }

    /// Name per module.
    pub async fn modules_name(&self) -> BTreeMap<i32, String> {
        self.collect(|module| module.name().to_string()).await
    }

    /// Module ids, ascending.
    pub async fn modules_id_list(&self) -> Vec<i32> {
        self.modules.read().await.keys().copied().collect()
    }

    /// Number of modules.
    pub async fn modules_number(&self) -> usize {
        self.modules.read().await.len()
    }

    /// Configuration per module.
    pub async fn modules_config(&self) -> BTreeMap<i32, ModuleConfig> {
        self.collect(|module| module.config().clone()).await
    }

    /// Module with id `id`.
    pub async fn module_by_id(&self, id: i32) -> Option<Arc<ModuleManager>> {
        self.modules.read().await.get(&id).cloned()
    }

    /// Module with serial number `serial_number`.
    pub async fn module_by_sn(&self, serial_number: &str) -> Option<Arc<ModuleManager>> {
        self.find(|module| module.serial_number() == serial_number)
            .await
    }

    /// Module named `name`.
    pub async fn module_by_name(&self, name: &str) -> Option<Arc<ModuleManager>> {
        self.find(|module| module.name() == name).await
    }

    /// First module for `eye_mode`.
    pub async fn module_by_eye_mode(&self, eye_mode: EyeMode) -> Option<Arc<ModuleManager>> {
        self.find(|module| module.eye_mode() == eye_mode).await
    }

    async fn find<F>(&self, predicate: F) -> Option<Arc<ModuleManager>>
    where
        F: Fn(&ModuleManager) -> bool,
    {
        self.modules
            .read()
            .await
            .values()
            .find(|module| predicate(module))
            .cloned()
    }

    fn module_missing(id: i32) -> ColorimeterError {
        ColorimeterError::NotFound(format!("module id {}", id))
    }

    async fn require(&self, id: i32) -> AppResult<Arc<ModuleManager>> {
        self.module_by_id(id).await.ok_or_else(|| Self::module_missing(id))
    }

    /// Calibration state of module `id`.
    pub async fn calibration_process_by_id(&self, id: i32) -> Option<Arc<CalibrationAlgorithms>> {
        self.module_by_id(id).await.map(|module| module.calibration())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect every module and the IPD axis.
    #[instrument(skip(self))]
    pub async fn connect_modules(&self) -> FanOut<()> {
        let mut out = self
            .fan_out(self.operation_mode(), |module| async move {
                module.connect_module().await
            })
            .await;
        if let Ok(axis) = self.ipd_axis().await {
            out.record_ipd(axis.connect().await.map_err(Into::into));
        }
        info!(failed = out.errors.len(), ipd_failed = out.ipd_error.is_some(), "modules connected");
        out
    }

    /// Disconnect every module and the IPD axis.
    #[instrument(skip(self))]
    pub async fn disconnect_modules(&self) -> FanOut<()> {
        let mut out = self
            .fan_out(self.operation_mode(), |module| async move {
                module.disconnect_module().await
            })
            .await;
        if let Ok(axis) = self.ipd_axis().await {
            out.record_ipd(axis.disconnect().await.map_err(Into::into));
        }
        out
    }

    /// True when every module (and the IPD axis, if any) is connected.
    pub async fn is_modules_connected(&self) -> bool {
        let modules_connected = self
            .modules
            .read()
            .await
            .values()
            .all(|module| module.is_module_connected());
        let ipd_connected = match self.ipd.read().await.as_ref() {
            Some((axis, _)) => axis.is_connected(),
            None => true,
        };
        modules_connected && ipd_connected
    }

    /// True while any module motor or the IPD axis is moving.
    pub async fn is_modules_moving(&self) -> bool {
        let modules_moving = self
            .modules
            .read()
            .await
            .values()
            .any(|module| module.is_module_motors_moving());
        let ipd_moving = match self.ipd.read().await.as_ref() {
            Some((axis, _)) => axis.is_moving(),
            None => false,
        };
        modules_moving || ipd_moving
    }

    /// Wait until every module's motors settled.
    pub async fn wait_for_moving_stop(&self, timeout_ms: u64, mode: OperationMode) -> FanOut<()> {
        self.fan_out(mode, |module| async move {
            module.wait_for_moving_stop(timeout_ms).await
        })
        .await
    }

    /// Stop every module and the IPD axis.
    pub async fn stop_modules_movement(&self, mode: OperationMode) -> FanOut<()> {
        let ipd = match self.ipd_axis().await {
            Ok(axis) => Some(axis.stop().await.map_err(Into::into)),
            Err(_) => None,
        };
        let mut out = self
            .fan_out(mode, |module| async move { module.stop_module_movement().await })
            .await;
        if let Some(result) = ipd {
            out.record_ipd(result);
        }
        out
    }

    /// Stop axis `key` on every module.
    pub async fn stop_motion_movement(&self, key: &str, mode: OperationMode) -> FanOut<()> {
        self.fan_out(mode, |module| async move {
            module.stop_motion_movement(key).await
        })
        .await
    }

    // =========================================================================
    // Filter wheels
    // =========================================================================

    /// Issue a filter move on every module.
    pub async fn move_nd_xyz_filter_by_enum_async(
        &self,
        key: &str,
        channel: FilterChannel,
        notify: Option<CompletionSender>,
        mode: OperationMode,
    ) -> FanOut<()> {
        self.fan_out(mode, |module| {
            let notify = notify.clone();
            async move {
                module
                    .move_nd_xyz_filter_by_enum_async(key, channel, notify)
                    .await
            }
        })
        .await
    }

    /// Move wheel `key` to `channel` on every module and wait.
    pub async fn move_nd_xyz_filter_by_enum_sync(
        &self,
        key: &str,
        channel: FilterChannel,
        mode: OperationMode,
    ) -> FanOut<()> {
        self.fan_out(mode, |module| async move {
            module.move_nd_xyz_filter_by_enum_sync(key, channel).await
        })
        .await
    }

    /// Channel in the beam on wheel `key`, per module.
    pub async fn nd_xyz_filter_channel(&self, key: &str) -> FanOut<FilterChannel> {
        self.fan_out(OperationMode::Parallel, |module| async move {
            module.nd_xyz_filter_channel(key).await
        })
        .await
    }

    /// Issue an RX wheel move on every module.
    pub async fn move_rx_filter_by_name_async(
        &self,
        name: &str,
        degree: f64,
        notify: Option<CompletionSender>,
        mode: OperationMode,
    ) -> FanOut<()> {
        self.fan_out(mode, |module| {
            let notify = notify.clone();
            async move { module.move_rx_filter_by_name_async(name, degree, notify).await }
        })
        .await
    }

    /// Move the RX wheel on every module and wait.
    pub async fn move_rx_filter_by_name_sync(
        &self,
        name: &str,
        degree: f64,
        mode: OperationMode,
    ) -> FanOut<()> {
        self.fan_out(mode, |module| async move {
            module.move_rx_filter_by_name_sync(name, degree).await
        })
        .await
    }

    /// RX slot in the beam, per module.
    pub async fn rx_filter_channel(&self) -> FanOut<String> {
        self.fan_out(OperationMode::Parallel, |module| async move {
            module.rx_filter_channel().await
        })
        .await
    }

    /// RX axis angle, per module.
    pub async fn rx_filter_axis(&self) -> FanOut<f64> {
        self.fan_out(OperationMode::Parallel, |module| async move {
            module.rx_filter_axis().await
        })
        .await
    }

    // =========================================================================
    // Focus
    // =========================================================================

    /// Issue a focus move to `vid` on every module.
    pub async fn set_focus_async(
        &self,
        vid: f64,
        method: FocusMethod,
        notify: Option<CompletionSender>,
        mode: OperationMode,
    ) -> FanOut<()> {
        self.fan_out(mode, |module| {
            let notify = notify.clone();
            async move { module.set_focus_async(vid, method, notify).await }
        })
        .await
    }

    /// Focus every module to `vid` and wait.
    pub async fn set_focus_sync(&self, vid: f64, method: FocusMethod, mode: OperationMode) -> FanOut<()> {
        self.fan_out(mode, |module| async move {
            module.set_focus_sync(vid, method).await
        })
        .await
    }

    /// Current VID per module.
    pub async fn vid(&self, method: FocusMethod) -> FanOut<f64> {
        self.fan_out(OperationMode::Parallel, |module| async move {
            module.vid(method).await
        })
        .await
    }

    /// Through-focus on axis `key` of every module.
    #[instrument(skip(self, config))]
    pub async fn through_focus(
        &self,
        key: &str,
        config: &ThroughFocusConfig,
        mode: OperationMode,
    ) -> FanOut<FocusPeak> {
        self.fan_out(mode, |module| async move {
            module.through_focus(key, config).await
        })
        .await
    }

    /// Curves of the last search, per module.
    pub async fn through_focus_curves(&self) -> BTreeMap<i32, ThroughFocusCurves> {
        self.collect(ModuleManager::through_focus_curves).await
    }

    /// Fine-phase VIDs per module.
    pub async fn vid_curve(&self) -> BTreeMap<i32, Vec<f64>> {
        self.collect(ModuleManager::vid_curve).await
    }

    /// Fine-phase MTF per module.
    pub async fn mtf_curve(&self) -> BTreeMap<i32, Vec<f64>> {
        self.collect(ModuleManager::mtf_curve).await
    }

    /// Fine-phase positions per module.
    pub async fn motion_curve(&self) -> BTreeMap<i32, Vec<f64>> {
        self.collect(ModuleManager::motion_curve).await
    }

    /// Coarse-phase proxy scores per module.
    pub async fn rough_std_curve(&self) -> BTreeMap<i32, Vec<f64>> {
        self.collect(ModuleManager::rough_std_curve).await
    }

    /// Coarse-phase VIDs per module.
    pub async fn rough_vid_curve(&self) -> BTreeMap<i32, Vec<f64>> {
        self.collect(ModuleManager::rough_vid_curve).await
    }

    /// Coarse-phase positions per module.
    pub async fn rough_motion_curve(&self) -> BTreeMap<i32, Vec<f64>> {
        self.collect(ModuleManager::rough_motion_curve).await
    }

    // =========================================================================
    // Axes
    // =========================================================================

    /// Issue an absolute move of axis `key` on every module.
    pub async fn set_position_abs_async(
        &self,
        key: &str,
        position: f64,
        notify: Option<CompletionSender>,
        mode: OperationMode,
    ) -> FanOut<()> {
        self.fan_out(mode, |module| {
            let notify = notify.clone();
            async move { module.set_position_abs_async(key, position, notify).await }
        })
        .await
    }

    /// Move axis `key` on every module and wait.
    pub async fn set_position_abs_sync(&self, key: &str, position: f64, mode: OperationMode) -> FanOut<()> {
        self.fan_out(mode, |module| async move {
            module.set_position_abs_sync(key, position).await
        })
        .await
    }

    /// Issue a relative move of axis `key` on every module.
    pub async fn set_position_rel_async(
        &self,
        key: &str,
        delta: f64,
        notify: Option<CompletionSender>,
        mode: OperationMode,
    ) -> FanOut<()> {
        self.fan_out(mode, |module| {
            let notify = notify.clone();
            async move { module.set_position_rel_async(key, delta, notify).await }
        })
        .await
    }

    /// Move axis `key` by `delta` on every module and wait.
    pub async fn set_position_rel_sync(&self, key: &str, delta: f64, mode: OperationMode) -> FanOut<()> {
        self.fan_out(mode, |module| async move {
            module.set_position_rel_sync(key, delta).await
        })
        .await
    }

    /// Position of axis `key`, per module.
    pub async fn motion_position(&self, key: &str) -> FanOut<f64> {
        self.fan_out(OperationMode::Parallel, |module| async move {
            module.motion_position(key).await
        })
        .await
    }

    // =========================================================================
    // IPD
    // =========================================================================

    /// Issue an IPD move (mm).
    pub async fn set_ipd_async(&self, ipd: f64) -> AppResult<()> {
        let axis = self.ipd_axis().await?;
        axis.move_abs(ipd).await?;
        debug!(ipd, "IPD move issued");
        Ok(())
    }

    /// Move the IPD axis (mm) and wait until it settled.
    pub async fn set_ipd_sync(&self, ipd: f64) -> AppResult<()> {
        let axis = self.ipd_axis().await?;
        axis.move_abs(ipd).await?;
        let deadline = Instant::now() + Duration::from_millis(DEFAULT_WAIT_TIMEOUT_MS);
        loop {
            let moving = axis.is_moving();
            if let Some(fault) = axis.state().fault_error(axis.name()) {
                return Err(fault.into());
            }
            if !moving {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ColorimeterError::Timeout {
                    operation: "set_ipd".to_string(),
                    timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
                });
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Current IPD (mm).
    pub async fn ipd(&self) -> AppResult<f64> {
        Ok(self.ipd_axis().await?.position().await?)
    }

    // =========================================================================
    // Spherical / RX
    // =========================================================================

    /// Issue a spherical focus move on every module.
    pub async fn set_spherical_async(
        &self,
        sphere: f64,
        notify: Option<CompletionSender>,
        mode: OperationMode,
    ) -> FanOut<()> {
        self.fan_out(mode, |module| {
            let notify = notify.clone();
            async move { module.set_spherical_async(sphere, notify).await }
        })
        .await
    }

    /// Focus every module to `sphere` diopters and wait.
    pub async fn set_spherical_sync(&self, sphere: f64, mode: OperationMode) -> FanOut<()> {
        self.fan_out(mode, |module| async move {
            module.set_spherical_sync(sphere).await
        })
        .await
    }

    /// Last spherical power per module.
    pub async fn spherical(&self) -> BTreeMap<i32, f64> {
        self.collect(ModuleManager::spherical).await
    }

    /// Issue `rx` on every module.
    pub async fn set_rx_async(
        &self,
        rx: RxCombination,
        notify: Option<CompletionSender>,
        mode: OperationMode,
    ) -> FanOut<()> {
        self.fan_out(mode, |module| {
            let notify = notify.clone();
            async move { module.set_rx_async(rx, notify).await }
        })
        .await
    }

    /// Realise `rx` on every module and wait.
    pub async fn set_rx_sync(&self, rx: RxCombination, mode: OperationMode) -> FanOut<()> {
        self.fan_out(mode, |module| async move { module.set_rx_sync(rx).await })
            .await
    }

    /// Last realised RX per module.
    pub async fn rx(&self) -> BTreeMap<i32, RxCombination> {
        self.collect(ModuleManager::rx).await
    }

    // =========================================================================
    // Measurement context and camera
    // =========================================================================

    /// Aperture label on every module.
    pub async fn set_aperture(&self, aperture: &str) {
        for module in self.modules.read().await.values() {
            module.set_aperture(aperture);
        }
    }

    /// Aperture label per module.
    pub async fn aperture(&self) -> BTreeMap<i32, String> {
        self.collect(ModuleManager::aperture).await
    }

    /// Light source label on every module.
    pub async fn set_light_source(&self, light_source: &str) {
        for module in self.modules.read().await.values() {
            module.set_light_source(light_source);
        }
    }

    /// Light source label per module.
    pub async fn light_source(&self) -> BTreeMap<i32, String> {
        self.collect(ModuleManager::light_source).await
    }

    /// Apply `setting` on every module; values are the resulting exposure times.
    pub async fn set_exposure(&self, setting: ExposureSetting, mode: OperationMode) -> FanOut<f64> {
        self.fan_out(mode, |module| async move { module.set_exposure(setting).await })
            .await
    }

    /// Exposure time per module (ms).
    pub async fn exposure_time(&self) -> FanOut<f64> {
        self.fan_out(OperationMode::Parallel, |module| async move {
            module.exposure_time().await
        })
        .await
    }

    /// Binning on every module.
    pub async fn set_binning(&self, binning: Binning, mode: OperationMode) -> FanOut<()> {
        self.fan_out(mode, |module| async move { module.set_binning(binning).await })
            .await
    }

    /// Binning per module.
    pub async fn binning(&self) -> FanOut<Binning> {
        self.fan_out(OperationMode::Parallel, |module| async move {
            module.binning().await
        })
        .await
    }

    /// Binning mode on every module.
    pub async fn set_binning_mode(&self, binning_mode: BinningMode, mode: OperationMode) -> FanOut<()> {
        self.fan_out(mode, |module| async move {
            module.set_binning_mode(binning_mode).await
        })
        .await
    }

    /// Binning mode per module.
    pub async fn binning_mode(&self) -> FanOut<BinningMode> {
        self.fan_out(OperationMode::Parallel, |module| async move {
            module.binning_mode().await
        })
        .await
    }

    /// Pixel format on every module.
    pub async fn set_pixel_format(&self, format: PixelFormat, mode: OperationMode) -> FanOut<()> {
        self.fan_out(mode, |module| async move { module.set_pixel_format(format).await })
            .await
    }

    /// Pixel format per module.
    pub async fn pixel_format(&self) -> FanOut<PixelFormat> {
        self.fan_out(OperationMode::Parallel, |module| async move {
            module.pixel_format().await
        })
        .await
    }

    /// Capture one frame on every module.
    pub async fn capture_image_sync(&self, mode: OperationMode) -> FanOut<CaptureData> {
        self.fan_out(mode, |module| async move { module.capture_image_sync().await })
            .await
    }

    /// Capture on background tasks, always concurrently.
    pub async fn capture_image_async(&self) -> FanOut<CaptureData> {
        self.fan_out(OperationMode::Parallel, |module| async move {
            module.capture_image_async().await.map_err(|err| {
                ColorimeterError::Processing(format!("capture task failed: {}", err))
            })?
        })
        .await
    }

    /// Last image per module.
    pub async fn image(&self) -> BTreeMap<i32, Image> {
        self.collect_some(ModuleManager::image).await
    }

    /// Last capture per module.
    pub async fn capture_data(&self) -> BTreeMap<i32, CaptureData> {
        self.collect_some(ModuleManager::capture_data).await
    }

    /// Per-filter captures per module.
    pub async fn color_camera_capture_data(
        &self,
    ) -> BTreeMap<i32, BTreeMap<FilterChannel, CaptureData>> {
        self.collect(ModuleManager::color_camera_capture_data).await
    }

    /// Forget the per-filter captures of every module.
    pub async fn reset_color_capture_data(&self) {
        for module in self.modules.read().await.values() {
            module.reset_color_capture_data();
        }
    }

    // =========================================================================
    // Calibration
    // =========================================================================

    /// Load the dark frames under `path` into every module.
    pub async fn load_dark_by_exposure_time_list(&self, path: &Path) -> FanOut<usize> {
        self.fan_out(OperationMode::Parallel, |module| {
            let path = path.to_path_buf();
            async move {
                blocking(move || module.calibration().load_dark_by_exposure_time_list(&path)).await
            }
        })
        .await
    }

    /// Load the reference data selected by `config` into every module.
    pub async fn load_calibration_data(
        &self,
        config: &CalibrationConfig,
        mode: OperationMode,
    ) -> FanOut<()> {
        self.fan_out(mode, |module| {
            let config = config.clone();
            async move { blocking(move || module.calibration().load_calibration_data(&config)).await }
        })
        .await
    }

    /// Replace the captures of module `id`.
    pub async fn set_capture_data_map(
        &self,
        id: i32,
        map: BTreeMap<FilterChannel, CaptureData>,
        sub_dark: bool,
    ) -> AppResult<()> {
        self.require(id)
            .await?
            .calibration()
            .set_capture_data_map(map, sub_dark)
    }

    /// Run the pipeline on every module; CPU work runs on the blocking pool.
    #[instrument(skip(self, config))]
    pub async fn process(&self, config: &CalibrationConfig, mode: OperationMode) -> FanOut<()> {
        self.fan_out(mode, |module| {
            let config = config.clone();
            async move { blocking(move || module.calibration().process(&config)).await }
        })
        .await
    }

    /// One full measurement on every module.
    ///
    /// Per module: realise `config.rx` when set, put `config.nd_filter` on
    /// the `nd_key` wheel, then for each of `config.filters` move the
    /// `xyz_key` wheel, apply `exposure` and capture. A colour camera skips
    /// the XYZ wheel and captures once for all filters. The captures replace
    /// the module's capture map and the pipeline runs on them.
    #[instrument(skip(self, config, exposure))]
    pub async fn measurement(
        &self,
        nd_key: &str,
        xyz_key: &str,
        config: &CalibrationConfig,
        exposure: ExposureSetting,
        is_color_camera: bool,
        mode: OperationMode,
    ) -> FanOut<CalibrationResults> {
        self.fan_out(mode, |module| {
            let config = config.clone();
            async move {
                let captures =
                    capture_filters(&module, nd_key, xyz_key, &config, exposure, is_color_camera)
                        .await?;
                let calibration = module.calibration();
                blocking(move || {
                    calibration.set_capture_data_map(captures, false)?;
                    calibration.process(&config)?;
                    Ok(calibration.calibration_data())
                })
                .await
            }
        })
        .await
    }

    /// Save the results of the last [`measurement`](Self::measurement) of
    /// module `id`.
    pub async fn save_measure_result(&self, id: i32, save: &SaveDataConfig) -> AppResult<PathBuf> {
        let calibration = self.require(id).await?.calibration();
        calibration.save_calibration_data(&calibration.calibration_data(), save)
    }

    /// Results of the last pipeline run of module `id`.
    pub async fn calibration_data(&self, id: i32) -> AppResult<CalibrationResults> {
        Ok(self.require(id).await?.calibration().calibration_data())
    }

    /// Save `data` under the output directory of module `id`.
    pub async fn save_calibration_data(
        &self,
        data: &CalibrationResults,
        id: i32,
        save: &SaveDataConfig,
    ) -> AppResult<PathBuf> {
        self.require(id)
            .await?
            .calibration()
            .save_calibration_data(data, save)
    }
}

async fn capture_filters(
    module: &ModuleManager,
    nd_key: &str,
    xyz_key: &str,
    config: &CalibrationConfig,
    exposure: ExposureSetting,
    is_color_camera: bool,
) -> AppResult<BTreeMap<FilterChannel, CaptureData>> {
    if config.rx.is_set() {
        module.set_rx_sync(config.rx).await?;
    }
    module
        .move_nd_xyz_filter_by_enum_sync(nd_key, config.nd_filter)
        .await?;
    module.set_aperture(config.aperture.clone());
    if !config.light_source.is_empty() {
        module.set_light_source(config.light_source.clone());
    }

    let mut captures = BTreeMap::new();
    if is_color_camera {
        module.set_exposure(exposure).await?;
        let capture = module.capture_image_sync().await?;
        for filter in &config.filters {
            let data = CaptureData {
                color_filter: *filter,
                ..capture.clone()
            };
            captures.insert(*filter, data);
        }
    } else {
        for filter in &config.filters {
            module.move_nd_xyz_filter_by_enum_sync(xyz_key, *filter).await?;
            module.set_exposure(exposure).await?;
            captures.insert(*filter, module.capture_image_sync().await?);
        }
    }
    debug!(module_id = module.id(), count = captures.len(), "measurement captured");
    Ok(captures)
}

async fn blocking<T, F>(work: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ColorimeterError::Processing(format!("worker task failed: {}", err)))?
}
