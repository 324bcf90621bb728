//! # ML Colorimeter Core Library
//!
//! Orchestration of optical measurement modules (camera, filter wheels and
//! focus/position motors) plus the processing that turns raw per-filter
//! captures into calibrated products.
//!
//! ## Crate Structure
//!
//! - **`config`**: figment-loaded configuration of modules, devices, the
//!   through-focus search and the calibration pipeline.
//! - **`error`**: the `ColorimeterError` enum, result codes and `OperationResult`.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`types`**: domain value types shared across the crate.
//! - **`hardware`**: capability traits, device state machine, driver registry
//!   and mock drivers.
//! - **`module`**: `ModuleManager` (one module) and `MultiModuleManager`
//!   (parallel/serial fan-out across a rig).
//! - **`focus`**: coarse + fine through-focus search and its metrics.
//! - **`calibration`**: the fixed-order correction pipeline, its reference
//!   data and storage backends.
//!
//! ## Example
//! ```no_run
//! use ml_colorimeter::config::ModuleConfig;
//! use ml_colorimeter::hardware::DriverRegistry;
//! use ml_colorimeter::module::MultiModuleManager;
//! use ml_colorimeter::types::OperationMode;
//!
//! # async fn run() -> ml_colorimeter::error::AppResult<()> {
//! let rig = MultiModuleManager::new(DriverRegistry::with_mock_drivers());
//! rig.add_module(std::path::Path::new("config/left.toml")).await?;
//! rig.connect_modules().await.into_result()?;
//! rig.capture_image_sync(OperationMode::Parallel).await.into_result()?;
//! # Ok(())
//! # }
//! ```

pub mod calibration;
pub mod config;
pub mod error;
pub mod focus;
pub mod hardware;
pub mod logging;
pub mod module;
pub mod types;

pub use error::{AppResult, ColorimeterError, OperationResult};
pub use module::{ModuleManager, MultiModuleManager};
