//! Tracing setup.
//!
//! Managers log through `tracing` with `module_id` / `key` fields on their
//! spans. This module installs the global subscriber once per process, in one
//! of three formats, with `RUST_LOG` taking precedence over the configured
//! level.
//!
//! # Example
//! ```no_run
//! use ml_colorimeter::{config::AppConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load_from("config/colorimeter.toml")?;
//! logging::init_from_config(&config)?;
//! tracing::info!("rig starting");
//! # Ok(())
//! # }
//! ```

use crate::config::AppConfig;
use crate::error::{AppResult, ColorimeterError};
use std::str::FromStr;
use strum::{Display, EnumString};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::Registry,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Log line layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogFormat {
    /// Multi-line, coloured; for a bench terminal
    Pretty,
    /// One line per event, no colours
    Compact,
    /// Newline-delimited JSON for log collectors
    Json,
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Default level; `RUST_LOG` overrides it.
    pub level: Level,
    /// Line layout.
    pub format: LogFormat,
    /// Emit span open/close events; useful to time fan-outs
    pub span_events: bool,
    /// Include file and line.
    pub source_location: bool,
    /// Colour the pretty layout.
    pub ansi: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            span_events: false,
            source_location: true,
            ansi: true,
        }
    }
}

impl LogSettings {
    /// Settings from `[application]` in the app configuration.
    pub fn from_app_config(config: &AppConfig) -> AppResult<Self> {
        let level = Level::from_str(&config.application.log_level).map_err(|_| {
            ColorimeterError::config(format!(
                "unknown log level '{}' (trace, debug, info, warn, error)",
                config.application.log_level
            ))
        })?;
        let format = LogFormat::from_str(&config.application.log_format).map_err(|_| {
            ColorimeterError::config(format!(
                "unknown log format '{}' (pretty, compact, json)",
                config.application.log_format
            ))
        })?;
        Ok(Self {
            level,
            format,
            ..Self::default()
        })
    }

    /// Use `format`.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Toggle span open/close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Toggle colours.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let spans = if self.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_span_events(spans)
            .with_file(self.source_location)
            .with_line_number(self.source_location)
            .with_thread_names(true);
        match self.format {
            LogFormat::Pretty => base.pretty().with_ansi(self.ansi).boxed(),
            LogFormat::Compact => base.compact().with_ansi(false).boxed(),
            LogFormat::Json => base.json().with_ansi(false).boxed(),
        }
    }
}

/// Install the subscriber described by `[application]`.
pub fn init_from_config(config: &AppConfig) -> AppResult<()> {
    init(LogSettings::from_app_config(config)?)
}

/// Install the global subscriber.
///
/// A subscriber installed earlier (by another test, or by the host
/// application) is kept and this returns `Ok(())`.
pub fn init(settings: LogSettings) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str().to_lowercase()));
    let installed = tracing_subscriber::registry()
        .with(settings.layer())
        .with(filter)
        .try_init();
    match installed {
        Ok(()) => Ok(()),
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(err) => Err(ColorimeterError::config(format!(
            "cannot install tracing subscriber: {}",
            err
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApplicationConfig;

    fn app_config(level: &str, format: &str) -> AppConfig {
        AppConfig {
            application: ApplicationConfig {
                name: "bench".to_string(),
                log_level: level.to_string(),
                log_format: format.to_string(),
            },
            operation_mode: Default::default(),
            modules: vec![],
            ipd_motion: None,
            calibration: Default::default(),
            save: Default::default(),
        }
    }

    #[test]
    fn test_settings_from_app_config() {
        let settings = LogSettings::from_app_config(&app_config("DEBUG", "Json")).unwrap();
        assert_eq!(settings.level, Level::DEBUG);
        assert_eq!(settings.format, LogFormat::Json);

        assert!(LogSettings::from_app_config(&app_config("info", "xml")).is_err());
        assert!(LogSettings::from_app_config(&app_config("loud", "json")).is_err());
    }

    #[test]
    fn test_init_twice_is_ok() {
        let settings = LogSettings::default()
            .with_format(LogFormat::Compact)
            .with_ansi(false);
        assert!(init(settings.clone()).is_ok());
        assert!(init(settings).is_ok());
    }
}
