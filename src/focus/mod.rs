//! Through-focus search: VID mapping, sharpness metrics, peak fitting and the
//! two-phase search engine.

pub mod engine;
pub mod fit;
pub mod mapping;
pub mod metric;

pub use engine::{FocusBench, FocusPeak, ThroughFocusCurves, ThroughFocusEngine, ThroughFocusRun};
pub use mapping::FocusCurve;
pub use metric::{MtfMetric, SharpnessMetric};
