//! Mapping of a requested RX onto the values a module can realise.
//!
//! The sphere is produced by the focus axis and can be interpolated; the
//! cylinder is a physical lens on the RX wheel, so it snaps to the nearest
//! mounted value. Axis angles snap to the nearest calibrated angle.

use crate::types::RxCombination;
use serde::{Deserialize, Serialize};

/// How a requested value is resolved against a list of supported values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMethod {
    /// Snap to the closest listed value.
    Nearby,
    /// Keep the value, clamped to the listed range.
    LinearInter,
}

/// Per-component mapping methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxMappingMethod {
    /// Sphere method.
    pub sph: MappingMethod,
    /// Cylinder method.
    pub cyl: MappingMethod,
    /// Axis method.
    pub axis: MappingMethod,
}

impl Default for RxMappingMethod {
    fn default() -> Self {
        Self {
            sph: MappingMethod::LinearInter,
            cyl: MappingMethod::Nearby,
            axis: MappingMethod::Nearby,
        }
    }
}

/// Supported sphere/cylinder/axis values; an empty list passes values through.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RxMappingRule {
    /// Realisable sphere powers (D).
    pub sph_list: Vec<f64>,
    /// Cylinder lenses on the RX wheel (D).
    pub cyl_list: Vec<f64>,
    /// Realisable cylinder axes (degrees).
    pub axis_list: Vec<i32>,
    /// How values snap to the lists.
    pub method: RxMappingMethod,
}

impl RxMappingRule {
    /// Resolve a sphere power.
    pub fn sphere(&self, sphere: f64) -> f64 {
        resolve(&self.sph_list, sphere, self.method.sph)
    }

    /// Resolve a cylinder power.
    pub fn cylinder(&self, cylinder: f64) -> f64 {
        resolve(&self.cyl_list, cylinder, self.method.cyl)
    }

    /// Resolve a cylinder axis (degrees).
    pub fn axis(&self, axis: i32) -> i32 {
        let list: Vec<f64> = self.axis_list.iter().map(|a| f64::from(*a)).collect();
        resolve(&list, f64::from(axis), self.method.axis).round() as i32
    }

    /// Resolve every set component of `rx`; unset components stay unset.
    pub fn map(&self, rx: RxCombination) -> RxCombination {
        let unset = RxCombination::UNSET;
        RxCombination {
            sphere: if rx.sphere == unset.sphere {
                rx.sphere
            } else {
                self.sphere(rx.sphere)
            },
            cylinder: if rx.cylinder == unset.cylinder {
                rx.cylinder
            } else {
                self.cylinder(rx.cylinder)
            },
            axis: if rx.axis == unset.axis {
                rx.axis
            } else {
                self.axis(rx.axis)
            },
        }
    }
}

fn resolve(list: &[f64], value: f64, method: MappingMethod) -> f64 {
    if list.is_empty() || !value.is_finite() {
        return value;
    }
    match method {
        MappingMethod::Nearby => list
            .iter()
            .copied()
            .min_by(|a, b| (a - value).abs().total_cmp(&(b - value).abs()))
            .unwrap_or(value),
        MappingMethod::LinearInter => {
            let lo = list.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = list.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            value.clamp(lo, hi)
        }
    }
}

/// Name of the RX wheel slot holding a cylinder lens of `cylinder` diopters.
pub fn cylinder_slot_name(cylinder: f64) -> String {
    format!("{}d", cylinder)
}
