//! Run-time configuration for a formula evaluation, grounded on
//! `whitebox-common::configs::Configs`: a small `serde`-derived struct
//! with a `new()` constructor supplying documented defaults and
//! `serde_json`-backed (de)serialization for a host to persist.

use serde_derive::{Deserialize, Serialize};

/// Whether trig step operands/results are interpreted in degrees or
/// radians (spec section 4.5's `toRadians`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AngleMode {
    Degrees,
    Radians,
}

impl AngleMode {
    /// The multiplicative factor applied to/divided out of trig operands.
    pub fn to_radians_factor(&self) -> f64 {
        match self {
            AngleMode::Degrees => std::f64::consts::PI / 180.0,
            AngleMode::Radians => 1.0,
        }
    }
}

/// Where the evaluator's output should be materialized (spec section 5).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingLocation {
    OnDisk,
    InMemory,
    Unspecified,
}

impl ProcessingLocation {
    /// Resolve `Unspecified` using the element-count/memory heuristic of
    /// spec section 5; `OnDisk`/`InMemory` pass through unchanged.
    pub fn resolve(&self, element_count: u64, bytes_per_element: u64, available_memory: u64) -> ProcessingLocation {
        match self {
            ProcessingLocation::Unspecified => {
                if element_count.saturating_mul(bytes_per_element) <= available_memory {
                    ProcessingLocation::InMemory
                } else {
                    ProcessingLocation::OnDisk
                }
            }
            other => *other,
        }
    }
}

/// Options governing a single formula evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalOptions {
    /// If true, an arithmetic guard failure (spec section 4.5) raises
    /// `ComputationError`/`ShapeMismatch` instead of being suppressed.
    pub fail_on_error: bool,
    /// The value substituted for a suppressed guard failure.
    pub default_value: f64,
    pub angle_mode: AngleMode,
    pub processing_location: ProcessingLocation,
}

impl EvalOptions {
    pub fn new() -> EvalOptions {
        EvalOptions {
            fail_on_error: false,
            default_value: 0.0,
            angle_mode: AngleMode::Degrees,
            processing_location: ProcessingLocation::Unspecified,
        }
    }

    /// Serializes these options to pretty-printed JSON, the way a host
    /// persists them to its own `settings.json`.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Parses options back from the text `to_json` produces.
    pub fn from_json(text: &str) -> serde_json::Result<EvalOptions> {
        serde_json::from_str(text)
    }
}

impl Default for EvalOptions {
    fn default() -> EvalOptions {
        EvalOptions::new()
    }
}
