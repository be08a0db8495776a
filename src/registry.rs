//! Host lookup collaborators (spec section 6): the process-wide mapping
//! from `r1..r5`/`a1..a5` to concrete raster/AOI handles. Populated by
//! the caller before `execute`; the evaluator only ever reads them.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{RasterMathError, Result};
use crate::raster::{AoiHandle, RasterHandle};

/// Maps indices `1..=5` to registered raster handles. Slot `0` is
/// reserved for the in-progress result and is never populated here.
///
/// Handles are held behind `Rc` so a `VALUE_RASTER` step can clone a
/// cheap reference into its own operand state during `initialize`
/// rather than borrowing from the registry for the lifetime of `execute`.
#[derive(Default)]
pub struct RasterCorrelator {
    rasters: HashMap<usize, Rc<dyn RasterHandle>>,
}

impl RasterCorrelator {
    pub fn new() -> RasterCorrelator {
        RasterCorrelator {
            rasters: HashMap::new(),
        }
    }

    pub fn register(&mut self, index: usize, handle: Rc<dyn RasterHandle>) {
        assert!((1..=5).contains(&index), "raster slots are numbered 1..=5");
        self.rasters.insert(index, handle);
    }

    pub fn get(&self, index: usize) -> Result<Rc<dyn RasterHandle>> {
        self.rasters
            .get(&index)
            .cloned()
            .ok_or_else(|| RasterMathError::BadReference(format!("r{} is not registered", index)))
    }
}

/// Maps indices `1..=5` to registered AOI mask handles.
#[derive(Default)]
pub struct AoiRegistry {
    aois: HashMap<usize, Rc<dyn AoiHandle>>,
}

impl AoiRegistry {
    pub fn new() -> AoiRegistry {
        AoiRegistry { aois: HashMap::new() }
    }

    pub fn register(&mut self, index: usize, handle: Rc<dyn AoiHandle>) {
        assert!((1..=5).contains(&index), "AOI slots are numbered 1..=5");
        self.aois.insert(index, handle);
    }

    pub fn get(&self, index: usize) -> Result<Rc<dyn AoiHandle>> {
        self.aois
            .get(&index)
            .cloned()
            .ok_or_else(|| RasterMathError::BadReference(format!("a{} is not registered", index)))
    }
}
