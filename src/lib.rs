//! `raster_math`: a formula compiler and evaluator for band-wise
//! arithmetic, trigonometric, logical, and statistical-reducer
//! expressions over multi-band raster images.
//!
//! A formula like `"r1 + clamp(mean(r2), 0, 100) * a1"` is parsed (C2)
//! into a linearized, postfix [`step`] sequence (C1) via the [`builder`]
//! (C3), held by a [`program::Program`] (C4), and driven by its
//! stack-machine evaluator (C5) — including nested sub-program execution
//! for the seven band-wise reducers (C6) — with throttled progress and
//! cooperative abort (C7) reported through [`progress`].
//!
//! Raster and AOI storage are external collaborators (see [`raster`]):
//! the caller registers concrete handles in a [`registry::RasterCorrelator`]
//! /[`registry::AoiRegistry`] before calling [`evaluate`].

pub mod builder;
pub mod error;
pub mod options;
pub mod parser;
pub mod program;
pub mod progress;
pub mod raster;
pub mod registry;
pub mod step;

pub use error::{RasterMathError, Result};
pub use options::{AngleMode, EvalOptions, ProcessingLocation};
pub use program::Program;
pub use progress::{NullProgressSink, ProgressSink, RasterMathProgress};
pub use raster::{AoiHandle, BoundingBox, EncodingType, MemAoi, MemRaster, RasterAccessor, RasterHandle};
pub use registry::{AoiRegistry, RasterCorrelator};
pub use step::{Shape, StepKind};

use parser::Parser;

/// The three output shapes a formula can produce (spec section 1).
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutput {
    Scalar(f64),
    Signature(Vec<f64>),
    Raster(MemRaster),
}

/// Parses, optimizes, and fully evaluates `formula` against the given
/// registries, returning whichever output kind its inferred shape calls
/// for. `output_encoding` only matters if the result turns out to be a
/// raster.
pub fn evaluate(
    formula: &str,
    correlator: &RasterCorrelator,
    aois: &AoiRegistry,
    output_encoding: EncodingType,
    opts: &EvalOptions,
    progress: &mut RasterMathProgress,
    sink: &mut dyn ProgressSink,
) -> Result<EvalOutput> {
    let mut program = compile(formula, correlator, aois, output_encoding)?;
    program.execute(correlator, aois, opts, progress, sink)?;
    Ok(extract_output(&program))
}

/// Parses and optimizes `formula` into a runnable program without
/// executing it, for callers that want `program.total_work()` to size a
/// [`RasterMathProgress`] before calling `Program::execute` themselves.
pub fn compile(formula: &str, correlator: &RasterCorrelator, aois: &AoiRegistry, output_encoding: EncodingType) -> Result<Program> {
    let mut program = Parser::parse(formula, correlator, aois)?;
    program.optimize();
    builder::finalize_result(&mut program, output_encoding);
    Ok(program)
}

fn extract_output(program: &Program) -> EvalOutput {
    let tail = program.steps().last().expect("a compiled program always has a RESULT_* tail");
    match &tail.kind {
        StepKind::ResultNumber => EvalOutput::Scalar(tail.value),
        StepKind::ResultSignature(values) => EvalOutput::Signature(values.clone()),
        StepKind::ResultRaster(sink) => EvalOutput::Raster(sink.output.clone()),
        _ => unreachable!("Builder::finalize_result always appends a RESULT_* sink"),
    }
}
