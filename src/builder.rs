//! The builder (C3, spec section 4.3): the parser's only way to extend
//! the program under construction. Owns argument-region extraction for
//! band slices and reducer sub-programs, so the parser itself never
//! touches the step list directly.

use crate::error::{RasterMathError, Result};
use crate::raster::{resolve_band_slice, EncodingType};
use crate::registry::{AoiRegistry, RasterCorrelator};
use crate::step::{AoiOperand, BinaryOp, RasterOperand, ReducerKind, ReducerState, Shape, Step, StepKind, UnaryOp};
use crate::program::Program;

pub struct Builder<'a> {
    program: Program,
    correlator: &'a RasterCorrelator,
    aois: &'a AoiRegistry,
}

impl<'a> Builder<'a> {
    pub fn new(correlator: &'a RasterCorrelator, aois: &'a AoiRegistry) -> Builder<'a> {
        Builder { program: Program::new(), correlator, aois }
    }

    pub fn finish(self) -> Program {
        self.program
    }

    pub fn push_int(&mut self, n: i64) {
        self.push_number(n as f64);
    }

    pub fn push_number(&mut self, v: f64) {
        let mut step = Step::new(format!("NUMBER({})", v), StepKind::Number, Shape::SCALAR, 0);
        step.value = v;
        self.program.append(step);
    }

    pub fn push_pi(&mut self) {
        self.push_number(std::f64::consts::PI);
    }

    pub fn push_e(&mut self) {
        self.push_number(std::f64::consts::E);
    }

    pub fn push_unary_op(&mut self, op: UnaryOp) -> Result<()> {
        let shape = self
            .program
            .steps
            .last()
            .ok_or_else(|| RasterMathError::invariant("unary operator has no operand"))?
            .shape;
        self.program.append(Step::new(op.description(), StepKind::Unary(op), shape, 1));
        Ok(())
    }

    pub fn push_binary(&mut self, op: BinaryOp) -> Result<()> {
        let end = self.program.steps.len();
        let rhs_start = single_arg_start(&self.program.steps, end)?;
        let lhs_shape = self.program.steps[rhs_start - 1].shape;
        let rhs_shape = self.program.steps[end - 1].shape;
        let shape = broadcast_shape(lhs_shape, rhs_shape);
        self.program.append(Step::new(op.description(), StepKind::Binary(op), shape, 2));
        Ok(())
    }

    /// `CLAMP(x, lo, hi)`, the grammar's only ternary function.
    pub fn push_ternary(&mut self) -> Result<()> {
        let end = self.program.steps.len();
        let hi_start = single_arg_start(&self.program.steps, end)?;
        let hi_shape = self.program.steps[end - 1].shape;
        let lo_start = single_arg_start(&self.program.steps, hi_start)?;
        let lo_shape = self.program.steps[hi_start - 1].shape;
        let x_shape = self.program.steps[lo_start - 1].shape;
        let shape = broadcast_shape(broadcast_shape(x_shape, lo_shape), hi_shape);
        self.program.append(Step::new("CLAMP", StepKind::Clamp, shape, 3));
        Ok(())
    }

    pub fn push_full_raster(&mut self, rname: &str) -> Result<()> {
        self.push_value_raster(rname, 1, -1)
    }

    /// `r[n]`: the parser pushes three copies of `n` per spec section 4.3's
    /// uniform pop pattern; all three are discarded here.
    pub fn push_raster_index(&mut self, rname: &str) -> Result<()> {
        let values = self.pop_numbers(3)?;
        let n = values[0] as i64;
        self.push_value_raster(rname, n, n)
    }

    /// `r[m:n]`: two distinct literals, `m` pushed before `n`.
    pub fn push_raster_full_slice(&mut self, rname: &str) -> Result<()> {
        let values = self.pop_numbers(2)?;
        let n = values[0] as i64;
        let m = values[1] as i64;
        self.push_value_raster(rname, m, n)
    }

    /// `r[n:]`: two copies of `n`.
    pub fn push_raster_n_to_end_slice(&mut self, rname: &str) -> Result<()> {
        let values = self.pop_numbers(2)?;
        let n = values[0] as i64;
        self.push_value_raster(rname, n, -1)
    }

    /// `r[:n]`: one copy of `n`.
    pub fn push_raster_0_to_n_slice(&mut self, rname: &str) -> Result<()> {
        let values = self.pop_numbers(1)?;
        let n = values[0] as i64;
        self.push_value_raster(rname, 1, n)
    }

    pub fn push_aoi(&mut self, aname: &str) -> Result<()> {
        let index = aoi_index_from_name(aname)?;
        let handle = self.aois.get(index)?;
        let bbox = handle.bounding_box();
        // Uses the bounding box's real extent rather than the source's
        // apparent (1,1,1) shadowing bug (spec section 9, open question
        // 3): the spec's own AOI-masking example in section 8 only
        // produces a spatially-varying result if the mask carries its
        // true shape.
        let shape = Shape::raster(bbox.height(), bbox.width(), 1);
        self.program.append(Step::new(
            format!("VALUE_AOI(a{})", index),
            StepKind::ValueAoi(AoiOperand { aoi_index: index, handle: None, row: 0, col: 0 }),
            shape,
            0,
        ));
        Ok(())
    }

    /// Extracts the reducer's sub-program (the contiguous tail encoding
    /// its single argument) and appends the reducer in its place.
    ///
    /// An argument with real spatial extent (a raster) reduces per band,
    /// producing a per-band signature when it spans more than one band.
    /// An argument with no spatial extent (itself a scalar or a
    /// signature) has nothing to fold over per band, so the reduction
    /// collapses across the band values themselves into a single scalar,
    /// regardless of how many bands it carries.
    pub fn push_stat(&mut self, kind: ReducerKind) -> Result<()> {
        let end = self.program.steps.len();
        let start = single_arg_start(&self.program.steps, end)?;
        let sub_steps = self.program.steps.split_off(start);
        let sub_program = Program::from_steps(sub_steps);
        let sub_shape = sub_program.shape();
        let shape = if sub_shape.is_raster() && sub_shape.bands > 1 {
            Shape::signature(sub_shape.bands)
        } else {
            Shape::SCALAR
        };
        let reducer = ReducerState::new(kind, sub_program);
        self.program.append(Step::new(kind.description(), StepKind::Reducer(reducer), shape, 0));
        Ok(())
    }

    fn push_value_raster(&mut self, rname: &str, min_1based: i64, max_1based: i64) -> Result<()> {
        let index = raster_index_from_name(rname)?;
        let handle = self.correlator.get(index)?;
        let (min_band, max_band) = resolve_band_slice(handle.band_count(), min_1based, max_1based)?;
        let shape = Shape::raster(handle.row_count(), handle.column_count(), max_band - min_band + 1);
        self.program.append(Step::new(
            format!("VALUE_RASTER(r{}, {}..{})", index, min_band, max_band),
            StepKind::ValueRaster(RasterOperand { raster_index: index, min_band, max_band, accessor: None }),
            shape,
            0,
        ));
        Ok(())
    }

    fn pop_numbers(&mut self, count: usize) -> Result<Vec<f64>> {
        if self.program.steps.len() < count {
            return Err(RasterMathError::invariant("not enough NUMBER steps to pop for a raster subscript"));
        }
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let step = self.program.steps.pop().unwrap();
            match step.kind {
                StepKind::Number => values.push(step.value),
                _ => return Err(RasterMathError::invariant("expected a NUMBER step while resolving a raster subscript")),
            }
        }
        Ok(values)
    }
}

/// Appends the `RESULT_*` sink matching `program`'s inferred tail shape
/// (the C3 responsibility the spec calls `addResultStep`). `output_encoding`
/// only matters when the result turns out to be a raster.
pub fn finalize_result(program: &mut Program, output_encoding: EncodingType) {
    let shape = program.shape();
    let sink_step = if shape.is_scalar() {
        Step::new("RESULT_NUMBER", StepKind::ResultNumber, shape, 1)
    } else if shape.is_signature() {
        Step::new("RESULT_SIGNATURE", StepKind::ResultSignature(Vec::with_capacity(shape.bands)), shape, 1)
    } else {
        Step::new(
            "RESULT_RASTER",
            StepKind::ResultRaster(crate::step::RasterSink::new(shape.rows, shape.cols, shape.bands, output_encoding)),
            shape,
            1,
        )
    };
    program.append(sink_step);
}

/// Prefers a raster operand's shape over a signature's over a scalar's,
/// matching the worked examples of spec section 8 (`r1 + 1` takes `r1`'s
/// shape; `r1 + r2` takes either, since both already agree).
fn broadcast_shape(a: Shape, b: Shape) -> Shape {
    if a.is_raster() {
        a
    } else if b.is_raster() {
        b
    } else if a.is_signature() {
        a
    } else if b.is_signature() {
        b
    } else {
        Shape::SCALAR
    }
}

/// Walks backward from `end` to find the start of the single trailing
/// argument region: a running `pending` counter starts at `1` (one
/// argument owed), is decremented for each step visited, and is
/// incremented by that step's own `arg_count` (spec section 4.3).
pub fn single_arg_start(steps: &[Step], end: usize) -> Result<usize> {
    if end == 0 {
        return Err(RasterMathError::invariant("no steps available for argument extraction"));
    }
    let mut pending: i64 = 1;
    let mut i = end;
    while pending > 0 {
        if i == 0 {
            return Err(RasterMathError::invariant("argument region runs past the start of the program"));
        }
        i -= 1;
        pending -= 1;
        pending += steps[i].arg_count as i64;
    }
    Ok(i)
}

fn raster_index_from_name(name: &str) -> Result<usize> {
    name.strip_prefix('r')
        .and_then(|d| d.parse::<usize>().ok())
        .filter(|i| (1..=5).contains(i))
        .ok_or_else(|| RasterMathError::BadReference(format!("'{}' is not a valid raster name", name)))
}

fn aoi_index_from_name(name: &str) -> Result<usize> {
    name.strip_prefix('a')
        .and_then(|d| d.parse::<usize>().ok())
        .filter(|i| (1..=5).contains(i))
        .ok_or_else(|| RasterMathError::BadReference(format!("'{}' is not a valid AOI name", name)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::raster::MemRaster;
    use std::rc::Rc;

    fn registered_correlator() -> RasterCorrelator {
        let mut reg = RasterCorrelator::new();
        reg.register(1, Rc::new(MemRaster::new(3, 4, 5, EncodingType::Flt8Bytes)));
        reg
    }

    #[test]
    fn test_push_full_raster_spans_all_bands() {
        let correlator = registered_correlator();
        let aois = AoiRegistry::new();
        let mut b = Builder::new(&correlator, &aois);
        b.push_full_raster("r1").unwrap();
        let program = b.finish();
        assert_eq!(program.shape(), Shape::raster(3, 4, 5));
    }

    #[test]
    fn test_push_raster_index_discards_three_numbers() {
        let correlator = registered_correlator();
        let aois = AoiRegistry::new();
        let mut b = Builder::new(&correlator, &aois);
        b.push_int(2);
        b.push_int(2);
        b.push_int(2);
        b.push_raster_index("r1").unwrap();
        let program = b.finish();
        assert_eq!(program.steps().len(), 1);
        assert_eq!(program.shape(), Shape::raster(3, 4, 1));
    }

    #[test]
    fn test_push_raster_full_slice() {
        let correlator = registered_correlator();
        let aois = AoiRegistry::new();
        let mut b = Builder::new(&correlator, &aois);
        b.push_int(2);
        b.push_int(4);
        b.push_raster_full_slice("r1").unwrap();
        let program = b.finish();
        assert_eq!(program.shape(), Shape::raster(3, 4, 3));
    }

    #[test]
    fn test_push_binary_broadcasts_raster_shape() {
        let correlator = registered_correlator();
        let aois = AoiRegistry::new();
        let mut b = Builder::new(&correlator, &aois);
        b.push_full_raster("r1").unwrap();
        b.push_number(1.0);
        b.push_binary(BinaryOp::Add).unwrap();
        let program = b.finish();
        assert_eq!(program.shape(), Shape::raster(3, 4, 5));
    }

    #[test]
    fn test_push_stat_extracts_sub_program() {
        let correlator = registered_correlator();
        let aois = AoiRegistry::new();
        let mut b = Builder::new(&correlator, &aois);
        b.push_full_raster("r1").unwrap();
        b.push_stat(ReducerKind::Sum).unwrap();
        let program = b.finish();
        assert_eq!(program.steps().len(), 1);
        assert_eq!(program.shape(), Shape::signature(5));
    }

    #[test]
    fn test_single_arg_start_walks_back_nested_expression() {
        let correlator = registered_correlator();
        let aois = AoiRegistry::new();
        let mut b = Builder::new(&correlator, &aois);
        b.push_number(1.0);
        b.push_number(2.0);
        b.push_binary(BinaryOp::Add).unwrap();
        b.push_number(3.0);
        b.push_binary(BinaryOp::Multiply).unwrap();
        let program = b.finish();
        // steps: NUMBER(1), NUMBER(2), ADD, NUMBER(3), MULTIPLY
        assert_eq!(single_arg_start(program.steps(), 4).unwrap(), 3);
    }
}
