//! The program (C4) and stack-machine evaluator (C5/C6), spec sections
//! 4.4 through 4.6. `Program` owns the ordered, postfix step sequence;
//! its `execute` method drives the 3-D band/row/column iteration space,
//! delegating to `compute_pixel` for each cell and to `run_reducer`
//! whenever a band-wise reducer is first encountered.

use std::collections::VecDeque;

use crate::error::{RasterMathError, Result};
use crate::options::EvalOptions;
use crate::progress::{ProgressSink, RasterMathProgress};
use crate::registry::{AoiRegistry, RasterCorrelator};
use crate::step::{ReducerKind, ReducerState, Shape, Step, StepKind};

/// The ordered, postfix sequence of steps a parsed formula compiles to.
pub struct Program {
    pub(crate) steps: Vec<Step>,
}

enum StepOutcome {
    Ok,
    /// A guard failed and `fail_on_error` is false: the pixel's result
    /// has already been forced to `default_value` (spec section 4.5).
    Suppressed,
}

impl Program {
    pub fn new() -> Program {
        Program { steps: Vec::new() }
    }

    pub fn from_steps(steps: Vec<Step>) -> Program {
        Program { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn append(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn tail(&self) -> Option<&Step> {
        self.steps.last()
    }

    /// The shape of the program's tail step, i.e. its overall result shape.
    pub fn shape(&self) -> Shape {
        self.steps.last().map(|s| s.shape).unwrap_or(Shape::SCALAR)
    }

    /// `bands * rows * cols * len(steps) + sum(step.one_time_work())`
    /// (spec section 4.4). Reducers contribute their sub-program's own
    /// full sweep as one-time work rather than per-outer-pixel work.
    pub fn total_work(&self) -> u64 {
        let shape = self.shape();
        let n = self.steps.len() as u64;
        let base = shape.cell_count() * n;
        let one_time: u64 = self.steps.iter().map(|s| s.one_time_work()).sum();
        base + one_time
    }

    /// Structural equality used to compare two reducers' sub-programs
    /// step-for-step (spec section 3).
    pub fn identity_eq(&self, other: &Program) -> bool {
        self.steps.len() == other.steps.len()
            && self.steps.iter().zip(other.steps.iter()).all(|(a, b)| a.identity_eq(b))
    }

    /// Common-subexpression folding (spec section 4.4): an `O(n^2)`
    /// pairwise scan restricted to `VALUE_RASTER` and the seven
    /// reducers. Any step identical to an earlier one is rewritten into
    /// a `REFERENCE` to that earlier step.
    pub fn optimize(&mut self) {
        let n = self.steps.len();
        for i in 0..n {
            if !self.steps[i].is_cse_eligible() {
                continue;
            }
            let mut earlier: Option<usize> = None;
            for j in 0..i {
                if self.steps[j].is_cse_eligible() && self.steps[i].identity_eq(&self.steps[j]) {
                    earlier = Some(j);
                    break;
                }
            }
            if let Some(j) = earlier {
                self.steps[i].kind = StepKind::Reference(j);
            }
        }
    }

    /// Opens raster/AOI accessors and primes every step's cached value
    /// from `(band 0, row 0, col 0)` (spec section 4.4).
    pub fn initialize(&mut self, correlator: &RasterCorrelator, aois: &AoiRegistry) -> Result<()> {
        for step in &mut self.steps {
            match &mut step.kind {
                StepKind::ValueRaster(op) => {
                    let handle = correlator.get(op.raster_index)?;
                    let accessor = handle.open_accessor(op.min_band, op.max_band);
                    step.value = accessor.value();
                    op.accessor = Some(accessor);
                }
                StepKind::ValueAoi(op) => {
                    let handle = aois.get(op.aoi_index)?;
                    let bbox = handle.bounding_box();
                    op.row = 0;
                    op.col = 0;
                    step.value = if handle.get_pixel(bbox.x1, bbox.y1) { 1.0 } else { 0.0 };
                    op.handle = Some(handle);
                }
                StepKind::ResultSignature(values) => values.clear(),
                StepKind::Reducer(r) => {
                    r.sub_program.initialize(correlator, aois)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Drives the outer 3-D iteration space (spec section 4.4), writing
    /// into whichever `RESULT_*` sink the program's tail step owns.
    pub fn execute(
        &mut self,
        correlator: &RasterCorrelator,
        aois: &AoiRegistry,
        opts: &EvalOptions,
        progress: &mut RasterMathProgress,
        sink: &mut dyn ProgressSink,
    ) -> Result<()> {
        self.initialize(correlator, aois)?;
        let shape = self.shape();
        let steps_len = self.steps.len() as u64;
        let bands = shape.bands.max(1);
        let rows = shape.rows.max(1);
        let cols = shape.cols.max(1);
        for _band in 0..bands {
            for _row in 0..rows {
                for _col in 0..cols {
                    self.compute_pixel(opts)?;
                }
                self.next_row();
                let aborted = progress.add_work_completed(cols as u64 * steps_len, sink);
                if aborted {
                    return Err(RasterMathError::Aborted);
                }
            }
            self.next_band();
        }
        Ok(())
    }

    /// Evaluates one pixel's worth of steps, honoring the suppressed-
    /// error short-circuit of spec section 4.5, and returns the final
    /// stack top. The outer program's tail is normally a `RESULT_*`
    /// sink (whose side effect is what matters); a reducer's
    /// sub-program has no such sink, so its tail value is exactly the
    /// number this call should return.
    fn compute_pixel(&mut self, opts: &EvalOptions) -> Result<f64> {
        let n = self.steps.len();
        if n == 0 {
            return Err(RasterMathError::invariant("cannot evaluate an empty program"));
        }
        let mut stack: Vec<f64> = Vec::with_capacity(n);
        let mut i = 0;
        while i < n {
            match self.eval_step(i, &mut stack, opts)? {
                StepOutcome::Ok => i += 1,
                StepOutcome::Suppressed => {
                    stack.clear();
                    stack.push(opts.default_value);
                    if i == n - 1 {
                        break;
                    }
                    i = n - 1;
                }
            }
        }
        stack
            .last()
            .copied()
            .ok_or_else(|| RasterMathError::invariant("stack underflow at the end of a pixel evaluation"))
    }

    fn eval_step(&mut self, i: usize, stack: &mut Vec<f64>, opts: &EvalOptions) -> Result<StepOutcome> {
        if let StepKind::Reference(target) = self.steps[i].kind {
            stack.push(self.steps[target].value);
            return Ok(StepOutcome::Ok);
        }
        if matches!(self.steps[i].kind, StepKind::Reducer(_)) {
            self.run_reducer(i, opts)?;
            stack.push(self.steps[i].value);
            return Ok(StepOutcome::Ok);
        }

        let to_radians = opts.angle_mode.to_radians_factor();
        let step = &mut self.steps[i];
        match &mut step.kind {
            StepKind::Number | StepKind::ComputedSignature(_) => {
                stack.push(step.value);
            }
            StepKind::ValueAoi(op) => {
                stack.push(step.value);
                op.col += 1;
                if let Some(handle) = &op.handle {
                    let bbox = handle.bounding_box();
                    if op.col < bbox.width() {
                        step.value = if handle.get_pixel(bbox.x1 + op.col, bbox.y1 + op.row) { 1.0 } else { 0.0 };
                    }
                }
            }
            StepKind::ValueRaster(op) => {
                let accessor = op
                    .accessor
                    .as_mut()
                    .ok_or_else(|| RasterMathError::invariant("raster accessor not initialized"))?;
                if !accessor.is_valid() {
                    if opts.fail_on_error {
                        return Err(RasterMathError::ShapeMismatch(format!(
                            "accessor for r{} is exhausted mid-iteration",
                            op.raster_index
                        )));
                    }
                    return Ok(StepOutcome::Suppressed);
                }
                stack.push(step.value);
                if accessor.next_column() {
                    step.value = accessor.value();
                }
            }
            StepKind::Unary(op) => {
                let v1 = pop1(stack)?;
                match apply_unary(*op, v1, to_radians) {
                    Ok(result) => {
                        stack.push(result);
                        step.value = result;
                    }
                    Err(e) => {
                        if opts.fail_on_error {
                            return Err(e);
                        }
                        return Ok(StepOutcome::Suppressed);
                    }
                }
            }
            StepKind::Binary(op) => {
                let v1 = pop1(stack)?;
                let v2 = pop1(stack)?;
                match apply_binary(*op, v2, v1, to_radians) {
                    Ok(result) => {
                        stack.push(result);
                        step.value = result;
                    }
                    Err(e) => {
                        if opts.fail_on_error {
                            return Err(e);
                        }
                        return Ok(StepOutcome::Suppressed);
                    }
                }
            }
            StepKind::Clamp => {
                let hi = pop1(stack)?;
                let lo = pop1(stack)?;
                let x = pop1(stack)?;
                let result = lo.max(x.min(hi));
                stack.push(result);
                step.value = result;
            }
            StepKind::ResultNumber => {
                let v = pop1(stack)?;
                step.value = v;
            }
            StepKind::ResultSignature(values) => {
                let v = pop1(stack)?;
                values.push(v);
                step.value = v;
            }
            StepKind::ResultRaster(raster_sink) => {
                let v = pop1(stack)?;
                raster_sink.write(v);
                raster_sink.next_column();
                step.value = v;
            }
            StepKind::Reference(_) | StepKind::Reducer(_) => unreachable!("handled above"),
        }
        Ok(StepOutcome::Ok)
    }

    fn next_row(&mut self) {
        for step in &mut self.steps {
            match &mut step.kind {
                StepKind::ValueRaster(op) => {
                    if let Some(acc) = &mut op.accessor {
                        if acc.next_row() {
                            step.value = acc.value();
                        }
                    }
                }
                StepKind::ValueAoi(op) => {
                    op.row += 1;
                    op.col = 0;
                    if let Some(handle) = &op.handle {
                        let bbox = handle.bounding_box();
                        if op.row < bbox.height() {
                            step.value = if handle.get_pixel(bbox.x1, bbox.y1 + op.row) { 1.0 } else { 0.0 };
                        }
                    }
                }
                StepKind::ResultRaster(sink) => {
                    sink.next_row();
                }
                _ => {}
            }
        }
    }

    fn next_band(&mut self) {
        for step in &mut self.steps {
            match &mut step.kind {
                StepKind::ValueRaster(op) => {
                    if let Some(acc) = &mut op.accessor {
                        if acc.next_band() {
                            step.value = acc.value();
                        }
                    }
                }
                StepKind::ValueAoi(op) => {
                    op.row = 0;
                    op.col = 0;
                    if let Some(handle) = &op.handle {
                        let bbox = handle.bounding_box();
                        step.value = if handle.get_pixel(bbox.x1, bbox.y1) { 1.0 } else { 0.0 };
                    }
                }
                StepKind::ResultRaster(sink) => {
                    sink.next_band();
                }
                StepKind::ComputedSignature(queue) => {
                    if let Some(v) = queue.pop_front() {
                        step.value = v;
                    }
                }
                _ => {}
            }
        }
    }

    /// Drives a reducer's sub-program to completion (C6, spec section
    /// 4.6) the first time that reducer step is encountered, converting
    /// it in place into a `COMPUTED_SIGNATURE` (or a plain scalar
    /// `NUMBER` when its argument spans a single band).
    ///
    /// An argument with real spatial extent (a raster) is reduced one
    /// band at a time, each band contributing its own accumulator triple
    /// and its own queue entry. An argument with no spatial extent
    /// (itself a scalar or a signature) has no per-band spatial fold to
    /// perform, so every one of its band values is folded into a single
    /// running accumulator instead, collapsing the result to one scalar.
    fn run_reducer(&mut self, idx: usize, opts: &EvalOptions) -> Result<()> {
        let ReducerState { kind, mut sub_program, .. } =
            match std::mem::replace(&mut self.steps[idx].kind, StepKind::Number) {
                StepKind::Reducer(r) => r,
                other => {
                    self.steps[idx].kind = other;
                    return Err(RasterMathError::invariant("expected a reducer step"));
                }
            };

        let sub_shape = sub_program.shape();
        let bands = sub_shape.bands.max(1);
        let rows = sub_shape.rows.max(1);
        let cols = sub_shape.cols.max(1);

        if !sub_shape.is_raster() {
            let mut a1 = kind.initial_a1();
            let mut a2 = 0.0_f64;
            let mut a3 = 0.0_f64;
            for _band in 0..bands {
                for _row in 0..rows {
                    for _col in 0..cols {
                        let value = sub_program.compute_pixel(opts)?;
                        fold_into_accumulator(kind, &mut a1, &mut a2, &mut a3, value, opts)?;
                    }
                    sub_program.next_row();
                }
                sub_program.next_band();
            }
            self.steps[idx].value = finalize_accumulator(kind, a1, a2, a3, opts.default_value);
            self.steps[idx].kind = StepKind::Number;
            return Ok(());
        }

        let mut queue: VecDeque<f64> = VecDeque::with_capacity(bands);
        for _band in 0..bands {
            let mut a1 = kind.initial_a1();
            let mut a2 = 0.0_f64;
            let mut a3 = 0.0_f64;
            for _row in 0..rows {
                for _col in 0..cols {
                    let value = sub_program.compute_pixel(opts)?;
                    fold_into_accumulator(kind, &mut a1, &mut a2, &mut a3, value, opts)?;
                }
                sub_program.next_row();
            }
            queue.push_back(finalize_accumulator(kind, a1, a2, a3, opts.default_value));
            sub_program.next_band();
        }

        if queue.len() > 1 {
            let first = queue.pop_front().unwrap_or(opts.default_value);
            self.steps[idx].value = first;
            self.steps[idx].kind = StepKind::ComputedSignature(queue);
        } else {
            let only = queue.pop_front().unwrap_or(opts.default_value);
            self.steps[idx].value = only;
            self.steps[idx].kind = StepKind::Number;
        }
        Ok(())
    }
}

impl Default for Program {
    fn default() -> Program {
        Program::new()
    }
}

fn pop1(stack: &mut Vec<f64>) -> Result<f64> {
    stack
        .pop()
        .ok_or_else(|| RasterMathError::invariant("stack underflow during pixel evaluation"))
}

/// Fold one sub-program pixel's value into a reducer's accumulators
/// (spec section 4.6). A suppressed guard failure (e.g. `HARMEAN` of a
/// zero) simply contributes nothing for this pixel rather than forcing
/// a substitute value back through the same guard.
fn fold_into_accumulator(kind: ReducerKind, a1: &mut f64, a2: &mut f64, a3: &mut f64, value: f64, opts: &EvalOptions) -> Result<()> {
    use ReducerKind::*;
    match kind {
        Min => *a1 = a1.min(value),
        Max => *a1 = a1.max(value),
        Sum => *a1 += value,
        Mean => {
            *a1 += value;
            *a2 += 1.0;
        }
        Geomean => {
            *a1 *= value;
            *a2 += 1.0;
        }
        Harmean => {
            if value == 0.0 {
                if opts.fail_on_error {
                    return Err(RasterMathError::ComputationError("harmean of a zero value".to_string()));
                }
            } else {
                *a1 += 1.0 / value;
                *a2 += 1.0;
            }
        }
        Stddev => {
            *a1 += value;
            *a2 += value * value;
            *a3 += 1.0;
        }
    }
    Ok(())
}

fn finalize_accumulator(kind: ReducerKind, a1: f64, a2: f64, a3: f64, default_value: f64) -> f64 {
    use ReducerKind::*;
    match kind {
        Min | Max | Sum => a1,
        Mean => if a2 == 0.0 { default_value } else { a1 / a2 },
        // Reproduces the source's geometric-mean bug rather than a true
        // geometric mean (spec section 9, open question 1): the
        // accumulator is seeded at 0.0 and combined with `*=`, so `a1`
        // never leaves zero, and the finalization divides as if for an
        // arithmetic mean.
        Geomean => if a2 == 0.0 { default_value } else { a1 / a2 },
        Harmean => if a1 == 0.0 || a2 == 0.0 { default_value } else { 1.0 / (a1 / a2) },
        Stddev => {
            if a3 <= 1.0 {
                default_value
            } else {
                ((a3 * a2 - a1 * a1).abs() / a3 / (a3 - 1.0)).sqrt()
            }
        }
    }
}

fn apply_unary(op: crate::step::UnaryOp, v1: f64, to_radians: f64) -> Result<f64> {
    use crate::step::UnaryOp::*;
    Ok(match op {
        Negate => -v1,
        Abs => v1.abs(),
        Sqrt => {
            if v1 < 0.0 {
                return Err(RasterMathError::ComputationError("sqrt of a negative number".to_string()));
            }
            v1.sqrt()
        }
        Acos => {
            if v1.abs() > 1.0 {
                return Err(RasterMathError::ComputationError("acos outside [-1, 1]".to_string()));
            }
            v1.acos() / to_radians
        }
        Cos => (v1 * to_radians).cos(),
        Asin => {
            if v1.abs() > 1.0 {
                return Err(RasterMathError::ComputationError("asin outside [-1, 1]".to_string()));
            }
            v1.asin() / to_radians
        }
        Sin => (v1 * to_radians).sin(),
        Atan => {
            // The zero guard is preserved as-observed even though
            // atan(0) is mathematically safe (spec section 9, open
            // question 2); consult before relaxing it.
            if v1 == 0.0 {
                return Err(RasterMathError::ComputationError("atan of zero".to_string()));
            }
            v1.atan() / to_radians
        }
        Tan => (v1 * to_radians).tan(),
        Cosh => v1.cosh(),
        Sinh => v1.sinh(),
        Tanh => v1.tanh(),
        Exp => v1.exp(),
        Log10 => {
            if v1 <= 0.0 {
                return Err(RasterMathError::ComputationError("log10 of a non-positive number".to_string()));
            }
            v1.log10()
        }
        Log2 => {
            if v1 <= 0.0 {
                return Err(RasterMathError::ComputationError("log2 of a non-positive number".to_string()));
            }
            v1.log2()
        }
        Log => {
            if v1 <= 0.0 {
                return Err(RasterMathError::ComputationError("log of a non-positive number".to_string()));
            }
            v1.ln()
        }
        Not => if v1 != 0.0 { 0.0 } else { 1.0 },
    })
}

/// `v2` is the operand pushed first (TOS-1); `v1` is the operand pushed
/// second (TOS) — see spec section 4.5's table.
fn apply_binary(op: crate::step::BinaryOp, v2: f64, v1: f64, to_radians: f64) -> Result<f64> {
    use crate::step::BinaryOp::*;
    Ok(match op {
        Add => v2 + v1,
        Subtract => v2 - v1,
        Multiply => v2 * v1,
        Divide => {
            if v1 == 0.0 {
                return Err(RasterMathError::ComputationError("division by zero".to_string()));
            }
            v2 / v1
        }
        Modulo => {
            if v1 == 0.0 {
                return Err(RasterMathError::ComputationError("modulo by zero".to_string()));
            }
            v2 % v1
        }
        Exponentiate => {
            if v1 == 0.0 && v2 == 0.0 {
                return Err(RasterMathError::ComputationError("0 raised to the 0".to_string()));
            }
            v2.powf(v1)
        }
        Atan2 => {
            if v1 == 0.0 && v2 == 0.0 {
                return Err(RasterMathError::ComputationError("atan2 of (0, 0)".to_string()));
            }
            v2.atan2(v1) / to_radians
        }
        Logn => {
            if v2 <= 0.0 || v1 <= 0.0 {
                return Err(RasterMathError::ComputationError("logn of a non-positive base or value".to_string()));
            }
            v1.log10() / v2.log10()
        }
        Equals => if v2 == v1 { 1.0 } else { 0.0 },
        NotEquals => if v2 != v1 { 1.0 } else { 0.0 },
        LessThan => if v2 < v1 { 1.0 } else { 0.0 },
        GreaterThan => if v2 > v1 { 1.0 } else { 0.0 },
        LessOrEqual => if v2 <= v1 { 1.0 } else { 0.0 },
        GreaterOrEqual => if v2 >= v1 { 1.0 } else { 0.0 },
        And => if v2 != 0.0 && v1 != 0.0 { 1.0 } else { 0.0 },
        Or => if v2 != 0.0 || v1 != 0.0 { 1.0 } else { 0.0 },
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::AngleMode;
    use crate::raster::{BoundingBox, EncodingType, MemAoi, MemRaster};
    use crate::registry::{AoiRegistry, RasterCorrelator};
    use crate::step::{RasterOperand, RasterSink, UnaryOp};
    use std::rc::Rc;

    fn scalar_number(v: f64) -> Step {
        let mut s = Step::new(format!("NUMBER({})", v), StepKind::Number, Shape::SCALAR, 0);
        s.value = v;
        s
    }

    fn result_number_program(steps: Vec<Step>) -> Program {
        let mut program = Program::from_steps(steps);
        program.append(Step::new("RESULT_NUMBER", StepKind::ResultNumber, Shape::SCALAR, 1));
        program
    }

    fn run_scalar(program: &mut Program, opts: &EvalOptions) -> f64 {
        let correlator = RasterCorrelator::new();
        let aois = AoiRegistry::new();
        let mut progress = RasterMathProgress::new(program.total_work());
        let mut sink = crate::progress::NullProgressSink;
        program.execute(&correlator, &aois, opts, &mut progress, &mut sink).unwrap();
        match &program.steps.last().unwrap().kind {
            StepKind::ResultNumber => program.steps.last().unwrap().value,
            _ => panic!("expected a RESULT_NUMBER tail"),
        }
    }

    #[test]
    fn test_add_two_numbers() {
        let mut program = result_number_program(vec![
            scalar_number(1.0),
            scalar_number(2.0),
            Step::new("ADD", StepKind::Binary(crate::step::BinaryOp::Add), Shape::SCALAR, 2),
        ]);
        let opts = EvalOptions::new();
        assert_eq!(run_scalar(&mut program, &opts), 3.0);
    }

    #[test]
    fn test_division_by_zero_is_suppressed_to_default() {
        let mut program = result_number_program(vec![
            scalar_number(1.0),
            scalar_number(0.0),
            Step::new("DIVIDE", StepKind::Binary(crate::step::BinaryOp::Divide), Shape::SCALAR, 2),
        ]);
        let opts = EvalOptions::new();
        assert_eq!(run_scalar(&mut program, &opts), 0.0);
    }

    #[test]
    fn test_division_by_zero_fails_when_fail_on_error() {
        let mut program = result_number_program(vec![
            scalar_number(1.0),
            scalar_number(0.0),
            Step::new("DIVIDE", StepKind::Binary(crate::step::BinaryOp::Divide), Shape::SCALAR, 2),
        ]);
        let mut opts = EvalOptions::new();
        opts.fail_on_error = true;
        let correlator = RasterCorrelator::new();
        let aois = AoiRegistry::new();
        let mut progress = RasterMathProgress::new(program.total_work());
        let mut sink = crate::progress::NullProgressSink;
        let result = program.execute(&correlator, &aois, &opts, &mut progress, &mut sink);
        assert!(matches!(result, Err(RasterMathError::ComputationError(_))));
    }

    #[test]
    fn test_clamp() {
        let mut program = result_number_program(vec![
            scalar_number(5.0),
            scalar_number(0.0),
            scalar_number(3.0),
            Step::new("CLAMP", StepKind::Clamp, Shape::SCALAR, 3),
        ]);
        let opts = EvalOptions::new();
        assert_eq!(run_scalar(&mut program, &opts), 3.0);
    }

    #[test]
    fn test_degrees_sin_30() {
        let mut program = result_number_program(vec![
            scalar_number(30.0),
            Step::new("SIN", StepKind::Unary(UnaryOp::Sin), Shape::SCALAR, 1),
        ]);
        let mut opts = EvalOptions::new();
        opts.angle_mode = AngleMode::Degrees;
        assert!((run_scalar(&mut program, &opts) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_radians_acos_one_is_zero() {
        let mut program = result_number_program(vec![
            scalar_number(1.0),
            Step::new("ACOS", StepKind::Unary(UnaryOp::Acos), Shape::SCALAR, 1),
        ]);
        let mut opts = EvalOptions::new();
        opts.angle_mode = AngleMode::Radians;
        assert!((run_scalar(&mut program, &opts) - 0.0).abs() < 1e-12);
    }

    fn raster_program_with(rows: usize, cols: usize, bands: usize, raster: MemRaster, correlator: &mut RasterCorrelator, steps: Vec<Step>) -> Program {
        correlator.register(1, Rc::new(raster));
        let mut program = Program::from_steps(steps);
        program.append(Step::new(
            "RESULT_RASTER",
            StepKind::ResultRaster(RasterSink::new(rows, cols, bands, EncodingType::Flt8Bytes)),
            Shape::raster(rows, cols, bands),
            1,
        ));
        program
    }

    #[test]
    fn test_raster_plus_raster() {
        let mut correlator = RasterCorrelator::new();
        let r1 = MemRaster::from_bands(2, 2, EncodingType::Flt8Bytes, vec![vec![1.0, 2.0, 3.0, 4.0]]);
        let r2 = MemRaster::from_bands(2, 2, EncodingType::Flt8Bytes, vec![vec![10.0, 20.0, 30.0, 40.0]]);
        correlator.register(1, Rc::new(r1));
        correlator.register(2, Rc::new(r2));
        let mut program = Program::from_steps(vec![
            Step::new(
                "VALUE_RASTER(r1)",
                StepKind::ValueRaster(RasterOperand { raster_index: 1, min_band: 0, max_band: 0, accessor: None }),
                Shape::raster(2, 2, 1),
                0,
            ),
            Step::new(
                "VALUE_RASTER(r2)",
                StepKind::ValueRaster(RasterOperand { raster_index: 2, min_band: 0, max_band: 0, accessor: None }),
                Shape::raster(2, 2, 1),
                0,
            ),
            Step::new("ADD", StepKind::Binary(crate::step::BinaryOp::Add), Shape::raster(2, 2, 1), 2),
        ]);
        program.append(Step::new(
            "RESULT_RASTER",
            StepKind::ResultRaster(RasterSink::new(2, 2, 1, EncodingType::Flt8Bytes)),
            Shape::raster(2, 2, 1),
            1,
        ));
        let aois = AoiRegistry::new();
        let opts = EvalOptions::new();
        let mut progress = RasterMathProgress::new(program.total_work());
        let mut sink = crate::progress::NullProgressSink;
        program.execute(&correlator, &aois, &opts, &mut progress, &mut sink).unwrap();
        let out = match &program.steps.last().unwrap().kind {
            StepKind::ResultRaster(rs) => rs.output.clone(),
            _ => panic!("expected RESULT_RASTER"),
        };
        assert_eq!(out.get(0, 0, 0), 11.0);
        assert_eq!(out.get(0, 0, 1), 22.0);
        assert_eq!(out.get(0, 1, 0), 33.0);
        assert_eq!(out.get(0, 1, 1), 44.0);
        let _ = raster_program_with; // silence unused helper in some cfgs
    }

    #[test]
    fn test_aoi_masking() {
        let mut correlator = RasterCorrelator::new();
        let r1 = MemRaster::from_bands(2, 2, EncodingType::Flt8Bytes, vec![vec![1.0, 2.0, 3.0, 4.0]]);
        correlator.register(1, Rc::new(r1));
        let mut aois = AoiRegistry::new();
        let mut aoi = MemAoi::new(BoundingBox::new(0, 0, 1, 1));
        aoi.set(0, 0, true);
        aois.register(1, Rc::new(aoi));

        let mut program = Program::from_steps(vec![
            Step::new(
                "VALUE_RASTER(r1)",
                StepKind::ValueRaster(RasterOperand { raster_index: 1, min_band: 0, max_band: 0, accessor: None }),
                Shape::raster(2, 2, 1),
                0,
            ),
            Step::new(
                "VALUE_AOI(a1)",
                StepKind::ValueAoi(crate::step::AoiOperand { aoi_index: 1, handle: None, row: 0, col: 0 }),
                Shape::raster(2, 2, 1),
                0,
            ),
            Step::new("MULTIPLY", StepKind::Binary(crate::step::BinaryOp::Multiply), Shape::raster(2, 2, 1), 2),
        ]);
        program.append(Step::new(
            "RESULT_RASTER",
            StepKind::ResultRaster(RasterSink::new(2, 2, 1, EncodingType::Flt8Bytes)),
            Shape::raster(2, 2, 1),
            1,
        ));
        let opts = EvalOptions::new();
        let mut progress = RasterMathProgress::new(program.total_work());
        let mut sink = crate::progress::NullProgressSink;
        program.execute(&correlator, &aois, &opts, &mut progress, &mut sink).unwrap();
        let out = match &program.steps.last().unwrap().kind {
            StepKind::ResultRaster(rs) => rs.output.clone(),
            _ => panic!("expected RESULT_RASTER"),
        };
        assert_eq!(out.get(0, 0, 0), 1.0);
        assert_eq!(out.get(0, 0, 1), 0.0);
        assert_eq!(out.get(0, 1, 0), 0.0);
        assert_eq!(out.get(0, 1, 1), 0.0);
    }

    #[test]
    fn test_reducer_sum_mean_min_max() {
        let mut correlator = RasterCorrelator::new();
        let r1 = MemRaster::from_bands(1, 1, EncodingType::Flt8Bytes, vec![vec![1.0], vec![2.0], vec![3.0]]);
        correlator.register(1, Rc::new(r1));
        let aois = AoiRegistry::new();
        let opts = EvalOptions::new();

        let build = |kind: ReducerKind| {
            let sub = Program::from_steps(vec![Step::new(
                "VALUE_RASTER(r1)",
                StepKind::ValueRaster(RasterOperand { raster_index: 1, min_band: 0, max_band: 2, accessor: None }),
                Shape::raster(1, 1, 3),
                0,
            )]);
            let reducer = ReducerState::new(kind, sub);
            let shape = Shape::signature(3);
            result_number_program(vec![Step::new(kind.description(), StepKind::Reducer(reducer), shape, 0)])
        };

        let mut sum_program = build(ReducerKind::Sum);
        assert_eq!(run_scalar(&mut sum_program, &opts), 6.0);

        let mut mean_program = build(ReducerKind::Mean);
        assert_eq!(run_scalar(&mut mean_program, &opts), 2.0);

        let mut min_program = build(ReducerKind::Min);
        assert_eq!(run_scalar(&mut min_program, &opts), 1.0);

        let mut max_program = build(ReducerKind::Max);
        assert_eq!(run_scalar(&mut max_program, &opts), 3.0);
    }

    #[test]
    fn test_stdev_sample() {
        let mut correlator = RasterCorrelator::new();
        let r1 = MemRaster::from_bands(1, 1, EncodingType::Flt8Bytes, vec![vec![1.0], vec![2.0], vec![3.0]]);
        correlator.register(1, Rc::new(r1));
        let aois = AoiRegistry::new();
        let opts = EvalOptions::new();
        let sub = Program::from_steps(vec![Step::new(
            "VALUE_RASTER(r1)",
            StepKind::ValueRaster(RasterOperand { raster_index: 1, min_band: 0, max_band: 2, accessor: None }),
            Shape::raster(1, 1, 3),
            0,
        )]);
        let reducer = ReducerState::new(ReducerKind::Stddev, sub);
        let mut program = result_number_program(vec![Step::new("BAND_STDDEV", StepKind::Reducer(reducer), Shape::signature(3), 0)]);
        let mut progress = RasterMathProgress::new(program.total_work());
        let mut sink = crate::progress::NullProgressSink;
        program.execute(&correlator, &aois, &opts, &mut progress, &mut sink).unwrap();
        assert!((program.steps.last().unwrap().value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_harmean() {
        let mut correlator = RasterCorrelator::new();
        let r1 = MemRaster::from_bands(1, 1, EncodingType::Flt8Bytes, vec![vec![1.0], vec![2.0], vec![4.0]]);
        correlator.register(1, Rc::new(r1));
        let aois = AoiRegistry::new();
        let opts = EvalOptions::new();
        let sub = Program::from_steps(vec![Step::new(
            "VALUE_RASTER(r1)",
            StepKind::ValueRaster(RasterOperand { raster_index: 1, min_band: 0, max_band: 2, accessor: None }),
            Shape::raster(1, 1, 3),
            0,
        )]);
        let reducer = ReducerState::new(ReducerKind::Harmean, sub);
        let mut program = result_number_program(vec![Step::new("BAND_HARMEAN", StepKind::Reducer(reducer), Shape::signature(3), 0)]);
        let mut progress = RasterMathProgress::new(program.total_work());
        let mut sink = crate::progress::NullProgressSink;
        program.execute(&correlator, &aois, &opts, &mut progress, &mut sink).unwrap();
        assert!((program.steps.last().unwrap().value - 12.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_cse_reference_equals_double_sum() {
        let mut correlator = RasterCorrelator::new();
        let r1 = MemRaster::from_bands(1, 1, EncodingType::Flt8Bytes, vec![vec![1.0], vec![2.0], vec![3.0]]);
        correlator.register(1, Rc::new(r1));
        let aois = AoiRegistry::new();
        let opts = EvalOptions::new();

        let make_sum_reducer = || {
            let sub = Program::from_steps(vec![Step::new(
                "VALUE_RASTER(r1)",
                StepKind::ValueRaster(RasterOperand { raster_index: 1, min_band: 0, max_band: 2, accessor: None }),
                Shape::raster(1, 1, 3),
                0,
            )]);
            Step::new("BAND_SUM", StepKind::Reducer(ReducerState::new(ReducerKind::Sum, sub)), Shape::signature(3), 0)
        };

        let mut program = Program::from_steps(vec![make_sum_reducer(), make_sum_reducer(), Step::new("ADD", StepKind::Binary(crate::step::BinaryOp::Add), Shape::signature(3), 2)]);
        program.append(Step::new("RESULT_NUMBER", StepKind::ResultNumber, Shape::SCALAR, 1));
        program.optimize();
        assert!(matches!(program.steps[1].kind, StepKind::Reference(0)));

        let mut progress = RasterMathProgress::new(program.total_work());
        let mut sink = crate::progress::NullProgressSink;
        program.execute(&correlator, &aois, &opts, &mut progress, &mut sink).unwrap();
        assert_eq!(program.steps.last().unwrap().value, 12.0);
    }
}
