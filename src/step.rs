//! The step model (C1, spec sections 3 and 4.1): a tagged variant per
//! primitive operation/operand, each carrying a description, a shape,
//! an argument arity, and a cached `value`. Kind-specific state (raster
//! cursors, reducer accumulators, ...) lives inside the matching
//! `StepKind` variant rather than behind a virtual-dispatch subclass, so
//! the hot per-pixel loop in `program::compute` is a single dense match.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::program::Program;
use crate::raster::{AoiHandle, MemRaster, RasterAccessor, RasterHandle};

/// `(rows, cols, bands)` of a step's result. A step is scalar iff every
/// dimension is 1, a signature iff `rows == cols == 1 && bands > 1`,
/// and a raster otherwise (spec section 4.1).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
    pub bands: usize,
}

impl Shape {
    pub const SCALAR: Shape = Shape { rows: 1, cols: 1, bands: 1 };

    pub fn raster(rows: usize, cols: usize, bands: usize) -> Shape {
        Shape { rows, cols, bands }
    }

    pub fn signature(bands: usize) -> Shape {
        Shape { rows: 1, cols: 1, bands }
    }

    pub fn is_scalar(&self) -> bool {
        self.rows == 1 && self.cols == 1 && self.bands == 1
    }

    pub fn is_signature(&self) -> bool {
        self.rows == 1 && self.cols == 1 && self.bands > 1
    }

    pub fn is_raster(&self) -> bool {
        !self.is_scalar() && !self.is_signature()
    }

    pub fn cell_count(&self) -> u64 {
        self.rows as u64 * self.cols as u64 * self.bands as u64
    }
}

impl Default for Shape {
    fn default() -> Shape {
        Shape::SCALAR
    }
}

/// Arity-1 operators (spec section 3).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Abs,
    Sqrt,
    Acos,
    Cos,
    Asin,
    Sin,
    Atan,
    Tan,
    Cosh,
    Sinh,
    Tanh,
    Exp,
    Log10,
    Log2,
    Log,
    Not,
}

impl UnaryOp {
    /// Looks up a unary function name as it appears in formula text
    /// (the grammar's `unary1` production). Does not cover `Negate`/`Not`,
    /// which the parser constructs directly from `-`/`!`/`not`.
    pub fn from_function_name(name: &str) -> Option<UnaryOp> {
        use UnaryOp::*;
        Some(match name {
            "abs" => Abs,
            "sqrt" => Sqrt,
            "exp" => Exp,
            "log10" => Log10,
            "log2" => Log2,
            "log" => Log,
            "acos" => Acos,
            "cos" => Cos,
            "asin" => Asin,
            "sin" => Sin,
            "atan" => Atan,
            "tan" => Tan,
            "cosh" => Cosh,
            "sinh" => Sinh,
            "tanh" => Tanh,
            _ => return None,
        })
    }

    pub fn description(&self) -> &'static str {
        use UnaryOp::*;
        match self {
            Negate => "NEGATE",
            Abs => "ABS",
            Sqrt => "SQRT",
            Acos => "ACOS",
            Cos => "COS",
            Asin => "ASIN",
            Sin => "SIN",
            Atan => "ATAN",
            Tan => "TAN",
            Cosh => "COSH",
            Sinh => "SINH",
            Tanh => "TANH",
            Exp => "EXP",
            Log10 => "LOG10",
            Log2 => "LOG2",
            Log => "LOG",
            Not => "NOT",
        }
    }
}

/// Arity-2 operators (spec section 3).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Exponentiate,
    Atan2,
    Logn,
    Equals,
    NotEquals,
    LessThan,
    GreaterThan,
    LessOrEqual,
    GreaterOrEqual,
    And,
    Or,
}

impl BinaryOp {
    /// Looks up an operator symbol (`+`, `<=`, ...) or a two-argument
    /// function name (`atan2`, `logn`) to its `BinaryOp`.
    pub fn from_token(token: &str) -> Option<BinaryOp> {
        use BinaryOp::*;
        Some(match token {
            "+" => Add,
            "-" => Subtract,
            "*" => Multiply,
            "/" => Divide,
            "%" => Modulo,
            "^" => Exponentiate,
            "atan2" => Atan2,
            "logn" => Logn,
            "=" => Equals,
            "!=" => NotEquals,
            "<" => LessThan,
            ">" => GreaterThan,
            "<=" => LessOrEqual,
            ">=" => GreaterOrEqual,
            "&" | "and" => And,
            "|" | "or" => Or,
            _ => return None,
        })
    }

    pub fn description(&self) -> &'static str {
        use BinaryOp::*;
        match self {
            Add => "ADD",
            Subtract => "SUBTRACT",
            Multiply => "MULTIPLY",
            Divide => "DIVIDE",
            Modulo => "MODULO",
            Exponentiate => "EXPONENTIATE",
            Atan2 => "ATAN2",
            Logn => "LOGN",
            Equals => "EQUALS",
            NotEquals => "NOT_EQUALS",
            LessThan => "LESS_THAN",
            GreaterThan => "GREATER_THAN",
            LessOrEqual => "LESS_OR_EQUAL",
            GreaterOrEqual => "GREATER_OR_EQUAL",
            And => "AND",
            Or => "OR",
        }
    }
}

/// The seven band-wise reducers (spec sections 3 and 4.6). `avg` is an
/// alias for `Mean` at the grammar level; there is no separate variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReducerKind {
    Min,
    Max,
    Sum,
    Mean,
    Geomean,
    Harmean,
    Stddev,
}

impl ReducerKind {
    pub fn from_name(name: &str) -> Option<ReducerKind> {
        use ReducerKind::*;
        Some(match name {
            "min" => Min,
            "max" => Max,
            "sum" => Sum,
            "mean" | "avg" => Mean,
            "geomean" => Geomean,
            "harmean" => Harmean,
            "stdev" => Stddev,
            _ => return None,
        })
    }

    pub fn description(&self) -> &'static str {
        use ReducerKind::*;
        match self {
            Min => "BAND_MIN",
            Max => "BAND_MAX",
            Sum => "BAND_SUM",
            Mean => "BAND_MEAN",
            Geomean => "BAND_GEOMEAN",
            Harmean => "BAND_HARMEAN",
            Stddev => "BAND_STDDEV",
        }
    }

    /// The accumulator's identity element, i.e. its value before any
    /// pixel has been folded in (spec section 4.6).
    pub fn initial_a1(&self) -> f64 {
        match self {
            ReducerKind::Min => f64::INFINITY,
            ReducerKind::Max => f64::NEG_INFINITY,
            // GEOMEAN's accumulator is seeded at 0.0 and combined with
            // `*=`, which pins the running product at zero forever; this
            // reproduces a known divergence from a true geometric mean
            // rather than the mathematically obvious `1.0` seed (spec
            // section 9, open question 1).
            _ => 0.0,
        }
    }
}

/// A raster operand (`VALUE_RASTER`): references input raster `r{raster_index}`
/// restricted to the inclusive, 0-based band range `[min_band, max_band]`.
pub struct RasterOperand {
    pub raster_index: usize,
    pub min_band: usize,
    pub max_band: usize,
    pub accessor: Option<Box<dyn RasterAccessor>>,
}

/// An AOI operand (`VALUE_AOI`): references mask `a{aoi_index}`, tracked
/// with its own `(row, col)` cursor rather than a streaming accessor,
/// since the AOI handle contract (spec section 6) is direct-addressed.
pub struct AoiOperand {
    pub aoi_index: usize,
    pub handle: Option<Rc<dyn AoiHandle>>,
    pub row: usize,
    pub col: usize,
}

/// The `RESULT_RASTER` sink: an internally owned output raster plus the
/// `(band, row, col)` cursor the sink writes through.
pub struct RasterSink {
    pub output: MemRaster,
    pub band: usize,
    pub row: usize,
    pub col: usize,
}

impl RasterSink {
    pub fn new(rows: usize, cols: usize, bands: usize, data_type: crate::raster::EncodingType) -> RasterSink {
        RasterSink {
            output: MemRaster::new(rows, cols, bands, data_type),
            band: 0,
            row: 0,
            col: 0,
        }
    }

    pub fn write(&mut self, value: f64) {
        let clamped = self.output.data_type().clamp(value);
        self.output.set(self.band, self.row, self.col, clamped);
    }

    pub fn next_column(&mut self) -> bool {
        if self.col + 1 < self.output.columns() {
            self.col += 1;
            true
        } else {
            false
        }
    }

    pub fn next_row(&mut self) -> bool {
        if self.row + 1 < self.output.rows() {
            self.row += 1;
            self.col = 0;
            true
        } else {
            false
        }
    }

    pub fn next_band(&mut self) -> bool {
        if self.band + 1 < self.output.bands() {
            self.band += 1;
            self.row = 0;
            self.col = 0;
            true
        } else {
            false
        }
    }
}

/// A band-wise reducer's live state (C6, spec section 4.6): its own
/// sub-program (the linearized argument), three scratch accumulators,
/// and the snapshotted shape of its argument.
pub struct ReducerState {
    pub kind: ReducerKind,
    pub sub_program: Program,
    pub a1: f64,
    pub a2: f64,
    pub a3: f64,
    pub sub_shape: Shape,
}

impl ReducerState {
    pub fn new(kind: ReducerKind, sub_program: Program) -> ReducerState {
        let sub_shape = sub_program.shape();
        ReducerState {
            a1: kind.initial_a1(),
            a2: 0.0,
            a3: 0.0,
            sub_shape,
            kind,
            sub_program,
        }
    }

    pub fn reset_accumulators(&mut self) {
        self.a1 = self.kind.initial_a1();
        self.a2 = 0.0;
        self.a3 = 0.0;
    }
}

/// The tagged variant for one step's primitive behavior. Shared fields
/// (description, shape, arg count, cached value) live on `Step` itself.
pub enum StepKind {
    Number,
    Unary(UnaryOp),
    Binary(BinaryOp),
    Clamp,
    ValueRaster(RasterOperand),
    ValueAoi(AoiOperand),
    ResultNumber,
    ResultSignature(Vec<f64>),
    ResultRaster(RasterSink),
    /// A lazy back-reference to an earlier step's current value, created
    /// only by common-subexpression folding (spec section 4.4).
    Reference(usize),
    Reducer(ReducerState),
    /// What a `Reducer` step becomes once its sub-program has been
    /// driven to completion: a queue of one value per output band, with
    /// the first already popped into `Step::value` (spec section 4.6).
    ComputedSignature(VecDeque<f64>),
}

/// One instruction in the linearized, postfix program (spec section 3).
pub struct Step {
    pub description: String,
    pub kind: StepKind,
    pub shape: Shape,
    pub arg_count: usize,
    pub value: f64,
}

impl Step {
    pub fn new(description: impl Into<String>, kind: StepKind, shape: Shape, arg_count: usize) -> Step {
        Step {
            description: description.into(),
            kind,
            shape,
            arg_count,
            value: 0.0,
        }
    }

    /// Identity equality (spec section 3): kind, shape, arg count, and
    /// description must match, plus kind-specific extras. Drives both
    /// common-subexpression folding and reducer sub-program comparison.
    pub fn identity_eq(&self, other: &Step) -> bool {
        if self.shape != other.shape || self.arg_count != other.arg_count || self.description != other.description {
            return false;
        }
        match (&self.kind, &other.kind) {
            (StepKind::Number, StepKind::Number) => self.value == other.value,
            (StepKind::Unary(a), StepKind::Unary(b)) => a == b,
            (StepKind::Binary(a), StepKind::Binary(b)) => a == b,
            (StepKind::Clamp, StepKind::Clamp) => true,
            (StepKind::ValueRaster(a), StepKind::ValueRaster(b)) => {
                a.raster_index == b.raster_index && a.min_band == b.min_band && a.max_band == b.max_band
            }
            (StepKind::ValueAoi(a), StepKind::ValueAoi(b)) => a.aoi_index == b.aoi_index,
            (StepKind::ResultNumber, StepKind::ResultNumber) => true,
            (StepKind::ResultSignature(_), StepKind::ResultSignature(_)) => true,
            (StepKind::ResultRaster(_), StepKind::ResultRaster(_)) => true,
            (StepKind::Reference(a), StepKind::Reference(b)) => a == b,
            (StepKind::Reducer(a), StepKind::Reducer(b)) => {
                a.kind == b.kind && a.sub_program.identity_eq(&b.sub_program)
            }
            (StepKind::ComputedSignature(_), StepKind::ComputedSignature(_)) => true,
            _ => false,
        }
    }

    /// Is this step kind expensive enough to be worth common-subexpression
    /// folding (spec section 4.4: `VALUE_RASTER` and the seven reducers)?
    pub fn is_cse_eligible(&self) -> bool {
        matches!(self.kind, StepKind::ValueRaster(_) | StepKind::Reducer(_))
    }

    /// One-time (outside the per-pixel inner loop) work contributed by
    /// this step, used by `Program::total_work` (spec section 4.4).
    pub fn one_time_work(&self) -> u64 {
        match &self.kind {
            StepKind::Reducer(r) => {
                let n = r.sub_program.steps.len() as u64;
                let base = r.sub_shape.cell_count() * n;
                let children: u64 = r.sub_program.steps.iter().map(|s| s.one_time_work()).sum();
                base + children
            }
            _ => 0,
        }
    }
}
