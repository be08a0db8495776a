use std::fmt;

/// The error type produced by the formula compiler and evaluator.
///
/// Mirrors the error-kind taxonomy of spec section 7. `Aborted` is kept
/// distinct from `ComputationError`/`ShapeMismatch` so a caller can tell
/// cooperative cancellation apart from a genuine formula/data problem.
#[derive(Debug, Clone, PartialEq)]
pub enum RasterMathError {
    /// The formula text could not be parsed, or was not fully consumed.
    ParseError(String),
    /// `r_k`/`a_k` names an unregistered element, or a band slice is out of range.
    BadReference(String),
    /// A band slice's own bounds are inconsistent (`min > max`, negative, etc).
    BadSlice(String),
    /// A raster/AOI accessor became invalid mid-iteration.
    ShapeMismatch(String),
    /// An arithmetic guard failed under `fail_on_error = true`.
    ComputationError(String),
    /// Evaluation was cooperatively cancelled.
    Aborted,
    /// A condition that should be structurally impossible (empty program,
    /// stack underflow, missing sub-program). Never swallowed.
    InternalInvariant(String),
}

impl fmt::Display for RasterMathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RasterMathError::ParseError(msg) => write!(f, "parse error: {}", msg),
            RasterMathError::BadReference(msg) => write!(f, "bad reference: {}", msg),
            RasterMathError::BadSlice(msg) => write!(f, "bad band slice: {}", msg),
            RasterMathError::ShapeMismatch(msg) => write!(f, "shape mismatch: {}", msg),
            RasterMathError::ComputationError(msg) => write!(f, "computation error: {}", msg),
            RasterMathError::Aborted => write!(f, "evaluation aborted"),
            RasterMathError::InternalInvariant(msg) => write!(f, "internal invariant violated: {}", msg),
        }
    }
}

impl std::error::Error for RasterMathError {}

impl RasterMathError {
    /// Convenience constructor for the fatal "this should be impossible" bucket.
    pub fn invariant<S: ToString>(msg: S) -> RasterMathError {
        RasterMathError::InternalInvariant(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RasterMathError>;
