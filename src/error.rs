use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FactorError {
    #[error("factor `{node}` win ({win}) must be >= {min_win}")]
    WindowTooSmall {
        node: String,
        win: usize,
        min_win: usize,
    },
    #[error("factor `{node}` requires {expected} inputs, got {actual}")]
    InvalidArity {
        node: String,
        expected: usize,
        actual: usize,
    },
    #[error("invalid parameter `{param}` for factor `{node}`: {reason}")]
    InvalidParam {
        node: String,
        param: &'static str,
        reason: String,
    },
    #[error(
        "the return data shape {actual:?} of factor `{node}` must be the same as input {expected:?}"
    )]
    LayoutMismatch {
        node: String,
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error(
        "upstream factor `{node}` has multiple outputs ({outputs}); select a single output \
         first, e.g. `factor.select(0)`"
    )]
    MultipleOutputs { node: String, outputs: usize },
    #[error("factor `{node}` has {outputs} return values, cannot select [{index}]")]
    SelectOutOfBounds {
        node: String,
        outputs: usize,
        index: usize,
    },
    #[error("shape mismatch in `{node}`: {reason}")]
    ShapeMismatch { node: String, reason: String },
    #[error(
        "`{op}` in factor `{node}` does not support `{dtype}` data, \
         convert to float first with `factor.to_float()`"
    )]
    UnsupportedDtype {
        node: String,
        op: &'static str,
        dtype: &'static str,
    },
    #[error("mask of factor `{node}` must be bool, got `{dtype}`")]
    InvalidMask { node: String, dtype: &'static str },
    #[error(
        "reference count error in `{node}`: compute called more times than pre_compute"
    )]
    RefCountUnderflow { node: String },
    #[error("factor `{node}` computed before pre_compute")]
    NotPrepared { node: String },
    #[error("column `{column}` not found in panel")]
    MissingColumn { column: String },
    #[error("group key at row {row} is not a non-negative integer: {value}")]
    InvalidGroupKey { row: usize, value: f64 },
    #[error("invalid panel: {reason}")]
    InvalidPanel { reason: String },
    #[error("invalid run config: {reason}")]
    Config { reason: String },
    #[error("kernel of factor `{node}` panicked: {reason}")]
    KernelPanicked { node: String, reason: String },
    #[error("failed to open execution lane: {reason}")]
    LaneSpawn { reason: String },
}
