use crate::tensor::Dims;

/// Every way a tensor, layer, loss or optimizer call can fail.
///
/// Shape and lifetime violations are programmer errors: they are reported as
/// soon as they are detected and nothing is coerced or retried.
#[derive(Debug, thiserror::Error)]
pub enum TensorError {
    #[error("data of length {got} does not fit dims {dims:?} (needs {expected})")]
    SizeMismatch {
        dims: Dims,
        expected: usize,
        got: usize,
    },

    #[error("rank mismatch: expected {expected} indices, got {got}")]
    RankMismatch { expected: usize, got: usize },

    #[error("rank {rank} exceeds the supported maximum of {max}")]
    RankTooLarge { rank: usize, max: usize },

    #[error("index {indices:?} is out of bounds for dims {dims:?}")]
    IndexOutOfBounds { indices: Vec<usize>, dims: Dims },

    #[error("flat offset {offset} is out of bounds for a tensor of length {len}")]
    OffsetOutOfBounds { offset: usize, len: usize },

    #[error("cannot reshape {from:?} into {to:?}: lengths differ")]
    ReshapeMismatch { from: Dims, to: Dims },

    #[error("shape mismatch: {left:?} vs {right:?}")]
    ShapeMismatch { left: Dims, right: Dims },

    #[error("dimension {dim} out of range for rank {rank}")]
    DimOutOfRange { dim: isize, rank: usize },

    #[error("failed to allocate a tensor with dims {dims:?}")]
    Allocation { dims: Dims },

    #[error("{layer}: expected input with {expected} features, got {got}")]
    FeatureMismatch {
        layer: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{layer}: invalid input dims {dims:?}: {reason}")]
    InvalidInput {
        layer: &'static str,
        dims: Dims,
        reason: &'static str,
    },

    #[error("{layer}: backward called without a matching forward")]
    BackwardWithoutForward { layer: &'static str },

    #[error("{layer}: backward received a different tensor than the last forward")]
    InputMismatch { layer: &'static str },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("label {label} is out of range for {classes} classes")]
    LabelOutOfRange { label: f64, classes: usize },

    #[error("optimizer was registered with {expected} parameter values, got {got}")]
    ParameterLayout { expected: usize, got: usize },

    #[error("checkpoint holds {got} values, parameters need {expected}")]
    CheckpointSize { expected: usize, got: usize },

    #[error("malformed dataset file: {0}")]
    Dataset(String),

    #[error("model has no layers")]
    EmptyModel,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TensorError>;
