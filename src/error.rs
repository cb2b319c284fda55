use thiserror::Error;

/// Errors produced while fitting or querying a colour density.
///
/// `DegenerateHistogram` and `DivisionByNearZero` come out of the strict
/// helpers only; the stage-level calls recover from them with a flagged
/// fallback instead of failing.
#[derive(Error, Debug)]
pub enum DensityError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("covariance of component {component} is not invertible")]
    SingularCovariance { component: usize },
    #[error("histogram is degenerate (max == min)")]
    DegenerateHistogram,
    #[error("denominator {value} is below the floor {floor}")]
    DivisionByNearZero { value: f64, floor: f64 },
    #[error("bin layouts differ")]
    LayoutMismatch,
    #[error("mask is {mask:?} but frame is {frame:?}")]
    MaskSizeMismatch { mask: (u32, u32), frame: (u32, u32) },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("no samples with positive weight")]
    EmptySampleSet,
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DensityError>;
