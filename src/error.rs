use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DenoiseError>;

/// Everything that can stop a denoising run. None of these are retried; the first one
/// encountered aborts the run and no output is written.
#[derive(Error, Debug)]
pub enum DenoiseError {
    #[error("{what} shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// block shape and data shape do not have the same number of dimensions
    #[error("block shape {block:?} has rank {}, but data shape {data:?} has rank {}", block.len(), data.len())]
    BlockRank { block: Vec<usize>, data: Vec<usize> },

    #[error("cannot select {requested} angular neighbors from {available} candidate directions")]
    InsufficientNeighbors { requested: usize, available: usize },

    #[error("no baseline volume found (no b-value <= {threshold})")]
    NoBaseline { threshold: f32 },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("non-finite values found while {stage} for block {block:?}")]
    NonFinite { stage: &'static str, block: Vec<usize> },

    /// an output element was never written by any scheduled block
    #[error("channel {channel} was not covered by any scheduled block")]
    Uncovered { channel: usize },

    #[error("the block accumulator stopped before all blocks were sent")]
    AccumulatorClosed,

    #[error("output {} already exists, use --force to overwrite", .0.display())]
    OutputExists(PathBuf),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("invalid nifti file: {0}")]
    InvalidNifti(String),

    #[error(transparent)]
    Nifti(#[from] nifti::NiftiError),

    #[error("gradient table error: {0}")]
    GradientTable(String),

    #[error("failed to parse parameter file: {0}")]
    ParamsFile(#[from] toml::de::Error),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
