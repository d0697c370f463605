use thiserror::Error;

/// Top-level error type for the tomoflow pipeline.
#[derive(Debug, Error)]
pub enum ReconError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("allocation failed: requested {count} buffers of {len} elements")]
    OutOfMemory { count: usize, len: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReconError>;
