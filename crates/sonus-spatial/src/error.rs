//! Error types for the panning / Ambisonic / HRTF pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpatialError {
    #[error("invalid Ambisonic order: {0} (max supported: 3)")]
    InvalidAmbisonicOrder(usize),

    #[error("invalid channel count: expected {expected}, got {got}")]
    InvalidChannelCount { expected: usize, got: usize },

    #[error("malformed HRTF dataset: {0}")]
    MalformedDataset(String),

    #[error("HRTF dataset field out of range: {what} = {value}")]
    FieldOutOfRange { what: &'static str, value: i64 },

    #[error("io error reading HRTF dataset: {0}")]
    Io(#[from] std::io::Error),
}

pub type SpatialResult<T> = Result<T, SpatialError>;
