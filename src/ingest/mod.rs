pub mod pipeline;

pub use pipeline::IngestPipeline;

use crate::serial::{DecodeError, ValidationError};
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Expected a JSON object")]
    NotAnObject,
}

pub type Result<T> = std::result::Result<T, IngestError>;
