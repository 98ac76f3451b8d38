//! Error types for camera provenance.
//!
//! Only conditions caused by a misconfigured caller are errors. Anything
//! that is a property of the image under test is reported through
//! [`crate::verify::VerificationOutcome`] instead.

use thiserror::Error;

/// Structural failures while rewriting or walking an image container.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unsupported image container")]
    UnsupportedFormat,

    #[error("Truncated {container} data at offset {offset}")]
    Truncated {
        container: &'static str,
        offset: usize,
    },

    #[error("Invalid {container} structure: {reason}")]
    InvalidStructure {
        container: &'static str,
        reason: String,
    },

    #[error("Provenance record too large for container: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("Failed to serialize provenance record: {0}")]
    Serialize(String),
}

/// Fault raised by the external key registry collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryCallError {
    #[error("Registry call timed out")]
    Timeout,

    #[error("Registry transport error: {0}")]
    Transport(String),

    #[error("Registry call reverted: {0}")]
    Reverted(String),

    #[error("Invalid registry response: {0}")]
    InvalidResponse(String),

    #[error("Identifier not known to registry")]
    NotFound,
}

impl RegistryCallError {
    /// Whether retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transport(_))
    }
}

#[derive(Error, Debug)]
pub enum ProvenanceError {
    #[error("Failed to read input: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to load private key: {0}")]
    KeyLoad(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Unsupported image container")]
    UnsupportedFormat,

    #[error("Image container error: {0}")]
    Codec(CodecError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryCallError),
}

impl From<CodecError> for ProvenanceError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::UnsupportedFormat => Self::UnsupportedFormat,
            other => Self::Codec(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvenanceError>;
