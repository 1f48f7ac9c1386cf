use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors produced by bfrvc-core.
#[derive(Debug, Error)]
pub enum VcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audio decode error: {0}")]
    Decode(String),

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("frame alignment error: {what} has {got} frames, expected {expected}")]
    Alignment {
        what: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("job cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("chunk {index} failed: {source}")]
    Chunk {
        index: usize,
        #[source]
        source: Box<VcError>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse error classification reported back to callers as the job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Io,
    Decode,
    UnsupportedMethod,
    Model,
    Alignment,
    Cancelled,
    InvalidConfig,
    Internal,
}

impl VcError {
    /// Attach the index of the chunk whose inference produced `source`.
    pub fn chunk(index: usize, source: VcError) -> Self {
        Self::Chunk {
            index,
            source: Box::new(source),
        }
    }

    /// Taxonomy kind; a chunk failure reports the kind of its cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::Decode(_) => ErrorKind::Decode,
            Self::UnsupportedMethod(_) => ErrorKind::UnsupportedMethod,
            Self::Model(_) => ErrorKind::Model,
            Self::Alignment { .. } => ErrorKind::Alignment,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::Chunk { source, .. } => source.kind(),
            Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// Index of the failing chunk, if the error came out of per-chunk inference.
    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            Self::Chunk { index, .. } => Some(*index),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, VcError>;
