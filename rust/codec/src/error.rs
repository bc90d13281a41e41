use thiserror::Error;

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding or decoding tile data
#[derive(Error, Debug)]
pub enum Error {
    #[error("Truncated tile blob: expected {expected} more bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("Malformed tile blob: {0}")]
    Malformed(String),

    #[error("Document serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
