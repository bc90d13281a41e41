use thiserror::Error;

/// Result type for tiling operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during tiling
#[derive(Error, Debug)]
pub enum Error {
    #[error("Bounds computation failed for geometry {geometry_id}: {reason}")]
    Bounds { geometry_id: u32, reason: String },

    #[error("Codec error: {0}")]
    Codec(#[from] tilestream_codec::Error),

    #[error("Output error: {0}")]
    Output(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
