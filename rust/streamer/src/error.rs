use thiserror::Error;

/// Streamer error type
#[derive(Error, Debug)]
pub enum Error {
    /// GPU adapter/device setup or readback failure
    #[error("GPU error: {0}")]
    Gpu(String),

    /// A model key was registered twice
    #[error("Model already loaded: {0}")]
    ModelAlreadyLoaded(String),

    /// A model key is unknown to the engine or loader
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// Tile transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Tile or manifest decoding failure
    #[error("Codec error: {0}")]
    Codec(#[from] tilestream_codec::Error),
}

/// Result type alias for streamer operations
pub type Result<T> = std::result::Result<T, Error>;
