//! Error types shared by the wire codec, audio pipeline and configuration.

use thiserror::Error;

/// Result type for library operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Truncated or invalid frame. The frame is dropped, the stream continues.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The capture device refused access; recording does not start.
    #[error("capture device access denied: {0}")]
    DeviceAccessDenied(String),

    /// A send was attempted while the socket is not connected.
    #[error("transport unavailable")]
    TransportUnavailable,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Audio device failure other than a permission problem.
    #[error("audio device error: {0}")]
    Device(String),

    #[error("resampler error: {0}")]
    Resample(String),

    #[error("config error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rubato::ResamplerConstructionError> for Error {
    fn from(e: rubato::ResamplerConstructionError) -> Self {
        Error::Resample(e.to_string())
    }
}

impl From<rubato::ResampleError> for Error {
    fn from(e: rubato::ResampleError) -> Self {
        Error::Resample(e.to_string())
    }
}

impl Error {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame(reason.into())
    }
}
