//! Image load error types.

use thiserror::Error;

/// Result type for image loading operations.
pub type LoadResult<T> = std::result::Result<T, LoadError>;

/// Reasons an image request can fail.
///
/// A result that arrives for a slot that has since been reassigned is not an
/// error; it is silently discarded by the delivery path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[allow(missing_docs)]
pub enum LoadError {
    #[error("network timeout")]
    NetworkTimeout,

    #[error("network error: {message}")]
    Network { message: String },

    #[error("decode error: {message}")]
    Decode { message: String },

    #[error("out of memory while decoding")]
    OutOfMemory,

    #[error("disk cache unavailable: {message}")]
    StorageUnavailable { message: String },

    #[error("request cancelled")]
    Cancelled,
}

impl LoadError {
    /// Creates network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates storage unavailable error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            message: message.into(),
        }
    }
}

impl From<image::ImageError> for LoadError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Limits(_) => Self::OutOfMemory,
            other => Self::decode(other.to_string()),
        }
    }
}
