use std::sync::Arc;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while fetching flags, evaluating them, or publishing events.
///
/// None of these escape [`Client`](crate::Client) evaluation methods: they are logged and the
/// caller's default value is returned instead.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The requested flag does not exist in the flag source.
    #[error("flag not found")]
    MissingFlag,

    /// The user has a blank key.
    #[error("user key is blank")]
    MissingUser,

    /// The SDK key was rejected. This is not recoverable for the lifetime of the client.
    #[error("unauthorized, sdk_key is likely invalid")]
    Unauthorized,

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The server answered with a status code that is neither success nor unauthorized.
    #[error("unexpected response status: {0}")]
    UnexpectedStatus(u16),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Error encoding or decoding JSON.
    #[error(transparent)]
    Json(Arc<serde_json::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Indicates that the flusher thread panicked. This should normally never happen.
    #[error("flusher thread panicked")]
    FlusherThreadPanicked,
}

impl Error {
    /// Returns `true` for transport and decoding failures that may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::UnexpectedStatus(_) | Error::Network(_) | Error::Json(_) | Error::Io(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}
