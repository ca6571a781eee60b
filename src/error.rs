use crate::request::ValidationError;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// The gateway could not be reached or the connection broke.
    #[error("network error: {0}")]
    Network(String),

    /// The gateway answered and reported a failure.
    #[error("gateway error {code}: {message}")]
    Api { code: String, message: String },

    #[error("unauthorized request to {path}")]
    Unauthorized { path: String, session_cleared: bool },

    #[error("malformed gateway response: {0}")]
    Decode(String),

    #[error("job manager has been shut down")]
    ShutDown,
}

impl Error {
    pub fn network(err: impl std::fmt::Display) -> Self {
        Error::Network(err.to_string())
    }

    /// Connectivity failures, as opposed to outcomes the server reported.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Error::Decode(err.to_string())
        } else {
            Error::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}
