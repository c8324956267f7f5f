use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("Change stream failure: {0}")]
    StreamFailure(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// Text pushed to the client inside a `<scope>:error` event.
    pub fn scope_message(&self) -> String {
        match self {
            Error::ValidationFailed(msg)
            | Error::NotFound(msg)
            | Error::PermissionDenied(msg) => msg.clone(),
            Error::UpstreamUnavailable(_) => "Service temporarily unavailable".to_string(),
            Error::StreamFailure(_) | Error::Serialization(_) => "Internal error".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_keep_their_message() {
        let err = Error::ValidationFailed("Message content cannot be empty".to_string());
        assert_eq!(err.scope_message(), "Message content cannot be empty");
    }

    #[test]
    fn upstream_errors_are_not_leaked() {
        let err = Error::UpstreamUnavailable("connection refused to 10.0.0.3".to_string());
        assert_eq!(err.scope_message(), "Service temporarily unavailable");
    }
}
