// lobbybot-common/src/error.rs
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout error: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    /// Stored credentials were rejected by the backend. Terminal for the
    /// current operation; a fresh token must be obtained before retrying.
    #[error("Invalid credentials: {0}")]
    AuthInvalid(String),

    /// Transient failure on the persistent event stream; retried via backoff.
    #[error("Stream error: {0}")]
    Stream(String),

    /// A party patch raced another writer. Carries the authoritative revision
    /// extracted from the error payload.
    #[error("Stale party revision, current is {current}")]
    StaleRevision { current: i64 },

    /// Typed API error from a REST collaborator.
    #[error("API error {code}: {message}")]
    Api { code: String, message: String },

    /// An individual automation action failed. Logged, never fatal to
    /// sibling actions.
    #[error("Automation action failed: {0}")]
    Action(String),

    #[error("Reconnect attempts exhausted after {0} tries")]
    ExhaustedRetries(u32),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl Error {
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::AuthInvalid(_))
    }

    /// The collaborator `errorCode` string, if this is a typed API error.
    pub fn api_code(&self) -> Option<&str> {
        match self {
            Error::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Parse(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Parse(s.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Parse(e.to_string())
    }
}
