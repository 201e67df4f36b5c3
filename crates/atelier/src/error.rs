use thiserror::Error;

/// Error types that can occur while talking to the atelier backends.
#[derive(Error, Debug)]
pub enum AtelierError {
    /// A 401 on a request already replayed with a refreshed token.
    #[error("Auth Expired: {0}")]
    AuthExpired(String),

    /// The refresh endpoint itself failed. Credentials have been cleared.
    #[error("Refresh Failed: {0}")]
    RefreshFailed(String),

    /// A job submission produced neither a task id nor a finished artifact.
    #[error("Submission Rejected: {0}")]
    SubmissionRejected(String),

    /// The attempt budget ran out before the job reached a terminal status.
    #[error("timeout")]
    PollTimeout { attempts: u32 },

    /// The backend explicitly reported the job as failed.
    #[error("Job Failed: {0}")]
    JobFailed(String),

    /// Network-level failure of a single call.
    #[error("Transport Error: {0}")]
    TransportError(String),

    /// A non-2xx, non-401 response.
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Errors related to malformed requests.
    #[error("Invalid Request: {0}")]
    InvalidRequest(String),

    /// Errors related to malformed response bodies.
    #[error("Response Format Error: {message}. Raw response: '{raw_response}'")]
    ResponseFormatError {
        message: String,
        raw_response: String,
    },

    /// Handles JSON serialization and deserialization errors.
    #[error("JSON Error")]
    JsonError(#[from] serde_json::Error),

    /// Handles errors from parsing URLs.
    #[error("Invalid URL")]
    InvalidUrl(#[from] url::ParseError),
}

impl AtelierError {
    /// Authentication failures; retrying the same call will not help.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthExpired(_) | Self::RefreshFailed(_))
    }
}

#[cfg(feature = "reqwest-client")]
impl From<reqwest::Error> for AtelierError {
    fn from(err: reqwest::Error) -> Self {
        AtelierError::TransportError(err.to_string())
    }
}

impl From<http::Error> for AtelierError {
    fn from(err: http::Error) -> Self {
        AtelierError::InvalidRequest(err.to_string())
    }
}
