use reqwest::StatusCode;

/// Failure of a single refresh episode.
///
/// Cloned once per queued waiter, so every variant carries owned, cheap data
/// instead of the underlying transport error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("refresh rejected by server with status {status}")]
    Rejected { status: u16 },
    #[error("refresh request failed: {0}")]
    Transport(String),
    #[error("refresh response malformed: {0}")]
    MalformedResponse(String),
    #[error("session ended while refresh was in flight")]
    SessionEnded,
    #[error("refresh task ended without settling")]
    Abandoned,
}

/// Errors surfaced to callers of the request layer.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("authorization expired")]
    AuthExpired,
    #[error("session refresh failed: {0}")]
    RefreshFailed(#[from] RefreshError),
    #[error("login failed: {0}")]
    LoginFailed(String),
    #[error("request failed with status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("invalid request url: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// True when the caller should send the user back through login.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            Self::AuthExpired | Self::RefreshFailed(_) | Self::LoginFailed(_)
        )
    }
}

/// Connection-level failure on the telemetry channel. Never reaches stream
/// consumers; it only drives the reconnect cycle.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("stream endpoint answered with status {0}")]
    Status(u16),
    #[error("stream transport error: {0}")]
    Transport(String),
    #[error("stream closed by server")]
    Closed,
}
