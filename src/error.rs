//! Error types for realm-sso

use thiserror::Error;

/// Result type alias for realm-sso operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while authenticating against an identity provider
#[derive(Error, Debug)]
pub enum Error {
    #[error("No stored credentials available")]
    CredentialsUnavailable,

    #[error("Refresh token has expired, a new login is required")]
    CredentialsExpired,

    #[error("Unable to exchange one-time code for tokens: {0}")]
    UnableToExchangeCode(#[source] Box<Error>),

    #[error("Malformed token response: {0}")]
    MalformedResponse(String),

    #[error("Token exchange failed with status {status}: {body}")]
    ExchangeFailed { status: u16, body: String },

    #[error("Token refresh failed with status {status}: {body}")]
    RefreshFailed { status: u16, body: String },

    #[error("Unable to store credentials: {0}")]
    StorageWriteFailed(String),

    #[error("Secure random source unavailable: {0}")]
    RandomSourceUnavailable(String),

    #[error("A login attempt is already in progress")]
    LoginInProgress,

    #[error("A token refresh is already in progress")]
    RefreshInProgress,

    #[error("No login attempt is pending")]
    NoLoginPending,

    #[error("Login was cancelled before a result was received")]
    LoginCancelled,

    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}
