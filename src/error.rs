use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::types::SystemId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The refresh token was rejected. Nothing succeeds until a new
    /// authorization code is exchanged.
    Revoked,
    /// No token was exchanged or loaded from the store.
    NotAuthorized,
    /// The token endpoint rejected an authorization code.
    Rejected(String),
    TransientNetwork(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    Exhausted { retry_after: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    UnknownParameter(String),
    PermissionDenied(String),
    InvalidValue(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    Timeout,
    Unreachable(String),
    Server { status: u16, message: String },
}

#[derive(Debug, Clone)]
pub enum Error {
    Auth(AuthError),
    RateLimit(RateLimitError),
    Validation(ValidationError),
    Network(NetworkError),
    Protocol(String),
    Config(String),
    NoSystems,
    UnknownSystem(SystemId),
    Cancelled,
    SchedulerClosed,
    Io(Arc<std::io::Error>),
}

impl Error {
    /// Whether the scheduler should try the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::RateLimit(_) | Error::Auth(AuthError::TransientNetwork(_))
        )
    }

    /// Whether the error requires a fresh authorization before anything can succeed.
    pub fn is_revoked(&self) -> bool {
        matches!(
            self,
            Error::Auth(AuthError::Revoked) | Error::Auth(AuthError::NotAuthorized)
        )
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Revoked => write!(f, "authorization revoked, re-authorization required"),
            AuthError::NotAuthorized => write!(f, "no authorization available"),
            AuthError::Rejected(msg) => write!(f, "authorization rejected: {msg}"),
            AuthError::TransientNetwork(msg) => write!(f, "token endpoint unavailable: {msg}"),
        }
    }
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::Exhausted { retry_after } => {
                write!(f, "rate limit exhausted, retry after {}s", retry_after.as_secs_f64())
            }
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::UnknownParameter(msg) => write!(f, "unknown parameter: {msg}"),
            ValidationError::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            ValidationError::InvalidValue(msg) => write!(f, "invalid value: {msg}"),
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Timeout => write!(f, "request timed out"),
            NetworkError::Unreachable(msg) => write!(f, "unreachable: {msg}"),
            NetworkError::Server { status, message } => write!(f, "server error {status}: {message}"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Auth(e) => write!(f, "auth error: {e}"),
            Error::RateLimit(e) => write!(f, "{e}"),
            Error::Validation(e) => write!(f, "validation error: {e}"),
            Error::Network(e) => write!(f, "network error: {e}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::Config(msg) => write!(f, "config error: {msg}"),
            Error::NoSystems => write!(f, "no systems configured or discovered"),
            Error::UnknownSystem(id) => write!(f, "unknown system: {id}"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::SchedulerClosed => write!(f, "scheduler has shut down"),
            Error::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}
impl std::error::Error for RateLimitError {}
impl std::error::Error for ValidationError {}
impl std::error::Error for NetworkError {}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Auth(e) => Some(e),
            Error::RateLimit(e) => Some(e),
            Error::Validation(e) => Some(e),
            Error::Network(e) => Some(e),
            Error::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<RateLimitError> for Error {
    fn from(e: RateLimitError) -> Self {
        Error::RateLimit(e)
    }
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Validation(e)
    }
}

impl From<NetworkError> for Error {
    fn from(e: NetworkError) -> Self {
        Error::Network(e)
    }
}

impl From<reqwest::Error> for NetworkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            NetworkError::Timeout
        } else {
            NetworkError::Unreachable(e.to_string())
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
