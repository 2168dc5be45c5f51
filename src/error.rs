//! Custom error types for feature-mailer.

use std::fmt;
use std::io;

/// Main error type for sync and reporting operations.
#[derive(Debug)]
pub enum Error {
    /// I/O errors (file operations, directory creation)
    Io(io::Error),
    /// Invalid configuration (storage policy, addresses, URLs)
    Config(String),
    /// A collection or item id that does not resolve
    NotFound(String),
    /// Error payload returned by the feature service
    Remote { code: Option<i64>, message: String },
    /// HTTP transport errors
    Http(String),
    /// Unexpected response shape
    Parse(String),
    /// Message building or SMTP delivery errors
    Mail(String),
}

impl Error {
    /// Whether this error affects a single unit of work (one layer, record or
    /// attachment) rather than the whole run.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Remote { .. } | Self::Http(_) | Self::Parse(_) | Self::Mail(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::NotFound(id) => write!(f, "not found: {id}"),
            Self::Remote {
                code: Some(code),
                message,
            } => write!(f, "service error {code}: {message}"),
            Self::Remote {
                code: None,
                message,
            } => write!(f, "service error: {message}"),
            Self::Http(msg) => write!(f, "HTTP error: {msg}"),
            Self::Parse(msg) => write!(f, "parse error: {msg}"),
            Self::Mail(msg) => write!(f, "mail error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Parse(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

impl From<lettre::error::Error> for Error {
    fn from(e: lettre::error::Error) -> Self {
        Self::Mail(e.to_string())
    }
}

impl From<lettre::address::AddressError> for Error {
    fn from(e: lettre::address::AddressError) -> Self {
        Self::Config(format!("invalid email address: {e}"))
    }
}

impl From<lettre::transport::smtp::Error> for Error {
    fn from(e: lettre::transport::smtp::Error) -> Self {
        Self::Mail(e.to_string())
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io_err) => io_err,
            other => Self::other(other.to_string()),
        }
    }
}

/// Result type alias for feature-mailer operations.
pub type Result<T> = std::result::Result<T, Error>;
