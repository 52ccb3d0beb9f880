use thiserror::Error;

/// Errors surfaced by the engine and its components.
#[derive(Debug, Error)]
pub enum Error {
    /// The input was not a canonical slash path.
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// The input bytes were not valid JSON.
    #[error("invalid json: {0}")]
    InvalidJson(String),
    /// A stored leaf could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// No leaf and no children at the requested path.
    #[error("not found")]
    NotFound,
    /// The rule evaluator denied the operation.
    #[error("forbidden")]
    Forbidden,
    /// The backend reported a write/write conflict.
    #[error("transaction conflict")]
    Conflict,
    /// The backend ran out of space.
    #[error("backend full")]
    BackendFull,
    /// The backend detected on-disk corruption.
    #[error("backend corruption: {0}")]
    BackendCorruption(String),
    /// An io failure in the backend.
    #[error("backend io: {0}")]
    BackendIo(String),
    /// Token operations require `enable_auth` first.
    #[error("auth is not enabled")]
    AuthDisabled,
    /// The token failed signature or claim validation.
    #[error("invalid token")]
    InvalidToken,
    /// The token is past its expiry.
    #[error("token expired")]
    TokenExpired,
    /// The rule document was structurally invalid. The previous
    /// document stays loaded.
    #[error("rule parse error: {0}")]
    RuleParse(String),
    /// The async write queue was shut down before the operation completed.
    #[error("write queue closed")]
    QueueClosed,
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Io(e) if e.raw_os_error() == Some(28) => Error::BackendFull,
            sled::Error::Io(e) => Error::BackendIo(e.to_string()),
            sled::Error::Corruption { .. } => Error::BackendCorruption(err.to_string()),
            sled::Error::ReportableBug(s) => Error::BackendCorruption(s),
            sled::Error::Unsupported(s) => Error::BackendIo(s),
            sled::Error::CollectionNotFound(_) => Error::BackendCorruption(err.to_string()),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
