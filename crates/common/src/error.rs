use thiserror::Error;

/// The error kinds named in the executor's error-handling design: not a
/// type per kind, but a tag carried on [`Error`] so callers can match on
/// `.kind()` the way the propagation rules are written (retry, drop,
/// latch, abort).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientNetwork,
    RateLimitedByVenue,
    PostOnlyReject,
    DuplicateClientId,
    OrderNotFound,
    PrecisionViolation,
    ReduceOnlyViolation,
    ExternalConflict,
    FatalConfig,
    FatalAuth,
    /// Uncategorized; treated like a precision/reduce-only violation —
    /// logged and dropped, the next tick reconciles.
    Other,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("rate limited by venue: {0}")]
    RateLimitedByVenue(String),

    #[error("post-only order would have crossed the book: {0}")]
    PostOnlyReject(String),

    #[error("duplicate client order id: {0}")]
    DuplicateClientId(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("precision violation: {0}")]
    PrecisionViolation(String),

    #[error("reduce-only violation: {0}")]
    ReduceOnlyViolation(String),

    #[error("external conflict: {0}")]
    ExternalConflict(String),

    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("fatal authentication error: {0}")]
    FatalAuth(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The propagation tag a caller should switch on, per the error
    /// handling design: retry, drop-and-reconcile, latch, or abort.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TransientNetwork(_) | Error::WebSocket(_) | Error::Http(_) => {
                ErrorKind::TransientNetwork
            }
            Error::RateLimitedByVenue(_) => ErrorKind::RateLimitedByVenue,
            Error::PostOnlyReject(_) => ErrorKind::PostOnlyReject,
            Error::DuplicateClientId(_) => ErrorKind::DuplicateClientId,
            Error::OrderNotFound(_) => ErrorKind::OrderNotFound,
            Error::PrecisionViolation(_) => ErrorKind::PrecisionViolation,
            Error::ReduceOnlyViolation(_) => ErrorKind::ReduceOnlyViolation,
            Error::ExternalConflict(_) => ErrorKind::ExternalConflict,
            Error::FatalConfig(_) => ErrorKind::FatalConfig,
            Error::FatalAuth(_) => ErrorKind::FatalAuth,
            Error::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::FatalConfig | ErrorKind::FatalAuth)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
