use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by policy-server operations.
///
/// Each variant maps onto a stable HTTP status at the API boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("too many policies for source {group}: at most {max} allowed")]
    QuotaExceeded { group: String, max: usize },

    #[error("tag space exhausted: all {max} tags are in use")]
    TagSpaceExhausted { max: u32 },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    UnsupportedByClientVersion(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("database error: {0}")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// A failed call to an external collaborator.
#[derive(Debug, thiserror::Error)]
#[error("{service}: {message}")]
pub struct UpstreamError {
    service: &'static str,
    message: String,
    retryable: bool,
}

// === impl Error ===

impl Error {
    pub fn bad_request(msg: impl fmt::Display) -> Self {
        Self::BadRequest(msg.to_string())
    }

    pub fn database<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Database(Box::new(error))
    }
}

// === impl UpstreamError ===

impl UpstreamError {
    /// A failure that may succeed if the call is repeated, such as a timeout
    /// or a 5xx response.
    pub fn retryable(service: &'static str, message: impl fmt::Display) -> Self {
        Self {
            service,
            message: message.to_string(),
            retryable: true,
        }
    }

    /// A failure that will recur until something changes, such as a
    /// malformed response.
    pub fn fatal(service: &'static str, message: impl fmt::Display) -> Self {
        Self {
            service,
            message: message.to_string(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn service(&self) -> &'static str {
        self.service
    }
}
