//! Error types for the cache client.

use thiserror::Error;

/// Result type alias for cache client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the cache client.
///
/// Every public operation consults the effective "throw" flag; when it is
/// off, faults are converted to `None` / empty results / zero-width latches
/// after being counted, and these variants are only visible in logs.
#[derive(Error, Debug)]
pub enum Error {
    /// Key failed validation (empty, whitespace, too long without hashing).
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A write was issued without a usable value, or encoding failed.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// TTL failed validation (see the write path TTL rules).
    #[error("invalid ttl {ttl}: {reason}")]
    InvalidTtl { ttl: u64, reason: &'static str },

    /// The pool had no replica for the required role.
    #[error("no replica available for app {app}")]
    NoReplica { app: String },

    /// An event listener rejected the call.
    #[error("request throttled for app {app}, key {key}")]
    Throttled { app: String, key: String },

    /// A replica operation exceeded its deadline. The message names the
    /// timeout property the caller can raise.
    #[error("{0}")]
    Timeout(String),

    /// The replica connection is unavailable.
    #[error("connect error: {0}")]
    Connect(String),

    /// The replica's read queue is saturated.
    #[error("read queue full: {0}")]
    ReadQueueFull(String),

    /// A hashed-key envelope carried a different canonical key than the one
    /// requested. Surfaced as a miss by the orchestrator, never thrown.
    #[error("hashed key collision for key {key}")]
    Collision { key: String },

    /// Transcoder failed to encode or decode a payload.
    #[error("transcode error: {0}")]
    Transcode(String),

    /// Any other collaborator fault.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    /// Rebuild an equivalent error from a shared reference.
    ///
    /// The near cache hands load failures back as `Arc<Error>`; all variants
    /// carry owned printable data, so the copy is exact.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::InvalidKey(m) => Error::InvalidKey(m.clone()),
            Error::InvalidValue(m) => Error::InvalidValue(m.clone()),
            Error::InvalidTtl { ttl, reason } => Error::InvalidTtl {
                ttl: *ttl,
                reason,
            },
            Error::NoReplica { app } => Error::NoReplica { app: app.clone() },
            Error::Throttled { app, key } => Error::Throttled {
                app: app.clone(),
                key: key.clone(),
            },
            Error::Timeout(m) => Error::Timeout(m.clone()),
            Error::Connect(m) => Error::Connect(m.clone()),
            Error::ReadQueueFull(m) => Error::ReadQueueFull(m.clone()),
            Error::Collision { key } => Error::Collision { key: key.clone() },
            Error::Transcode(m) => Error::Transcode(m.clone()),
            Error::Unexpected(m) => Error::Unexpected(m.clone()),
        }
    }

    /// Whether this error should be recorded as a timeout in metrics.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Transcode(e.to_string())
    }
}
