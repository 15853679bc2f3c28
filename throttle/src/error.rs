//! Throttling error types.

/// Errors produced while configuring a schedule or throttling a read.
///
/// Only [`Error::Unusable`] is terminal for a throttler; the remaining variants leave the throttler
/// state untouched and the caller may retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed schedule window or configuration value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The byte counter overflowed, throttling decisions can no longer be made.
    #[error("cannot throttle anymore: max throttled bytes limit reached")]
    Unusable,

    /// The computed pause is longer than the caller is willing to wait.
    #[error("available bandwidth too low: required wait {required:?} exceeds max wait {max_wait:?}")]
    DeadlineExceeded {
        /// Pause needed to bring the average rate back under the target.
        required: std::time::Duration,
        /// Longest pause the caller accepts.
        max_wait: std::time::Duration,
    },

    /// The throttling pause was interrupted before it completed.
    #[error("failed to throttle: wait was interrupted")]
    Interrupted,
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }
}

impl From<Error> for std::io::Error {
    fn from(error: Error) -> Self {
        // never map to ErrorKind::Interrupted, std::io helpers silently retry on it
        let kind = match error {
            Error::DeadlineExceeded { .. } | Error::Interrupted => std::io::ErrorKind::TimedOut,
            Error::InvalidArgument(_) => std::io::ErrorKind::InvalidInput,
            Error::Unusable => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, error)
    }
}

/// Result type for throttling operations.
pub type Result<T> = std::result::Result<T, Error>;
