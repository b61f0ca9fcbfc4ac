//! Contains the `Error` and `Result` types that `switchboard` uses.

use std::sync::Arc;

use thiserror::Error;

/// The result type for all methods that can return an error in the `switchboard` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `switchboard` crate. The inner
/// [`ErrorKind`] is boxed to keep the type cheap to move, and IO errors are
/// reference-counted so that errors can be cloned into event payloads.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    logged: bool,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            logged: false,
        }
    }

    /// Creates a `Protocol` error with the provided message.
    pub fn protocol(message: impl Into<String>) -> Error {
        ErrorKind::Protocol {
            message: message.into(),
        }
        .into()
    }

    /// Creates a `TooManyConnections` admission-control error.
    pub fn too_many_connections() -> Error {
        ErrorKind::TooManyConnections.into()
    }

    /// Creates a `TimedOut` error with the provided message.
    pub fn timed_out(message: impl Into<String>) -> Error {
        ErrorKind::TimedOut {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    /// Whether this error is a framing or state violation.
    pub fn is_protocol(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Protocol { .. })
    }

    /// Whether this error was raised by the connection admission limit.
    pub fn is_too_many_connections(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::TooManyConnections)
    }

    /// Whether this error was caused by a timeout.
    pub fn is_timed_out(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::TimedOut { .. })
    }

    /// Whether this error was surfaced by the transport layer.
    pub fn is_io(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(_))
    }

    /// Whether this error has already been reported to the log output.
    ///
    /// The reconnect policy sets this to suppress duplicate log lines for
    /// stale keep-alive connections.
    pub fn logged(&self) -> bool {
        self.logged
    }

    /// Marks this error as already reported, suppressing further output from
    /// [`log`](Error::log).
    pub fn set_logged(&mut self, logged: bool) {
        self.logged = logged;
    }

    /// Reports this error once and marks it as logged.
    pub fn log(&mut self) {
        if !self.logged {
            tracing::error!(error = %self, "failure");
            self.logged = true;
        }
    }
}

/// Reports `error` unless it has already been logged.
pub(crate) fn log_failure(error: &Error) {
    if !error.logged {
        tracing::error!(error = %error, "failure");
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::new(ErrorKind::Io(Arc::new(error)))
    }
}

impl From<std::io::ErrorKind> for Error {
    fn from(kind: std::io::ErrorKind) -> Self {
        Self::new(ErrorKind::Io(Arc::new(kind.into())))
    }
}

/// The types of errors that can occur.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A consumer violated the framing contract, e.g. by handing back
    /// residual bytes without retiring first.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The producer's connection admission limit was exceeded.
    #[error("too many connections")]
    TooManyConnections,

    /// An operation or idle connection timed out.
    #[error("{message}")]
    TimedOut { message: String },

    /// Wrapper around an IO error surfaced by a transport.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// An unexpected internal state was reached.
    #[error("internal error: {message}")]
    Internal { message: String },
}
