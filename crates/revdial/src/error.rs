use thiserror::Error;

/// Errors produced by [`Dialer::dial`](crate::Dialer::dial).
#[derive(Debug, Error)]
pub enum DialError {
    /// The control connection is gone; this dialer will never serve again.
    #[error("dialer closed")]
    Closed,

    /// The remote listener reported that its pickup attempt failed.
    #[error("pickup failed: {0}")]
    PickupFailed(String),

    /// The deadline passed to [`Dialer::dial_timeout`](crate::Dialer::dial_timeout) expired.
    #[error("dial timed out")]
    TimedOut,

    /// Sending the `conn-ready` request failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by [`Listener::accept`](crate::Listener::accept).
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The control connection is gone or the listener was closed.
    #[error("listener closed")]
    Closed,
}

/// Errors produced while serving one pickup connection.
#[derive(Debug, Error)]
pub enum PickupError {
    #[error("malformed pickup request: {0}")]
    BadRequest(String),

    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("unknown path: {0}")]
    NotFound(String),

    #[error("unknown dialer: {0}")]
    UnknownDialer(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control-protocol violations. Always fatal to the connection that produced
/// them: the message set is closed, so anything unparseable means the peer is
/// broken or not speaking this protocol.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("control line too long ({0} bytes)")]
    Oversized(usize),

    #[error("malformed control message: {0}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtoError> for std::io::Error {
    fn from(e: ProtoError) -> Self {
        match e {
            ProtoError::Io(io) => io,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}
