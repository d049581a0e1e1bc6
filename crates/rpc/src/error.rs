//! Error types for the RPC transport.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::ErrorCode;

/// Result type alias for transport setup operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors surfaced through [`crate::RpcController::status`] for a single
/// call.
///
/// These are RPC-layer failures, never application-level response contents.
/// They are published by a reactor thread and read by the calling thread, so
/// the type is cheap to clone.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// A connection to the remote could not be established.
    #[error("failed to connect to {addr}: {detail}")]
    ConnectionFailed {
        /// The remote address.
        addr: SocketAddr,
        /// Description of the underlying failure.
        detail: String,
    },

    /// The server rejected the call because its service queue is at
    /// capacity.
    #[error("server too busy: {0}")]
    ServerTooBusy(String),

    /// The server could not interpret or execute the request.
    #[error("remote call failed ({code}): {message}")]
    Remote {
        /// Wire-level error code reported by the server.
        code: ErrorCode,
        /// Server-provided description.
        message: String,
    },

    /// The connection was torn down after the request was sent but before a
    /// response arrived.
    #[error("connection to {addr} torn down: {detail}")]
    ConnectionTornDown {
        /// The remote address.
        addr: SocketAddr,
        /// Description of the underlying failure.
        detail: String,
    },

    /// The configured deadline elapsed without a terminal response.
    #[error("call timed out after {0:?}")]
    TimedOut(Duration),

    /// The messenger was shut down while the call was in flight.
    #[error("call aborted: messenger shutting down")]
    Aborted,
}

/// Observable status of a single call, as reported by
/// [`crate::RpcController::status`].
///
/// A call is `Ok` until it finishes, at which point it either remains `Ok`
/// (the call succeeded) or carries the [`RpcError`] that ended it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CallStatus {
    /// The call is in flight, has not been issued, or finished successfully.
    #[default]
    Ok,
    /// The call finished with an RPC-layer error.
    Error(RpcError),
}

impl CallStatus {
    /// Whether the status is `Ok`.
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// The error that ended the call, if any.
    pub const fn error(&self) -> Option<&RpcError> {
        match self {
            Self::Ok => None,
            Self::Error(e) => Some(e),
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::Error(e) => write!(f, "{e}"),
        }
    }
}

/// Errors from messenger and acceptor setup.
///
/// These are returned to the caller of `build`/`add_acceptor_pool` and are
/// fatal to startup, unlike the per-call [`RpcError`] taxonomy.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to bind a listening socket.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        /// The requested bind address.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Generic I/O error during setup.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The messenger has already been shut down.
    #[error("messenger is shut down")]
    ShutDown,
}
