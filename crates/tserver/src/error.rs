//! Error types for tablet server startup.

use tabletd_rpc::TransportError;
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors fatal to server startup. A running server is not affected by
/// these; programmer-contract violations (double tablet registration,
/// start before init) panic instead.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A configured bind address could not be parsed or resolved.
    #[error("failed to parse address {entry:?}: {detail}")]
    AddressParse {
        /// The offending entry from the bind address list.
        entry: String,
        /// Description of the parse or resolution failure.
        detail: String,
    },

    /// The RPC transport failed to come up.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
