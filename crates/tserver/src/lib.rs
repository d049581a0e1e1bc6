//! Tablet server: orchestration of the RPC transport around a single
//! tablet.
//!
//! [`TabletServer`] ties the pieces of `tabletd-rpc` together: it parses
//! and validates the configured bind addresses, builds the messenger, adds
//! one acceptor pool per address, and attaches a service pool bound to the
//! tablet RPC service. The tablet itself is an external capability reached
//! only through [`Tablet`] lookup by id.

pub mod error;
pub mod net_util;
pub mod options;
pub mod server;
pub mod service;
pub mod tablet;

pub use error::{Result, ServerError};
pub use options::{DEFAULT_RPC_PORT, TabletServerOptions};
pub use server::TabletServer;
pub use service::TabletServiceImpl;
pub use tablet::{Tablet, TabletRegistry};
