//! Thread-per-reactor RPC transport for the tablet server.
//!
//! The transport is built from a handful of cooperating pieces, none of
//! which share a lock on the hot path:
//!
//! - [`RpcController`]: per-call client-side handle for configuration
//!   (timeout) and observable outcome (status, finished flag).
//! - [`Messenger`]: owns a fixed pool of reactor threads and all acceptor
//!   pools; routes new outbound calls and inbound connections to reactors.
//! - Reactors: one thread each, multiplexing a disjoint subset of open
//!   connections with an explicit poll loop, expiring per-call deadlines
//!   and invoking completion callbacks inline.
//! - [`AcceptorPool`]: blocking-accept threads per bound address.
//! - [`ServicePool`]: bounded worker pool executing decoded inbound calls
//!   against an [`RpcService`] implementation, rejecting work with a busy
//!   error when its queue is full.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use bytes::Bytes;
//! use tabletd_rpc::{MessengerBuilder, Proxy, RpcController};
//!
//! fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let messenger = MessengerBuilder::new("client")
//!         .set_num_reactors(2)
//!         .build()?;
//!
//!     let proxy = Proxy::new(messenger, "10.0.0.1:7150".parse()?);
//!     let controller = RpcController::new();
//!     controller.set_timeout(Duration::from_secs(5));
//!
//!     let response = proxy.request("Ping", Bytes::from("hello"), &controller)?;
//!     println!("{response:?}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod acceptor;
mod connection;
pub mod controller;
pub mod error;
pub mod messenger;
mod outbound_call;
pub mod protocol;
pub mod proxy;
mod reactor;
pub mod service;
pub mod service_pool;

pub use acceptor::{AcceptorPool, is_privileged_port};
pub use controller::RpcController;
pub use error::{CallStatus, RpcError, Result, TransportError};
pub use messenger::{Messenger, MessengerBuilder};
pub use proxy::Proxy;
pub use service::{InboundCall, RpcService, ServiceError};
pub use service_pool::ServicePool;

// Re-export dependencies that are part of our public API.
pub use bytes::Bytes;
