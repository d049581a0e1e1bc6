//! Tablet server configuration.

/// Port used for RPC when a bind address entry omits one.
pub const DEFAULT_RPC_PORT: u16 = 7150;

/// Configuration for a [`crate::TabletServer`].
///
/// Thread counts are fixed before `start()` and not adjustable afterward.
#[derive(Debug, Clone)]
pub struct TabletServerOptions {
    /// Comma-separated list of `host[:port]` entries to bind the RPC
    /// server to. Entries without a port get [`DEFAULT_RPC_PORT`].
    pub rpc_bind_addresses: String,
    /// Number of reactor threads in the messenger.
    pub num_rpc_reactors: usize,
    /// Number of acceptor threads per bound address.
    pub num_acceptors_per_address: usize,
    /// Number of service pool worker threads.
    pub num_service_threads: usize,
    /// Bound of the service pool's request queue; calls arriving beyond it
    /// are rejected as busy rather than queued.
    pub service_queue_depth: usize,
}

impl Default for TabletServerOptions {
    fn default() -> Self {
        Self {
            rpc_bind_addresses: format!("0.0.0.0:{DEFAULT_RPC_PORT}"),
            num_rpc_reactors: 1,
            num_acceptors_per_address: 1,
            num_service_threads: 10,
            service_queue_depth: 50,
        }
    }
}
