//! Tablet server lifecycle and orchestration.

use std::net::SocketAddr;
use std::sync::Arc;

use tabletd_rpc::{Messenger, MessengerBuilder, ServicePool, is_privileged_port};
use tracing::{info, warn};

use crate::error::Result;
use crate::net_util::parse_address_list;
use crate::options::{DEFAULT_RPC_PORT, TabletServerOptions};
use crate::service::TabletServiceImpl;
use crate::tablet::{Tablet, TabletRegistry};

/// The tablet server: binds the configured addresses, runs the RPC
/// transport, and hosts a single registered tablet reachable by id lookup.
pub struct TabletServer {
    options: TabletServerOptions,
    initted: bool,
    rpc_bind_addresses: Vec<SocketAddr>,
    messenger: Option<Arc<Messenger>>,
    service_pool: Option<ServicePool>,
    tablets: Arc<TabletRegistry>,
}

impl TabletServer {
    /// Create an unstarted server from `options`.
    pub fn new(options: TabletServerOptions) -> Self {
        Self {
            options,
            initted: false,
            rpc_bind_addresses: Vec::new(),
            messenger: None,
            service_pool: None,
            tablets: Arc::new(TabletRegistry::new()),
        }
    }

    /// The configuration this server was built with.
    pub fn options(&self) -> &TabletServerOptions {
        &self.options
    }

    /// Parse and validate the configured bind address list.
    ///
    /// Fails without mutating further state if any entry fails to parse, so
    /// a failed init may be retried.
    ///
    /// # Errors
    ///
    /// Returns an error if any bind address entry is malformed.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn init(&mut self) -> Result<()> {
        assert!(!self.initted, "TabletServer already initialized");
        let addresses = parse_address_list(&self.options.rpc_bind_addresses, DEFAULT_RPC_PORT)?;
        for addr in &addresses {
            if is_privileged_port(addr.port()) {
                warn!("may be unable to bind to privileged port for address {addr}");
            }
        }
        self.rpc_bind_addresses = addresses;
        self.initted = true;
        Ok(())
    }

    /// The parsed bind addresses, as of a successful [`init`](Self::init).
    pub fn rpc_bind_addresses(&self) -> &[SocketAddr] {
        &self.rpc_bind_addresses
    }

    /// Build the messenger, add one acceptor pool per bind address, and
    /// start the service pool against the tablet service.
    ///
    /// # Errors
    ///
    /// Returns an error if any address fails to bind or the transport fails
    /// to come up; nothing keeps running in that case.
    ///
    /// # Panics
    ///
    /// Panics if [`init`](Self::init) has not succeeded, or if the server
    /// was already started.
    pub fn start(&mut self) -> Result<()> {
        assert!(self.initted, "TabletServer::init() must succeed before start()");
        assert!(self.messenger.is_none(), "TabletServer already started");

        let messenger = MessengerBuilder::new(self.to_string())
            .set_num_reactors(self.options.num_rpc_reactors)
            .build()?;

        for addr in &self.rpc_bind_addresses {
            messenger.add_acceptor_pool(*addr, self.options.num_acceptors_per_address)?;
        }

        let service = Arc::new(TabletServiceImpl::new(Arc::clone(&self.tablets)));
        let service_pool = ServicePool::new(
            Arc::clone(&messenger),
            service,
            self.options.service_queue_depth,
        );
        service_pool.init(self.options.num_service_threads)?;

        info!(
            "{self} serving on {:?}",
            messenger.acceptor_addresses()
        );
        self.messenger = Some(messenger);
        self.service_pool = Some(service_pool);
        Ok(())
    }

    /// The concrete addresses each acceptor pool ended up bound to, with
    /// wildcard and ephemeral bindings resolved.
    ///
    /// # Panics
    ///
    /// Panics if [`init`](Self::init) has not succeeded.
    pub fn bound_addresses(&self) -> Vec<SocketAddr> {
        assert!(self.initted, "TabletServer not initialized");
        self.messenger
            .as_ref()
            .map(|messenger| messenger.acceptor_addresses())
            .unwrap_or_default()
    }

    /// Register the tablet this server hosts.
    ///
    /// # Panics
    ///
    /// Panics if a tablet is already registered.
    pub fn register_tablet(&self, tablet: Arc<dyn Tablet>) {
        self.tablets.register(tablet);
    }

    /// Look up a registered tablet by id.
    pub fn lookup_tablet(&self, tablet_id: &str) -> Option<Arc<dyn Tablet>> {
        self.tablets.lookup(tablet_id)
    }

    /// Stop the service pool and the RPC transport. Idempotent; also runs
    /// from `Drop`.
    pub fn shutdown(&mut self) {
        if let Some(service_pool) = self.service_pool.take() {
            service_pool.shutdown();
        }
        if let Some(messenger) = self.messenger.take() {
            messenger.shutdown();
        }
    }
}

impl std::fmt::Display for TabletServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TabletServer")
    }
}

impl Drop for TabletServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
