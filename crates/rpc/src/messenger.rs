//! The messenger: aggregate owner of reactors and acceptor pools for one
//! process.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::acceptor::AcceptorPool;
use crate::error::TransportError;
use crate::outbound_call::OutboundCall;
use crate::reactor::{ReactorHandle, ReactorOp};
use crate::service::InboundCall;

/// State shared between the messenger and its reactor threads.
#[derive(Default)]
pub(crate) struct MessengerShared {
    /// Queue into the registered service pool, if any. Reactors feed
    /// complete inbound calls through here.
    service_queue: Mutex<Option<flume::Sender<InboundCall>>>,
}

impl MessengerShared {
    pub(crate) fn service_queue(&self) -> Option<flume::Sender<InboundCall>> {
        self.service_queue.lock().clone()
    }
}

/// Builder for a [`Messenger`].
pub struct MessengerBuilder {
    name: String,
    num_reactors: usize,
}

impl MessengerBuilder {
    /// Start building a messenger with the given diagnostic name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            num_reactors: 1,
        }
    }

    /// Set the number of reactor threads (default 1).
    #[must_use]
    pub fn set_num_reactors(mut self, num_reactors: usize) -> Self {
        self.num_reactors = num_reactors;
        self
    }

    /// Construct the messenger and start all reactor threads.
    ///
    /// # Errors
    ///
    /// Returns an error if a reactor's poll instance or thread cannot be
    /// created.
    ///
    /// # Panics
    ///
    /// Panics if the reactor count is zero.
    pub fn build(self) -> Result<Arc<Messenger>, TransportError> {
        assert!(self.num_reactors > 0, "reactor count must be positive");
        let shared = Arc::new(MessengerShared::default());
        let mut reactors = Vec::with_capacity(self.num_reactors);
        for i in 0..self.num_reactors {
            reactors.push(ReactorHandle::spawn(
                format!("{}-reactor-{i}", self.name),
                Arc::clone(&shared),
            )?);
        }
        info!(
            "messenger {} started with {} reactors",
            self.name, self.num_reactors
        );
        Ok(Arc::new(Messenger {
            name: self.name,
            reactors,
            acceptor_pools: Mutex::new(Vec::new()),
            shared,
            next_inbound_reactor: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
        }))
    }
}

/// Owns a fixed pool of reactors and all acceptor pools, and routes new
/// outbound calls and inbound connections to reactors.
///
/// Built once at startup; [`shutdown`](Self::shutdown) is idempotent and
/// also runs from the destructor.
pub struct Messenger {
    name: String,
    reactors: Vec<ReactorHandle>,
    acceptor_pools: Mutex<Vec<Arc<AcceptorPool>>>,
    shared: Arc<MessengerShared>,
    next_inbound_reactor: AtomicUsize,
    shutting_down: AtomicBool,
}

impl Messenger {
    /// The diagnostic name given at build time.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create and start an acceptor pool for `addr` with `num_acceptors`
    /// threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound, or
    /// [`TransportError::ShutDown`] after shutdown.
    pub fn add_acceptor_pool(
        self: &Arc<Self>,
        addr: SocketAddr,
        num_acceptors: usize,
    ) -> Result<SocketAddr, TransportError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(TransportError::ShutDown);
        }
        let pool = Arc::new(AcceptorPool::bind(addr)?);
        pool.start(num_acceptors, self)?;
        let bound = pool.bound_address();
        self.acceptor_pools.lock().push(pool);
        Ok(bound)
    }

    /// The concrete address of every live acceptor, with wildcard and
    /// ephemeral bindings resolved. Used for operational reporting.
    pub fn acceptor_addresses(&self) -> Vec<SocketAddr> {
        self.acceptor_pools
            .lock()
            .iter()
            .map(|pool| pool.bound_address())
            .collect()
    }

    /// Register the bounded queue of a service pool. Reactors feed inbound
    /// calls through it; without one, inbound calls are rejected as busy.
    ///
    /// # Panics
    ///
    /// Panics if a service pool is already registered.
    pub(crate) fn register_service_queue(&self, queue: flume::Sender<InboundCall>) {
        let mut guard = self.shared.service_queue.lock();
        assert!(
            guard.is_none(),
            "a service pool is already registered with this messenger"
        );
        *guard = Some(queue);
    }

    pub(crate) fn unregister_service_queue(&self) {
        self.shared.service_queue.lock().take();
    }

    /// Hand a newly issued call to a reactor. Calls targeting the same
    /// remote hash to the same reactor so its connection gets reused.
    pub(crate) fn queue_outbound_call(&self, call: OutboundCall) {
        if self.shutting_down.load(Ordering::SeqCst) {
            call.finish(Err(crate::error::RpcError::Aborted));
            return;
        }
        let mut hasher = DefaultHasher::new();
        call.remote().hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let idx = (hasher.finish() as usize) % self.reactors.len();
        debug!(
            messenger = %self.name,
            call_id = %call.call_id(),
            method = %call.method(),
            remote = %call.remote(),
            reactor = idx,
            "queueing outbound call"
        );
        if let Err(ReactorOp::AssignOutbound(call)) =
            self.reactors[idx].submit(ReactorOp::AssignOutbound(call))
        {
            call.finish(Err(crate::error::RpcError::Aborted));
        }
    }

    /// Assign a newly accepted connection to the next reactor round-robin.
    pub(crate) fn assign_inbound(&self, stream: std::net::TcpStream, peer: SocketAddr) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let idx = self.next_inbound_reactor.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        // A failed submit drops the stream, closing the connection.
        let _ = self.reactors[idx].submit(ReactorOp::AssignInbound { stream, peer });
    }

    /// Stop all acceptor pools and reactors, cancelling in-flight calls
    /// with an aborted status. Idempotent; also invoked from `Drop`.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("messenger {} shutting down", self.name);
        let pools = std::mem::take(&mut *self.acceptor_pools.lock());
        for pool in pools {
            pool.shutdown();
        }
        for reactor in &self.reactors {
            reactor.shutdown();
        }
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("name", &self.name)
            .field("reactors", &self.reactors.len())
            .finish_non_exhaustive()
    }
}
