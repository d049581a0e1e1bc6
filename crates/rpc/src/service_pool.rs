//! Bounded worker pool executing decoded inbound calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::TransportError;
use crate::messenger::Messenger;
use crate::service::{InboundCall, RpcService};

/// A pool of worker threads pulling fully-received inbound calls off a
/// bounded queue and executing them against one service implementation.
///
/// The queue bound is the server's admission control: reactors enqueue with
/// `try_send`, and a call arriving while the queue is at capacity is
/// rejected immediately with a "server too busy" error rather than queued.
pub struct ServicePool {
    service: Arc<dyn RpcService>,
    messenger: Arc<Messenger>,
    queue_rx: flume::Receiver<InboundCall>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl ServicePool {
    /// Create a pool wrapping `service` with a request queue of
    /// `queue_capacity`, and register its queue with `messenger`.
    ///
    /// # Panics
    ///
    /// Panics if the capacity is zero, or if the messenger already has a
    /// service pool registered.
    pub fn new(
        messenger: Arc<Messenger>,
        service: Arc<dyn RpcService>,
        queue_capacity: usize,
    ) -> Self {
        assert!(queue_capacity > 0, "service queue capacity must be positive");
        let (queue_tx, queue_rx) = flume::bounded(queue_capacity);
        messenger.register_service_queue(queue_tx);
        info!(
            service = service.service_name(),
            queue_capacity, "service pool created"
        );
        Self {
            service,
            messenger,
            queue_rx,
            workers: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Start `num_threads` worker threads.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned.
    ///
    /// # Panics
    ///
    /// Panics if the thread count is zero.
    pub fn init(&self, num_threads: usize) -> Result<(), TransportError> {
        assert!(num_threads > 0, "service thread count must be positive");
        let mut workers = self.workers.lock();
        for i in 0..num_threads {
            let service = Arc::clone(&self.service);
            let queue_rx = self.queue_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("rpc-worker-{i}"))
                .spawn(move || worker_loop(&service, &queue_rx))?;
            workers.push(handle);
        }
        Ok(())
    }

    /// Unregister the queue, drain remaining calls, and join the workers.
    /// Idempotent; also invoked from `Drop`.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(service = self.service.service_name(), "service pool shutting down");
        // Dropping the queue's only sender lets each worker finish what is
        // already queued and then observe disconnection.
        self.messenger.unregister_service_queue();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                error!(
                    service = self.service.service_name(),
                    "service worker thread panicked"
                );
            }
        }
    }
}

impl Drop for ServicePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(service: &Arc<dyn RpcService>, queue_rx: &flume::Receiver<InboundCall>) {
    while let Ok(call) = queue_rx.recv() {
        debug!(
            call_id = %call.call_id(),
            method = %call.method(),
            peer = %call.peer(),
            "executing call"
        );
        let result = service.handle_call(&call);
        call.respond(result);
    }
}
