//! Client entry point for issuing calls against one remote.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::controller::RpcController;
use crate::error::RpcError;
use crate::messenger::Messenger;
use crate::outbound_call::OutboundCall;

/// A proxy for issuing RPCs to a single remote address through a messenger.
///
/// The proxy itself is stateless and cheap; per-call configuration and
/// outcome live on the [`RpcController`] passed to each request.
pub struct Proxy {
    messenger: Arc<Messenger>,
    remote: SocketAddr,
}

impl Proxy {
    /// Create a proxy targeting `remote`.
    pub fn new(messenger: Arc<Messenger>, remote: SocketAddr) -> Self {
        Self { messenger, remote }
    }

    /// The remote address this proxy targets.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Issue an asynchronous call.
    ///
    /// The controller's configured timeout is captured at issue time. The
    /// callback is invoked exactly once, on a reactor thread, when the call
    /// reaches a terminal state; it must not block. After it runs, the
    /// controller's [`status`](RpcController::status) carries the outcome.
    ///
    /// # Panics
    ///
    /// Panics if the controller already tracks a call that has not been
    /// [`reset`](RpcController::reset).
    pub fn async_request(
        &self,
        method: &str,
        payload: Bytes,
        controller: &RpcController,
        callback: impl FnOnce() + Send + 'static,
    ) {
        let call = OutboundCall::new(
            self.remote,
            method,
            payload,
            controller.timeout(),
            Box::new(callback),
        );
        debug!(call_id = %call.call_id(), method, remote = %self.remote, "issuing call");
        controller.attach_call(call.completion());
        self.messenger.queue_outbound_call(call);
    }

    /// Issue a call and block until it finishes.
    ///
    /// Must not be called from a reactor thread, since it waits on the
    /// completion that a reactor delivers.
    ///
    /// # Errors
    ///
    /// Returns the RPC-layer error that ended the call, if any.
    ///
    /// # Panics
    ///
    /// Panics if the controller already tracks a call that has not been
    /// [`reset`](RpcController::reset).
    pub fn request(
        &self,
        method: &str,
        payload: Bytes,
        controller: &RpcController,
    ) -> Result<Bytes, RpcError> {
        let (done_tx, done_rx) = flume::bounded(1);
        self.async_request(method, payload, controller, move || {
            let _ = done_tx.send(());
        });
        let _ = done_rx.recv();
        if let Some(error) = controller.status().error() {
            return Err(error.clone());
        }
        controller.response().ok_or(RpcError::Aborted)
    }
}
