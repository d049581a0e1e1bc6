//! Client-side handle for configuring and observing one call.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::CallStatus;
use crate::outbound_call::CallCompletion;

/// Controller for managing properties of a single RPC call, on the client
/// side.
///
/// An `RpcController` maps to exactly one call at a time. The client may use
/// it prior to issuing an RPC in order to set properties such as the call's
/// timeout, and after issuing to probe the status of the call.
///
/// Configuration is not meant to be raced with issuing a call. Reading
/// [`status`](Self::status) and [`finished`](Self::finished) from a thread
/// other than the issuing one is race-free, however, since completion is
/// signaled from a reactor thread.
///
/// Misusing the controller is a broken calling contract and panics: setting
/// the timeout while a call is tracked, issuing a new call before
/// [`reset`](Self::reset), or resetting while a call is still in flight.
pub struct RpcController {
    inner: Mutex<Inner>,
}

struct Inner {
    timeout: Duration,
    call: Option<Arc<CallCompletion>>,
}

impl RpcController {
    /// Create a controller with no timeout configured.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                timeout: Duration::ZERO,
                call: None,
            }),
        }
    }

    /// Set the timeout for the call to be made with this controller.
    ///
    /// The configured timeout applies to the entire period between issuing
    /// the request and getting a response, including connection
    /// establishment and queueing. Setting the timeout to zero results in a
    /// call which never times out (not recommended).
    ///
    /// # Panics
    ///
    /// Panics if a call has already been issued; timeouts may not be
    /// adjusted for an in-flight call.
    pub fn set_timeout(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        assert!(
            inner.call.is_none(),
            "timeout must be set before the call is issued"
        );
        inner.timeout = timeout;
    }

    /// The currently configured timeout.
    pub fn timeout(&self) -> Duration {
        self.inner.lock().timeout
    }

    /// Whether the tracked call has reached a terminal state (success,
    /// error, or timeout). False before any call has been issued.
    pub fn finished(&self) -> bool {
        self.inner
            .lock()
            .call
            .as_ref()
            .is_some_and(|call| call.finished())
    }

    /// Current status of the tracked call.
    ///
    /// A call is [`CallStatus::Ok`] until it finishes, at which point it
    /// either remains `Ok` or carries the error that ended it.
    pub fn status(&self) -> CallStatus {
        match &self.inner.lock().call {
            Some(call) => call.status(),
            None => CallStatus::Ok,
        }
    }

    /// The response payload, once the call has finished successfully.
    pub fn response(&self) -> Option<Bytes> {
        self.inner
            .lock()
            .call
            .as_ref()
            .and_then(|call| call.response())
    }

    /// Reset this controller so it may be used with another call, restoring
    /// the default (zero) timeout.
    ///
    /// # Panics
    ///
    /// Panics if the tracked call has not finished.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if let Some(call) = &inner.call {
            assert!(
                call.finished(),
                "cannot reset an RpcController while its call is in flight"
            );
        }
        inner.call = None;
        inner.timeout = Duration::ZERO;
    }

    /// Attach the completion snapshot of a newly issued call.
    ///
    /// # Panics
    ///
    /// Panics if the controller still tracks a previous call; callers must
    /// [`reset`](Self::reset) between calls.
    pub(crate) fn attach_call(&self, completion: Arc<CallCompletion>) {
        let mut inner = self.inner.lock();
        assert!(
            inner.call.is_none(),
            "RpcController already tracks a call; reset() it before reuse"
        );
        inner.call = Some(completion);
    }
}

impl Default for RpcController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use crate::outbound_call::OutboundCall;

    fn issued_call() -> (RpcController, OutboundCall) {
        let controller = RpcController::new();
        controller.set_timeout(Duration::from_secs(5));
        let call = OutboundCall::new(
            "127.0.0.1:7150".parse().unwrap(),
            "Ping",
            Bytes::new(),
            controller.timeout(),
            Box::new(|| {}),
        );
        controller.attach_call(call.completion());
        (controller, call)
    }

    #[test]
    fn test_fresh_controller_is_ok_and_unfinished() {
        let controller = RpcController::new();
        assert!(!controller.finished());
        assert!(controller.status().is_ok());
        assert_eq!(controller.timeout(), Duration::ZERO);
    }

    #[test]
    fn test_status_transitions_once() {
        let (controller, call) = issued_call();
        assert!(!controller.finished());
        assert!(controller.status().is_ok());

        call.finish(Err(RpcError::Aborted));

        assert!(controller.finished());
        assert_eq!(controller.status().error(), Some(&RpcError::Aborted));
        // No further transitions.
        assert_eq!(controller.status().error(), Some(&RpcError::Aborted));
    }

    #[test]
    fn test_reset_restores_defaults() {
        let (controller, call) = issued_call();
        call.finish(Ok(Bytes::from_static(b"pong")));

        controller.reset();
        assert!(!controller.finished());
        assert!(controller.status().is_ok());
        assert_eq!(controller.timeout(), Duration::ZERO);
        assert_eq!(controller.response(), None);
    }

    #[test]
    #[should_panic(expected = "timeout must be set before the call is issued")]
    fn test_set_timeout_after_issue_panics() {
        let (controller, _call) = issued_call();
        controller.set_timeout(Duration::from_secs(1));
    }

    #[test]
    #[should_panic(expected = "reset() it before reuse")]
    fn test_reissue_without_reset_panics() {
        let (controller, call) = issued_call();
        call.finish(Ok(Bytes::new()));
        let another = OutboundCall::new(
            "127.0.0.1:7150".parse().unwrap(),
            "Ping",
            Bytes::new(),
            Duration::ZERO,
            Box::new(|| {}),
        );
        controller.attach_call(another.completion());
    }

    #[test]
    #[should_panic(expected = "while its call is in flight")]
    fn test_reset_in_flight_panics() {
        let (controller, _call) = issued_call();
        controller.reset();
    }
}
