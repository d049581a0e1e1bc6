//! Client-side in-flight call state.
//!
//! An [`OutboundCall`] is owned by the reactor it was assigned to; the
//! issuing thread only ever sees the [`CallCompletion`] snapshot, which the
//! reactor publishes exactly once when the call reaches a terminal state.
//! This keeps the state machine single-threaded while making the outcome
//! safely readable from any thread.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CallStatus, RpcError};
use crate::protocol::{self, RequestEnvelope};

/// Completion callback invoked exactly once when a call reaches a terminal
/// state. Runs inline on the reactor thread and must not block.
pub type CallCallback = Box<dyn FnOnce() + Send + 'static>;

/// State machine of an outbound call. Transitions are driven exclusively by
/// the owning reactor thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallState {
    /// Constructed, not yet handed to a reactor.
    Ready,
    /// Queued for a reactor, or queued on a connection awaiting establishment.
    OnOutboundQueue,
    /// Request bytes written to the connection.
    Sent,
    /// Awaiting a response.
    InFlight,
    /// Terminal: the server responded successfully.
    FinishedSuccess,
    /// Terminal: the call failed with an RPC-layer error.
    FinishedError,
    /// Terminal: the deadline elapsed first.
    FinishedTimeout,
}

/// The atomically-published outcome of a call, shared between the reactor
/// that owns the call and the controller that observes it.
pub(crate) struct CallCompletion {
    finished: AtomicBool,
    result: Mutex<Option<Result<Bytes, RpcError>>>,
}

impl CallCompletion {
    fn new() -> Self {
        Self {
            finished: AtomicBool::new(false),
            result: Mutex::new(None),
        }
    }

    /// Whether the call has reached a terminal state.
    pub(crate) fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Current status: `Ok` until finished, then the terminal outcome.
    pub(crate) fn status(&self) -> CallStatus {
        match &*self.result.lock() {
            Some(Err(e)) => CallStatus::Error(e.clone()),
            _ => CallStatus::Ok,
        }
    }

    /// The successful response payload, if the call finished successfully.
    pub(crate) fn response(&self) -> Option<Bytes> {
        match &*self.result.lock() {
            Some(Ok(payload)) => Some(payload.clone()),
            _ => None,
        }
    }

    /// Publish the terminal result. Returns false if a result was already
    /// published, in which case the new one is discarded.
    fn publish(&self, result: Result<Bytes, RpcError>) -> bool {
        let mut guard = self.result.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(result);
        self.finished.store(true, Ordering::Release);
        true
    }
}

/// One in-flight client request: the unit of work handed from the issuing
/// thread to a reactor.
pub(crate) struct OutboundCall {
    call_id: Uuid,
    remote: SocketAddr,
    method: String,
    request_payload: Bytes,
    deadline: Option<Instant>,
    timeout: Duration,
    state: CallState,
    completion: Arc<CallCompletion>,
    callback: Option<CallCallback>,
}

impl OutboundCall {
    /// Create a call targeting `method` on `remote`.
    ///
    /// A zero `timeout` means the call never times out; otherwise the
    /// deadline starts counting immediately, covering queueing and
    /// connection establishment as well as the response wait.
    pub(crate) fn new(
        remote: SocketAddr,
        method: &str,
        payload: Bytes,
        timeout: Duration,
        callback: CallCallback,
    ) -> Self {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        Self {
            call_id: Uuid::new_v4(),
            remote,
            method: method.to_string(),
            request_payload: payload,
            deadline,
            timeout,
            state: CallState::Ready,
            completion: Arc::new(CallCompletion::new()),
            callback: Some(callback),
        }
    }

    pub(crate) fn call_id(&self) -> Uuid {
        self.call_id
    }

    pub(crate) fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The shared completion snapshot, handed to the controller at issue
    /// time.
    pub(crate) fn completion(&self) -> Arc<CallCompletion> {
        Arc::clone(&self.completion)
    }

    pub(crate) fn set_state(&mut self, state: CallState) {
        debug!(
            call_id = %self.call_id,
            method = %self.method,
            ?state,
            "call state transition"
        );
        self.state = state;
    }

    /// Serialize the request envelope for the wire.
    pub(crate) fn encode_request(&self) -> Result<Bytes, crate::protocol::ProtocolError> {
        let envelope = RequestEnvelope {
            call_id: self.call_id,
            method: self.method.clone(),
            payload: self.request_payload.to_vec(),
        };
        protocol::envelope::encode(&envelope).map(Bytes::from)
    }

    /// Drive the call to a terminal state, publish the outcome, and invoke
    /// the completion callback.
    ///
    /// Consuming `self` plus the publish-once guard in [`CallCompletion`]
    /// guarantees exactly one callback invocation per call.
    pub(crate) fn finish(mut self, result: Result<Bytes, RpcError>) {
        let state = match &result {
            Ok(_) => CallState::FinishedSuccess,
            Err(RpcError::TimedOut(_)) => CallState::FinishedTimeout,
            Err(_) => CallState::FinishedError,
        };
        self.set_state(state);
        if self.completion.publish(result) {
            if let Some(callback) = self.callback.take() {
                callback();
            }
        }
    }
}

impl Drop for OutboundCall {
    /// Backstop for calls dropped without reaching [`finish`](Self::finish)
    /// (e.g. stranded in a queue during shutdown): publish an aborted
    /// outcome so no observer waits forever. After a normal `finish` the
    /// publish here is a no-op.
    fn drop(&mut self) {
        if self.completion.publish(Err(RpcError::Aborted)) {
            if let Some(callback) = self.callback.take() {
                callback();
            }
        }
    }
}

impl std::fmt::Debug for OutboundCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundCall")
            .field("call_id", &self.call_id)
            .field("remote", &self.remote)
            .field("method", &self.method)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_call(callback: CallCallback) -> OutboundCall {
        OutboundCall::new(
            "127.0.0.1:7150".parse().unwrap(),
            "Ping",
            Bytes::from_static(b"payload"),
            Duration::from_secs(5),
            callback,
        )
    }

    #[test]
    fn test_success_publishes_status_and_response() {
        let call = test_call(Box::new(|| {}));
        let completion = call.completion();

        assert!(!completion.finished());
        assert!(completion.status().is_ok());

        call.finish(Ok(Bytes::from_static(b"pong")));

        assert!(completion.finished());
        assert!(completion.status().is_ok());
        assert_eq!(completion.response(), Some(Bytes::from_static(b"pong")));
    }

    #[test]
    fn test_error_publishes_exact_kind() {
        let call = test_call(Box::new(|| {}));
        let completion = call.completion();

        call.finish(Err(RpcError::TimedOut(Duration::from_secs(5))));

        assert_eq!(
            completion.status().error(),
            Some(&RpcError::TimedOut(Duration::from_secs(5)))
        );
        assert_eq!(completion.response(), None);
    }

    #[test]
    fn test_callback_runs_exactly_once() {
        static INVOCATIONS: AtomicUsize = AtomicUsize::new(0);

        let call = test_call(Box::new(|| {
            INVOCATIONS.fetch_add(1, Ordering::SeqCst);
        }));
        call.finish(Ok(Bytes::new()));

        assert_eq!(INVOCATIONS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_timeout_means_no_deadline() {
        let call = OutboundCall::new(
            "127.0.0.1:7150".parse().unwrap(),
            "Ping",
            Bytes::new(),
            Duration::ZERO,
            Box::new(|| {}),
        );
        assert!(call.deadline().is_none());
    }
}
