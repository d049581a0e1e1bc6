//! The service implementation capability consumed by the service pool.

use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::{ErrorCode, ResponseEnvelope};
use crate::reactor::Responder;

/// A service implementation that executes decoded inbound calls.
///
/// Implementations must be safe to invoke from any service-pool worker
/// thread. Each call is executed synchronously within the calling worker.
pub trait RpcService: Send + Sync + 'static {
    /// Diagnostic name of this service.
    fn service_name(&self) -> &'static str;

    /// Execute one decoded call, producing a response payload or a typed
    /// error.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] that is sent back to the client as an
    /// error response.
    fn handle_call(&self, call: &InboundCall) -> Result<Bytes, ServiceError>;
}

/// A typed error produced by a service implementation.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ServiceError {
    /// Wire-level error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServiceError {
    /// The requested method is not known to this service.
    pub fn unknown_method(method: &str) -> Self {
        Self {
            code: ErrorCode::UnknownMethod,
            message: format!("unknown method: {method}"),
        }
    }

    /// The request payload could not be interpreted.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidRequest,
            message: message.into(),
        }
    }

    /// The call executed but failed at the application level.
    pub fn application(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ApplicationError,
            message: message.into(),
        }
    }
}

/// A fully-received inbound call, queued by a reactor and executed by a
/// service-pool worker.
pub struct InboundCall {
    call_id: Uuid,
    method: String,
    payload: Bytes,
    peer: SocketAddr,
    responder: Responder,
}

impl InboundCall {
    pub(crate) fn new(
        call_id: Uuid,
        method: String,
        payload: Bytes,
        peer: SocketAddr,
        responder: Responder,
    ) -> Self {
        Self {
            call_id,
            method,
            payload,
            peer,
            responder,
        }
    }

    /// Unique call id assigned by the client.
    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    /// The requested method identifier.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The serialized request payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Address of the calling peer.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Hand the result back to the owning reactor for writing to the
    /// connection.
    pub(crate) fn respond(self, result: Result<Bytes, ServiceError>) {
        let envelope = match result {
            Ok(payload) => ResponseEnvelope::success(self.call_id, payload.to_vec()),
            Err(e) => ResponseEnvelope::failure(self.call_id, e.code, e.message),
        };
        if !self.responder.respond(envelope) {
            debug!(
                call_id = %self.call_id,
                peer = %self.peer,
                "reactor is gone; dropping response"
            );
        }
    }
}

impl std::fmt::Debug for InboundCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundCall")
            .field("call_id", &self.call_id)
            .field("method", &self.method)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
