//! Call envelopes carried inside frames.
//!
//! A request frame carries a [`RequestEnvelope`]; response and error frames
//! carry a [`ResponseEnvelope`]. Responses are matched to requests by call
//! id, not by arrival order, since the service pool may complete calls out
//! of submission order.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ProtocolError;
use crate::error::RpcError;

/// Wire format of one outbound request.
#[derive(Debug, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique call id for correlation.
    pub call_id: Uuid,
    /// Target method identifier.
    pub method: String,
    /// Serialized request payload.
    pub payload: Vec<u8>,
}

/// Wire format of one response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Call id this response is for.
    pub call_id: Uuid,
    /// Serialized response payload; empty on error.
    pub payload: Vec<u8>,
    /// Error if the call failed on the server side.
    pub error: Option<ErrorInfo>,
}

impl ResponseEnvelope {
    /// Build a successful response.
    pub fn success(call_id: Uuid, payload: Vec<u8>) -> Self {
        Self {
            call_id,
            payload,
            error: None,
        }
    }

    /// Build an error response.
    pub fn failure(call_id: Uuid, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            call_id,
            payload: Vec::new(),
            error: Some(ErrorInfo {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Error information for failed calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error code for categorization.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
}

impl From<ErrorInfo> for RpcError {
    fn from(info: ErrorInfo) -> Self {
        match info.code {
            ErrorCode::ServerTooBusy => Self::ServerTooBusy(info.message),
            code => Self::Remote {
                code,
                message: info.message,
            },
        }
    }
}

/// Wire-level error codes reported by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The service queue is at capacity; the call was rejected, not queued.
    ServerTooBusy,
    /// The requested method is not known to the service.
    UnknownMethod,
    /// The request could not be interpreted.
    InvalidRequest,
    /// The service executed the call and reported an error.
    ApplicationError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ServerTooBusy => "server too busy",
            Self::UnknownMethod => "unknown method",
            Self::InvalidRequest => "invalid request",
            Self::ApplicationError => "application error",
        };
        f.write_str(name)
    }
}

/// Serialize an envelope to wire bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode<T: Serialize>(envelope: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serialize(envelope).map_err(|e| ProtocolError::Codec(e.to_string()))
}

/// Deserialize an envelope from wire bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not a valid envelope.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, ProtocolError> {
    bincode::deserialize(bytes).map_err(|e| ProtocolError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let envelope = RequestEnvelope {
            call_id: Uuid::new_v4(),
            method: "Write".to_string(),
            payload: b"row data".to_vec(),
        };

        let bytes = encode(&envelope).unwrap();
        let decoded: RequestEnvelope = decode(&bytes).unwrap();

        assert_eq!(decoded.call_id, envelope.call_id);
        assert_eq!(decoded.method, envelope.method);
        assert_eq!(decoded.payload, envelope.payload);
    }

    #[test]
    fn test_error_info_maps_busy_to_busy_status() {
        let err: RpcError = ErrorInfo {
            code: ErrorCode::ServerTooBusy,
            message: "queue full".to_string(),
        }
        .into();
        assert_eq!(err, RpcError::ServerTooBusy("queue full".to_string()));

        let err: RpcError = ErrorInfo {
            code: ErrorCode::UnknownMethod,
            message: "no such method".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            RpcError::Remote {
                code: ErrorCode::UnknownMethod,
                ..
            }
        ));
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(decode::<ResponseEnvelope>(b"\xff\xff\xff\xff\xff").is_err());
    }
}
