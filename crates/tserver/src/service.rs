//! The tablet RPC service executed by the service pool.

use std::sync::Arc;

use bytes::Bytes;
use tabletd_rpc::{InboundCall, RpcService, ServiceError};

use crate::tablet::TabletRegistry;

/// Service implementation dispatching decoded inbound calls against the
/// server's tablet registry. Safe to invoke from any worker thread.
pub struct TabletServiceImpl {
    tablets: Arc<TabletRegistry>,
}

impl TabletServiceImpl {
    /// Create a service backed by `tablets`.
    pub fn new(tablets: Arc<TabletRegistry>) -> Self {
        Self { tablets }
    }
}

impl RpcService for TabletServiceImpl {
    fn service_name(&self) -> &'static str {
        "TabletServerService"
    }

    fn handle_call(&self, call: &InboundCall) -> Result<Bytes, ServiceError> {
        match call.method() {
            "Ping" => Ok(call.payload().clone()),
            "CheckTabletExists" => {
                let tablet_id = std::str::from_utf8(call.payload())
                    .map_err(|_| ServiceError::invalid_request("tablet id must be valid UTF-8"))?;
                let exists = self.tablets.lookup(tablet_id).is_some();
                Ok(if exists {
                    Bytes::from_static(b"true")
                } else {
                    Bytes::from_static(b"false")
                })
            }
            "ListTablets" => Ok(Bytes::from(self.tablets.tablet_ids().join("\n"))),
            other => Err(ServiceError::unknown_method(other)),
        }
    }
}
