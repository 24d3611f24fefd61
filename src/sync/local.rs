//! In-process transport: sync two peers living in the same process.

use async_trait::async_trait;

use crate::{
    error::ProtocolError,
    peer::Peer,
    sync::{
        SaltedHandshake, ShareQueryRequest, ShareQueryResponse, ShareStatesRequest,
        ShareStatesResponse, SyncService, SyncTransport,
    },
};

/// A [`SyncTransport`] that answers directly from another peer in the same
/// process. Useful for tests and for syncing two stores on one machine, and
/// the reference for what remote transports must implement.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    service: SyncService,
}

impl LocalTransport {
    /// Create a transport whose requests are answered by `remote`.
    pub fn new(remote: Peer) -> Self {
        LocalTransport {
            service: SyncService::new(remote),
        }
    }
}

#[async_trait]
impl SyncTransport for LocalTransport {
    async fn serve_salted_handshake(&self) -> Result<SaltedHandshake, ProtocolError> {
        Ok(self.service.salted_handshake())
    }

    async fn serve_all_share_states(
        &self,
        request: ShareStatesRequest,
    ) -> Result<ShareStatesResponse, ProtocolError> {
        Ok(self.service.all_share_states(request))
    }

    async fn serve_share_query(
        &self,
        request: ShareQueryRequest,
    ) -> Result<ShareQueryResponse, ProtocolError> {
        self.service.share_query(request)
    }
}
