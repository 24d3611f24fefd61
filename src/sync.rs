//! Synchronization between peers: wire contract, salted handshake, and the
//! service answering sync requests for a local peer.
//!
//! The wire contract is a bag of three named request/response operations,
//! carried over whatever transport is plugged in. This module defines the
//! messages and the server side; [`coordinator`] drives the client side.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{
    document::Document,
    error::{ProtocolError, StorageError},
    keys::{base32, ShareAddress},
    peer::Peer,
    query::Query,
};

pub mod coordinator;
pub mod local;

pub use coordinator::{CoordinatorState, ShareStatus, ShareSyncState, SyncCoordinator};
pub use local::LocalTransport;

/// Salt length in bytes for the share-discovery handshake.
pub const SALT_LEN: usize = 16;
/// Documents per pull batch.
pub const PULL_BATCH_SIZE: usize = 10;

/// Response to the salted handshake.
///
/// Carries the responder's share list only in salted form: neither side ever
/// learns the other's shares outside the intersection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaltedHandshake {
    /// Responder's peer id.
    pub peer_id: String,
    /// Random salt for this handshake.
    pub salt: String,
    /// `salt_share_address(salt, share)` for each share the responder holds.
    pub salted_shares: Vec<String>,
}

/// Request for the sync state of the common shares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareStatesRequest {
    /// Shares both sides hold, as discovered by the handshake.
    pub common_shares: Vec<ShareAddress>,
}

/// One share's state at the responding peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteShareState {
    /// Id of the responder's physical store for this share.
    pub storage_id: String,
    /// Responder's highest assigned local index.
    pub max_local_index: u64,
}

/// Response carrying the responder's state for each requested share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareStatesResponse {
    /// Responder's peer id.
    pub peer_id: String,
    /// State per share. Shares the responder does not hold are omitted.
    pub share_states: BTreeMap<ShareAddress, RemoteShareState>,
}

/// Request for a batch of documents from one share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareQueryRequest {
    /// The share to query.
    pub share: ShareAddress,
    /// The storage id the requester believes the responder has. A mismatch
    /// means the responder's store was replaced and cursors against it are
    /// stale.
    pub storage_id: String,
    /// The query to run; the pull loop uses local-index order with a cursor.
    pub query: Query,
}

/// Response carrying a batch of documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareQueryResponse {
    /// The share that was queried.
    pub share: ShareAddress,
    /// The responder's storage id for this share.
    pub storage_id: String,
    /// The responder's highest assigned local index, for progress tracking.
    pub max_local_index: u64,
    /// The matching documents, each carrying the responder's local index.
    pub docs: Vec<Document>,
}

/// Client side of the sync wire contract.
///
/// Implementations carry the three operations over some transport; the
/// in-process [`LocalTransport`] is the reference implementation.
#[async_trait]
pub trait SyncTransport: Debug + Send + Sync + 'static {
    /// Run the salted handshake against the remote peer.
    async fn serve_salted_handshake(&self) -> Result<SaltedHandshake, ProtocolError>;

    /// Fetch the remote peer's state for the given common shares.
    async fn serve_all_share_states(
        &self,
        request: ShareStatesRequest,
    ) -> Result<ShareStatesResponse, ProtocolError>;

    /// Fetch a batch of documents from one of the remote peer's shares.
    async fn serve_share_query(
        &self,
        request: ShareQueryRequest,
    ) -> Result<ShareQueryResponse, ProtocolError>;
}

/// Generate a fresh random salt.
pub fn generate_salt() -> String {
    let mut bytes = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    base32::fmt(bytes)
}

/// Hash a share address with a salt: `blake3(salt || share || salt)`.
///
/// One-way, so a handshake transcript reveals nothing about shares the
/// observer does not already know.
pub fn salt_share_address(salt: &str, share: &ShareAddress) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt.as_bytes());
    hasher.update(share.as_str().as_bytes());
    hasher.update(salt.as_bytes());
    base32::fmt(hasher.finalize().as_bytes())
}

/// Answers the sync wire operations for a local [`Peer`].
///
/// Transport servers (in-process, HTTP, websocket, ...) hold one of these
/// and forward decoded requests into it.
#[derive(Debug, Clone)]
pub struct SyncService {
    peer: Peer,
}

impl SyncService {
    /// Create a service answering for `peer`.
    pub fn new(peer: Peer) -> Self {
        SyncService { peer }
    }

    /// The peer this service answers for.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Answer a salted handshake: a fresh salt and this peer's shares in
    /// salted form.
    pub fn salted_handshake(&self) -> SaltedHandshake {
        let salt = generate_salt();
        let salted_shares = self
            .peer
            .shares()
            .iter()
            .map(|share| salt_share_address(&salt, share))
            .collect();
        SaltedHandshake {
            peer_id: self.peer.peer_id().to_string(),
            salt,
            salted_shares,
        }
    }

    /// Answer a share-states request. Unknown shares are skipped rather than
    /// erroring: the requester may legitimately know shares we dropped.
    pub fn all_share_states(&self, request: ShareStatesRequest) -> ShareStatesResponse {
        let mut share_states = BTreeMap::new();
        for share in request.common_shares {
            let Some(replica) = self.peer.replica(&share) else {
                continue;
            };
            let Ok(max_local_index) = replica.max_local_index() else {
                continue;
            };
            share_states.insert(
                share,
                RemoteShareState {
                    storage_id: replica.storage_id(),
                    max_local_index,
                },
            );
        }
        ShareStatesResponse {
            peer_id: self.peer.peer_id().to_string(),
            share_states,
        }
    }

    /// Answer a share-query request with a batch of documents.
    pub fn share_query(
        &self,
        request: ShareQueryRequest,
    ) -> Result<ShareQueryResponse, ProtocolError> {
        let Some(replica) = self.peer.replica(&request.share) else {
            return Err(ProtocolError::UnknownShare(request.share));
        };
        if replica.is_closed() {
            return Err(ProtocolError::UnknownShare(request.share));
        }
        if replica.storage_id() != request.storage_id {
            return Err(ProtocolError::StorageIdMismatch {
                share: request.share,
            });
        }
        let docs = replica
            .query_docs(&request.query)
            .map_err(storage_to_protocol)?;
        let max_local_index = replica.max_local_index().map_err(storage_to_protocol)?;
        Ok(ShareQueryResponse {
            share: request.share,
            storage_id: replica.storage_id(),
            max_local_index,
            docs,
        })
    }
}

fn storage_to_protocol(err: StorageError) -> ProtocolError {
    ProtocolError::Transport(anyhow::anyhow!(err))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{replica::Replica, store::memory::MemoryDriver, validation::FmtD1};

    fn replica(share: &str) -> Replica {
        let share: ShareAddress = share.parse().unwrap();
        Replica::open(
            share.clone(),
            Arc::new(FmtD1),
            Arc::new(MemoryDriver::new(share)),
        )
        .unwrap()
    }

    fn peer_with(shares: &[&str]) -> Peer {
        let peer = Peer::new();
        for share in shares {
            peer.add_replica(replica(share));
        }
        peer
    }

    fn intersect(handshake: &SaltedHandshake, local: &Peer) -> Vec<ShareAddress> {
        local
            .shares()
            .into_iter()
            .filter(|share| {
                handshake
                    .salted_shares
                    .contains(&salt_share_address(&handshake.salt, share))
            })
            .collect()
    }

    #[test]
    fn handshake_reveals_no_plaintext_shares() {
        let service = SyncService::new(peer_with(&["+gardening.pals", "+chat.pals"]));
        let handshake = service.salted_handshake();
        assert_eq!(handshake.salted_shares.len(), 2);
        let transcript = format!("{handshake:?}");
        assert!(!transcript.contains("gardening"));
        assert!(!transcript.contains("chat"));
    }

    #[test]
    fn handshake_intersection() {
        let remote = SyncService::new(peer_with(&["+gardening.pals", "+chat.pals"]));
        let handshake = remote.salted_handshake();

        // Overlapping share sets intersect on the common share only.
        let local = peer_with(&["+gardening.pals", "+recipes.pals"]);
        let common = intersect(&handshake, &local);
        assert_eq!(common, vec!["+gardening.pals".parse().unwrap()]);

        // Disjoint share sets intersect empty.
        let stranger = peer_with(&["+knitting.pals"]);
        assert!(intersect(&handshake, &stranger).is_empty());
    }

    #[test]
    fn salts_change_per_handshake() {
        let service = SyncService::new(peer_with(&["+gardening.pals"]));
        let a = service.salted_handshake();
        let b = service.salted_handshake();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.salted_shares, b.salted_shares);
    }

    #[test]
    fn share_query_checks_storage_id() {
        let peer = peer_with(&["+gardening.pals"]);
        let share: ShareAddress = "+gardening.pals".parse().unwrap();
        let service = SyncService::new(peer.clone());
        let storage_id = peer.replica(&share).unwrap().storage_id();

        let ok = service.share_query(ShareQueryRequest {
            share: share.clone(),
            storage_id: storage_id.clone(),
            query: Query::all().build(),
        });
        assert!(ok.is_ok());

        let stale = service.share_query(ShareQueryRequest {
            share: share.clone(),
            storage_id: "somethingelse".into(),
            query: Query::all().build(),
        });
        assert!(matches!(
            stale,
            Err(ProtocolError::StorageIdMismatch { .. })
        ));

        let unknown = service.share_query(ShareQueryRequest {
            share: "+nope.pals".parse().unwrap(),
            storage_id,
            query: Query::all().build(),
        });
        assert!(matches!(unknown, Err(ProtocolError::UnknownShare(_))));
    }
}
