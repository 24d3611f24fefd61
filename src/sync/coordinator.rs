//! The pull loop: keeps a local peer converged with one sync partner.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    document::microsecond_now,
    error::ProtocolError,
    keys::ShareAddress,
    peer::Peer,
    query::{OrderBy, Query},
    replica::IngestOutcome,
    sync::{
        salt_share_address, ShareQueryRequest, ShareStatesRequest, SyncTransport,
        PULL_BATCH_SIZE,
    },
};

/// Delay between pull rounds while any share still has documents to fetch.
pub const PULL_INTERVAL_BUSY: Duration = Duration::from_millis(50);
/// Delay between pull rounds once every share is caught up (or stalled).
pub const PULL_INTERVAL_IDLE: Duration = Duration::from_secs(1);

/// Lifecycle of a [`SyncCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Created but not yet started.
    Ready,
    /// The pull loop is running.
    Active,
    /// Closed; the coordinator cannot be restarted.
    Closed,
}

/// Sync progress of one common share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ShareStatus {
    /// The partner has documents we have not pulled yet.
    #[display("in progress")]
    InProgress,
    /// The last pull returned an empty batch: we have everything the partner
    /// had at that point.
    #[display("caught up")]
    CaughtUp,
    /// The next document the partner offers fails validation here, so the
    /// cursor cannot advance. Distinct from caught up: later documents exist
    /// but are being withheld behind the invalid one.
    #[display("stalled")]
    Stalled,
}

/// Everything the coordinator tracks about one common share.
///
/// The `so_far` cursors are what make repeated rounds incremental: they only
/// ever move forward, merged by `max` so a stale response can never rewind
/// progress.
#[derive(Debug, Clone)]
pub struct ShareSyncState {
    /// The partner's storage id the cursors are valid against.
    pub partner_storage_id: String,
    /// Highest local index the partner has reported having.
    pub partner_max_local_index_overall: u64,
    /// Highest partner local index we have processed: the pull cursor.
    pub partner_max_local_index_so_far: u64,
    /// Our replica's highest local index.
    pub max_local_index_overall: u64,
    /// Our replica's highest local index as of the last pull.
    pub max_local_index_so_far: u64,
    /// When we last heard from the partner about this share, in microseconds.
    pub last_seen_at: u64,
    /// Current progress status.
    pub status: ShareStatus,
}

/// Drives sync between a local [`Peer`] and one partner over a transport.
///
/// The coordinator discovers common shares via the salted handshake, then
/// repeatedly pulls batches of documents in partner local-index order,
/// advancing a per-share cursor. It re-runs the handshake whenever the local
/// share set changes or the partner's state goes stale.
///
/// One coordinator handles one partner; run several for several partners.
#[derive(Debug, Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

#[derive(Debug)]
struct CoordinatorInner {
    peer: Peer,
    transport: Arc<dyn SyncTransport>,
    state: RwLock<CoordinatorState>,
    partner_peer_id: RwLock<Option<String>>,
    states: RwLock<BTreeMap<ShareAddress, ShareSyncState>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    /// Create a coordinator syncing `peer` with the partner behind
    /// `transport`. Call [`start`](SyncCoordinator::start) to begin.
    pub fn new(peer: Peer, transport: impl SyncTransport) -> Self {
        SyncCoordinator {
            inner: Arc::new(CoordinatorInner {
                peer,
                transport: Arc::new(transport),
                state: RwLock::new(CoordinatorState::Ready),
                partner_peer_id: RwLock::new(None),
                states: RwLock::new(BTreeMap::new()),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Start the pull loop. Fails if the coordinator was already started or
    /// closed.
    pub fn start(&self) -> anyhow::Result<()> {
        {
            let mut state = self.inner.state.write();
            anyhow::ensure!(
                *state == CoordinatorState::Ready,
                "coordinator is {:?}, not ready",
                *state
            );
            *state = CoordinatorState::Active;
        }
        let inner = self.inner.clone();
        *self.inner.task.lock() = Some(tokio::spawn(run(inner)));
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CoordinatorState {
        *self.inner.state.read()
    }

    /// The partner's peer id, once a handshake has completed.
    pub fn partner_peer_id(&self) -> Option<String> {
        self.inner.partner_peer_id.read().clone()
    }

    /// Snapshot of the per-share sync states.
    pub fn share_states(&self) -> BTreeMap<ShareAddress, ShareSyncState> {
        self.inner.states.read().clone()
    }

    /// Whether every common share is caught up. Vacuously true with no
    /// common shares; a stalled share is not caught up.
    pub fn is_caught_up(&self) -> bool {
        self.inner
            .states
            .read()
            .values()
            .all(|state| state.status == ShareStatus::CaughtUp)
    }

    /// Stop the pull loop. Idempotent, and never waits for an in-flight
    /// request; the loop task is simply cancelled.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.write();
            if *state == CoordinatorState::Closed {
                return;
            }
            *state = CoordinatorState::Closed;
        }
        self.inner.cancel.cancel();
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
    }
}

async fn run(inner: Arc<CoordinatorInner>) {
    let peer_events = inner.peer.subscribe();
    let mut needs_handshake = true;
    loop {
        if inner.cancel.is_cancelled() {
            break;
        }
        if needs_handshake {
            match refresh_common_shares(&inner).await {
                Ok(()) => needs_handshake = false,
                Err(err) => warn!(%err, "handshake failed, will retry"),
            }
        }
        let (delay, went_stale) = pull_round(&inner).await;
        needs_handshake |= went_stale;

        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
            event = peer_events.recv_async() => {
                if event.is_ok() {
                    // Coalesce a burst of share-set changes into one refresh.
                    while peer_events.try_recv().is_ok() {}
                    needs_handshake = true;
                }
            }
        }
    }
    *inner.state.write() = CoordinatorState::Closed;
}

/// Re-run the salted handshake and rebuild the per-share states.
///
/// Existing cursors survive as long as the partner's storage id for the
/// share is unchanged; otherwise the cursor is meaningless and the share
/// starts over from zero.
async fn refresh_common_shares(inner: &Arc<CoordinatorInner>) -> Result<(), ProtocolError> {
    let handshake = inner.transport.serve_salted_handshake().await?;
    let common_shares: Vec<ShareAddress> = inner
        .peer
        .shares()
        .into_iter()
        .filter(|share| {
            handshake
                .salted_shares
                .contains(&salt_share_address(&handshake.salt, share))
        })
        .collect();
    debug!(
        partner = %handshake.peer_id,
        shares = common_shares.len(),
        "handshake complete"
    );
    *inner.partner_peer_id.write() = Some(handshake.peer_id);

    let response = inner
        .transport
        .serve_all_share_states(ShareStatesRequest { common_shares })
        .await?;

    let now = microsecond_now();
    let mut states = inner.states.write();
    states.retain(|share, _| response.share_states.contains_key(share));
    for (share, remote) in response.share_states {
        let local_max = inner
            .peer
            .replica(&share)
            .and_then(|replica| replica.max_local_index().ok())
            .unwrap_or(0);
        match states.get_mut(&share) {
            Some(state) if state.partner_storage_id == remote.storage_id => {
                state.partner_max_local_index_overall = state
                    .partner_max_local_index_overall
                    .max(remote.max_local_index);
                state.max_local_index_overall = state.max_local_index_overall.max(local_max);
                state.last_seen_at = now;
            }
            _ => {
                states.insert(
                    share,
                    ShareSyncState {
                        partner_storage_id: remote.storage_id,
                        partner_max_local_index_overall: remote.max_local_index,
                        partner_max_local_index_so_far: 0,
                        max_local_index_overall: local_max,
                        max_local_index_so_far: local_max,
                        last_seen_at: now,
                        status: ShareStatus::InProgress,
                    },
                );
            }
        }
    }
    Ok(())
}

/// What one share's pull attempt amounted to.
enum PullOutcome {
    /// The batch was handled; the share's status reflects the result.
    Pulled,
    /// The negotiated state is stale; drop the share until the next handshake.
    Stale,
    /// The transport failed; nothing about the share changed.
    Failed,
}

/// Pull one batch for every common share. Returns the delay until the next
/// round and whether a share went stale and a new handshake is needed.
async fn pull_round(inner: &Arc<CoordinatorInner>) -> (Duration, bool) {
    let shares: Vec<ShareAddress> = inner.states.read().keys().cloned().collect();
    let mut went_stale = false;
    let mut failed: Vec<ShareAddress> = Vec::new();
    for share in shares {
        if inner.cancel.is_cancelled() {
            break;
        }
        match pull_share(inner, &share).await {
            PullOutcome::Pulled => {}
            PullOutcome::Stale => {
                inner.states.write().remove(&share);
                went_stale = true;
            }
            PullOutcome::Failed => failed.push(share),
        }
    }
    // A share whose pull failed at the transport made no progress this round
    // and must not keep the loop on the busy cadence.
    let states = inner.states.read();
    let busy = states.iter().any(|(share, state)| {
        state.status == ShareStatus::InProgress && !failed.contains(share)
    });
    let delay = if busy { PULL_INTERVAL_BUSY } else { PULL_INTERVAL_IDLE };
    (delay, went_stale)
}

/// Pull and ingest one batch for one share.
async fn pull_share(inner: &Arc<CoordinatorInner>, share: &ShareAddress) -> PullOutcome {
    let Some(replica) = inner.peer.replica(share) else {
        // We no longer hold the share ourselves.
        return PullOutcome::Stale;
    };
    let (cursor, storage_id) = {
        let states = inner.states.read();
        let Some(state) = states.get(share) else {
            return PullOutcome::Pulled;
        };
        (
            state.partner_max_local_index_so_far,
            state.partner_storage_id.clone(),
        )
    };

    let query = Query::all()
        .order_by(OrderBy::LocalIndexAsc)
        .start_after_local_index(cursor)
        .limit(PULL_BATCH_SIZE)
        .build();
    let response = match inner
        .transport
        .serve_share_query(ShareQueryRequest {
            share: share.clone(),
            storage_id,
            query,
        })
        .await
    {
        Ok(response) => response,
        Err(err @ (ProtocolError::StorageIdMismatch { .. } | ProtocolError::UnknownShare(_))) => {
            warn!(%share, %err, "partner share state is stale, renegotiating");
            return PullOutcome::Stale;
        }
        Err(err) => {
            warn!(%share, %err, "share query failed");
            return PullOutcome::Failed;
        }
    };

    let batch_len = response.docs.len();
    let mut cursor = cursor;
    let mut stalled = false;
    for doc in response.docs {
        let partner_index = doc.local_index;
        match replica.ingest(doc) {
            // Obsolete still advances the cursor: the partner's document is
            // processed even though it changed nothing here.
            Ok(IngestOutcome::Accepted { .. }) | Ok(IngestOutcome::Obsolete) => {
                cursor = cursor.max(partner_index);
            }
            Ok(IngestOutcome::Invalid(err)) => {
                warn!(%share, %err, "partner sent an invalid document, cursor parked");
                stalled = true;
                break;
            }
            Err(err) => {
                warn!(%share, %err, "storing pulled document failed");
                stalled = true;
                break;
            }
        }
    }

    let local_max = replica.max_local_index().unwrap_or(0);
    let now = microsecond_now();
    let mut states = inner.states.write();
    if let Some(state) = states.get_mut(share) {
        state.partner_max_local_index_overall = state
            .partner_max_local_index_overall
            .max(response.max_local_index);
        state.partner_max_local_index_so_far =
            state.partner_max_local_index_so_far.max(cursor);
        state.max_local_index_overall = state.max_local_index_overall.max(local_max);
        state.max_local_index_so_far = state.max_local_index_so_far.max(local_max);
        state.last_seen_at = now;
        state.status = if stalled {
            ShareStatus::Stalled
        } else if batch_len == 0 {
            ShareStatus::CaughtUp
        } else {
            ShareStatus::InProgress
        };
    }
    PullOutcome::Pulled
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::{
        document::{DocSignature, Document},
        keys::AuthorKeypair,
        replica::{Replica, SetInput},
        store::memory::MemoryDriver,
        sync::{
            LocalTransport, SaltedHandshake, ShareQueryResponse, ShareStatesResponse,
            SyncService,
        },
        validation::{FmtD1, FormatValidator, FORMAT_D1},
    };

    const NOW: u64 = 1_700_000_000_000_000;

    fn setup_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn share() -> ShareAddress {
        "+gardening.pals".parse().unwrap()
    }

    fn peer_with_share(share: &ShareAddress) -> Peer {
        let peer = Peer::new();
        peer.add_replica(
            Replica::open(
                share.clone(),
                Arc::new(FmtD1),
                Arc::new(MemoryDriver::new(share.clone())),
            )
            .unwrap(),
        );
        peer
    }

    fn keypair(name: &str) -> AuthorKeypair {
        AuthorKeypair::generate(&mut rand::thread_rng(), name).unwrap()
    }

    fn set(replica: &Replica, kp: &AuthorKeypair, path: &str, content: &[u8], timestamp: u64) {
        let outcome = replica
            .set(
                kp,
                SetInput {
                    path: path.into(),
                    content: Bytes::copy_from_slice(content),
                    timestamp: Some(timestamp),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(outcome.is_accepted());
    }

    async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test]
    async fn two_peers_converge() {
        setup_logging();
        let share = share();
        let peer_a = peer_with_share(&share);
        let peer_b = peer_with_share(&share);
        let replica_a = peer_a.replica(&share).unwrap();
        let replica_b = peer_b.replica(&share).unwrap();

        let suzy = keypair("suzy");
        let devy = keypair("devy");
        set(&replica_a, &suzy, "/x", b"1", NOW);
        set(&replica_b, &devy, "/x", b"2", NOW + 1);

        let coord_a = SyncCoordinator::new(peer_a.clone(), LocalTransport::new(peer_b.clone()));
        let coord_b = SyncCoordinator::new(peer_b.clone(), LocalTransport::new(peer_a.clone()));
        assert_eq!(coord_a.state(), CoordinatorState::Ready);
        coord_a.start().unwrap();
        coord_b.start().unwrap();
        assert_eq!(coord_a.state(), CoordinatorState::Active);

        for coord in [&coord_a, &coord_b] {
            wait_for("catch-up", || {
                !coord.share_states().is_empty() && coord.is_caught_up()
            })
            .await;
        }

        // Both sides hold both versions, and agree that devy's newer
        // document is the winner.
        for replica in [&replica_a, &replica_b] {
            assert_eq!(replica.get_all_docs().unwrap().len(), 2);
            let winner = replica.get_latest_doc_at_path("/x").unwrap().unwrap();
            assert_eq!(winner.author, devy.address());
            assert_eq!(winner.content, Bytes::from_static(b"2"));
        }
        assert_eq!(coord_a.partner_peer_id().as_deref(), Some(peer_b.peer_id()));

        coord_a.close();
        coord_b.close();
        assert_eq!(coord_a.state(), CoordinatorState::Closed);
        // Closing twice is fine; restarting is not.
        coord_a.close();
        assert!(coord_a.start().is_err());
    }

    #[tokio::test]
    async fn resync_does_not_redeliver() {
        setup_logging();
        let share = share();
        let peer_a = peer_with_share(&share);
        let peer_b = peer_with_share(&share);
        set(&peer_b.replica(&share).unwrap(), &keypair("suzy"), "/x", b"1", NOW);

        let coord = SyncCoordinator::new(peer_a.clone(), LocalTransport::new(peer_b.clone()));
        coord.start().unwrap();
        wait_for("first sync", || {
            !coord.share_states().is_empty() && coord.is_caught_up()
        })
        .await;
        coord.close();

        // A fresh coordinator starts its cursor over, but everything it pulls
        // is already known: no ingest events fire.
        let replica_a = peer_a.replica(&share).unwrap();
        let events = replica_a.subscribe();
        let again = SyncCoordinator::new(peer_a.clone(), LocalTransport::new(peer_b.clone()));
        again.start().unwrap();
        wait_for("resync", || {
            !again.share_states().is_empty() && again.is_caught_up()
        })
        .await;
        again.close();

        assert_eq!(events.drain().count(), 0);
        assert_eq!(replica_a.get_all_docs().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_document_stalls_the_share() {
        setup_logging();
        let share = share();
        let peer_a = peer_with_share(&share);
        let peer_b = peer_with_share(&share);
        let replica_b = peer_b.replica(&share).unwrap();
        let suzy = keypair("suzy");

        set(&replica_b, &suzy, "/a", b"1", NOW);
        // A document from an hour in the future: valid where the clock says
        // so, invalid against our wall clock.
        let future = crate::document::microsecond_now() + 3_600_000_000;
        let doc = FmtD1
            .sign(
                &suzy,
                Document {
                    format: FORMAT_D1.into(),
                    share: share.clone(),
                    path: "/b".into(),
                    author: suzy.address(),
                    timestamp: future,
                    delete_after: None,
                    content: Bytes::from_static(b"2"),
                    content_hash: String::new(),
                    signature: DocSignature::default(),
                    local_index: 0,
                },
            )
            .unwrap();
        assert!(replica_b.ingest_with_now(doc, future).unwrap().is_accepted());
        set(&replica_b, &suzy, "/c", b"3", NOW + 2);

        let coord = SyncCoordinator::new(peer_a.clone(), LocalTransport::new(peer_b.clone()));
        coord.start().unwrap();
        wait_for("stall", || {
            coord
                .share_states()
                .get(&share)
                .map(|state| state.status == ShareStatus::Stalled)
                .unwrap_or(false)
        })
        .await;

        // Everything before the invalid document arrived; everything after
        // is withheld behind the parked cursor.
        let paths: Vec<String> = peer_a
            .replica(&share)
            .unwrap()
            .get_all_docs()
            .unwrap()
            .into_iter()
            .map(|doc| doc.path)
            .collect();
        assert_eq!(paths, ["/a"]);
        assert!(!coord.is_caught_up());
        coord.close();
    }

    #[tokio::test]
    async fn share_set_changes_renegotiate() {
        setup_logging();
        let peer_a = Peer::new();
        let peer_b = Peer::new();

        let coord = SyncCoordinator::new(peer_a.clone(), LocalTransport::new(peer_b.clone()));
        coord.start().unwrap();
        wait_for("empty handshake", || coord.partner_peer_id().is_some()).await;
        assert!(coord.share_states().is_empty());

        // A share appears on both sides mid-flight; the coordinator picks it
        // up without being restarted.
        let share = share();
        peer_b.add_replica(
            Replica::open(
                share.clone(),
                Arc::new(FmtD1),
                Arc::new(MemoryDriver::new(share.clone())),
            )
            .unwrap(),
        );
        set(&peer_b.replica(&share).unwrap(), &keypair("suzy"), "/x", b"hi", NOW);
        peer_a.add_replica(
            Replica::open(
                share.clone(),
                Arc::new(FmtD1),
                Arc::new(MemoryDriver::new(share.clone())),
            )
            .unwrap(),
        );

        let replica_a = peer_a.replica(&share).unwrap();
        wait_for("late share sync", || {
            replica_a
                .get_all_docs()
                .map(|docs| docs.len() == 1)
                .unwrap_or(false)
        })
        .await;
        coord.close();
    }

    /// Handshakes and share states succeed, but every share query fails at
    /// the transport.
    #[derive(Debug)]
    struct FlakyTransport {
        service: SyncService,
        queries: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl SyncTransport for FlakyTransport {
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
            _request: ShareQueryRequest,
        ) -> Result<ShareQueryResponse, ProtocolError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Err(ProtocolError::Transport(anyhow::anyhow!("connection reset")))
        }
    }

    #[tokio::test]
    async fn transport_failures_back_off_to_the_idle_interval() {
        setup_logging();
        let share = share();
        let peer_a = peer_with_share(&share);
        let peer_b = peer_with_share(&share);
        set(&peer_b.replica(&share).unwrap(), &keypair("suzy"), "/x", b"1", NOW);

        let queries = Arc::new(AtomicUsize::new(0));
        let coord = SyncCoordinator::new(
            peer_a.clone(),
            FlakyTransport {
                service: SyncService::new(peer_b.clone()),
                queries: queries.clone(),
            },
        );
        coord.start().unwrap();
        wait_for("first pull attempt", || queries.load(Ordering::SeqCst) >= 1).await;

        // On the busy cadence this window would fit several more attempts; a
        // share that only fails at the transport must retry at the idle
        // interval instead.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(
            queries.load(Ordering::SeqCst) <= 2,
            "failing share retried too eagerly: {} attempts",
            queries.load(Ordering::SeqCst)
        );
        coord.close();
    }
}
