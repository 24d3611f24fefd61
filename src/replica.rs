//! The replica: one share's documents plus ingestion and conflict resolution.

use std::sync::{
    atomic::{AtomicBool, Ordering as AtomicOrdering},
    Arc,
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::{
    document::{microsecond_now, DocSignature, Document},
    error::{OpenError, StorageError, ValidationError},
    keys::{AuthorKeypair, ShareAddress},
    query::Query,
    store::{DocDriver, CONFIG_SCHEMA_VERSION, SCHEMA_VERSION},
    validation::FormatValidator,
};

/// Where an ingested document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOrigin {
    /// Written locally via [`Replica::set`].
    Local,
    /// Received from a peer via [`Replica::ingest`].
    Sync,
}

/// Outcome of ingesting one document.
///
/// All three cases are ordinary values: a malformed document from a peer is
/// reported, never thrown, and must not prevent ingestion of the next one.
#[derive(Debug, Clone, derive_more::Display)]
pub enum IngestOutcome {
    /// The document was stored.
    #[display("accepted")]
    Accepted {
        /// The document as stored, with its assigned local index.
        doc: Document,
        /// Whether this document is now the path's overall winner.
        is_latest: bool,
    },
    /// The document does not supersede what is already stored; the store is
    /// unchanged. Re-ingesting any already-known document lands here, which
    /// is what makes ingestion idempotent.
    #[display("obsolete")]
    Obsolete,
    /// The document failed validation.
    #[display("invalid: {_0}")]
    Invalid(ValidationError),
}

impl IngestOutcome {
    /// Whether the document was stored.
    pub fn is_accepted(&self) -> bool {
        matches!(self, IngestOutcome::Accepted { .. })
    }
}

/// Events emitted by a replica to its subscribers.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// A document was accepted into the store.
    DocIngested {
        /// Where the document came from.
        origin: IngestOrigin,
        /// The stored document.
        doc: Document,
        /// Whether it is now the path's overall winner.
        is_latest: bool,
    },
    /// The replica was closed.
    Closed,
}

/// A local copy of one share's documents.
///
/// The replica is the single authoritative entry point for writes: local
/// `set` calls and documents arriving from sync both go through [`ingest`],
/// which validates, resolves conflicts, assigns the local index, and notifies
/// subscribers. Cheap to clone; clones share state.
///
/// [`ingest`]: Replica::ingest
#[derive(Debug, Clone)]
pub struct Replica {
    inner: Arc<ReplicaInner>,
}

#[derive(Debug)]
struct ReplicaInner {
    share: ShareAddress,
    driver: Arc<dyn DocDriver>,
    validator: Arc<dyn FormatValidator>,
    /// Serializes the check-then-upsert section of ingest. The newer-than
    /// check and the upsert are a read-modify-write that must not interleave
    /// with another write to the same (path, author).
    write_lock: Mutex<()>,
    subscribers: RwLock<Vec<flume::Sender<ReplicaEvent>>>,
    closed: AtomicBool,
}

/// Input to [`Replica::set`].
#[derive(Debug, Clone, Default)]
pub struct SetInput {
    /// Format id; defaults to the replica's validator format.
    pub format: Option<String>,
    /// Path to write to.
    pub path: String,
    /// Document content.
    pub content: Bytes,
    /// Optional expiry (requires the `!` path marker).
    pub delete_after: Option<u64>,
    /// Explicit timestamp; defaults to strictly after any existing document
    /// by the same author at this path.
    pub timestamp: Option<u64>,
}

impl Replica {
    /// Open a replica for `share` over the given driver and validator.
    pub fn open(
        share: ShareAddress,
        validator: Arc<dyn FormatValidator>,
        driver: Arc<dyn DocDriver>,
    ) -> Result<Self, OpenError> {
        share
            .check()
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
        if driver.share() != &share {
            return Err(OpenError::ShareMismatch {
                driver: driver.share().clone(),
                requested: share,
            });
        }
        match driver.get_config(CONFIG_SCHEMA_VERSION)? {
            Some(version) if version == SCHEMA_VERSION => {}
            Some(version) => return Err(OpenError::UnsupportedSchema(version)),
            None => driver.set_config(CONFIG_SCHEMA_VERSION, SCHEMA_VERSION)?,
        }
        Ok(Replica {
            inner: Arc::new(ReplicaInner {
                share,
                driver,
                validator,
                write_lock: Mutex::new(()),
                subscribers: RwLock::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// The share this replica holds.
    pub fn share(&self) -> &ShareAddress {
        &self.inner.share
    }

    /// Id of the underlying physical store.
    pub fn storage_id(&self) -> String {
        self.inner.driver.storage_id()
    }

    /// The highest local index assigned so far: the upper bound of
    /// "everything this replica currently has" for sync cursors.
    pub fn max_local_index(&self) -> Result<u64, StorageError> {
        self.check_open()?;
        self.inner.driver.max_local_index()
    }

    /// Subscribe to write and lifecycle events.
    ///
    /// Events are delivered synchronously during ingest, before the ingest
    /// call returns.
    pub fn subscribe(&self) -> flume::Receiver<ReplicaEvent> {
        let (tx, rx) = flume::unbounded();
        self.inner.subscribers.write().push(tx);
        rx
    }

    /// Ingest a document received from elsewhere (typically a sync partner).
    ///
    /// Validates against the wall clock; see [`Replica::ingest_with_now`] to
    /// override the clock.
    pub fn ingest(&self, doc: Document) -> Result<IngestOutcome, StorageError> {
        self.ingest_inner(doc, IngestOrigin::Sync, microsecond_now())
    }

    /// [`Replica::ingest`] with an explicit clock, for tests.
    pub fn ingest_with_now(
        &self,
        doc: Document,
        now: u64,
    ) -> Result<IngestOutcome, StorageError> {
        self.ingest_inner(doc, IngestOrigin::Sync, now)
    }

    /// Build, sign and ingest a local write.
    pub fn set(
        &self,
        keypair: &AuthorKeypair,
        input: SetInput,
    ) -> Result<IngestOutcome, StorageError> {
        self.check_open()?;
        let now = microsecond_now();
        let validator = &self.inner.validator;

        let format = input
            .format
            .unwrap_or_else(|| validator.format().to_string());
        if format != validator.format() {
            return Ok(IngestOutcome::Invalid(ValidationError::UnknownFormat(
                format,
            )));
        }

        // Default the timestamp to strictly newer than our own previous
        // document at this path, so a local overwrite always wins against it.
        let timestamp = match input.timestamp {
            Some(timestamp) => timestamp,
            None => {
                let existing = self.inner.driver.get(&input.path, &keypair.address())?;
                match existing {
                    Some(prev) => now.max(prev.timestamp + 1),
                    None => now,
                }
            }
        };

        let draft = Document {
            format,
            share: self.inner.share.clone(),
            path: input.path,
            author: keypair.address(),
            timestamp,
            delete_after: input.delete_after,
            content: input.content,
            content_hash: String::new(),
            signature: DocSignature::default(),
            local_index: 0,
        };
        let doc = match validator.sign(keypair, draft) {
            Ok(doc) => doc,
            Err(err) => return Ok(IngestOutcome::Invalid(err)),
        };
        self.ingest_inner(doc, IngestOrigin::Local, now)
    }

    fn ingest_inner(
        &self,
        doc: Document,
        origin: IngestOrigin,
        now: u64,
    ) -> Result<IngestOutcome, StorageError> {
        self.check_open()?;

        if doc.share != self.inner.share {
            return Ok(IngestOutcome::Invalid(ValidationError::WrongShare {
                doc: doc.share,
                replica: self.inner.share.clone(),
            }));
        }
        if let Err(err) = self.inner.validator.check_valid(&doc, now) {
            trace!(share = %self.inner.share, path = %doc.path, %err, "ingest: invalid");
            return Ok(IngestOutcome::Invalid(err));
        }

        let _guard = self.inner.write_lock.lock();

        if let Some(existing) = self.inner.driver.get(&doc.path, &doc.author)? {
            if doc.cmp_newer(&existing) != std::cmp::Ordering::Greater {
                trace!(share = %self.inner.share, path = %doc.path, "ingest: obsolete");
                return Ok(IngestOutcome::Obsolete);
            }
        }

        let stored = self.inner.driver.upsert(doc)?;
        let is_latest = self.is_path_winner(&stored, now)?;
        debug!(
            share = %self.inner.share,
            path = %stored.path,
            author = %stored.author,
            local_index = stored.local_index,
            is_latest,
            ?origin,
            "ingested document"
        );
        self.emit(ReplicaEvent::DocIngested {
            origin,
            doc: stored.clone(),
            is_latest,
        });
        Ok(IngestOutcome::Accepted {
            doc: stored,
            is_latest,
        })
    }

    /// Whether `doc` is the overall winner at its path.
    fn is_path_winner(&self, doc: &Document, now: u64) -> Result<bool, StorageError> {
        let winners = self.inner.driver.query_docs(
            &Query::latest_per_path().path_exact(doc.path.clone()).build(),
            now,
        )?;
        Ok(winners
            .first()
            .map(|winner| winner.signature == doc.signature)
            .unwrap_or(false))
    }

    /// Run a query against this replica's documents.
    pub fn query_docs(&self, query: &Query) -> Result<Vec<Document>, StorageError> {
        self.check_open()?;
        self.inner.driver.query_docs(query, microsecond_now())
    }

    /// All per-path winners, ordered by path.
    pub fn get_latest_docs(&self) -> Result<Vec<Document>, StorageError> {
        self.query_docs(&Query::latest_per_path().build())
    }

    /// The winner at one path, if any.
    pub fn get_latest_doc_at_path(
        &self,
        path: impl Into<String>,
    ) -> Result<Option<Document>, StorageError> {
        let mut docs =
            self.query_docs(&Query::latest_per_path().path_exact(path).build())?;
        Ok(docs.pop())
    }

    /// Every surviving document, ordered by path.
    pub fn get_all_docs(&self) -> Result<Vec<Document>, StorageError> {
        self.query_docs(&Query::all().build())
    }

    /// Physically remove expired documents from the driver.
    pub fn purge_expired(&self) -> Result<usize, StorageError> {
        self.check_open()?;
        self.inner.driver.purge_expired(microsecond_now())
    }

    /// Whether this replica has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(AtomicOrdering::SeqCst)
    }

    /// Close the replica and its driver. Idempotent. Emits a final
    /// [`ReplicaEvent::Closed`] to all subscribers.
    pub fn close(&self) -> Result<(), StorageError> {
        if self.inner.closed.swap(true, AtomicOrdering::SeqCst) {
            return Ok(());
        }
        self.emit(ReplicaEvent::Closed);
        self.inner.subscribers.write().clear();
        self.inner.driver.close(false)
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn emit(&self, event: ReplicaEvent) {
        // Delivery into every live subscriber's channel completes before the
        // triggering call returns; a dropped receiver unsubscribes.
        self.inner
            .subscribers
            .write()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
