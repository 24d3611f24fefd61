//! Error types for tidepool.
//!
//! Documents arrive from untrusted peers, so everything on the ingestion path
//! reports failures as typed values instead of panicking. Only programmer
//! misuse (signing with a mismatched keypair) shares the same channel.

use crate::keys::ShareAddress;

/// A document failed validation.
///
/// Always recoverable: a peer handing us a bad document must never take the
/// process down or abort ingestion of subsequent documents.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The document names a format this validator does not implement.
    #[error("unknown format {0:?}")]
    UnknownFormat(String),
    /// The document path does not match the path grammar.
    #[error("invalid path: {0}")]
    Path(&'static str),
    /// The author does not have write permission for this path.
    #[error("author may not write to path {0:?}")]
    UnwritablePath(String),
    /// An author or share address does not match the address grammar.
    #[error("invalid address: {0}")]
    Address(&'static str),
    /// The document belongs to a different share than the replica.
    #[error("document share {doc} does not match replica share {replica}")]
    WrongShare {
        /// Share named in the document.
        doc: ShareAddress,
        /// Share held by the replica.
        replica: ShareAddress,
    },
    /// A timestamp or expiry bound was violated.
    #[error(transparent)]
    Timestamp(#[from] TimestampError),
    /// `delete_after` presence disagrees with the `!` path marker.
    #[error("ephemeral marker mismatch: {0}")]
    EphemeralMarker(&'static str),
    /// The content is longer than the format allows.
    #[error("content too long: {0} bytes")]
    ContentTooLong(usize),
    /// The content hash does not match the content.
    #[error("content hash does not match content")]
    ContentHashMismatch,
    /// The signature does not verify against the author's public key.
    #[error("bad signature")]
    BadSignature,
    /// Tried to sign a document whose author is not the signing keypair.
    ///
    /// This guards against caller bugs, not untrusted input.
    #[error("keypair address {keypair} does not match document author {author}")]
    SigningKeyMismatch {
        /// Address of the keypair used to sign.
        keypair: String,
        /// Author named in the document.
        author: String,
    },
}

/// Timestamp violations, split out from [`ValidationError`] because callers
/// may want to retry "too far in the future" later while discarding the rest
/// permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimestampError {
    /// Below the minimum allowed timestamp.
    #[error("timestamp {0} is too small")]
    TooSmall(u64),
    /// Above the maximum allowed timestamp.
    #[error("timestamp {0} is too large")]
    TooLarge(u64),
    /// Beyond `now` plus the clock-skew tolerance. Possibly valid later.
    #[error("timestamp {0} is too far in the future")]
    Future(u64),
    /// `delete_after` lies in the past.
    #[error("document expired at {delete_after}")]
    Expired {
        /// The expiry carried by the document.
        delete_after: u64,
    },
    /// `delete_after` is not strictly after `timestamp`.
    #[error("delete_after {delete_after} is not after timestamp {timestamp}")]
    ExpiryBeforeCreation {
        /// The document timestamp.
        timestamp: u64,
        /// The expiry carried by the document.
        delete_after: u64,
    },
}

/// Errors from a document driver.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The driver (or its replica) was closed. All further operations fail
    /// with this error rather than producing undefined behavior.
    #[error("storage is closed")]
    Closed,
    /// Driver-specific failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Error returned when opening a [`crate::Replica`] over a driver.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// The driver belongs to a different share.
    #[error("driver share {driver} does not match {requested}")]
    ShareMismatch {
        /// Share the driver was created for.
        driver: ShareAddress,
        /// Share the replica was asked to open.
        requested: ShareAddress,
    },
    /// The driver carries data with an unsupported schema version.
    #[error("unsupported schema version {0:?}")]
    UnsupportedSchema(String),
    /// Storage failure while opening.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors in the sync protocol, surfaced to the coordinator.
///
/// The coordinator drops the affected share from the round instead of
/// aborting the whole connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The partner's store for this share was replaced or reset since we
    /// learned its storage id; our cursor is meaningless against it.
    #[error("storage id mismatch for {share}")]
    StorageIdMismatch {
        /// The share whose storage id no longer matches.
        share: ShareAddress,
    },
    /// The partner no longer holds the referenced share.
    #[error("unknown share {0}")]
    UnknownShare(ShareAddress),
    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}
