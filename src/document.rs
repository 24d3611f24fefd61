//! The signed document type and its conflict-resolution ordering.

use std::{cmp::Ordering, fmt, time::SystemTime};

use bytes::Bytes;
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

use crate::{
    error::ValidationError,
    keys::{base32, AuthorAddress, ShareAddress},
};

/// A single document in a share.
///
/// Immutable once signed; an update is a new document that supersedes the old
/// one under the `(timestamp, signature)` order. `local_index` is assigned by
/// the ingesting replica and is not part of the signed payload: it travels
/// with the document only so sync partners can use it as a cursor, and is
/// never comparable across replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Identifier of the format/validator this document conforms to.
    pub format: String,
    /// The share this document belongs to.
    pub share: ShareAddress,
    /// Path key within the share.
    pub path: String,
    /// Address of the author who signed this document.
    pub author: AuthorAddress,
    /// Creation time in microseconds since the Unix epoch.
    pub timestamp: u64,
    /// Optional expiry in microseconds since the Unix epoch.
    ///
    /// Present exactly when the path carries the `!` ephemeral marker.
    pub delete_after: Option<u64>,
    /// The document content.
    pub content: Bytes,
    /// Digest of `content`, part of the signed payload so content can be
    /// dropped independently of the record.
    pub content_hash: String,
    /// Detached signature over the canonical document hash.
    pub signature: DocSignature,
    /// Per-replica ingestion sequence number. Not signed.
    #[serde(default)]
    pub local_index: u64,
}

impl Document {
    /// Compare two documents under the conflict-resolution order:
    /// higher timestamp wins, ties are broken by the greater signature.
    ///
    /// Total and deterministic, so every replica picks the same winner
    /// regardless of arrival order.
    pub fn cmp_newer(&self, other: &Document) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.signature.cmp(&other.signature))
    }

    /// Whether this document's expiry lies in the past.
    pub fn is_expired(&self, now: u64) -> bool {
        match self.delete_after {
            Some(delete_after) => delete_after < now,
            None => false,
        }
    }

    /// Content length in bytes.
    pub fn content_len(&self) -> u64 {
        self.content.len() as u64
    }
}

/// A document signature, kept in its base32 string form.
///
/// String comparison on these is the signature half of the conflict
/// resolution tie-break, so the encoding must be stable; it is also what a
/// document carries on the wire.
#[derive(
    Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(transparent)]
pub struct DocSignature(String);

impl DocSignature {
    /// Encode a raw ed25519 signature.
    pub fn from_signature(signature: &Signature) -> Self {
        DocSignature(format!("b{}", base32::fmt(signature.to_bytes())))
    }

    /// Decode back into an ed25519 signature.
    pub fn to_signature(&self) -> Result<Signature, ValidationError> {
        let b32 = self
            .0
            .strip_prefix('b')
            .ok_or(ValidationError::BadSignature)?;
        let bytes: [u8; 64] =
            base32::parse_array(b32).map_err(|_| ValidationError::BadSignature)?;
        Ok(Signature::from_bytes(&bytes))
    }

    /// The signature as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the empty placeholder of an unsigned draft.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for DocSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocSignature({})", self.0)
    }
}

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn microsecond_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("time drift")
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(timestamp: u64, sig: &str) -> Document {
        let mut rng = rand::thread_rng();
        let author = crate::keys::AuthorKeypair::generate(&mut rng, "test")
            .unwrap()
            .address();
        Document {
            format: "d.1".into(),
            share: "+test.a1".parse().unwrap(),
            path: "/x".into(),
            author,
            timestamp,
            delete_after: None,
            content: Bytes::from_static(b"hi"),
            content_hash: String::new(),
            signature: DocSignature(sig.to_string()),
            local_index: 0,
        }
    }

    #[test]
    fn ordering_prefers_timestamp_then_signature() {
        let a = doc(10, "baaa");
        let b = doc(20, "baaa");
        assert_eq!(a.cmp_newer(&b), Ordering::Less);
        assert_eq!(b.cmp_newer(&a), Ordering::Greater);

        let c = doc(10, "bzzz");
        assert_eq!(a.cmp_newer(&c), Ordering::Less);
        assert_eq!(c.cmp_newer(&a), Ordering::Greater);
        assert_eq!(a.cmp_newer(&a.clone()), Ordering::Equal);
    }

    #[test]
    fn expiry() {
        let mut d = doc(10, "baaa");
        assert!(!d.is_expired(u64::MAX));
        d.delete_after = Some(100);
        assert!(!d.is_expired(100));
        assert!(d.is_expired(101));
    }
}
