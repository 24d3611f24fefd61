//! Stateless document validation, canonical hashing, and signing.
//!
//! A [`FormatValidator`] judges one document at a time with no other context.
//! There is exactly one dispatch point for formats (the replica picks its
//! validator at construction), so this is a plain trait with one concrete
//! implementation rather than any registry machinery.

use std::fmt::Debug;

use ed25519_dalek::Signature;

use crate::{
    document::Document,
    error::{TimestampError, ValidationError},
    keys::{base32, AuthorKeypair},
};

/// Format id of the [`FmtD1`] validator.
pub const FORMAT_D1: &str = "d.1";

/// Minimum allowed document timestamp, in microseconds.
pub const MIN_TIMESTAMP: u64 = 10_000_000_000_000;
/// Maximum allowed document timestamp, in microseconds.
///
/// Chosen to stay within the exactly-representable integer range of an IEEE
/// double, so timestamps survive implementations that parse them as floats.
pub const MAX_TIMESTAMP: u64 = 9_007_199_254_740_990;
/// Tolerated clock skew into the future, in microseconds (10 minutes).
pub const TIMESTAMP_SKEW: u64 = 600_000_000;
/// Maximum content length in bytes.
pub const MAX_CONTENT_LENGTH: usize = 4_000_000;
/// Maximum path length in bytes.
pub const MAX_PATH_LENGTH: usize = 512;
/// Non-alphanumeric characters allowed in paths.
pub const PATH_PUNCTUATION: &str = "/'()-._!$&+,:=@%~";

/// Validity, hashing and signing rules for one document format.
pub trait FormatValidator: Debug + Send + Sync + 'static {
    /// The format id documents must carry to be accepted by this validator.
    fn format(&self) -> &'static str;

    /// Check a document against every rule of the format.
    ///
    /// Runs shape, write-permission, timestamp, path, address, signature and
    /// content-hash checks in that order, short-circuiting at the first
    /// failure. Pure: `now` is passed in so callers control the clock.
    fn check_valid(&self, doc: &Document, now: u64) -> Result<(), ValidationError>;

    /// The canonical hash of a document.
    ///
    /// Covers every field except `content`, `signature` and `local_index`;
    /// this is what gets signed, and doubles as the document's identity.
    fn document_hash(&self, doc: &Document) -> blake3::Hash;

    /// Hash content bytes into the string form stored in `content_hash`.
    fn content_hash(&self, content: &[u8]) -> String;

    /// Fill in `content_hash` and `signature` on a draft document.
    ///
    /// Errors if the keypair's address is not the document's author. That is
    /// a caller bug, but it is reported through the same typed channel to
    /// keep the whole path panic-free.
    fn sign(&self, keypair: &AuthorKeypair, doc: Document) -> Result<Document, ValidationError>;
}

/// The `d.1` document format.
#[derive(Debug, Clone, Copy, Default)]
pub struct FmtD1;

impl FormatValidator for FmtD1 {
    fn format(&self) -> &'static str {
        FORMAT_D1
    }

    fn check_valid(&self, doc: &Document, now: u64) -> Result<(), ValidationError> {
        self.check_shape(doc)?;
        check_author_can_write(doc)?;
        check_timestamps(doc, now)?;
        check_path(&doc.path)?;
        doc.author.check()?;
        doc.share.check()?;
        self.check_signature(doc)?;
        if self.content_hash(&doc.content) != doc.content_hash {
            return Err(ValidationError::ContentHashMismatch);
        }
        Ok(())
    }

    fn document_hash(&self, doc: &Document) -> blake3::Hash {
        // Canonical serialization: fields sorted by name, one `name\tvalue\n`
        // line each, unset optionals omitted. `content` is represented by
        // `content_hash`, so content can be dropped without breaking the
        // signature.
        let mut payload = String::new();
        push_field(&mut payload, "author", doc.author.as_str());
        push_field(&mut payload, "content_hash", &doc.content_hash);
        if let Some(delete_after) = doc.delete_after {
            push_field(&mut payload, "delete_after", &delete_after.to_string());
        }
        push_field(&mut payload, "format", &doc.format);
        push_field(&mut payload, "path", &doc.path);
        push_field(&mut payload, "share", doc.share.as_str());
        push_field(&mut payload, "timestamp", &doc.timestamp.to_string());
        blake3::hash(payload.as_bytes())
    }

    fn content_hash(&self, content: &[u8]) -> String {
        format!("b{}", base32::fmt(blake3::hash(content).as_bytes()))
    }

    fn sign(&self, keypair: &AuthorKeypair, mut doc: Document) -> Result<Document, ValidationError> {
        if keypair.address() != doc.author {
            return Err(ValidationError::SigningKeyMismatch {
                keypair: keypair.address().to_string(),
                author: doc.author.to_string(),
            });
        }
        doc.content_hash = self.content_hash(&doc.content);
        let hash = self.document_hash(&doc);
        let signature: Signature = keypair.sign(hash.as_bytes());
        doc.signature = crate::document::DocSignature::from_signature(&signature);
        Ok(doc)
    }
}

impl FmtD1 {
    fn check_shape(&self, doc: &Document) -> Result<(), ValidationError> {
        if doc.format != FORMAT_D1 {
            return Err(ValidationError::UnknownFormat(doc.format.clone()));
        }
        if doc.content.len() > MAX_CONTENT_LENGTH {
            return Err(ValidationError::ContentTooLong(doc.content.len()));
        }
        if doc.signature.is_empty() {
            return Err(ValidationError::BadSignature);
        }
        Ok(())
    }

    fn check_signature(&self, doc: &Document) -> Result<(), ValidationError> {
        let public_key = doc.author.public_key()?;
        let signature = doc.signature.to_signature()?;
        let hash = self.document_hash(doc);
        public_key
            .verify(hash.as_bytes(), &signature)
            .map_err(|_| ValidationError::BadSignature)
    }
}

fn push_field(payload: &mut String, name: &str, value: &str) {
    payload.push_str(name);
    payload.push('\t');
    payload.push_str(value);
    payload.push('\n');
}

/// Check write permission: public paths have no `~`; owned paths embed
/// `~<address>` for every permitted author.
fn check_author_can_write(doc: &Document) -> Result<(), ValidationError> {
    if !doc.path.contains('~') {
        return Ok(());
    }
    let owner_marker = format!("~{}", doc.author.as_str());
    if doc.path.contains(&owner_marker) {
        return Ok(());
    }
    Err(ValidationError::UnwritablePath(doc.path.clone()))
}

fn check_timestamps(doc: &Document, now: u64) -> Result<(), ValidationError> {
    if doc.timestamp < MIN_TIMESTAMP {
        return Err(TimestampError::TooSmall(doc.timestamp).into());
    }
    if doc.timestamp > MAX_TIMESTAMP {
        return Err(TimestampError::TooLarge(doc.timestamp).into());
    }
    if doc.timestamp > now.saturating_add(TIMESTAMP_SKEW) {
        return Err(TimestampError::Future(doc.timestamp).into());
    }
    match doc.delete_after {
        Some(delete_after) => {
            if !doc.path.contains('!') {
                return Err(ValidationError::EphemeralMarker(
                    "delete_after is set but path has no ! marker",
                ));
            }
            if delete_after > MAX_TIMESTAMP {
                return Err(TimestampError::TooLarge(delete_after).into());
            }
            if delete_after <= doc.timestamp {
                return Err(TimestampError::ExpiryBeforeCreation {
                    timestamp: doc.timestamp,
                    delete_after,
                }
                .into());
            }
            if delete_after < now {
                return Err(TimestampError::Expired { delete_after }.into());
            }
        }
        None => {
            if doc.path.contains('!') {
                return Err(ValidationError::EphemeralMarker(
                    "path has a ! marker but delete_after is not set",
                ));
            }
        }
    }
    Ok(())
}

fn check_path(path: &str) -> Result<(), ValidationError> {
    if path.len() < 2 {
        return Err(ValidationError::Path("path is too short"));
    }
    if path.len() > MAX_PATH_LENGTH {
        return Err(ValidationError::Path("path is too long"));
    }
    if !path.starts_with('/') {
        return Err(ValidationError::Path("path must start with /"));
    }
    if path.ends_with('/') {
        return Err(ValidationError::Path("path must not end with /"));
    }
    if path.contains("//") {
        return Err(ValidationError::Path("path must not contain //"));
    }
    if path.contains("/@") {
        return Err(ValidationError::Path("path segment must not start with @"));
    }
    if !path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || PATH_PUNCTUATION.contains(c))
    {
        return Err(ValidationError::Path("path has invalid characters"));
    }
    Ok(())
}
