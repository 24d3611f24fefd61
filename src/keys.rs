//! Author keypairs and the address grammar for authors and shares.

use std::{fmt, str::FromStr};

use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Length of an author shortname.
pub const SHORTNAME_LEN: usize = 4;
/// Maximum length of a share name.
pub const SHARE_NAME_MAX_LEN: usize = 15;
/// Maximum length of a share suffix.
pub const SHARE_SUFFIX_MAX_LEN: usize = 53;

/// An author keypair: a human-readable shortname plus an ed25519 signing key.
///
/// The derived [`AuthorAddress`] embeds the public key, so a document's
/// signature can be verified from the document alone.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthorKeypair {
    shortname: String,
    signing_key: SigningKey,
}

impl AuthorKeypair {
    /// Generate a new keypair with a random key.
    ///
    /// The shortname must be four characters, lowercase ascii letters and
    /// digits, starting with a letter.
    pub fn generate<R: CryptoRngCore + ?Sized>(
        rng: &mut R,
        shortname: &str,
    ) -> Result<Self, ValidationError> {
        check_shortname(shortname)?;
        let signing_key = SigningKey::generate(rng);
        Ok(AuthorKeypair {
            shortname: shortname.to_string(),
            signing_key,
        })
    }

    /// Rebuild a keypair from a shortname and secret key bytes.
    pub fn from_bytes(shortname: &str, bytes: &[u8; 32]) -> Result<Self, ValidationError> {
        check_shortname(shortname)?;
        Ok(AuthorKeypair {
            shortname: shortname.to_string(),
            signing_key: SigningKey::from_bytes(bytes),
        })
    }

    /// The secret key bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The keypair's shortname.
    pub fn shortname(&self) -> &str {
        &self.shortname
    }

    /// The public half of this keypair.
    pub fn public_key(&self) -> AuthorPublicKey {
        AuthorPublicKey(self.signing_key.verifying_key())
    }

    /// The address derived from this keypair.
    pub fn address(&self) -> AuthorAddress {
        AuthorAddress::from_parts(&self.shortname, &self.public_key())
    }

    /// Sign a message with this keypair.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }

    /// Strictly verify a signature on a message with this keypair's public key.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.signing_key.verify_strict(msg, signature)
    }
}

impl fmt::Debug for AuthorKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorKeypair({})", self.address())
    }
}

/// The public key of an author, used to verify document signatures.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::From)]
pub struct AuthorPublicKey(VerifyingKey);

impl AuthorPublicKey {
    /// Verify that `signature` matches `msg` and was created by the keypair
    /// behind this public key.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.0.verify_strict(msg, signature)
    }

    /// The raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Create from raw bytes.
    ///
    /// Fails if the bytes are not a valid ed25519 curve point. Never fails
    /// for bytes returned from [`Self::as_bytes`].
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, SignatureError> {
        Ok(AuthorPublicKey(VerifyingKey::from_bytes(bytes)?))
    }
}

impl fmt::Debug for AuthorPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorPublicKey({})", base32::fmt(self.as_bytes()))
    }
}

impl fmt::Display for AuthorPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.as_bytes()))
    }
}

/// An author address: `@<shortname>.b<base32 public key>`.
///
/// The address is part of every signed document, so it is kept in its string
/// form; [`AuthorAddress::check`] revalidates the grammar for addresses that
/// arrived over the wire.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(transparent)]
pub struct AuthorAddress(String);

impl AuthorAddress {
    fn from_parts(shortname: &str, public_key: &AuthorPublicKey) -> Self {
        AuthorAddress(format!(
            "@{shortname}.b{}",
            base32::fmt(public_key.as_bytes())
        ))
    }

    /// The address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The shortname part of the address.
    ///
    /// Addresses deserialize without validation, so this must not assume the
    /// grammar holds: on a malformed address it returns the empty string.
    pub fn shortname(&self) -> &str {
        self.0.get(1..1 + SHORTNAME_LEN).unwrap_or_default()
    }

    /// Check the address against the author address grammar.
    pub fn check(&self) -> Result<(), ValidationError> {
        let rest = self
            .0
            .strip_prefix('@')
            .ok_or(ValidationError::Address("author address must start with @"))?;
        let (shortname, keypart) = rest
            .split_once('.')
            .ok_or(ValidationError::Address("author address must contain ."))?;
        check_shortname(shortname)?;
        let b32 = keypart.strip_prefix('b').ok_or(ValidationError::Address(
            "author key must start with b",
        ))?;
        let bytes: [u8; 32] = base32::parse_array(b32)
            .map_err(|_| ValidationError::Address("author key is not valid base32"))?;
        // Must also be a valid curve point, or signature checks are undefined.
        AuthorPublicKey::from_bytes(&bytes)
            .map_err(|_| ValidationError::Address("author key is not a valid public key"))?;
        Ok(())
    }

    /// Extract the public key embedded in the address.
    pub fn public_key(&self) -> Result<AuthorPublicKey, ValidationError> {
        self.check()?;
        let b32 = &self.0[2 + SHORTNAME_LEN + 1..];
        let bytes: [u8; 32] = base32::parse_array(b32)
            .map_err(|_| ValidationError::Address("author key is not valid base32"))?;
        AuthorPublicKey::from_bytes(&bytes)
            .map_err(|_| ValidationError::Address("author key is not a valid public key"))
    }
}

impl FromStr for AuthorAddress {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = AuthorAddress(s.to_string());
        addr.check()?;
        Ok(addr)
    }
}

/// A share address: `+<name>.<suffix>`.
///
/// Shares are capability-style identifiers: knowing the address is what lets
/// a peer ask about the share at all, which is why the sync handshake only
/// ever transmits salted hashes of these.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(transparent)]
pub struct ShareAddress(String);

impl ShareAddress {
    /// The address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name part of the address. Empty on a malformed address.
    pub fn name(&self) -> &str {
        let rest = self.0.get(1..).unwrap_or_default();
        rest.split_once('.').map(|(name, _)| name).unwrap_or(rest)
    }

    /// Check the address against the share address grammar.
    pub fn check(&self) -> Result<(), ValidationError> {
        let rest = self
            .0
            .strip_prefix('+')
            .ok_or(ValidationError::Address("share address must start with +"))?;
        let (name, suffix) = rest
            .split_once('.')
            .ok_or(ValidationError::Address("share address must contain ."))?;
        if name.is_empty() || name.len() > SHARE_NAME_MAX_LEN {
            return Err(ValidationError::Address("share name has invalid length"));
        }
        if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
            return Err(ValidationError::Address(
                "share name must start with a letter",
            ));
        }
        if !name.chars().all(is_name_char) {
            return Err(ValidationError::Address(
                "share name has invalid characters",
            ));
        }
        if suffix.is_empty() || suffix.len() > SHARE_SUFFIX_MAX_LEN {
            return Err(ValidationError::Address("share suffix has invalid length"));
        }
        if suffix.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(ValidationError::Address(
                "share suffix must not start with a digit",
            ));
        }
        if !suffix.chars().all(is_name_char) {
            return Err(ValidationError::Address(
                "share suffix has invalid characters",
            ));
        }
        Ok(())
    }
}

impl FromStr for ShareAddress {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = ShareAddress(s.to_string());
        addr.check()?;
        Ok(addr)
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit()
}

fn check_shortname(shortname: &str) -> Result<(), ValidationError> {
    if shortname.len() != SHORTNAME_LEN {
        return Err(ValidationError::Address(
            "author shortname must be 4 characters",
        ));
    }
    if !shortname.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err(ValidationError::Address(
            "author shortname must start with a letter",
        ));
    }
    if !shortname.chars().all(is_name_char) {
        return Err(ValidationError::Address(
            "author shortname has invalid characters",
        ));
    }
    Ok(())
}

/// Utilities for working with byte array identifiers.
pub(crate) mod base32 {
    /// Convert to a lowercase base32 string.
    pub fn fmt(bytes: impl AsRef<[u8]>) -> String {
        let mut text = data_encoding::BASE32_NOPAD.encode(bytes.as_ref());
        text.make_ascii_lowercase();
        text
    }

    /// Parse from a base32 string into a byte array.
    pub fn parse_array<const N: usize>(input: &str) -> anyhow::Result<[u8; N]> {
        data_encoding::BASE32_NOPAD
            .decode(input.to_ascii_uppercase().as_bytes())?
            .try_into()
            .map_err(|_| ::anyhow::anyhow!("Failed to parse: invalid byte length"))
    }
}
