// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

//! Folder secrets and the identifiers derived from them.
//!
//! A [`Secret`] is the folder-wide credential: whoever holds it is a member of
//! the folder, with capabilities determined by its kind. The core treats the
//! key material as opaque apart from signing and verifying metadata. The
//! public hash of the secret is the [`FolderId`] used to address folder state
//! everywhere in the daemon.

use std::{fmt, str::FromStr};

use blake2::Blake2bMac;
use digest::{consts::U32, Digest, FixedOutput, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};

type Blake2b256 = blake2::Blake2b<U32>;
type SecretMac = Blake2bMac<U32>;

const KEY_LEN: usize = 32;
const SECRET_VERSION: char = '1';

/// Capability tier carried by a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretKind {
    /// Full member: may produce and sign new metadata.
    Owner,
    /// May decrypt and verify, but not sign.
    ReadOnly,
    /// Replicates ciphertext without being able to read it.
    Untrusted,
}

impl SecretKind {
    pub fn code(self) -> char {
        match self {
            SecretKind::Owner => 'A',
            SecretKind::ReadOnly => 'B',
            SecretKind::Untrusted => 'C',
        }
    }

    fn from_code(code: char) -> Option<Self> {
        match code {
            'A' => Some(SecretKind::Owner),
            'B' => Some(SecretKind::ReadOnly),
            'C' => Some(SecretKind::Untrusted),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("Unknown secret kind code '{0}'")]
    UnknownKind(char),
    #[error("Unsupported secret version '{0}'")]
    UnsupportedVersion(char),
    #[error("Malformed secret string")]
    Malformed,
    #[error("Secret of kind {0:?} cannot sign metadata")]
    SigningNotAllowed(SecretKind),
}

/// Folder credential. Display/FromStr round-trips the canonical string form
/// `<kind code><version><hex key>`, e.g. `A194fe21…`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    kind: SecretKind,
    key: [u8; KEY_LEN],
}

impl Secret {
    /// Generate a fresh folder secret of the given kind.
    pub fn generate(kind: SecretKind) -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self { kind, key }
    }

    pub fn from_key(kind: SecretKind, key: [u8; KEY_LEN]) -> Self {
        Self { kind, key }
    }

    pub fn kind(&self) -> SecretKind {
        self.kind
    }

    /// Public hash of the secret. Shared by every kind derived from the same
    /// key material, so all members of one folder agree on the id.
    pub fn folder_id(&self) -> FolderId {
        let mut hasher = Blake2b256::new();
        hasher.update(b"rivulet.folderid");
        hasher.update(self.key);
        FolderId(hasher.finalize_fixed().into())
    }

    /// Sign a byte string. Only owner secrets may sign.
    pub fn sign(&self, data: &[u8]) -> Result<Signature, SecretError> {
        if self.kind != SecretKind::Owner {
            return Err(SecretError::SigningNotAllowed(self.kind));
        }
        let mut mac = SecretMac::new_from_slice(&self.key).expect("key length is fixed");
        mac.update(data);
        Ok(Signature(mac.finalize_fixed().into()))
    }

    /// Verify a signature over a byte string. Comparison is constant-time.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> bool {
        let mut mac = SecretMac::new_from_slice(&self.key).expect("key length is fixed");
        mac.update(data);
        mac.verify_slice(&signature.0).is_ok()
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.kind.code(),
            SECRET_VERSION,
            hex::encode(self.key)
        )
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs.
        write!(f, "Secret({:?}, {})", self.kind, self.folder_id())
    }
}

impl FromStr for Secret {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let kind_code = chars.next().ok_or(SecretError::Malformed)?;
        let kind = SecretKind::from_code(kind_code).ok_or(SecretError::UnknownKind(kind_code))?;
        let version = chars.next().ok_or(SecretError::Malformed)?;
        if version != SECRET_VERSION {
            return Err(SecretError::UnsupportedVersion(version));
        }
        let key_hex = chars.as_str();
        let bytes = hex::decode(key_hex).map_err(|_| SecretError::Malformed)?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| SecretError::Malformed)?;
        Ok(Self { kind, key })
    }
}

/// Public hash of a folder secret; addresses folder state across the daemon.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderId([u8; 32]);

impl FolderId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// First 8 hex characters, for log lines.
    pub fn short_str(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_str())
    }
}

impl fmt::Debug for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FolderId({})", hex::encode(self.0))
    }
}

/// Detached MAC over a meta's canonical encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub(crate) [u8; 32]);

impl Signature {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn string_form_round_trips() {
        let secret = Secret::generate(SecretKind::Owner);
        let s = secret.to_string();
        assert!(s.starts_with("A1"));
        let parsed = s.parse::<Secret>().unwrap();
        assert_eq!(parsed, secret);
        assert_eq!(parsed.folder_id(), secret.folder_id());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!("".parse::<Secret>().unwrap_err(), SecretError::Malformed);
        assert_eq!(
            "Z1aabb".parse::<Secret>().unwrap_err(),
            SecretError::UnknownKind('Z')
        );
        assert_eq!(
            "A9aabb".parse::<Secret>().unwrap_err(),
            SecretError::UnsupportedVersion('9')
        );
        assert_eq!(
            "A1zzzz".parse::<Secret>().unwrap_err(),
            SecretError::Malformed
        );
        // Wrong key length
        assert_eq!(
            "A1aabbcc".parse::<Secret>().unwrap_err(),
            SecretError::Malformed
        );
    }

    #[test]
    fn same_key_same_folder_id_across_kinds() {
        let owner = Secret::generate(SecretKind::Owner);
        let read_only = Secret::from_key(SecretKind::ReadOnly, *owner_key(&owner));
        assert_eq!(owner.folder_id(), read_only.folder_id());
    }

    fn owner_key(secret: &Secret) -> &[u8; 32] {
        &secret.key
    }

    #[test]
    fn sign_and_verify() {
        let secret = Secret::generate(SecretKind::Owner);
        let sig = secret.sign(b"payload").unwrap();
        assert!(secret.verify(b"payload", &sig));
        assert!(!secret.verify(b"tampered", &sig));

        let mut tampered = sig;
        tampered.0[0] ^= 0xff;
        assert!(!secret.verify(b"payload", &tampered));
    }

    #[test]
    fn non_owner_cannot_sign() {
        let secret = Secret::generate(SecretKind::ReadOnly);
        assert_eq!(
            secret.sign(b"payload").unwrap_err(),
            SecretError::SigningNotAllowed(SecretKind::ReadOnly)
        );
    }

    #[test]
    fn debug_does_not_leak_key() {
        let secret = Secret::generate(SecretKind::Owner);
        let dbg = format!("{:?}", secret);
        assert!(!dbg.contains(&hex::encode(secret.key)));
    }
}
