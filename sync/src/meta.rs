// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

//! Path metadata: the unit of the folder index.
//!
//! A [`Meta`] describes one path at one revision, including the ordered list
//! of content-addressed chunks making up the file body. Metas are produced by
//! the indexer, signed with the folder secret and immutable from then on.
//! [`SignedMeta`] couples a meta with its signature; the signature covers the
//! deterministic [`Meta::canonical_bytes`] encoding.

use std::fmt;

use digest::{consts::U32, Digest, FixedOutput};

use crate::secret::{Secret, SecretError, Signature};

type Blake2b256 = blake2::Blake2b<U32>;

/// Content hash addressing one chunk of ciphertext.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CtHash([u8; 32]);

impl CtHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash chunk bytes the way the indexer does, for verification on arrival.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(data);
        Self(hasher.finalize_fixed().into())
    }

    pub fn short_str(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for CtHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_str())
    }
}

impl fmt::Debug for CtHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CtHash({})", hex::encode(self.0))
    }
}

/// Keyed hash of a normalized relative path. The core never sees plaintext
/// paths; the indexer collapses them to path hashes before metadata reaches
/// this crate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathHash([u8; 32]);

impl PathHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn short_str(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_str())
    }
}

impl fmt::Debug for PathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathHash({})", hex::encode(self.0))
    }
}

/// Identifies one meta: a path at a revision. Revisions order per path;
/// comparing revisions across different paths is meaningless.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PathRevision {
    pub path_hash: PathHash,
    pub revision: u64,
}

impl fmt::Display for PathRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path_hash, self.revision)
    }
}

/// What kind of filesystem object a meta describes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MetaKind {
    File,
    Directory,
    Symlink,
    Deleted,
}

impl MetaKind {
    fn code(self) -> u8 {
        match self {
            MetaKind::File => 0,
            MetaKind::Directory => 1,
            MetaKind::Symlink => 2,
            MetaKind::Deleted => 3,
        }
    }
}

/// One chunk of a file body: its content hash and ciphertext size.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChunkRef {
    pub ct_hash: CtHash,
    pub size: u32,
}

/// Descriptor of one path at one revision. Immutable once produced.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Meta {
    path_hash: PathHash,
    revision: u64,
    kind: MetaKind,
    size: u64,
    chunks: Vec<ChunkRef>,
}

impl Meta {
    pub fn new(path_hash: PathHash, revision: u64, kind: MetaKind, chunks: Vec<ChunkRef>) -> Self {
        let size = chunks.iter().map(|c| u64::from(c.size)).sum();
        Self {
            path_hash,
            revision,
            kind,
            size,
            chunks,
        }
    }

    pub fn path_hash(&self) -> PathHash {
        self.path_hash
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn kind(&self) -> MetaKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn chunks(&self) -> &[ChunkRef] {
        &self.chunks
    }

    pub fn path_revision(&self) -> PathRevision {
        PathRevision {
            path_hash: self.path_hash,
            revision: self.revision,
        }
    }

    /// Deterministic encoding the signature covers. Fixed-width little-endian
    /// integers, fields in declaration order, chunk list length-prefixed.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + 8 + 1 + 8 + 4 + self.chunks.len() * 36);
        buf.extend_from_slice(self.path_hash.as_bytes());
        buf.extend_from_slice(&self.revision.to_le_bytes());
        buf.push(self.kind.code());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&(self.chunks.len() as u32).to_le_bytes());
        for chunk in &self.chunks {
            buf.extend_from_slice(chunk.ct_hash.as_bytes());
            buf.extend_from_slice(&chunk.size.to_le_bytes());
        }
        buf
    }
}

/// A meta plus the signature produced by an owner secret.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SignedMeta {
    meta: Meta,
    signature: Signature,
}

impl SignedMeta {
    /// Sign a meta with an owner secret. The indexer is the usual caller;
    /// tests use it to fabricate folder contents.
    pub fn sign(meta: Meta, secret: &Secret) -> Result<Self, SecretError> {
        let signature = secret.sign(&meta.canonical_bytes())?;
        Ok(Self { meta, signature })
    }

    /// Reassemble a received meta and signature. Verification is a separate,
    /// explicit step at the protocol boundary.
    pub fn from_parts(meta: Meta, signature: Signature) -> Self {
        Self { meta, signature }
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn path_revision(&self) -> PathRevision {
        self.meta.path_revision()
    }

    pub fn verify(&self, secret: &Secret) -> bool {
        secret.verify(&self.meta.canonical_bytes(), &self.signature)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::secret::SecretKind;

    fn chunk(fill: u8, size: u32) -> ChunkRef {
        ChunkRef {
            ct_hash: CtHash::from_bytes([fill; 32]),
            size,
        }
    }

    #[test]
    fn size_is_sum_of_chunks() {
        let meta = Meta::new(
            PathHash::from_bytes([1; 32]),
            1,
            MetaKind::File,
            vec![chunk(1, 100), chunk(2, 50)],
        );
        assert_eq!(meta.size(), 150);
    }

    #[test]
    fn canonical_bytes_distinguish_fields() {
        let base = Meta::new(PathHash::from_bytes([1; 32]), 7, MetaKind::File, vec![chunk(1, 10)]);
        let other_rev = Meta::new(PathHash::from_bytes([1; 32]), 8, MetaKind::File, vec![chunk(1, 10)]);
        let other_kind = Meta::new(PathHash::from_bytes([1; 32]), 7, MetaKind::Deleted, vec![chunk(1, 10)]);
        assert_ne!(base.canonical_bytes(), other_rev.canonical_bytes());
        assert_ne!(base.canonical_bytes(), other_kind.canonical_bytes());
        assert_eq!(base.canonical_bytes(), base.clone().canonical_bytes());
    }

    #[test]
    fn sign_verify_and_tamper() {
        let secret = Secret::generate(SecretKind::Owner);
        let meta = Meta::new(PathHash::from_bytes([2; 32]), 3, MetaKind::File, vec![chunk(9, 64)]);
        let smeta = SignedMeta::sign(meta.clone(), &secret).unwrap();
        assert!(smeta.verify(&secret));

        let tampered = SignedMeta::from_parts(
            Meta::new(PathHash::from_bytes([2; 32]), 4, MetaKind::File, vec![chunk(9, 64)]),
            *smeta.signature(),
        );
        assert!(!tampered.verify(&secret));

        let other_folder = Secret::generate(SecretKind::Owner);
        assert!(!smeta.verify(&other_folder));
    }

    #[test]
    fn ct_hash_compute_matches_itself() {
        let a = CtHash::compute(b"chunk bytes");
        let b = CtHash::compute(b"chunk bytes");
        let c = CtHash::compute(b"other bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
