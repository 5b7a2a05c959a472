// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

//! Path canonicalization and ignore patterns.
//!
//! Both types are collaborator surfaces for the indexer: the sync core itself
//! only ever sees path hashes, but the folder group constructs and owns these
//! so that every component indexing the same folder agrees on normalization
//! and ignore semantics.

use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::FolderParams;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("Path is outside the folder root")]
    OutsideRoot,
    #[error("Path is inside the folder system directory")]
    InSystemDir,
    #[error("Path is not valid UTF-8")]
    NotUtf8,
    #[error("Invalid ignore pattern: {0}")]
    BadPattern(String),
}

/// Canonicalizes absolute paths to the normalized relative form used for
/// hashing, and back.
#[derive(Debug, Clone)]
pub struct PathNormalizer {
    root: PathBuf,
    system_path: PathBuf,
}

impl PathNormalizer {
    pub fn new(params: &FolderParams) -> Self {
        Self {
            root: params.root.clone(),
            system_path: params.system_path.clone(),
        }
    }

    /// Relativize an absolute path against the folder root. The result always
    /// uses forward slashes, so hashes agree across platforms.
    pub fn normalize(&self, path: &Path) -> Result<String, PathError> {
        if path.starts_with(&self.system_path) {
            return Err(PathError::InSystemDir);
        }
        let rel = path.strip_prefix(&self.root).map_err(|_| PathError::OutsideRoot)?;
        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => {
                    parts.push(part.to_str().ok_or(PathError::NotUtf8)?)
                },
                Component::CurDir => {},
                // A `..` in the relative remainder can escape the root.
                _ => return Err(PathError::OutsideRoot),
            }
        }
        Ok(parts.join("/"))
    }

    /// Rebuild the absolute path for a normalized relative one.
    pub fn absolutize(&self, normalized: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in normalized.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }
}

/// User-defined ignore patterns, tested against normalized relative paths.
#[derive(Debug, Clone)]
pub struct IgnoreList {
    set: GlobSet,
}

impl IgnoreList {
    pub fn new<I, S>(patterns: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern.as_ref())
                .map_err(|e| PathError::BadPattern(e.to_string()))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| PathError::BadPattern(e.to_string()))?;
        Ok(Self { set })
    }

    pub fn empty() -> Self {
        Self {
            set: GlobSet::empty(),
        }
    }

    pub fn is_ignored(&self, normalized: &str) -> bool {
        self.set.is_match(normalized)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::secret::{Secret, SecretKind};

    fn normalizer() -> PathNormalizer {
        let params = FolderParams::new("/data/folder", Secret::generate(SecretKind::Owner));
        PathNormalizer::new(&params)
    }

    #[test]
    fn normalize_and_absolutize() {
        let norm = normalizer();
        let rel = norm.normalize(Path::new("/data/folder/docs/a.txt")).unwrap();
        assert_eq!(rel, "docs/a.txt");
        assert_eq!(norm.absolutize(&rel), PathBuf::from("/data/folder/docs/a.txt"));
    }

    #[test]
    fn rejects_escapes_and_system_dir() {
        let norm = normalizer();
        assert_eq!(
            norm.normalize(Path::new("/elsewhere/file")).unwrap_err(),
            PathError::OutsideRoot
        );
        assert_eq!(
            norm.normalize(Path::new("/data/folder/../file")).unwrap_err(),
            PathError::OutsideRoot
        );
        assert_eq!(
            norm.normalize(Path::new("/data/folder/.rivulet/index")).unwrap_err(),
            PathError::InSystemDir
        );
    }

    #[test]
    fn ignore_patterns() {
        let ignores = IgnoreList::new(["*.tmp", "build/**"]).unwrap();
        assert!(ignores.is_ignored("a.tmp"));
        assert!(ignores.is_ignored("build/out/bin"));
        assert!(!ignores.is_ignored("src/a.rs"));
        assert!(!IgnoreList::empty().is_ignored("a.tmp"));
    }

    #[test]
    fn bad_pattern_is_reported() {
        assert!(matches!(
            IgnoreList::new(["{unclosed"]).unwrap_err(),
            PathError::BadPattern(_)
        ));
    }
}
