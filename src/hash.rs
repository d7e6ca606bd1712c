use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::fs;
use std::sync::RwLock;
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// A 16-byte BLAKE3-derived digest used for task signatures, task identities
/// and file contents.
///
/// Two digests are equal only if the bytes that produced them were equal, so
/// a task whose recorded signature equals its freshly computed signature can
/// be skipped.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Digest([u8; 16]);

impl Digest {
    pub fn of(buffer: impl AsRef<[u8]>) -> Self {
        let mut hasher = SigHasher::default();
        hasher.update(buffer.as_ref());
        hasher.finish()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(32);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl From<[u8; 16]> for Digest {
    fn from(value: [u8; 16]) -> Self {
        Digest(value)
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental combiner used to fold several parts into one signature.
///
/// Every part is length-prefixed, so `["ab", "c"]` and `["a", "bc"]` never
/// collide.
#[derive(Default, Clone)]
pub struct SigHasher(blake3::Hasher);

impl SigHasher {
    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    pub fn part(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    pub fn digest(&mut self, digest: &Digest) -> &mut Self {
        self.0.update(digest.as_bytes());
        self
    }

    pub fn finish(&self) -> Digest {
        let mut output = [0u8; 16];
        self.0.finalize_xof().fill(&mut output);
        Digest(output)
    }
}

impl std::hash::Hasher for SigHasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// Modification time and content digest remembered for a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub mtime: u128,
    pub digest: Digest,
}

/// Content hasher for files and byte strings.
///
/// With the fast path enabled, the digest of each file is remembered together
/// with its modification time and recomputed only when the modification time
/// changes. The digest itself is always computed from content. The fast path
/// must stay disabled when tools may rewrite files while preserving mtimes.
#[derive(Debug, Default)]
pub struct Hasher {
    fast: bool,
    cache: RwLock<HashMap<Utf8PathBuf, Stamp>>,
}

impl Hasher {
    pub fn new(fast: bool) -> Self {
        Self {
            fast,
            cache: RwLock::default(),
        }
    }

    /// Creates a hasher seeded with stamps persisted by a previous run.
    pub fn with_cache(fast: bool, cache: HashMap<Utf8PathBuf, Stamp>) -> Self {
        Self {
            fast,
            cache: RwLock::new(if fast { cache } else { HashMap::new() }),
        }
    }

    pub fn is_fast(&self) -> bool {
        self.fast
    }

    pub fn digest(&self, bytes: impl AsRef<[u8]>) -> Digest {
        Digest::of(bytes)
    }

    pub fn file_digest(&self, path: &Utf8Path) -> std::io::Result<Digest> {
        if !self.fast {
            return hash_file(path);
        }

        let mtime = mtime_of(path)?;

        if let Some(stamp) = self.cache.read().unwrap().get(path)
            && stamp.mtime == mtime
        {
            return Ok(stamp.digest);
        }

        // Concurrent misses recompute the same value, last writer wins.
        let digest = hash_file(path)?;
        self.cache
            .write()
            .unwrap()
            .insert(path.to_owned(), Stamp { mtime, digest });

        Ok(digest)
    }

    /// Forgets the remembered stamp of a file, e.g. after a task rewrote it.
    pub fn forget(&self, path: &Utf8Path) {
        if self.fast {
            self.cache.write().unwrap().remove(path);
        }
    }

    pub(crate) fn snapshot(&self) -> HashMap<Utf8PathBuf, Stamp> {
        if self.fast {
            self.cache.read().unwrap().clone()
        } else {
            HashMap::new()
        }
    }
}

fn hash_file(path: &Utf8Path) -> std::io::Result<Digest> {
    let mut hasher = blake3::Hasher::new();
    hasher.update_mmap_rayon(path)?;

    let mut output = [0u8; 16];
    hasher.finalize_xof().fill(&mut output);
    Ok(Digest(output))
}

pub(crate) fn mtime_of(path: &Utf8Path) -> std::io::Result<u128> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_digest_is_deterministic() {
        assert_eq!(Digest::of("hello"), Digest::of("hello"));
        assert_ne!(Digest::of("hello"), Digest::of("hello!"));
        assert_eq!(Digest::of("x").to_hex().len(), 32);
    }

    #[test]
    fn test_parts_are_length_prefixed() {
        let a = SigHasher::default().part("ab").part("c").finish();
        let b = SigHasher::default().part("a").part("bc").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn test_file_digest_matches_content() {
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("a.txt")).unwrap();
        fs::write(&path, b"content").unwrap();

        let hasher = Hasher::new(false);
        assert_eq!(hasher.file_digest(&path).unwrap(), Digest::of("content"));
    }

    #[test]
    fn test_fast_path_reuses_stamp_for_same_mtime() {
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("a.txt")).unwrap();
        fs::write(&path, b"one").unwrap();

        let mtime = mtime_of(&path).unwrap();
        let fake = Digest::of("remembered");
        let cache = HashMap::from([(path.clone(), Stamp { mtime, digest: fake })]);

        let hasher = Hasher::with_cache(true, cache);
        assert_eq!(hasher.file_digest(&path).unwrap(), fake);

        hasher.forget(&path);
        assert_eq!(hasher.file_digest(&path).unwrap(), Digest::of("one"));
        assert_eq!(hasher.snapshot().len(), 1);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let hasher = Hasher::new(true);
        assert!(hasher.file_digest(Utf8Path::new("/nonexistent/kamado")).is_err());
    }
}
