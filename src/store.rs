use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::hash::{Digest, Stamp, mtime_of};

/// Name of the container file inside the store directory.
pub const STORE_FILE: &str = "store.cbor";

/// Bumped whenever the container layout or the signature recipe changes.
const VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Container {
    version: u32,
    #[serde(default)]
    task_sigs: HashMap<Digest, Digest>,
    #[serde(default)]
    node_deps: HashMap<Digest, Vec<Utf8PathBuf>>,
    #[serde(default)]
    raw_deps: HashMap<Digest, Vec<String>>,
    #[serde(default)]
    node_sigs: HashMap<Utf8PathBuf, Digest>,
    #[serde(default)]
    hashes: HashMap<Utf8PathBuf, Stamp>,
}

/// Persistent signatures and implicit dependencies, keyed by task uid.
///
/// Only the scheduler thread touches the store. It is loaded once when the
/// build context is created and written back atomically at the end of the
/// build if anything changed.
#[derive(Debug, Default)]
pub struct SignatureStore {
    path: Option<Utf8PathBuf>,
    data: Container,
    dirty: bool,
}

impl SignatureStore {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Container {
                version: VERSION,
                ..Container::default()
            },
            dirty: false,
        }
    }

    /// Loads the store from `dir`.
    ///
    /// A missing, unreadable or outdated container yields an empty store, as
    /// does any of `config_files` having been modified after the store was
    /// last written.
    pub fn open(dir: &Utf8Path, config_files: &[Utf8PathBuf]) -> Result<Self, StoreError> {
        let path = dir.join(STORE_FILE);
        let mut store = Self::in_memory();
        store.path = Some(path.clone());

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(store),
            Err(e) => return Err(StoreError::Read(path, e)),
        };

        // a discarded container is replaced on the next save
        store.dirty = true;

        if let Some(config) = newer_config(&path, config_files) {
            tracing::info!("{config} changed, discarding the signature store");
            return Ok(store);
        }

        match ciborium::from_reader::<Container, _>(bytes.as_slice()) {
            Ok(data) if data.version == VERSION => {
                store.data = data;
                store.dirty = false;
            }
            Ok(data) => {
                tracing::warn!(
                    "signature store {path} has version {}, expected {VERSION}; starting afresh",
                    data.version
                );
            }
            Err(e) => tracing::warn!("signature store {path} is unreadable ({e}); starting afresh"),
        }

        Ok(store)
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn task_sig(&self, uid: &Digest) -> Option<Digest> {
        self.data.task_sigs.get(uid).copied()
    }

    pub fn set_task_sig(&mut self, uid: Digest, sig: Digest) {
        self.data.task_sigs.insert(uid, sig);
        self.dirty = true;
    }

    /// Resolved implicit dependencies of the last scan.
    pub fn node_deps(&self, uid: &Digest) -> Option<&[Utf8PathBuf]> {
        self.data.node_deps.get(uid).map(Vec::as_slice)
    }

    /// Names of the last scan that did not resolve to any file.
    pub fn raw_deps(&self, uid: &Digest) -> Option<&[String]> {
        self.data.raw_deps.get(uid).map(Vec::as_slice)
    }

    pub fn set_deps(&mut self, uid: Digest, nodes: Vec<Utf8PathBuf>, names: Vec<String>) {
        self.data.node_deps.insert(uid, nodes);
        self.data.raw_deps.insert(uid, names);
        self.dirty = true;
    }

    /// Signature recorded for a built file.
    pub fn node_sig(&self, path: &Utf8Path) -> Option<Digest> {
        self.data.node_sigs.get(path).copied()
    }

    pub fn set_node_sig(&mut self, path: Utf8PathBuf, sig: Digest) {
        self.data.node_sigs.insert(path, sig);
        self.dirty = true;
    }

    /// Forgets everything recorded for a task so that the next build runs and
    /// rescans it.
    pub fn invalidate(&mut self, uid: &Digest) {
        let removed = self.data.task_sigs.remove(uid).is_some()
            | self.data.node_deps.remove(uid).is_some()
            | self.data.raw_deps.remove(uid).is_some();

        self.dirty |= removed;
    }

    /// Cached `(mtime, digest)` pairs of the hasher.
    pub fn hashes(&self) -> &HashMap<Utf8PathBuf, Stamp> {
        &self.data.hashes
    }

    pub fn set_hashes(&mut self, hashes: HashMap<Utf8PathBuf, Stamp>) {
        if hashes != self.data.hashes {
            self.data.hashes = hashes;
            self.dirty = true;
        }
    }

    /// Writes the store next to its final location and renames it into
    /// place. Does nothing for an in-memory or unchanged store.
    pub fn save(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }

        let Some(path) = &self.path else {
            self.dirty = false;
            return Ok(());
        };

        let mut buffer = Vec::new();
        ciborium::into_writer(&self.data, &mut buffer)
            .map_err(|e| StoreError::Encode(e.to_string()))?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| StoreError::Write(dir.to_owned(), e))?;
        }

        let temp = path.with_extension("cbor.tmp");
        fs::write(&temp, &buffer).map_err(|e| StoreError::Write(temp.clone(), e))?;
        fs::rename(&temp, path).map_err(|e| StoreError::Write(path.clone(), e))?;

        tracing::debug!("saved signature store to {path} ({} bytes)", buffer.len());
        self.dirty = false;
        Ok(())
    }
}

/// First config artifact modified after the store file.
fn newer_config<'a>(store: &Utf8Path, config_files: &'a [Utf8PathBuf]) -> Option<&'a Utf8PathBuf> {
    let stored = mtime_of(store).ok()?;

    config_files
        .iter()
        .find(|config| mtime_of(config).is_ok_and(|mtime| mtime > stored))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn temp_dir() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_persists_across_opens() {
        let (_dir, root) = temp_dir();
        let store_dir = root.join(".kamado");
        let uid = Digest::of("uid");
        let sig = Digest::of("sig");

        let mut store = SignatureStore::open(&store_dir, &[]).unwrap();
        assert_eq!(store.task_sig(&uid), None);

        store.set_task_sig(uid, sig);
        store.set_deps(uid, vec![root.join("a.h")], vec!["missing.h".into()]);
        store.set_node_sig(root.join("a.o"), sig);
        assert!(store.is_dirty());
        store.save().unwrap();
        assert!(!store.is_dirty());
        assert!(!store_dir.join("store.cbor.tmp").exists());

        let store = SignatureStore::open(&store_dir, &[]).unwrap();
        assert_eq!(store.task_sig(&uid), Some(sig));
        assert_eq!(store.node_deps(&uid), Some(&[root.join("a.h")][..]));
        assert_eq!(store.raw_deps(&uid), Some(&["missing.h".to_string()][..]));
        assert_eq!(store.node_sig(&root.join("a.o")), Some(sig));
    }

    #[test]
    fn test_unchanged_store_is_not_written() {
        let (_dir, root) = temp_dir();
        let file = root.join(STORE_FILE);

        let mut store = SignatureStore::open(&root, &[]).unwrap();
        store.save().unwrap();
        assert!(!file.exists());

        store.set_task_sig(Digest::of("uid"), Digest::of("sig"));
        store.save().unwrap();
        assert!(file.exists());

        let mut store = SignatureStore::open(&root, &[]).unwrap();
        assert!(!store.is_dirty());
        fs::remove_file(&file).unwrap();
        store.save().unwrap();
        assert!(!file.exists());

        // invalidating an unknown task changes nothing either
        store.invalidate(&Digest::of("other"));
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_corrupt_store_is_rewritten() {
        let (_dir, root) = temp_dir();
        fs::write(root.join(STORE_FILE), b"definitely not cbor").unwrap();

        let mut store = SignatureStore::open(&root, &[]).unwrap();
        assert!(store.is_dirty());
        store.save().unwrap();

        let store = SignatureStore::open(&root, &[]).unwrap();
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_invalidate_forgets_task() {
        let mut store = SignatureStore::in_memory();
        let uid = Digest::of("uid");

        store.set_task_sig(uid, Digest::of("sig"));
        store.set_deps(uid, vec![], vec!["x.h".into()]);
        store.invalidate(&uid);

        assert_eq!(store.task_sig(&uid), None);
        assert_eq!(store.node_deps(&uid), None);
        assert_eq!(store.raw_deps(&uid), None);
    }

    #[test]
    fn test_corrupt_store_starts_empty() {
        let (_dir, root) = temp_dir();
        fs::write(root.join(STORE_FILE), b"definitely not cbor").unwrap();

        let store = SignatureStore::open(&root, &[]).unwrap();
        assert!(store.hashes().is_empty());
        assert_eq!(store.task_sig(&Digest::of("uid")), None);
    }

    #[test]
    fn test_newer_config_discards_store() {
        let (_dir, root) = temp_dir();
        let uid = Digest::of("uid");

        let mut store = SignatureStore::open(&root, &[]).unwrap();
        store.set_task_sig(uid, Digest::of("sig"));
        store.save().unwrap();

        let config = root.join("config.json");
        fs::write(&config, "{}").unwrap();
        let later = SystemTime::now() + Duration::from_secs(60);
        fs::File::options()
            .write(true)
            .open(&config)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let store = SignatureStore::open(&root, &[config.clone()]).unwrap();
        assert_eq!(store.task_sig(&uid), None);

        let store = SignatureStore::open(&root, &[]).unwrap();
        assert_eq!(store.task_sig(&uid), Some(Digest::of("sig")));
    }
}
