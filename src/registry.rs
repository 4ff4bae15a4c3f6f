use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::io::BufRead;
use std::path::Path;

/// Insertion-ordered set of strings that only ever grows.
///
/// Reads take the shared lock; inserts hold the exclusive lock just long
/// enough to check and append.
#[derive(Default)]
struct UniqueList {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl UniqueList {
    fn insert(&self, value: &str) -> bool {
        if self.inner.read().seen.contains(value) {
            return false;
        }
        let mut inner = self.inner.write();
        // Another writer may have won between the two locks.
        if !inner.seen.insert(value.to_string()) {
            return false;
        }
        inner.order.push(value.to_string());
        true
    }

    fn contains(&self, value: &str) -> bool {
        self.inner.read().seen.contains(value)
    }

    fn snapshot(&self) -> Vec<String> {
        self.inner.read().order.clone()
    }

    fn len(&self) -> usize {
        self.inner.read().order.len()
    }
}

/// Candidate decryption keys, shared by every flow worker.
#[derive(Default)]
pub struct KeyRegistry {
    keys: UniqueList,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key unless an identical one is already present.
    /// Returns `true` if the key was new.
    pub fn add_key(&self, key: &str) -> bool {
        self.keys.insert(key)
    }

    /// Snapshot of all keys in the order they were added.
    pub fn keys(&self) -> Vec<String> {
        self.keys.snapshot()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pre-seed from a newline-delimited key list.
    /// Blank lines and `#` comments are skipped. Returns the number of new keys.
    pub fn load_from<R: BufRead>(&self, reader: R) -> std::io::Result<usize> {
        let mut added = 0;
        for line in reader.lines() {
            let line = line?;
            let key = line.trim();
            if key.is_empty() || key.starts_with('#') {
                continue;
            }
            if self.add_key(key) {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn load_file(&self, path: &Path) -> Result<usize> {
        let file = std::fs::File::open(path)
            .context(format!("Failed to open key file: {}", path.display()))?;
        self.load_from(std::io::BufReader::new(file))
            .context(format!("Failed to read key file: {}", path.display()))
    }
}

/// Serials of devices that have already been handed to the geolocator.
#[derive(Default)]
pub struct LocatedDevices {
    serials: UniqueList,
}

impl LocatedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a serial as located. Returns `false` if it already was.
    pub fn insert(&self, serial: &str) -> bool {
        self.serials.insert(serial)
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.serials.contains(serial)
    }

    pub fn len(&self) -> usize {
        self.serials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
