//! At-most-one-in-flight-build admission control keyed by `namespace:name:version`.

use std::sync::{Arc, Mutex, MutexGuard};

use pkgbuild_core::Package;
use rustc_hash::FxHashMap;
use tracing::debug;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("build already in flight for {key}")]
pub struct AdmitError {
    pub key: String,
}

/// In-memory map of admitted builds with the package snapshot taken at admission.
#[derive(Debug, Default)]
pub struct BuildGuard {
    entries: Mutex<FxHashMap<String, Package>>,
}

impl BuildGuard {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    fn entries(&self) -> MutexGuard<'_, FxHashMap<String, Package>> {
        // Entries stay consistent across a panicking holder: every critical section is a single map call.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit `key` unless it is already present. The returned lease releases the key when dropped.
    pub fn admit(self: &Arc<Self>, key: String, snapshot: Package) -> Result<GuardLease, AdmitError> {
        let mut entries = self.entries();
        if entries.contains_key(&key) {
            return Err(AdmitError { key });
        }
        entries.insert(key.clone(), snapshot);
        Ok(GuardLease { guard: Arc::clone(self), key })
    }

    /// Remove `key`; absence is not an error.
    pub fn release(&self, key: &str) -> Option<Package> { self.entries().remove(key) }

    pub fn contains(&self, key: &str) -> bool { self.entries().contains_key(key) }

    pub fn snapshot(&self, key: &str) -> Option<Package> { self.entries().get(key).cloned() }

    pub fn len(&self) -> usize { self.entries().len() }

    pub fn is_empty(&self) -> bool { self.entries().is_empty() }
}

/// Scoped admission: dropping it releases the key on every exit path of a run.
#[derive(Debug)]
pub struct GuardLease {
    guard: Arc<BuildGuard>,
    key: String,
}

impl GuardLease {
    pub fn key(&self) -> &str { &self.key }
}

impl Drop for GuardLease {
    fn drop(&mut self) {
        if self.guard.release(&self.key).is_none() {
            debug!(key = %self.key, "guard entry already released");
        }
    }
}
