//! Informer-style classification of watch output. The watcher only reports
//! "applied" objects; remembering the last seen copy per key turns that into
//! added/updated pairs and lets a relist surface deletions it missed.

use pkgbuild_core::{Package, PackageEvent};
use rustc_hash::{FxHashMap, FxHashSet};

type Key = (String, String);

fn key(pkg: &Package) -> Key { (pkg.meta.namespace.clone(), pkg.meta.name.clone()) }

#[derive(Default)]
pub struct PackageTracker {
    seen: FxHashMap<Key, Package>,
}

impl PackageTracker {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.seen.len() }

    pub fn is_empty(&self) -> bool { self.seen.is_empty() }

    pub fn applied(&mut self, pkg: Package) -> PackageEvent {
        match self.seen.insert(key(&pkg), pkg.clone()) {
            Some(old) => PackageEvent::Updated { old, new: pkg },
            None => PackageEvent::Added(pkg),
        }
    }

    pub fn deleted(&mut self, pkg: Package) -> PackageEvent {
        let last = self.seen.remove(&key(&pkg)).unwrap_or(pkg);
        PackageEvent::Deleted(last)
    }

    /// Full relist: every listed package is re-delivered (as an update when it
    /// was known before, even at the same version); known packages missing from
    /// the list are reported deleted.
    pub fn restarted(&mut self, pkgs: Vec<Package>) -> Vec<PackageEvent> {
        let listed: FxHashSet<Key> = pkgs.iter().map(key).collect();
        let mut gone: Vec<Key> = self.seen.keys().filter(|k| !listed.contains(*k)).cloned().collect();
        gone.sort();
        let mut out = Vec::with_capacity(pkgs.len() + gone.len());
        for k in gone {
            if let Some(old) = self.seen.remove(&k) {
                out.push(PackageEvent::Deleted(old));
            }
        }
        for pkg in pkgs {
            out.push(self.applied(pkg));
        }
        out
    }
}
