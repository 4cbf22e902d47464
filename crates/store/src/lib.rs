//! pkgbuild store: coalescing ingest of builder pod events into immutable
//! per-namespace snapshots readers can list without locking.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use pkgbuild_core::{BuilderPod, BuilderPodIndex, PodEvent};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// `(namespace, name)`
pub type PodKey = (String, String);

#[derive(Debug, Clone)]
pub enum PodDelta {
    Applied(BuilderPod),
    Deleted,
}

fn key_of(pod: &BuilderPod) -> PodKey { (pod.namespace.clone(), pod.name.clone()) }

/// Coalescing queue keyed by pod with FIFO order. Never drops a delta; once
/// `cap` distinct pods are queued the owner is expected to flush.
pub struct Coalescer {
    map: FxHashMap<PodKey, PodDelta>,
    order: VecDeque<PodKey>,
    cap: usize,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1) }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn is_full(&self) -> bool { self.order.len() >= self.cap }

    /// Later deltas for the same pod replace earlier ones but keep the original queue slot.
    pub fn push(&mut self, key: PodKey, delta: PodDelta) {
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.map.insert(key, delta);
    }

    pub fn drain_ready(&mut self) -> Vec<(PodKey, PodDelta)> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                out.push((key, d));
            }
        }
        out
    }
}

/// Immutable view of all known builder pods, grouped by namespace and sorted by name.
#[derive(Debug, Clone, Default)]
pub struct PodSnapshot {
    pub epoch: u64,
    by_namespace: FxHashMap<String, Vec<BuilderPod>>,
}

impl PodSnapshot {
    pub fn pods(&self, namespace: &str) -> &[BuilderPod] {
        self.by_namespace.get(namespace).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize { self.by_namespace.values().map(Vec::len).sum() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Mutable pod state owned by the ingest loop.
#[derive(Default)]
pub struct PodWorld {
    epoch: u64,
    namespaces: FxHashMap<String, FxHashMap<String, BuilderPod>>,
}

impl PodWorld {
    pub fn new() -> Self { Self::default() }

    pub fn apply(&mut self, batch: Vec<(PodKey, PodDelta)>) {
        for ((namespace, name), delta) in batch {
            match delta {
                PodDelta::Applied(pod) => {
                    self.namespaces.entry(namespace).or_default().insert(name, pod);
                }
                PodDelta::Deleted => {
                    if let Some(pods) = self.namespaces.get_mut(&namespace) {
                        pods.remove(&name);
                        if pods.is_empty() {
                            self.namespaces.remove(&namespace);
                        }
                    }
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    /// Replace everything known for `namespace` after a watch relist.
    pub fn reset(&mut self, namespace: &str, pods: Vec<BuilderPod>) {
        let fresh: FxHashMap<String, BuilderPod> = pods
            .into_iter()
            .filter(|p| p.namespace == namespace)
            .map(|p| (p.name.clone(), p))
            .collect();
        if fresh.is_empty() {
            self.namespaces.remove(namespace);
        } else {
            self.namespaces.insert(namespace.to_string(), fresh);
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<PodSnapshot> {
        let by_namespace = self
            .namespaces
            .iter()
            .map(|(ns, pods)| {
                let mut v: Vec<BuilderPod> = pods.values().cloned().collect();
                v.sort_by(|a, b| a.name.cmp(&b.name));
                (ns.clone(), v)
            })
            .collect();
        Arc::new(PodSnapshot { epoch: self.epoch, by_namespace })
    }
}

/// Handle for readers to access the current snapshot and subscribe to swaps.
#[derive(Clone)]
pub struct PodStoreHandle {
    snap: Arc<ArcSwap<PodSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl PodStoreHandle {
    pub fn current(&self) -> Arc<PodSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

impl BuilderPodIndex for PodStoreHandle {
    fn list(&self, namespace: &str) -> Vec<BuilderPod> { self.snap.load().pods(namespace).to_vec() }
}

fn publish(world: &PodWorld, snap: &ArcSwap<PodSnapshot>, epoch_tx: &watch::Sender<u64>) {
    let next = world.freeze();
    let epoch = next.epoch;
    metrics::gauge!("pod_store_pods", next.len() as f64);
    snap.store(next);
    let _ = epoch_tx.send(epoch);
}

fn flush_if_full(coalescer: &mut Coalescer, world: &mut PodWorld, snap: &ArcSwap<PodSnapshot>, epoch_tx: &watch::Sender<u64>) {
    if coalescer.is_full() {
        metrics::counter!("pod_store_early_flush_total", 1u64);
        debug!(queued = coalescer.len(), "pod coalescer full; applying batch before the tick");
        world.apply(coalescer.drain_ready());
        publish(world, snap, epoch_tx);
    }
}

/// Spawn an ingest loop consuming pod events and swapping snapshots.
/// Returns a sender for events and a handle for reads.
pub fn spawn_ingest(cap: usize) -> (mpsc::Sender<PodEvent>, PodStoreHandle) {
    let (tx, mut rx) = mpsc::channel::<PodEvent>(cap.max(1));
    let snap = Arc::new(ArcSwap::from_pointee(PodSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let snap_clone = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut world = PodWorld::new();
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(8));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(PodEvent::Applied(pod)) => {
                            coalescer.push(key_of(&pod), PodDelta::Applied(pod));
                            flush_if_full(&mut coalescer, &mut world, &snap_clone, &epoch_tx);
                        }
                        Some(PodEvent::Deleted(pod)) => {
                            coalescer.push(key_of(&pod), PodDelta::Deleted);
                            flush_if_full(&mut coalescer, &mut world, &snap_clone, &epoch_tx);
                        }
                        Some(PodEvent::Restarted { namespace, pods }) => {
                            debug!(namespace = %namespace, count = pods.len(), "pod watch restart");
                            // Pending deltas predate the relist; apply them first so the reset wins.
                            let batch = coalescer.drain_ready();
                            if !batch.is_empty() {
                                world.apply(batch);
                            }
                            world.reset(&namespace, pods);
                            publish(&world, &snap_clone, &epoch_tx);
                        }
                        None => {
                            debug!("pod event channel closed; draining and exiting ingest loop");
                            let batch = coalescer.drain_ready();
                            if !batch.is_empty() {
                                world.apply(batch);
                                publish(&world, &snap_clone, &epoch_tx);
                            }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let batch = coalescer.drain_ready();
                    if !batch.is_empty() {
                        world.apply(batch);
                        publish(&world, &snap_clone, &epoch_tx);
                    }
                }
            }
        }
        info!("pod ingest loop stopped");
    });

    (tx, PodStoreHandle { snap, epoch_rx })
}
