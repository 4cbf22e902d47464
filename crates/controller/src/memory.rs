//! In-memory collaborators for tests and local runs: a versioned resource
//! store that also serves watches, a static pod index and a scripted builder.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use pkgbuild_core::{
    BuildClient, BuildFailure, BuildOutput, BuildRequest, BuildStatus, BuilderPod, BuilderPodIndex, Checksum,
    ContainerReadiness, Environment, Function, Package, PackageEvent, PodEvent, ResourceStore, StoreError,
    UploadResponse, WatchSource, LABEL_ENV_NAME, LABEL_ENV_NAMESPACE, LABEL_ENV_RESOURCE_VERSION,
};
use rustc_hash::FxHashSet;
use tokio::sync::mpsc;
use tracing::warn;

type Key = (String, String);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) }

#[derive(Default)]
struct Inner {
    next_rv: u64,
    packages: BTreeMap<Key, Package>,
    history: Vec<Package>,
    environments: BTreeMap<Key, Environment>,
    functions: BTreeMap<Key, Function>,
    pods: BTreeMap<Key, BuilderPod>,
    failing_functions: FxHashSet<String>,
    fail_function_list: bool,
    fail_environment_get: bool,
    failing_statuses: Vec<BuildStatus>,
    package_subs: Vec<(String, mpsc::Sender<PackageEvent>)>,
    pod_subs: Vec<(String, mpsc::Sender<PodEvent>)>,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn package_senders(&mut self, namespace: &str) -> Vec<mpsc::Sender<PackageEvent>> {
        self.package_subs.retain(|(_, tx)| !tx.is_closed());
        self.package_subs.iter().filter(|(ns, _)| ns == namespace).map(|(_, tx)| tx.clone()).collect()
    }

    fn pod_senders(&mut self, namespace: &str) -> Vec<mpsc::Sender<PodEvent>> {
        self.pod_subs.retain(|(_, tx)| !tx.is_closed());
        self.pod_subs.iter().filter(|(ns, _)| ns == namespace).map(|(_, tx)| tx.clone()).collect()
    }
}

/// Resource store with optimistic concurrency: every write must carry the
/// current resource version and gets a fresh one assigned.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn key(namespace: &str, name: &str) -> Key { (namespace.to_string(), name.to_string()) }

fn offer<T: Clone>(senders: Vec<mpsc::Sender<T>>, event: T) {
    for tx in senders {
        if tx.try_send(event.clone()).is_err() {
            warn!("memory store subscriber lagging; event dropped");
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Create or replace a package as a user would, ignoring its resource version.
    pub fn apply_package(&self, mut pkg: Package) -> Package {
        let mut inner = lock(&self.inner);
        pkg.meta.resource_version = inner.bump();
        let k = key(&pkg.meta.namespace, &pkg.meta.name);
        let old = inner.packages.insert(k, pkg.clone());
        inner.history.push(pkg.clone());
        let senders = inner.package_senders(&pkg.meta.namespace);
        drop(inner);
        let event = match old {
            Some(old) => PackageEvent::Updated { old, new: pkg.clone() },
            None => PackageEvent::Added(pkg.clone()),
        };
        offer(senders, event);
        pkg
    }

    pub fn insert_environment(&self, mut env: Environment) -> Environment {
        let mut inner = lock(&self.inner);
        env.meta.resource_version = inner.bump();
        inner.environments.insert(key(&env.meta.namespace, &env.meta.name), env.clone());
        env
    }

    pub fn insert_function(&self, mut function: Function) -> Function {
        let mut inner = lock(&self.inner);
        function.meta.resource_version = inner.bump();
        inner.functions.insert(key(&function.meta.namespace, &function.meta.name), function.clone());
        function
    }

    /// Add or replace a builder pod, notifying pod subscribers.
    pub fn set_pod(&self, pod: BuilderPod) {
        let mut inner = lock(&self.inner);
        inner.pods.insert(key(&pod.namespace, &pod.name), pod.clone());
        let senders = inner.pod_senders(&pod.namespace);
        drop(inner);
        offer(senders, PodEvent::Applied(pod));
    }

    pub fn package(&self, namespace: &str, name: &str) -> Option<Package> {
        lock(&self.inner).packages.get(&key(namespace, name)).cloned()
    }

    pub fn function(&self, namespace: &str, name: &str) -> Option<Function> {
        lock(&self.inner).functions.get(&key(namespace, name)).cloned()
    }

    /// Every stored revision of a package, oldest first.
    pub fn package_history(&self, namespace: &str, name: &str) -> Vec<Package> {
        lock(&self.inner)
            .history
            .iter()
            .filter(|p| p.meta.namespace == namespace && p.meta.name == name)
            .cloned()
            .collect()
    }

    pub fn fail_function_update(&self, name: &str) { lock(&self.inner).failing_functions.insert(name.to_string()); }

    pub fn fail_function_list(&self, fail: bool) { lock(&self.inner).fail_function_list = fail; }

    /// Make environment reads fail with a non-`NotFound` error.
    pub fn fail_environment_get(&self, fail: bool) { lock(&self.inner).fail_environment_get = fail; }

    /// Reject package writes that set `status`.
    pub fn fail_package_writes(&self, status: BuildStatus) { lock(&self.inner).failing_statuses.push(status); }

    fn write_package(&self, pkg: &Package) -> Result<(Package, Package, Vec<mpsc::Sender<PackageEvent>>), StoreError> {
        let mut inner = lock(&self.inner);
        let k = key(&pkg.meta.namespace, &pkg.meta.name);
        let current = inner.packages.get(&k).cloned().ok_or_else(|| StoreError::NotFound {
            kind: "Package",
            namespace: pkg.meta.namespace.clone(),
            name: pkg.meta.name.clone(),
        })?;
        if current.meta.resource_version != pkg.meta.resource_version {
            return Err(StoreError::Conflict {
                kind: "Package",
                namespace: pkg.meta.namespace.clone(),
                name: pkg.meta.name.clone(),
                message: format!("resource version {} is stale (current {})", pkg.meta.resource_version, current.meta.resource_version),
            });
        }
        if let Some(status) = pkg.build_status() {
            if inner.failing_statuses.contains(&status) {
                return Err(StoreError::Other(format!("injected failure writing {} status", status)));
            }
        }
        let mut next = pkg.clone();
        next.meta.resource_version = inner.bump();
        inner.packages.insert(k, next.clone());
        inner.history.push(next.clone());
        let senders = inner.package_senders(&next.meta.namespace);
        Ok((current, next, senders))
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn get_environment(&self, namespace: &str, name: &str) -> Result<Environment, StoreError> {
        let inner = lock(&self.inner);
        if inner.fail_environment_get {
            return Err(StoreError::Other("injected failure reading environment".into()));
        }
        inner.environments.get(&key(namespace, name)).cloned().ok_or_else(|| StoreError::NotFound {
            kind: "Environment",
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    async fn update_package(&self, pkg: &Package) -> Result<Package, StoreError> {
        let (old, next, senders) = self.write_package(pkg)?;
        let event = PackageEvent::Updated { old, new: next.clone() };
        for tx in senders {
            let _ = tx.send(event.clone()).await;
        }
        Ok(next)
    }

    async fn list_functions(&self, namespace: &str) -> Result<Vec<Function>, StoreError> {
        let inner = lock(&self.inner);
        if inner.fail_function_list {
            return Err(StoreError::Other("injected failure listing functions".into()));
        }
        Ok(inner.functions.values().filter(|f| f.meta.namespace == namespace).cloned().collect())
    }

    async fn update_function(&self, function: &Function) -> Result<Function, StoreError> {
        let mut inner = lock(&self.inner);
        if inner.failing_functions.contains(&function.meta.name) {
            return Err(StoreError::Other(format!("injected failure updating function {}", function.meta.name)));
        }
        let k = key(&function.meta.namespace, &function.meta.name);
        let current_rv = match inner.functions.get(&k) {
            Some(f) => f.meta.resource_version.clone(),
            None => {
                return Err(StoreError::NotFound {
                    kind: "Function",
                    namespace: function.meta.namespace.clone(),
                    name: function.meta.name.clone(),
                })
            }
        };
        if current_rv != function.meta.resource_version {
            return Err(StoreError::Conflict {
                kind: "Function",
                namespace: function.meta.namespace.clone(),
                name: function.meta.name.clone(),
                message: format!("resource version {} is stale (current {})", function.meta.resource_version, current_rv),
            });
        }
        let mut next = function.clone();
        next.meta.resource_version = inner.bump();
        inner.functions.insert(k, next.clone());
        Ok(next)
    }
}

#[async_trait::async_trait]
impl WatchSource for MemoryStore {
    async fn watch_packages(&self, namespace: &str, tx: mpsc::Sender<PackageEvent>) -> anyhow::Result<()> {
        let existing: Vec<Package> = {
            let mut inner = lock(&self.inner);
            inner.package_subs.push((namespace.to_string(), tx.clone()));
            inner.packages.values().filter(|p| p.meta.namespace == namespace).cloned().collect()
        };
        for pkg in existing {
            tx.send(PackageEvent::Added(pkg)).await?;
        }
        tx.closed().await;
        Ok(())
    }

    async fn watch_builder_pods(&self, namespace: &str, tx: mpsc::Sender<PodEvent>) -> anyhow::Result<()> {
        let pods: Vec<BuilderPod> = {
            let mut inner = lock(&self.inner);
            inner.pod_subs.push((namespace.to_string(), tx.clone()));
            inner.pods.values().filter(|p| p.namespace == namespace).cloned().collect()
        };
        tx.send(PodEvent::Restarted { namespace: namespace.to_string(), pods }).await?;
        tx.closed().await;
        Ok(())
    }
}

/// Builder pod labelled for `env` in `namespace` with a single container.
pub fn builder_pod(env: &Environment, namespace: &str, name: &str, ready: bool) -> BuilderPod {
    BuilderPod {
        namespace: namespace.to_string(),
        name: name.to_string(),
        labels: [
            (LABEL_ENV_NAME, env.meta.name.as_str()),
            (LABEL_ENV_NAMESPACE, namespace),
            (LABEL_ENV_RESOURCE_VERSION, env.meta.resource_version.as_str()),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect(),
        containers: std::iter::once(ContainerReadiness { name: "builder".into(), ready }).collect(),
    }
}

/// Fixed pod index; optionally swaps in a staged pod list after a number of reads.
#[derive(Default)]
pub struct StaticPods {
    pods: Mutex<Vec<BuilderPod>>,
    staged: Mutex<Option<(usize, Vec<BuilderPod>)>>,
    lists: AtomicUsize,
}

impl StaticPods {
    pub fn new(pods: Vec<BuilderPod>) -> Self { Self { pods: Mutex::new(pods), ..Default::default() } }

    pub fn set(&self, pods: Vec<BuilderPod>) { *lock(&self.pods) = pods; }

    /// Serve `pods` from the `after`-th read onwards (1-based).
    pub fn reveal_after(&self, after: usize, pods: Vec<BuilderPod>) { *lock(&self.staged) = Some((after, pods)); }

    pub fn list_calls(&self) -> usize { self.lists.load(Ordering::SeqCst) }
}

impl BuilderPodIndex for StaticPods {
    fn list(&self, namespace: &str) -> Vec<BuilderPod> {
        let n = self.lists.fetch_add(1, Ordering::SeqCst) + 1;
        let mut staged = lock(&self.staged);
        if staged.as_ref().map_or(false, |(after, _)| n >= *after) {
            if let Some((_, pods)) = staged.take() {
                *lock(&self.pods) = pods;
            }
        }
        drop(staged);
        lock(&self.pods).iter().filter(|p| p.namespace == namespace).cloned().collect()
    }
}

/// Builder that records each request and answers with a fixed result.
pub struct ScriptedBuildClient {
    result: Result<BuildOutput, BuildFailure>,
    delay: Duration,
    calls: Mutex<Vec<(String, BuildRequest)>>,
}

impl ScriptedBuildClient {
    pub fn succeeding(download_url: &str, build_log: &str) -> Self {
        Self::with_result(Ok(BuildOutput {
            upload: UploadResponse {
                archive_download_url: download_url.to_string(),
                checksum: Checksum { kind: "sha256".into(), sum: "c0ffee".into() },
            },
            build_log: build_log.to_string(),
        }))
    }

    pub fn failing(message: &str, build_log: &str) -> Self {
        Self::with_result(Err(BuildFailure { message: message.to_string(), build_log: build_log.to_string() }))
    }

    fn with_result(result: Result<BuildOutput, BuildFailure>) -> Self {
        Self { result, delay: Duration::ZERO, calls: Mutex::new(Vec::new()) }
    }

    /// Hold every build for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize { lock(&self.calls).len() }

    /// `(builder namespace, request)` pairs in call order.
    pub fn calls(&self) -> Vec<(String, BuildRequest)> { lock(&self.calls).clone() }
}

#[async_trait::async_trait]
impl BuildClient for ScriptedBuildClient {
    async fn build(&self, builder_namespace: &str, req: &BuildRequest) -> Result<BuildOutput, BuildFailure> {
        lock(&self.calls).push((builder_namespace.to_string(), req.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.result.clone()
    }
}
