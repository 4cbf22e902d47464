//! pkgbuild kubehub: `fission.io` resources over the API server, plus the
//! list+watch subscriptions that feed typed events into the controller.

#![forbid(unsafe_code)]

pub mod crd;
pub mod tracker;

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client,
};
use pkgbuild_core::{
    Environment, Function, Package, PackageEvent, PodEvent, ResourceStore, StoreError, WatchSource, LABEL_ENV_NAME,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crd::{EnvironmentResource, FunctionResource, PackageResource};
pub use crate::tracker::PackageTracker;

fn store_error(err: kube::Error, kind: &'static str, namespace: &str, name: &str) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => {
            StoreError::NotFound { kind, namespace: namespace.to_string(), name: name.to_string() }
        }
        kube::Error::Api(ae) if ae.code == 409 => {
            StoreError::Conflict { kind, namespace: namespace.to_string(), name: name.to_string(), message: ae.message }
        }
        other => StoreError::Other(other.to_string()),
    }
}

/// Merge patch for a package write. `metadata.resourceVersion` makes the API
/// server reject the patch when the stored copy has moved on.
pub fn package_patch(pkg: &Package) -> Result<Value, serde_json::Error> {
    let mut status = serde_json::to_value(&pkg.status)?;
    if pkg.status.upload.is_none() {
        if let Some(obj) = status.as_object_mut() {
            obj.insert("upload".into(), Value::Null);
        }
    }
    Ok(json!({
        "metadata": { "resourceVersion": pkg.meta.resource_version },
        "spec": { "deployment": serde_json::to_value(&pkg.spec.deployment)? },
        "status": status,
    }))
}

pub fn function_patch(function: &Function) -> Value {
    json!({
        "metadata": { "resourceVersion": function.meta.resource_version },
        "spec": { "package": { "packageref": {
            "namespace": function.package_ref.namespace,
            "name": function.package_ref.name,
            "resourceversion": function.package_ref.resource_version,
        } } },
    })
}

/// `ResourceStore` backed by the cluster API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl ResourceStore for KubeStore {
    async fn get_environment(&self, namespace: &str, name: &str) -> Result<Environment, StoreError> {
        let api: Api<EnvironmentResource> = Api::namespaced(self.client.clone(), namespace);
        let obj = api.get(name).await.map_err(|e| store_error(e, "environment", namespace, name))?;
        Ok(crd::environment_from(&obj))
    }

    async fn update_package(&self, pkg: &Package) -> Result<Package, StoreError> {
        let (ns, name) = (pkg.meta.namespace.as_str(), pkg.meta.name.as_str());
        let patch = package_patch(pkg).map_err(|e| StoreError::Other(e.to_string()))?;
        let api: Api<PackageResource> = Api::namespaced(self.client.clone(), ns);
        let obj = api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| store_error(e, "package", ns, name))?;
        debug!(package = %name, namespace = %ns, resource_version = ?obj.metadata.resource_version, "package updated");
        Ok(crd::package_from(&obj))
    }

    async fn list_functions(&self, namespace: &str) -> Result<Vec<Function>, StoreError> {
        let api: Api<FunctionResource> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await.map_err(|e| store_error(e, "function", namespace, ""))?;
        Ok(list.items.iter().map(crd::function_from).collect())
    }

    async fn update_function(&self, function: &Function) -> Result<Function, StoreError> {
        let (ns, name) = (function.meta.namespace.as_str(), function.meta.name.as_str());
        let api: Api<FunctionResource> = Api::namespaced(self.client.clone(), ns);
        let obj = api
            .patch(name, &PatchParams::default(), &Patch::Merge(&function_patch(function)))
            .await
            .map_err(|e| store_error(e, "function", ns, name))?;
        Ok(crd::function_from(&obj))
    }
}

/// `WatchSource` backed by `kube::runtime::watcher` streams with the default
/// reconnect backoff.
#[derive(Clone)]
pub struct KubeWatch {
    client: Client,
}

impl KubeWatch {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl WatchSource for KubeWatch {
    async fn watch_packages(&self, namespace: &str, tx: mpsc::Sender<PackageEvent>) -> Result<()> {
        let api: Api<PackageResource> = Api::namespaced(self.client.clone(), namespace);
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);
        let mut tracker = PackageTracker::new();
        info!(namespace = %namespace, "package watcher started");
        while let Some(ev) = stream.next().await {
            let events = match ev {
                Ok(Event::Applied(o)) => vec![tracker.applied(crd::package_from(&o))],
                Ok(Event::Deleted(o)) => vec![tracker.deleted(crd::package_from(&o))],
                Ok(Event::Restarted(list)) => {
                    debug!(namespace = %namespace, count = list.len(), "package watch restart");
                    metrics::counter!("watch_restarts_total", 1u64, "kind" => "package");
                    tracker.restarted(list.iter().map(crd::package_from).collect())
                }
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "package watch error; retrying");
                    continue;
                }
            };
            for event in events {
                if tx.send(event).await.is_err() {
                    debug!(namespace = %namespace, "package event receiver gone");
                    return Ok(());
                }
            }
        }
        warn!(namespace = %namespace, "package watcher stream ended");
        Ok(())
    }

    async fn watch_builder_pods(&self, namespace: &str, tx: mpsc::Sender<PodEvent>) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let cfg = watcher::Config::default().labels(LABEL_ENV_NAME);
        let stream = watcher::watcher(api, cfg).default_backoff();
        futures::pin_mut!(stream);
        info!(namespace = %namespace, "builder pod watcher started");
        while let Some(ev) = stream.next().await {
            let event = match ev {
                Ok(Event::Applied(p)) => PodEvent::Applied(crd::builder_pod_from(&p)),
                Ok(Event::Deleted(p)) => PodEvent::Deleted(crd::builder_pod_from(&p)),
                Ok(Event::Restarted(list)) => {
                    debug!(namespace = %namespace, count = list.len(), "builder pod watch restart");
                    metrics::counter!("watch_restarts_total", 1u64, "kind" => "pod");
                    PodEvent::Restarted { namespace: namespace.to_string(), pods: list.iter().map(crd::builder_pod_from).collect() }
                }
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "builder pod watch error; retrying");
                    continue;
                }
            };
            if tx.send(event).await.is_err() {
                debug!(namespace = %namespace, "pod event receiver gone");
                return Ok(());
            }
        }
        warn!(namespace = %namespace, "builder pod watcher stream ended");
        Ok(())
    }
}
