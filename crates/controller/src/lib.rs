//! pkgbuild controller: watches packages, builds pending ones on a ready
//! builder pod and moves dependent functions onto the new package version.

#![forbid(unsafe_code)]

use std::sync::Arc;

use pkgbuild_core::{BuildClient, PackageEvent, ResourceStore, WatchSource};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod guard;
pub mod initial;
pub mod memory;
pub mod orchestrator;
pub mod reconcile;
pub mod status;

pub use backoff::Backoff;
pub use config::{BackoffConfig, ControllerConfig};
pub use dispatch::{classify, Action, Dispatcher};
pub use guard::{AdmitError, BuildGuard, GuardLease};
pub use initial::{initial_status, set_initial_build_status};
pub use orchestrator::{BuildOutcome, Orchestrator};
pub use reconcile::{reconcile_dependents, ReconcileError};

/// Process-lifetime wiring: subscriptions, pod index, dispatcher.
pub struct Controller {
    config: Arc<ControllerConfig>,
    store: Arc<dyn ResourceStore>,
    client: Arc<dyn BuildClient>,
    watch: Arc<dyn WatchSource>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn ResourceStore>,
        client: Arc<dyn BuildClient>,
        watch: Arc<dyn WatchSource>,
    ) -> Self {
        Self { config: Arc::new(config), store, client, watch }
    }

    /// Run until `cancel` fires. On the way out, subscriptions are stopped and
    /// every in-flight package task is awaited.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let cap = self.config.queue_cap.max(1);
        let (pod_tx, pods) = pkgbuild_store::spawn_ingest(cap);
        let (pkg_tx, pkg_rx) = mpsc::channel::<PackageEvent>(cap);
        let mut watches: JoinSet<()> = JoinSet::new();

        for ns in self.config.builder_namespaces() {
            let watch = Arc::clone(&self.watch);
            let tx = pod_tx.clone();
            watches.spawn(async move {
                info!(namespace = %ns, "builder pod subscription starting");
                if let Err(e) = watch.watch_builder_pods(&ns, tx).await {
                    error!(namespace = %ns, error = ?e, "builder pod subscription failed");
                }
            });
        }
        for ns in self.config.namespaces.iter().cloned() {
            let watch = Arc::clone(&self.watch);
            let tx = pkg_tx.clone();
            watches.spawn(async move {
                info!(namespace = %ns, "package subscription starting");
                if let Err(e) = watch.watch_packages(&ns, tx).await {
                    error!(namespace = %ns, error = ?e, "package subscription failed");
                }
            });
        }
        // subscriptions hold the only senders from here on
        drop(pod_tx);
        drop(pkg_tx);

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&self.store),
            Arc::new(pods),
            Arc::clone(&self.client),
            Arc::clone(&self.config),
        ));
        let dispatcher = Dispatcher::new(orchestrator, BuildGuard::new(), cancel.clone());
        dispatcher.run(pkg_rx).await;

        if !cancel.is_cancelled() {
            warn!("all package subscriptions ended before shutdown");
        }
        watches.abort_all();
        while watches.join_next().await.is_some() {}
        info!("controller stopped");
        Ok(())
    }
}
