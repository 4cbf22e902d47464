//! Build state machine for one pending package version.
//!
//! A run goes `Running -> (environment) -> (ready builder) -> (remote build)
//! -> (dependent functions) -> Succeeded`. Any failed step ends the run with a
//! single `Failed` write carrying the reason in the build log. Only the
//! readiness poll retries.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use pkgbuild_core::{
    BuildClient, BuildRequest, BuildStatus, BuilderPod, BuilderPodIndex, Environment, Package, ResourceStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::Backoff;
use crate::config::ControllerConfig;
use crate::reconcile::reconcile_dependents;
use crate::status::{append_log, update_package};

pub const BUILDER_TIMEOUT_LOG: &str = "build timeout due to environment builder not ready";
pub const CANCELLED_LOG: &str = "build cancelled: controller shutting down";

#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// Final stored package.
    Succeeded(Package),
    /// Terminal failure; `log` is the build log the failure was recorded with.
    Failed { log: String },
    /// The run never got past marking the package running.
    Aborted { reason: String },
}

enum WaitError {
    Timeout,
    Cancelled,
}

pub struct Orchestrator {
    store: Arc<dyn ResourceStore>,
    pods: Arc<dyn BuilderPodIndex>,
    client: Arc<dyn BuildClient>,
    config: Arc<ControllerConfig>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        pods: Arc<dyn BuilderPodIndex>,
        client: Arc<dyn BuildClient>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self { store, pods, client, config }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> { &self.store }

    /// Drive `srcpkg` (status `Pending`) to a terminal status.
    pub async fn build(&self, srcpkg: &Package, cancel: &CancellationToken) -> BuildOutcome {
        let t0 = Instant::now();
        counter!("build_runs_total", 1u64);
        info!(package = %srcpkg.meta.name, namespace = %srcpkg.meta.namespace, resource_version = %srcpkg.meta.resource_version, "starting build for package");

        let pkg = match update_package(self.store.as_ref(), srcpkg, BuildStatus::Running, String::new(), None).await {
            Ok(p) => p,
            Err(e) => {
                // someone else already moved this version on
                error!(package = %srcpkg.meta.name, resource_version = %srcpkg.meta.resource_version, error = %e, "error setting package running state");
                counter!("build_aborted_total", 1u64);
                return BuildOutcome::Aborted { reason: e.to_string() };
            }
        };

        let outcome = self.run(&pkg, cancel).await;
        histogram!("build_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        outcome
    }

    async fn run(&self, pkg: &Package, cancel: &CancellationToken) -> BuildOutcome {
        let env_ref = &pkg.spec.environment;
        let env = match self.store.get_environment(&env_ref.namespace, &env_ref.name).await {
            Ok(env) => env,
            Err(e) if e.is_not_found() => {
                error!(package = %pkg.meta.name, environment = %env_ref.name, "environment does not exist");
                return self.fail(pkg, append_log(String::new(), "environment does not exist", &env_ref.name)).await;
            }
            Err(e) => {
                error!(package = %pkg.meta.name, environment = %env_ref.name, error = %e, "error getting environment");
                return self.fail(pkg, append_log(String::new(), "error getting environment", e)).await;
            }
        };

        let builder_ns = self.config.builder_namespace_for(&env.meta.namespace);
        let pod = match self.wait_for_builder(pkg, &env, &builder_ns, cancel).await {
            Ok(pod) => pod,
            Err(WaitError::Timeout) => {
                error!(package = %pkg.meta.name, namespace = %pkg.meta.namespace, "max retries exceeded in building source package, timeout due to environment builder not ready");
                return self.fail(pkg, BUILDER_TIMEOUT_LOG.to_string()).await;
            }
            Err(WaitError::Cancelled) => {
                warn!(package = %pkg.meta.name, "build cancelled while waiting for builder");
                return self.fail(pkg, CANCELLED_LOG.to_string()).await;
            }
        };
        info!(package = %pkg.meta.name, builder = %pod.name, "builder pod ready; dispatching build");

        let output = match self.client.build(&builder_ns, &BuildRequest::new(pkg, &env)).await {
            Ok(out) => out,
            Err(f) => {
                error!(package = %pkg.meta.name, error = %f, "error building package");
                return self.fail(pkg, append_log(f.build_log, "error building package", &f.message)).await;
            }
        };

        info!(package = %pkg.meta.name, "starting package info update");
        let mut log = output.build_log;
        if let Err(e) = reconcile_dependents(self.store.as_ref(), pkg).await {
            log.push_str(&format!("{}\n", e));
            return self.fail(pkg, log).await;
        }

        match update_package(self.store.as_ref(), pkg, BuildStatus::Succeeded, log.clone(), Some(output.upload)).await {
            Ok(done) => {
                counter!("build_succeeded_total", 1u64);
                info!(package = %pkg.meta.name, resource_version = %done.meta.resource_version, "completed package build request");
                BuildOutcome::Succeeded(done)
            }
            Err(e) => {
                error!(package = %pkg.meta.name, error = %e, "error updating package info");
                self.fail(pkg, append_log(log, "error updating package", e)).await
            }
        }
    }

    /// Poll the pod index until a builder labelled for `env` reports every container ready.
    async fn wait_for_builder(
        &self,
        pkg: &Package,
        env: &Environment,
        builder_ns: &str,
        cancel: &CancellationToken,
    ) -> Result<BuilderPod, WaitError> {
        let t0 = Instant::now();
        let mut backoff = Backoff::new(&self.config.backoff);
        loop {
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }
            let pods = self.pods.list(builder_ns);
            let mut matching = pods.into_iter().filter(|p| p.serves(env, builder_ns)).peekable();
            if matching.peek().is_none() {
                info!(package = %pkg.meta.name, environment = %env.meta.name, attempt = backoff.attempts() + 1, "builder pod does not exist for environment, will retry again later");
            } else if let Some(pod) = matching.find(BuilderPod::is_ready) {
                histogram!("builder_ready_wait_ms", t0.elapsed().as_secs_f64() * 1000.0);
                return Ok(pod);
            } else {
                info!(package = %pkg.meta.name, environment = %env.meta.name, attempt = backoff.attempts() + 1, "builder pod is not ready for environment, will retry again later");
            }

            let Some(delay) = backoff.next() else { return Err(WaitError::Timeout) };
            tokio::select! {
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn fail(&self, pkg: &Package, log: String) -> BuildOutcome {
        counter!("build_failed_total", 1u64);
        if let Err(e) = update_package(self.store.as_ref(), pkg, BuildStatus::Failed, log.clone(), None).await {
            error!(package = %pkg.meta.name, resource_version = %pkg.meta.resource_version, error = %e, "error updating package");
        }
        BuildOutcome::Failed { log }
    }
}
