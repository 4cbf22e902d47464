//! Package event dispatch: one loop consuming typed events, spawning guarded
//! build runs and initial-status writes into a tracked task set.

use std::sync::Arc;

use pkgbuild_core::{BuildStatus, Package, PackageEvent};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::guard::BuildGuard;
use crate::initial::set_initial_build_status;
use crate::orchestrator::{BuildOutcome, Orchestrator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ResolveInitial,
    Build,
    Ignore,
    /// A build for the same `namespace:name:version` is already in flight.
    Skipped,
}

fn action_for(pkg: &Package) -> Action {
    match pkg.build_status() {
        None => Action::ResolveInitial,
        Some(BuildStatus::Pending) => Action::Build,
        Some(_) => Action::Ignore,
    }
}

/// Map one package notification to the single action it calls for.
pub fn classify(event: &PackageEvent) -> Action {
    match event {
        PackageEvent::Added(pkg) => action_for(pkg),
        PackageEvent::Updated { old, new } => {
            // re-delivery of an already observed state
            if old.meta.resource_version == new.meta.resource_version && new.build_status() != Some(BuildStatus::Pending) {
                return Action::Ignore;
            }
            action_for(new)
        }
        PackageEvent::Deleted(_) => Action::Ignore,
    }
}

fn event_package(event: PackageEvent) -> Package {
    match event {
        PackageEvent::Added(p) | PackageEvent::Deleted(p) => p,
        PackageEvent::Updated { new, .. } => new,
    }
}

pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    guard: Arc<BuildGuard>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl Dispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>, guard: Arc<BuildGuard>, cancel: CancellationToken) -> Self {
        Self { orchestrator, guard, cancel, tasks: JoinSet::new() }
    }

    pub fn guard(&self) -> &Arc<BuildGuard> { &self.guard }

    /// Tasks spawned and not yet reaped.
    pub fn in_flight(&self) -> usize { self.tasks.len() }

    /// Classify `event` and spawn whatever it calls for. Admission to the build
    /// guard happens here, before the run is spawned.
    pub fn handle(&mut self, event: PackageEvent) -> Action {
        let action = classify(&event);
        match action {
            Action::Ignore | Action::Skipped => {}
            Action::ResolveInitial => {
                let pkg = event_package(event);
                let orchestrator = Arc::clone(&self.orchestrator);
                self.tasks.spawn(async move {
                    if let Err(e) = set_initial_build_status(orchestrator.store().as_ref(), &pkg).await {
                        error!(package = %pkg.meta.name, namespace = %pkg.meta.namespace, error = %e, "error filling package status");
                    }
                });
            }
            Action::Build => {
                let pkg = event_package(event);
                let lease = match self.guard.admit(pkg.dedup_key(), pkg.clone()) {
                    Ok(lease) => lease,
                    Err(e) => {
                        metrics::counter!("build_duplicate_skipped_total", 1u64);
                        info!(key = %e.key, "package build already in flight; skipping");
                        return Action::Skipped;
                    }
                };
                let orchestrator = Arc::clone(&self.orchestrator);
                let cancel = self.cancel.clone();
                self.tasks.spawn(async move {
                    let _lease = lease;
                    match orchestrator.build(&pkg, &cancel).await {
                        BuildOutcome::Succeeded(_) => {}
                        BuildOutcome::Failed { log } => debug!(package = %pkg.meta.name, log = %log, "build failed"),
                        BuildOutcome::Aborted { reason } => debug!(package = %pkg.meta.name, reason = %reason, "build aborted"),
                    }
                });
            }
        }
        action
    }

    fn reap(res: Result<(), tokio::task::JoinError>) {
        if let Err(e) = res {
            if e.is_panic() {
                error!(error = %e, "package task panicked");
            }
        }
    }

    /// Consume events until the channel closes or cancellation fires, then join in-flight tasks.
    pub async fn run(mut self, mut rx: mpsc::Receiver<PackageEvent>) {
        info!("package dispatcher started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("shutdown requested; dispatcher stops accepting events");
                    break;
                }
                maybe = rx.recv() => match maybe {
                    Some(event) => { self.handle(event); }
                    None => {
                        debug!("package event channel closed");
                        break;
                    }
                },
                Some(res) = self.tasks.join_next(), if !self.tasks.is_empty() => Self::reap(res),
            }
        }
        drop(rx);
        self.drain().await;
        info!("package dispatcher stopped");
    }

    /// Wait for every spawned task to finish.
    pub async fn drain(&mut self) {
        if !self.tasks.is_empty() {
            info!(in_flight = self.tasks.len(), "waiting for in-flight package tasks");
        }
        while let Some(res) = self.tasks.join_next().await {
            Self::reap(res);
        }
    }
}
