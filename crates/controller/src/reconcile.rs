//! Point functions that reference a freshly built package at its current version.

use pkgbuild_core::{Package, ResourceStore, StoreError};
use tracing::{error, info};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("error getting function list: {0}")]
    List(StoreError),
    #[error("error updating function package resource version: {source}")]
    Update { function: String, source: StoreError },
}

/// Update every stale function reference in the package namespace, in listing
/// order. The first failed update stops the pass; functions already updated stay updated.
pub async fn reconcile_dependents(store: &dyn ResourceStore, pkg: &Package) -> Result<usize, ReconcileError> {
    let functions = store.list_functions(&pkg.meta.namespace).await.map_err(|e| {
        error!(package = %pkg.meta.name, error = %e, "error getting function list");
        ReconcileError::List(e)
    })?;

    let mut updated = 0usize;
    for mut function in functions.into_iter().filter(|f| f.references_stale(pkg)) {
        let from = std::mem::replace(&mut function.package_ref.resource_version, pkg.meta.resource_version.clone());
        if let Err(e) = store.update_function(&function).await {
            error!(function = %function.meta.name, package = %pkg.meta.name, error = %e, "error updating function package resource version");
            return Err(ReconcileError::Update { function: function.meta.name, source: e });
        }
        info!(function = %function.meta.name, package = %pkg.meta.name, from = %from, to = %pkg.meta.resource_version, "function package reference updated");
        updated += 1;
    }
    metrics::counter!("function_refs_updated_total", updated as u64);
    Ok(updated)
}
