//! Initial status for packages applied without one.

use pkgbuild_core::{BuildStatus, Package, ResourceStore, StoreError};
use tracing::info;

use crate::status::update_package;

pub const EMPTY_ARCHIVES_LOG: &str = "both deploy and source archive are empty";

/// Starting status for a freshly applied package, with the build log to record.
pub fn initial_status(pkg: &Package) -> (BuildStatus, &'static str) {
    if !pkg.spec.deployment.is_empty() {
        // deployable as-is, whatever the source archive holds
        (BuildStatus::None, "")
    } else if !pkg.spec.source.is_empty() {
        (BuildStatus::Pending, "")
    } else {
        (BuildStatus::Failed, EMPTY_ARCHIVES_LOG)
    }
}

/// Persist the initial status. The write produces its own update event, which
/// is what eventually starts a build; nothing is built from here.
pub async fn set_initial_build_status(store: &dyn ResourceStore, pkg: &Package) -> Result<Package, StoreError> {
    let (status, log) = initial_status(pkg);
    info!(package = %pkg.meta.name, namespace = %pkg.meta.namespace, status = %status, "setting initial build status");
    metrics::counter!("package_initial_status_total", 1u64, "status" => status.as_str());
    update_package(store, pkg, status, log.to_string(), None).await
}
