//! Package status writes and build log formatting.

use std::fmt::{Display, Write as _};

use chrono::Utc;
use pkgbuild_core::{Archive, BuildStatus, Package, PackageStatus, ResourceStore, StoreError, UploadResponse};

/// Append one failure reason as `"<message>: <error>\n"`.
pub fn append_log(mut log: String, message: &str, err: impl Display) -> String {
    let _ = writeln!(log, "{}: {}", message, err);
    log
}

/// Conditionally write a new status for `pkg`. A successful build's upload
/// reference also becomes the package's deployment archive.
pub async fn update_package(
    store: &dyn ResourceStore,
    pkg: &Package,
    status: BuildStatus,
    build_log: String,
    upload: Option<UploadResponse>,
) -> Result<Package, StoreError> {
    let mut next = pkg.clone();
    if let Some(up) = &upload {
        next.spec.deployment = Archive::url(up.archive_download_url.clone(), up.checksum.clone());
    }
    next.status = PackageStatus {
        build_status: Some(status),
        build_log,
        last_update_timestamp: Some(Utc::now()),
        upload,
    };
    store.update_package(&next).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_log_accumulates_lines() {
        let log = append_log("compiling...\n".to_string(), "error building package", "exit status 1");
        let log = append_log(log, "error updating package", "conflict");
        assert_eq!(log, "compiling...\nerror building package: exit status 1\nerror updating package: conflict\n");
    }
}
