//! pkgbuild core types: packages, environments, functions, builder pods,
//! typed watch events and the collaborator traits the controller runs against.

#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::mpsc;

/// Builder pod label carrying the environment name.
pub const LABEL_ENV_NAME: &str = "envName";
/// Builder pod label carrying the namespace the builder serves.
pub const LABEL_ENV_NAMESPACE: &str = "envNamespace";
/// Builder pod label carrying the environment resource version.
pub const LABEL_ENV_RESOURCE_VERSION: &str = "envResourceVersion";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMeta {
    pub namespace: String,
    pub name: String,
    /// Opaque token reassigned by the store on every write.
    #[serde(default)]
    pub resource_version: String,
}

impl ResourceMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, resource_version: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into(), resource_version: resource_version.into() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    None,
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::None => "none",
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveType {
    #[default]
    Literal,
    Url,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checksum {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub sum: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Archive {
    #[serde(rename = "type", default)]
    pub kind: ArchiveType,
    /// Base64 encoded inline content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub literal: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default)]
    pub checksum: Checksum,
}

impl Archive {
    pub fn literal(content: impl Into<String>) -> Self {
        Self { kind: ArchiveType::Literal, literal: Some(content.into()), ..Default::default() }
    }

    pub fn url(url: impl Into<String>, checksum: Checksum) -> Self {
        Self { kind: ArchiveType::Url, literal: None, url: url.into(), checksum }
    }

    pub fn is_empty(&self) -> bool {
        self.literal.as_deref().map_or(true, str::is_empty) && self.url.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EnvironmentRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackageSpec {
    pub environment: EnvironmentRef,
    #[serde(default)]
    pub source: Archive,
    #[serde(default)]
    pub deployment: Archive,
    #[serde(rename = "buildcmd", default, skip_serializing_if = "String::is_empty")]
    pub build_cmd: String,
}

/// Location of the artifact produced by a successful build.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub archive_download_url: String,
    #[serde(default)]
    pub checksum: Checksum,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackageStatus {
    #[serde(rename = "buildstatus", default, skip_serializing_if = "Option::is_none")]
    pub build_status: Option<BuildStatus>,
    #[serde(rename = "buildlog", default)]
    pub build_log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadResponse>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Package {
    pub meta: ResourceMeta,
    pub spec: PackageSpec,
    #[serde(default)]
    pub status: PackageStatus,
}

impl Package {
    /// Admission key for build deduplication: `namespace:name:version`.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.meta.namespace, self.meta.name, self.meta.resource_version)
    }

    pub fn build_status(&self) -> Option<BuildStatus> { self.status.build_status }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub meta: ResourceMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder_command: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct PackageRef {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub resource_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Function {
    pub meta: ResourceMeta,
    pub package_ref: PackageRef,
}

impl Function {
    /// True when this function points at `pkg` by name and namespace but at another version.
    pub fn references_stale(&self, pkg: &Package) -> bool {
        self.package_ref.name == pkg.meta.name
            && self.package_ref.namespace == pkg.meta.namespace
            && self.package_ref.resource_version != pkg.meta.resource_version
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerReadiness {
    pub name: String,
    pub ready: bool,
}

/// Observed state of a builder pod. Never created or mutated by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuilderPod {
    pub namespace: String,
    pub name: String,
    pub labels: SmallVec<[(String, String); 8]>,
    pub containers: SmallVec<[ContainerReadiness; 2]>,
}

impl BuilderPod {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Ready when it reports at least one container and every container is ready.
    /// A pod that lists no container statuses yet is still starting and does not
    /// count as ready, unlike a plain "no container is unready" check.
    pub fn is_ready(&self) -> bool {
        !self.containers.is_empty() && self.containers.iter().all(|c| c.ready)
    }

    /// Exact label match against an environment served out of `builder_namespace`.
    pub fn serves(&self, env: &Environment, builder_namespace: &str) -> bool {
        self.label(LABEL_ENV_NAME) == Some(env.meta.name.as_str())
            && self.label(LABEL_ENV_NAMESPACE) == Some(builder_namespace)
            && self.label(LABEL_ENV_RESOURCE_VERSION) == Some(env.meta.resource_version.as_str())
    }
}

/// Change notification for a package resource, decoded once at the subscription boundary.
#[derive(Debug, Clone)]
pub enum PackageEvent {
    Added(Package),
    Updated { old: Package, new: Package },
    Deleted(Package),
}

/// Change notification for a builder pod.
#[derive(Debug, Clone)]
pub enum PodEvent {
    Applied(BuilderPod),
    Deleted(BuilderPod),
    /// Full relist of one namespace; replaces whatever was known for it.
    Restarted { namespace: String, pods: Vec<BuilderPod> },
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound { kind: &'static str, namespace: String, name: String },
    #[error("conflict writing {kind} {namespace}/{name}: {message}")]
    Conflict { kind: &'static str, namespace: String, name: String, message: String },
    #[error("store: {0}")]
    Other(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound { .. }) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict { .. }) }
}

/// Declarative resource store. Every update is conditional on the resource
/// version carried by the argument and returns the stored object with its new version.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_environment(&self, namespace: &str, name: &str) -> Result<Environment, StoreError>;
    async fn update_package(&self, pkg: &Package) -> Result<Package, StoreError>;
    async fn list_functions(&self, namespace: &str) -> Result<Vec<Function>, StoreError>;
    async fn update_function(&self, function: &Function) -> Result<Function, StoreError>;
}

/// Read side of the indexed builder pod store.
pub trait BuilderPodIndex: Send + Sync {
    fn list(&self, namespace: &str) -> Vec<BuilderPod>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub package: ResourceMeta,
    pub environment: ResourceMeta,
    pub source: Archive,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub build_command: String,
}

impl BuildRequest {
    pub fn new(pkg: &Package, env: &Environment) -> Self {
        Self {
            package: pkg.meta.clone(),
            environment: env.meta.clone(),
            source: pkg.spec.source.clone(),
            build_command: pkg.spec.build_cmd.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutput {
    pub upload: UploadResponse,
    #[serde(default)]
    pub build_log: String,
}

/// Remote build failure; `build_log` holds whatever the builder printed before failing.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{message}")]
pub struct BuildFailure {
    pub message: String,
    pub build_log: String,
}

#[async_trait::async_trait]
pub trait BuildClient: Send + Sync {
    async fn build(&self, builder_namespace: &str, req: &BuildRequest) -> Result<BuildOutput, BuildFailure>;
}

/// Long-lived subscriptions feeding typed events into the controller.
/// Both calls run until the receiver is dropped or the stream fails for good.
#[async_trait::async_trait]
pub trait WatchSource: Send + Sync {
    async fn watch_packages(&self, namespace: &str, tx: mpsc::Sender<PackageEvent>) -> anyhow::Result<()>;
    async fn watch_builder_pods(&self, namespace: &str, tx: mpsc::Sender<PodEvent>) -> anyhow::Result<()>;
}

pub mod prelude {
    pub use super::{
        Archive, BuildClient, BuildFailure, BuildOutput, BuildRequest, BuildStatus, BuilderPod, BuilderPodIndex,
        Environment, EnvironmentRef, Function, Package, PackageEvent, PackageRef, PodEvent, ResourceMeta,
        ResourceStore, StoreError, UploadResponse, WatchSource,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(labels: &[(&str, &str)], ready: &[bool]) -> BuilderPod {
        BuilderPod {
            namespace: "fission-builder".into(),
            name: "py-builder".into(),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            containers: ready.iter().enumerate().map(|(i, r)| ContainerReadiness { name: format!("c{}", i), ready: *r }).collect(),
        }
    }

    #[test]
    fn archive_emptiness() {
        assert!(Archive::default().is_empty());
        assert!(Archive::literal("").is_empty());
        assert!(!Archive::literal("UEsDBA==").is_empty());
        assert!(!Archive::url("http://storage/a.zip", Checksum::default()).is_empty());
    }

    #[test]
    fn readiness_requires_every_container() {
        assert!(pod(&[], &[true, true]).is_ready());
        assert!(!pod(&[], &[true, false]).is_ready());
        assert!(!pod(&[], &[]).is_ready());
    }

    #[test]
    fn serves_matches_labels_exactly() {
        let env = Environment { meta: ResourceMeta::new("default", "python", "42"), ..Default::default() };
        let p = pod(&[(LABEL_ENV_NAME, "python"), (LABEL_ENV_NAMESPACE, "default"), (LABEL_ENV_RESOURCE_VERSION, "42")], &[true]);
        assert!(p.serves(&env, "default"));
        assert!(!p.serves(&env, "fission-builder"));
        let upper = pod(&[(LABEL_ENV_NAME, "Python"), (LABEL_ENV_NAMESPACE, "default"), (LABEL_ENV_RESOURCE_VERSION, "42")], &[true]);
        assert!(!upper.serves(&env, "default"));
    }

    #[test]
    fn build_status_wire_format() {
        let s: BuildStatus = serde_json::from_str("\"succeeded\"").unwrap();
        assert_eq!(s, BuildStatus::Succeeded);
        assert_eq!(serde_json::to_string(&BuildStatus::Pending).unwrap(), "\"pending\"");
        let st: PackageStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(st.build_status, None);
    }

    #[test]
    fn dedup_key_and_staleness() {
        let pkg = Package { meta: ResourceMeta::new("default", "hello", "7"), ..Default::default() };
        assert_eq!(pkg.dedup_key(), "default:hello:7");
        let mut f = Function {
            meta: ResourceMeta::new("default", "fn", "1"),
            package_ref: PackageRef { namespace: "default".into(), name: "hello".into(), resource_version: "3".into() },
        };
        assert!(f.references_stale(&pkg));
        f.package_ref.resource_version = "7".into();
        assert!(!f.references_stale(&pkg));
        f.package_ref.resource_version = "3".into();
        f.package_ref.name = "other".into();
        assert!(!f.references_stale(&pkg));
    }
}
