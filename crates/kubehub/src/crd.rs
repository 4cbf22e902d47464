//! `fission.io/v1` custom resources and their conversion into domain types.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use pkgbuild_core::{BuilderPod, ContainerReadiness, PackageStatus, ResourceMeta};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize)]
#[kube(group = "fission.io", version = "v1", kind = "Package", root = "PackageResource", namespaced, schema = "disabled")]
#[kube(status = "PackageStatus")]
pub struct PackageResourceSpec {
    #[serde(flatten)]
    pub inner: pkgbuild_core::PackageSpec,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Builder {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize)]
#[kube(group = "fission.io", version = "v1", kind = "Environment", root = "EnvironmentResource", namespaced, schema = "disabled")]
pub struct EnvironmentResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder: Option<Builder>,
    /// Runtime, pool and resource settings the controller never reads.
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// `spec.package.packageref` of a function. Field names are lowercase on the wire.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PackageReference {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "resourceversion", default)]
    pub resource_version: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FunctionPackage {
    #[serde(rename = "packageref", default)]
    pub package_ref: PackageReference,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize)]
#[kube(group = "fission.io", version = "v1", kind = "Function", root = "FunctionResource", namespaced, schema = "disabled")]
pub struct FunctionResourceSpec {
    #[serde(default)]
    pub package: FunctionPackage,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

pub fn meta_from(meta: &ObjectMeta) -> ResourceMeta {
    ResourceMeta::new(
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
        meta.resource_version.clone().unwrap_or_default(),
    )
}

pub fn package_from(obj: &PackageResource) -> pkgbuild_core::Package {
    pkgbuild_core::Package {
        meta: meta_from(&obj.metadata),
        spec: obj.spec.inner.clone(),
        status: obj.status.clone().unwrap_or_default(),
    }
}

pub fn environment_from(obj: &EnvironmentResource) -> pkgbuild_core::Environment {
    let builder = obj.spec.builder.clone().unwrap_or_default();
    pkgbuild_core::Environment {
        meta: meta_from(&obj.metadata),
        builder_image: builder.image.filter(|s| !s.is_empty()),
        builder_command: builder.command.filter(|s| !s.is_empty()),
    }
}

pub fn function_from(obj: &FunctionResource) -> pkgbuild_core::Function {
    let r = &obj.spec.package.package_ref;
    pkgbuild_core::Function {
        meta: meta_from(&obj.metadata),
        package_ref: pkgbuild_core::PackageRef {
            namespace: r.namespace.clone(),
            name: r.name.clone(),
            resource_version: r.resource_version.clone(),
        },
    }
}

/// Labels plus per-container readiness. A pod whose status lists no
/// containers yet comes out with an empty container list.
pub fn builder_pod_from(pod: &Pod) -> BuilderPod {
    let containers = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|cs| cs.iter().map(|c| ContainerReadiness { name: c.name.clone(), ready: c.ready }).collect())
        .unwrap_or_default();
    BuilderPod {
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        name: pod.metadata.name.clone().unwrap_or_default(),
        labels: pod.metadata.labels.iter().flatten().map(|(k, v)| (k.clone(), v.clone())).collect(),
        containers,
    }
}
