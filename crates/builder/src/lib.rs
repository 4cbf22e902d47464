//! pkgbuild builder client: runs a package build on the environment's builder
//! service over HTTP.
//!
//! `POST http://<env>-<envVersion>.<builderNamespace>:<port>/build` with
//! `{package, environment, source, buildCommand, storageSvcUrl}`; a 2xx reply
//! carries `{uploadResponse, buildLogs}`.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use pkgbuild_core::{Archive, BuildClient, BuildFailure, BuildOutput, BuildRequest, ResourceMeta, UploadResponse};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_BUILDER_PORT: u16 = 8000;

#[derive(Debug, Clone)]
pub struct BuilderClientConfig {
    pub port: u16,
    /// Storage service the builder uploads the deployment archive to.
    pub storage_url: String,
    pub timeout: Duration,
    /// Fixed builder address, e.g. a port-forward when running outside the cluster.
    pub base_url: Option<String>,
}

impl Default for BuilderClientConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_BUILDER_PORT,
            storage_url: "http://storagesvc.fission".into(),
            timeout: Duration::from_secs(600),
            base_url: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    package: &'a ResourceMeta,
    environment: &'a ResourceMeta,
    source: &'a Archive,
    #[serde(skip_serializing_if = "str::is_empty")]
    build_command: &'a str,
    storage_svc_url: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    upload_response: UploadResponse,
    #[serde(default)]
    build_logs: String,
}

pub struct HttpBuildClient {
    http: reqwest::Client,
    cfg: BuilderClientConfig,
}

impl HttpBuildClient {
    pub fn new(cfg: BuilderClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self { http, cfg })
    }

    pub fn endpoint(&self, builder_namespace: &str, env: &ResourceMeta) -> String {
        match self.cfg.base_url.as_deref() {
            Some(base) => format!("{}/build", base.trim_end_matches('/')),
            None => format!("http://{}-{}.{}:{}/build", env.name, env.resource_version, builder_namespace, self.cfg.port),
        }
    }

    fn body<'a>(&'a self, req: &'a BuildRequest) -> WireRequest<'a> {
        WireRequest {
            package: &req.package,
            environment: &req.environment,
            source: &req.source,
            build_command: &req.build_command,
            storage_svc_url: &self.cfg.storage_url,
        }
    }
}

fn failure(message: String, build_log: String) -> BuildFailure { BuildFailure { message, build_log } }

#[async_trait::async_trait]
impl BuildClient for HttpBuildClient {
    async fn build(&self, builder_namespace: &str, req: &BuildRequest) -> Result<BuildOutput, BuildFailure> {
        let url = self.endpoint(builder_namespace, &req.environment);
        debug!(package = %req.package.name, url = %url, "sending build request");
        let t0 = Instant::now();
        let resp = self
            .http
            .post(&url)
            .json(&self.body(req))
            .send()
            .await
            .map_err(|e| failure(format!("error sending build request to {}: {}", url, e), String::new()))?;
        metrics::histogram!("builder_request_ms", t0.elapsed().as_secs_f64() * 1000.0);

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| failure(format!("error reading builder response: {}", e), String::new()))?;
        if !status.is_success() {
            warn!(package = %req.package.name, status = %status, "builder rejected build");
            return Err(failure(format!("builder returned {}", status), text));
        }
        let wire: WireResponse = serde_json::from_str(&text)
            .map_err(|e| failure(format!("error decoding builder response: {}", e), text.clone()))?;
        Ok(BuildOutput { upload: wire.upload_response, build_log: wire.build_logs })
    }
}
