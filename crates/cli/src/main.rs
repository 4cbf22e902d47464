use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pkgbuild_builder::{BuilderClientConfig, HttpBuildClient, DEFAULT_BUILDER_PORT};
use pkgbuild_controller::{BackoffConfig, Controller, ControllerConfig};
use pkgbuild_kubehub::{KubeStore, KubeWatch};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pkgbuildd", version, about = "Builds pending packages on environment builders")]
struct Cli {
    /// Namespaces whose packages are watched (comma separated)
    #[arg(long = "namespaces", env = "PKGBUILD_NAMESPACES", value_delimiter = ',', default_value = "default")]
    namespaces: Vec<String>,

    /// Namespace hosting builder pods (default: the environment's namespace)
    #[arg(long = "builder-namespace", env = "PKGBUILD_BUILDER_NAMESPACE")]
    builder_namespace: Option<String>,

    /// Storage service the builders upload archives to
    #[arg(long = "storage-url", env = "PKGBUILD_STORAGE_URL", default_value = "http://storagesvc.fission")]
    storage_url: String,

    #[arg(long = "builder-port", env = "PKGBUILD_BUILDER_PORT", default_value_t = DEFAULT_BUILDER_PORT)]
    builder_port: u16,

    /// Fixed builder address overriding the per-environment service name
    #[arg(long = "builder-url", env = "PKGBUILD_BUILDER_URL")]
    builder_url: Option<String>,

    #[arg(long = "build-timeout-secs", env = "PKGBUILD_BUILD_TIMEOUT_SECS", default_value_t = 600)]
    build_timeout_secs: u64,

    #[arg(long = "queue-cap", env = "PKGBUILD_QUEUE_CAP", default_value_t = 2048)]
    queue_cap: usize,

    /// First wait between builder readiness checks
    #[arg(long = "backoff-initial-ms", env = "PKGBUILD_BACKOFF_INITIAL_MS", default_value_t = 500)]
    backoff_initial_ms: u64,

    #[arg(long = "backoff-max-ms", env = "PKGBUILD_BACKOFF_MAX_MS", default_value_t = 5000)]
    backoff_max_ms: u64,

    #[arg(long = "backoff-multiplier", env = "PKGBUILD_BACKOFF_MULTIPLIER", default_value_t = 2.0)]
    backoff_multiplier: f64,

    /// Readiness checks before a build is failed with a timeout
    #[arg(long = "backoff-attempts", env = "PKGBUILD_BACKOFF_ATTEMPTS", default_value_t = 30)]
    backoff_attempts: u32,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        let mut namespaces: Vec<String> =
            self.namespaces.iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        if namespaces.is_empty() {
            namespaces.push("default".to_string());
        }
        ControllerConfig {
            namespaces,
            builder_namespace: self.builder_namespace.clone().filter(|s| !s.is_empty()),
            queue_cap: self.queue_cap,
            backoff: BackoffConfig {
                initial_interval: Duration::from_millis(self.backoff_initial_ms),
                max_interval: Duration::from_millis(self.backoff_max_ms),
                multiplier: self.backoff_multiplier,
                max_attempts: self.backoff_attempts,
            },
        }
    }

    fn builder_config(&self) -> BuilderClientConfig {
        BuilderClientConfig {
            port: self.builder_port,
            storage_url: self.storage_url.clone(),
            timeout: Duration::from_secs(self.build_timeout_secs),
            base_url: self.builder_url.clone(),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("PKGBUILD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PKGBUILD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid PKGBUILD_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = cli.controller_config();
    info!(namespaces = ?config.namespaces, builder_namespace = ?config.builder_namespace, "pkgbuildd starting");

    let client = kube::Client::try_default().await.context("connecting to the cluster")?;
    let builder = HttpBuildClient::new(cli.builder_config()).context("building HTTP client")?;
    let controller = Controller::new(
        config,
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(builder),
        Arc::new(KubeWatch::new(client)),
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("interrupt received; shutting down"),
            Err(e) => error!(error = %e, "failed to listen for interrupt; shutting down"),
        }
        on_signal.cancel();
    });

    controller.run(cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_controller_defaults() {
        let cli = Cli::try_parse_from(["pkgbuildd"]).unwrap();
        assert_eq!(cli.controller_config(), ControllerConfig::default());
        let b = cli.builder_config();
        assert_eq!(b.port, DEFAULT_BUILDER_PORT);
        assert_eq!(b.timeout, Duration::from_secs(600));
        assert_eq!(b.base_url, None);
    }

    #[test]
    fn flags_map_into_config() {
        let cli = Cli::try_parse_from([
            "pkgbuildd",
            "--namespaces",
            "team-a, team-b,",
            "--builder-namespace",
            "fission-builder",
            "--backoff-attempts",
            "5",
            "--backoff-initial-ms",
            "100",
        ])
        .unwrap();
        let cfg = cli.controller_config();
        assert_eq!(cfg.namespaces, vec!["team-a".to_string(), "team-b".to_string()]);
        assert_eq!(cfg.builder_namespace_for("team-a"), "fission-builder");
        assert_eq!(cfg.backoff.max_attempts, 5);
        assert_eq!(cfg.backoff.initial_interval, Duration::from_millis(100));
    }
}
