//! Controller settings: watched namespaces, builder namespace and readiness backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry schedule for the builder readiness poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Number of readiness checks before the build times out.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    /// Namespaces whose packages are watched.
    pub namespaces: Vec<String>,
    /// Namespace hosting builder pods; `None` means builders live next to their environment.
    pub builder_namespace: Option<String>,
    /// Capacity of the event channels feeding the dispatcher and the pod store.
    pub queue_cap: usize,
    pub backoff: BackoffConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { namespaces: vec!["default".to_string()], builder_namespace: None, queue_cap: 2048, backoff: BackoffConfig::default() }
    }
}

impl ControllerConfig {
    pub fn builder_namespace_for(&self, env_namespace: &str) -> String {
        match self.builder_namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns.to_string(),
            _ => env_namespace.to_string(),
        }
    }

    /// Namespaces the builder pod subscription has to cover.
    pub fn builder_namespaces(&self) -> Vec<String> {
        match self.builder_namespace.as_deref() {
            Some(ns) if !ns.is_empty() => vec![ns.to_string()],
            _ => {
                let mut v = self.namespaces.clone();
                v.sort();
                v.dedup();
                v
            }
        }
    }
}
