#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use pkgbuild_controller::memory::{builder_pod, MemoryStore, ScriptedBuildClient, StaticPods};
use pkgbuild_controller::{reconcile_dependents, BackoffConfig, BuildOutcome, ControllerConfig, Orchestrator, ReconcileError};
use pkgbuild_core::{
    Archive, BuildStatus, Environment, EnvironmentRef, Function, Package, PackageRef, PackageSpec, PackageStatus,
    ResourceMeta,
};
use tokio_util::sync::CancellationToken;

fn function(name: &str, package: &str, version: &str) -> Function {
    Function {
        meta: ResourceMeta::new("default", name, ""),
        package_ref: PackageRef { namespace: "default".into(), name: package.into(), resource_version: version.into() },
    }
}

fn setup() -> (Arc<MemoryStore>, Orchestrator, Package) {
    let store = Arc::new(MemoryStore::new());
    let env = store.insert_environment(Environment { meta: ResourceMeta::new("default", "node", ""), ..Default::default() });
    let pods = Arc::new(StaticPods::new(vec![builder_pod(&env, "default", "node-builder", true)]));
    let cfg = ControllerConfig {
        backoff: BackoffConfig { initial_interval: Duration::from_millis(1), max_interval: Duration::from_millis(1), multiplier: 1.0, max_attempts: 3 },
        ..Default::default()
    };
    let client = Arc::new(ScriptedBuildClient::succeeding("http://storage/archive/v2", "ok\n"));
    let orchestrator = Orchestrator::new(store.clone(), pods, client, Arc::new(cfg));
    let pkg = store.apply_package(Package {
        meta: ResourceMeta::new("default", "web", ""),
        spec: PackageSpec {
            environment: EnvironmentRef { namespace: "default".into(), name: "node".into() },
            source: Archive::literal("UEsDBA=="),
            ..Default::default()
        },
        status: PackageStatus { build_status: Some(BuildStatus::Pending), ..Default::default() },
    });
    (store, orchestrator, pkg)
}

/// Version the package had while its dependents were reconciled: the `Running` write.
fn running_version(store: &MemoryStore) -> String {
    store
        .package_history("default", "web")
        .into_iter()
        .find(|p| p.build_status() == Some(BuildStatus::Running))
        .map(|p| p.meta.resource_version)
        .unwrap()
}

#[tokio::test]
async fn stale_functions_converge_on_new_version() {
    let (store, orchestrator, pkg) = setup();
    store.insert_function(function("fn-a", "web", "v1"));
    store.insert_function(function("fn-b", "web", "v1"));
    store.insert_function(function("fn-other", "api", "v1"));

    let outcome = orchestrator.build(&pkg, &CancellationToken::new()).await;

    assert!(matches!(outcome, BuildOutcome::Succeeded(_)), "{:?}", outcome);
    let v2 = running_version(&store);
    assert_eq!(store.function("default", "fn-a").unwrap().package_ref.resource_version, v2);
    assert_eq!(store.function("default", "fn-b").unwrap().package_ref.resource_version, v2);
    assert_eq!(store.function("default", "fn-other").unwrap().package_ref.resource_version, "v1");
}

#[tokio::test]
async fn failed_update_leaves_earlier_functions_updated() {
    let (store, orchestrator, pkg) = setup();
    store.insert_function(function("fn-a", "web", "v1"));
    store.insert_function(function("fn-b", "web", "v1"));
    store.fail_function_update("fn-b");

    let outcome = orchestrator.build(&pkg, &CancellationToken::new()).await;

    let stored = store.package("default", "web").unwrap();
    assert_eq!(stored.build_status(), Some(BuildStatus::Failed));
    assert!(stored.status.build_log.starts_with("ok\nerror updating function package resource version: "), "{}", stored.status.build_log);
    assert_eq!(outcome, BuildOutcome::Failed { log: stored.status.build_log.clone() });
    assert_eq!(store.function("default", "fn-a").unwrap().package_ref.resource_version, running_version(&store));
    assert_eq!(store.function("default", "fn-b").unwrap().package_ref.resource_version, "v1");
}

#[tokio::test]
async fn function_list_failure_fails_the_build() {
    let (store, orchestrator, pkg) = setup();
    store.fail_function_list(true);

    let outcome = orchestrator.build(&pkg, &CancellationToken::new()).await;

    let log = match outcome {
        BuildOutcome::Failed { log } => log,
        other => panic!("expected failure, got {:?}", other),
    };
    assert!(log.contains("error getting function list: "), "{}", log);
    assert_eq!(store.package("default", "web").unwrap().build_status(), Some(BuildStatus::Failed));
}

#[tokio::test]
async fn reconcile_skips_current_and_foreign_references() {
    let (store, _orchestrator, pkg) = setup();
    store.insert_function(function("fn-current", "web", &pkg.meta.resource_version));
    store.insert_function(function("fn-stale", "web", "v0"));
    let mut elsewhere = function("fn-elsewhere", "web", "v0");
    elsewhere.package_ref.namespace = "staging".into();
    store.insert_function(elsewhere);

    let updated = reconcile_dependents(store.as_ref(), &pkg).await.unwrap();

    assert_eq!(updated, 1);
    assert_eq!(store.function("default", "fn-stale").unwrap().package_ref.resource_version, pkg.meta.resource_version);
    assert_eq!(store.function("default", "fn-elsewhere").unwrap().package_ref.resource_version, "v0");

    store.fail_function_list(true);
    assert!(matches!(reconcile_dependents(store.as_ref(), &pkg).await, Err(ReconcileError::List(_))));
}
