#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use pkgbuild_controller::memory::{builder_pod, MemoryStore, ScriptedBuildClient, StaticPods};
use pkgbuild_controller::{classify, Action, BackoffConfig, BuildGuard, ControllerConfig, Dispatcher, Orchestrator};
use pkgbuild_core::{
    Archive, BuildStatus, Environment, EnvironmentRef, Package, PackageEvent, PackageSpec, PackageStatus, ResourceMeta,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn pkg(rv: &str, status: Option<BuildStatus>) -> Package {
    Package {
        meta: ResourceMeta::new("default", "hello", rv),
        spec: PackageSpec {
            environment: EnvironmentRef { namespace: "default".into(), name: "python".into() },
            source: Archive::literal("UEsDBA=="),
            ..Default::default()
        },
        status: PackageStatus { build_status: status, ..Default::default() },
    }
}

fn updated(old: Package, new: Package) -> PackageEvent { PackageEvent::Updated { old, new } }

#[test]
fn classification_table() {
    use BuildStatus::{Failed, Pending, Running, Succeeded};
    assert_eq!(classify(&PackageEvent::Added(pkg("1", None))), Action::ResolveInitial);
    assert_eq!(classify(&PackageEvent::Added(pkg("1", Some(Pending)))), Action::Build);
    assert_eq!(classify(&PackageEvent::Added(pkg("1", Some(Succeeded)))), Action::Ignore);
    assert_eq!(classify(&updated(pkg("1", None), pkg("2", None))), Action::ResolveInitial);
    assert_eq!(classify(&updated(pkg("1", None), pkg("2", Some(Pending)))), Action::Build);
    // pending is always eligible, even when re-observed at the same version
    assert_eq!(classify(&updated(pkg("2", Some(Pending)), pkg("2", Some(Pending)))), Action::Build);
    assert_eq!(classify(&updated(pkg("2", Some(Failed)), pkg("2", Some(Failed)))), Action::Ignore);
    assert_eq!(classify(&updated(pkg("2", None), pkg("2", None))), Action::Ignore);
    assert_eq!(classify(&updated(pkg("2", Some(Pending)), pkg("3", Some(Running)))), Action::Ignore);
    assert_eq!(classify(&updated(pkg("3", Some(Running)), pkg("4", Some(Succeeded)))), Action::Ignore);
    assert_eq!(classify(&PackageEvent::Deleted(pkg("4", Some(Pending)))), Action::Ignore);
}

struct Fixture {
    store: Arc<MemoryStore>,
    client: Arc<ScriptedBuildClient>,
    dispatcher: Dispatcher,
}

fn fixture(build_delay: Duration) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let env = store.insert_environment(Environment { meta: ResourceMeta::new("default", "python", ""), ..Default::default() });
    let pods = Arc::new(StaticPods::new(vec![builder_pod(&env, "default", "python-builder", true)]));
    let client = Arc::new(ScriptedBuildClient::succeeding("http://storage/x", "ok\n").with_delay(build_delay));
    let cfg = ControllerConfig {
        backoff: BackoffConfig { initial_interval: Duration::from_millis(1), max_interval: Duration::from_millis(2), multiplier: 2.0, max_attempts: 5 },
        ..Default::default()
    };
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), pods, client.clone(), Arc::new(cfg)));
    let dispatcher = Dispatcher::new(orchestrator, BuildGuard::new(), CancellationToken::new());
    Fixture { store, client, dispatcher }
}

fn statuses(store: &MemoryStore) -> Vec<Option<BuildStatus>> {
    store.package_history("default", "hello").iter().map(|p| p.build_status()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_pending_deliveries_build_once() {
    let mut f = fixture(Duration::from_millis(50));
    let pending = f.store.apply_package(pkg("", Some(BuildStatus::Pending)));

    let mut actions = Vec::new();
    for _ in 0..8 {
        actions.push(f.dispatcher.handle(updated(pending.clone(), pending.clone())));
    }
    assert_eq!(actions[0], Action::Build);
    assert!(actions[1..].iter().all(|a| *a == Action::Skipped), "{:?}", actions);
    assert!(f.dispatcher.guard().contains(&pending.dedup_key()));
    assert_eq!(f.dispatcher.in_flight(), 1);

    f.dispatcher.drain().await;
    assert_eq!(f.dispatcher.in_flight(), 0);

    assert_eq!(f.client.call_count(), 1);
    assert!(f.dispatcher.guard().is_empty());
    assert_eq!(
        statuses(&f.store),
        vec![Some(BuildStatus::Pending), Some(BuildStatus::Running), Some(BuildStatus::Succeeded)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_through_channel_build_once() {
    let f = fixture(Duration::from_millis(20));
    let pending = f.store.apply_package(pkg("", Some(BuildStatus::Pending)));
    let (tx, rx) = mpsc::channel(64);

    let mut producers = Vec::new();
    for _ in 0..16 {
        let tx = tx.clone();
        let event = PackageEvent::Added(pending.clone());
        producers.push(tokio::spawn(async move { tx.send(event).await.unwrap() }));
    }
    drop(tx);
    for p in producers {
        p.await.unwrap();
    }
    f.dispatcher.run(rx).await;

    assert_eq!(f.client.call_count(), 1);
    let history = statuses(&f.store);
    assert_eq!(history.last(), Some(&Some(BuildStatus::Succeeded)));
    assert!(!history.contains(&Some(BuildStatus::Failed)), "{:?}", history);
}

#[tokio::test]
async fn terminal_redelivery_never_rebuilds() {
    let mut f = fixture(Duration::ZERO);
    let pending = f.store.apply_package(pkg("", Some(BuildStatus::Pending)));
    assert_eq!(f.dispatcher.handle(PackageEvent::Added(pending.clone())), Action::Build);
    f.dispatcher.drain().await;
    let done = f.store.package("default", "hello").unwrap();
    assert_eq!(done.build_status(), Some(BuildStatus::Succeeded));

    assert_eq!(f.dispatcher.handle(updated(done.clone(), done.clone())), Action::Ignore);
    // a stale pending snapshot is admitted again but cannot get past the running write
    assert_eq!(f.dispatcher.handle(PackageEvent::Added(pending)), Action::Build);
    f.dispatcher.drain().await;

    assert!(f.dispatcher.guard().is_empty());
    assert_eq!(f.client.call_count(), 1);
    assert_eq!(f.store.package("default", "hello"), Some(done));
    let history = statuses(&f.store);
    let succeeded_at = history.iter().position(|s| *s == Some(BuildStatus::Succeeded)).unwrap();
    assert!(history[succeeded_at..].iter().all(|s| *s == Some(BuildStatus::Succeeded)));
}

#[tokio::test]
async fn cancelled_dispatcher_stops_and_joins() {
    let f = fixture(Duration::ZERO);
    let cancel = CancellationToken::new();
    let orchestrator = Arc::new(Orchestrator::new(
        f.store.clone(),
        Arc::new(StaticPods::default()),
        f.client.clone(),
        Arc::new(ControllerConfig {
            backoff: BackoffConfig { initial_interval: Duration::from_millis(10), max_interval: Duration::from_millis(10), multiplier: 1.0, max_attempts: 10_000 },
            ..Default::default()
        }),
    ));
    let mut dispatcher = Dispatcher::new(orchestrator, BuildGuard::new(), cancel.clone());
    let pending = f.store.apply_package(pkg("", Some(BuildStatus::Pending)));
    assert_eq!(dispatcher.handle(PackageEvent::Added(pending)), Action::Build);
    let guard = dispatcher.guard().clone();
    let (_tx, rx) = mpsc::channel(1);

    let run = tokio::spawn(dispatcher.run(rx));
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();

    assert!(guard.is_empty());

    assert_eq!(f.store.package("default", "hello").unwrap().build_status(), Some(BuildStatus::Failed));
    assert_eq!(f.client.call_count(), 0);
}

fn dispatcher_with(store: &Arc<MemoryStore>, pods: StaticPods, backoff: BackoffConfig) -> (Dispatcher, Arc<ScriptedBuildClient>) {
    let client = Arc::new(ScriptedBuildClient::succeeding("http://storage/x", "ok\n"));
    let cfg = ControllerConfig { backoff, ..Default::default() };
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), Arc::new(pods), client.clone(), Arc::new(cfg)));
    (Dispatcher::new(orchestrator, BuildGuard::new(), CancellationToken::new()), client)
}

#[tokio::test]
async fn missing_environment_releases_guard() {
    let store = Arc::new(MemoryStore::new());
    let (mut dispatcher, client) = dispatcher_with(&store, StaticPods::default(), BackoffConfig::default());
    let pending = store.apply_package(pkg("", Some(BuildStatus::Pending)));

    assert_eq!(dispatcher.handle(PackageEvent::Added(pending.clone())), Action::Build);
    dispatcher.drain().await;

    assert!(dispatcher.guard().is_empty());
    assert_eq!(store.package("default", "hello").unwrap().build_status(), Some(BuildStatus::Failed));
    assert_eq!(client.call_count(), 0);
    // the key is free again, so a fresh pending delivery is admitted
    assert_eq!(dispatcher.handle(PackageEvent::Added(pending)), Action::Build);
    dispatcher.drain().await;
}

#[tokio::test]
async fn non_finite_multiplier_still_times_out_as_failed() {
    let store = Arc::new(MemoryStore::new());
    store.insert_environment(Environment { meta: ResourceMeta::new("default", "python", ""), ..Default::default() });
    let backoff = BackoffConfig {
        initial_interval: Duration::from_millis(1),
        max_interval: Duration::from_millis(2),
        multiplier: f64::NAN,
        max_attempts: 5,
    };
    let (mut dispatcher, client) = dispatcher_with(&store, StaticPods::default(), backoff);
    let pending = store.apply_package(pkg("", Some(BuildStatus::Pending)));

    assert_eq!(dispatcher.handle(PackageEvent::Added(pending)), Action::Build);
    dispatcher.drain().await;

    let stored = store.package("default", "hello").unwrap();
    assert_eq!(stored.build_status(), Some(BuildStatus::Failed));
    assert_eq!(stored.status.build_log, pkgbuild_controller::orchestrator::BUILDER_TIMEOUT_LOG);
    assert!(dispatcher.guard().is_empty());
    assert_eq!(client.call_count(), 0);
}
