#![forbid(unsafe_code)]

use pkgbuild_core::{BuilderPod, BuilderPodIndex, ContainerReadiness, PodEvent};
use pkgbuild_store::spawn_ingest;

fn pod(ns: &str, name: &str, ready: bool) -> BuilderPod {
    BuilderPod {
        namespace: ns.to_string(),
        name: name.to_string(),
        labels: smallvec::smallvec![("envName".to_string(), "python".to_string())],
        containers: smallvec::smallvec![ContainerReadiness { name: "builder".into(), ready }],
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replay_applies_updates_deletes_and_restarts() {
    let (tx, store) = spawn_ingest(64);
    tx.send(PodEvent::Applied(pod("builders", "py-1", false))).await.unwrap();
    tx.send(PodEvent::Applied(pod("builders", "node-1", true))).await.unwrap();
    tx.send(PodEvent::Applied(pod("other", "go-1", true))).await.unwrap();
    // readiness flips on a later delivery of the same pod
    tx.send(PodEvent::Applied(pod("builders", "py-1", true))).await.unwrap();
    tx.send(PodEvent::Deleted(pod("builders", "node-1", true))).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    let listed = store.list("builders");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "py-1");
    assert!(listed[0].is_ready());
    assert_eq!(store.list("other").len(), 1);
    assert!(store.list("missing").is_empty());

    tx.send(PodEvent::Restarted { namespace: "other".into(), pods: vec![pod("other", "go-2", false)] }).await.unwrap();
    drop(tx);
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    let other = store.list("other");
    assert_eq!(other.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(), vec!["go-2"]);
    assert_eq!(store.list("builders").len(), 1);
    assert!(*store.subscribe_epoch().borrow() >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn burst_beyond_capacity_loses_no_pod() {
    let (tx, store) = spawn_ingest(2);
    for n in 0..7 {
        tx.send(PodEvent::Applied(pod("builders", &format!("py-{}", n), true))).await.unwrap();
    }
    tx.send(PodEvent::Deleted(pod("builders", "py-0", true))).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    let names: Vec<String> = store.list("builders").into_iter().map(|p| p.name).collect();
    assert_eq!(names, (1..7).map(|n| format!("py-{}", n)).collect::<Vec<_>>());
}
