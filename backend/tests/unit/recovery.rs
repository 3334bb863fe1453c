//! Recovery of proxies left behind by an earlier process.
//!
//! Each test starts proxies through one backend, then recovers through a
//! second backend and allocator over the same engine, the way a restarted
//! control plane would.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::Arc;

use berth_backend::application::ports::{EngineContainer, PortAllocator};
use berth_backend::application::services::backends::EngineBackend;
use berth_backend::application::services::lifecycle::start_proxy;
use berth_backend::application::services::port_allocator::MemoryPortAllocator;
use berth_backend::application::services::recovery::{
    RecoveryReport, SameInstancePolicy, SkipReason, recover_proxies,
};
use berth_backend::domain::{Proxy, ProxyStartupLogBuilder};
use berth_common::{DockerEngineConfig, ProxyStatus};

use crate::mocks::{FakeEngine, INSTANCE_ID, catalog, container_spec, new_proxy, proxy_spec, user};

fn backend(engine: &FakeEngine, allocator: Arc<MemoryPortAllocator>) -> EngineBackend<FakeEngine> {
    EngineBackend::new(
        engine.clone(),
        allocator,
        catalog(),
        DockerEngineConfig::default(),
    )
}

async fn start(engine: &FakeEngine, proxy_id: &str, containers: usize) -> Proxy {
    let backend = backend(engine, Arc::new(MemoryPortAllocator::new()));
    let spec = proxy_spec(
        (0..containers)
            .map(|_| container_spec("jupyter/minimal", &[("default", 8888)]))
            .collect(),
    );
    let user = user();
    let mut log = ProxyStartupLogBuilder::new();
    start_proxy(&backend, new_proxy(proxy_id, &spec, &user), &spec, &user, &mut log)
        .await
        .unwrap()
}

async fn recover(
    engine: &FakeEngine,
    allocator: &Arc<MemoryPortAllocator>,
    instance: &str,
) -> RecoveryReport {
    let restarted = backend(engine, allocator.clone());
    recover_proxies(
        &restarted,
        allocator.as_ref(),
        &catalog(),
        &SameInstancePolicy::new(instance),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn own_proxies_are_adopted_with_their_ports() {
    let engine = FakeEngine::default();
    let original = start(&engine, "p1", 2).await;

    let allocator = Arc::new(MemoryPortAllocator::new());
    let report = recover(&engine, &allocator, INSTANCE_ID).await;

    assert!(report.skipped.is_empty());
    assert_eq!(report.proxies.len(), 1);
    let proxy = &report.proxies[0];
    assert_eq!(proxy.id(), "p1");
    assert_eq!(proxy.status(), ProxyStatus::Up);
    assert_eq!(proxy.user_id(), "jack");
    assert_eq!(proxy.spec_id(), "notebook");
    assert_eq!(proxy.display_name(), Some("Notebook"));
    assert_eq!(proxy.created_at(), original.created_at());
    assert_eq!(proxy.deployment_instance_id().as_deref(), Some(INSTANCE_ID));
    assert_eq!(proxy.containers().len(), 2);
    for (recovered, started) in proxy.containers().iter().zip(original.containers()) {
        assert_eq!(recovered.index(), started.index());
        assert_eq!(recovered.id(), started.id());
        assert_eq!(recovered.targets(), started.targets());
    }
    assert_eq!(
        allocator.owned_ports("p1").await.unwrap().into_iter().collect::<Vec<_>>(),
        vec![20000, 20001]
    );
}

#[tokio::test]
async fn containers_of_other_instances_are_left_alone() {
    let engine = FakeEngine::default();
    start(&engine, "p1", 1).await;

    let allocator = Arc::new(MemoryPortAllocator::new());
    let report = recover(&engine, &allocator, "instance-b").await;

    assert!(report.proxies.is_empty());
    assert!(matches!(
        &report.skipped[0].reason,
        SkipReason::InstanceMismatch { found } if found == INSTANCE_ID
    ));
    assert_eq!(engine.with(|s| s.containers.len()), 1);
    assert!(engine.with(|s| s.removed.is_empty()));
    assert!(allocator.owned_ports("p1").await.unwrap().is_empty());
}

/// A managed container that carries little more than its proxy id.
fn orphan() -> EngineContainer {
    EngineContainer {
        id: "orphan".to_string(),
        name: "orphan".to_string(),
        image: "busybox".to_string(),
        state: "running".to_string(),
        labels: BTreeMap::from([
            ("berth.dev/sp-proxied-app".to_string(), "true".to_string()),
            ("berth.dev/sp-proxy-id".to_string(), "p9".to_string()),
        ]),
        ..EngineContainer::default()
    }
}

#[tokio::test]
async fn containers_missing_required_keys_are_skipped() {
    let engine = FakeEngine::default();
    engine.seed(orphan());

    let allocator = Arc::new(MemoryPortAllocator::new());
    let report = recover(&engine, &allocator, INSTANCE_ID).await;

    assert!(report.proxies.is_empty());
    let SkipReason::MissingKeys(missing) = &report.skipped[0].reason else {
        panic!("unexpected reason {:?}", report.skipped[0].reason);
    };
    assert!(missing.contains(&"container-index".to_string()));
    assert!(missing.contains(&"deployment-instance-id".to_string()));
    assert!(!missing.contains(&"proxy-id".to_string()));
}

#[tokio::test]
async fn unparseable_metadata_is_skipped() {
    let engine = FakeEngine::default();
    start(&engine, "p1", 1).await;
    engine.with(|s| {
        s.containers[0]
            .labels
            .insert("berth.dev/sp-container-index".to_string(), "first".to_string());
    });

    let allocator = Arc::new(MemoryPortAllocator::new());
    let report = recover(&engine, &allocator, INSTANCE_ID).await;

    assert!(report.proxies.is_empty());
    assert!(matches!(
        &report.skipped[0].reason,
        SkipReason::MalformedMetadata(keys) if keys == &vec!["container-index".to_string()]
    ));
}

#[tokio::test]
async fn port_held_by_someone_else_blocks_adoption() {
    let engine = FakeEngine::default();
    start(&engine, "p1", 1).await;

    let allocator = Arc::new(MemoryPortAllocator::new());
    allocator.add_existing_port("p2", 20000).await.unwrap();
    let report = recover(&engine, &allocator, INSTANCE_ID).await;

    assert!(report.proxies.is_empty());
    assert!(matches!(
        report.skipped[0].reason,
        SkipReason::PortReconciliation(_)
    ));
}

#[tokio::test]
async fn one_bad_container_does_not_block_the_rest() {
    let engine = FakeEngine::default();
    start(&engine, "p1", 1).await;
    start(&engine, "p2", 1).await;
    engine.with(|s| {
        s.containers[0]
            .labels
            .remove("berth.dev/sp-created-timestamp");
    });

    let allocator = Arc::new(MemoryPortAllocator::new());
    let report = recover(&engine, &allocator, INSTANCE_ID).await;

    assert_eq!(report.proxies.len(), 1);
    assert_eq!(report.proxies[0].id(), "p2");
    assert_eq!(report.skipped.len(), 1);
}

#[tokio::test]
async fn only_complete_containers_of_this_instance_are_adopted() {
    let engine = FakeEngine::default();
    start(&engine, "p1", 1).await;
    engine.seed(orphan());
    start(&engine, "p2", 1).await;
    engine.with(|s| {
        let foreign = s.containers.iter_mut().find(|c| c.name == "sp-p2-0").unwrap();
        foreign.labels.insert(
            "berth.dev/sp-deployment-instance-id".to_string(),
            "instance-b".to_string(),
        );
    });

    let allocator = Arc::new(MemoryPortAllocator::new());
    let report = recover(&engine, &allocator, INSTANCE_ID).await;

    assert_eq!(report.proxies.len(), 1);
    assert_eq!(report.proxies[0].id(), "p1");
    assert_eq!(
        allocator.owned_ports("p1").await.unwrap().into_iter().collect::<Vec<_>>(),
        vec![20000]
    );
    assert_eq!(report.skipped.len(), 2);
    assert!(matches!(report.skipped[0].reason, SkipReason::MissingKeys(_)));
    assert!(matches!(
        &report.skipped[1].reason,
        SkipReason::InstanceMismatch { found } if found == "instance-b"
    ));
    assert!(allocator.owned_ports("p2").await.unwrap().is_empty());
    assert!(allocator.owned_ports("p9").await.unwrap().is_empty());
    assert_eq!(engine.with(|s| s.containers.len()), 3);
    assert!(engine.with(|s| s.removed.is_empty()));
}

#[tokio::test]
async fn conflicting_port_releases_the_ports_already_reclaimed() {
    let engine = FakeEngine::default();
    start(&engine, "p1", 2).await;

    let allocator = Arc::new(MemoryPortAllocator::new());
    allocator.add_existing_port("other", 20001).await.unwrap();
    let report = recover(&engine, &allocator, INSTANCE_ID).await;

    assert!(report.proxies.is_empty());
    assert_eq!(report.skipped.len(), 2);
    assert!(
        report
            .skipped
            .iter()
            .all(|s| matches!(s.reason, SkipReason::PortReconciliation(_)))
    );
    assert!(allocator.owned_ports("p1").await.unwrap().is_empty());
    assert_eq!(
        allocator.owned_ports("other").await.unwrap().into_iter().collect::<Vec<_>>(),
        vec![20001]
    );
}

#[tokio::test]
async fn proxy_with_a_rejected_container_is_not_half_adopted() {
    let engine = FakeEngine::default();
    start(&engine, "p1", 2).await;
    engine.with(|s| {
        let second = s.containers.iter_mut().find(|c| c.name == "sp-p1-1").unwrap();
        second
            .labels
            .insert("berth.dev/sp-container-index".to_string(), "second".to_string());
    });

    let allocator = Arc::new(MemoryPortAllocator::new());
    let report = recover(&engine, &allocator, INSTANCE_ID).await;

    assert!(report.proxies.is_empty());
    assert_eq!(report.skipped.len(), 2);
    assert!(matches!(report.skipped[0].reason, SkipReason::MalformedMetadata(_)));
    assert!(matches!(
        &report.skipped[1].reason,
        SkipReason::IncompleteProxy { proxy_id } if proxy_id == "p1"
    ));
    assert!(allocator.owned_ports("p1").await.unwrap().is_empty());
}
