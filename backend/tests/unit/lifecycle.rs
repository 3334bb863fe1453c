//! Whole-proxy start and stop, including rollback of partial starts.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use berth_backend::application::ports::PortAllocator;
use berth_backend::application::services::backends::EngineBackend;
use berth_backend::application::services::lifecycle::start_proxy;
use berth_backend::application::services::port_allocator::MemoryPortAllocator;
use berth_backend::domain::runtime_value::keys;
use berth_backend::domain::{ProvisionError, ProxyStartupLogBuilder, StepState};
use berth_common::{DockerEngineConfig, ProxyStatus, StartupStepKind};
use chrono::{TimeZone, Utc};

use crate::mocks::{FakeEngine, INSTANCE_ID, catalog, container_spec, new_proxy, proxy_spec, user};

fn backend(engine: &FakeEngine, allocator: &Arc<MemoryPortAllocator>) -> EngineBackend<FakeEngine> {
    EngineBackend::new(
        engine.clone(),
        allocator.clone(),
        catalog(),
        DockerEngineConfig::default(),
    )
}

#[test]
fn new_proxy_carries_proxy_wide_values() {
    let spec = proxy_spec(vec![container_spec("jupyter/minimal", &[])]);
    let proxy = new_proxy("p1", &spec, &user()).build();

    assert_eq!(proxy.id(), "p1");
    assert_eq!(proxy.status(), ProxyStatus::New);
    assert_eq!(proxy.user_id(), "jack");
    assert_eq!(proxy.spec_id(), "notebook");
    assert_eq!(
        proxy.created_at(),
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single()
    );
    assert!(proxy.containers().is_empty());

    let values = proxy.runtime_values();
    assert_eq!(proxy.deployment_instance_id().as_deref(), Some(INSTANCE_ID));
    assert!(values.get_as::<bool>(&keys::PROXIED_APP).unwrap());
    assert_eq!(
        values.get_as::<Vec<String>>(&keys::USER_GROUPS).unwrap(),
        vec!["scientists", "admins"]
    );
    assert_eq!(values.get_as::<i64>(&keys::HEARTBEAT_TIMEOUT).unwrap(), 60_000);
    assert!(!values.contains(&keys::REALM_ID));
    assert!(!values.contains(&keys::PARAMETER_NAMES));
}

#[tokio::test]
async fn containers_start_in_declaration_order() {
    let engine = FakeEngine::default();
    let allocator = Arc::new(MemoryPortAllocator::new());
    let backend = backend(&engine, &allocator);
    let spec = proxy_spec(vec![
        container_spec("db", &[]),
        container_spec("app", &[("default", 8080)]),
    ]);
    let user = user();
    let mut log = ProxyStartupLogBuilder::new();

    let proxy = start_proxy(&backend, new_proxy("p1", &spec, &user), &spec, &user, &mut log)
        .await
        .unwrap();

    assert_eq!(proxy.status(), ProxyStatus::Up);
    assert!(proxy.started_at().is_some());
    let names: Vec<String> = engine.with(|s| s.requests.iter().map(|r| r.name.clone()).collect());
    assert_eq!(names, vec!["sp-p1-0", "sp-p1-1"]);
    assert!(proxy.containers()[0].targets().is_empty());
    assert_eq!(
        proxy.containers()[1].targets()["default"].port_u16(),
        Some(20000)
    );
}

#[tokio::test]
async fn failing_container_rolls_back_the_ones_before_it() {
    let engine = FakeEngine::default();
    engine.with(|s| s.refuse_image = Some("broken".to_string()));
    let allocator = Arc::new(MemoryPortAllocator::new());
    let backend = backend(&engine, &allocator);
    let spec = proxy_spec(vec![
        container_spec("jupyter/minimal", &[("default", 8888)]),
        container_spec("broken", &[("default", 9000)]),
    ]);
    let user = user();
    let mut log = ProxyStartupLogBuilder::new();

    let failure = start_proxy(&backend, new_proxy("p1", &spec, &user), &spec, &user, &mut log)
        .await
        .unwrap_err();

    assert_eq!(failure.error.container.index(), 1);
    assert!(matches!(
        failure.error.error,
        ProvisionError::Create { .. }
    ));
    assert!(failure.cleanup.is_none());
    assert_eq!(failure.proxy.status(), ProxyStatus::Stopped);
    assert!(engine.with(|s| s.containers.is_empty()));
    assert!(allocator.owned_ports("p1").await.unwrap().is_empty());
    assert!(matches!(
        log.build().step(1, StartupStepKind::StartContainer),
        StepState::Failed { .. }
    ));
}

#[tokio::test]
async fn failed_rollback_leaves_the_proxy_stopping() {
    let engine = FakeEngine::default();
    engine.with(|s| s.refuse_image = Some("broken".to_string()));
    let allocator = Arc::new(MemoryPortAllocator::new());
    let backend = backend(&engine, &allocator);
    let spec = proxy_spec(vec![
        container_spec("jupyter/minimal", &[("default", 8888)]),
        container_spec("broken", &[]),
    ]);
    let user = user();
    let mut log = ProxyStartupLogBuilder::new();
    engine.with(|s| s.fail_removals = true);

    let failure = start_proxy(&backend, new_proxy("p1", &spec, &user), &spec, &user, &mut log)
        .await
        .unwrap_err();

    assert!(failure.cleanup.is_some());
    assert_eq!(failure.proxy.status(), ProxyStatus::Stopping);
    assert_eq!(engine.with(|s| s.containers.len()), 1);
    assert_eq!(
        allocator.owned_ports("p1").await.unwrap().into_iter().collect::<Vec<_>>(),
        vec![20000]
    );
}
