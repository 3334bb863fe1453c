//! Orchestrator backend against the in-memory orchestrator.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;
use std::sync::Arc;

use berth_backend::application::ports::{ContainerBackend, PortAllocator};
use berth_backend::application::services::backends::OrchestratorBackend;
use berth_backend::application::services::lifecycle::{start_proxy, stop_proxy};
use berth_backend::application::services::port_allocator::MemoryPortAllocator;
use berth_backend::application::services::recovery::{SameInstancePolicy, recover_proxies};
use berth_backend::domain::runtime_value::keys;
use berth_backend::domain::{
    ConfigError, ContainerSpec, ProvisionError, Proxy, ProxySpec, ProxyStartFailure,
    ProxyStartupLogBuilder, SpecError,
};
use berth_common::{KubernetesConfig, ProxyStatus};
use serde_json::json;

use crate::mocks::{FakeKube, INSTANCE_ID, catalog, container_spec, new_proxy, proxy_spec, user};

const CONFIG_MAP: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\ndata:\n  a: new\n";
const SECRET: &str = "apiVersion: v1\nkind: Secret\nmetadata:\n  name: creds\n";

struct Harness {
    kube: FakeKube,
    allocator: Arc<MemoryPortAllocator>,
    backend: OrchestratorBackend<FakeKube>,
}

fn harness(config: KubernetesConfig) -> Harness {
    let kube = FakeKube::default();
    let allocator = Arc::new(MemoryPortAllocator::new());
    let backend =
        OrchestratorBackend::new(kube.clone(), allocator.clone(), catalog(), config).unwrap();
    Harness {
        kube,
        allocator,
        backend,
    }
}

fn published() -> KubernetesConfig {
    KubernetesConfig {
        internal_networking: false,
        public_host: "apps.example.org".to_string(),
        ..KubernetesConfig::default()
    }
}

fn web() -> ContainerSpec {
    container_spec("jupyter/minimal", &[("default", 8888)])
}

async fn start(h: &Harness, proxy_id: &str, spec: &ProxySpec) -> Result<Proxy, ProxyStartFailure> {
    let user = user();
    let mut log = ProxyStartupLogBuilder::new();
    start_proxy(&h.backend, new_proxy(proxy_id, spec, &user), spec, &user, &mut log).await
}

fn keys_of(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

#[tokio::test]
async fn internal_pod_is_targeted_by_its_ip() {
    let h = harness(KubernetesConfig::default());
    let spec = proxy_spec(vec![web()]);
    let proxy = start(&h, "p1", &spec).await.unwrap();

    let target = &proxy.containers()[0].targets()["default"];
    assert_eq!(target.host(), Some("10.1.0.1"));
    assert_eq!(target.port_u16(), Some(8888));
    assert_eq!(proxy.containers()[0].id(), Some("uid-1"));

    let pod = h
        .kube
        .with(|s| s.pods.get(&("default".to_string(), "sp-pod-p1-0".to_string())).cloned())
        .unwrap();
    let labels = pod.metadata.labels.unwrap();
    assert_eq!(labels["berth.dev/sp-pod"], "sp-pod-p1-0");
    assert_eq!(labels["berth.dev/sp-proxy-id"], "p1");
    let annotations = pod.metadata.annotations.unwrap();
    assert_eq!(annotations["berth.dev/sp-container-index"], "0");
    assert_eq!(annotations["berth.dev/sp-backend-container-name"], "default/sp-pod-p1-0");
    let pod_spec = pod.spec.unwrap();
    assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));
    let env = pod_spec.containers[0].env.clone().unwrap();
    assert!(env.iter().any(|e| e.name == "APP_PROXY_ID" && e.value.as_deref() == Some("p1")));
    assert!(h.kube.with(|s| s.services.is_empty()));
}

#[tokio::test]
async fn published_pod_gets_node_port_service() {
    let h = harness(published());
    let spec = proxy_spec(vec![web()]);
    let proxy = start(&h, "p1", &spec).await.unwrap();

    let target = &proxy.containers()[0].targets()["default"];
    assert_eq!(target.host(), Some("apps.example.org"));
    assert_eq!(target.port_u16(), Some(30000));
    let service = h
        .kube
        .with(|s| s.services.get(&("default".to_string(), "sp-pod-p1-0".to_string())).cloned())
        .unwrap();
    let service_spec = service.spec.unwrap();
    assert_eq!(service_spec.type_.as_deref(), Some("NodePort"));
    assert_eq!(service_spec.ports.unwrap()[0].node_port, Some(30000));

    stop_proxy(&h.backend, &proxy).await.unwrap();
    assert!(h.kube.with(|s| s.pods.is_empty() && s.services.is_empty()));
    assert!(h.allocator.owned_ports("p1").await.unwrap().is_empty());
}

#[tokio::test]
async fn patches_apply_but_cannot_rename_the_pod() {
    let h = harness(KubernetesConfig {
        node_selector: Some("disk=ssd".to_string()),
        ..KubernetesConfig::default()
    });
    let mut spec = proxy_spec(vec![web()]);
    spec.kubernetes.pod_patches = Some(
        "- op: add\n  path: /spec/serviceAccountName\n  value: runner\n\
         - op: replace\n  path: /metadata/name\n  value: renamed\n"
            .to_string(),
    );
    start(&h, "p1", &spec).await.unwrap();

    let pod = h
        .kube
        .with(|s| s.pods.get(&("default".to_string(), "sp-pod-p1-0".to_string())).cloned())
        .unwrap();
    let pod_spec = pod.spec.unwrap();
    assert_eq!(pod_spec.service_account_name.as_deref(), Some("runner"));
    assert_eq!(pod_spec.node_selector.unwrap()["disk"], "ssd");
}

#[tokio::test(start_paused = true)]
async fn unschedulable_pod_reports_the_scheduler_reason() {
    let h = harness(KubernetesConfig {
        pod_wait_ms: 1_000,
        ..KubernetesConfig::default()
    });
    h.kube.with(|s| s.unschedulable = true);
    let spec = proxy_spec(vec![web()]);

    let failure = start(&h, "p1", &spec).await.unwrap_err();

    assert!(matches!(
        &failure.error.error,
        ProvisionError::Scheduling { reason, .. } if reason.contains("0/3 nodes")
    ));
    assert_eq!(failure.proxy.status(), ProxyStatus::Stopped);
    assert!(h.kube.with(|s| s.pods.is_empty()));
}

#[tokio::test]
async fn auxiliary_manifests_follow_the_proxy() {
    let h = harness(KubernetesConfig::default());
    let mut spec = proxy_spec(vec![web()]);
    spec.kubernetes.additional_manifests = vec![CONFIG_MAP.to_string()];
    spec.kubernetes.additional_persistent_manifests = vec![SECRET.to_string()];
    let proxy = start(&h, "p1", &spec).await.unwrap();

    assert_eq!(
        h.kube.manifest_keys(),
        keys_of(&["default/ConfigMap/settings", "default/Secret/creds"])
    );
    let tracked: Vec<String> = proxy.containers()[0]
        .runtime_values()
        .get_as(&keys::ADDITIONAL_MANIFESTS)
        .unwrap();
    assert_eq!(tracked, vec!["v1:ConfigMap:default:settings"]);
    let group_labelled = h.kube.with(|s| {
        s.manifests["default/ConfigMap/settings"]["metadata"]["labels"]
            .get("berth.dev/sp-manifest-group")
            .is_some()
    });
    assert!(group_labelled);

    stop_proxy(&h.backend, &proxy).await.unwrap();
    assert_eq!(h.kube.manifest_keys(), keys_of(&["default/Secret/creds"]));
}

#[tokio::test]
async fn manifests_created_before_a_failure_are_rolled_back() {
    let h = harness(KubernetesConfig::default());
    h.kube.with(|s| s.refuse_kind = Some("Secret".to_string()));
    let mut spec = proxy_spec(vec![web()]);
    spec.kubernetes.additional_manifests = vec![CONFIG_MAP.to_string(), SECRET.to_string()];

    let failure = start(&h, "p1", &spec).await.unwrap_err();

    assert!(matches!(&failure.error.error, ProvisionError::Create { object, .. } if object.contains("creds")));
    assert!(failure.cleanup.is_none());
    assert_eq!(failure.proxy.status(), ProxyStatus::Stopped);
    assert!(h.kube.manifest_keys().is_empty());
    assert!(h.kube.with(|s| s.pods.is_empty()));
}

#[tokio::test]
async fn unreadable_namespace_does_not_block_recovery() {
    let h = harness(published());
    let spec = proxy_spec(vec![web()]);
    start(&h, "p1", &spec).await.unwrap();
    h.kube.with(|s| s.broken_namespaces.insert("batch".to_string()));

    let fresh = Arc::new(MemoryPortAllocator::new());
    let restarted = OrchestratorBackend::new(
        h.kube.clone(),
        fresh.clone(),
        catalog(),
        KubernetesConfig {
            additional_namespaces: vec!["batch".to_string()],
            ..published()
        },
    )
    .unwrap();
    let report = recover_proxies(
        &restarted,
        fresh.as_ref(),
        &catalog(),
        &SameInstancePolicy::new(INSTANCE_ID),
    )
    .await
    .unwrap();

    assert_eq!(report.proxies.len(), 1);
    assert_eq!(
        fresh.owned_ports("p1").await.unwrap().into_iter().collect::<Vec<_>>(),
        vec![30000]
    );

    h.kube.with(|s| s.broken_namespaces.insert("default".to_string()));
    assert!(restarted.scan_existing_containers().await.is_err());
}

#[tokio::test]
async fn manifest_policies_are_honoured() {
    let h = harness(KubernetesConfig::default());
    h.kube.seed_manifest(
        "default",
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "settings" },
            "data": { "a": "old", "keep": "x" },
        }),
    );
    h.kube.seed_manifest(
        "default",
        json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "stale" } }),
    );
    let mut spec = proxy_spec(vec![web()]);
    spec.kubernetes.additional_manifests = vec![
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\n  annotations:\n    berth.dev/sp-manifest-policy: Patch\ndata:\n  a: new\n".to_string(),
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: stale\n  annotations:\n    berth.dev/sp-manifest-policy: Delete\n".to_string(),
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: odd\n  annotations:\n    berth.dev/sp-manifest-policy: Sometimes\n".to_string(),
    ];
    let proxy = start(&h, "p1", &spec).await.unwrap();

    assert_eq!(h.kube.manifest_keys(), keys_of(&["default/ConfigMap/settings"]));
    let data = h.kube.with(|s| s.manifests["default/ConfigMap/settings"]["data"].clone());
    assert_eq!(data, json!({ "a": "new", "keep": "x" }));
    assert_eq!(h.kube.with(|s| s.patched.clone()), vec!["default/ConfigMap/settings"]);
    let tracked: Vec<String> = proxy.containers()[0]
        .runtime_values()
        .get_as(&keys::ADDITIONAL_MANIFESTS)
        .unwrap();
    assert_eq!(tracked, vec!["v1:ConfigMap:default:settings"]);
}

#[tokio::test]
async fn manifest_group_cleanup_spares_foreign_objects() {
    let h = harness(KubernetesConfig::default());
    let mut spec = proxy_spec(vec![web()]);
    spec.kubernetes.additional_manifests = vec![CONFIG_MAP.to_string()];
    start(&h, "p1", &spec).await.unwrap();

    let other_user = berth_backend::domain::AuthenticatedUser::new("jill");
    assert_eq!(h.backend.cleanup_manifest_group(&spec, &other_user).await.unwrap(), 0);
    assert_eq!(h.kube.manifest_keys().len(), 1);

    assert_eq!(h.backend.cleanup_manifest_group(&spec, &user()).await.unwrap(), 1);
    assert!(h.kube.manifest_keys().is_empty());
}

#[tokio::test]
async fn running_pods_are_recovered_with_their_ip() {
    let h = harness(KubernetesConfig::default());
    let spec = proxy_spec(vec![web(), container_spec("sidecar", &[])]);
    start(&h, "p1", &spec).await.unwrap();

    let report = recover_proxies(
        &h.backend,
        h.allocator.as_ref(),
        &catalog(),
        &SameInstancePolicy::new(INSTANCE_ID),
    )
    .await
    .unwrap();

    assert!(report.skipped.is_empty());
    let proxy = &report.proxies[0];
    assert_eq!(proxy.containers().len(), 2);
    assert_eq!(proxy.spec_id(), "notebook");
    let target = &proxy.containers()[0].targets()["default"];
    assert_eq!(target.host(), Some("10.1.0.1"));
    assert_eq!(proxy.containers()[1].id(), Some("uid-2"));
}

#[test]
fn malformed_spec_content_is_rejected_up_front() {
    let mut spec = proxy_spec(vec![web()]);
    spec.kubernetes.additional_manifests = vec!["apiVersion: v1\nkind: ConfigMap\n".to_string()];
    assert!(matches!(
        OrchestratorBackend::<FakeKube>::validate_spec(&spec),
        Err(SpecError::InvalidManifest(_))
    ));

    let mut spec = proxy_spec(vec![web()]);
    spec.kubernetes.pod_patches = Some("op: add".to_string());
    assert!(matches!(
        OrchestratorBackend::<FakeKube>::validate_spec(&spec),
        Err(SpecError::InvalidPatch(_))
    ));
}

#[test]
fn malformed_node_selector_is_a_config_error() {
    let result = OrchestratorBackend::new(
        FakeKube::default(),
        Arc::new(MemoryPortAllocator::new()),
        catalog(),
        KubernetesConfig {
            node_selector: Some("disk".to_string()),
            ..KubernetesConfig::default()
        },
    );
    assert!(matches!(result, Err(ConfigError::NodeSelector(_))));
}
