//! Shared in-memory substrate doubles and fixtures for unit tests.
//!
//! Every fake keeps its state behind an `Arc<Mutex<..>>` and derives
//! `Clone`, so a test can hand one clone to a backend and keep another to
//! inspect or mutate what the backend sees.

#![allow(clippy::expect_used)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use berth_backend::application::ports::{
    ClusterService, EngineApi, EngineContainer, EngineContainerRequest, KubeApi, LeaseStore,
    LogStream, ServiceRequest, ServiceTask, SwarmApi,
};
use berth_backend::application::services::lifecycle;
use berth_backend::application::services::metadata::ProxyValueInputs;
use berth_backend::domain::{
    AuthenticatedUser, ContainerSpec, PortMappingSpec, ProxyBuilder, ProxySpec,
    RuntimeValueCatalog,
};
use chrono::{TimeZone, Utc};
use futures::{StreamExt, stream};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus, Service};
use serde_json::Value;

// ── Fixtures ──────────────────────────────────────────────────────────────────

pub const INSTANCE_ID: &str = "instance-a";

pub fn catalog() -> Arc<RuntimeValueCatalog> {
    Arc::new(RuntimeValueCatalog::standard().expect("standard catalog"))
}

pub fn user() -> AuthenticatedUser {
    AuthenticatedUser::new("jack").with_groups(["scientists", "admins"])
}

pub fn container_spec(image: &str, ports: &[(&str, u16)]) -> ContainerSpec {
    ContainerSpec {
        image: image.to_string(),
        port_mappings: ports
            .iter()
            .map(|(name, port)| PortMappingSpec {
                name: (*name).to_string(),
                port: *port,
                target_path: None,
            })
            .collect(),
        ..ContainerSpec::default()
    }
}

pub fn proxy_spec(containers: Vec<ContainerSpec>) -> ProxySpec {
    ProxySpec {
        id: "notebook".to_string(),
        display_name: Some("Notebook".to_string()),
        container_specs: containers,
        heartbeat_timeout: Some(60_000),
        ..ProxySpec::default()
    }
}

/// A new proxy carrying its proxy-wide runtime values.
pub fn new_proxy(proxy_id: &str, spec: &ProxySpec, user: &AuthenticatedUser) -> ProxyBuilder {
    lifecycle::new_proxy(ProxyValueInputs {
        proxy_id,
        spec,
        user,
        deployment_instance_id: INSTANCE_ID,
        realm_id: None,
        created: Utc
            .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("valid instant"),
        parameters: &[],
        http_headers: None,
    })
    .expect("proxy values")
}

fn lines(prefix: &str) -> LogStream {
    let lines = vec![
        Ok(format!("{prefix}: booting")),
        Ok(format!("{prefix}: listening")),
    ];
    stream::iter(lines).boxed()
}

fn matches_label(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    match selector.split_once('=') {
        Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
        None => labels.contains_key(selector),
    }
}

// ── Container engine ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct EngineState {
    pub containers: Vec<EngineContainer>,
    pub requests: Vec<EngineContainerRequest>,
    pub pulled: Vec<String>,
    pub removed: Vec<String>,
    /// Creation fails for this image.
    pub refuse_image: Option<String>,
    /// Containers stay in `created` after start.
    pub never_running: bool,
    pub fail_removals: bool,
    next_id: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<EngineState>>,
}

impl FakeEngine {
    pub fn with<T>(&self, f: impl FnOnce(&mut EngineState) -> T) -> T {
        f(&mut self.state.lock().expect("lock"))
    }

    pub fn seed(&self, container: EngineContainer) {
        self.with(|s| s.containers.push(container));
    }
}

#[async_trait]
impl EngineApi for FakeEngine {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.with(|s| s.pulled.iter().any(|i| i == image)))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.with(|s| s.pulled.push(image.to_string()));
        Ok(())
    }

    async fn create_container(&self, request: &EngineContainerRequest) -> Result<String> {
        self.with(|s| {
            s.requests.push(request.clone());
            if s.refuse_image.as_deref() == Some(request.image.as_str()) {
                bail!("engine refused to create {}", request.name);
            }
            s.next_id += 1;
            let id = format!("{:0>64}", s.next_id);
            s.containers.push(EngineContainer {
                id: id.clone(),
                name: request.name.clone(),
                image: request.image.clone(),
                state: "created".to_string(),
                labels: request.labels.clone(),
                port_bindings: request.port_bindings.clone(),
                ip_address: Some(format!("172.17.0.{}", s.next_id + 1)),
            });
            Ok(id)
        })
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.with(|s| {
            let never_running = s.never_running;
            let Some(container) = s.containers.iter_mut().find(|c| c.id == id) else {
                bail!("no such container {id}");
            };
            if !never_running {
                container.state = "running".to_string();
            }
            Ok(())
        })
    }

    async fn connect_network(&self, _: &str, _: &str) -> Result<()> {
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<EngineContainer>> {
        Ok(self.with(|s| {
            s.containers
                .iter()
                .find(|c| c.id == id || c.name == id)
                .cloned()
        }))
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<EngineContainer>> {
        Ok(self.with(|s| {
            s.containers
                .iter()
                .filter(|c| matches_label(&c.labels, label))
                .cloned()
                .collect()
        }))
    }

    async fn remove_container(&self, id: &str) -> Result<bool> {
        self.with(|s| {
            if s.fail_removals {
                bail!("engine is unavailable");
            }
            s.removed.push(id.to_string());
            let before = s.containers.len();
            s.containers.retain(|c| c.id != id && c.name != id);
            Ok(s.containers.len() < before)
        })
    }

    fn container_logs(&self, id: &str) -> LogStream {
        lines(id)
    }
}

// ── Engine cluster ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SwarmState {
    pub services: Vec<(ClusterService, Vec<ServiceTask>)>,
    pub requests: Vec<ServiceRequest>,
    pub removed: Vec<String>,
    /// Secret name → id.
    pub secrets: BTreeMap<String, String>,
    /// Created services never get a task.
    pub no_tasks: bool,
    /// Task listing fails for these service ids.
    pub broken_services: BTreeSet<String>,
    next_id: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FakeSwarm {
    state: Arc<Mutex<SwarmState>>,
}

impl FakeSwarm {
    pub fn with<T>(&self, f: impl FnOnce(&mut SwarmState) -> T) -> T {
        f(&mut self.state.lock().expect("lock"))
    }

    pub fn seed(&self, service: ClusterService, tasks: Vec<ServiceTask>) {
        self.with(|s| s.services.push((service, tasks)));
    }
}

pub fn running_task(container_id: &str) -> ServiceTask {
    ServiceTask {
        state: "running".to_string(),
        container_id: Some(container_id.to_string()),
        error: None,
    }
}

#[async_trait]
impl SwarmApi for FakeSwarm {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn find_secret(&self, name: &str) -> Result<Option<String>> {
        Ok(self.with(|s| s.secrets.get(name).cloned()))
    }

    async fn create_service(&self, request: &ServiceRequest) -> Result<String> {
        Ok(self.with(|s| {
            s.requests.push(request.clone());
            s.next_id += 1;
            let id = format!("svc-{}", s.next_id);
            let tasks = if s.no_tasks {
                Vec::new()
            } else {
                vec![running_task(&format!("task{:0>60}", s.next_id))]
            };
            s.services.push((
                ClusterService {
                    id: id.clone(),
                    name: request.name.clone(),
                    image: request.image.clone(),
                    labels: request.labels.clone(),
                    published_ports: request.published_ports.clone(),
                },
                tasks,
            ));
            id
        }))
    }

    async fn service_tasks(&self, service: &str) -> Result<Vec<ServiceTask>> {
        self.with(|s| {
            if s.broken_services.contains(service) {
                bail!("task listing failed for {service}");
            }
            Ok(s.services
                .iter()
                .find(|(svc, _)| svc.id == service || svc.name == service)
                .map(|(_, tasks)| tasks.clone())
                .unwrap_or_default())
        })
    }

    async fn list_services(&self, label: &str) -> Result<Vec<ClusterService>> {
        Ok(self.with(|s| {
            s.services
                .iter()
                .filter(|(svc, _)| matches_label(&svc.labels, label))
                .map(|(svc, _)| svc.clone())
                .collect()
        }))
    }

    async fn remove_service(&self, service: &str) -> Result<bool> {
        Ok(self.with(|s| {
            s.removed.push(service.to_string());
            let before = s.services.len();
            s.services
                .retain(|(svc, _)| svc.id != service && svc.name != service);
            s.services.len() < before
        }))
    }

    fn container_logs(&self, container_id: &str) -> LogStream {
        lines(container_id)
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct KubeState {
    /// `(namespace, name)` → pod.
    pub pods: BTreeMap<(String, String), Pod>,
    pub services: BTreeMap<(String, String), Service>,
    /// `namespace/kind/name` → manifest.
    pub manifests: BTreeMap<String, Value>,
    pub patched: Vec<String>,
    /// New pods stay pending with an unschedulable condition.
    pub unschedulable: bool,
    /// Creating a manifest of this kind fails.
    pub refuse_kind: Option<String>,
    /// Listing pods fails in these namespaces.
    pub broken_namespaces: BTreeSet<String>,
    next_uid: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FakeKube {
    state: Arc<Mutex<KubeState>>,
}

impl FakeKube {
    pub fn with<T>(&self, f: impl FnOnce(&mut KubeState) -> T) -> T {
        f(&mut self.state.lock().expect("lock"))
    }

    pub fn manifest_keys(&self) -> BTreeSet<String> {
        self.with(|s| s.manifests.keys().cloned().collect())
    }

    pub fn seed_manifest(&self, namespace: &str, manifest: Value) {
        let key = manifest_key(namespace, &manifest);
        self.with(|s| s.manifests.insert(key, manifest));
    }
}

pub fn manifest_key(namespace: &str, manifest: &Value) -> String {
    let field = |pointer: &str| {
        manifest
            .pointer(pointer)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    format!("{namespace}/{}/{}", field("/kind"), field("/metadata/name"))
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

fn pod_status(unschedulable: bool, ip: String) -> PodStatus {
    if unschedulable {
        return PodStatus {
            phase: Some("Pending".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "PodScheduled".to_string(),
                status: "False".to_string(),
                reason: Some("Unschedulable".to_string()),
                message: Some("0/3 nodes are available".to_string()),
                ..PodCondition::default()
            }]),
            ..PodStatus::default()
        };
    }
    PodStatus {
        phase: Some("Running".to_string()),
        pod_ip: Some(ip),
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..PodCondition::default()
        }]),
        ..PodStatus::default()
    }
}

#[async_trait]
impl KubeApi for FakeKube {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        self.with(|s| {
            let name = pod.metadata.name.clone().unwrap_or_default();
            if s.pods.contains_key(&key(namespace, &name)) {
                bail!("pod {namespace}/{name} already exists");
            }
            s.next_uid += 1;
            let mut created = pod.clone();
            created.metadata.uid = Some(format!("uid-{}", s.next_uid));
            created.status = Some(pod_status(
                s.unschedulable,
                format!("10.1.0.{}", s.next_uid),
            ));
            s.pods.insert(key(namespace, &name), created.clone());
            Ok(created)
        })
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.with(|s| s.pods.get(&key(namespace, name)).cloned()))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        self.with(|s| {
            if s.broken_namespaces.contains(namespace) {
                bail!("pods in {namespace} are forbidden");
            }
            Ok(s.pods
                .iter()
                .filter(|((ns, _), pod)| {
                    ns == namespace
                        && pod
                            .metadata
                            .labels
                            .as_ref()
                            .is_some_and(|l| matches_label(l, label_selector))
                })
                .map(|(_, pod)| pod.clone())
                .collect())
        })
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self.with(|s| s.pods.remove(&key(namespace, name)).is_some()))
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        self.with(|s| {
            let name = service.metadata.name.clone().unwrap_or_default();
            s.services.insert(key(namespace, &name), service.clone());
            Ok(service.clone())
        })
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.with(|s| s.services.get(&key(namespace, name)).cloned()))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self.with(|s| s.services.remove(&key(namespace, name)).is_some()))
    }

    async fn get_manifest(&self, namespace: &str, manifest: &Value) -> Result<Option<Value>> {
        let key = manifest_key(namespace, manifest);
        Ok(self.with(|s| s.manifests.get(&key).cloned()))
    }

    async fn create_manifest(&self, namespace: &str, manifest: &Value) -> Result<()> {
        let key = manifest_key(namespace, manifest);
        self.with(|s| {
            if s.refuse_kind.as_deref() == manifest.get("kind").and_then(Value::as_str) {
                bail!("admission denied for {key}");
            }
            if s.manifests.contains_key(&key) {
                bail!("{key} already exists");
            }
            s.manifests.insert(key, manifest.clone());
            Ok(())
        })
    }

    async fn patch_manifest(&self, namespace: &str, manifest: &Value) -> Result<()> {
        let key = manifest_key(namespace, manifest);
        self.with(|s| {
            let Some(live) = s.manifests.get_mut(&key) else {
                bail!("{key} not found");
            };
            json_patch::merge(live, manifest);
            s.patched.push(key);
            Ok(())
        })
    }

    async fn delete_manifest(&self, namespace: &str, manifest: &Value) -> Result<bool> {
        let key = manifest_key(namespace, manifest);
        Ok(self.with(|s| s.manifests.remove(&key).is_some()))
    }

    fn pod_logs(&self, namespace: &str, name: &str) -> LogStream {
        lines(&format!("{namespace}/{name}"))
    }
}

// ── Lease store ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LeaseState {
    pub leases: BTreeMap<u16, String>,
    /// Another process that claims this port just before our next claim.
    pub rival: Option<(u16, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeLeaseStore {
    state: Arc<Mutex<LeaseState>>,
}

impl FakeLeaseStore {
    pub fn with<T>(&self, f: impl FnOnce(&mut LeaseState) -> T) -> T {
        f(&mut self.state.lock().expect("lock"))
    }
}

#[async_trait]
impl LeaseStore for FakeLeaseStore {
    async fn leases(&self) -> Result<BTreeMap<u16, String>> {
        Ok(self.with(|s| s.leases.clone()))
    }

    async fn try_claim(&self, port: u16, owner_id: &str) -> Result<bool> {
        Ok(self.with(|s| {
            if let Some((rival_port, rival)) = s.rival.take() {
                s.leases.entry(rival_port).or_insert(rival);
            }
            if s.leases.contains_key(&port) {
                return false;
            }
            s.leases.insert(port, owner_id.to_string());
            true
        }))
    }

    async fn claim(&self, port: u16, owner_id: &str) -> Result<()> {
        self.with(|s| s.leases.insert(port, owner_id.to_string()));
        Ok(())
    }

    async fn release_owner(&self, owner_id: &str) -> Result<usize> {
        Ok(self.with(|s| {
            let before = s.leases.len();
            s.leases.retain(|_, owner| owner != owner_id);
            before - s.leases.len()
        }))
    }
}
