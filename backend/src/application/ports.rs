//! Port trait definitions for the Application layer.
//!
//! Ports are the interfaces (contracts) that infrastructure must fulfill.
//! This file imports only from `crate::domain` and `berth_common`, never
//! from `crate::infra`.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use async_trait::async_trait;
use berth_common::BackendKind;
use futures::stream::BoxStream;
use http::Uri;
use k8s_openapi::api::core::v1::{Pod, Service};

use crate::domain::{
    AuthenticatedUser, Container, ContainerBuilder, ContainerSpec, ExistingContainerInfo,
    PortAllocationError, PortMappingSpec, ProvisionError, Proxy, ProxySpec,
    ProxyStartupLogBuilder, StartFailure, TeardownError,
};

/// Merged line stream of a proxy's container output.
pub type LogStream = BoxStream<'static, Result<String>>;

// ── Backend contract ──────────────────────────────────────────────────────────

/// Proxy-level inputs shared by every container start of one proxy.
#[derive(Debug, Clone, Copy)]
pub struct StartContext<'a> {
    pub user: &'a AuthenticatedUser,
    pub proxy: &'a Proxy,
    pub proxy_spec: &'a ProxySpec,
}

/// Operations every backend implements.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Check connectivity and prerequisites once at startup.
    async fn initialize(&self) -> Result<(), ProvisionError>;

    /// Provision one declared container.
    ///
    /// On failure the returned [`StartFailure`] carries the partial container
    /// so the caller can tear down what was created.
    async fn start_container(
        &self,
        ctx: StartContext<'_>,
        container: ContainerBuilder,
        spec: &ContainerSpec,
        log: &mut ProxyStartupLogBuilder,
    ) -> Result<Container, StartFailure>;

    /// Delete every backend object of `proxy`, then release its ports.
    /// Objects that are already absent count as removed.
    async fn stop_proxy(&self, proxy: &Proxy) -> Result<(), TeardownError>;

    /// List objects that carry the managed-object marker.
    async fn scan_existing_containers(&self) -> Result<Vec<ExistingContainerInfo>>;

    /// Target URI for one port mapping of a provisioned container.
    /// `host_port` is the published port, if any.
    fn calculate_target(
        &self,
        container: &Container,
        mapping: &PortMappingSpec,
        host_port: Option<u16>,
    ) -> Result<Uri, ProvisionError>;

    /// Output of every container of the proxy, or `None` if the backend
    /// cannot attach.
    async fn attach_output(&self, proxy: &Proxy) -> Result<Option<LogStream>>;
}

// ── Port leasing ──────────────────────────────────────────────────────────────

/// Host-port leasing. Implementations serialize `allocate` so that
/// concurrent callers never receive the same port.
#[async_trait]
pub trait PortAllocator: Send + Sync {
    /// Lease the lowest free port in `range_start..=range_end` to `owner_id`.
    async fn allocate(
        &self,
        range_start: u16,
        range_end: u16,
        owner_id: &str,
    ) -> Result<u16, PortAllocationError>;

    /// Release every port leased to `owner_id`. No-op when none are held.
    async fn release(&self, owner_id: &str) -> Result<(), PortAllocationError>;

    /// Record a port found in use during recovery.
    async fn add_existing_port(&self, owner_id: &str, port: u16)
    -> Result<(), PortAllocationError>;

    async fn owned_ports(&self, owner_id: &str) -> Result<BTreeSet<u16>, PortAllocationError>;
}

/// Shared lease table used by the store-backed allocator.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Every lease, port → owner.
    async fn leases(&self) -> Result<BTreeMap<u16, String>>;

    /// Claim `port` only if nobody holds it. Returns whether the claim won.
    async fn try_claim(&self, port: u16, owner_id: &str) -> Result<bool>;

    /// Claim `port` unconditionally.
    async fn claim(&self, port: u16, owner_id: &str) -> Result<()>;

    /// Drop every lease of `owner_id`, returning how many were dropped.
    async fn release_owner(&self, owner_id: &str) -> Result<usize>;
}

// ── Recovery policy ───────────────────────────────────────────────────────────

/// Decides whether objects created by another control-plane instance may be
/// adopted.
pub trait RecoveryPolicy: Send + Sync {
    fn can_recover_proxy(&self, deployment_instance_id: &str) -> bool;
}

// ── Container engine client ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineContainerRequest {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    /// `KEY=value` entries.
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub network: Option<String>,
    pub dns: Vec<String>,
    /// `source:target[:ro]` bind specs.
    pub binds: Vec<String>,
    pub memory_limit: Option<i64>,
    pub memory_reservation: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub privileged: bool,
    /// Container port → host port.
    pub port_bindings: BTreeMap<u16, u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Engine state string, e.g. `running`.
    pub state: String,
    pub labels: BTreeMap<String, String>,
    /// Container port → host port.
    pub port_bindings: BTreeMap<u16, u16>,
    pub ip_address: Option<String>,
}

/// Single container engine.
#[async_trait]
pub trait EngineApi: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create the container and return its id.
    async fn create_container(&self, request: &EngineContainerRequest) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn connect_network(&self, id: &str, network: &str) -> Result<()>;

    /// `None` when the container does not exist.
    async fn inspect_container(&self, id: &str) -> Result<Option<EngineContainer>>;

    /// Containers carrying `label` (`key=value`), in any state.
    async fn list_containers(&self, label: &str) -> Result<Vec<EngineContainer>>;

    /// Force-remove. Returns `false` when the container was already gone.
    async fn remove_container(&self, id: &str) -> Result<bool>;

    fn container_logs(&self, id: &str) -> LogStream;
}

// ── Engine cluster client ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretMount {
    pub secret_id: String,
    pub secret_name: String,
    pub target: String,
    pub uid: String,
    pub gid: String,
    pub mode: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRequest {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    /// Applied to the service and to its task containers.
    pub labels: BTreeMap<String, String>,
    pub networks: Vec<String>,
    pub dns: Vec<String>,
    pub binds: Vec<String>,
    pub secrets: Vec<SecretMount>,
    pub memory_limit: Option<i64>,
    pub memory_reservation: Option<i64>,
    pub nano_cpus_limit: Option<i64>,
    pub nano_cpus_reservation: Option<i64>,
    /// Target port → published port.
    pub published_ports: BTreeMap<u16, u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterService {
    pub id: String,
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    /// Target port → published port.
    pub published_ports: BTreeMap<u16, u16>,
}

/// A scheduled task of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceTask {
    pub state: String,
    /// Set once the task has a backing container.
    pub container_id: Option<String>,
    pub error: Option<String>,
}

/// Container-engine cluster in swarm mode.
#[async_trait]
pub trait SwarmApi: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Id of the secret called `name`, if it exists.
    async fn find_secret(&self, name: &str) -> Result<Option<String>>;

    /// Create the service and return its id.
    async fn create_service(&self, request: &ServiceRequest) -> Result<String>;

    async fn service_tasks(&self, service: &str) -> Result<Vec<ServiceTask>>;

    /// Services carrying `label` (`key=value`).
    async fn list_services(&self, label: &str) -> Result<Vec<ClusterService>>;

    /// Returns `false` when the service was already gone.
    async fn remove_service(&self, service: &str) -> Result<bool>;

    fn container_logs(&self, container_id: &str) -> LogStream;
}

// ── Orchestrator client ───────────────────────────────────────────────────────

/// Container orchestrator. Auxiliary manifests travel as JSON objects with
/// `apiVersion`, `kind` and `metadata.name` set.
#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Returns `false` when the pod was already gone.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn get_manifest(
        &self,
        namespace: &str,
        manifest: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>>;

    async fn create_manifest(&self, namespace: &str, manifest: &serde_json::Value) -> Result<()>;

    /// JSON merge patch of the live object with `manifest`.
    async fn patch_manifest(&self, namespace: &str, manifest: &serde_json::Value) -> Result<()>;

    async fn delete_manifest(&self, namespace: &str, manifest: &serde_json::Value)
    -> Result<bool>;

    fn pod_logs(&self, namespace: &str, name: &str) -> LogStream;
}
