use serde::Deserialize;

use crate::types::BackendKind;

/// Container-engine backend configuration.
///
/// Loaded from `BERTH_DOCKER_*` environment variables by the backend crate.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DockerEngineConfig {
    /// Engine endpoint; `None` uses the local socket defaults.
    #[serde(default)]
    pub url: Option<String>,

    /// Resolve targets through the engine network instead of host ports.
    #[serde(default)]
    pub internal_networking: bool,

    #[serde(default = "default_engine_port_range_start")]
    pub port_range_start: u16,

    #[serde(default = "default_engine_port_range_end")]
    pub port_range_end: u16,

    /// One of `Never`, `Always`, `IfNotPresent`.
    #[serde(default = "default_image_pull_policy")]
    pub image_pull_policy: String,

    /// Host name placed in published targets.
    #[serde(default = "default_public_host")]
    pub public_host: String,

    /// Readiness budget for a created container, in milliseconds.
    #[serde(default = "default_container_wait_ms")]
    pub container_wait_ms: u64,
}

/// Container-engine cluster (swarm mode) backend configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DockerSwarmConfig {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub internal_networking: bool,

    #[serde(default = "default_engine_port_range_start")]
    pub port_range_start: u16,

    #[serde(default = "default_engine_port_range_end")]
    pub port_range_end: u16,

    #[serde(default = "default_public_host")]
    pub public_host: String,

    /// Budget for a created service's task to expose a container id.
    #[serde(default = "default_service_wait_ms")]
    pub service_wait_ms: u64,
}

/// Orchestrator backend configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct KubernetesConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_true")]
    pub internal_networking: bool,

    #[serde(default = "default_node_port_range_start")]
    pub node_port_range_start: u16,

    #[serde(default = "default_node_port_range_end")]
    pub node_port_range_end: u16,

    /// Passed through to the pod spec untouched when set.
    #[serde(default)]
    pub image_pull_policy: Option<String>,

    /// `key=value[,key=value]*`.
    #[serde(default)]
    pub node_selector: Option<String>,

    #[serde(default = "default_pod_wait_ms")]
    pub pod_wait_ms: u64,

    #[serde(default = "default_public_host")]
    pub public_host: String,

    /// Extra namespaces scanned during recovery, comma separated in env form.
    #[serde(default)]
    pub additional_namespaces: Vec<String>,

    #[serde(default)]
    pub service_account: Option<String>,
}

/// Where leased host ports are tracked.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PortStoreKind {
    #[default]
    Memory,
    Valkey,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PortStoreConfig {
    #[serde(default)]
    pub kind: PortStoreKind,

    #[serde(default = "default_valkey_url")]
    pub valkey_url: String,
}

/// Which backend runs and which control-plane identity it carries.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BackendSelection {
    #[serde(default)]
    pub backend: BackendKind,

    /// Identity gating recovery; objects from other instances are ignored.
    pub deployment_instance_id: String,

    #[serde(default)]
    pub realm_id: Option<String>,
}

fn default_engine_port_range_start() -> u16 {
    20000
}

fn default_engine_port_range_end() -> u16 {
    21000
}

fn default_node_port_range_start() -> u16 {
    30000
}

fn default_node_port_range_end() -> u16 {
    32767
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_public_host() -> String {
    "localhost".to_string()
}

fn default_container_wait_ms() -> u64 {
    20_000
}

fn default_service_wait_ms() -> u64 {
    60_000
}

fn default_pod_wait_ms() -> u64 {
    60_000
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_valkey_url() -> String {
    "redis://valkey:6379".to_string()
}

impl Default for DockerEngineConfig {
    fn default() -> Self {
        Self {
            url: None,
            internal_networking: false,
            port_range_start: default_engine_port_range_start(),
            port_range_end: default_engine_port_range_end(),
            image_pull_policy: default_image_pull_policy(),
            public_host: default_public_host(),
            container_wait_ms: default_container_wait_ms(),
        }
    }
}

impl Default for DockerSwarmConfig {
    fn default() -> Self {
        Self {
            url: None,
            internal_networking: false,
            port_range_start: default_engine_port_range_start(),
            port_range_end: default_engine_port_range_end(),
            public_host: default_public_host(),
            service_wait_ms: default_service_wait_ms(),
        }
    }
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            internal_networking: true,
            node_port_range_start: default_node_port_range_start(),
            node_port_range_end: default_node_port_range_end(),
            image_pull_policy: None,
            node_selector: None,
            pod_wait_ms: default_pod_wait_ms(),
            public_host: default_public_host(),
            additional_namespaces: Vec::new(),
            service_account: None,
        }
    }
}

impl Default for PortStoreConfig {
    fn default() -> Self {
        Self {
            kind: PortStoreKind::Memory,
            valkey_url: default_valkey_url(),
        }
    }
}

impl KubernetesConfig {
    /// Namespaces scanned for managed pods: the primary one first, no duplicates.
    #[must_use]
    pub fn scanned_namespaces(&self) -> Vec<String> {
        let mut out = vec![self.namespace.clone()];
        for ns in &self.additional_namespaces {
            if !out.contains(ns) {
                out.push(ns.clone());
            }
        }
        out
    }
}
