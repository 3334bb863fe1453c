//! Configuration loading.
//!
//! Each section comes from its own environment prefix via `envy`, or every
//! section from one YAML document. Loaded settings are validated before any
//! backend is built; every failure is a [`ConfigError`].

use std::str::FromStr;

use berth_common::{
    BackendKind, BackendSelection, DockerEngineConfig, DockerSwarmConfig, KubernetesConfig,
    PortStoreConfig,
};
use serde::Deserialize;

use crate::application::services::backends::orchestrator::parse_node_selector;
use crate::domain::ConfigError;

pub const SELECTION_PREFIX: &str = "BERTH_";
pub const DOCKER_PREFIX: &str = "BERTH_DOCKER_";
pub const SWARM_PREFIX: &str = "BERTH_SWARM_";
pub const KUBERNETES_PREFIX: &str = "BERTH_KUBERNETES_";
pub const PORT_STORE_PREFIX: &str = "BERTH_PORT_STORE_";

/// Selection as read, before the backend name is checked.
#[derive(Debug, Deserialize)]
struct RawSelection {
    #[serde(default)]
    backend: Option<String>,
    deployment_instance_id: String,
    #[serde(default)]
    realm_id: Option<String>,
}

impl RawSelection {
    fn resolve(self) -> Result<BackendSelection, ConfigError> {
        let backend = match self.backend.as_deref().map(str::trim) {
            None | Some("") => BackendKind::default(),
            Some(name) => BackendKind::from_str(name)
                .map_err(|_| ConfigError::UnknownBackend(name.to_string()))?,
        };
        Ok(BackendSelection {
            backend,
            deployment_instance_id: self.deployment_instance_id,
            realm_id: self.realm_id,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(flatten)]
    selection: RawSelection,
    #[serde(default)]
    docker: DockerEngineConfig,
    #[serde(default)]
    swarm: DockerSwarmConfig,
    #[serde(default)]
    kubernetes: KubernetesConfig,
    #[serde(default)]
    port_store: PortStoreConfig,
}

/// Every configuration section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub selection: BackendSelection,
    pub docker: DockerEngineConfig,
    pub swarm: DockerSwarmConfig,
    pub kubernetes: KubernetesConfig,
    pub port_store: PortStoreConfig,
}

fn section<T>(
    name: &'static str,
    prefix: &str,
    vars: &[(String, String)],
) -> Result<T, ConfigError>
where
    T: for<'de> Deserialize<'de>,
{
    envy::prefixed(prefix)
        .from_iter(vars.iter().cloned())
        .map_err(|e| ConfigError::Load {
            section: name,
            source: anyhow::Error::new(e),
        })
}

fn check_range(section: &'static str, start: u16, end: u16) -> Result<(), ConfigError> {
    if start == 0 || start > end {
        return Err(ConfigError::PortRange {
            section,
            start,
            end,
        });
    }
    Ok(())
}

impl Settings {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Load from `(name, value)` pairs shaped like environment variables.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: Vec<(String, String)> = vars.into_iter().collect();
        let selection: RawSelection = section("backend selection", SELECTION_PREFIX, &vars)?;
        let settings = Self {
            selection: selection.resolve()?,
            docker: section("docker", DOCKER_PREFIX, &vars)?,
            swarm: section("swarm", SWARM_PREFIX, &vars)?,
            kubernetes: section("kubernetes", KUBERNETES_PREFIX, &vars)?,
            port_store: section("port store", PORT_STORE_PREFIX, &vars)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Load every section from one YAML document.
    pub fn from_yaml(document: &str) -> Result<Self, ConfigError> {
        let raw: RawDocument = serde_yaml::from_str(document).map_err(|e| ConfigError::Load {
            section: "document",
            source: anyhow::Error::new(e),
        })?;
        let settings = Self {
            selection: raw.selection.resolve()?,
            docker: raw.docker,
            swarm: raw.swarm,
            kubernetes: raw.kubernetes,
            port_store: raw.port_store,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings no backend can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "docker",
            self.docker.port_range_start,
            self.docker.port_range_end,
        )?;
        check_range(
            "swarm",
            self.swarm.port_range_start,
            self.swarm.port_range_end,
        )?;
        check_range(
            "kubernetes",
            self.kubernetes.node_port_range_start,
            self.kubernetes.node_port_range_end,
        )?;
        if let Some(raw) = &self.kubernetes.node_selector {
            parse_node_selector(raw)?;
        }
        Ok(())
    }
}
