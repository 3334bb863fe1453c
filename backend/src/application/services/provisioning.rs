//! Helpers shared by every backend's provisioning and teardown path.

use std::collections::BTreeMap;

use http::Uri;
use serde::{Deserialize, Serialize};

use crate::application::ports::{ContainerBackend, PortAllocator};
use crate::domain::runtime_value::keys;
use crate::domain::spec::{parse_cpu_millis, parse_memory, parse_volume};
use crate::domain::{
    Container, ContainerBuilder, ContainerSpec, PortAllocationError, PortMappingSpec,
    ProvisionError, RuntimeValueError, RuntimeValues, SpecError, TeardownError,
};

/// A declared port mapping plus the host port leased for it, as persisted in
/// the port-mappings runtime value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPortMapping {
    pub name: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
}

impl ResolvedPortMapping {
    #[must_use]
    pub fn unpublished(spec: &PortMappingSpec) -> Self {
        Self {
            name: spec.name.clone(),
            port: spec.port,
            host_port: None,
            target_path: spec.target_path.clone(),
        }
    }

    #[must_use]
    pub fn spec(&self) -> PortMappingSpec {
        PortMappingSpec {
            name: self.name.clone(),
            port: self.port,
            target_path: self.target_path.clone(),
        }
    }
}

/// Lease one host port per mapping, owned by `proxy_id`.
///
/// Ports leased before a failure stay leased; the caller's teardown of the
/// partial proxy releases them.
pub async fn lease_ports(
    allocator: &dyn PortAllocator,
    range: (u16, u16),
    proxy_id: &str,
    mappings: &[PortMappingSpec],
) -> Result<Vec<ResolvedPortMapping>, PortAllocationError> {
    let mut resolved = Vec::with_capacity(mappings.len());
    for mapping in mappings {
        let port = allocator.allocate(range.0, range.1, proxy_id).await?;
        tracing::debug!(proxy_id, mapping = %mapping.name, port, "leased host port");
        resolved.push(ResolvedPortMapping {
            host_port: Some(port),
            ..ResolvedPortMapping::unpublished(mapping)
        });
    }
    Ok(resolved)
}

/// Record the container-specific runtime values known before creation.
pub fn record_container_values(
    container: &mut ContainerBuilder,
    image: &str,
    backend_name: &str,
    mappings: &[ResolvedPortMapping],
) -> Result<(), RuntimeValueError> {
    let index = i64::try_from(container.index()).map_err(|e| RuntimeValueError::Malformed {
        key: keys::CONTAINER_INDEX.name().to_string(),
        raw: container.index().to_string(),
        reason: e.to_string(),
    })?;
    let mappings_json = serde_json::to_value(mappings).map_err(|e| RuntimeValueError::Malformed {
        key: keys::PORT_MAPPINGS.name().to_string(),
        raw: String::new(),
        reason: e.to_string(),
    })?;
    let values = container.runtime_values_mut();
    values.set(&keys::CONTAINER_INDEX, index)?;
    values.set(&keys::CONTAINER_IMAGE, image)?;
    values.set(&keys::BACKEND_CONTAINER_NAME, backend_name)?;
    values.set(&keys::PORT_MAPPINGS, mappings_json)?;
    Ok(())
}

/// Read back the port mappings recorded by [`record_container_values`].
/// Absent means no mappings.
pub fn resolved_port_mappings(
    values: &RuntimeValues,
) -> Result<Vec<ResolvedPortMapping>, RuntimeValueError> {
    let Some(json) = values.get_or_none::<serde_json::Value>(&keys::PORT_MAPPINGS) else {
        return Ok(Vec::new());
    };
    serde_json::from_value(json.clone()).map_err(|e| RuntimeValueError::Malformed {
        key: keys::PORT_MAPPINGS.name().to_string(),
        raw: json.to_string(),
        reason: e.to_string(),
    })
}

/// Resolve and store the target of every mapping.
pub fn resolve_targets<B: ContainerBackend + ?Sized>(
    backend: &B,
    container: &mut ContainerBuilder,
    mappings: &[ResolvedPortMapping],
) -> Result<(), ProvisionError> {
    let snapshot = container.build();
    for mapping in mappings {
        let target = backend.calculate_target(&snapshot, &mapping.spec(), mapping.host_port)?;
        container.add_target(mapping.name.clone(), target);
    }
    Ok(())
}

/// `http://{host}:{port}{target_path}`.
pub fn build_target(
    mapping: &PortMappingSpec,
    host: &str,
    port: u16,
) -> Result<Uri, ProvisionError> {
    let mut target = format!("http://{host}:{port}");
    if let Some(path) = mapping.target_path.as_deref().filter(|p| !p.is_empty()) {
        if !path.starts_with('/') {
            target.push('/');
        }
        target.push_str(path);
    }
    target.parse().map_err(|e: http::uri::InvalidUri| ProvisionError::Target {
        mapping: mapping.name.clone(),
        reason: e.to_string(),
    })
}

/// Host of an internal target: the recorded container address, or the
/// backend handle as a fallback.
pub fn internal_host(container: &Container, mapping: &PortMappingSpec) -> Result<String, ProvisionError> {
    let values = container.runtime_values();
    values
        .get_or_none::<String>(&keys::CONTAINER_ADDRESS)
        .or_else(|| values.get_or_none::<String>(&keys::BACKEND_CONTAINER_NAME))
        .ok_or_else(|| ProvisionError::Target {
            mapping: mapping.name.clone(),
            reason: "container has no address".to_string(),
        })
}

/// Published target: `public_host` and the leased host port.
pub fn published_target(
    mapping: &PortMappingSpec,
    public_host: &str,
    host_port: Option<u16>,
) -> Result<Uri, ProvisionError> {
    let port = host_port.ok_or_else(|| ProvisionError::Target {
        mapping: mapping.name.clone(),
        reason: "no host port was leased".to_string(),
    })?;
    build_target(mapping, public_host, port)
}

// ── Resources ─────────────────────────────────────────────────────────────────

/// Parsed resource requests and limits of one container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resources {
    pub memory_request: Option<i64>,
    pub memory_limit: Option<i64>,
    pub nano_cpus_request: Option<i64>,
    pub nano_cpus_limit: Option<i64>,
}

pub fn resources(spec: &ContainerSpec) -> Result<Resources, SpecError> {
    let memory = |v: &Option<String>| v.as_deref().map(parse_memory).transpose();
    let nano_cpus = |v: &Option<String>| {
        v.as_deref()
            .map(|q| {
                parse_cpu_millis(q)?
                    .checked_mul(1_000_000)
                    .ok_or_else(|| SpecError::InvalidQuantity {
                        field: "cpu",
                        value: q.to_string(),
                    })
            })
            .transpose()
    };
    Ok(Resources {
        memory_request: memory(&spec.memory_request)?,
        memory_limit: memory(&spec.memory_limit)?,
        nano_cpus_request: nano_cpus(&spec.cpu_request)?,
        nano_cpus_limit: nano_cpus(&spec.cpu_limit)?,
    })
}

/// Engine bind specs, validated.
pub fn binds(spec: &ContainerSpec) -> Result<Vec<String>, SpecError> {
    spec.volumes
        .iter()
        .map(|v| {
            let volume = parse_volume(v)?;
            Ok(if volume.read_only {
                format!("{}:{}:ro", volume.source, volume.target)
            } else {
                format!("{}:{}", volume.source, volume.target)
            })
        })
        .collect()
}

// ── Teardown ──────────────────────────────────────────────────────────────────

/// Release the proxy's ports when every removal succeeded; otherwise keep
/// the lease and surface the failures.
pub async fn finish_teardown(
    allocator: &dyn PortAllocator,
    proxy_id: &str,
    total: usize,
    mut failures: Vec<TeardownError>,
) -> Result<(), TeardownError> {
    if !failures.is_empty() {
        for failure in &failures {
            tracing::error!(proxy_id, error = %failure, "teardown failed");
        }
        if failures.len() == 1 && total == 1 {
            return Err(failures.remove(0));
        }
        return Err(TeardownError::Partial { total, failures });
    }
    allocator
        .release(proxy_id)
        .await
        .map_err(|source| TeardownError::ReleasePorts {
            proxy_id: proxy_id.to_string(),
            source,
        })?;
    tracing::info!(proxy_id, "proxy torn down");
    Ok(())
}

/// Backend handle of a container: the recorded backend name, else its id.
#[must_use]
pub fn backend_handle(container: &Container) -> Option<String> {
    container
        .runtime_values()
        .get_or_none::<String>(&keys::BACKEND_CONTAINER_NAME)
        .or_else(|| container.id().map(str::to_string))
}

/// Short container id used as an internal host name in clusters.
#[must_use]
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Host-port view of recovered mappings: container port → host port.
#[must_use]
pub fn host_ports(mappings: &[ResolvedPortMapping]) -> BTreeMap<u16, u16> {
    mappings
        .iter()
        .filter_map(|m| m.host_port.map(|h| (m.port, h)))
        .collect()
}
