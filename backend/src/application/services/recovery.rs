//! Re-adoption of backend objects left by an earlier control-plane process.
//!
//! A scan result is adopted only when its metadata is complete and the
//! recovery policy accepts its deployment instance. Rejected objects are
//! reported and left alone; recovery never deletes anything.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use berth_common::ProxyStatus;

use crate::application::ports::{ContainerBackend, PortAllocator, RecoveryPolicy};
use crate::application::services::metadata;
use crate::application::services::provisioning::resolved_port_mappings;
use crate::domain::runtime_value::keys;
use crate::domain::{
    Container, ContainerBuilder, ExistingContainerInfo, PortAllocationError, Proxy, ProxyBuilder,
    RuntimeValueCatalog, RuntimeValueError,
};

/// Why a scanned object was not adopted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Required-for-recovery keys absent from the object's metadata.
    MissingKeys(Vec<String>),
    /// Created by a deployment instance the policy does not accept.
    InstanceMismatch { found: String },
    /// Persisted values that did not parse.
    MalformedMetadata(Vec<String>),
    TargetResolution(String),
    PortReconciliation(String),
    /// Another container of the same proxy was not adopted.
    IncompleteProxy { proxy_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedContainer {
    pub container_id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub proxies: Vec<Proxy>,
    pub skipped: Vec<SkippedContainer>,
}

/// Accepts exactly one deployment instance, normally the current one.
#[derive(Debug, Clone)]
pub struct SameInstancePolicy {
    instance_id: String,
}

impl SameInstancePolicy {
    #[must_use]
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
        }
    }
}

impl RecoveryPolicy for SameInstancePolicy {
    fn can_recover_proxy(&self, deployment_instance_id: &str) -> bool {
        self.instance_id == deployment_instance_id
    }
}

/// Adopted container plus the host ports it holds.
struct Adoption {
    proxy_id: String,
    container: Container,
    host_ports: BTreeSet<u16>,
}

fn adopt(
    backend: &dyn ContainerBackend,
    catalog: &RuntimeValueCatalog,
    policy: &dyn RecoveryPolicy,
    info: &ExistingContainerInfo,
) -> Result<Adoption, SkipReason> {
    if !info.malformed_keys.is_empty() {
        return Err(SkipReason::MalformedMetadata(info.malformed_keys.clone()));
    }
    let values = &info.runtime_values;
    let missing = metadata::missing_required(catalog, values);
    if !missing.is_empty() {
        return Err(SkipReason::MissingKeys(missing));
    }
    let malformed = |e: RuntimeValueError| SkipReason::MalformedMetadata(vec![e.to_string()]);
    let instance: String = values.get_as(&keys::DEPLOYMENT_INSTANCE_ID).map_err(malformed)?;
    if !policy.can_recover_proxy(&instance) {
        return Err(SkipReason::InstanceMismatch { found: instance });
    }
    let proxy_id: String = values.get_as(&keys::PROXY_ID).map_err(malformed)?;
    let index: i64 = values.get_as(&keys::CONTAINER_INDEX).map_err(malformed)?;
    let index = usize::try_from(index).map_err(|_| {
        SkipReason::MalformedMetadata(vec![keys::CONTAINER_INDEX.name().to_string()])
    })?;

    let (_, container_values) = metadata::split_values(values);
    let mut builder = ContainerBuilder::new(index);
    builder.set_id(info.container_id.clone());
    builder.runtime_values_mut().extend_from(&container_values);

    let mappings = resolved_port_mappings(values).map_err(malformed)?;
    let snapshot = builder.build();
    let mut host_ports: BTreeSet<u16> = info.port_bindings.values().copied().collect();
    for mapping in &mappings {
        let host_port = mapping
            .host_port
            .or_else(|| info.port_bindings.get(&mapping.port).copied());
        host_ports.extend(host_port);
        let target = backend
            .calculate_target(&snapshot, &mapping.spec(), host_port)
            .map_err(|e| SkipReason::TargetResolution(e.to_string()))?;
        builder.add_target(mapping.name.clone(), target);
    }
    Ok(Adoption {
        proxy_id,
        container: builder.build(),
        host_ports,
    })
}

fn proxy_builder(proxy_id: &str, info: &ExistingContainerInfo) -> ProxyBuilder {
    let values = &info.runtime_values;
    let (proxy_values, _) = metadata::split_values(values);
    let mut builder = ProxyBuilder::new(proxy_id);
    builder
        .status(ProxyStatus::Up)
        .user_id(values.get_or_default::<String>(&keys::USER_ID, String::new()))
        .spec_id(values.get_or_default::<String>(&keys::PROXY_SPEC_ID, String::new()))
        .display_name(values.get_or_none(&keys::DISPLAY_NAME));
    if let Some(created) = values.get_or_none(&keys::CREATED_TIMESTAMP) {
        builder.created_at(created).started_at(created);
    }
    builder.runtime_values_mut().extend_from(&proxy_values);
    builder
}

fn skip(skipped: &mut Vec<SkippedContainer>, info: &ExistingContainerInfo, reason: SkipReason) {
    tracing::warn!(container_id = %info.container_id, reason = ?reason, "not adopting container");
    skipped.push(SkippedContainer {
        container_id: info.container_id.clone(),
        reason,
    });
}

/// Lease every host port of one proxy's containers to the proxy. On a
/// conflict the proxy's leases are released again.
async fn reconcile_ports(
    allocator: &dyn PortAllocator,
    proxy_id: &str,
    members: &[(&ExistingContainerInfo, Adoption)],
) -> Result<(), PortAllocationError> {
    let ports: BTreeSet<u16> = members
        .iter()
        .flat_map(|(_, adoption)| adoption.host_ports.iter().copied())
        .collect();
    for port in ports {
        if let Err(err) = allocator.add_existing_port(proxy_id, port).await {
            if let Err(release) = allocator.release(proxy_id).await {
                tracing::error!(proxy_id, error = %release, "cannot release reclaimed ports");
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Scan the backend and rebuild the proxies it still runs.
///
/// One bad object never blocks other proxies; it lands in
/// [`RecoveryReport::skipped`]. A proxy is adopted whole or not at all:
/// when one of its containers is rejected, its siblings are skipped too
/// and none of its ports stay leased. Only a failing scan is an error.
pub async fn recover_proxies(
    backend: &dyn ContainerBackend,
    allocator: &dyn PortAllocator,
    catalog: &RuntimeValueCatalog,
    policy: &dyn RecoveryPolicy,
) -> Result<RecoveryReport> {
    let found = backend.scan_existing_containers().await?;
    tracing::info!(backend = backend.kind().as_str(), found = found.len(), "recovery scan finished");

    let mut skipped = Vec::new();
    let mut rejected = BTreeSet::new();
    let mut candidates: BTreeMap<String, Vec<(&ExistingContainerInfo, Adoption)>> = BTreeMap::new();
    for info in &found {
        match adopt(backend, catalog, policy, info) {
            Ok(adoption) => candidates
                .entry(adoption.proxy_id.clone())
                .or_default()
                .push((info, adoption)),
            Err(reason) => {
                if let Some(proxy_id) = info.runtime_values.get_or_none::<String>(&keys::PROXY_ID) {
                    rejected.insert(proxy_id);
                }
                skip(&mut skipped, info, reason);
            }
        }
    }

    let mut proxies = Vec::new();
    for (proxy_id, members) in candidates {
        if rejected.contains(&proxy_id) {
            for (info, _) in &members {
                let reason = SkipReason::IncompleteProxy {
                    proxy_id: proxy_id.clone(),
                };
                skip(&mut skipped, info, reason);
            }
            continue;
        }
        if let Err(err) = reconcile_ports(allocator, &proxy_id, &members).await {
            for (info, _) in &members {
                skip(&mut skipped, info, SkipReason::PortReconciliation(err.to_string()));
            }
            continue;
        }
        let Some((first, _)) = members.first() else {
            continue;
        };
        let mut builder = proxy_builder(&proxy_id, first);
        for (_, adoption) in members {
            tracing::info!(
                proxy_id = %proxy_id,
                container_index = adoption.container.index(),
                ports = adoption.host_ports.len(),
                "adopted container"
            );
            builder.upsert_container(adoption.container);
        }
        proxies.push(builder.build());
    }

    Ok(RecoveryReport { proxies, skipped })
}
