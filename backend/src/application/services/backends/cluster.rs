//! Container-engine cluster (swarm mode) backend.
//!
//! One service per declared container. The cluster schedules a task for
//! the service; the container exists once a task reports a container id.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use berth_common::{BackendKind, DockerSwarmConfig};
use futures::stream;
use http::Uri;

use crate::application::ports::{
    ContainerBackend, LogStream, PortAllocator, SecretMount, ServiceRequest, StartContext,
    SwarmApi,
};
use crate::application::services::metadata;
use crate::application::services::provisioning::{
    self, ResolvedPortMapping, backend_handle, finish_teardown, internal_host, published_target,
    short_id,
};
use crate::application::services::retry::retry;
use crate::domain::runtime_value::{RuntimeValueCatalog, keys};
use crate::domain::spec::SwarmSecretSpec;
use crate::domain::{
    Container, ContainerBuilder, ContainerSpec, ExistingContainerInfo, PortMappingSpec,
    ProvisionError, Proxy, ProxyStartupLogBuilder, StartFailure, TeardownError,
};

const SECRETS_DIR: &str = "/run/secrets";
const DEFAULT_SECRET_MODE: u32 = 0o444;

pub struct ClusterBackend<C> {
    client: C,
    allocator: Arc<dyn PortAllocator>,
    catalog: Arc<RuntimeValueCatalog>,
    config: DockerSwarmConfig,
}

impl<C: SwarmApi> ClusterBackend<C> {
    pub fn new(
        client: C,
        allocator: Arc<dyn PortAllocator>,
        catalog: Arc<RuntimeValueCatalog>,
        config: DockerSwarmConfig,
    ) -> Self {
        Self {
            client,
            allocator,
            catalog,
            config,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    #[must_use]
    pub fn service_name(proxy_id: &str, index: usize) -> String {
        format!("sp-service-{proxy_id}-{index}")
    }

    async fn resolve_secrets(
        &self,
        secrets: &[SwarmSecretSpec],
    ) -> Result<Vec<SecretMount>, ProvisionError> {
        let mut mounts = Vec::with_capacity(secrets.len());
        for secret in secrets {
            let id = self
                .client
                .find_secret(&secret.name)
                .await
                .map_err(ProvisionError::Client)?
                .ok_or_else(|| ProvisionError::SecretMissing(secret.name.clone()))?;
            let file = secret.target.as_deref().unwrap_or(&secret.name);
            let target = if file.starts_with('/') {
                file.to_string()
            } else {
                format!("{SECRETS_DIR}/{file}")
            };
            mounts.push(SecretMount {
                secret_id: id,
                secret_name: secret.name.clone(),
                target,
                uid: secret.uid.clone().unwrap_or_else(|| "0".to_string()),
                gid: secret.gid.clone().unwrap_or_else(|| "0".to_string()),
                mode: secret.mode.unwrap_or(DEFAULT_SECRET_MODE),
            });
        }
        Ok(mounts)
    }

    async fn provision(
        &self,
        ctx: StartContext<'_>,
        container: &mut ContainerBuilder,
        spec: &ContainerSpec,
        log: &mut ProxyStartupLogBuilder,
    ) -> Result<(), ProvisionError> {
        let index = container.index();
        let proxy_id = ctx.proxy.id();
        let name = Self::service_name(proxy_id, index);

        let secrets = self.resolve_secrets(&spec.docker_swarm_secrets).await?;
        let mappings = if self.config.internal_networking {
            spec.port_mappings
                .iter()
                .map(ResolvedPortMapping::unpublished)
                .collect()
        } else {
            provisioning::lease_ports(
                self.allocator.as_ref(),
                (self.config.port_range_start, self.config.port_range_end),
                proxy_id,
                &spec.port_mappings,
            )
            .await?
        };
        provisioning::record_container_values(container, &spec.image, &name, &mappings)?;

        let proxy_values = ctx.proxy.runtime_values();
        let labels = metadata::merge_labels(
            &spec.labels,
            metadata::engine_labels(&self.catalog, proxy_values, container.runtime_values()),
        );
        let env = metadata::merge_env(
            &spec.env,
            &metadata::env_vars(&self.catalog, proxy_values, container.runtime_values()),
        );
        let resources = provisioning::resources(spec)?;
        let mut networks: Vec<String> = spec.network.iter().cloned().collect();
        networks.extend(spec.network_connections.iter().cloned());
        let request = ServiceRequest {
            name: name.clone(),
            image: spec.image.clone(),
            cmd: spec.cmd.clone(),
            env: metadata::env_list(&env),
            labels,
            networks,
            dns: spec.dns.clone(),
            binds: provisioning::binds(spec)?,
            secrets,
            memory_limit: resources.memory_limit,
            memory_reservation: resources.memory_request,
            nano_cpus_limit: resources.nano_cpus_limit,
            nano_cpus_reservation: resources.nano_cpus_request,
            published_ports: provisioning::host_ports(&mappings),
        };

        log.scheduling(index)?;
        let service_id =
            self.client
                .create_service(&request)
                .await
                .map_err(|source| ProvisionError::Create {
                    object: format!("service {name}"),
                    source,
                })?;
        container.set_id(service_id.clone());

        let Some(container_id) = self.await_backing_container(&service_id).await else {
            match self.client.remove_service(&name).await {
                Ok(_) => tracing::warn!(service = %name, "removed service that never started"),
                Err(err) => tracing::error!(service = %name, error = %err, "cannot remove service"),
            }
            return Err(ProvisionError::ReadinessTimeout {
                object: format!("service {name}"),
                budget_ms: self.config.service_wait_ms,
            });
        };
        log.scheduled(index)?;
        log.starting_container(index)?;
        container.set_id(container_id.clone());
        container
            .runtime_values_mut()
            .set(&keys::CONTAINER_ADDRESS, short_id(&container_id))?;
        log.container_started(index)?;

        provisioning::resolve_targets(self, container, &mappings)?;
        tracing::info!(proxy_id, container_index = index, service = %name, "service started");
        Ok(())
    }

    /// Poll the service's tasks until one has a backing container.
    async fn await_backing_container(&self, service_id: &str) -> Option<String> {
        let budget = Duration::from_millis(self.config.service_wait_ms);
        let found = OnceLock::new();
        let slot = &found;
        let client = &self.client;
        let ready = retry(budget, |attempt, max| async move {
            match client.service_tasks(service_id).await {
                Ok(tasks) => {
                    if let Some(id) = tasks.into_iter().find_map(|t| t.container_id) {
                        let _ = slot.set(id);
                        return true;
                    }
                    tracing::debug!(service_id, attempt, max, "no task container yet");
                    false
                }
                Err(err) => {
                    tracing::debug!(service_id, error = %err, "listing tasks failed");
                    false
                }
            }
        })
        .await;
        if ready { found.into_inner() } else { None }
    }
}

#[async_trait]
impl<C: SwarmApi> ContainerBackend for ClusterBackend<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::DockerSwarm
    }

    async fn initialize(&self) -> Result<(), ProvisionError> {
        self.client.ping().await.map_err(ProvisionError::Client)?;
        tracing::info!(
            internal_networking = self.config.internal_networking,
            "cluster backend ready"
        );
        Ok(())
    }

    async fn start_container(
        &self,
        ctx: StartContext<'_>,
        mut container: ContainerBuilder,
        spec: &ContainerSpec,
        log: &mut ProxyStartupLogBuilder,
    ) -> Result<Container, StartFailure> {
        match self.provision(ctx, &mut container, spec, log).await {
            Ok(()) => Ok(container.build()),
            Err(error) => {
                log.abort_container(container.index());
                Err(StartFailure::new(container.build(), error))
            }
        }
    }

    async fn stop_proxy(&self, proxy: &Proxy) -> Result<(), TeardownError> {
        let mut failures = Vec::new();
        let handles: Vec<String> = proxy.containers().iter().filter_map(backend_handle).collect();
        for handle in &handles {
            match self.client.remove_service(handle).await {
                Ok(removed) => tracing::debug!(
                    proxy_id = proxy.id(),
                    service = %handle,
                    removed,
                    "service removed"
                ),
                Err(source) => failures.push(TeardownError::Remove {
                    object: format!("service {handle}"),
                    source,
                }),
            }
        }
        finish_teardown(self.allocator.as_ref(), proxy.id(), handles.len(), failures).await
    }

    async fn scan_existing_containers(&self) -> Result<Vec<ExistingContainerInfo>> {
        let services = self
            .client
            .list_services(&metadata::managed_selector())
            .await?;
        let mut out = Vec::new();
        for service in services {
            let tasks = match self.client.service_tasks(&service.id).await {
                Ok(tasks) => tasks,
                Err(err) => {
                    tracing::warn!(service = %service.name, error = %err, "cannot list service tasks, skipping");
                    continue;
                }
            };
            let backing: Vec<String> = tasks
                .into_iter()
                .filter(|t| t.state == "running")
                .filter_map(|t| t.container_id)
                .collect();
            let [container_id] = backing.as_slice() else {
                tracing::warn!(
                    service = %service.name,
                    containers = backing.len(),
                    "service does not have exactly one running container, skipping"
                );
                continue;
            };
            let (mut runtime_values, malformed_keys) =
                metadata::recover_values(&self.catalog, &service.labels);
            runtime_values.set(&keys::CONTAINER_ADDRESS, short_id(container_id))?;
            out.push(ExistingContainerInfo {
                container_id: container_id.clone(),
                runtime_values,
                image: service.image,
                port_bindings: service.published_ports,
                malformed_keys,
            });
        }
        Ok(out)
    }

    fn calculate_target(
        &self,
        container: &Container,
        mapping: &PortMappingSpec,
        host_port: Option<u16>,
    ) -> Result<Uri, ProvisionError> {
        if self.config.internal_networking {
            let host = internal_host(container, mapping)?;
            provisioning::build_target(mapping, &host, mapping.port)
        } else {
            published_target(mapping, &self.config.public_host, host_port)
        }
    }

    async fn attach_output(&self, proxy: &Proxy) -> Result<Option<LogStream>> {
        let streams: Vec<LogStream> = proxy
            .containers()
            .iter()
            .filter_map(Container::id)
            .map(|id| self.client.container_logs(id))
            .collect();
        if streams.is_empty() {
            return Ok(None);
        }
        Ok(Some(Box::pin(stream::select_all(streams))))
    }
}

