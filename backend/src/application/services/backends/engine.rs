//! Single container-engine backend.
//!
//! One engine container per declared container. Readiness is creation
//! success followed by the engine reporting the container as running.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use berth_common::{BackendKind, DockerEngineConfig, ImagePullPolicy};
use futures::stream;
use http::Uri;

use crate::application::ports::{
    ContainerBackend, EngineApi, EngineContainerRequest, LogStream, PortAllocator, StartContext,
};
use crate::application::services::metadata;
use crate::application::services::provisioning::{
    self, ResolvedPortMapping, backend_handle, finish_teardown, internal_host, published_target,
};
use crate::application::services::retry::retry;
use crate::domain::runtime_value::{RuntimeValueCatalog, keys};
use crate::domain::{
    Container, ContainerBuilder, ContainerSpec, ExistingContainerInfo, PortMappingSpec,
    ProvisionError, Proxy, ProxyStartupLogBuilder, StartFailure, TeardownError,
};

pub struct EngineBackend<C> {
    client: C,
    allocator: Arc<dyn PortAllocator>,
    catalog: Arc<RuntimeValueCatalog>,
    config: DockerEngineConfig,
    pull_policy: Option<ImagePullPolicy>,
}

impl<C: EngineApi> EngineBackend<C> {
    pub fn new(
        client: C,
        allocator: Arc<dyn PortAllocator>,
        catalog: Arc<RuntimeValueCatalog>,
        config: DockerEngineConfig,
    ) -> Self {
        let pull_policy = ImagePullPolicy::parse(&config.image_pull_policy);
        if pull_policy.is_none() {
            tracing::warn!(
                policy = %config.image_pull_policy,
                "unknown image pull policy, images will not be pulled"
            );
        }
        Self {
            client,
            allocator,
            catalog,
            config,
            pull_policy,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Engine container name of one container of a proxy.
    #[must_use]
    pub fn container_name(proxy_id: &str, index: usize) -> String {
        format!("sp-{proxy_id}-{index}")
    }

    async fn ensure_image(&self, image: &str) -> Result<(), ProvisionError> {
        let pull = match self.pull_policy {
            Some(ImagePullPolicy::Always) => true,
            Some(ImagePullPolicy::IfNotPresent) => !self
                .client
                .image_exists(image)
                .await
                .map_err(ProvisionError::Client)?,
            Some(ImagePullPolicy::Never) | None => false,
        };
        if pull {
            tracing::info!(image, "pulling image");
            self.client
                .pull_image(image)
                .await
                .map_err(|source| ProvisionError::ImagePull {
                    image: image.to_string(),
                    source,
                })?;
        }
        Ok(())
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
        let name = Self::container_name(proxy_id, index);

        log.pulling_image(index)?;
        self.ensure_image(&spec.image).await?;
        log.image_pulled(index)?;

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
        let request = EngineContainerRequest {
            name: name.clone(),
            image: spec.image.clone(),
            cmd: spec.cmd.clone(),
            env: metadata::env_list(&env),
            labels,
            network: spec.network.clone(),
            dns: spec.dns.clone(),
            binds: provisioning::binds(spec)?,
            memory_limit: resources.memory_limit,
            memory_reservation: resources.memory_request,
            nano_cpus: resources.nano_cpus_limit,
            privileged: spec.privileged,
            port_bindings: provisioning::host_ports(&mappings),
        };

        log.starting_container(index)?;
        let id = self
            .client
            .create_container(&request)
            .await
            .map_err(|source| ProvisionError::Create {
                object: format!("container {name}"),
                source,
            })?;
        container.set_id(id.clone());
        self.client
            .start_container(&id)
            .await
            .map_err(ProvisionError::Client)?;
        for network in &spec.network_connections {
            self.client
                .connect_network(&id, network)
                .await
                .map_err(ProvisionError::Client)?;
        }

        let address = self.await_running(&id, &name).await?;
        container
            .runtime_values_mut()
            .set(&keys::CONTAINER_ADDRESS, address)?;
        log.container_started(index)?;

        provisioning::resolve_targets(self, container, &mappings)?;
        tracing::info!(proxy_id, container_index = index, container = %name, "container started");
        Ok(())
    }

    /// Poll until the engine reports the container running; returns the
    /// address used for internal targets.
    async fn await_running(&self, id: &str, name: &str) -> Result<String, ProvisionError> {
        let budget = Duration::from_millis(self.config.container_wait_ms);
        let address = OnceLock::new();
        let slot = &address;
        let client = &self.client;
        let ready = retry(budget, |_, _| async move {
            match client.inspect_container(id).await {
                Ok(Some(info)) if info.state == "running" => {
                    let host = info
                        .ip_address
                        .filter(|ip| !ip.is_empty())
                        .unwrap_or_else(|| name.to_string());
                    let _ = slot.set(host);
                    true
                }
                Ok(_) => false,
                Err(err) => {
                    tracing::debug!(container = name, error = %err, "inspect failed");
                    false
                }
            }
        })
        .await;
        match address.into_inner() {
            Some(address) if ready => Ok(address),
            _ => Err(ProvisionError::ReadinessTimeout {
                object: format!("container {name}"),
                budget_ms: self.config.container_wait_ms,
            }),
        }
    }
}

#[async_trait]
impl<C: EngineApi> ContainerBackend for EngineBackend<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn initialize(&self) -> Result<(), ProvisionError> {
        self.client.ping().await.map_err(ProvisionError::Client)?;
        tracing::info!(
            internal_networking = self.config.internal_networking,
            "container engine backend ready"
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
            match self.client.remove_container(handle).await {
                Ok(removed) => tracing::debug!(
                    proxy_id = proxy.id(),
                    container = %handle,
                    removed,
                    "container removed"
                ),
                Err(source) => failures.push(TeardownError::Remove {
                    object: format!("container {handle}"),
                    source,
                }),
            }
        }
        finish_teardown(self.allocator.as_ref(), proxy.id(), handles.len(), failures).await
    }

    async fn scan_existing_containers(&self) -> Result<Vec<ExistingContainerInfo>> {
        let found = self
            .client
            .list_containers(&metadata::managed_selector())
            .await?;
        let mut out = Vec::new();
        for info in found.into_iter().filter(|c| c.state == "running") {
            let (mut runtime_values, malformed_keys) =
                metadata::recover_values(&self.catalog, &info.labels);
            let address = info
                .ip_address
                .clone()
                .filter(|ip| !ip.is_empty())
                .unwrap_or_else(|| info.name.clone());
            runtime_values.set(&keys::CONTAINER_ADDRESS, address)?;
            out.push(ExistingContainerInfo {
                container_id: info.id,
                runtime_values,
                image: info.image,
                port_bindings: info.port_bindings,
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
