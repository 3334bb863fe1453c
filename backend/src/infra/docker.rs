//! Container engine and swarm client backed by `bollard`.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    EndpointPortConfig, EndpointPortConfigProtocolEnum, EndpointSpec, HostConfig, Limit, Mount,
    MountTypeEnum, NetworkAttachmentConfig, PortBinding, PortMap, ResourceObject, ServiceSpec,
    TaskSpec, TaskSpecContainerSpec, TaskSpecContainerSpecDnsConfig, TaskSpecContainerSpecFile,
    TaskSpecContainerSpecSecrets, TaskSpecResources,
};
use bollard::network::ConnectNetworkOptions;
use bollard::secret::ListSecretsOptions;
use bollard::service::ListServicesOptions;
use bollard::task::ListTasksOptions;
use futures::{StreamExt, TryStreamExt};

use crate::application::ports::{
    ClusterService, EngineApi, EngineContainer, EngineContainerRequest, LogStream, ServiceRequest,
    ServiceTask, SwarmApi,
};

const CONNECT_TIMEOUT_SECS: u64 = 120;

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn label_filter(label: &str) -> HashMap<String, Vec<String>> {
    HashMap::from([("label".to_string(), vec![label.to_string()])])
}

fn to_hash_map(map: &BTreeMap<String, String>) -> HashMap<String, String> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Parse a port-map key such as `8080/tcp`.
fn container_port(key: &str) -> Option<u16> {
    key.split('/').next()?.parse().ok()
}

fn port_bindings_from(ports: Option<&PortMap>) -> BTreeMap<u16, u16> {
    let Some(ports) = ports else {
        return BTreeMap::new();
    };
    ports
        .iter()
        .filter_map(|(key, bindings)| {
            let host = bindings
                .as_ref()?
                .iter()
                .find_map(|b| b.host_port.as_deref()?.parse().ok())?;
            Some((container_port(key)?, host))
        })
        .collect()
}

/// Split an engine bind spec `source:target[:ro]`.
fn bind_mount(bind: &str) -> Mount {
    let mut parts = bind.splitn(3, ':');
    let source = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();
    Mount {
        source: Some(source),
        target: Some(target),
        typ: Some(MountTypeEnum::BIND),
        read_only: Some(parts.next() == Some("ro")),
        ..Default::default()
    }
}

#[derive(Clone)]
pub struct BollardDocker {
    docker: Docker,
}

impl BollardDocker {
    /// Connect to `url`, or to the local daemon socket when `None`.
    pub fn connect(url: Option<&str>) -> Result<Self> {
        let docker = match url {
            Some(url) => {
                Docker::connect_with_http(url, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                    .with_context(|| format!("cannot connect to container engine at {url}"))?
            }
            None => Docker::connect_with_local_defaults()
                .context("cannot connect to local container engine")?,
        };
        Ok(Self { docker })
    }

    async fn ping_daemon(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .context("container engine ping failed")?;
        Ok(())
    }

    fn log_stream(&self, id: &str) -> LogStream {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let context = format!("log stream of {id} failed");
        Box::pin(
            self.docker
                .logs(id, Some(options))
                .map_ok(|output| output.to_string())
                .map_err(move |e| anyhow::Error::new(e).context(context.clone())),
        )
    }
}

// ── Single engine ─────────────────────────────────────────────────────────────

#[async_trait]
impl EngineApi for BollardDocker {
    async fn ping(&self) -> Result<()> {
        self.ping_daemon().await
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("cannot inspect image {image}")),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            let info = step.with_context(|| format!("cannot pull image {image}"))?;
            if let Some(status) = info.status {
                tracing::debug!(image, status = %status, "pull progress");
            }
        }
        Ok(())
    }

    async fn create_container(&self, request: &EngineContainerRequest) -> Result<String> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = request
            .port_bindings
            .keys()
            .map(|port| (format!("{port}/tcp"), HashMap::new()))
            .collect();
        let port_bindings: PortMap = request
            .port_bindings
            .iter()
            .map(|(port, host)| {
                let binding = PortBinding {
                    host_ip: None,
                    host_port: Some(host.to_string()),
                };
                (format!("{port}/tcp"), Some(vec![binding]))
            })
            .collect();
        let host_config = HostConfig {
            binds: Some(request.binds.clone()),
            network_mode: request.network.clone(),
            dns: (!request.dns.is_empty()).then(|| request.dns.clone()),
            memory: request.memory_limit,
            memory_reservation: request.memory_reservation,
            nano_cpus: request.nano_cpus,
            privileged: Some(request.privileged),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };
        let config = Config {
            image: Some(request.image.clone()),
            cmd: (!request.cmd.is_empty()).then(|| request.cmd.clone()),
            env: Some(request.env.clone()),
            labels: Some(to_hash_map(&request.labels)),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: request.name.as_str(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .with_context(|| format!("cannot create container {}", request.name))?;
        for warning in &response.warnings {
            tracing::warn!(container = %request.name, warning = %warning, "engine warning");
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("cannot start container {id}"))
    }

    async fn connect_network(&self, id: &str, network: &str) -> Result<()> {
        let options = ConnectNetworkOptions {
            container: id,
            ..Default::default()
        };
        self.docker
            .connect_network(network, options)
            .await
            .with_context(|| format!("cannot connect container {id} to network {network}"))
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<EngineContainer>> {
        let info = match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("cannot inspect container {id}")),
        };
        let state = info
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(ToString::to_string)
            .unwrap_or_default();
        let config = info.config.unwrap_or_default();
        let network = info.network_settings.unwrap_or_default();
        let ip_address = network
            .networks
            .as_ref()
            .and_then(|nets| nets.values().find_map(|n| n.ip_address.clone()))
            .filter(|ip| !ip.is_empty())
            .or(network.ip_address.clone());
        Ok(Some(EngineContainer {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image: config.image.unwrap_or_default(),
            state,
            labels: config.labels.unwrap_or_default().into_iter().collect(),
            port_bindings: port_bindings_from(network.ports.as_ref()),
            ip_address,
        }))
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<EngineContainer>> {
        let options = ListContainersOptions {
            all: true,
            filters: label_filter(label),
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .context("cannot list containers")?;
        Ok(summaries
            .into_iter()
            .map(|c| {
                let port_bindings = c
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|p| Some((p.private_port, p.public_port?)))
                    .collect();
                let ip_address = c
                    .network_settings
                    .and_then(|s| s.networks)
                    .and_then(|nets| nets.into_values().find_map(|n| n.ip_address))
                    .filter(|ip| !ip.is_empty());
                EngineContainer {
                    id: c.id.unwrap_or_default(),
                    name: c
                        .names
                        .and_then(|names| names.into_iter().next())
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_default(),
                    image: c.image.unwrap_or_default(),
                    state: c.state.map(|s| s.to_string()).unwrap_or_default(),
                    labels: c.labels.unwrap_or_default().into_iter().collect(),
                    port_bindings,
                    ip_address,
                }
            })
            .collect())
    }

    async fn remove_container(&self, id: &str) -> Result<bool> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("cannot remove container {id}")),
        }
    }

    fn container_logs(&self, id: &str) -> LogStream {
        self.log_stream(id)
    }
}

// ── Swarm ─────────────────────────────────────────────────────────────────────

fn service_spec(request: &ServiceRequest) -> ServiceSpec {
    let labels = to_hash_map(&request.labels);
    let secrets = request
        .secrets
        .iter()
        .map(|s| TaskSpecContainerSpecSecrets {
            file: Some(TaskSpecContainerSpecFile {
                name: Some(s.target.clone()),
                uid: Some(s.uid.clone()),
                gid: Some(s.gid.clone()),
                mode: Some(s.mode),
            }),
            secret_id: Some(s.secret_id.clone()),
            secret_name: Some(s.secret_name.clone()),
        })
        .collect();
    let container_spec = TaskSpecContainerSpec {
        image: Some(request.image.clone()),
        command: (!request.cmd.is_empty()).then(|| request.cmd.clone()),
        env: Some(request.env.clone()),
        labels: Some(labels.clone()),
        mounts: Some(request.binds.iter().map(|b| bind_mount(b)).collect()),
        dns_config: (!request.dns.is_empty()).then(|| TaskSpecContainerSpecDnsConfig {
            nameservers: Some(request.dns.clone()),
            ..Default::default()
        }),
        secrets: Some(secrets),
        ..Default::default()
    };
    let resources = TaskSpecResources {
        limits: Some(Limit {
            nano_cpus: request.nano_cpus_limit,
            memory_bytes: request.memory_limit,
            ..Default::default()
        }),
        reservations: Some(ResourceObject {
            nano_cpus: request.nano_cpus_reservation,
            memory_bytes: request.memory_reservation,
            ..Default::default()
        }),
        ..Default::default()
    };
    let ports = request
        .published_ports
        .iter()
        .map(|(target, published)| EndpointPortConfig {
            protocol: Some(EndpointPortConfigProtocolEnum::TCP),
            target_port: Some(i64::from(*target)),
            published_port: Some(i64::from(*published)),
            ..Default::default()
        })
        .collect();
    ServiceSpec {
        name: Some(request.name.clone()),
        labels: Some(labels),
        task_template: Some(TaskSpec {
            container_spec: Some(container_spec),
            resources: Some(resources),
            networks: Some(
                request
                    .networks
                    .iter()
                    .map(|n| NetworkAttachmentConfig {
                        target: Some(n.clone()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        endpoint_spec: Some(EndpointSpec {
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl SwarmApi for BollardDocker {
    async fn ping(&self) -> Result<()> {
        self.ping_daemon().await
    }

    async fn find_secret(&self, name: &str) -> Result<Option<String>> {
        let options = ListSecretsOptions {
            filters: HashMap::from([("name", vec![name])]),
        };
        let secrets = self
            .docker
            .list_secrets(Some(options))
            .await
            .context("cannot list secrets")?;
        // The name filter matches prefixes.
        Ok(secrets
            .into_iter()
            .find(|s| s.spec.as_ref().and_then(|spec| spec.name.as_deref()) == Some(name))
            .and_then(|s| s.id))
    }

    async fn create_service(&self, request: &ServiceRequest) -> Result<String> {
        let response = self
            .docker
            .create_service(service_spec(request), None)
            .await
            .with_context(|| format!("cannot create service {}", request.name))?;
        response
            .id
            .with_context(|| format!("service {} was created without an id", request.name))
    }

    async fn service_tasks(&self, service: &str) -> Result<Vec<ServiceTask>> {
        let options = ListTasksOptions {
            filters: HashMap::from([("service", vec![service])]),
        };
        let tasks = self
            .docker
            .list_tasks(Some(options))
            .await
            .with_context(|| format!("cannot list tasks of service {service}"))?;
        Ok(tasks
            .into_iter()
            .map(|task| {
                let status = task.status.unwrap_or_default();
                ServiceTask {
                    state: status.state.map(|s| s.to_string()).unwrap_or_default(),
                    container_id: status
                        .container_status
                        .and_then(|c| c.container_id)
                        .filter(|id| !id.is_empty()),
                    error: status.err,
                }
            })
            .collect())
    }

    async fn list_services(&self, label: &str) -> Result<Vec<ClusterService>> {
        let options = ListServicesOptions {
            filters: label_filter(label),
            ..Default::default()
        };
        let services = self
            .docker
            .list_services(Some(options))
            .await
            .context("cannot list services")?;
        Ok(services
            .into_iter()
            .map(|service| {
                let spec = service.spec.unwrap_or_default();
                let published_ports = service
                    .endpoint
                    .and_then(|e| e.ports)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|p| {
                        let target = u16::try_from(p.target_port?).ok()?;
                        let published = u16::try_from(p.published_port?).ok()?;
                        Some((target, published))
                    })
                    .collect();
                ClusterService {
                    id: service.id.unwrap_or_default(),
                    name: spec.name.unwrap_or_default(),
                    image: spec
                        .task_template
                        .and_then(|t| t.container_spec)
                        .and_then(|c| c.image)
                        .unwrap_or_default(),
                    labels: spec.labels.unwrap_or_default().into_iter().collect(),
                    published_ports,
                }
            })
            .collect())
    }

    async fn remove_service(&self, service: &str) -> Result<bool> {
        match self.docker.delete_service(service).await {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("cannot remove service {service}")),
        }
    }

    fn container_logs(&self, container_id: &str) -> LogStream {
        self.log_stream(container_id)
    }
}
