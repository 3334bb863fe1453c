//! Container-orchestrator backend.
//!
//! One pod per declared container, plus a node-port service when ports are
//! published. The first container of a proxy also reconciles the spec's
//! auxiliary manifests. Manifests are tagged with a group hash of the spec
//! and user so they can be found again without tracking state.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use berth_common::{BackendKind, ImagePullPolicy, KubernetesConfig, ManifestPolicy};
use futures::stream;
use http::Uri;
use k8s_openapi::api::core::v1::{
    Container as PodContainer, ContainerPort, EnvVar, HostPathVolumeSource, Pod, PodSpec,
    ResourceRequirements, SecurityContext, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::{Value, json};

use crate::application::ports::{
    ContainerBackend, KubeApi, LogStream, PortAllocator, StartContext,
};
use crate::application::services::metadata;
use crate::application::services::provisioning::{
    self, ResolvedPortMapping, finish_teardown, published_target,
};
use crate::application::services::retry::retry;
use crate::domain::runtime_value::{LABEL_NAMESPACE, RuntimeValueCatalog, keys};
use crate::domain::spec::parse_volume;
use crate::domain::{
    AuthenticatedUser, ConfigError, Container, ContainerBuilder, ContainerSpec,
    ExistingContainerInfo, PortMappingSpec, ProvisionError, Proxy, ProxySpec,
    ProxyStartupLogBuilder, SpecError, StartFailure, TeardownError,
};

const POD_CONTAINER_NAME: &str = "app";

/// Label selecting the pod of a node-port service.
#[must_use]
pub fn pod_selector_label() -> String {
    format!("{LABEL_NAMESPACE}/sp-pod")
}

/// Parse a `key=value[,key=value]*` node selector.
pub fn parse_node_selector(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut selector = BTreeMap::new();
    if raw.trim().is_empty() {
        return Ok(selector);
    }
    for pair in raw.split(',') {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::NodeSelector(raw.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::NodeSelector(raw.to_string()));
        }
        selector.insert(key.to_string(), value.trim().to_string());
    }
    Ok(selector)
}

fn parse_patch(raw: &str) -> Result<json_patch::Patch, SpecError> {
    serde_yaml::from_str(raw).map_err(|e| SpecError::InvalidPatch(e.to_string()))
}

/// Parse one auxiliary manifest. It must name its `apiVersion`, `kind` and
/// `metadata.name`.
fn parse_manifest(raw: &str) -> Result<Value, SpecError> {
    let manifest: Value =
        serde_yaml::from_str(raw).map_err(|e| SpecError::InvalidManifest(e.to_string()))?;
    for field in ["/apiVersion", "/kind", "/metadata/name"] {
        if manifest
            .pointer(field)
            .and_then(Value::as_str)
            .is_none_or(str::is_empty)
        {
            return Err(SpecError::InvalidManifest(format!("missing {field}")));
        }
    }
    Ok(manifest)
}

fn manifest_str<'a>(manifest: &'a Value, pointer: &str) -> &'a str {
    manifest.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
}

fn describe_manifest(manifest: &Value) -> String {
    format!(
        "{} {}",
        manifest_str(manifest, "/kind"),
        manifest_str(manifest, "/metadata/name")
    )
}

/// Persisted reference of a created manifest, `apiVersion:kind:namespace:name`.
fn manifest_ref(manifest: &Value) -> String {
    format!(
        "{}:{}:{}:{}",
        manifest_str(manifest, "/apiVersion"),
        manifest_str(manifest, "/kind"),
        manifest_str(manifest, "/metadata/namespace"),
        manifest_str(manifest, "/metadata/name"),
    )
}

fn manifest_from_ref(reference: &str) -> Option<(String, Value)> {
    let mut parts = reference.splitn(4, ':');
    let (api_version, kind, namespace, name) =
        (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
    let manifest = json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": { "name": name, "namespace": namespace },
    });
    Some((namespace.to_string(), manifest))
}

/// Set the namespace and the group label of a manifest.
fn tag_manifest(manifest: &mut Value, namespace: &str, group: &str) -> Result<(), SpecError> {
    let invalid = || SpecError::InvalidManifest("metadata is not an object".to_string());
    let meta = manifest
        .get_mut("metadata")
        .and_then(Value::as_object_mut)
        .ok_or_else(invalid)?;
    meta.insert("namespace".to_string(), Value::from(namespace));
    let labels = meta
        .entry("labels")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(invalid)?;
    labels.insert(metadata::manifest_group_label(), Value::from(group));
    Ok(())
}

/// Policy annotation of a manifest. `Some(Err(raw))` for unknown policies.
fn manifest_policy(manifest: &Value) -> Option<Result<ManifestPolicy, String>> {
    let raw = manifest
        .get("metadata")?
        .get("annotations")?
        .get(metadata::manifest_policy_annotation())?
        .as_str()?;
    Some(ManifestPolicy::parse(raw).ok_or_else(|| raw.to_string()))
}

/// Apply a YAML list of RFC 6902 operations to a generated pod.
fn apply_patches(pod: Pod, patches: Option<&str>) -> Result<Pod, SpecError> {
    let Some(raw) = patches.filter(|p| !p.trim().is_empty()) else {
        return Ok(pod);
    };
    let patch = parse_patch(raw)?;
    let mut doc =
        serde_json::to_value(&pod).map_err(|e| SpecError::InvalidPatch(e.to_string()))?;
    json_patch::patch(&mut doc, &patch.0).map_err(|e| SpecError::InvalidPatch(e.to_string()))?;
    serde_json::from_value(doc).map_err(|e| SpecError::InvalidPatch(e.to_string()))
}

/// Split a `namespace/pod` handle. Bare names live in `default_ns`.
fn split_handle<'a>(handle: &'a str, default_ns: &'a str) -> (&'a str, &'a str) {
    handle.split_once('/').unwrap_or((default_ns, handle))
}

/// Service port → node port of a node-port service.
fn node_ports(service: &Service) -> BTreeMap<u16, u16> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|p| {
            let port = u16::try_from(p.port).ok()?;
            let node = u16::try_from(p.node_port?).ok()?;
            Some((port, node))
        })
        .collect()
}

fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status.conditions.as_ref().is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Reason the scheduler gave for not placing the pod, if any.
fn unschedulable_reason(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "PodScheduled" && c.status == "False")
        .map(|c| {
            c.message
                .clone()
                .or_else(|| c.reason.clone())
                .unwrap_or_else(|| "unschedulable".to_string())
        })
}

pub struct OrchestratorBackend<C> {
    client: C,
    allocator: Arc<dyn PortAllocator>,
    catalog: Arc<RuntimeValueCatalog>,
    config: KubernetesConfig,
    node_selector: BTreeMap<String, String>,
    pull_policy: Option<ImagePullPolicy>,
}

impl<C: KubeApi> OrchestratorBackend<C> {
    /// Fails when the configured node selector is malformed.
    pub fn new(
        client: C,
        allocator: Arc<dyn PortAllocator>,
        catalog: Arc<RuntimeValueCatalog>,
        config: KubernetesConfig,
    ) -> Result<Self, ConfigError> {
        let node_selector = parse_node_selector(config.node_selector.as_deref().unwrap_or(""))?;
        let pull_policy = config.image_pull_policy.as_deref().and_then(|raw| {
            let policy = ImagePullPolicy::parse(raw);
            if policy.is_none() {
                tracing::warn!(policy = raw, "unknown image pull policy, using cluster default");
            }
            policy
        });
        Ok(Self {
            client,
            allocator,
            catalog,
            config,
            node_selector,
            pull_policy,
        })
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    #[must_use]
    pub fn pod_name(proxy_id: &str, index: usize) -> String {
        format!("sp-pod-{proxy_id}-{index}")
    }

    /// Check pod patches and auxiliary manifests of `spec`.
    pub fn validate_spec(spec: &ProxySpec) -> Result<(), SpecError> {
        if let Some(raw) = spec.kubernetes.pod_patches.as_deref() {
            parse_patch(raw)?;
        }
        for raw in spec
            .kubernetes
            .additional_manifests
            .iter()
            .chain(&spec.kubernetes.additional_persistent_manifests)
        {
            parse_manifest(raw)?;
        }
        Ok(())
    }

    // ── Manifests ─────────────────────────────────────────────────────────

    /// Apply one manifest per its policy annotation. Returns whether the
    /// object exists afterwards.
    async fn reconcile_manifest(&self, namespace: &str, manifest: &Value) -> Result<bool, ProvisionError> {
        let policy = match manifest_policy(manifest) {
            None => ManifestPolicy::CreateOnce,
            Some(Ok(policy)) => policy,
            Some(Err(raw)) => {
                tracing::warn!(
                    manifest = %describe_manifest(manifest),
                    policy = %raw,
                    "unknown manifest policy, leaving manifest untouched"
                );
                return Ok(false);
            }
        };
        let object = describe_manifest(manifest);
        let create_err = |source| ProvisionError::Create {
            object: object.clone(),
            source,
        };
        let exists = self
            .client
            .get_manifest(namespace, manifest)
            .await
            .map_err(ProvisionError::Client)?
            .is_some();
        match policy {
            ManifestPolicy::CreateOnce if exists => {}
            ManifestPolicy::CreateOnce => self
                .client
                .create_manifest(namespace, manifest)
                .await
                .map_err(create_err)?,
            ManifestPolicy::Patch if exists => self
                .client
                .patch_manifest(namespace, manifest)
                .await
                .map_err(create_err)?,
            ManifestPolicy::Patch => self
                .client
                .create_manifest(namespace, manifest)
                .await
                .map_err(create_err)?,
            ManifestPolicy::Replace => {
                if exists {
                    self.client
                        .delete_manifest(namespace, manifest)
                        .await
                        .map_err(create_err)?;
                }
                self.client
                    .create_manifest(namespace, manifest)
                    .await
                    .map_err(create_err)?;
            }
            ManifestPolicy::Delete => {
                if exists {
                    self.client
                        .delete_manifest(namespace, manifest)
                        .await
                        .map_err(create_err)?;
                }
                tracing::debug!(manifest = %object, "manifest deleted by policy");
                return Ok(false);
            }
        }
        tracing::debug!(manifest = %object, policy = ?policy, "manifest reconciled");
        Ok(true)
    }

    /// Reconcile every auxiliary manifest of the proxy. References of the
    /// non-persistent manifests that now exist are recorded on `container`
    /// one by one, so a later failure still tears down the earlier ones.
    async fn reconcile_manifests(
        &self,
        ctx: StartContext<'_>,
        container: &mut ContainerBuilder,
    ) -> Result<(), ProvisionError> {
        let group = metadata::manifest_group_hash(&ctx.proxy_spec.id, &ctx.user.id);
        let kube = &ctx.proxy_spec.kubernetes;
        let all = kube
            .additional_manifests
            .iter()
            .map(|raw| (raw, false))
            .chain(kube.additional_persistent_manifests.iter().map(|raw| (raw, true)));
        let mut created = Vec::new();
        for (raw, persistent) in all {
            let mut manifest = parse_manifest(raw)?;
            let namespace = match manifest_str(&manifest, "/metadata/namespace") {
                "" => self.config.namespace.clone(),
                ns => ns.to_string(),
            };
            tag_manifest(&mut manifest, &namespace, &group)?;
            if self.reconcile_manifest(&namespace, &manifest).await? && !persistent {
                created.push(manifest_ref(&manifest));
                container
                    .runtime_values_mut()
                    .set(&keys::ADDITIONAL_MANIFESTS, created.clone())?;
            }
        }
        Ok(())
    }

    /// Delete the spec's non-persistent manifests that belong to the
    /// spec/user group, whether or not a proxy tracked them. Returns how
    /// many were deleted.
    pub async fn cleanup_manifest_group(
        &self,
        spec: &ProxySpec,
        user: &AuthenticatedUser,
    ) -> Result<usize, ProvisionError> {
        let group = metadata::manifest_group_hash(&spec.id, &user.id);
        let label = metadata::manifest_group_label();
        let mut deleted = 0;
        for raw in &spec.kubernetes.additional_manifests {
            let manifest = parse_manifest(raw)?;
            let namespace = match manifest_str(&manifest, "/metadata/namespace") {
                "" => self.config.namespace.as_str(),
                ns => ns,
            };
            let Some(live) = self
                .client
                .get_manifest(namespace, &manifest)
                .await
                .map_err(ProvisionError::Client)?
            else {
                continue;
            };
            let tagged = live
                .get("metadata")
                .and_then(|m| m.get("labels"))
                .and_then(|l| l.get(&label))
                .and_then(Value::as_str)
                == Some(group.as_str());
            if tagged
                && self
                    .client
                    .delete_manifest(namespace, &manifest)
                    .await
                    .map_err(ProvisionError::Client)?
            {
                deleted += 1;
            }
        }
        tracing::info!(spec_id = %spec.id, user_id = %user.id, deleted, "manifest group cleaned up");
        Ok(deleted)
    }

    // ── Pods ──────────────────────────────────────────────────────────────

    fn build_pod(
        &self,
        name: &str,
        ctx: StartContext<'_>,
        container: &ContainerBuilder,
        spec: &ContainerSpec,
    ) -> Result<Pod, ProvisionError> {
        let proxy_values = ctx.proxy.runtime_values();
        let mut labels = metadata::merge_labels(
            &spec.labels,
            metadata::labels(&self.catalog, proxy_values, container.runtime_values()),
        );
        labels.insert(pod_selector_label(), name.to_string());
        let annotations =
            metadata::annotations(&self.catalog, proxy_values, container.runtime_values());
        let env = metadata::merge_env(
            &spec.env,
            &metadata::env_vars(&self.catalog, proxy_values, container.runtime_values()),
        )
        .into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            ..Default::default()
        })
        .collect();

        let quantities = |pairs: [(&str, &Option<String>); 2]| {
            let map: BTreeMap<String, Quantity> = pairs
                .into_iter()
                .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), Quantity(v.clone()))))
                .collect();
            (!map.is_empty()).then_some(map)
        };
        let resources = ResourceRequirements {
            requests: quantities([("memory", &spec.memory_request), ("cpu", &spec.cpu_request)]),
            limits: quantities([("memory", &spec.memory_limit), ("cpu", &spec.cpu_limit)]),
            ..Default::default()
        };

        let mut volumes = Vec::with_capacity(spec.volumes.len());
        let mut mounts = Vec::with_capacity(spec.volumes.len());
        for (i, raw) in spec.volumes.iter().enumerate() {
            let volume = parse_volume(raw)?;
            let volume_name = format!("volume-{i}");
            volumes.push(Volume {
                name: volume_name.clone(),
                host_path: Some(HostPathVolumeSource {
                    path: volume.source,
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: volume_name,
                mount_path: volume.target,
                read_only: volume.read_only.then_some(true),
                ..Default::default()
            });
        }

        let ports = spec
            .port_mappings
            .iter()
            .map(|m| ContainerPort {
                container_port: i32::from(m.port),
                ..Default::default()
            })
            .collect::<Vec<_>>();

        let pod_container = PodContainer {
            name: POD_CONTAINER_NAME.to_string(),
            image: Some(spec.image.clone()),
            command: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
            env: Some(env),
            resources: Some(resources),
            volume_mounts: (!mounts.is_empty()).then_some(mounts),
            security_context: spec.privileged.then(|| SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            image_pull_policy: self.pull_policy.map(|p| p.as_str().to_string()),
            ports: (!ports.is_empty()).then_some(ports),
            ..Default::default()
        };
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.config.namespace.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![pod_container],
                volumes: (!volumes.is_empty()).then_some(volumes),
                node_selector: (!self.node_selector.is_empty())
                    .then(|| self.node_selector.clone()),
                service_account_name: self.config.service_account.clone(),
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut pod = apply_patches(pod, ctx.proxy_spec.kubernetes.pod_patches.as_deref())?;
        // Patches may not move the pod; recovery relies on its name.
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some(self.config.namespace.clone());
        Ok(pod)
    }

    fn node_port_service(name: &str, namespace: &str, pod: &Pod, mappings: &[ResolvedPortMapping]) -> Service {
        let ports = mappings
            .iter()
            .filter_map(|m| {
                m.host_port.map(|host| ServicePort {
                    name: Some(m.name.clone()),
                    port: i32::from(m.port),
                    target_port: Some(IntOrString::Int(i32::from(m.port))),
                    node_port: Some(i32::from(host)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                })
            })
            .collect();
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: pod.metadata.labels.clone(),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                selector: Some(BTreeMap::from([(pod_selector_label(), name.to_string())])),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
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
        let name = Self::pod_name(proxy_id, index);
        let namespace = self.config.namespace.clone();

        let mappings = if self.config.internal_networking {
            spec.port_mappings
                .iter()
                .map(ResolvedPortMapping::unpublished)
                .collect()
        } else {
            provisioning::lease_ports(
                self.allocator.as_ref(),
                (self.config.node_port_range_start, self.config.node_port_range_end),
                proxy_id,
                &spec.port_mappings,
            )
            .await?
        };
        provisioning::record_container_values(
            container,
            &spec.image,
            &format!("{namespace}/{name}"),
            &mappings,
        )?;

        if index == 0 {
            self.reconcile_manifests(ctx, container).await?;
        }

        let pod = self.build_pod(&name, ctx, container, spec)?;
        log.scheduling(index)?;
        let created = self
            .client
            .create_pod(&namespace, &pod)
            .await
            .map_err(|source| ProvisionError::Create {
                object: format!("pod {namespace}/{name}"),
                source,
            })?;
        if let Some(uid) = created.metadata.uid {
            container.set_id(uid);
        } else {
            container.set_id(name.clone());
        }
        log.scheduled(index)?;
        log.starting_container(index)?;

        let pod_ip = self.await_ready(&namespace, &name).await?;
        container
            .runtime_values_mut()
            .set(&keys::CONTAINER_ADDRESS, pod_ip)?;
        log.container_started(index)?;

        if !self.config.internal_networking && !mappings.is_empty() {
            let service = Self::node_port_service(&name, &namespace, &pod, &mappings);
            self.client
                .create_service(&namespace, &service)
                .await
                .map_err(|source| ProvisionError::Create {
                    object: format!("service {namespace}/{name}"),
                    source,
                })?;
        }

        provisioning::resolve_targets(self, container, &mappings)?;
        tracing::info!(proxy_id, container_index = index, pod = %name, %namespace, "pod started");
        Ok(())
    }

    /// Poll until the pod is running and ready; returns its IP.
    async fn await_ready(&self, namespace: &str, name: &str) -> Result<String, ProvisionError> {
        let budget = Duration::from_millis(self.config.pod_wait_ms);
        let address = OnceLock::new();
        let slot = &address;
        let client = &self.client;
        let ready = retry(budget, |attempt, max| async move {
            match client.get_pod(namespace, name).await {
                Ok(Some(pod)) if pod_is_ready(&pod) => {
                    let ip = pod.status.and_then(|s| s.pod_ip).unwrap_or_default();
                    let _ = slot.set(ip);
                    true
                }
                Ok(_) => {
                    tracing::debug!(pod = name, attempt, max, "pod not ready yet");
                    false
                }
                Err(err) => {
                    tracing::debug!(pod = name, error = %err, "reading pod failed");
                    false
                }
            }
        })
        .await;
        if let Some(ip) = address.into_inner().filter(|_| ready) {
            return Ok(ip);
        }
        let object = format!("pod {namespace}/{name}");
        let pending = self.client.get_pod(namespace, name).await.ok().flatten();
        if let Some(reason) = pending.as_ref().and_then(unschedulable_reason) {
            return Err(ProvisionError::Scheduling { object, reason });
        }
        Err(ProvisionError::ReadinessTimeout {
            object,
            budget_ms: self.config.pod_wait_ms,
        })
    }

    async fn teardown_container(&self, container: &Container, failures: &mut Vec<TeardownError>) {
        let values = container.runtime_values();
        if let Some(handle) = values.get_or_none::<String>(&keys::BACKEND_CONTAINER_NAME) {
            let (namespace, pod) = split_handle(&handle, &self.config.namespace);
            if let Err(source) = self.client.delete_service(namespace, pod).await {
                failures.push(TeardownError::Remove {
                    object: format!("service {namespace}/{pod}"),
                    source,
                });
            }
            match self.client.delete_pod(namespace, pod).await {
                Ok(removed) => tracing::debug!(pod = %handle, removed, "pod removed"),
                Err(source) => failures.push(TeardownError::Remove {
                    object: format!("pod {handle}"),
                    source,
                }),
            }
        }
        let refs = values
            .get_or_none::<Vec<String>>(&keys::ADDITIONAL_MANIFESTS)
            .unwrap_or_default();
        for reference in &refs {
            let Some((namespace, manifest)) = manifest_from_ref(reference) else {
                tracing::warn!(reference = %reference, "malformed manifest reference");
                continue;
            };
            if let Err(source) = self.client.delete_manifest(&namespace, &manifest).await {
                failures.push(TeardownError::Remove {
                    object: format!("manifest {reference}"),
                    source,
                });
            }
        }
    }
}

#[async_trait]
impl<C: KubeApi> ContainerBackend for OrchestratorBackend<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::Kubernetes
    }

    async fn initialize(&self) -> Result<(), ProvisionError> {
        self.client.ping().await.map_err(ProvisionError::Client)?;
        tracing::info!(
            namespace = %self.config.namespace,
            internal_networking = self.config.internal_networking,
            "orchestrator backend ready"
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
        for container in proxy.containers() {
            self.teardown_container(container, &mut failures).await;
        }
        finish_teardown(
            self.allocator.as_ref(),
            proxy.id(),
            proxy.containers().len(),
            failures,
        )
        .await
    }

    async fn scan_existing_containers(&self) -> Result<Vec<ExistingContainerInfo>> {
        let selector = metadata::managed_selector();
        let mut out = Vec::new();
        let mut listed = 0;
        let mut last_error = None;
        for namespace in self.config.scanned_namespaces() {
            let pods = match self.client.list_pods(&namespace, &selector).await {
                Ok(pods) => pods,
                Err(err) => {
                    tracing::warn!(%namespace, error = %err, "cannot list pods, skipping namespace");
                    last_error = Some(err);
                    continue;
                }
            };
            listed += 1;
            for pod in pods {
                let Some(name) = pod.metadata.name.clone() else {
                    continue;
                };
                let status = pod.status.clone().unwrap_or_default();
                if status.phase.as_deref() != Some("Running") {
                    tracing::debug!(pod = %name, %namespace, "pod not running, skipping");
                    continue;
                }
                let mut meta = pod.metadata.annotations.clone().unwrap_or_default();
                meta.extend(pod.metadata.labels.clone().unwrap_or_default());
                let (mut runtime_values, malformed_keys) =
                    metadata::recover_values(&self.catalog, &meta);
                if let Some(ip) = status.pod_ip {
                    runtime_values.set(&keys::CONTAINER_ADDRESS, ip)?;
                }
                let image = pod
                    .spec
                    .as_ref()
                    .and_then(|s| s.containers.first())
                    .and_then(|c| c.image.clone())
                    .unwrap_or_default();
                let port_bindings = if self.config.internal_networking {
                    BTreeMap::new()
                } else {
                    match self.client.get_service(&namespace, &name).await {
                        Ok(service) => service.map(|s| node_ports(&s)).unwrap_or_default(),
                        Err(err) => {
                            tracing::warn!(pod = %name, %namespace, error = %err, "cannot read pod service, skipping");
                            continue;
                        }
                    }
                };
                out.push(ExistingContainerInfo {
                    container_id: pod.metadata.uid.clone().unwrap_or_else(|| name.clone()),
                    runtime_values,
                    image,
                    port_bindings,
                    malformed_keys,
                });
            }
        }
        match last_error {
            Some(err) if listed == 0 => Err(err),
            _ => Ok(out),
        }
    }

    fn calculate_target(
        &self,
        container: &Container,
        mapping: &PortMappingSpec,
        host_port: Option<u16>,
    ) -> Result<Uri, ProvisionError> {
        if self.config.internal_networking {
            let ip = container
                .runtime_values()
                .get_or_none::<String>(&keys::CONTAINER_ADDRESS)
                .filter(|ip| !ip.is_empty())
                .ok_or_else(|| ProvisionError::Target {
                    mapping: mapping.name.clone(),
                    reason: "pod has no IP".to_string(),
                })?;
            provisioning::build_target(mapping, &ip, mapping.port)
        } else {
            published_target(mapping, &self.config.public_host, host_port)
        }
    }

    async fn attach_output(&self, proxy: &Proxy) -> Result<Option<LogStream>> {
        let streams: Vec<LogStream> = proxy
            .containers()
            .iter()
            .filter_map(|c| {
                c.runtime_values()
                    .get_or_none::<String>(&keys::BACKEND_CONTAINER_NAME)
            })
            .map(|handle| {
                let (namespace, pod) = split_handle(&handle, &self.config.namespace);
                self.client.pod_logs(namespace, pod)
            })
            .collect();
        if streams.is_empty() {
            return Ok(None);
        }
        Ok(Some(Box::pin(stream::select_all(streams))))
    }
}
