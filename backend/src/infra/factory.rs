//! Wiring from loaded [`Settings`] to concrete clients and backends.

use std::sync::Arc;

use anyhow::{Context, Result};
use berth_common::{BackendKind, PortStoreConfig, PortStoreKind};

use crate::application::ports::{ContainerBackend, PortAllocator};
use crate::application::services::backends::{ClusterBackend, EngineBackend, OrchestratorBackend};
use crate::application::services::port_allocator::{MemoryPortAllocator, StorePortAllocator};
use crate::application::services::recovery::{RecoveryReport, SameInstancePolicy, recover_proxies};
use crate::domain::RuntimeValueCatalog;
use crate::infra::config::Settings;
use crate::infra::docker::BollardDocker;
use crate::infra::kubernetes::KubeClient;
use crate::infra::valkey::ValkeyLeaseStore;

/// The backend selected by configuration.
pub enum Backend {
    Engine(EngineBackend<BollardDocker>),
    Cluster(ClusterBackend<BollardDocker>),
    Orchestrator(OrchestratorBackend<KubeClient>),
}

impl Backend {
    #[must_use]
    pub fn as_dyn(&self) -> &dyn ContainerBackend {
        match self {
            Self::Engine(backend) => backend,
            Self::Cluster(backend) => backend,
            Self::Orchestrator(backend) => backend,
        }
    }
}

pub async fn build_port_allocator(config: &PortStoreConfig) -> Result<Arc<dyn PortAllocator>> {
    match config.kind {
        PortStoreKind::Memory => Ok(Arc::new(MemoryPortAllocator::new())),
        PortStoreKind::Valkey => {
            let store = ValkeyLeaseStore::connect(&config.valkey_url)
                .await
                .context("failed to initialise port-lease store")?;
            Ok(Arc::new(StorePortAllocator::new(store)))
        }
    }
}

/// Connect the client of the selected backend and build the backend.
/// Connectivity is checked later by `initialize`.
pub async fn build_backend(
    settings: &Settings,
    allocator: Arc<dyn PortAllocator>,
    catalog: Arc<RuntimeValueCatalog>,
) -> Result<Backend> {
    let backend = match settings.selection.backend {
        BackendKind::Docker => {
            let client = BollardDocker::connect(settings.docker.url.as_deref())?;
            Backend::Engine(EngineBackend::new(
                client,
                allocator,
                catalog,
                settings.docker.clone(),
            ))
        }
        BackendKind::DockerSwarm => {
            let client = BollardDocker::connect(settings.swarm.url.as_deref())?;
            Backend::Cluster(ClusterBackend::new(
                client,
                allocator,
                catalog,
                settings.swarm.clone(),
            ))
        }
        BackendKind::Kubernetes => {
            let client = KubeClient::connect().await?;
            Backend::Orchestrator(OrchestratorBackend::new(
                client,
                allocator,
                catalog,
                settings.kubernetes.clone(),
            )?)
        }
    };
    Ok(backend)
}

/// A started control plane: backend, allocator and catalog after the
/// recovery pass.
pub struct ControlPlane {
    pub backend: Backend,
    pub allocator: Arc<dyn PortAllocator>,
    pub catalog: Arc<RuntimeValueCatalog>,
}

impl ControlPlane {
    /// Build everything from `settings`, check connectivity, then re-adopt
    /// the proxies an earlier process of this deployment instance left
    /// behind.
    pub async fn start(settings: &Settings) -> Result<(Self, RecoveryReport)> {
        let catalog = Arc::new(RuntimeValueCatalog::standard()?);
        let allocator = build_port_allocator(&settings.port_store).await?;
        let backend = build_backend(settings, allocator.clone(), catalog.clone()).await?;
        backend
            .as_dyn()
            .initialize()
            .await
            .context("backend initialisation failed")?;

        let policy = SameInstancePolicy::new(settings.selection.deployment_instance_id.clone());
        let report = recover_proxies(backend.as_dyn(), allocator.as_ref(), &catalog, &policy)
            .await
            .context("recovery scan failed")?;
        tracing::info!(
            backend = settings.selection.backend.as_str(),
            recovered = report.proxies.len(),
            skipped = report.skipped.len(),
            "control plane ready"
        );
        Ok((
            Self {
                backend,
                allocator,
                catalog,
            },
            report,
        ))
    }
}
