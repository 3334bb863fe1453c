//! Whole-proxy start and stop on top of a [`ContainerBackend`].

use berth_common::ProxyStatus;
use chrono::Utc;

use crate::application::ports::{ContainerBackend, StartContext};
use crate::application::services::metadata::{self, ProxyValueInputs};
use crate::domain::runtime_value::keys;
use crate::domain::{
    AuthenticatedUser, ContainerBuilder, Proxy, ProxyBuilder, ProxySpec, ProxyStartFailure,
    ProxyStartupLogBuilder, RuntimeValueError, TeardownError,
};

/// Assemble a new proxy with its proxy-wide runtime values.
pub fn new_proxy(inputs: ProxyValueInputs<'_>) -> Result<ProxyBuilder, RuntimeValueError> {
    let values = metadata::proxy_runtime_values(inputs)?;
    let mut builder = ProxyBuilder::new(inputs.proxy_id);
    builder
        .user_id(inputs.user.id.as_str())
        .spec_id(inputs.spec.id.as_str())
        .display_name(inputs.spec.display_name.clone())
        .created_at(values.get_as(&keys::CREATED_TIMESTAMP)?);
    builder.runtime_values_mut().extend_from(&values);
    Ok(builder)
}

/// Start every declared container in order.
///
/// On the first failure the partial proxy is stopped again, which deletes
/// what was created and releases leased ports.
pub async fn start_proxy(
    backend: &dyn ContainerBackend,
    mut proxy: ProxyBuilder,
    spec: &ProxySpec,
    user: &AuthenticatedUser,
    log: &mut ProxyStartupLogBuilder,
) -> Result<Proxy, ProxyStartFailure> {
    for (index, container_spec) in spec.container_specs.iter().enumerate() {
        let snapshot = proxy.build();
        let ctx = StartContext {
            user,
            proxy: &snapshot,
            proxy_spec: spec,
        };
        match backend
            .start_container(ctx, ContainerBuilder::new(index), container_spec, log)
            .await
        {
            Ok(container) => {
                proxy.upsert_container(container);
            }
            Err(failure) => {
                tracing::warn!(
                    proxy_id = proxy.id(),
                    container_index = index,
                    error = %failure.error,
                    "container failed to start, stopping proxy"
                );
                proxy
                    .upsert_container(failure.container.clone())
                    .status(ProxyStatus::Stopping);
                let cleanup = backend.stop_proxy(&proxy.build()).await.err();
                match &cleanup {
                    None => {
                        proxy.status(ProxyStatus::Stopped);
                    }
                    Some(err) => {
                        tracing::error!(proxy_id = proxy.id(), error = %err, "partial proxy cleanup failed");
                    }
                }
                return Err(ProxyStartFailure {
                    proxy: proxy.build(),
                    error: failure,
                    cleanup,
                });
            }
        }
    }
    proxy.status(ProxyStatus::Up).started_at(Utc::now());
    let proxy = proxy.build();
    tracing::info!(
        proxy_id = proxy.id(),
        backend = backend.kind().as_str(),
        containers = proxy.containers().len(),
        "proxy started"
    );
    Ok(proxy)
}

/// Tear down `proxy`. Stopping an already stopped proxy succeeds.
pub async fn stop_proxy(
    backend: &dyn ContainerBackend,
    proxy: &Proxy,
) -> Result<Proxy, TeardownError> {
    backend.stop_proxy(proxy).await?;
    let mut stopped = proxy.to_builder();
    stopped.status(ProxyStatus::Stopped);
    Ok(stopped.build())
}
