//! Proxy and container entities.
//!
//! Published entities are immutable snapshots. Provisioning mutates a
//! [`ProxyBuilder`] / [`ContainerBuilder`] and takes a fresh snapshot with
//! `build()` whenever it hands state to a caller, so earlier snapshots never
//! observe later mutations.

use std::collections::BTreeMap;

use berth_common::ProxyStatus;
use chrono::{DateTime, Utc};
use http::Uri;

use crate::domain::runtime_value::{RuntimeValues, keys};

/// Authenticated owner of a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthenticatedUser {
    pub id: String,
    pub groups: Vec<String>,
}

impl AuthenticatedUser {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            groups: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }
}

/// Generate a unique proxy identifier: 32 lowercase hex characters.
///
/// Entropy sources: nanosecond timestamp and two independent `RandomState` hashes.
#[must_use]
pub fn generate_proxy_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut high = RandomState::new().build_hasher();
    high.write_u128(nanos);
    let mut low = RandomState::new().build_hasher();
    low.write_u64(high.finish());
    low.write_u128(nanos);
    format!("{:016x}{:016x}", high.finish(), low.finish())
}

// ── Container ─────────────────────────────────────────────────────────────────

/// One backend-native compute unit of a proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    index: usize,
    id: Option<String>,
    targets: BTreeMap<String, Uri>,
    runtime_values: RuntimeValues,
}

impl Container {
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Backend-assigned id, once the object exists.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Resolved target per port-mapping name.
    #[must_use]
    pub fn targets(&self) -> &BTreeMap<String, Uri> {
        &self.targets
    }

    #[must_use]
    pub fn runtime_values(&self) -> &RuntimeValues {
        &self.runtime_values
    }

    #[must_use]
    pub fn to_builder(&self) -> ContainerBuilder {
        ContainerBuilder {
            inner: self.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    inner: Container,
}

impl ContainerBuilder {
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            inner: Container {
                index,
                id: None,
                targets: BTreeMap::new(),
                runtime_values: RuntimeValues::new(),
            },
        }
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.inner.index
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.inner.id.as_deref()
    }

    pub fn set_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.inner.id = Some(id.into());
        self
    }

    pub fn add_target(&mut self, mapping: impl Into<String>, target: Uri) -> &mut Self {
        self.inner.targets.insert(mapping.into(), target);
        self
    }

    pub fn runtime_values_mut(&mut self) -> &mut RuntimeValues {
        &mut self.inner.runtime_values
    }

    #[must_use]
    pub fn runtime_values(&self) -> &RuntimeValues {
        &self.inner.runtime_values
    }

    /// Snapshot the current state.
    #[must_use]
    pub fn build(&self) -> Container {
        self.inner.clone()
    }
}

// ── Proxy ─────────────────────────────────────────────────────────────────────

/// One running or stopped app instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Proxy {
    id: String,
    status: ProxyStatus,
    user_id: String,
    spec_id: String,
    display_name: Option<String>,
    created_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    containers: Vec<Container>,
    runtime_values: RuntimeValues,
}

impl Proxy {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn status(&self) -> ProxyStatus {
        self.status
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn spec_id(&self) -> &str {
        &self.spec_id
    }

    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    #[must_use]
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    #[must_use]
    pub fn containers(&self) -> &[Container] {
        &self.containers
    }

    #[must_use]
    pub fn container(&self, index: usize) -> Option<&Container> {
        self.containers.iter().find(|c| c.index == index)
    }

    #[must_use]
    pub fn runtime_values(&self) -> &RuntimeValues {
        &self.runtime_values
    }

    /// The deployment instance that created this proxy, if recorded.
    #[must_use]
    pub fn deployment_instance_id(&self) -> Option<String> {
        self.runtime_values.get_or_none(&keys::DEPLOYMENT_INSTANCE_ID)
    }

    #[must_use]
    pub fn to_builder(&self) -> ProxyBuilder {
        ProxyBuilder {
            inner: self.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyBuilder {
    inner: Proxy,
}

impl ProxyBuilder {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            inner: Proxy {
                id: id.into(),
                status: ProxyStatus::New,
                user_id: String::new(),
                spec_id: String::new(),
                display_name: None,
                created_at: None,
                started_at: None,
                containers: Vec::new(),
                runtime_values: RuntimeValues::new(),
            },
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn status(&mut self, status: ProxyStatus) -> &mut Self {
        self.inner.status = status;
        self
    }

    pub fn user_id(&mut self, user_id: impl Into<String>) -> &mut Self {
        self.inner.user_id = user_id.into();
        self
    }

    pub fn spec_id(&mut self, spec_id: impl Into<String>) -> &mut Self {
        self.inner.spec_id = spec_id.into();
        self
    }

    pub fn display_name(&mut self, name: Option<String>) -> &mut Self {
        self.inner.display_name = name;
        self
    }

    pub fn created_at(&mut self, at: DateTime<Utc>) -> &mut Self {
        self.inner.created_at = Some(at);
        self
    }

    pub fn started_at(&mut self, at: DateTime<Utc>) -> &mut Self {
        self.inner.started_at = Some(at);
        self
    }

    /// Insert `container`, replacing any container with the same index.
    /// Containers stay ordered by index.
    pub fn upsert_container(&mut self, container: Container) -> &mut Self {
        match self
            .inner
            .containers
            .binary_search_by_key(&container.index, |c| c.index)
        {
            Ok(pos) => self.inner.containers[pos] = container,
            Err(pos) => self.inner.containers.insert(pos, container),
        }
        self
    }

    pub fn runtime_values_mut(&mut self) -> &mut RuntimeValues {
        &mut self.inner.runtime_values
    }

    /// Snapshot the current state.
    #[must_use]
    pub fn build(&self) -> Proxy {
        self.inner.clone()
    }
}

// ── Recovery scan results ─────────────────────────────────────────────────────

/// One backend object found by a scan. Lives only during recovery.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingContainerInfo {
    pub container_id: String,
    /// Every persisted value that parsed, proxy-wide and container-specific.
    pub runtime_values: RuntimeValues,
    pub image: String,
    /// Container port → published host port.
    pub port_bindings: BTreeMap<u16, u16>,
    /// Persisted keys whose values did not parse.
    pub malformed_keys: Vec<String>,
}
