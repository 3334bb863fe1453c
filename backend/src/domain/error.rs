//! Typed domain error enums.
//!
//! This module has zero imports from `crate::infra` or `crate::application`.
//! Substrate client failures arrive as `anyhow::Error` and are wrapped at the
//! application boundary.

use berth_common::StartupStepKind;
use thiserror::Error;

use crate::domain::proxy::{Container, Proxy};
use crate::domain::runtime_value::ValueKind;

// ── Runtime-value errors ──────────────────────────────────────────────────────

/// Catalog construction and lookup failures. Construction failures are
/// configuration faults and abort startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("runtime value key '{0}' is already registered")]
    Duplicate(String),

    #[error("runtime value key '{0}' is not registered")]
    NotFound(String),

    #[error("invalid runtime value key name '{0}': must match ^[a-z0-9]+(-[a-z0-9]+)*$, at most 50 characters")]
    InvalidName(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuntimeValueError {
    #[error("runtime value '{key}' expects {expected:?}, got {actual:?}")]
    TypeMismatch {
        key: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("runtime value '{0}' is not set")]
    Missing(String),

    #[error("runtime value '{key}' cannot be parsed from '{raw}': {reason}")]
    Malformed {
        key: String,
        raw: String,
        reason: String,
    },
}

// ── Startup timeline errors ───────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartupLogError {
    #[error("container {index}: step {step:?} cannot move from {from} to {to}")]
    IllegalTransition {
        index: usize,
        step: StartupStepKind,
        from: &'static str,
        to: &'static str,
    },
}

// ── Spec errors ───────────────────────────────────────────────────────────────

/// Malformed declarative spec content.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("invalid {field} quantity '{value}'")]
    InvalidQuantity { field: &'static str, value: String },

    #[error("invalid volume '{0}': expected host:container[:ro|rw]")]
    InvalidVolume(String),

    #[error("invalid pod patch: {0}")]
    InvalidPatch(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
}

// ── Port allocation errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PortAllocationError {
    #[error("no free port in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },

    #[error("invalid port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },

    #[error("invalid owner id '{owner}': {reason}")]
    InvalidOwner { owner: String, reason: &'static str },

    #[error("port {port} is leased to '{holder}'")]
    Conflict { port: u16, holder: String },

    #[error("port lease store failed")]
    Store(#[source] anyhow::Error),
}

impl PortAllocationError {
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

// ── Provisioning errors ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to pull image '{image}'")]
    ImagePull {
        image: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to create {object}")]
    Create {
        object: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{object} did not become ready within {budget_ms} ms")]
    ReadinessTimeout { object: String, budget_ms: u64 },

    #[error("{object} failed to schedule: {reason}")]
    Scheduling { object: String, reason: String },

    #[error("secret '{0}' does not exist")]
    SecretMissing(String),

    #[error(transparent)]
    InvalidSpec(#[from] SpecError),

    #[error(transparent)]
    PortAllocation(#[from] PortAllocationError),

    #[error(transparent)]
    RuntimeValue(#[from] RuntimeValueError),

    #[error(transparent)]
    StartupLog(#[from] StartupLogError),

    #[error("cannot resolve target for port mapping '{mapping}': {reason}")]
    Target { mapping: String, reason: String },

    #[error("backend client error")]
    Client(#[source] anyhow::Error),
}

/// Failure of a single container start. Always carries the best-known
/// container snapshot so the caller can release ports and delete partial
/// resources.
#[derive(Debug, Error)]
#[error("container {} failed to start: {error}", container.index())]
pub struct StartFailure {
    pub container: Container,
    #[source]
    pub error: ProvisionError,
}

impl StartFailure {
    #[must_use]
    pub fn new(container: Container, error: impl Into<ProvisionError>) -> Self {
        Self {
            container,
            error: error.into(),
        }
    }
}

/// Failure of a whole-proxy start. Carries the partial proxy and the
/// outcome of tearing it down again.
#[derive(Debug, Error)]
#[error("proxy '{}' failed to start", proxy.id())]
pub struct ProxyStartFailure {
    pub proxy: Proxy,
    #[source]
    pub error: StartFailure,
    /// Set when the partial proxy could not be fully removed.
    pub cleanup: Option<TeardownError>,
}

// ── Teardown errors ───────────────────────────────────────────────────────────

/// Teardown failures. An already-absent object is never an error.
#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("failed to remove {object}")]
    Remove {
        object: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to release ports of proxy '{proxy_id}'")]
    ReleasePorts {
        proxy_id: String,
        #[source]
        source: PortAllocationError,
    },

    #[error("{} of {total} objects could not be removed", failures.len())]
    Partial {
        total: usize,
        failures: Vec<TeardownError>,
    },
}

// ── Config errors ─────────────────────────────────────────────────────────────

/// Configuration faults, fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot load {section} configuration")]
    Load {
        section: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid port range {start}-{end} in {section} configuration")]
    PortRange {
        section: &'static str,
        start: u16,
        end: u16,
    },

    #[error("malformed node selector '{0}': expected key=value[,key=value]*")]
    NodeSelector(String),

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}
