//! Declarative app definitions, as produced by the external loader.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::error::SpecError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxySpec {
    pub id: String,

    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub container_specs: Vec<ContainerSpec>,

    /// Milliseconds.
    #[serde(default)]
    pub heartbeat_timeout: Option<i64>,

    /// Seconds.
    #[serde(default)]
    pub max_lifetime: Option<i64>,

    #[serde(default)]
    pub kubernetes: KubernetesSpec,
}

/// Orchestrator-only extensions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KubernetesSpec {
    /// YAML list of RFC 6902 operations applied to the generated pod.
    #[serde(default)]
    pub pod_patches: Option<String>,

    /// YAML manifests created with each proxy and deleted at teardown.
    #[serde(default)]
    pub additional_manifests: Vec<String>,

    /// YAML manifests created with each proxy and kept at teardown.
    #[serde(default)]
    pub additional_persistent_manifests: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContainerSpec {
    pub image: String,

    #[serde(default)]
    pub cmd: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub network: Option<String>,

    /// Extra networks joined after creation.
    #[serde(default)]
    pub network_connections: Vec<String>,

    #[serde(default)]
    pub dns: Vec<String>,

    /// `host:container[:ro|rw]`.
    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(default)]
    pub memory_request: Option<String>,

    #[serde(default)]
    pub memory_limit: Option<String>,

    #[serde(default)]
    pub cpu_request: Option<String>,

    #[serde(default)]
    pub cpu_limit: Option<String>,

    #[serde(default)]
    pub privileged: bool,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub port_mappings: Vec<PortMappingSpec>,

    #[serde(default)]
    pub docker_swarm_secrets: Vec<SwarmSecretSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PortMappingSpec {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub target_path: Option<String>,
}

/// A cluster secret mounted as a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SwarmSecretSpec {
    pub name: String,
    /// File name under `/run/secrets`; defaults to the secret name.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub gid: Option<String>,
    #[serde(default)]
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

// ── Resource parsing ──────────────────────────────────────────────────────────

/// Parse a memory quantity into bytes.
///
/// Accepts raw bytes (`1048576`) and binary suffixes, case-insensitive, with
/// optional `i` or `b`: `512m`, `512Mi`, `2g`, `2GB`, `1Gi`.
pub fn parse_memory(value: &str) -> Result<i64, SpecError> {
    let invalid = || SpecError::InvalidQuantity {
        field: "memory",
        value: value.to_string(),
    };
    let lower = value.trim().to_ascii_lowercase();
    let unit_start = lower
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(lower.len());
    let (digits, unit) = lower.split_at(unit_start);
    let amount: i64 = digits.parse().map_err(|_| invalid())?;
    let magnitude = match unit {
        "" | "b" => "",
        _ if unit.len() == 2 && unit.ends_with(['i', 'b']) => &unit[..1],
        _ if unit.len() == 1 => unit,
        _ => return Err(invalid()),
    };
    let multiplier: i64 = match magnitude {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        _ => return Err(invalid()),
    };
    amount.checked_mul(multiplier).ok_or_else(invalid)
}

/// Parse a CPU quantity into millicores: `2` → 2000, `0.5` → 500,
/// `500m` → 500. At most three decimal places.
pub fn parse_cpu_millis(value: &str) -> Result<i64, SpecError> {
    let invalid = || SpecError::InvalidQuantity {
        field: "cpu",
        value: value.to_string(),
    };
    let trimmed = value.trim();
    if let Some(millis) = trimmed.strip_suffix('m') {
        if millis.is_empty() || !millis.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        return millis.parse().map_err(|_| invalid());
    }
    let (whole, frac) = trimmed.split_once('.').unwrap_or((trimmed, ""));
    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if (whole.is_empty() && frac.is_empty()) || !all_digits(whole) || !all_digits(frac) {
        return Err(invalid());
    }
    if frac.len() > 3 {
        return Err(invalid());
    }
    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let frac_millis: i64 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<3}").parse().map_err(|_| invalid())?
    };
    whole
        .checked_mul(1000)
        .and_then(|w| w.checked_add(frac_millis))
        .ok_or_else(invalid)
}

/// Parse `host:container[:ro|rw]`.
pub fn parse_volume(value: &str) -> Result<VolumeSpec, SpecError> {
    let invalid = || SpecError::InvalidVolume(value.to_string());
    let parts: Vec<&str> = value.split(':').collect();
    let (source, target, read_only) = match parts.as_slice() {
        [source, target] => (*source, *target, false),
        [source, target, "ro"] => (*source, *target, true),
        [source, target, "rw"] => (*source, *target, false),
        _ => return Err(invalid()),
    };
    if source.is_empty() || target.is_empty() {
        return Err(invalid());
    }
    Ok(VolumeSpec {
        source: source.to_string(),
        target: target.to_string(),
        read_only,
    })
}
