//! Runtime-value emission into backend metadata and recovery out of it.
//!
//! Every backend goes through these functions, so the label, annotation and
//! env-var scheme is defined in exactly one place.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::domain::runtime_value::{KeyFlags, RuntimeValueCatalog, RuntimeValues, keys};
use crate::domain::{AuthenticatedUser, ProxySpec, RuntimeValue, RuntimeValueError};

/// Label selector matching every managed object.
#[must_use]
pub fn managed_selector() -> String {
    format!("{}=true", keys::PROXIED_APP.label_key())
}

/// Label carrying the manifest-group hash of auxiliary manifests.
#[must_use]
pub fn manifest_group_label() -> String {
    format!("{}/sp-manifest-group", crate::domain::runtime_value::LABEL_NAMESPACE)
}

/// Annotation selecting the reconciliation policy of an auxiliary manifest.
#[must_use]
pub fn manifest_policy_annotation() -> String {
    format!("{}/sp-manifest-policy", crate::domain::runtime_value::LABEL_NAMESPACE)
}

// ── Emission ──────────────────────────────────────────────────────────────────

/// `(key, serialized value)` for every catalog key selected by `select`
/// that has a value on the container or the proxy. Container values win.
fn emitted(
    catalog: &RuntimeValueCatalog,
    proxy: &RuntimeValues,
    container: &RuntimeValues,
    select: impl Fn(KeyFlags) -> bool,
) -> Vec<(String, String, String)> {
    catalog
        .keys()
        .filter(|key| select(key.flags()))
        .filter_map(|key| {
            let value = container.get(key).or_else(|_| proxy.get(key)).ok()?;
            Some((key.label_key(), key.env_name(), value.serialize()))
        })
        .collect()
}

/// Labels for orchestrator objects.
#[must_use]
pub fn labels(
    catalog: &RuntimeValueCatalog,
    proxy: &RuntimeValues,
    container: &RuntimeValues,
) -> BTreeMap<String, String> {
    emitted(catalog, proxy, container, |f| f.label)
        .into_iter()
        .map(|(label, _, value)| (label, value))
        .collect()
}

/// Annotations for orchestrator objects.
#[must_use]
pub fn annotations(
    catalog: &RuntimeValueCatalog,
    proxy: &RuntimeValues,
    container: &RuntimeValues,
) -> BTreeMap<String, String> {
    emitted(catalog, proxy, container, |f| f.annotation)
        .into_iter()
        .map(|(label, _, value)| (label, value))
        .collect()
}

/// Engine objects only have labels, so annotation keys become labels too.
#[must_use]
pub fn engine_labels(
    catalog: &RuntimeValueCatalog,
    proxy: &RuntimeValues,
    container: &RuntimeValues,
) -> BTreeMap<String, String> {
    emitted(catalog, proxy, container, |f| f.label || f.annotation)
        .into_iter()
        .map(|(label, _, value)| (label, value))
        .collect()
}

#[must_use]
pub fn env_vars(
    catalog: &RuntimeValueCatalog,
    proxy: &RuntimeValues,
    container: &RuntimeValues,
) -> BTreeMap<String, String> {
    emitted(catalog, proxy, container, |f| f.env_var)
        .into_iter()
        .map(|(_, env, value)| (env, value))
        .collect()
}

/// Declared env first; runtime env vars override on conflict.
#[must_use]
pub fn merge_env(
    declared: &BTreeMap<String, String>,
    runtime: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = declared.clone();
    env.extend(runtime.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// `KEY=value` form used by the engine APIs.
#[must_use]
pub fn env_list(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

/// Declared labels first; emitted runtime labels override on conflict.
#[must_use]
pub fn merge_labels(
    declared: &BTreeMap<String, String>,
    emitted: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels = declared.clone();
    labels.extend(emitted);
    labels
}

// ── Recovery ──────────────────────────────────────────────────────────────────

/// Parse every persisted catalog key present in `metadata`.
///
/// Returns the parsed values and the names of keys whose values did not
/// parse. Unknown metadata entries are ignored.
#[must_use]
pub fn recover_values(
    catalog: &RuntimeValueCatalog,
    metadata: &BTreeMap<String, String>,
) -> (RuntimeValues, Vec<String>) {
    let mut values = RuntimeValues::new();
    let mut malformed = Vec::new();
    for key in catalog.keys().filter(|k| k.is_persisted()) {
        let Some(raw) = metadata.get(&key.label_key()) else {
            continue;
        };
        match RuntimeValue::deserialize(key.clone(), raw) {
            Ok(rv) => values.insert(rv),
            Err(err) => {
                tracing::warn!(key = key.name(), error = %err, "ignoring malformed runtime value");
                malformed.push(key.name().to_string());
            }
        }
    }
    (values, malformed)
}

/// Names of required-for-recovery keys absent from `values`.
#[must_use]
pub fn missing_required(catalog: &RuntimeValueCatalog, values: &RuntimeValues) -> Vec<String> {
    catalog
        .keys()
        .filter(|k| k.flags().required_for_recovery && !values.contains(k))
        .map(|k| k.name().to_string())
        .collect()
}

/// Split recovered values into `(proxy-wide, container-specific)`.
#[must_use]
pub fn split_values(values: &RuntimeValues) -> (RuntimeValues, RuntimeValues) {
    let mut proxy = RuntimeValues::new();
    let mut container = RuntimeValues::new();
    for rv in values.iter() {
        if rv.key().flags().container_specific {
            container.insert(rv.clone());
        } else {
            proxy.insert(rv.clone());
        }
    }
    (proxy, container)
}

// ── Proxy-wide values ─────────────────────────────────────────────────────────

/// Inputs of [`proxy_runtime_values`].
#[derive(Debug, Clone, Copy)]
pub struct ProxyValueInputs<'a> {
    pub proxy_id: &'a str,
    pub spec: &'a ProxySpec,
    pub user: &'a AuthenticatedUser,
    pub deployment_instance_id: &'a str,
    pub realm_id: Option<&'a str>,
    pub created: DateTime<Utc>,
    /// Parameter name → selected value, in declaration order.
    pub parameters: &'a [(String, String)],
    pub http_headers: Option<&'a BTreeMap<String, String>>,
}

/// Build the proxy-wide runtime values for a new proxy.
pub fn proxy_runtime_values(inputs: ProxyValueInputs<'_>) -> Result<RuntimeValues, RuntimeValueError> {
    let mut values = RuntimeValues::new();
    values.set(&keys::CREATED_TIMESTAMP, inputs.created)?;
    values.set(&keys::DEPLOYMENT_INSTANCE_ID, inputs.deployment_instance_id)?;
    if let Some(realm) = inputs.realm_id {
        values.set(&keys::REALM_ID, realm)?;
    }
    values.set(&keys::PROXIED_APP, true)?;
    values.set(&keys::PROXY_ID, inputs.proxy_id)?;
    values.set(&keys::PROXY_SPEC_ID, inputs.spec.id.as_str())?;
    values.set(&keys::USER_ID, inputs.user.id.as_str())?;
    values.set(&keys::USER_GROUPS, inputs.user.groups.clone())?;
    if let Some(name) = &inputs.spec.display_name {
        values.set(&keys::DISPLAY_NAME, name.as_str())?;
    }
    if let Some(timeout) = inputs.spec.heartbeat_timeout {
        values.set(&keys::HEARTBEAT_TIMEOUT, timeout)?;
    }
    if let Some(lifetime) = inputs.spec.max_lifetime {
        values.set(&keys::MAX_LIFETIME, lifetime)?;
    }
    if !inputs.parameters.is_empty() {
        let (names, selected): (Vec<String>, Vec<String>) =
            inputs.parameters.iter().cloned().unzip();
        values.set(&keys::PARAMETER_NAMES, names)?;
        values.set(&keys::PARAMETER_VALUES, selected)?;
    }
    if let Some(headers) = inputs.http_headers {
        let json = serde_json::to_value(headers).map_err(|e| RuntimeValueError::Malformed {
            key: keys::HTTP_HEADERS.name().to_string(),
            raw: String::new(),
            reason: e.to_string(),
        })?;
        values.set(&keys::HTTP_HEADERS, json)?;
    }
    Ok(values)
}

// ── Manifest groups ───────────────────────────────────────────────────────────

/// Encode `bytes` as lowercase hex.
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(char::from(HEX[(b >> 4) as usize]));
        out.push(char::from(HEX[(b & 0xf) as usize]));
    }
    out
}

/// Group tag of the auxiliary manifests of one spec/user pair. 40 hex
/// characters so it fits a label value.
#[must_use]
pub fn manifest_group_hash(spec_id: &str, user_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(user_id.as_bytes());
    let digest = hasher.finalize();
    hex_encode(&digest[..20])
}
