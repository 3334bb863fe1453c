//! Typed runtime metadata.
//!
//! Every value that must survive into the substrate (and come back out during
//! recovery) is a [`RuntimeValue`]: a registered [`RuntimeValueKey`] paired
//! with a type-checked [`Value`]. Emission as labels, annotations or
//! environment variables is driven solely by the key flags.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::domain::error::{CatalogError, RuntimeValueError};

/// Namespace of every label and annotation key.
pub const LABEL_NAMESPACE: &str = "berth.dev";

/// Prefix of every environment variable name.
pub const ENV_PREFIX: &str = "APP_";

const MAX_KEY_NAME_LEN: usize = 50;

// ── Values ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    String,
    Integer,
    Boolean,
    Instant,
    StringList,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Integer(i64),
    Boolean(bool),
    /// Millisecond precision; finer parts are dropped on construction.
    Instant(DateTime<Utc>),
    StringList(Vec<String>),
    Json(serde_json::Value),
}

impl Value {
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::String(_) => ValueKind::String,
            Self::Integer(_) => ValueKind::Integer,
            Self::Boolean(_) => ValueKind::Boolean,
            Self::Instant(_) => ValueKind::Instant,
            Self::StringList(_) => ValueKind::StringList,
            Self::Json(_) => ValueKind::Json,
        }
    }

    /// String form persisted into backend metadata.
    #[must_use]
    pub fn serialize(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::Instant(t) => t.timestamp_millis().to_string(),
            Self::StringList(items) => serde_json::Value::from(items.clone()).to_string(),
            Self::Json(v) => v.to_string(),
        }
    }

    /// Parse the string form produced by [`Value::serialize`].
    ///
    /// # Errors
    ///
    /// Returns the parse failure reason.
    pub fn deserialize(kind: ValueKind, raw: &str) -> Result<Self, String> {
        match kind {
            ValueKind::String => Ok(Self::String(raw.to_string())),
            ValueKind::Integer => raw
                .parse::<i64>()
                .map(Self::Integer)
                .map_err(|e| e.to_string()),
            ValueKind::Boolean => match raw {
                "true" => Ok(Self::Boolean(true)),
                "false" => Ok(Self::Boolean(false)),
                _ => Err("expected 'true' or 'false'".to_string()),
            },
            ValueKind::Instant => {
                let millis = raw.parse::<i64>().map_err(|e| e.to_string())?;
                DateTime::<Utc>::from_timestamp_millis(millis)
                    .map(Self::Instant)
                    .ok_or_else(|| "timestamp out of range".to_string())
            }
            ValueKind::StringList => serde_json::from_str::<Vec<String>>(raw)
                .map(Self::StringList)
                .map_err(|e| e.to_string()),
            ValueKind::Json => serde_json::from_str::<serde_json::Value>(raw)
                .map(Self::Json)
                .map_err(|e| e.to_string()),
        }
    }

    fn normalized(self) -> Self {
        match self {
            Self::Instant(t) => Self::Instant(truncate_to_millis(t)),
            other => other,
        }
    }
}

fn truncate_to_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(t.timestamp_millis()).unwrap_or(t)
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Instant(truncate_to_millis(v))
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Self::StringList(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

/// Typed extraction out of a [`Value`].
pub trait FromValue: Sized {
    const KIND: ValueKind;

    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! impl_from_value {
    ($ty:ty, $kind:ident) => {
        impl FromValue for $ty {
            const KIND: ValueKind = ValueKind::$kind;

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$kind(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

impl_from_value!(String, String);
impl_from_value!(i64, Integer);
impl_from_value!(bool, Boolean);
impl_from_value!(DateTime<Utc>, Instant);
impl_from_value!(Vec<String>, StringList);
impl_from_value!(serde_json::Value, Json);

// ── Keys ──────────────────────────────────────────────────────────────────────

/// Where a key is emitted and how it is treated.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyFlags {
    pub label: bool,
    pub annotation: bool,
    pub env_var: bool,
    pub api: bool,
    pub required_for_recovery: bool,
    pub container_specific: bool,
}

/// Named, typed descriptor of a runtime value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeValueKey {
    name: Cow<'static, str>,
    kind: ValueKind,
    flags: KeyFlags,
}

impl RuntimeValueKey {
    /// A key with no flags set. Chain the flag methods to enable emission.
    #[must_use]
    pub const fn new(name: &'static str, kind: ValueKind) -> Self {
        Self {
            name: Cow::Borrowed(name),
            kind,
            flags: KeyFlags {
                label: false,
                annotation: false,
                env_var: false,
                api: false,
                required_for_recovery: false,
                container_specific: false,
            },
        }
    }

    /// A key whose name is only known at runtime.
    #[must_use]
    pub fn owned(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            kind,
            flags: KeyFlags::default(),
        }
    }

    #[must_use]
    pub const fn label(mut self) -> Self {
        self.flags.label = true;
        self
    }

    #[must_use]
    pub const fn annotation(mut self) -> Self {
        self.flags.annotation = true;
        self
    }

    #[must_use]
    pub const fn env_var(mut self) -> Self {
        self.flags.env_var = true;
        self
    }

    #[must_use]
    pub const fn api(mut self) -> Self {
        self.flags.api = true;
        self
    }

    #[must_use]
    pub const fn required_for_recovery(mut self) -> Self {
        self.flags.required_for_recovery = true;
        self
    }

    #[must_use]
    pub const fn container_specific(mut self) -> Self {
        self.flags.container_specific = true;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    #[must_use]
    pub fn flags(&self) -> KeyFlags {
        self.flags
    }

    /// Label/annotation key: `berth.dev/sp-<name>`.
    #[must_use]
    pub fn label_key(&self) -> String {
        format!("{LABEL_NAMESPACE}/sp-{}", self.name)
    }

    /// Environment variable name: `APP_<NAME>` with `-` mapped to `_`.
    #[must_use]
    pub fn env_name(&self) -> String {
        format!(
            "{ENV_PREFIX}{}",
            self.name.to_ascii_uppercase().replace('-', "_")
        )
    }

    /// Whether the key is written into backend metadata at all.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.flags.label || self.flags.annotation
    }
}

fn validate_key_name(name: &str) -> Result<(), CatalogError> {
    let well_formed = !name.is_empty()
        && name.len() <= MAX_KEY_NAME_LEN
        && name.split('-').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        });
    if well_formed {
        Ok(())
    } else {
        Err(CatalogError::InvalidName(name.to_string()))
    }
}

/// Builtin keys.
pub mod keys {
    use super::{RuntimeValueKey, ValueKind};

    pub const CREATED_TIMESTAMP: RuntimeValueKey =
        RuntimeValueKey::new("created-timestamp", ValueKind::Instant)
            .annotation()
            .api()
            .required_for_recovery();

    pub const DEPLOYMENT_INSTANCE_ID: RuntimeValueKey =
        RuntimeValueKey::new("deployment-instance-id", ValueKind::String)
            .label()
            .env_var()
            .required_for_recovery();

    pub const REALM_ID: RuntimeValueKey = RuntimeValueKey::new("realm-id", ValueKind::String)
        .label()
        .env_var()
        .api();

    /// Marker on every managed object; recovery lists by this label.
    pub const PROXIED_APP: RuntimeValueKey =
        RuntimeValueKey::new("proxied-app", ValueKind::Boolean)
            .label()
            .api()
            .required_for_recovery();

    pub const PROXY_ID: RuntimeValueKey = RuntimeValueKey::new("proxy-id", ValueKind::String)
        .label()
        .env_var()
        .api()
        .required_for_recovery();

    pub const PROXY_SPEC_ID: RuntimeValueKey =
        RuntimeValueKey::new("proxy-spec-id", ValueKind::String)
            .annotation()
            .api()
            .required_for_recovery();

    pub const USER_ID: RuntimeValueKey = RuntimeValueKey::new("user-id", ValueKind::String)
        .annotation()
        .env_var()
        .api()
        .required_for_recovery();

    pub const USER_GROUPS: RuntimeValueKey =
        RuntimeValueKey::new("user-groups", ValueKind::StringList)
            .annotation()
            .env_var()
            .api();

    pub const CONTAINER_INDEX: RuntimeValueKey =
        RuntimeValueKey::new("container-index", ValueKind::Integer)
            .annotation()
            .api()
            .required_for_recovery()
            .container_specific();

    pub const CONTAINER_IMAGE: RuntimeValueKey =
        RuntimeValueKey::new("container-image", ValueKind::String)
            .annotation()
            .required_for_recovery()
            .container_specific();

    /// Backend-native handle, e.g. `namespace/podName` or a service name.
    pub const BACKEND_CONTAINER_NAME: RuntimeValueKey =
        RuntimeValueKey::new("backend-container-name", ValueKind::String)
            .annotation()
            .required_for_recovery()
            .container_specific();

    /// `[{"name", "port", "hostPort", "targetPath"}]`.
    pub const PORT_MAPPINGS: RuntimeValueKey =
        RuntimeValueKey::new("port-mappings", ValueKind::Json)
            .annotation()
            .required_for_recovery()
            .container_specific();

    /// Network address used for internal targets. Never persisted; the
    /// scan repopulates it from the live object.
    pub const CONTAINER_ADDRESS: RuntimeValueKey =
        RuntimeValueKey::new("container-address", ValueKind::String).container_specific();

    /// Non-persistent auxiliary manifests created for the container, as
    /// `apiVersion/kind/namespace/name` strings.
    pub const ADDITIONAL_MANIFESTS: RuntimeValueKey =
        RuntimeValueKey::new("additional-manifests", ValueKind::StringList)
            .annotation()
            .container_specific();

    /// Milliseconds.
    pub const HEARTBEAT_TIMEOUT: RuntimeValueKey =
        RuntimeValueKey::new("heartbeat-timeout", ValueKind::Integer)
            .annotation()
            .env_var()
            .api();

    /// Seconds.
    pub const MAX_LIFETIME: RuntimeValueKey =
        RuntimeValueKey::new("max-lifetime", ValueKind::Integer)
            .annotation()
            .env_var()
            .api();

    pub const DISPLAY_NAME: RuntimeValueKey =
        RuntimeValueKey::new("display-name", ValueKind::String)
            .annotation()
            .env_var()
            .api();

    pub const PARAMETER_NAMES: RuntimeValueKey =
        RuntimeValueKey::new("parameter-names", ValueKind::StringList)
            .annotation()
            .api();

    pub const PARAMETER_VALUES: RuntimeValueKey =
        RuntimeValueKey::new("parameter-values", ValueKind::StringList).annotation();

    pub const HTTP_HEADERS: RuntimeValueKey =
        RuntimeValueKey::new("http-headers", ValueKind::Json).annotation();

    pub const ALL: [RuntimeValueKey; 20] = [
        CREATED_TIMESTAMP,
        DEPLOYMENT_INSTANCE_ID,
        REALM_ID,
        PROXIED_APP,
        PROXY_ID,
        PROXY_SPEC_ID,
        USER_ID,
        USER_GROUPS,
        CONTAINER_INDEX,
        CONTAINER_IMAGE,
        BACKEND_CONTAINER_NAME,
        PORT_MAPPINGS,
        CONTAINER_ADDRESS,
        ADDITIONAL_MANIFESTS,
        HEARTBEAT_TIMEOUT,
        MAX_LIFETIME,
        DISPLAY_NAME,
        PARAMETER_NAMES,
        PARAMETER_VALUES,
        HTTP_HEADERS,
    ];
}

// ── Runtime values ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeValue {
    key: RuntimeValueKey,
    value: Value,
}

impl RuntimeValue {
    /// Pair a key with a value of its declared kind.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeValueError::TypeMismatch`] if the kinds differ.
    pub fn new(key: RuntimeValueKey, value: impl Into<Value>) -> Result<Self, RuntimeValueError> {
        let value = value.into().normalized();
        if value.kind() != key.kind {
            return Err(RuntimeValueError::TypeMismatch {
                key: key.name().to_string(),
                expected: key.kind,
                actual: value.kind(),
            });
        }
        Ok(Self { key, value })
    }

    /// Parse a persisted string back into a value of the key's kind.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeValueError::Malformed`] when the string does not parse.
    pub fn deserialize(key: RuntimeValueKey, raw: &str) -> Result<Self, RuntimeValueError> {
        let value =
            Value::deserialize(key.kind, raw).map_err(|reason| RuntimeValueError::Malformed {
                key: key.name().to_string(),
                raw: raw.to_string(),
                reason,
            })?;
        Ok(Self { key, value })
    }

    #[must_use]
    pub fn key(&self) -> &RuntimeValueKey {
        &self.key
    }

    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    #[must_use]
    pub fn serialize(&self) -> String {
        self.value.serialize()
    }
}

/// Per-entity value store, keyed by key name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeValues {
    values: BTreeMap<String, RuntimeValue>,
}

impl RuntimeValues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value for `rv`'s key.
    pub fn insert(&mut self, rv: RuntimeValue) {
        self.values.insert(rv.key.name().to_string(), rv);
    }

    /// Type-checked insert.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeValueError::TypeMismatch`] if `value` is not of the
    /// key's kind.
    pub fn set(
        &mut self,
        key: &RuntimeValueKey,
        value: impl Into<Value>,
    ) -> Result<(), RuntimeValueError> {
        self.insert(RuntimeValue::new(key.clone(), value)?);
        Ok(())
    }

    pub fn remove(&mut self, key: &RuntimeValueKey) -> Option<RuntimeValue> {
        self.values.remove(key.name())
    }

    /// # Errors
    ///
    /// Returns [`RuntimeValueError::Missing`] if the key is unset.
    pub fn get(&self, key: &RuntimeValueKey) -> Result<&Value, RuntimeValueError> {
        self.values
            .get(key.name())
            .map(|rv| &rv.value)
            .ok_or_else(|| RuntimeValueError::Missing(key.name().to_string()))
    }

    /// # Errors
    ///
    /// Returns [`RuntimeValueError::Missing`] if unset, or
    /// [`RuntimeValueError::TypeMismatch`] if `T` is not the stored kind.
    pub fn get_as<T: FromValue>(&self, key: &RuntimeValueKey) -> Result<T, RuntimeValueError> {
        let value = self.get(key)?;
        T::from_value(value).ok_or_else(|| RuntimeValueError::TypeMismatch {
            key: key.name().to_string(),
            expected: T::KIND,
            actual: value.kind(),
        })
    }

    #[must_use]
    pub fn get_or_none<T: FromValue>(&self, key: &RuntimeValueKey) -> Option<T> {
        self.values
            .get(key.name())
            .and_then(|rv| T::from_value(&rv.value))
    }

    #[must_use]
    pub fn get_or_default<T: FromValue>(&self, key: &RuntimeValueKey, default: T) -> T {
        self.get_or_none(key).unwrap_or(default)
    }

    #[must_use]
    pub fn contains(&self, key: &RuntimeValueKey) -> bool {
        self.values.contains_key(key.name())
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuntimeValue> {
        self.values.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Copy every value of `other` into `self`, replacing on conflict.
    pub fn extend_from(&mut self, other: &RuntimeValues) {
        for rv in other.iter() {
            self.insert(rv.clone());
        }
    }

    /// Values safe to expose to API clients, in string form.
    #[must_use]
    pub fn api_view(&self) -> BTreeMap<String, String> {
        self.values
            .values()
            .filter(|rv| rv.key.flags.api)
            .map(|rv| (rv.key.name().to_string(), rv.serialize()))
            .collect()
    }

    /// Every value in string form, for persistence and replication.
    #[must_use]
    pub fn serialized_view(&self) -> BTreeMap<String, String> {
        self.values
            .values()
            .map(|rv| (rv.key.name().to_string(), rv.serialize()))
            .collect()
    }
}

// ── Catalog ───────────────────────────────────────────────────────────────────

/// Immutable registry of known keys, built once at startup and injected.
#[derive(Debug, Clone)]
pub struct RuntimeValueCatalog {
    keys: Vec<RuntimeValueKey>,
    index: HashMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct CatalogBuilder {
    keys: Vec<RuntimeValueKey>,
    index: HashMap<String, usize>,
}

impl CatalogBuilder {
    /// # Errors
    ///
    /// Returns [`CatalogError::Duplicate`] if a key with the same name is
    /// already registered, or [`CatalogError::InvalidName`] for a malformed
    /// name.
    pub fn register(&mut self, key: RuntimeValueKey) -> Result<&mut Self, CatalogError> {
        validate_key_name(key.name())?;
        if self.index.contains_key(key.name()) {
            return Err(CatalogError::Duplicate(key.name().to_string()));
        }
        self.index.insert(key.name().to_string(), self.keys.len());
        self.keys.push(key);
        Ok(self)
    }

    #[must_use]
    pub fn build(self) -> RuntimeValueCatalog {
        RuntimeValueCatalog {
            keys: self.keys,
            index: self.index,
        }
    }
}

impl RuntimeValueCatalog {
    #[must_use]
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Builder pre-loaded with the builtin keys, for adding custom keys.
    ///
    /// # Errors
    ///
    /// Propagates registration failures.
    pub fn standard_builder() -> Result<CatalogBuilder, CatalogError> {
        let mut builder = Self::builder();
        for key in keys::ALL {
            builder.register(key)?;
        }
        Ok(builder)
    }

    /// Catalog of the builtin keys.
    ///
    /// # Errors
    ///
    /// Propagates registration failures.
    pub fn standard() -> Result<Self, CatalogError> {
        Ok(Self::standard_builder()?.build())
    }

    /// # Errors
    ///
    /// Returns [`CatalogError::NotFound`] if no key has that name.
    pub fn lookup(&self, name: &str) -> Result<&RuntimeValueKey, CatalogError> {
        self.index
            .get(name)
            .map(|&i| &self.keys[i])
            .ok_or_else(|| CatalogError::NotFound(name.to_string()))
    }

    /// Keys in registration order.
    pub fn keys(&self) -> impl Iterator<Item = &RuntimeValueKey> {
        self.keys.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
